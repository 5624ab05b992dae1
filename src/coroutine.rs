//! Adapts a stepwise, blocking radio-program body into [`Scheduler`]
//! callbacks.
//!
//! Rust has no stable stackful generators, so the body runs on its own
//! thread and "yields" by rendezvousing on a pair of zero-capacity channels
//! with the scheduler-driving side. Only one side is ever actually running
//! at a time -- this is a coroutine, not a worker pool -- the body blocks on
//! [`Waiter::wait`] until the driver wakes it from inside a scheduler
//! callback, with `frame_offset` set to the exact frame the wait ended on.
//! Everything the body does between two `wait` calls, including any
//! `add_source`/`add_callback`/`set_volume` it issues, is therefore
//! frame-accurate.

use crossbeam_channel::{Receiver, Sender};

use crate::scheduler::Scheduler;

/// Handed to a coroutine body so it can suspend itself until a point in the
/// future, in scheduler time.
pub struct Waiter {
    resume: Receiver<()>,
    yielded: Sender<Option<f64>>,
}

impl Waiter {
    /// Suspend the calling (body) thread until `seconds` have passed on the
    /// driving scheduler's clock, then return. Must only be called from the
    /// coroutine body thread.
    pub fn wait(&self, seconds: f64) {
        let _ = self.yielded.send(Some(seconds));
        let _ = self.resume.recv();
    }
}

/// Run `body` as a coroutine driven by `scheduler`. `body` runs on a new
/// thread and is expected to call [`Waiter::wait`] wherever the program
/// needs to pause before scheduling its next segment.
///
/// This call itself blocks until `body`'s first `wait()` (or its return),
/// mirroring the way registering the adapter immediately pulls the first
/// delay.
pub fn spawn(scheduler: &Scheduler, body: impl FnOnce(&Waiter) + Send + 'static) {
    let (resume_tx, resume_rx) = crossbeam_channel::bounded::<()>(0);
    let (yield_tx, yield_rx) = crossbeam_channel::bounded::<Option<f64>>(0);

    std::thread::Builder::new()
        .name("radio-program".into())
        .spawn(move || {
            let waiter = Waiter {
                resume: resume_rx,
                yielded: yield_tx.clone(),
            };
            body(&waiter);
            let _ = yield_tx.send(None);
        })
        .expect("failed to spawn radio program thread");

    drive(scheduler.clone(), resume_tx, yield_rx);
}

fn drive(scheduler: Scheduler, resume_tx: Sender<()>, yield_rx: Receiver<Option<f64>>) {
    match yield_rx.recv() {
        Ok(Some(delay)) => {
            scheduler.add_callback(
                delay,
                Box::new(move |this: &Scheduler| {
                    let _ = resume_tx.send(());
                    drive(this.clone(), resume_tx.clone(), yield_rx.clone());
                }),
            );
        }
        Ok(None) | Err(_) => {
            // the program body returned (or panicked); nothing left to drive
        }
    }
}
