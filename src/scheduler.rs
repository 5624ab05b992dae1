//! The sample-accurate mixing scheduler: a composite [`Source`] that mixes
//! time-positioned children, runs timed callbacks, and applies a single
//! piecewise-linear volume ramp.
//!
//! A `Scheduler` is a cheaply-cloneable handle (an `Arc<Mutex<..>>` around
//! its queues) rather than a tree node owned outright by its parent. This is
//! what lets program logic (`Radio`) hold its own handle to a sub-scheduler
//! (`music`, `talk`) for scheduling purposes while the *same* sub-scheduler
//! also lives in its parent's `active` list and gets pulled every block.
//! Only one of those handles -- the one the parent actually calls `fill()`
//! on -- owns a mixing buffer; scheduling-only handles never allocate one.

use std::io;
use std::sync::{Arc, Mutex};

use crate::source::{InterleavedBuffer, Source};

/// A callback scheduled to run at a specific frame, with the scheduler
/// handle it was registered on.
pub type Callback = Box<dyn FnMut(&Scheduler) + Send>;

#[derive(Clone, Copy, Debug)]
struct VolumeRamp {
    start_frame: i64,
    end_frame: i64,
    start_vol: f32,
    end_vol: f32,
}

impl VolumeRamp {
    fn flat(vol: f32) -> Self {
        Self {
            start_frame: 0,
            end_frame: 0,
            start_vol: vol,
            end_vol: vol,
        }
    }

    fn value_at(&self, frame: i64) -> f32 {
        if frame <= self.start_frame {
            self.start_vol
        } else if frame >= self.end_frame {
            self.end_vol
        } else {
            let span = (self.end_frame - self.start_frame) as f32;
            let t = (frame - self.start_frame) as f32 / span;
            self.start_vol + (self.end_vol - self.start_vol) * t
        }
    }

    /// Shift the ramp's reference frame back by `by` frames, as a block
    /// boundary passes.
    fn advance(&mut self, by: i64) {
        self.start_frame -= by;
        self.end_frame -= by;
    }
}

struct PendingSource {
    start: i64,
    source: Box<dyn Source>,
}

struct PendingCallback {
    start: i64,
    callback: Callback,
}

struct ActiveChild {
    source: Box<dyn Source>,
    is_subscheduler: bool,
}

struct Inner {
    samplerate: u32,
    channels: usize,
    pending_sources: Vec<PendingSource>,
    callbacks: Vec<PendingCallback>,
    active: Vec<ActiveChild>,
    frame_offset: i64,
    volume_ramp: VolumeRamp,
    allocated_frames: usize,
}

/// A composite, pull-based mixing node. See the module docs for why this is
/// a cheap, `Clone`-able handle rather than a plain owned tree node.
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    samplerate: u32,
    channels: usize,
    output: InterleavedBuffer,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            samplerate: self.samplerate,
            channels: self.channels,
            output: InterleavedBuffer::new(self.channels),
        }
    }
}

impl Scheduler {
    pub fn new(samplerate: u32, channels: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                samplerate,
                channels,
                pending_sources: Vec::new(),
                callbacks: Vec::new(),
                active: Vec::new(),
                frame_offset: 0,
                volume_ramp: VolumeRamp::flat(1.0),
                allocated_frames: 0,
            })),
            samplerate,
            channels,
            output: InterleavedBuffer::new(channels),
        }
    }

    fn to_frame(&self, inner: &Inner, seconds: f64) -> i64 {
        (inner.samplerate as f64 * seconds).round() as i64 + inner.frame_offset
    }

    /// Create a child scheduler sharing this scheduler's rate/channels,
    /// immediately active. Per spec.md §4.2, a sub-scheduler that emits zero
    /// frames on some tick is never removed from its parent.
    pub fn subscheduler(&self) -> Scheduler {
        let mut child = Scheduler::new(self.samplerate, self.channels);

        let allocated = self.inner.lock().unwrap().allocated_frames;
        if allocated > 0 {
            child.allocate(allocated);
        }

        self.inner.lock().unwrap().active.push(ActiveChild {
            source: Box::new(child.clone()),
            is_subscheduler: true,
        });

        child
    }

    /// Schedule `child` to start at `start_seconds` (relative to this
    /// scheduler's clock, stamped by the current `frame_offset` if called
    /// from within a callback). Returns the child's playback duration in
    /// seconds, if known.
    pub fn add_source(&self, start_seconds: f64, mut child: Box<dyn Source>) -> Option<f64> {
        let (startframe, samplerate, allocated) = {
            let inner = self.inner.lock().unwrap();
            let mut sf = self.to_frame(&inner, start_seconds);
            if sf < 0 {
                sf = 0;
            }
            (sf, inner.samplerate, inner.allocated_frames)
        };

        if allocated > 0 {
            child.allocate(allocated);
        }

        let duration = child
            .size()
            .map(|frames| frames as f64 / samplerate as f64);

        self.inner
            .lock()
            .unwrap()
            .pending_sources
            .push(PendingSource {
                start: startframe,
                source: child,
            });

        duration
    }

    /// Schedule `callback` to run at `start_seconds`. The callback is
    /// invoked with `frame_offset` set to its exact in-block frame, so any
    /// scheduling it performs is itself frame-accurate.
    pub fn add_callback(&self, start_seconds: f64, callback: Callback) {
        let mut inner = self.inner.lock().unwrap();
        let mut sf = self.to_frame(&inner, start_seconds);
        if sf < 0 {
            sf = 0;
        }
        inner.callbacks.push(PendingCallback {
            start: sf,
            callback,
        });
    }

    /// Read the instantaneous volume at `t_seconds`, with no side effects.
    /// Safe to call at any time, not only from within a callback.
    pub fn get_volume(&self, t_seconds: f64) -> f32 {
        let inner = self.inner.lock().unwrap();
        let frame = self.to_frame(&inner, t_seconds);
        inner.volume_ramp.value_at(frame)
    }

    /// Replace the current volume ramp with a new one starting from the
    /// *current instantaneous volume* at `start_seconds`, ramping linearly
    /// to `target` over `duration_seconds`. Only one ramp exists at a time;
    /// callers are expected to serialize calls to this method.
    pub fn set_volume(&self, start_seconds: f64, target: f32, duration_seconds: f64) {
        let mut inner = self.inner.lock().unwrap();
        // unlike add_source/add_callback, a negative start here is meaningful
        // (the ramp already began before the current block) and is not
        // clamped to zero.
        let start_frame = self.to_frame(&inner, start_seconds);
        let start_vol = inner.volume_ramp.value_at(start_frame);
        let mut end_frame = start_frame + (inner.samplerate as f64 * duration_seconds).round() as i64;
        if end_frame == start_frame {
            end_frame = start_frame + 1;
        }
        inner.volume_ramp = VolumeRamp {
            start_frame,
            end_frame,
            start_vol,
            end_vol: target,
        };
    }
}

impl Source for Scheduler {
    fn samplerate(&self) -> u32 {
        self.samplerate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn size(&self) -> Option<u64> {
        None
    }

    fn allocate(&mut self, frames: usize) {
        self.output.allocate(frames);
        let mut inner = self.inner.lock().unwrap();
        inner.allocated_frames = frames;
        for pending in inner.pending_sources.iter_mut() {
            pending.source.allocate(frames);
        }
        for active in inner.active.iter_mut() {
            active.source.allocate(frames);
        }
    }

    fn fill(&mut self, max: Option<usize>) -> &[f32] {
        let max = max.unwrap_or_else(|| self.output.capacity_frames());
        let channels = self.channels;

        {
            let inner = self.inner.lock().unwrap();
            if inner.active.is_empty() && inner.pending_sources.is_empty() && inner.callbacks.is_empty() {
                return self.output.prefix(0);
            }
        }

        self.output.zero(max);

        // 2. run due callbacks; re-scan after each so callbacks that
        // schedule further immediately-due callbacks are still honored
        // within this same block.
        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();
                let idx = inner
                    .callbacks
                    .iter()
                    .position(|c| c.start < max as i64);
                idx.map(|i| inner.callbacks.remove(i))
            };
            let PendingCallback { start, mut callback } = match due {
                Some(due) => due,
                None => break,
            };
            {
                let mut inner = self.inner.lock().unwrap();
                inner.frame_offset = start;
            }
            callback(self);
            {
                let mut inner = self.inner.lock().unwrap();
                inner.frame_offset = 0;
            }
        }
        {
            let mut inner = self.inner.lock().unwrap();
            for c in inner.callbacks.iter_mut() {
                c.start -= max as i64;
            }
        }

        // 3. mix currently active children
        let mut active = std::mem::take(&mut self.inner.lock().unwrap().active);
        let mut keep = Vec::with_capacity(active.len());
        let mut produced_any = false;
        for mut child in active.drain(..) {
            let (ended, produced) = mix_into(&mut self.output, child.source.as_mut(), 0, max, channels);
            produced_any |= produced;
            if child.is_subscheduler || !ended {
                keep.push(child);
            }
        }

        // 4. activate pending sources whose start has arrived
        let pending = std::mem::take(&mut self.inner.lock().unwrap().pending_sources);
        let mut still_pending = Vec::with_capacity(pending.len());
        for mut p in pending {
            if p.start < max as i64 {
                let start_offset = p.start.max(0) as usize;
                let (ended, produced) =
                    mix_into(&mut self.output, p.source.as_mut(), start_offset, max, channels);
                produced_any |= produced;
                if produced && !ended {
                    keep.push(ActiveChild {
                        source: p.source,
                        is_subscheduler: false,
                    });
                }
            } else {
                p.start -= max as i64;
                still_pending.push(p);
            }
        }

        // a subscheduler's own `fill` is all-or-nothing (it returns exactly
        // `max` frames or exactly zero, see the early-return above), so
        // `produced_any` already reflects whether every subscheduler in
        // `keep` ended this tick alongside every leaf.
        let leaves_active = keep.iter().any(|c| !c.is_subscheduler);
        let pending_empty = still_pending.is_empty();

        let callbacks_empty;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.active = keep;
            inner.pending_sources = still_pending;
            callbacks_empty = inner.callbacks.is_empty();
        }

        // per spec.md §4.2/§8 scenario 5: once nothing produced so much as a
        // sample this tick and nothing active, pending or callback-shaped
        // remains, the block is over -- zero-length, not just zeroed, so a
        // sink loop driven by `fill` can actually exit.
        if !produced_any && !leaves_active && pending_empty && callbacks_empty {
            return self.output.prefix(0);
        }

        // 5. apply the volume ramp
        {
            let mut inner = self.inner.lock().unwrap();
            let ramp = inner.volume_ramp;
            let out = self.output.as_mut_slice();
            for f in 0..max {
                let gain = ramp.value_at(f as i64);
                for c in 0..channels {
                    out[f * channels + c] *= gain;
                }
            }
            inner.volume_ramp.advance(max as i64);
        }

        self.output.prefix(max)
    }

    fn seek(&mut self, _frame: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "schedulers do not support seeking",
        ))
    }
}

/// Repeatedly pull `src` to fill `output[offset..max]`, adding into whatever
/// is already there. Returns `(ended, produced_any)`: `ended` is true iff a
/// `fill` call returned zero frames before `max` was reached (end of
/// stream); `produced_any` is true iff at least one frame was mixed in.
fn mix_into(
    output: &mut InterleavedBuffer,
    src: &mut dyn Source,
    offset: usize,
    max: usize,
    channels: usize,
) -> (bool, bool) {
    let mut offset = offset;
    let mut produced_any = false;
    let mut ended = false;

    while offset < max {
        let filled = src.fill(Some(max - offset));
        let filled_frames = if channels == 0 { 0 } else { filled.len() / channels };
        if filled_frames == 0 {
            ended = true;
            break;
        }
        produced_any = true;
        let dst = &mut output.as_mut_slice()[offset * channels..(offset + filled_frames) * channels];
        for (d, s) in dst.iter_mut().zip(filled.iter()) {
            *d += s;
        }
        offset += filled_frames;
    }

    (ended, produced_any)
}
