//! Loudness measurement and normalization (ITU-R BS.1770).
//!
//! Measurement runs once, in the background, starting at construction; the
//! first call to [`Source::allocate`] or [`Source::fill`] blocks until it
//! completes. This matches spec.md §5: "the main thread joins the worker on
//! first `allocate`/`fill` of that source -- the join is the only blocking
//! wait." The inner source is handed to the worker entirely (it is not
//! touched by the foreground until the worker hands it back), so no locking
//! is needed: ownership, not a mutex, is the synchronization mechanism.

use std::io;

use crossbeam_channel::Receiver;
use ebur128::{EbuR128, Mode};

use crate::source::{InterleavedBuffer, Source};

const MEASURE_CHUNK_FRAMES: usize = 4096;

/// Wraps an inner source, reading it fully in the background to measure
/// integrated loudness, then scaling every subsequent block so the output
/// matches `target_lufs`.
pub struct Normalize {
    state: State,
    target_lufs: f64,
    samplerate: u32,
    channels: usize,
    size: Option<u64>,
    buffer: InterleavedBuffer,
}

enum State {
    Measuring(Receiver<(Box<dyn Source>, f64)>),
    Ready { inner: Box<dyn Source>, gain: f32 },
}

impl Normalize {
    pub fn new(mut inner: Box<dyn Source>, target_lufs: f64) -> Self {
        let samplerate = inner.samplerate();
        let channels = inner.channels();
        let size = inner.size();

        let (tx, rx) = crossbeam_channel::bounded(1);
        rayon::spawn(move || {
            let measured = measure_and_rewind(inner.as_mut(), channels, samplerate);
            // the receiver is only ever dropped if this Normalize itself was
            // dropped before being used; nothing to do in that case.
            let _ = tx.send((inner, measured));
        });

        Self {
            state: State::Measuring(rx),
            target_lufs,
            samplerate,
            channels,
            size,
            buffer: InterleavedBuffer::new(channels),
        }
    }

    /// Block on the measurement if it hasn't resolved yet, and return the
    /// gain to apply to every subsequent sample.
    fn ensure_ready(&mut self) -> f32 {
        if let State::Measuring(rx) = &self.state {
            let (inner, measured) = rx.recv().expect("loudness measurement worker panicked");
            let measured = if measured.is_finite() {
                measured
            } else {
                self.target_lufs
            };
            let gain = 10f64.powf((self.target_lufs - measured) / 20.0) as f32;
            self.state = State::Ready { inner, gain };
        }
        match &self.state {
            State::Ready { gain, .. } => *gain,
            State::Measuring(_) => unreachable!("resolved above"),
        }
    }
}

/// Read `src` to completion through a scratch buffer, feeding every frame to
/// an ITU-R BS.1770 gated-loudness accumulator, then seek back to the start.
fn measure_and_rewind(src: &mut dyn Source, channels: usize, samplerate: u32) -> f64 {
    let mut state = match EbuR128::new(channels as u32, samplerate, Mode::I) {
        Ok(s) => s,
        Err(_) => return f64::NAN,
    };

    src.allocate(MEASURE_CHUNK_FRAMES);
    loop {
        let filled = src.fill(Some(MEASURE_CHUNK_FRAMES));
        if filled.is_empty() {
            break;
        }
        if state.add_frames_f32(filled).is_err() {
            return f64::NAN;
        }
    }

    let _ = src.seek(0);
    state.loudness_global().unwrap_or(f64::NAN)
}

/// Measure the integrated loudness (ITU-R BS.1770, gated mean) of an
/// already-decoded, fully in-memory interleaved buffer. Exposed for tests
/// and for callers that already hold the whole signal in memory.
pub fn measure_interleaved(samples: &[f32], channels: usize, samplerate: u32) -> f64 {
    let mut state = match EbuR128::new(channels as u32, samplerate, Mode::I) {
        Ok(s) => s,
        Err(_) => return f64::NAN,
    };
    if state.add_frames_f32(samples).is_err() {
        return f64::NAN;
    }
    state.loudness_global().unwrap_or(f64::NAN)
}

impl Source for Normalize {
    fn samplerate(&self) -> u32 {
        self.samplerate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn allocate(&mut self, frames: usize) {
        self.ensure_ready();
        self.buffer.allocate(frames);
        match &mut self.state {
            State::Ready { inner, .. } => inner.allocate(frames),
            State::Measuring(_) => unreachable!("ensure_ready resolved this"),
        }
    }

    fn fill(&mut self, max: Option<usize>) -> &[f32] {
        let gain = self.ensure_ready();
        let cap = self.buffer.capacity_frames();
        let max = max.unwrap_or(cap).min(cap);
        let channels = self.channels;

        let filled = match &mut self.state {
            State::Ready { inner, .. } => inner.fill(Some(max)),
            State::Measuring(_) => unreachable!("ensure_ready resolved this"),
        };
        let filled_frames = if channels == 0 { 0 } else { filled.len() / channels };

        let out = self.buffer.as_mut_slice();
        for (dst, src) in out[..filled.len()].iter_mut().zip(filled.iter()) {
            *dst = src * gain;
        }

        self.buffer.prefix(filled_frames)
    }

    fn seek(&mut self, frame: u64) -> io::Result<()> {
        self.ensure_ready();
        match &mut self.state {
            State::Ready { inner, .. } => inner.seek(frame),
            State::Measuring(_) => unreachable!("ensure_ready resolved this"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_tone_measurement_is_finite() {
        let sr = 48_000u32;
        let freq = 1000.0f64;
        let n = sr as usize * 2;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                let t = i as f64 / sr as f64;
                ((2.0 * std::f64::consts::PI * freq * t).sin() * 0.707) as f32
            })
            .collect();
        assert!(measure_interleaved(&samples, 1, sr).is_finite());
    }

    /// `Normalize`'s gain is `10^((target - measured) / 20)`; since
    /// integrated loudness is additive in dB under a constant linear gain,
    /// applying that gain and re-measuring should land almost exactly on
    /// `target` -- this is the invariant spec.md §8 calls out
    /// ("within ±0.5 LUFS of target"), exercised directly rather than via
    /// the background-thread plumbing.
    #[test]
    fn applying_the_computed_gain_hits_the_target_within_half_a_lufs() {
        let sr = 48_000u32;
        let freq = 1000.0f64;
        let n = sr as usize * 2;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                let t = i as f64 / sr as f64;
                ((2.0 * std::f64::consts::PI * freq * t).sin() * 0.3) as f32
            })
            .collect();

        let target = -16.0;
        let measured = measure_interleaved(&samples, 1, sr);
        assert!(measured.is_finite());

        let gain = 10f64.powf((target - measured) / 20.0) as f32;
        let adjusted: Vec<f32> = samples.iter().map(|&s| s * gain).collect();
        let after = measure_interleaved(&adjusted, 1, sr);

        assert!((after - target).abs() < 0.5);
    }
}
