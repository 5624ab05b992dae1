//! Sample-rate conversion and channel remixing.
//!
//! [`Resample`] delegates to `rubato` for the actual interpolation.
//! [`Remix`] implements the small, fixed set of channel-mix matrices from
//! spec.md §4.1 (stereo<->mono, 5.1<->stereo, ATSC A/52 coefficients),
//! including upmixing via the Moore-Penrose pseudo-inverse of the
//! corresponding downmix.

use std::io;

use lazy_static::lazy_static;
use rubato::{InterpolationParameters, InterpolationType, Resampler as _, SincFixedIn, WindowFunction};

use crate::error::ChannelMixError;
use crate::source::{InterleavedBuffer, Source};

/// A row-major matrix: `rows` new channels x `cols` old channels.
pub type Matrix = Vec<Vec<f32>>;

fn identity(n: usize) -> Matrix {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
    let rows = a.len();
    let inner = b.len();
    let cols = b[0].len();
    let mut out = vec![vec![0.0f32; cols]; rows];
    for i in 0..rows {
        for k in 0..inner {
            let aik = a[i][k];
            if aik == 0.0 {
                continue;
            }
            for j in 0..cols {
                out[i][j] += aik * b[k][j];
            }
        }
    }
    out
}

fn transpose(a: &Matrix) -> Matrix {
    let rows = a.len();
    let cols = a[0].len();
    let mut out = vec![vec![0.0f32; rows]; cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j][i] = a[i][j];
        }
    }
    out
}

/// Gauss-Jordan inverse of a small square matrix.
fn invert_square(a: &Matrix) -> Option<Matrix> {
    let n = a.len();
    let mut aug: Vec<Vec<f32>> = a
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut r = row.clone();
            r.extend((0..n).map(|j| if i == j { 1.0 } else { 0.0 }));
            r
        })
        .collect();

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&a, &b| {
            aug[a][col]
                .abs()
                .partial_cmp(&aug[b][col].abs())
                .unwrap()
        })?;
        if aug[pivot_row][col].abs() < 1e-9 {
            return None;
        }
        aug.swap(col, pivot_row);

        let pivot = aug[col][col];
        for v in aug[col].iter_mut() {
            *v /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[row][col];
            if factor == 0.0 {
                continue;
            }
            for c in 0..2 * n {
                aug[row][c] -= factor * aug[col][c];
            }
        }
    }

    Some(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}

/// Moore-Penrose pseudo-inverse of a full-row-rank `m x n` matrix (`m <= n`),
/// via the normal-equation form `pinv(A) = A^T (A A^T)^-1`.
fn pseudo_inverse(a: &Matrix) -> Matrix {
    let at = transpose(a);
    let aat = matmul(a, &at);
    let aat_inv = invert_square(&aat).expect("downmix matrix is not full row rank");
    matmul(&at, &aat_inv)
}

lazy_static! {
    static ref STEREO_TO_MONO: Matrix = vec![vec![0.5, 0.5]];

    // ATSC A/52 5.1 -> stereo downmix coefficients.
    // channel order: L, R, C, LFE, Ls, Rs. LFE is dropped.
    static ref SURROUND_5_1_TO_STEREO: Matrix = vec![
        vec![1.0, 0.0, 0.707, 0.0, 0.707, 0.0],
        vec![0.0, 1.0, 0.707, 0.0, 0.0, 0.707],
    ];

    static ref SURROUND_5_1_TO_MONO: Matrix =
        matmul(&STEREO_TO_MONO, &SURROUND_5_1_TO_STEREO);
}

fn downmix_table(lo: usize, hi: usize) -> Option<Matrix> {
    match (lo, hi) {
        (1, 2) => Some(STEREO_TO_MONO.clone()),
        (2, 6) => Some(SURROUND_5_1_TO_STEREO.clone()),
        (1, 6) => Some(SURROUND_5_1_TO_MONO.clone()),
        _ => None,
    }
}

/// Resolve the mix matrix (`new_channels x old_channels`) between two
/// channel counts, upmixing via pseudo-inverse when `new_channels >
/// old_channels`. `normalize` scales rows down so the worst-case output
/// stays within `[-1, 1]`.
pub fn find_mix(
    new_channels: usize,
    old_channels: usize,
    normalize: bool,
) -> Result<Matrix, ChannelMixError> {
    if new_channels == old_channels {
        return Ok(identity(new_channels));
    }

    let lo = new_channels.min(old_channels);
    let hi = new_channels.max(old_channels);
    let mut mix = downmix_table(lo, hi).ok_or(ChannelMixError {
        from: old_channels,
        to: new_channels,
    })?;

    if new_channels > old_channels {
        mix = pseudo_inverse(&mix);
    }

    if normalize {
        let worst_case = mix
            .iter()
            .map(|row| row.iter().map(|v| v.abs()).sum::<f32>())
            .fold(0.0f32, f32::max);
        if worst_case > 0.0 {
            for row in mix.iter_mut() {
                for v in row.iter_mut() {
                    *v /= worst_case;
                }
            }
        }
    }

    Ok(mix)
}

/// A source whose channels have been linearly remixed (up or down) from an
/// inner source.
pub struct Remix {
    inner: Box<dyn Source>,
    mix: Matrix,
    channels: usize,
    size: Option<u64>,
    buffer: InterleavedBuffer,
}

impl Remix {
    fn build(
        inner: Box<dyn Source>,
        target_channels: usize,
        normalize: bool,
    ) -> Result<Box<dyn Source>, ChannelMixError> {
        let mix = find_mix(target_channels, inner.channels(), normalize)?;
        let size = inner.size();
        Ok(Box::new(Self {
            channels: target_channels,
            size,
            mix,
            buffer: InterleavedBuffer::new(target_channels),
            inner,
        }))
    }

    /// Downmix `inner` (which must have more channels than `target_channels`)
    /// using the fixed downmix table.
    pub fn downmix(
        inner: Box<dyn Source>,
        target_channels: usize,
    ) -> Result<Box<dyn Source>, ChannelMixError> {
        Self::build(inner, target_channels, false)
    }

    /// Upmix `inner` (which must have fewer channels than `target_channels`)
    /// via the pseudo-inverse of the corresponding downmix.
    pub fn upmix(
        inner: Box<dyn Source>,
        target_channels: usize,
    ) -> Result<Box<dyn Source>, ChannelMixError> {
        Self::build(inner, target_channels, false)
    }
}

impl Source for Remix {
    fn samplerate(&self) -> u32 {
        self.inner.samplerate()
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn allocate(&mut self, frames: usize) {
        self.inner.allocate(frames);
        self.buffer.allocate(frames);
    }

    fn fill(&mut self, max: Option<usize>) -> &[f32] {
        let cap = self.buffer.capacity_frames();
        let max = max.unwrap_or(cap).min(cap);
        let old_ch = self.mix[0].len();
        let new_ch = self.mix.len();

        let filled = self.inner.fill(Some(max));
        let filled_frames = if old_ch == 0 { 0 } else { filled.len() / old_ch };

        let out = self.buffer.as_mut_slice();
        for f in 0..filled_frames {
            for nc in 0..new_ch {
                let mut acc = 0.0f32;
                for oc in 0..old_ch {
                    acc += self.mix[nc][oc] * filled[f * old_ch + oc];
                }
                out[f * new_ch + nc] = acc;
            }
        }

        self.buffer.prefix(filled_frames)
    }

    fn seek(&mut self, frame: u64) -> io::Result<()> {
        self.inner.seek(frame)
    }
}

/// Sample-rate conversion, backed by `rubato`'s windowed-sinc resampler.
pub struct Resample {
    inner: Box<dyn Source>,
    samplerate: u32,
    channels: usize,
    size: Option<u64>,
    resampler: SincFixedIn<f32>,
    pending_out: Vec<Vec<f32>>,
    pending_pos: usize,
    eof: bool,
    buffer: InterleavedBuffer,
}

const RESAMPLE_CHUNK_FRAMES: usize = 1024;

impl Resample {
    pub fn new(inner: Box<dyn Source>, new_rate: u32) -> Self {
        let channels = inner.channels();
        let ratio = new_rate as f64 / inner.samplerate() as f64;
        let size = inner
            .size()
            .map(|n| (n as f64 * ratio).ceil() as u64);

        let params = InterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.925,
            interpolation: InterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK_FRAMES, channels)
            .expect("resampler construction with a fixed, validated ratio cannot fail");

        Self {
            inner,
            samplerate: new_rate,
            channels,
            size,
            resampler,
            pending_out: vec![Vec::new(); channels],
            pending_pos: 0,
            eof: false,
            buffer: InterleavedBuffer::new(channels),
        }
    }

    fn pending_remaining(&self) -> usize {
        self.pending_out
            .get(0)
            .map(|c| c.len().saturating_sub(self.pending_pos))
            .unwrap_or(0)
    }

    /// Pull one chunk of input from `inner`, deinterleave it, and run it
    /// through the resampler, refilling `pending_out`.
    fn advance(&mut self) {
        if self.eof {
            return;
        }

        let need = self.resampler.input_frames_next();
        let filled = self.inner.fill(Some(need));
        let got = filled.len() / self.channels;

        let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(got); self.channels];
        for f in 0..got {
            for c in 0..self.channels {
                planar[c].push(filled[f * self.channels + c]);
            }
        }

        let produced = if got == 0 {
            self.eof = true;
            self.resampler
                .process_partial(None::<&[Vec<f32>]>, None)
                .unwrap_or_default()
        } else if got < need {
            self.eof = true;
            self.resampler
                .process_partial(Some(&planar), None)
                .unwrap_or_default()
        } else {
            self.resampler.process(&planar, None).unwrap_or_default()
        };

        self.pending_out = produced;
        self.pending_pos = 0;
    }
}

impl Source for Resample {
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
        let inner_rate = self.inner.samplerate() as u64;
        let inner_frames = (frames as u64 * inner_rate / self.samplerate as u64) as usize;
        self.inner.allocate(inner_frames.max(RESAMPLE_CHUNK_FRAMES));
        self.buffer.allocate(frames);
    }

    fn fill(&mut self, max: Option<usize>) -> &[f32] {
        let cap = self.buffer.capacity_frames();
        let max = max.unwrap_or(cap).min(cap);

        let mut produced = 0usize;
        while produced < max {
            if self.pending_remaining() == 0 {
                if self.eof {
                    break;
                }
                self.advance();
                if self.pending_remaining() == 0 {
                    break;
                }
            }

            let take = self.pending_remaining().min(max - produced);
            {
                let out = self.buffer.as_mut_slice();
                for f in 0..take {
                    for c in 0..self.channels {
                        out[(produced + f) * self.channels + c] =
                            self.pending_out[c][self.pending_pos + f];
                    }
                }
            }
            self.pending_pos += take;
            produced += take;
        }

        self.buffer.prefix(produced)
    }

    fn seek(&mut self, frame: u64) -> io::Result<()> {
        let inner_rate = self.inner.samplerate() as u64;
        let inner_frame = frame * inner_rate / self.samplerate as u64;
        self.pending_out.iter_mut().for_each(Vec::clear);
        self.pending_pos = 0;
        self.eof = false;
        self.inner.seek(inner_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mix_is_passthrough() {
        let mix = find_mix(2, 2, false).unwrap();
        assert_eq!(mix, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn stereo_to_mono_is_average() {
        let mix = find_mix(1, 2, false).unwrap();
        assert_eq!(mix, vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn unsupported_mix_is_an_error() {
        let err = find_mix(2, 3, false).unwrap_err();
        assert_eq!(err.from, 3);
        assert_eq!(err.to, 2);
    }

    #[test]
    fn upmix_roundtrips_approximately() {
        let down = find_mix(1, 2, false).unwrap();
        let up = find_mix(2, 1, false).unwrap();
        // (down . up) applied to a mono signal should approximate identity
        // on that one channel's energy.
        let roundtrip = matmul(&down, &up);
        assert!((roundtrip[0][0] - 1.0).abs() < 1e-4);
    }

    /// An in-memory mono 440Hz tone, standing in for a `FileSource` so the
    /// reformat round-trip below doesn't need a file on disk.
    struct ToneSource {
        samplerate: u32,
        samples: Vec<f32>,
        pos: usize,
        buffer: InterleavedBuffer,
    }

    impl ToneSource {
        fn new(samplerate: u32, frames: usize) -> Self {
            let samples = (0..frames)
                .map(|i| {
                    let t = i as f64 / samplerate as f64;
                    (2.0 * std::f64::consts::PI * 440.0 * t).sin() as f32 * 0.3
                })
                .collect();
            Self {
                samplerate,
                samples,
                pos: 0,
                buffer: InterleavedBuffer::new(1),
            }
        }
    }

    impl Source for ToneSource {
        fn samplerate(&self) -> u32 {
            self.samplerate
        }
        fn channels(&self) -> usize {
            1
        }
        fn size(&self) -> Option<u64> {
            Some(self.samples.len() as u64)
        }
        fn allocate(&mut self, frames: usize) {
            self.buffer.allocate(frames);
        }
        fn fill(&mut self, max: Option<usize>) -> &[f32] {
            let max = max.unwrap_or_else(|| self.buffer.capacity_frames());
            let remaining = self.samples.len() - self.pos;
            let n = max.min(remaining);
            self.buffer.prefix_mut(n).copy_from_slice(&self.samples[self.pos..self.pos + n]);
            self.pos += n;
            self.buffer.prefix(n)
        }
    }

    fn drain_all(src: &mut dyn Source, chunk: usize) -> Vec<f32> {
        src.allocate(chunk);
        let mut out = Vec::new();
        loop {
            let block = src.fill(Some(chunk));
            if block.is_empty() {
                break;
            }
            out.extend_from_slice(block);
        }
        out
    }

    #[test]
    fn mono_roundtrips_through_stereo_and_back_within_a_sample_and_no_clipping() {
        // spec.md §8: mono reformatted to 48kHz stereo then to 22.05kHz mono
        // lands within one sample of the expected length and never clips.
        let source_rate = 48_000u32;
        let frames = source_rate as usize; // exactly 1 second
        let target_rate = 22_050u32;

        let tone: Box<dyn Source> = Box::new(ToneSource::new(source_rate, frames));
        let stereo = crate::source::reformat(tone, source_rate, 2).unwrap();
        let mut mono = crate::source::reformat(stereo, target_rate, 1).unwrap();

        let out = drain_all(mono.as_mut(), 1024);
        let out_frames = out.len(); // 1 channel, so samples == frames

        let expected_frames = (frames as f64 * target_rate as f64 / source_rate as f64).round() as i64;
        assert!(
            (out_frames as i64 - expected_frames).abs() <= 1,
            "expected ~{expected_frames} frames, got {out_frames}"
        );

        assert!(out.iter().all(|&s| s.abs() <= 1.0), "round-tripped signal must not clip");
    }
}
