//! The pull-based [`Source`] interface shared by every node in the
//! scheduling graph: file decoders, resamplers, remixers, loudness
//! normalizers and the [`crate::scheduler::Scheduler`] itself.

use std::io;

/// A frame-interleaved, owned float32 buffer: `frame * channels + channel`.
///
/// Source implementations size this buffer once via [`Source::allocate`]
/// and reuse it across repeated [`Source::fill`] calls.
#[derive(Debug, Default, Clone)]
pub struct InterleavedBuffer {
    data: Vec<f32>,
    channels: usize,
}

impl InterleavedBuffer {
    pub fn new(channels: usize) -> Self {
        Self {
            data: Vec::new(),
            channels,
        }
    }

    /// Resize to hold `frames` frames, zeroing the contents.
    pub fn allocate(&mut self, frames: usize) {
        self.data.clear();
        self.data.resize(frames * self.channels, 0.0);
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of frames the buffer currently holds capacity for.
    pub fn capacity_frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// A view of the first `frames` frames.
    pub fn prefix(&self, frames: usize) -> &[f32] {
        &self.data[..frames * self.channels]
    }

    pub fn prefix_mut(&mut self, frames: usize) -> &mut [f32] {
        &mut self.data[..frames * self.channels]
    }

    /// Zero the first `frames` frames.
    pub fn zero(&mut self, frames: usize) {
        self.prefix_mut(frames).iter_mut().for_each(|s| *s = 0.0);
    }

    /// Add `other`'s first `frames` frames into this buffer's first `frames`
    /// frames, sample by sample. Both buffers must share a channel count.
    pub fn add_from(&mut self, other: &InterleavedBuffer, frames: usize) {
        debug_assert_eq!(self.channels, other.channels);
        let n = frames * self.channels;
        for (dst, src) in self.data[..n].iter_mut().zip(other.data[..n].iter()) {
            *dst += src;
        }
    }
}

/// Uniform pull interface for every node in the scheduling graph.
///
/// `fill` returning an empty slice is the sole end-of-stream signal; a
/// source that has simply produced nothing *yet* must still return the
/// (possibly silent) frames it was asked to produce.
pub trait Source: Send {
    /// Sample rate of the audio this source produces, in Hertz.
    fn samplerate(&self) -> u32;

    /// Number of interleaved channels this source produces.
    fn channels(&self) -> usize;

    /// Total length in frames, if known in advance (e.g. from a seekable
    /// file's duration). `None` for sources with no intrinsic length
    /// (schedulers, live streams).
    fn size(&self) -> Option<u64>;

    /// Size (and recursively size any wrapped source) an internal buffer
    /// able to hold `frames` frames.
    fn allocate(&mut self, frames: usize);

    /// Produce up to `max` frames (or the buffer's full capacity if `max`
    /// is `None`), returning a view of the filled prefix. An empty return
    /// means end-of-stream.
    fn fill(&mut self, max: Option<usize>) -> &[f32];

    /// Seek to an absolute frame offset, if supported.
    fn seek(&mut self, _frame: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "this source does not support seeking",
        ))
    }
}

/// Reformat `src` to the given target rate/channels, composing
/// downmix -> resample -> upmix, exactly as spec.md §4.1 describes.
///
/// Returns `src` unchanged (as a trait object) if it already matches.
pub fn reformat(
    src: Box<dyn Source>,
    target_rate: u32,
    target_channels: usize,
) -> Result<Box<dyn Source>, crate::error::ChannelMixError> {
    let mut src = src;

    if target_channels < src.channels() {
        src = crate::mix::Remix::downmix(src, target_channels)?;
    }

    if target_rate != src.samplerate() {
        src = Box::new(crate::mix::Resample::new(src, target_rate));
    }

    if target_channels > src.channels() {
        src = crate::mix::Remix::upmix(src, target_channels)?;
    }

    Ok(src)
}

/// Convenience: reformat `src` to match `other`'s rate and channel count.
pub fn reformat_like(
    src: Box<dyn Source>,
    other_rate: u32,
    other_channels: usize,
) -> Result<Box<dyn Source>, crate::error::ChannelMixError> {
    reformat(src, other_rate, other_channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_zeroes_and_sizes() {
        let mut buf = InterleavedBuffer::new(2);
        buf.allocate(4);
        assert_eq!(buf.capacity_frames(), 4);
        assert!(buf.as_slice().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn add_from_accumulates() {
        let mut a = InterleavedBuffer::new(1);
        a.allocate(3);
        a.as_mut_slice().copy_from_slice(&[1.0, 2.0, 3.0]);

        let mut b = InterleavedBuffer::new(1);
        b.allocate(3);
        b.as_mut_slice().copy_from_slice(&[10.0, 20.0, 30.0]);

        a.add_from(&b, 3);
        assert_eq!(a.as_slice(), &[11.0, 22.0, 33.0]);
    }
}
