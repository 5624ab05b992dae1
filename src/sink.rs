//! Output sinks: where the mixed, interleaved `f32` blocks the root
//! [`crate::scheduler::Scheduler`] produces actually go.
//!
//! [`Sink::open`] mirrors the original `open_sink`'s scheme-prefixed
//! grammar (`file:`, a bare path, `-`/`stdout:`, `ffmpeg:`, `ffmpegre:`,
//! or nothing at all for a live device), so the CLI's `-o`/`--output` flag
//! needs no parsing logic of its own.

use std::io::{self, Write as _};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::SinkError;

/// Somewhere a mixed block of interleaved `f32` samples can be written.
pub trait Sink {
    fn samplerate(&self) -> u32;
    fn channels(&self) -> usize;

    /// Write one interleaved block. Blocks (or otherwise applies
    /// backpressure) for sinks with a real-time pace; returns immediately
    /// for sinks that just buffer to disk.
    fn write(&mut self, buf: &[f32]) -> io::Result<()>;
}

/// Parse an `-o`/`--output` argument and open the corresponding sink.
/// `None` (no flag given) opens a live [`DeviceSink`].
pub fn open(spec: Option<&str>, samplerate: u32, channels: usize) -> Result<Box<dyn Sink>, SinkError> {
    let value = match spec {
        Some(v) => v,
        None => return Ok(Box::new(DeviceSink::new(samplerate, channels)?)),
    };

    if value == "-" {
        return Ok(Box::new(StdoutSink::new(samplerate, channels)));
    }

    if let Some((scheme, rest)) = value.split_once(':') {
        match scheme {
            "file" => return Ok(Box::new(FileSink::create(rest, samplerate, channels)?)),
            "stdout" => return Ok(Box::new(StdoutSink::new(samplerate, channels))),
            "ffmpeg" => return Ok(Box::new(FfmpegSink::spawn(rest, samplerate, channels, false)?)),
            "ffmpegre" => return Ok(Box::new(FfmpegSink::spawn(rest, samplerate, channels, true)?)),
            other => return Err(SinkError::Config(crate::error::ConfigError::UnknownOutputType(other.to_string()))),
        }
    }

    Ok(Box::new(FileSink::create(value, samplerate, channels)?))
}

/// Writes to a WAV file via `hound`.
pub struct FileSink {
    writer: hound::WavWriter<io::BufWriter<std::fs::File>>,
}

impl FileSink {
    fn create(path: impl AsRef<Path>, samplerate: u32, channels: usize) -> Result<Self, SinkError> {
        let spec = hound::WavSpec {
            channels: channels as u16,
            sample_rate: samplerate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| SinkError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok(Self { writer })
    }
}

impl Sink for FileSink {
    fn samplerate(&self) -> u32 {
        self.writer.spec().sample_rate
    }

    fn channels(&self) -> usize {
        self.writer.spec().channels as usize
    }

    fn write(&mut self, buf: &[f32]) -> io::Result<()> {
        for &s in buf {
            self.writer
                .write_sample(s)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(())
    }
}

/// Writes raw 16-bit little-endian PCM to stdout, for piping into another
/// program.
pub struct StdoutSink {
    samplerate: u32,
    channels: usize,
    out: io::Stdout,
}

impl StdoutSink {
    fn new(samplerate: u32, channels: usize) -> Self {
        Self {
            samplerate,
            channels,
            out: io::stdout(),
        }
    }
}

impl Sink for StdoutSink {
    fn samplerate(&self) -> u32 {
        self.samplerate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write(&mut self, buf: &[f32]) -> io::Result<()> {
        let mut lock = self.out.lock();
        for &s in buf {
            let sample = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            lock.write_all(&sample.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Pipes raw 16-bit little-endian PCM into an `ffmpeg` child process, which
/// is handed the rest of `value` as its own argument list (shell-split).
/// `realtime` adds `-re`, pacing ffmpeg's read to the stream's own rate --
/// used for live icecast pushes, not for fast batch encodes.
pub struct FfmpegSink {
    samplerate: u32,
    channels: usize,
    child: Child,
}

impl FfmpegSink {
    fn spawn(args: &str, samplerate: u32, channels: usize, realtime: bool) -> Result<Self, SinkError> {
        let extra = shell_words(args);

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(samplerate.to_string())
            .arg("-ac")
            .arg(channels.to_string());
        if realtime {
            cmd.arg("-re");
        }
        cmd.arg("-i").arg("-");
        cmd.args(extra);
        cmd.stdin(Stdio::piped());

        let child = cmd.spawn().map_err(SinkError::Spawn)?;
        Ok(Self {
            samplerate,
            channels,
            child,
        })
    }
}

impl Sink for FfmpegSink {
    fn samplerate(&self) -> u32 {
        self.samplerate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write(&mut self, buf: &[f32]) -> io::Result<()> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdin closed"))?;
        for &s in buf {
            let sample = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            stdin.write_all(&sample.to_le_bytes())?;
        }
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.child.stdin = None;
        let _ = self.child.wait();
    }
}

/// Minimal whitespace/quote word-splitting for the `ffmpeg:`/`ffmpegre:`
/// argument string, matching `shlex.split`'s everyday behavior without
/// pulling in a dedicated crate for it.
fn shell_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Live playback through the default output device.
pub struct DeviceSink {
    samplerate: u32,
    channels: usize,
    tx: crossbeam_channel::Sender<f32>,
    _stream: cpal::Stream,
}

impl DeviceSink {
    pub fn new(samplerate: u32, channels: usize) -> Result<Self, SinkError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| SinkError::Device("no default output device".to_string()))?;

        let config = cpal::StreamConfig {
            channels: channels as u16,
            sample_rate: cpal::SampleRate(samplerate),
            buffer_size: cpal::BufferSize::Default,
        };

        // a couple of seconds of headroom: `write` blocks once this fills,
        // which is exactly the backpressure a synchronous main loop needs.
        let (tx, rx) = crossbeam_channel::bounded::<f32>(samplerate as usize * channels * 2);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = rx.try_recv().unwrap_or(0.0);
                    }
                },
                move |err| log::error!("output stream error: {err}"),
            )
            .map_err(|e| SinkError::Device(e.to_string()))?;

        stream.play().map_err(|e| SinkError::Device(e.to_string()))?;

        Ok(Self {
            samplerate,
            channels,
            tx,
            _stream: stream,
        })
    }
}

impl Sink for DeviceSink {
    fn samplerate(&self) -> u32 {
        self.samplerate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write(&mut self, buf: &[f32]) -> io::Result<()> {
        for &s in buf {
            let _ = self.tx.send(s);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_words_splits_on_whitespace_and_honors_quotes() {
        let words = shell_words("-acodec libmp3lame -f mp3 'icecast://h/m'");
        assert_eq!(
            words,
            vec!["-acodec", "libmp3lame", "-f", "mp3", "icecast://h/m"]
        );
    }

    #[test]
    fn open_with_unknown_scheme_is_an_error() {
        let result = open(Some("bogus:thing"), 48_000, 2);
        assert!(result.is_err());
    }
}
