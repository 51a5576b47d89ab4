//! Audio capture and encode: source, gain, streaming WAV encoder and the
//! fixed-size chunker feeding the stream socket.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use api::wav::{streaming_header, StreamFormat};
use hound::{SampleFormat, WavReader};

/// Pulls interleaved float frames in `[-1, 1]`
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;

    /// Append up to `frames` frames to `out`, returns the frames read.
    /// Zero means the source is exhausted.
    fn read(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize>;
}

/// A WAV file played as if it were a live input
pub struct WavFileSource {
    reader: WavReader<BufReader<File>>,
    channels: u16,
    sample_rate: u32,
    scale: f32,
    float: bool,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader =
            WavReader::open(path).with_context(|| format!("open {}", path.display()))?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(anyhow!("{} has no channels", path.display()));
        }
        let float = spec.sample_format == SampleFormat::Float;
        if !float && !(8..=32).contains(&spec.bits_per_sample) {
            return Err(anyhow!(
                "{}: unsupported {}-bit samples",
                path.display(),
                spec.bits_per_sample
            ));
        }
        Ok(Self {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            scale: if float {
                1.0
            } else {
                1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32
            },
            float,
            reader,
        })
    }

    pub fn duration_ms(&self) -> u64 {
        self.reader.duration() as u64 * 1000 / self.sample_rate.max(1) as u64
    }
}

impl AudioSource for WavFileSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize> {
        let wanted = frames * self.channels as usize;
        let before = out.len();
        if self.float {
            for s in self.reader.samples::<f32>().take(wanted) {
                out.push(s?);
            }
        } else {
            let scale = self.scale;
            for s in self.reader.samples::<i32>().take(wanted) {
                out.push(s? as f32 * scale);
            }
        }
        // drop a trailing partial frame
        let read = (out.len() - before) / self.channels as usize;
        out.truncate(before + read * self.channels as usize);
        Ok(read)
    }
}

/// Linear gain with hard clamping
#[derive(Debug, Clone, Copy)]
pub struct Gain(pub f32);

impl Gain {
    pub fn from_db(db: f32) -> Self {
        Gain(10f32.powf(db / 20.0))
    }

    pub fn apply(&self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = (*s * self.0).clamp(-1.0, 1.0);
        }
    }
}

impl Default for Gain {
    fn default() -> Self {
        Gain(1.0)
    }
}

/// Streaming WAV: one header with open-ended sizes, then 16-bit PCM
pub struct StreamEncoder {
    format: StreamFormat,
    header_sent: bool,
}

impl StreamEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            format: StreamFormat::pcm16(sample_rate, channels),
            header_sent: false,
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Begin a fresh container, the next encode emits a header again
    pub fn restart(&mut self) {
        self.header_sent = false;
    }

    pub fn encode(&mut self, samples: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * 2 + api::wav::HEADER_LEN);
        if !self.header_sent {
            out.extend_from_slice(&streaming_header(&self.format));
            self.header_sent = true;
        }
        for s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// Cuts a byte stream into chunks of exactly `size` bytes
pub struct Chunker {
    size: usize,
    buf: Vec<u8>,
}

impl Chunker {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while self.buf.len() >= self.size {
            let rest = self.buf.split_off(self.size);
            out.push(std::mem::replace(&mut self.buf, rest));
        }
        out
    }

    /// Whatever is left, shorter than a full chunk
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Source, gain, encoder and chunker wired together
pub struct Capture {
    source: Box<dyn AudioSource>,
    gain: Gain,
    encoder: StreamEncoder,
    chunker: Chunker,
    block_frames: usize,
    samples: Vec<f32>,
    done: bool,
}

impl Capture {
    /// `block_ms` of audio is pulled from the source per step
    pub fn new(source: Box<dyn AudioSource>, gain: Gain, chunk_bytes: usize, block_ms: u64) -> Self {
        let encoder = StreamEncoder::new(source.sample_rate(), source.channels());
        let block_frames =
            (encoder.format().frames_for_ms(block_ms) as usize).max(1);
        Self {
            source,
            gain,
            encoder,
            chunker: Chunker::new(chunk_bytes),
            block_frames,
            samples: Vec::new(),
            done: false,
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.encoder.format()
    }

    pub fn block_ms(&self) -> u64 {
        self.format().ms_for_frames(self.block_frames as u64)
    }

    pub fn set_gain(&mut self, gain: Gain) {
        self.gain = gain;
    }

    /// A new socket needs a fresh header; buffered bytes of the old one go
    pub fn restart(&mut self) {
        self.encoder.restart();
        self.chunker.clear();
    }

    /// Chunks ready after one block, `None` when the source ran dry and
    /// everything was flushed
    pub fn step(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        if self.done {
            return Ok(None);
        }
        self.samples.clear();
        let frames = self.source.read(self.block_frames, &mut self.samples)?;
        if frames == 0 {
            self.done = true;
            return Ok(Some(self.chunker.flush().into_iter().collect()));
        }
        self.gain.apply(&mut self.samples);
        let bytes = self.encoder.encode(&self.samples);
        Ok(Some(self.chunker.push(&bytes)))
    }
}
