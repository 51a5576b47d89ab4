//! Capture stream container.
//!
//! A live capture is a RIFF/WAVE header with placeholder sizes followed by
//! interleaved signed 16-bit little-endian PCM for as long as the stream runs.

use serde::{Deserialize, Serialize};

/// Header length written by [`streaming_header`]
pub const HEADER_LEN: usize = 44;
/// Give up looking for the `data` chunk after this many bytes
pub const MAX_HEADER_LEN: usize = 64 * 1024;

const FORMAT_PCM: u16 = 1;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl StreamFormat {
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.block_align() as u64
    }

    /// Saturates instead of overflowing on absurd inputs
    pub fn frames_for_ms(&self, ms: u64) -> u64 {
        let frames = ms as u128 * self.sample_rate as u128 / 1000;
        u64::try_from(frames).unwrap_or(u64::MAX)
    }

    pub fn ms_for_frames(&self, frames: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        let ms = frames as u128 * 1000 / self.sample_rate as u128;
        u64::try_from(ms).unwrap_or(u64::MAX)
    }

    pub fn ms_for_bytes(&self, bytes: u64) -> u64 {
        let align = self.block_align() as u64;
        if align == 0 {
            return 0;
        }
        self.ms_for_frames(bytes / align)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bits_per_sample != 16 {
            return Err(format!(
                "unsupported sample format: {}-bit",
                self.bits_per_sample
            ));
        }
        if !(1..=8).contains(&self.channels) {
            return Err(format!("unsupported channel count: {}", self.channels));
        }
        if !(8_000..=192_000).contains(&self.sample_rate) {
            return Err(format!("unsupported sample rate: {}", self.sample_rate));
        }
        Ok(())
    }
}

/// WAV header whose sizes claim "as long as possible"
pub fn streaming_header(format: &StreamFormat) -> Vec<u8> {
    let align = format.block_align().max(1) as u32;
    let data_len = (u32::MAX - 36) / align * align;
    header(format, data_len)
}

/// WAV header for exactly `data_len` bytes of PCM
pub fn header(format: &StreamFormat, data_len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(data_len.saturating_add(36)).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&(format.byte_rate() as u32).to_le_bytes());
    out.extend_from_slice(&(format.block_align() as u16).to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParse {
    /// Need more bytes
    Incomplete,
    Ready {
        format: StreamFormat,
        /// First PCM byte
        data_offset: usize,
    },
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Parse a (possibly partial) WAV header, ignoring the declared sizes
pub fn parse_header(buf: &[u8]) -> Result<HeaderParse, String> {
    if buf.len() < 12 {
        if !b"RIFF".starts_with(&buf[..buf.len().min(4)]) {
            return Err("not a RIFF/WAVE stream".to_string());
        }
        return Ok(HeaderParse::Incomplete);
    }
    if &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Err("not a RIFF/WAVE stream".to_string());
    }

    let mut format: Option<StreamFormat> = None;
    let mut pos = 12usize;
    loop {
        if pos > MAX_HEADER_LEN {
            return Err("no data chunk in stream header".to_string());
        }
        if pos + 8 > buf.len() {
            return Ok(HeaderParse::Incomplete);
        }
        let id = &buf[pos..pos + 4];
        let size = le_u32(buf, pos + 4) as usize;
        let body = pos + 8;

        if id == b"data" {
            let format = format.ok_or("data chunk before fmt chunk")?;
            format.validate()?;
            return Ok(HeaderParse::Ready {
                format,
                data_offset: body,
            });
        }

        if id == b"fmt " {
            if size < 16 {
                return Err(format!("fmt chunk too short: {}", size));
            }
            if body + size > buf.len() {
                return Ok(HeaderParse::Incomplete);
            }
            let tag = le_u16(buf, body);
            let pcm = match tag {
                FORMAT_PCM => true,
                FORMAT_EXTENSIBLE if size >= 40 => le_u16(buf, body + 24) == FORMAT_PCM,
                _ => false,
            };
            if !pcm {
                return Err(format!("unsupported wave format tag: {:#06x}", tag));
            }
            format = Some(StreamFormat {
                channels: le_u16(buf, body + 2),
                sample_rate: le_u32(buf, body + 4),
                bits_per_sample: le_u16(buf, body + 14),
            });
        }

        pos = body + size + (size & 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_header_parses_back() {
        let format = StreamFormat::pcm16(48_000, 2);
        let head = streaming_header(&format);
        assert_eq!(head.len(), HEADER_LEN);
        let data_len = le_u32(&head, 40);
        assert_eq!(data_len % 4, 0);
        assert!(le_u32(&head, 4) >= data_len);
        assert_eq!(
            parse_header(&head),
            Ok(HeaderParse::Ready {
                format,
                data_offset: HEADER_LEN
            })
        );
    }

    #[test]
    fn test_header_split_across_chunks() {
        let head = streaming_header(&StreamFormat::pcm16(44_100, 1));
        assert_eq!(parse_header(&head[..3]), Ok(HeaderParse::Incomplete));
        assert_eq!(parse_header(&head[..20]), Ok(HeaderParse::Incomplete));
        assert_eq!(parse_header(&head[..40]), Ok(HeaderParse::Incomplete));
        assert!(matches!(
            parse_header(&head),
            Ok(HeaderParse::Ready { .. })
        ));
    }

    #[test]
    fn test_skips_unknown_chunks() {
        let format = StreamFormat::pcm16(16_000, 1);
        let plain = header(&format, 100);
        let mut buf = plain[..36].to_vec();
        buf.extend_from_slice(b"LIST");
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3, 0]);
        buf.extend_from_slice(&plain[36..]);
        assert_eq!(
            parse_header(&buf),
            Ok(HeaderParse::Ready {
                format,
                data_offset: HEADER_LEN + 12
            })
        );
    }

    #[test]
    fn test_rejects_non_wav() {
        assert!(parse_header(b"OggS\0\0\0\0\0\0\0\0\0\0").is_err());
        assert!(parse_header(b"ID3").is_err());
        let mut head = header(&StreamFormat::pcm16(48_000, 2), 0);
        head[34] = 24;
        assert!(parse_header(&head).is_err());
    }

    #[test]
    fn test_durations() {
        let format = StreamFormat::pcm16(48_000, 2);
        assert_eq!(format.block_align(), 4);
        assert_eq!(format.frames_for_ms(12_000), 576_000);
        assert_eq!(format.ms_for_bytes(192_000), 1000);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let format = StreamFormat::pcm16(48_000, 2);
        assert_eq!(format.frames_for_ms(u64::MAX / 2), u64::MAX);
        assert_eq!(format.frames_for_ms(u64::MAX), u64::MAX);
        assert_eq!(format.ms_for_frames(u64::MAX), u64::MAX / 48);
    }
}
