use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use api::wav::{parse_header, HeaderParse, MAX_HEADER_LEN};

use super::StreamFormat;

/// Reader for a stored live capture.
///
/// The header sizes are placeholders, the real length comes from the file.
/// A trailing partial frame is ignored.
pub struct RawReader {
    reader: BufReader<File>,
    format: StreamFormat,
    frames: u64,
    frames_read: u64,
    scratch: Vec<u8>,
}

impl RawReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let file_len = file.metadata()?.len();

        let mut head = Vec::with_capacity(4096);
        (&mut file)
            .take(MAX_HEADER_LEN as u64)
            .read_to_end(&mut head)?;
        let (format, data_offset) = match parse_header(&head).map_err(|e| anyhow!(e))? {
            HeaderParse::Ready {
                format,
                data_offset,
            } => (format, data_offset as u64),
            HeaderParse::Incomplete => return Err(anyhow!("truncated wave header")),
        };

        file.seek(SeekFrom::Start(data_offset))?;
        let frames = file_len.saturating_sub(data_offset) / format.block_align() as u64;
        Ok(Self {
            reader: BufReader::with_capacity(256 * 1024, file),
            format,
            frames,
            frames_read: 0,
            scratch: Vec::new(),
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Append up to `max_frames` frames to `out` as interleaved f32
    pub fn read_frames(&mut self, max_frames: usize, out: &mut Vec<f32>) -> io::Result<usize> {
        let left = self.frames - self.frames_read;
        let frames = (max_frames as u64).min(left) as usize;
        if frames == 0 {
            return Ok(0);
        }
        let bytes = frames * self.format.block_align();
        self.scratch.resize(bytes, 0);
        self.reader.read_exact(&mut self.scratch)?;
        out.extend(
            self.scratch
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
        );
        self.frames_read += frames as u64;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::wav::streaming_header;
    use std::io::Write;

    #[test]
    fn test_reads_streaming_capture_with_partial_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("raw");
        let format = StreamFormat::pcm16(8_000, 2);

        let mut file = File::create(&path).unwrap();
        file.write_all(&streaming_header(&format)).unwrap();
        for s in [16384i16, -16384, 0, 32767] {
            file.write_all(&s.to_le_bytes()).unwrap();
        }
        // half a frame left behind by an interrupted append
        file.write_all(&[1, 2]).unwrap();
        drop(file);

        let mut reader = RawReader::open(&path).unwrap();
        assert_eq!(reader.format(), format);
        assert_eq!(reader.frames(), 2);

        let mut out = Vec::new();
        assert_eq!(reader.read_frames(10, &mut out).unwrap(), 2);
        assert_eq!(out, vec![0.5, -0.5, 0.0, 32767.0 / 32768.0]);
        assert_eq!(reader.read_frames(10, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("raw");
        std::fs::write(&path, b"definitely not a wave file").unwrap();
        assert!(RawReader::open(&path).is_err());
    }
}
