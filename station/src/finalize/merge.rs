//! Blocking mix stages, run on the blocking pool.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Result;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::audio::decode::decode_track;
use crate::audio::mix::{mix_into, to_i16};
use crate::audio::raw::RawReader;
use crate::audio::StreamFormat;

/// Frames mixed per render step
const BLOCK_FRAMES: usize = 4096;

#[derive(Debug, Clone)]
pub struct OverlayInput {
    pub start_frame: u64,
    pub frames: u64,
    pub path: PathBuf,
}

fn tmp_path(out: &Path) -> PathBuf {
    let mut name = out.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Format and length of the stored live capture
pub fn probe_raw(raw: &Path) -> Result<(StreamFormat, u64)> {
    let reader = RawReader::open(raw)?;
    Ok((reader.format(), reader.frames()))
}

/// Decode up to `max_frames` of `track` in the base layout into a float
/// overlay file. Returns the frames written.
pub fn render_overlay(track: &Path, base: &StreamFormat, max_frames: u64, out: &Path) -> Result<u64> {
    let samples = decode_track(track, base, max_frames as usize)?;
    let spec = WavSpec {
        channels: base.channels,
        sample_rate: base.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let tmp = tmp_path(out);
    let mut writer = WavWriter::create(&tmp, spec)?;
    for s in &samples {
        writer.write_sample(*s)?;
    }
    writer.finalize()?;
    fs::rename(&tmp, out)?;
    Ok((samples.len() / base.channels.max(1) as usize) as u64)
}

/// Sum the base capture and every overlay into a 16-bit WAV.
///
/// The output runs until the later of the base end and the last overlay
/// end. `progress` gets frames done and total after each block.
pub fn render_mix<F>(raw: &Path, overlays: &[OverlayInput], out: &Path, mut progress: F) -> Result<u64>
where
    F: FnMut(u64, u64),
{
    let mut base = RawReader::open(raw)?;
    let format = base.format();
    let channels = format.channels as usize;
    let total = overlays
        .iter()
        .map(|o| o.start_frame.saturating_add(o.frames))
        .fold(base.frames(), u64::max);

    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let tmp = tmp_path(out);
    let mut writer = WavWriter::create(&tmp, spec)?;
    let mut readers: Vec<Option<WavReader<BufReader<File>>>> =
        overlays.iter().map(|_| None).collect();

    let mut block: Vec<f32> = Vec::with_capacity(BLOCK_FRAMES * channels);
    let mut overlay: Vec<f32> = Vec::with_capacity(BLOCK_FRAMES * channels);
    let mut pos = 0u64;
    while pos < total {
        let n = (total - pos).min(BLOCK_FRAMES as u64) as usize;
        block.clear();
        base.read_frames(n, &mut block)?;
        block.resize(n * channels, 0.0);

        let end = pos + n as u64;
        for (input, reader) in overlays.iter().zip(readers.iter_mut()) {
            let from = input.start_frame.max(pos);
            let to = input.start_frame.saturating_add(input.frames).min(end);
            if from >= to {
                continue;
            }
            if reader.is_none() {
                *reader = Some(WavReader::open(&input.path)?);
            }
            let Some(reader) = reader.as_mut() else {
                continue;
            };
            overlay.clear();
            let wanted = (to - from) as usize * channels;
            for sample in reader.samples::<f32>().take(wanted) {
                overlay.push(sample?);
            }
            let at = (from - pos) as usize * channels;
            mix_into(&mut block[at..], &overlay);
        }

        for s in &block {
            writer.write_sample(to_i16(*s))?;
        }
        pos = end;
        progress(pos, total);
    }
    writer.finalize()?;
    fs::rename(&tmp, out)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::wav::streaming_header;
    use std::io::Write;

    fn write_raw(path: &Path, format: &StreamFormat, frames: usize) {
        let mut file = File::create(path).unwrap();
        file.write_all(&streaming_header(format)).unwrap();
        file.write_all(&vec![0u8; frames * format.block_align()])
            .unwrap();
    }

    fn write_tone(path: &Path, rate: u32, frames: usize, value: i16) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_overlay_lands_at_offset_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let format = StreamFormat::pcm16(8_000, 1);
        let raw = dir.path().join("raw.wav");
        write_raw(&raw, &format, 16_000);

        let track = dir.path().join("track.wav");
        write_tone(&track, 8_000, 20_000, 8_000);
        let overlay = dir.path().join("overlay-000.wav");
        // marker plays 500ms of a 2.5s track
        let frames = render_overlay(&track, &format, 4_000, &overlay).unwrap();
        assert_eq!(frames, 4_000);

        let out = dir.path().join("final.wav");
        let mut last = (0, 0);
        let total = render_mix(
            &raw,
            &[OverlayInput {
                start_frame: 8_000,
                frames,
                path: overlay,
            }],
            &out,
            |done, total| last = (done, total),
        )
        .unwrap();
        assert_eq!(total, 16_000);
        assert_eq!(last, (16_000, 16_000));

        let samples: Vec<i16> = WavReader::open(&out)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples.len(), 16_000);
        assert!(samples[..8_000].iter().all(|s| *s == 0));
        assert!(samples[8_000..12_000].iter().all(|s| (*s - 8_000).abs() <= 1));
        assert!(samples[12_000..].iter().all(|s| *s == 0));
    }

    #[test]
    fn test_overlapping_overlays_are_limited_and_extend_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let format = StreamFormat::pcm16(8_000, 1);
        let raw = dir.path().join("raw.wav");
        write_raw(&raw, &format, 1_000);

        let track = dir.path().join("loud.wav");
        write_tone(&track, 8_000, 2_000, 28_000);
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        render_overlay(&track, &format, 2_000, &a).unwrap();
        render_overlay(&track, &format, 2_000, &b).unwrap();

        let out = dir.path().join("final.wav");
        let total = render_mix(
            &raw,
            &[
                OverlayInput {
                    start_frame: 0,
                    frames: 2_000,
                    path: a,
                },
                OverlayInput {
                    start_frame: 500,
                    frames: 2_000,
                    path: b,
                },
            ],
            &out,
            |_, _| {},
        )
        .unwrap();
        assert_eq!(total, 2_500);

        let samples: Vec<i16> = WavReader::open(&out)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples.len(), 2_500);
        assert!((samples[100] - 28_000).abs() <= 1);
        assert_eq!(samples[1_000], i16::MAX);
        assert!((samples[2_200] - 28_000).abs() <= 1);
    }
}
