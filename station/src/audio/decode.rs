use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{anyhow, Result};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::mix::{convert_channels, resample_linear};
use super::StreamFormat;

/// Decode an artist track into the base timeline's layout.
///
/// Returns at most `max_frames` interleaved frames at `target`'s rate and
/// channel count. Decoding stops as soon as enough audio is available.
pub fn decode_track(path: &Path, target: &StreamFormat, max_frames: usize) -> Result<Vec<f32>> {
    let src = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no supported audio tracks"))?;
    let track_id = track.id;
    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut native: Vec<f32> = Vec::new();
    let mut src_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut src_channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(0);
    let mut skipped = 0usize;

    loop {
        if src_rate > 0 && src_channels > 0 {
            let wanted = (max_frames as u64)
                .saturating_mul(src_rate as u64)
                .div_ceil(target.sample_rate.max(1) as u64)
                .saturating_add(2);
            if (native.len() / src_channels) as u64 >= wanted {
                break;
            }
        }

        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(Error::ResetRequired) => break,
            Err(err) => return Err(anyhow!(err)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                src_rate = spec.rate;
                src_channels = spec.channels.count();
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                native.extend_from_slice(buf.samples());
            }
            Err(Error::IoError(_)) => break,
            Err(Error::DecodeError(e)) => {
                skipped += 1;
                tracing::trace!("[decode] skip corrupt packet in {}: {}", path.display(), e);
            }
            Err(err) => return Err(anyhow!(err)),
        }
    }

    if native.is_empty() || src_channels == 0 || src_rate == 0 {
        return Err(anyhow!("no audio decoded ({} corrupt packets)", skipped));
    }
    if skipped > 0 {
        tracing::warn!(
            "[decode] {} corrupt packets skipped in {}",
            skipped,
            path.display()
        );
    }

    let channels = target.channels as usize;
    let mut samples = convert_channels(&native, src_channels, channels);
    samples = resample_linear(&samples, channels, src_rate, target.sample_rate);
    samples.truncate(max_frames.saturating_mul(channels));
    Ok(samples)
}
