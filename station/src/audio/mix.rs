/// Remap interleaved samples from `from` channels to `to` channels.
///
/// Down to mono averages, up from mono duplicates, anything else wraps
/// channel indexes.
pub fn convert_channels(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for ch in 0..to {
                out.push(frame[ch % from]);
            }
        }
    }
    out
}

/// Linear interpolation resampler, good enough for speech and music beds
pub fn resample_linear(samples: &[f32], channels: usize, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || channels == 0 || samples.len() < channels {
        return samples.to_vec();
    }
    let in_frames = samples.len() / channels;
    let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let next = (idx + 1).min(in_frames - 1);
        for ch in 0..channels {
            let a = samples[idx * channels + ch];
            let b = samples[next * channels + ch];
            out.push(a + (b - a) * frac);
        }
    }
    out
}

/// Add `overlay` onto `base` sample by sample
pub fn mix_into(base: &mut [f32], overlay: &[f32]) {
    for (b, o) in base.iter_mut().zip(overlay) {
        *b += *o;
    }
}

/// Hard limit to [-1, 1] and quantize
pub fn to_i16(sample: f32) -> i16 {
    let s = if sample.is_finite() { sample } else { 0.0 };
    (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_channels() {
        assert_eq!(convert_channels(&[0.2, 0.4], 2, 1), vec![0.3]);
        assert_eq!(convert_channels(&[0.5, -0.5], 1, 2), vec![0.5, 0.5, -0.5, -0.5]);
        assert_eq!(convert_channels(&[1.0, 2.0], 2, 2), vec![1.0, 2.0]);
    }

    #[test]
    fn test_resample_length() {
        let input: Vec<f32> = (0..480).map(|i| i as f32).collect();
        let up = resample_linear(&input, 1, 24_000, 48_000);
        assert_eq!(up.len(), 960);
        assert_eq!(up[0], 0.0);
        assert!((up[1] - 0.5).abs() < 1e-6);

        let stereo = vec![0.0; 441 * 2];
        assert_eq!(resample_linear(&stereo, 2, 44_100, 48_000).len(), 480 * 2);
    }

    #[test]
    fn test_overlapping_sum_is_limited() {
        let mut base = vec![0.6f32; 4];
        mix_into(&mut base, &[0.6, 0.6, -2.0, 0.0]);
        mix_into(&mut base, &[0.0, 0.6]);
        let out: Vec<i16> = base.iter().map(|s| to_i16(*s)).collect();
        assert_eq!(out, vec![i16::MAX, i16::MAX, -i16::MAX, to_i16(0.6)]);
        assert_eq!(to_i16(f32::NAN), 0);
    }
}
