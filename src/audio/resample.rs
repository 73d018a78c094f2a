//! Sample-rate conversion and channel mixing for the uplink path.
//!
//! The remote session expects **16 kHz mono `f32`** before PCM16 encoding.
//! Capture frames arrive at whatever rate the device runs at, so every frame
//! goes through:
//!
//! 1. [`stereo_to_mono`]: downmix any number of interleaved channels to mono.
//! 2. [`resample`]: convert from the device rate to the wire rate.
//!
//! Both are pure functions; each capture frame is converted independently.
//! Linear interpolation is used here because frames are short and
//! processed one at a time. Playback-side conversion (whole response chunks
//! to a device rate) uses `rubato` instead, see [`crate::audio::output`].

// ---------------------------------------------------------------------------
// stereo_to_mono
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging all channels.
///
/// The output length is `samples.len() / channels`.
///
/// * If `channels == 1` the input slice is returned as an owned `Vec`.
/// * If `channels == 0` an empty vector is returned.
///
/// # Example
///
/// ```rust
/// use live_tutor::audio::stereo_to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, 0.4]; // L R L R
/// let mono = stereo_to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// ```
pub fn stereo_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// resample
// ---------------------------------------------------------------------------

/// Resample `samples` from `source_rate` Hz to `target_rate` Hz using linear
/// interpolation.
///
/// * Equal rates return a copy of the input.
/// * Empty input, or a zero rate on either side, returns an empty vector.
///
/// The output length is `ceil(samples.len() * target_rate / source_rate)`.
///
/// # Example
///
/// ```rust
/// use live_tutor::audio::resample;
///
/// // 4096 samples @ 48 kHz → 16 kHz (ratio = 1/3)
/// let frame = vec![0.25_f32; 4096];
/// let wire = resample(&frame, 48_000, 16_000);
/// assert_eq!(wire.len(), 1366);
/// ```
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return samples.to_vec();
    }

    if samples.is_empty() || source_rate == 0 || target_rate == 0 {
        return Vec::new();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else if idx < samples.len() {
            samples[idx]
        } else {
            0.0
        };

        output.push(sample);
    }

    output
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
