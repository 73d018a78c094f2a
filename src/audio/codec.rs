//! PCM16 wire codec.
//!
//! Uplink: normalized `f32` samples → signed 16-bit little-endian PCM →
//! base64, wrapped in an [`AudioEnvelope`] that declares the format and rate
//! (`audio/pcm;rate=16000`).
//!
//! Downlink: base64 → PCM16 LE → normalized `f32` for the playback scheduler.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::remote::protocol::AudioEnvelope;

/// Errors raised while decoding an inbound audio payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// PCM16 needs two bytes per sample.
    #[error("PCM16 payload has odd length ({0} bytes)")]
    OddLength(usize),
}

/// MIME type declared for uplink audio at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Convert normalized samples to PCM16 little-endian bytes.
///
/// Samples are clamped to `[-1.0, 1.0]`; negative values scale by 32768 and
/// positive values by 32767 so both ends map onto the full `i16` range.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let s = s.clamp(-1.0, 1.0);
        let v = if s < 0.0 { s * 32_768.0 } else { s * 32_767.0 };
        bytes.extend_from_slice(&(v as i16).to_le_bytes());
    }
    bytes
}

/// Convert PCM16 little-endian bytes to normalized samples in `[-1.0, 1.0)`.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect())
}

/// Encode one merged uplink chunk into the wire envelope.
///
/// ```rust
/// use live_tutor::audio::encode_envelope;
///
/// let envelope = encode_envelope(&[0.0, 0.0], 16_000);
/// assert_eq!(envelope.mime_type, "audio/pcm;rate=16000");
/// assert_eq!(envelope.data, "AAAAAA==");
/// ```
pub fn encode_envelope(samples: &[f32], sample_rate: u32) -> AudioEnvelope {
    AudioEnvelope {
        data: BASE64.encode(encode_pcm16(samples)),
        mime_type: pcm_mime_type(sample_rate),
    }
}

/// Decode a base64 PCM16 payload received from the remote side.
pub fn decode_base64_pcm16(data: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = BASE64.decode(data.trim())?;
    decode_pcm16(&bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_full_scale() {
        let bytes = encode_pcm16(&[1.0, -1.0, 0.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x00, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn encode_clamps_out_of_range() {
        assert_eq!(encode_pcm16(&[4.0]), encode_pcm16(&[1.0]));
        assert_eq!(encode_pcm16(&[-4.0]), encode_pcm16(&[-1.0]));
    }

    #[test]
    fn decode_known_values() {
        let samples = decode_pcm16(&[0x00, 0x80, 0x00, 0x40]).unwrap();
        assert_eq!(samples, vec![-1.0, 0.5]);
    }

    #[test]
    fn decode_rejects_odd_length() {
        assert!(matches!(
            decode_pcm16(&[0x00, 0x01, 0x02]),
            Err(CodecError::OddLength(3))
        ));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(matches!(
            decode_base64_pcm16("not base64!!"),
            Err(CodecError::Base64(_))
        ));
    }

    #[test]
    fn envelope_declares_rate() {
        let env = encode_envelope(&[0.5; 4], 16_000);
        assert_eq!(env.mime_type, "audio/pcm;rate=16000");
        let back = decode_base64_pcm16(&env.data).unwrap();
        assert_eq!(back.len(), 4);
        assert!((back[0] - 0.5).abs() < 1e-3);
    }
}
