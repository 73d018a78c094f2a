//! Audio paths of a tutoring session.
//!
//! # Uplink
//!
//! ```text
//! Microphone → FrameAssembler (4096-sample mono frames) → resample to 16 kHz
//!            → ChunkAccumulator → encode_envelope (PCM16 + base64) → remote
//! ```
//!
//! # Downlink
//!
//! ```text
//! remote → decode_base64_pcm16 → PlaybackScheduler → AudioSink (24 kHz)
//!                                                       └→ OutputTap → VolumeMeter
//! ```

pub mod buffer;
pub mod capture;
pub mod codec;
pub mod meter;
pub mod output;
pub mod playback;
pub mod resample;

pub use buffer::{ChunkAccumulator, RingBuffer};
pub use capture::{AudioFrame, CaptureError, CpalMicrophone, FrameAssembler, MicLease, Microphone};
pub use codec::{decode_base64_pcm16, decode_pcm16, encode_envelope, encode_pcm16, CodecError};
pub use meter::{spawn_meter, VolumeMeter};
pub use output::CpalOutput;
pub use playback::{
    AudioOutput, AudioSink, OutputTap, PlaybackError, PlaybackScheduler, VoiceEndedCallback,
    VoiceId,
};
pub use resample::{resample, stereo_to_mono};

#[cfg(test)]
pub use capture::MockMicrophone;
#[cfg(test)]
pub use playback::MockOutput;
