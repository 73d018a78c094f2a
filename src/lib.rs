//! Live Mandarin tutor: a duplex audio session between the local
//! microphone and speakers and a remote speech model.

pub mod audio;
pub mod config;
pub mod remote;
pub mod session;
