//! Microphone capture.
//!
//! A [`Microphone`] hands out a [`MicLease`]: the device is opened (and
//! permission decided) at acquisition, but frames are only delivered once a
//! callback is attached with [`MicLease::start`]. Detaching the callback
//! ([`MicLease::stop`]) and releasing the device ([`MicLease::release`]) are
//! separate steps so teardown can do them in order.
//!
//! [`CpalMicrophone`] is the `cpal` implementation. `cpal::Stream` is not
//! `Send`, so each lease owns a named capture thread that builds the stream,
//! reports whether that worked, and then parks until the lease is released.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::audio::resample::stereo_to_mono;

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// One fixed-size block of mono samples in `[-1.0, 1.0]` at the device rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Receives capture frames. Runs on the audio thread, so it must not block.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send>;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(cpal::BuildStreamError),

    #[error("failed to start input stream: {0}")]
    PlayStream(cpal::PlayStreamError),

    #[error("capture thread exited before the stream was ready")]
    ThreadGone,
}

impl CaptureError {
    /// Message suitable for showing to the learner.
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::NoDevice => {
                "No microphone was found. Connect one and try again.".into()
            }
            CaptureError::PermissionDenied(_) => {
                "Microphone permission was denied. Allow microphone access and try again.".into()
            }
            other => format!("Could not start the microphone: {other}"),
        }
    }
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => CaptureError::NoDevice,
            other if mentions_permission(&other.to_string()) => {
                CaptureError::PermissionDenied(other.to_string())
            }
            other => CaptureError::BuildStream(other),
        }
    }
}

impl From<cpal::PlayStreamError> for CaptureError {
    fn from(e: cpal::PlayStreamError) -> Self {
        match e {
            cpal::PlayStreamError::DeviceNotAvailable => CaptureError::NoDevice,
            other if mentions_permission(&other.to_string()) => {
                CaptureError::PermissionDenied(other.to_string())
            }
            other => CaptureError::PlayStream(other),
        }
    }
}

/// Backends report denied access only as free text.
fn mentions_permission(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["permission", "denied", "not authorized", "not permitted"]
        .iter()
        .any(|needle| lower.contains(needle))
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Microphone: Send + Sync {
    /// Open the input device. Fails when there is no device or access is
    /// refused.
    async fn acquire(&self) -> Result<Box<dyn MicLease>, CaptureError>;
}

/// Exclusive use of an opened input device.
///
/// `stop` and `release` are idempotent and may be called in any phase.
pub trait MicLease: Send {
    /// Rate of the frames this lease delivers.
    fn sample_rate(&self) -> u32;

    /// Attach `on_frame`; replaces any earlier callback.
    fn start(&mut self, on_frame: FrameCallback);

    /// Detach the callback. Frames arriving afterwards are dropped.
    fn stop(&mut self);

    /// Stop the device and give it back.
    fn release(&mut self);
}

// ---------------------------------------------------------------------------
// FrameAssembler
// ---------------------------------------------------------------------------

/// Turns arbitrary interleaved device buffers into mono frames of exactly
/// `frame_size` samples.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    channels: u16,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    /// # Panics
    /// Panics if `frame_size` is 0.
    pub fn new(frame_size: usize, channels: u16, sample_rate: u32) -> Self {
        assert!(frame_size > 0, "FrameAssembler frame_size must be > 0");
        Self {
            frame_size,
            channels,
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Append `interleaved` and call `emit` once per completed frame.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(AudioFrame)) {
        self.pending
            .extend(stereo_to_mono(interleaved, self.channels));

        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            let samples = std::mem::replace(&mut self.pending, rest);
            emit(AudioFrame {
                samples,
                sample_rate: self.sample_rate,
            });
        }
    }

    /// Samples waiting for the next frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// CpalMicrophone
// ---------------------------------------------------------------------------

/// Default input device of the default `cpal` host.
pub struct CpalMicrophone {
    frame_size: usize,
}

impl CpalMicrophone {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

/// What the audio callback forwards to, while a callback is attached.
struct Tap {
    assembler: FrameAssembler,
    on_frame: FrameCallback,
}

type SharedTap = Arc<Mutex<Option<Tap>>>;

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self) -> Result<Box<dyn MicLease>, CaptureError> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(u16, u32), CaptureError>>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let tap: SharedTap = Arc::new(Mutex::new(None));

        let thread_tap = Arc::clone(&tap);
        thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let stream = match open_input(thread_tap) {
                    Ok((stream, channels, rate)) => {
                        let _ = ready_tx.send(Ok((channels, rate)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Parked until the lease sends or drops its end.
                let _ = release_rx.recv();
                drop(stream);
                log::debug!("mic: stream closed");
            })
            .map_err(|_| CaptureError::ThreadGone)?;

        let (channels, sample_rate) = ready_rx.await.map_err(|_| CaptureError::ThreadGone)??;
        log::info!("mic: acquired ({channels} ch @ {sample_rate} Hz)");

        Ok(Box::new(CpalLease {
            frame_size: self.frame_size,
            channels,
            sample_rate,
            tap,
            release_tx: Some(release_tx),
        }))
    }
}

fn open_input(tap: SharedTap) -> Result<(cpal::Stream, u16, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
    let supported = device.default_input_config()?;

    let channels = supported.channels();
    let sample_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mut guard = match tap.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(t) = guard.as_mut() {
                let Tap {
                    assembler,
                    on_frame,
                } = t;
                assembler.push(data, |frame| on_frame(frame));
            }
        },
        |err: cpal::StreamError| {
            log::error!("mic: stream error: {err}");
        },
        None,
    )?;

    stream.play()?;
    Ok((stream, channels, sample_rate))
}

struct CpalLease {
    frame_size: usize,
    channels: u16,
    sample_rate: u32,
    tap: SharedTap,
    release_tx: Option<mpsc::Sender<()>>,
}

impl CpalLease {
    fn set_tap(&self, tap: Option<Tap>) {
        let mut guard = self.tap.lock().unwrap_or_else(|p| p.into_inner());
        *guard = tap;
    }
}

impl MicLease for CpalLease {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, on_frame: FrameCallback) {
        self.set_tap(Some(Tap {
            assembler: FrameAssembler::new(self.frame_size, self.channels, self.sample_rate),
            on_frame,
        }));
    }

    fn stop(&mut self) {
        self.set_tap(None);
    }

    fn release(&mut self) {
        self.stop();
        if let Some(tx) = self.release_tx.take() {
            let _ = tx.send(());
            log::info!("mic: released");
        }
    }
}

impl Drop for CpalLease {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// MockMicrophone  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Default)]
pub struct MockMicState {
    pub acquired: usize,
    pub released: usize,
    pub live: bool,
    pub callback: Option<FrameCallback>,
}

/// A microphone whose frames are pushed by the test.
#[cfg(test)]
pub struct MockMicrophone {
    sample_rate: u32,
    state: Arc<Mutex<MockMicState>>,
    deny: std::sync::atomic::AtomicBool,
    missing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MockMicrophone {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            state: Arc::new(Mutex::new(MockMicState::default())),
            deny: Default::default(),
            missing: Default::default(),
        })
    }

    pub fn deny_permission(&self) {
        self.deny.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn unplug(&self) {
        self.missing.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Deliver one frame to the attached callback, if any. Returns whether
    /// a callback received it.
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        let mut state = self.state.lock().unwrap();
        let sample_rate = self.sample_rate;
        match state.callback.as_mut() {
            Some(cb) => {
                cb(AudioFrame {
                    samples,
                    sample_rate,
                });
                true
            }
            None => false,
        }
    }

    pub fn acquired(&self) -> usize {
        self.state.lock().unwrap().acquired
    }

    pub fn released(&self) -> usize {
        self.state.lock().unwrap().released
    }

    /// A lease is held and not yet released.
    pub fn is_live(&self) -> bool {
        self.state.lock().unwrap().live
    }

    pub fn has_callback(&self) -> bool {
        self.state.lock().unwrap().callback.is_some()
    }
}

#[cfg(test)]
#[async_trait]
impl Microphone for MockMicrophone {
    async fn acquire(&self) -> Result<Box<dyn MicLease>, CaptureError> {
        if self.missing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CaptureError::NoDevice);
        }
        if self.deny.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("user dismissed prompt".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.acquired += 1;
        state.live = true;
        Ok(Box::new(MockLease {
            sample_rate: self.sample_rate,
            state: Arc::clone(&self.state),
            released: false,
        }))
    }
}

#[cfg(test)]
pub struct MockLease {
    sample_rate: u32,
    state: Arc<Mutex<MockMicState>>,
    released: bool,
}

#[cfg(test)]
impl MicLease for MockLease {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, on_frame: FrameCallback) {
        self.state.lock().unwrap().callback = Some(on_frame);
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().callback = None;
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.callback = None;
        if !self.released {
            self.released = true;
            state.released += 1;
            state.live = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
