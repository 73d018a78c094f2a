//! Gapless scheduling of inbound audio chunks.
//!
//! Every decoded chunk becomes one *voice* on an [`AudioSink`]. The
//! [`PlaybackScheduler`] starts each voice at `max(next_start, now)` and then
//! moves `next_start` forward by the chunk's duration, so chunks play back to
//! back in arrival order even when decoding jitters:
//!
//! ```text
//! now ─┐
//!      ▼
//!      [ chunk 1 ][ chunk 2 ][ chunk 3 ]
//!                                       ▲ next_start
//! ```
//!
//! Voices leave the live set when the sink reports they ended naturally, or
//! all at once on [`PlaybackScheduler::interrupt`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Identifies one scheduled chunk on a sink.
pub type VoiceId = u64;

/// Called by a sink, from any thread, when a voice finished by itself.
pub type VoiceEndedCallback = Arc<dyn Fn(VoiceId) + Send + Sync>;

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no output device found on the default audio host")]
    NoDevice,

    #[error("failed to query default output config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to list output configs: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("sample-rate conversion failed: {0}")]
    Convert(String),

    #[error("output thread exited before the stream was ready")]
    ThreadGone,

    #[error("output sink is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Read access to what the sink played most recently.
pub trait OutputTap: Send + Sync {
    /// The analysis window, oldest sample first.
    fn recent_samples(&self) -> Vec<f32>;
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Open a sink that accepts mono chunks at `sample_rate`.
    async fn open(
        &self,
        sample_rate: u32,
        on_ended: VoiceEndedCallback,
    ) -> Result<Box<dyn AudioSink>, PlaybackError>;
}

/// An open output with its own clock.
pub trait AudioSink: Send {
    /// Rate of the chunks passed to `start_voice`.
    fn sample_rate(&self) -> u32;

    /// Seconds of audio played since the sink opened.
    fn current_time(&self) -> f64;

    /// Play `samples` starting at `start_at` on the sink clock. A start time
    /// already in the past means "now".
    fn start_voice(
        &mut self,
        id: VoiceId,
        samples: Vec<f32>,
        start_at: f64,
    ) -> Result<(), PlaybackError>;

    /// Silence a voice. Unknown or finished ids are ignored. Does not
    /// trigger the ended callback.
    fn stop_voice(&mut self, id: VoiceId);

    fn tap(&self) -> Arc<dyn OutputTap>;

    /// Release the device. Idempotent.
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// PlaybackScheduler
// ---------------------------------------------------------------------------

pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    next_start: f64,
    live: HashSet<VoiceId>,
    next_id: VoiceId,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            sink,
            next_start: 0.0,
            live: HashSet::new(),
            next_id: 1,
            closed: false,
        }
    }

    /// Schedule `samples` right after everything already queued. Empty
    /// chunks schedule nothing and return `None`.
    pub fn enqueue(&mut self, samples: Vec<f32>) -> Result<Option<VoiceId>, PlaybackError> {
        if self.closed {
            return Err(PlaybackError::Closed);
        }
        if samples.is_empty() {
            return Ok(None);
        }

        let duration = samples.len() as f64 / f64::from(self.sink.sample_rate().max(1));
        let start = self.next_start.max(self.sink.current_time());
        let id = self.next_id;
        self.next_id += 1;

        self.sink.start_voice(id, samples, start)?;
        self.next_start = start + duration;
        self.live.insert(id);
        Ok(Some(id))
    }

    /// A voice finished by itself.
    pub fn on_voice_ended(&mut self, id: VoiceId) {
        self.live.remove(&id);
    }

    /// Barge-in: silence everything and forget the queue position.
    pub fn interrupt(&mut self) {
        self.stop_all();
        self.next_start = 0.0;
    }

    pub fn stop_all(&mut self) {
        for id in self.live.drain() {
            self.sink.stop_voice(id);
        }
    }

    pub fn close(&mut self) {
        self.stop_all();
        if !self.closed {
            self.sink.close();
            self.closed = true;
        }
    }

    pub fn live_voices(&self) -> usize {
        self.live.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start
    }

    pub fn current_time(&self) -> f64 {
        self.sink.current_time()
    }

    pub fn tap(&self) -> Arc<dyn OutputTap> {
        self.sink.tap()
    }
}

// ---------------------------------------------------------------------------
// MockOutput  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct MockVoice {
    pub id: VoiceId,
    pub start_at: f64,
    pub len: usize,
    pub stopped: bool,
    pub ended: bool,
}

#[cfg(test)]
#[derive(Default)]
pub struct MockSinkState {
    pub now: f64,
    pub voices: Vec<MockVoice>,
    pub opened: usize,
    pub closed: usize,
    pub tap_samples: Vec<f32>,
    pub on_ended: Option<VoiceEndedCallback>,
}

/// Output whose clock only moves when the test says so.
#[cfg(test)]
#[derive(Default)]
pub struct MockOutput {
    state: Arc<std::sync::Mutex<MockSinkState>>,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MockOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_opens(&self) {
        self.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_time(&self, now: f64) {
        self.state.lock().unwrap().now = now;
    }

    pub fn set_tap_samples(&self, samples: Vec<f32>) {
        self.state.lock().unwrap().tap_samples = samples;
    }

    pub fn voices(&self) -> Vec<MockVoice> {
        self.state.lock().unwrap().voices.clone()
    }

    /// Voices neither stopped nor ended.
    pub fn playing(&self) -> Vec<VoiceId> {
        self.state
            .lock()
            .unwrap()
            .voices
            .iter()
            .filter(|v| !v.stopped && !v.ended)
            .map(|v| v.id)
            .collect()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    /// Let voice `id` end naturally and report it.
    pub fn finish(&self, id: VoiceId) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            if let Some(v) = state.voices.iter_mut().find(|v| v.id == id) {
                v.ended = true;
            }
            state.on_ended.clone()
        };
        if let Some(cb) = callback {
            cb(id);
        }
    }
}

#[cfg(test)]
#[async_trait]
impl AudioOutput for MockOutput {
    async fn open(
        &self,
        sample_rate: u32,
        on_ended: VoiceEndedCallback,
    ) -> Result<Box<dyn AudioSink>, PlaybackError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PlaybackError::NoDevice);
        }
        let mut state = self.state.lock().unwrap();
        state.opened += 1;
        state.voices.clear();
        state.on_ended = Some(on_ended);
        Ok(Box::new(MockSink {
            sample_rate,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

#[cfg(test)]
struct MockSink {
    sample_rate: u32,
    state: Arc<std::sync::Mutex<MockSinkState>>,
    closed: bool,
}

#[cfg(test)]
struct MockTap(Arc<std::sync::Mutex<MockSinkState>>);

#[cfg(test)]
impl OutputTap for MockTap {
    fn recent_samples(&self) -> Vec<f32> {
        self.0.lock().unwrap().tap_samples.clone()
    }
}

#[cfg(test)]
impl AudioSink for MockSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn start_voice(
        &mut self,
        id: VoiceId,
        samples: Vec<f32>,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        if self.closed {
            return Err(PlaybackError::Closed);
        }
        self.state.lock().unwrap().voices.push(MockVoice {
            id,
            start_at,
            len: samples.len(),
            stopped: false,
            ended: false,
        });
        Ok(())
    }

    fn stop_voice(&mut self, id: VoiceId) {
        let mut state = self.state.lock().unwrap();
        if let Some(v) = state.voices.iter_mut().find(|v| v.id == id) {
            v.stopped = true;
        }
    }

    fn tap(&self) -> Arc<dyn OutputTap> {
        Arc::new(MockTap(Arc::clone(&self.state)))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().closed += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
