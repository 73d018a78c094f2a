//! Remote session abstraction.
//!
//! The session manager never talks to a socket directly. It asks a
//! [`RemoteConnector`] to open a session and then only uses the two send
//! primitives on the returned [`RemoteSession`]. Everything the remote side
//! says afterwards arrives as a [`RemoteEvent`] through the
//! [`RemoteEventSink`] handed to [`RemoteConnector::open`].
//!
//! `open` resolving successfully *is* the remote-open signal.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::remote::protocol::{AudioEnvelope, FunctionResponse, ServerMessage, SessionSetup};

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Errors raised by a connector or an open session.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no API key configured (set remote.api_key or LIVE_TUTOR_API_KEY)")]
    MissingApiKey,

    #[error("invalid session URL: {0}")]
    InvalidUrl(String),

    /// Transport-level failure while connecting or exchanging frames.
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("session setup was not acknowledged within {0}s")]
    SetupTimeout(u64),

    #[error("session closed during setup: {0}")]
    ClosedDuringSetup(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("session is closed")]
    Closed,

    #[error("malformed message: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl From<tungstenite::Error> for RemoteError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                RemoteError::Closed
            }
            other => RemoteError::Connect(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteEvent / RemoteEventSink
// ---------------------------------------------------------------------------

/// Signals emitted by an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Message(ServerMessage),
    /// The remote side closed the channel; carries the close reason if any.
    Closed(Option<String>),
    /// Transport or service error, as a human-readable message.
    Error(String),
}

/// Callback through which a session reports [`RemoteEvent`]s.
///
/// Cheap to clone; safe to call from any thread or task.
#[derive(Clone)]
pub struct RemoteEventSink {
    inner: Arc<dyn Fn(RemoteEvent) + Send + Sync>,
}

impl RemoteEventSink {
    pub fn new(f: impl Fn(RemoteEvent) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn emit(&self, event: RemoteEvent) {
        (self.inner)(event)
    }
}

impl std::fmt::Debug for RemoteEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RemoteEventSink")
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Opens remote sessions.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Open a session configured by `setup`. Resolves once the remote side is
    /// ready to receive audio.
    async fn open(
        &self,
        setup: SessionSetup,
        events: RemoteEventSink,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError>;
}

/// An open bidirectional session.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn send_audio(&self, chunk: AudioEnvelope) -> Result<(), RemoteError>;

    async fn send_tool_response(&self, response: FunctionResponse) -> Result<(), RemoteError>;

    /// Close the channel. Calling it more than once is allowed.
    async fn close(&self) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// MockConnector  (test-only)
// ---------------------------------------------------------------------------

/// What a [`MockSession`] was asked to send, in order.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Audio(AudioEnvelope),
    Tool(FunctionResponse),
}

#[cfg(test)]
#[derive(Default)]
pub struct MockSession {
    pub sent: std::sync::Mutex<Vec<Sent>>,
    pub closed: std::sync::atomic::AtomicBool,
    /// When set, every send fails.
    pub fail_sends: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MockSession {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn record(&self, item: Sent) -> Result<(), RemoteError> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RemoteError::Send("mock send failure".into()));
        }
        self.sent.lock().unwrap().push(item);
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteSession for MockSession {
    async fn send_audio(&self, chunk: AudioEnvelope) -> Result<(), RemoteError> {
        self.record(Sent::Audio(chunk))
    }

    async fn send_tool_response(&self, response: FunctionResponse) -> Result<(), RemoteError> {
        self.record(Sent::Tool(response))
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// A connector that opens [`MockSession`]s immediately and lets the test
/// inject remote events.
#[cfg(test)]
#[derive(Default)]
pub struct MockConnector {
    setups: std::sync::Mutex<Vec<SessionSetup>>,
    sessions: std::sync::Mutex<Vec<Arc<MockSession>>>,
    sinks: std::sync::Mutex<Vec<RemoteEventSink>>,
    fail_with: std::sync::Mutex<Option<String>>,
}

#[cfg(test)]
impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every subsequent `open` fails with `message`.
    pub fn fail_opens(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn open_count(&self) -> usize {
        self.setups.lock().unwrap().len()
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        self.setups.lock().unwrap().clone()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index])
    }

    pub fn last_session(&self) -> Arc<MockSession> {
        let sessions = self.sessions.lock().unwrap();
        Arc::clone(sessions.last().expect("no session opened"))
    }

    /// Deliver `event` through the most recently opened session.
    pub fn emit(&self, event: RemoteEvent) {
        let sink = self.sinks.lock().unwrap().last().cloned();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    /// Deliver `event` through the session opened at `index`.
    pub fn emit_on(&self, index: usize, event: RemoteEvent) {
        let sink = self.sinks.lock().unwrap()[index].clone();
        sink.emit(event);
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteConnector for MockConnector {
    async fn open(
        &self,
        setup: SessionSetup,
        events: RemoteEventSink,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        self.setups.lock().unwrap().push(setup);
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(RemoteError::Connect(message));
        }
        let session = Arc::new(MockSession::default());
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        self.sinks.lock().unwrap().push(events);
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
