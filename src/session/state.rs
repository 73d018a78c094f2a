//! Session phases and the events a session reports to its consumer.
//!
//! [`Phase`] is the manager's internal state. Consumers only ever see the
//! coarser [`ConnectionState`]:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──remote open──▶ Connected
//!                               │                          │
//!                               │        recoverable fault │
//!                               │      Recovering ◀────────┘   (reported as Connecting)
//!                               │          │ reconnect
//!                               ▼          ▼
//!                             Error ◀── fatal fault ── any active phase
//!
//! disconnect / remote close ──▶ Disconnected   (Error is kept)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Disconnected,
    /// Acquiring devices and opening the remote session.
    Connecting,
    Connected,
    /// Torn down after a recoverable fault; waiting to reconnect.
    Recovering { attempt: u32 },
    /// A fatal fault was reported. Kept until the next `connect`.
    Error { message: String },
}

impl Phase {
    pub fn external(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting | Phase::Recovering { .. } => ConnectionState::Connecting,
            Phase::Connected => ConnectionState::Connected,
            Phase::Error { .. } => ConnectionState::Error,
        }
    }

    /// Holds (or is about to hold) devices and a remote session.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Phase::Connecting | Phase::Connected | Phase::Recovering { .. }
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Phase::Error { .. })
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Disconnected
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// What the tutor just said, in three forms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subtitle {
    pub hanzi: String,
    pub pinyin: String,
    pub english: String,
}

impl Subtitle {
    pub fn from_args(args: &Value) -> Result<Self, serde_json::Error> {
        Subtitle::deserialize(args)
    }
}

/// The tutor's grading of one learner utterance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PronunciationFeedback {
    pub user_text: String,
    pub pinyin: String,
    /// 0 to 100.
    pub score: f32,
    pub feedback: String,
}

impl PronunciationFeedback {
    /// Parse tool arguments. Out-of-range scores are clamped into `[0, 100]`.
    pub fn from_args(args: &Value) -> Result<Self, serde_json::Error> {
        let mut feedback = PronunciationFeedback::deserialize(args)?;
        feedback.score = if feedback.score.is_finite() {
            feedback.score.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Ok(feedback)
    }
}

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

/// Everything a session reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Subtitle(Subtitle),
    PronunciationFeedback(PronunciationFeedback),
    /// One complete learner turn, trimmed.
    UserTranscript(String),
    /// Output level in `[0.0, 1.0]`.
    Volume(f32),
    /// `fatal: false` marks an advisory; the session carries on.
    Error { message: String, fatal: bool },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
