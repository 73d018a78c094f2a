//! Session lifecycle: the actor that ties microphone, playback and remote
//! session together, plus the types it reports through.
//!
//! ```text
//!  SessionHandle ──commands──▶ SessionManager ──SessionEvent──▶ consumer
//!                                 │    ▲
//!              mic frames, voice  │    │ remote events, timers
//!              ends, meter ticks ─┘    │
//!                                 ▼    │
//!                             UplinkQueue ──▶ RemoteSession
//! ```
//!
//! | Module   | Contents                                              |
//! |----------|-------------------------------------------------------|
//! | `state`  | [`Phase`], [`ConnectionState`], [`SessionEvent`]      |
//! | `fault`  | [`FaultClassifier`]: transient / recoverable / fatal  |
//! | `uplink` | [`UplinkQueue`]: ordered, serialized sends            |
//! | `runner` | [`SessionManager`], [`SessionHandle`]                 |

pub mod fault;
pub mod runner;
pub mod state;
pub mod uplink;

pub use fault::{FaultClass, FaultClassifier};
pub use runner::{SessionHandle, SessionManager};
pub use state::{ConnectionState, Phase, PronunciationFeedback, SessionEvent, Subtitle};
pub use uplink::{UplinkAction, UplinkQueue};
