//! Remote speech session: wire models, the transport abstraction, the
//! session instruction, and the reference WebSocket transport.

pub mod connector;
pub mod prompt;
pub mod protocol;
pub mod tools;
pub mod websocket;

pub use connector::{RemoteConnector, RemoteError, RemoteEvent, RemoteEventSink, RemoteSession};
pub use prompt::InstructionBuilder;
pub use protocol::{AudioEnvelope, FunctionCall, FunctionResponse, ServerMessage, SessionSetup};
pub use websocket::WebSocketConnector;

#[cfg(test)]
pub use connector::{MockConnector, MockSession, Sent};
