//! WebSocket transport for the remote session.
//!
//! Protocol, all frames JSON:
//!
//! ```text
//! client → {"setup": {...}}                          (once, right after connect)
//! server → {"setupComplete": {}}                     (session is open)
//! client → {"realtimeInput": {"audio": {data, mimeType}}}
//! client → {"toolResponse": {"functionResponses": [{id, name, response}]}}
//! server → ServerMessage                             (text or binary frames)
//! ```
//!
//! A close frame with a normal/going-away code is reported as
//! [`RemoteEvent::Closed`]; any other close code carries a service error in
//! its reason and is reported as [`RemoteEvent::Error`] so it can be
//! classified like a socket error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::RemoteConfig;
use crate::remote::connector::{
    RemoteConnector, RemoteError, RemoteEvent, RemoteEventSink, RemoteSession,
};
use crate::remote::protocol::{AudioEnvelope, FunctionResponse, ServerMessage, SessionSetup};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// ---------------------------------------------------------------------------
// WebSocketConnector
// ---------------------------------------------------------------------------

/// Opens sessions over a WebSocket. All connection details come from
/// [`RemoteConfig`].
pub struct WebSocketConnector {
    config: RemoteConfig,
}

impl WebSocketConnector {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Session URL with the API key appended as the `key` query parameter.
    fn endpoint(&self) -> Result<String, RemoteError> {
        let key = self
            .config
            .resolved_api_key()
            .ok_or(RemoteError::MissingApiKey)?;

        let url = self.config.url.trim();
        if !(url.starts_with("wss://") || url.starts_with("ws://")) {
            return Err(RemoteError::InvalidUrl(url.to_string()));
        }

        let separator = if url.contains('?') { '&' } else { '?' };
        Ok(format!("{url}{separator}key={key}"))
    }
}

/// The `{"setup": ...}` message for `setup`.
pub fn setup_message(setup: &SessionSetup) -> Value {
    json!({
        "setup": {
            "model": setup.model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": setup.voice } }
                }
            },
            "systemInstruction": { "parts": [ { "text": setup.system_instruction } ] },
            "tools": [ { "functionDeclarations": setup.tools } ],
            "inputAudioTranscription": {}
        }
    })
}

#[async_trait]
impl RemoteConnector for WebSocketConnector {
    async fn open(
        &self,
        setup: SessionSetup,
        events: RemoteEventSink,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let url = self.endpoint()?;
        log::debug!("remote: connecting to {}", self.config.url);

        let (stream, _response) = connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();

        sink.send(Message::Text(setup_message(&setup).to_string().into()))
            .await?;

        let secs = self.config.connect_timeout_secs;
        tokio::time::timeout(Duration::from_secs(secs), wait_for_setup(&mut source))
            .await
            .map_err(|_| RemoteError::SetupTimeout(secs))??;

        log::info!("remote: session open (model {})", setup.model);

        let reader = tokio::spawn(read_loop(source, events));
        Ok(Arc::new(WebSocketSession {
            sink: tokio::sync::Mutex::new(Some(sink)),
            reader: std::sync::Mutex::new(Some(reader)),
        }))
    }
}

async fn wait_for_setup(source: &mut WsSource) -> Result<(), RemoteError> {
    while let Some(frame) = source.next().await {
        let msg = match frame? {
            Message::Text(text) => parse(text.as_bytes())?,
            Message::Binary(bytes) => parse(&bytes)?,
            Message::Close(frame) => {
                return Err(RemoteError::ClosedDuringSetup(
                    close_reason(frame.as_ref()).unwrap_or_else(|| "no reason given".into()),
                ))
            }
            _ => continue,
        };
        if msg.setup_complete.is_some() {
            return Ok(());
        }
    }
    Err(RemoteError::ClosedDuringSetup("stream ended".into()))
}

async fn read_loop(mut source: WsSource, events: RemoteEventSink) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => forward(text.as_bytes(), &events),
            Ok(Message::Binary(bytes)) => forward(&bytes, &events),
            Ok(Message::Close(frame)) => {
                events.emit(close_event(frame.as_ref()));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                events.emit(RemoteEvent::Error(e.to_string()));
                return;
            }
        }
    }
    events.emit(RemoteEvent::Closed(None));
}

fn parse(bytes: &[u8]) -> Result<ServerMessage, RemoteError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn forward(bytes: &[u8], events: &RemoteEventSink) {
    match parse(bytes) {
        Ok(msg) => events.emit(RemoteEvent::Message(msg)),
        Err(e) => log::warn!("remote: skipping unparseable frame: {e}"),
    }
}

fn close_reason(frame: Option<&CloseFrame>) -> Option<String> {
    frame
        .map(|f| f.reason.as_str().trim().to_string())
        .filter(|r| !r.is_empty())
}

fn close_event(frame: Option<&CloseFrame>) -> RemoteEvent {
    let reason = close_reason(frame);
    match frame.map(|f| f.code) {
        None | Some(CloseCode::Normal) | Some(CloseCode::Away) => RemoteEvent::Closed(reason),
        Some(code) => RemoteEvent::Error(
            reason.unwrap_or_else(|| format!("connection closed with code {code}")),
        ),
    }
}

// ---------------------------------------------------------------------------
// WebSocketSession
// ---------------------------------------------------------------------------

struct WebSocketSession {
    sink: tokio::sync::Mutex<Option<WsSink>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketSession {
    async fn send_json(&self, value: Value) -> Result<(), RemoteError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(RemoteError::Closed)?;
        sink.send(Message::Text(value.to_string().into()))
            .await
            .map_err(|e| RemoteError::Send(e.to_string()))
    }
}

#[async_trait]
impl RemoteSession for WebSocketSession {
    async fn send_audio(&self, chunk: AudioEnvelope) -> Result<(), RemoteError> {
        self.send_json(json!({ "realtimeInput": { "audio": chunk } }))
            .await
    }

    async fn send_tool_response(&self, response: FunctionResponse) -> Result<(), RemoteError> {
        self.send_json(json!({ "toolResponse": { "functionResponses": [response] } }))
            .await
    }

    async fn close(&self) -> Result<(), RemoteError> {
        // Stop forwarding first so our own close is not reported back.
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.send(Message::Close(None)).await;
            sink.close().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
