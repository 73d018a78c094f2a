//! Wire models for the remote speech session.
//!
//! Only the fields the session manager reads are modelled; everything else
//! in an inbound frame is ignored by serde.
//!
//! Inbound shape (every part optional):
//!
//! ```text
//! {
//!   "serverContent": {
//!     "inputTranscription": { "text": "..." },
//!     "turnComplete": true,
//!     "interrupted": true,
//!     "modelTurn": { "parts": [ { "inlineData": { "mimeType": "...", "data": "<b64>" } } ] }
//!   },
//!   "toolCall": { "functionCalls": [ { "id": "1", "name": "update_subtitles", "args": {..} } ] }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Outbound primitives
// ---------------------------------------------------------------------------

/// One encoded uplink audio chunk: base64 PCM16 plus its declared format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEnvelope {
    pub data: String,
    pub mime_type: String,
}

/// Generic success payload echoed for every tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub result: String,
}

/// Acknowledgment of a single tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: ToolResult,
}

impl FunctionResponse {
    /// `{id, name, response: {result: "ok"}}` for the given invocation.
    pub fn ok(call: &FunctionCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            response: ToolResult {
                result: "ok".into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ServerMessage {
    pub fn transcription_fragment(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .input_transcription
            .as_ref()
            .map(|t| t.text.as_str())
    }

    pub fn turn_complete(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.turn_complete)
    }

    pub fn interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    pub fn function_calls(&self) -> &[FunctionCall] {
        self.tool_call
            .as_ref()
            .map(|t| t.function_calls.as_slice())
            .unwrap_or(&[])
    }

    /// Base64 audio payloads carried by the model turn, in part order.
    pub fn audio_payloads(&self) -> impl Iterator<Item = &str> {
        self.server_content
            .iter()
            .filter_map(|c| c.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .map(|blob| blob.data.as_str())
    }
}

// ---------------------------------------------------------------------------
// Session setup
// ---------------------------------------------------------------------------

/// Everything a connector needs to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Tool declarations (`functionDeclarations` entries).
    pub tools: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tool_call() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "toolCall": {"functionCalls": [
                {"id": "1", "name": "update_subtitles",
                 "args": {"hanzi": "你好", "pinyin": "nǐ hǎo", "english": "hello"}}
            ]}
        }))
        .unwrap();

        let calls = msg.function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "1");
        assert_eq!(calls[0].args["hanzi"], "你好");
        assert!(!msg.interrupted());
    }

    #[test]
    fn parses_server_content_flags_and_audio() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "serverContent": {
                "inputTranscription": {"text": "ni hao"},
                "turnComplete": true,
                "modelTurn": {"parts": [
                    {"text": "ignored"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}}
                ]}
            }
        }))
        .unwrap();

        assert_eq!(msg.transcription_fragment(), Some("ni hao"));
        assert!(msg.turn_complete());
        assert_eq!(msg.audio_payloads().collect::<Vec<_>>(), vec!["AAA="]);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg: ServerMessage =
            serde_json::from_value(json!({"usageMetadata": {"totalTokenCount": 3}})).unwrap();
        assert_eq!(msg, ServerMessage::default());
        assert!(msg.function_calls().is_empty());
    }

    #[test]
    fn ack_echoes_id_and_name() {
        let call = FunctionCall {
            id: "7".into(),
            name: "provide_pronunciation_feedback".into(),
            args: Value::Null,
        };
        let ack = serde_json::to_value(FunctionResponse::ok(&call)).unwrap();
        assert_eq!(
            ack,
            json!({"id": "7", "name": "provide_pronunciation_feedback", "response": {"result": "ok"}})
        );
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let env = AudioEnvelope {
            data: "AAAA".into(),
            mime_type: "audio/pcm;rate=16000".into(),
        };
        assert_eq!(
            serde_json::to_value(env).unwrap(),
            json!({"data": "AAAA", "mimeType": "audio/pcm;rate=16000"})
        );
    }
}
