//! # Wire Messages
//!
//! JSON text frames exchanged with the voice server. Every message carries a
//! `type` tag; binary frames carry raw microphone audio and are not modelled
//! here.
//!
//! ## Inbound (server → client):
//! - `audio_output`: one base64 audio fragment of an utterance
//! - `user_message` / `assistant_message`: transcript entries
//! - `assistant_end`: the assistant finished its turn
//! - `user_interruption`: the user spoke over the assistant
//! - `tool_call` / `tool_response` / `tool_error`: tool invocation lifecycle
//! - `chat_metadata`: identifiers of the chat
//! - `error`: a server-side failure
//!
//! ## Outbound (client → server):
//! - `pause_assistant_message` / `resume_assistant_message`
//! - `user_input`: typed text
//! - `tool_response` / `tool_error`: results of client-side tools

use serde::{Deserialize, Serialize};

/// Role and text of a transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    AudioOutput {
        /// Utterance the fragment belongs to
        id: String,
        /// Position of the fragment within the utterance
        index: u32,
        /// Base64 encoded WAV or PCM16 audio
        data: String,
    },
    UserMessage {
        message: ChatMessage,
        #[serde(default)]
        interim: bool,
    },
    AssistantMessage {
        /// Utterance whose audio speaks this message
        #[serde(default)]
        id: Option<String>,
        message: ChatMessage,
    },
    AssistantEnd,
    UserInterruption,
    ToolCall {
        tool_call_id: String,
        name: String,
        #[serde(default)]
        parameters: String,
    },
    ToolResponse {
        tool_call_id: String,
        content: String,
    },
    ToolError {
        tool_call_id: String,
        error: String,
        #[serde(default)]
        content: Option<String>,
    },
    ChatMetadata {
        chat_id: String,
        #[serde(default)]
        chat_group_id: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
    /// Any message type this client does not handle
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::AudioOutput { .. } => "audio_output",
            InboundEvent::UserMessage { .. } => "user_message",
            InboundEvent::AssistantMessage { .. } => "assistant_message",
            InboundEvent::AssistantEnd => "assistant_end",
            InboundEvent::UserInterruption => "user_interruption",
            InboundEvent::ToolCall { .. } => "tool_call",
            InboundEvent::ToolResponse { .. } => "tool_response",
            InboundEvent::ToolError { .. } => "tool_error",
            InboundEvent::ChatMetadata { .. } => "chat_metadata",
            InboundEvent::Error { .. } => "error",
            InboundEvent::Unknown => "unknown",
        }
    }
}

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    PauseAssistantMessage,
    ResumeAssistantMessage,
    UserInput {
        text: String,
    },
    ToolResponse {
        tool_call_id: String,
        content: String,
    },
    ToolError {
        tool_call_id: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_output() {
        let json = r#"{"type":"audio_output","id":"utt-7","index":2,"data":"AAAA"}"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            InboundEvent::AudioOutput {
                id: "utt-7".to_string(),
                index: 2,
                data: "AAAA".to_string()
            }
        );
        assert_eq!(event.kind(), "audio_output");
    }

    #[test]
    fn test_parse_messages_with_extra_fields() {
        let json = r#"{
            "type": "assistant_message",
            "id": "utt-1",
            "message": {"role": "assistant", "content": "Hello"},
            "models": {"prosody": {}}
        }"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        match event {
            InboundEvent::AssistantMessage { id, message } => {
                assert_eq!(id.as_deref(), Some("utt-1"));
                assert_eq!(message.content, "Hello");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let json = r#"{"type":"user_message","message":{"role":"user","content":"hi"},"interim":true}"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, InboundEvent::UserMessage { interim: true, .. }));
    }

    #[test]
    fn test_unit_and_unknown_types() {
        let end: InboundEvent = serde_json::from_str(r#"{"type":"assistant_end"}"#).unwrap();
        assert_eq!(end, InboundEvent::AssistantEnd);

        let unknown: InboundEvent =
            serde_json::from_str(r#"{"type":"session_settings_ack"}"#).unwrap();
        assert_eq!(unknown, InboundEvent::Unknown);
    }

    #[test]
    fn test_parse_error_message() {
        let json = r#"{"type":"error","code":"E0710","message":"quota exceeded"}"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            InboundEvent::Error {
                code: "E0710".to_string(),
                message: "quota exceeded".to_string()
            }
        );
    }

    #[test]
    fn test_outbound_serialization() {
        let pause = serde_json::to_value(OutboundMessage::PauseAssistantMessage).unwrap();
        assert_eq!(pause, serde_json::json!({"type": "pause_assistant_message"}));

        let error = serde_json::to_value(OutboundMessage::ToolError {
            tool_call_id: "call-1".to_string(),
            error: "timeout".to_string(),
            content: None,
        })
        .unwrap();
        assert_eq!(
            error,
            serde_json::json!({"type": "tool_error", "tool_call_id": "call-1", "error": "timeout"})
        );
    }
}
