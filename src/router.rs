//! # Message Router
//!
//! Dispatches inbound server messages to the parts of the session that care
//! about them, and keeps the transcript and tool-call bookkeeping.
//!
//! ## Routing table:
//! - `audio_output` → decode request, tagged with the current playback epoch
//! - `user_interruption`, final `user_message` → interrupt playback
//! - `assistant_message` → held until its utterance starts playing
//! - `assistant_end` → release held messages that never got audio
//! - `tool_call` / `tool_response` / `tool_error` → tool status updates
//! - `chat_metadata` → chat identifiers
//! - `error` → remote error surfaced to the coordinator
//!
//! ## Playback epochs:
//! Decoding runs off the event loop and finishes out of order. Every
//! interruption bumps the epoch, and decoded fragments carrying an older
//! epoch are dropped instead of reaching the reorder buffer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::audio::fragment::AudioFragment;
use crate::audio::reorder::ChunkReorderBuffer;
use crate::config::SessionConfig;
use crate::error::SocketError;
use crate::transport::{ChatMessage, InboundEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One line of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    /// Utterance whose audio carries this message (assistant only)
    pub utterance_id: Option<String>,
    pub interim: bool,
    pub received_at: DateTime<Utc>,
}

impl TranscriptEntry {
    fn new(role: Role, message: &ChatMessage, utterance_id: Option<String>, interim: bool) -> Self {
        Self {
            role,
            content: message.content.clone(),
            utterance_id,
            interim,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Succeeded { content: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallStatus {
    pub call_id: String,
    pub name: String,
    pub parameters: String,
    pub state: ToolCallState,
}

/// Audio payload waiting to be decoded off the event loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRequest {
    pub utterance_id: String,
    pub fragment_index: u32,
    pub payload: String,
    pub epoch: u64,
}

/// What the coordinator must do after routing a message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Decode(DecodeRequest),
    /// Stop playback; the router has already reset its ordering state
    Interrupt,
    RemoteError(SocketError),
    Handled,
}

/// Bounded set of recently seen utterance ids.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: &str) {
        if self.ids.contains(id) {
            return;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

pub struct MessageRouter {
    reorder: ChunkReorderBuffer<AudioFragment>,
    epoch: u64,
    history: Vec<TranscriptEntry>,
    pending_assistant: Vec<TranscriptEntry>,
    audio_received: RecentIds,
    audio_started: RecentIds,
    tool_calls: HashMap<String, ToolCallStatus>,
    chat_id: Option<String>,
    chat_group_id: Option<String>,
}

impl MessageRouter {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            reorder: ChunkReorderBuffer::new(
                config.max_tracked_utterances,
                config.max_held_fragments,
            ),
            epoch: 0,
            history: Vec::new(),
            pending_assistant: Vec::new(),
            audio_received: RecentIds::new(config.max_tracked_utterances * 4),
            audio_started: RecentIds::new(config.max_tracked_utterances * 4),
            tool_calls: HashMap::new(),
            chat_id: None,
            chat_group_id: None,
        }
    }

    /// Route one inbound message.
    pub fn route(&mut self, event: &InboundEvent) -> RouteOutcome {
        match event {
            InboundEvent::AudioOutput { id, index, data } => {
                self.audio_received.insert(id);
                RouteOutcome::Decode(DecodeRequest {
                    utterance_id: id.clone(),
                    fragment_index: *index,
                    payload: data.clone(),
                    epoch: self.epoch,
                })
            }
            InboundEvent::UserInterruption => {
                self.interrupt();
                RouteOutcome::Interrupt
            }
            InboundEvent::UserMessage { message, interim } => {
                if *interim {
                    return RouteOutcome::Handled;
                }
                self.history
                    .push(TranscriptEntry::new(Role::User, message, None, false));
                self.interrupt();
                RouteOutcome::Interrupt
            }
            InboundEvent::AssistantMessage { id, message } => {
                let entry = TranscriptEntry::new(Role::Assistant, message, id.clone(), false);
                match id {
                    Some(id) if !self.audio_started.contains(id) => {
                        self.pending_assistant.push(entry);
                    }
                    _ => self.history.push(entry),
                }
                RouteOutcome::Handled
            }
            InboundEvent::AssistantEnd => {
                self.release_silent_messages();
                RouteOutcome::Handled
            }
            InboundEvent::ToolCall {
                tool_call_id,
                name,
                parameters,
            } => {
                info!("Tool call {} requested: {}", tool_call_id, name);
                self.tool_calls.insert(
                    tool_call_id.clone(),
                    ToolCallStatus {
                        call_id: tool_call_id.clone(),
                        name: name.clone(),
                        parameters: parameters.clone(),
                        state: ToolCallState::Pending,
                    },
                );
                RouteOutcome::Handled
            }
            InboundEvent::ToolResponse {
                tool_call_id,
                content,
            } => {
                self.resolve_tool(
                    tool_call_id,
                    ToolCallState::Succeeded {
                        content: content.clone(),
                    },
                );
                RouteOutcome::Handled
            }
            InboundEvent::ToolError {
                tool_call_id,
                error,
                ..
            } => {
                self.resolve_tool(
                    tool_call_id,
                    ToolCallState::Failed {
                        error: error.clone(),
                    },
                );
                RouteOutcome::Handled
            }
            InboundEvent::ChatMetadata {
                chat_id,
                chat_group_id,
            } => {
                self.chat_id = Some(chat_id.clone());
                self.chat_group_id = chat_group_id.clone();
                RouteOutcome::Handled
            }
            InboundEvent::Error { code, message } => {
                RouteOutcome::RemoteError(SocketError::RemoteErrorMessage {
                    code: code.clone(),
                    message: message.clone(),
                })
            }
            InboundEvent::Unknown => {
                debug!("Ignoring unhandled server message");
                RouteOutcome::Handled
            }
        }
    }

    /// Feed a decoded fragment to the reorder buffer.
    ///
    /// Returns the fragments that are now playable, or nothing if the
    /// fragment belongs to playback that was interrupted since.
    pub fn register_decoded(&mut self, fragment: AudioFragment, epoch: u64) -> Vec<AudioFragment> {
        if epoch != self.epoch {
            debug!(
                "Dropping fragment {}#{} from interrupted playback",
                fragment.utterance_id, fragment.fragment_index
            );
            return Vec::new();
        }
        let utterance_id = fragment.utterance_id.clone();
        self.reorder
            .register(&utterance_id, fragment.fragment_index, fragment)
    }

    /// An utterance started playing: its held assistant messages join the
    /// transcript. Returns the entries released.
    pub fn on_playback_started(&mut self, utterance_id: &str) -> Vec<TranscriptEntry> {
        self.audio_started.insert(utterance_id);
        let (released, held): (Vec<_>, Vec<_>) = self
            .pending_assistant
            .drain(..)
            .partition(|entry| entry.utterance_id.as_deref() == Some(utterance_id));
        self.pending_assistant = held;
        self.history.extend(released.iter().cloned());
        released
    }

    /// Discard ordering state and invalidate in-flight decodes.
    pub fn interrupt(&mut self) {
        self.epoch += 1;
        self.reorder.reset();
        // Interrupted speech never plays, but its text still belongs in the transcript
        self.history.append(&mut self.pending_assistant);
    }

    /// Forget transcript, tool calls and chat identifiers.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.pending_assistant.clear();
        self.audio_received.clear();
        self.audio_started.clear();
        self.tool_calls.clear();
        self.chat_id = None;
        self.chat_group_id = None;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn history(&self) -> &[TranscriptEntry] {
        &self.history
    }

    pub fn tool_status(&self, call_id: &str) -> Option<&ToolCallStatus> {
        self.tool_calls.get(call_id)
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn chat_group_id(&self) -> Option<&str> {
        self.chat_group_id.as_deref()
    }

    fn release_silent_messages(&mut self) {
        let audio_received = &self.audio_received;
        let (silent, voiced): (Vec<_>, Vec<_>) =
            self.pending_assistant.drain(..).partition(|entry| {
                entry
                    .utterance_id
                    .as_deref()
                    .map_or(true, |id| !audio_received.contains(id))
            });
        self.pending_assistant = voiced;
        self.history.extend(silent);
    }

    fn resolve_tool(&mut self, call_id: &str, state: ToolCallState) {
        match self.tool_calls.get_mut(call_id) {
            Some(status) => status.state = state,
            None => {
                warn!("Result for unknown tool call {}", call_id);
                self.tool_calls.insert(
                    call_id.to_string(),
                    ToolCallStatus {
                        call_id: call_id.to_string(),
                        name: String::new(),
                        parameters: String::new(),
                        state,
                    },
                );
            }
        }
    }
}
