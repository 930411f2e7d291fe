//! Shared types for the agent core.
//!
//! Conversation turns, pending tool calls and the per-turn lifecycle state
//! used by the conversation store and the correlator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::ChannelId;
use crate::inference::types::{ChatMessage, Role, ToolCallResponse, ToolInvocation};

// ─── Conversation Turns ─────────────────────────────────────────────────────

/// One logical message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    System {
        content: String,
    },
    User {
        content: String,
    },
    /// Model output. Text, tool calls, or both.
    Assistant {
        content: Option<String>,
        #[serde(default)]
        tool_calls: Vec<ToolInvocation>,
    },
    /// The answer to one `ToolInvocation`.
    ToolResult {
        tool_call_id: String,
        name: String,
        success: bool,
        result: serde_json::Value,
    },
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Turn::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Turn::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Invocation IDs defined by this turn (assistant turns only).
    pub fn invocation_ids(&self) -> impl Iterator<Item = &str> {
        let calls: &[ToolInvocation] = match self {
            Turn::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        };
        calls.iter().map(|c| c.id.as_str())
    }

    /// Invocation ID this turn answers (tool-result turns only).
    pub fn referenced_invocation(&self) -> Option<&str> {
        match self {
            Turn::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    /// Convert to the provider wire format.
    ///
    /// Tool results are sent as the JSON text `{"success": .., "result": ..}`.
    pub fn to_chat_message(&self) -> ChatMessage {
        match self {
            Turn::System { content } => ChatMessage {
                role: Role::System,
                content: Some(content.clone()),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
            Turn::User { content } => ChatMessage {
                role: Role::User,
                content: Some(content.clone()),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
            Turn::Assistant {
                content,
                tool_calls,
            } => ChatMessage {
                role: Role::Assistant,
                content: content.clone(),
                name: None,
                tool_call_id: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls.iter().map(ToolCallResponse::from).collect())
                },
            },
            Turn::ToolResult {
                tool_call_id,
                name,
                success,
                result,
            } => ChatMessage {
                role: Role::Tool,
                content: Some(
                    serde_json::json!({ "success": success, "result": result }).to_string(),
                ),
                name: Some(name.clone()),
                tool_call_id: Some(tool_call_id.clone()),
                tool_calls: None,
            },
        }
    }
}

// ─── Pending Calls ──────────────────────────────────────────────────────────

/// A tool call dispatched to a game server and awaiting its result.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    /// Provider-issued ID, or the caller's message ID for direct dispatch.
    pub invocation_id: String,
    /// The chat `message_id` whose chain this call belongs to.
    pub originating_turn_id: String,
    /// Conversation key; `None` for direct dispatch.
    pub player_id: Option<String>,
    /// Game server the call was sent to.
    pub channel: ChannelId,
    /// Where replies for this chain go.
    pub reply_to: ChannelId,
    pub invocation: ToolInvocation,
    pub is_direct_dispatch: bool,
    /// Wave number within the originating turn (1-based).
    pub wave: u32,
}

// ─── Turn Lifecycle ─────────────────────────────────────────────────────────

/// Lifecycle of one originating user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// A completion call is in flight.
    AwaitingCompletion,
    /// Tool calls of `wave` are dispatched; `outstanding` results still owed.
    ToolsPending { wave: u32, outstanding: usize },
    /// A plain-text response was delivered.
    Finalized,
    /// Aborted with an error reply.
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Finalized | TurnState::Failed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TurnState::AwaitingCompletion => "awaiting_completion",
            TurnState::ToolsPending { .. } => "tools_pending",
            TurnState::Finalized => "finalized",
            TurnState::Failed => "failed",
        }
    }
}

/// Identifies an originating turn. Message IDs are only unique per player.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnKey {
    pub player_id: String,
    pub message_id: String,
}

impl TurnKey {
    pub fn new(player_id: &str, message_id: &str) -> Self {
        Self {
            player_id: player_id.to_string(),
            message_id: message_id.to_string(),
        }
    }
}

/// Bookkeeping for a live originating turn.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub state: TurnState,
    /// Waves dispatched so far.
    pub waves: u32,
    pub started_at: DateTime<Utc>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
