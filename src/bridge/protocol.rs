//! Wire protocol between the bridge and its WebSocket peers.
//!
//! Every frame is a JSON object with a `type` discriminant. Game servers send
//! `handshake`, `chat`, `tool_result` and `reset`; external tool callers send
//! `direct_tool_call` (or its legacy name `mcp_tool_call`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent_core::errors::AgentError;

// ─── Inbound ─────────────────────────────────────────────────────────────────

/// A message received from a peer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Handshake(ServerInfo),
    Chat(ChatRequest),
    ToolResult(ToolResultReport),
    #[serde(alias = "mcp_tool_call")]
    DirectToolCall(DirectToolCall),
    /// Clear one player's conversation, or every conversation when
    /// `player_id` is absent.
    Reset(ResetRequest),
}

impl InboundMessage {
    /// Short name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Handshake(_) => "handshake",
            InboundMessage::Chat(_) => "chat",
            InboundMessage::ToolResult(_) => "tool_result",
            InboundMessage::DirectToolCall(_) => "direct_tool_call",
            InboundMessage::Reset(_) => "reset",
        }
    }
}

/// Parse one text frame.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, AgentError> {
    serde_json::from_str(text).map_err(|e| AgentError::MalformedInput {
        reason: e.to_string(),
    })
}

fn unknown() -> String {
    "Unknown".to_string()
}

fn unknown_id() -> String {
    "unknown".to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Game server metadata announced in the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default = "unknown")]
    pub server_name: String,
    #[serde(default = "unknown")]
    pub map: String,
    #[serde(default)]
    pub max_players: u32,
    #[serde(default)]
    pub player_count: u32,
}

/// A player's chat line plus the game context around it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatRequest {
    #[serde(default = "unknown_id")]
    pub message_id: String,
    #[serde(default)]
    pub player: PlayerInfo,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub map: Option<String>,
}

impl ChatRequest {
    /// Conversation key for this request.
    pub fn player_id(&self) -> &str {
        self.player
            .steamid
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlayerInfo {
    #[serde(default)]
    pub steamid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub health: Option<f64>,
    #[serde(default)]
    pub armor: Option<f64>,
    #[serde(default)]
    pub weapon: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub looking_at: Option<LookingAt>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

/// The entity under the player's crosshair.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LookingAt {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Outcome of a tool the game executed.
///
/// `tool_call_id` is authoritative; `message_id` + `tool` is the fallback key
/// for peers that do not echo the id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolResultReport {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default = "empty_object")]
    pub result: Value,
}

/// A pre-formed tool call that bypasses the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DirectToolCall {
    #[serde(default = "unknown_id")]
    pub message_id: String,
    pub tool: String,
    #[serde(default = "empty_object")]
    pub args: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub player_id: Option<String>,
}

// ─── Outbound ────────────────────────────────────────────────────────────────

/// A message sent to a peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Status ping when a chat starts; carries content only when forwarding
    /// thinking text.
    Thinking {
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    ResponseStream {
        message_id: String,
        chunk: String,
    },
    ToolCall {
        message_id: String,
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        args: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        player_id: Option<String>,
    },
    ResponseEnd {
        message_id: String,
    },
    Response {
        message_id: String,
        text: String,
    },
    Error {
        message_id: String,
        error: String,
    },
    /// Relay of a direct tool call's outcome to its caller.
    ToolResult {
        message_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Thinking { .. } => "thinking",
            OutboundMessage::ResponseStream { .. } => "response_stream",
            OutboundMessage::ToolCall { .. } => "tool_call",
            OutboundMessage::ResponseEnd { .. } => "response_end",
            OutboundMessage::Response { .. } => "response",
            OutboundMessage::Error { .. } => "error",
            OutboundMessage::ToolResult { .. } => "tool_result",
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            OutboundMessage::Thinking { message_id, .. }
            | OutboundMessage::ResponseStream { message_id, .. }
            | OutboundMessage::ToolCall { message_id, .. }
            | OutboundMessage::ResponseEnd { message_id }
            | OutboundMessage::Response { message_id, .. }
            | OutboundMessage::Error { message_id, .. }
            | OutboundMessage::ToolResult { message_id, .. } => message_id,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
