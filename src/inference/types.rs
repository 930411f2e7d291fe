//! Shared types for the inference layer.
//!
//! These mirror the OpenAI Chat Completions API types, used for both
//! request building and response parsing, plus the provider-neutral
//! `StreamDelta` / `CompletionResult` pair the reconstructor works with.

use serde::{Deserialize, Serialize};

// ─── Request Types ───────────────────────────────────────────────────────────

/// A single message in the conversation as sent to the provider.
///
/// Serialization notes for OpenAI-compatible providers:
/// - `content` is emitted as `""` (not `null`) when absent. Assistant messages
///   that only carry tool calls have no text, and several local runtimes
///   mishandle `null` content.
/// - `name`, `tool_call_id` and `tool_calls` are skipped when `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<String>,
    /// Tool name on `tool` role messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool call results are sent back as `tool` role messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant messages may contain tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

/// Custom serializer for `content`: emit `""` instead of `null` when `None`.
fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

/// Function definition within a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub stream: bool,
    /// Thinking budget for reasoning models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    /// `"low"` / `"medium"` / `"high"` for o1-style models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// A finalized tool call emitted by the model inside an assistant turn.
///
/// Immutable once built by the reconstructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Provider-issued identifier (generated if the provider omitted one).
    pub id: String,
    /// Tool name as registered in the catalog, e.g. `"spawn_npc"`.
    pub name: String,
    /// Parsed JSON arguments. An empty object when the arguments did not parse.
    pub arguments: serde_json::Value,
}

/// Tool call as carried in the OpenAI message format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

impl From<&ToolInvocation> for ToolCallResponse {
    fn from(call: &ToolInvocation) -> Self {
        let arguments = match &call.arguments {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        ToolCallResponse {
            id: call.id.clone(),
            r#type: "function".to_string(),
            function: FunctionCallResponse {
                name: call.name.clone(),
                arguments,
            },
        }
    }
}

/// One incremental delta from a single completion call.
///
/// Non-streaming responses are converted into exactly one delta so both paths
/// go through the same reconstruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    /// Incremental response text (may contain in-band thinking markers).
    pub content: Option<String>,
    /// Out-of-band reasoning text (`reasoning` / `reasoning_content`).
    pub reasoning: Option<String>,
    /// Tool call fragments, tagged by positional index.
    pub tool_calls: Vec<ToolCallFragment>,
}

impl StreamDelta {
    /// A delta carrying only text.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// A partial tool call; `index` is stable for the whole completion call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// The finalized logical response of one completion call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResult {
    /// User-facing response text, free of thinking markers.
    pub text: String,
    /// Extracted thinking content, if any.
    pub thinking: Option<String>,
    /// Tool calls in index order; empty for a plain text response.
    pub tool_calls: Vec<ToolInvocation>,
}

impl CompletionResult {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Raw SSE chunk from the OpenAI API.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

/// A single choice within a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    #[serde(default)]
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

/// The delta (incremental update) within a chunk choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    /// Reasoning/thinking content from models like GPT-OSS and DeepSeek-R1.
    #[serde(default, alias = "reasoning_content")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

/// A tool call fragment within a streaming delta.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkToolCall {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub function: Option<ChunkFunction>,
}

/// A function call fragment within a streaming tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkFunction {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl From<ChunkDelta> for StreamDelta {
    fn from(delta: ChunkDelta) -> Self {
        let tool_calls = delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(position, tc)| {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                ToolCallFragment {
                    index: tc.index.unwrap_or(position as u32),
                    id: tc.id,
                    name,
                    arguments,
                }
            })
            .collect();

        StreamDelta {
            content: delta.content,
            reasoning: delta.reasoning,
            tool_calls,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
