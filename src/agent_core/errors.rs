//! Agent Core error types.

use thiserror::Error;

use super::session::ChannelId;
use crate::inference::InferenceError;

/// Shown to the player when the provider keeps throttling us.
pub const RATE_LIMIT_MESSAGE: &str =
    "Rate limited by AI provider. Please wait a moment and try again.";

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Inbound payload could not be parsed.
    #[error("malformed input: {reason}")]
    MalformedInput { reason: String },

    /// The provider rate-limited every attempt.
    #[error("provider rate limited after {attempts} attempts")]
    ProviderRateLimited { attempts: u32 },

    /// Any other provider failure.
    #[error("provider error: {0}")]
    Provider(#[from] InferenceError),

    /// A tool result matched no outstanding call.
    #[error("unresolved tool result (tool_call_id={tool_call_id:?}, message_id={message_id}, tool={tool})")]
    UnresolvedCorrelation {
        tool_call_id: Option<String>,
        message_id: String,
        tool: String,
    },

    /// No connected game server can take the tool call.
    #[error("No GMod server connected")]
    NoTargetChannel,

    /// The target channel went away between lookup and send.
    #[error("channel {channel} is closed")]
    ChannelClosed { channel: ChannelId },
}

impl AgentError {
    /// Classify a provider error, folding exhausted rate limits into
    /// `ProviderRateLimited`.
    pub fn from_provider(err: InferenceError, attempts: u32) -> Self {
        if err.is_rate_limited() {
            AgentError::ProviderRateLimited { attempts }
        } else {
            AgentError::Provider(err)
        }
    }

    /// Text for the `error` reply sent back to the game.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::ProviderRateLimited { .. } => RATE_LIMIT_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}
