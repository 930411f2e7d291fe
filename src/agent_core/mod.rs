//! Agent Core — orchestration layer for the bridge.
//!
//! Submodules:
//! - `conversation`: Per-player history with referential-integrity trimming
//! - `correlator`: Turn state machine; matches tool results to pending calls
//! - `session`: Registry of connected WebSocket channels
//! - `prompt`: User-turn rendering with the game context block
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod correlator;
pub mod errors;
pub mod prompt;
pub mod session;
pub mod types;

// Re-exports for convenience
pub use conversation::{Conversation, ConversationStore, HistoryLimits};
pub use correlator::{Correlator, CorrelatorSettings};
pub use errors::AgentError;
pub use session::{ChannelId, SessionRegistry};
pub use types::{PendingCall, Turn, TurnKey, TurnState};
