//! Tool catalog error types.

use thiserror::Error;

/// Errors raised while loading the catalog or checking a call against it.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The definitions document could not be parsed.
    #[error("invalid tool catalog: {reason}")]
    InvalidCatalog { reason: String },

    /// Two definitions share a name.
    #[error("duplicate tool definition: '{name}'")]
    DuplicateTool { name: String },

    /// Tool not found in the catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool call arguments failed the structural check.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}
