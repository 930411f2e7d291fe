//! Inference — OpenAI-compatible completion calls for the bridge.
//!
//! This module handles all communication with the completion provider:
//! - Streaming and non-streaming chat completions
//! - SSE stream parsing
//! - In-band thinking marker separation (incremental scanner)
//! - Stream reconstruction into a single `CompletionResult`
//! - Rate-limit retry with exponential backoff
//!
//! Every provider the bridge supports speaks the Chat Completions API, so
//! switching from Ollama to Cerebras is a config change, not a code change.

pub mod cleanup;
pub mod client;
pub mod errors;
pub mod reconstruct;
pub mod streaming;
pub mod thinking;
pub mod types;

// Re-exports for convenience
pub use client::{
    CompletionGateway, CompletionProvider, OpenAiClient, ProviderResponse, RequestOptions,
    RetryPolicy,
};
pub use errors::InferenceError;
pub use reconstruct::{NullSink, ReconstructOptions, ResponseSink};
pub use thinking::MarkerPair;
pub use types::{ChatMessage, CompletionResult, Role, StreamDelta, ToolDefinition, ToolInvocation};
