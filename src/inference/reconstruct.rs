//! Stream reconstruction.
//!
//! Folds the ordered deltas of one completion call into a single
//! `CompletionResult`, forwarding response text (and optionally thinking) to a
//! caller-supplied sink as soon as it resolves.
//!
//! The incremental output is best-effort low latency; the finalized text is
//! always recomputed from the complete accumulated content, so chunking never
//! changes the result.

use std::collections::BTreeMap;

use futures::{Stream, StreamExt};
use uuid::Uuid;

use super::cleanup::clean_response_text;
use super::errors::InferenceError;
use super::thinking::{
    contains_marker, default_markers, split_thinking, MarkerPair, Segment, ThinkingScanner,
};
use super::types::{CompletionResult, StreamDelta, ToolInvocation};

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// Receives incremental output while a completion is in flight.
pub trait ResponseSink: Send {
    /// A resolved piece of user-facing response text.
    fn on_text(&mut self, chunk: &str);

    /// A piece of thinking content. Only called when forwarding is enabled.
    fn on_thinking(&mut self, _chunk: &str) {}
}

/// Discards everything.
pub struct NullSink;

impl ResponseSink for NullSink {
    fn on_text(&mut self, _chunk: &str) {}
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// How text and thinking are separated.
#[derive(Debug, Clone)]
pub struct ReconstructOptions {
    /// Scan for in-band thinking markers.
    pub thinking_model: bool,
    /// Forward thinking content to [`ResponseSink::on_thinking`].
    pub forward_thinking: bool,
    pub markers: Vec<MarkerPair>,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        Self {
            thinking_model: true,
            forward_thinking: false,
            markers: default_markers(),
        }
    }
}

// ─── StreamReconstructor ─────────────────────────────────────────────────────

/// A tool call being assembled from fragments.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Mutable state for one completion call. Dropped when the stream ends.
pub struct StreamReconstructor {
    options: ReconstructOptions,
    scanner: Option<ThinkingScanner>,
    /// Raw accumulated content, markers included.
    content: String,
    /// Out-of-band reasoning text.
    reasoning: String,
    /// Keyed by positional index; `BTreeMap` keeps the final order stable.
    tool_calls: BTreeMap<u32, PartialToolCall>,
}

impl StreamReconstructor {
    pub fn new(options: ReconstructOptions) -> Self {
        let scanner = options
            .thinking_model
            .then(|| ThinkingScanner::new(&options.markers));
        Self {
            options,
            scanner,
            content: String::new(),
            reasoning: String::new(),
            tool_calls: BTreeMap::new(),
        }
    }

    /// Apply one delta, forwarding whatever output it resolves.
    pub fn push(&mut self, delta: StreamDelta, sink: &mut dyn ResponseSink) {
        if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
            self.content.push_str(content);
            match self.scanner.as_mut() {
                Some(scanner) => {
                    let segments = scanner.feed(content);
                    self.forward(segments, sink);
                }
                None => sink.on_text(content),
            }
        }

        if let Some(reasoning) = delta.reasoning.as_deref().filter(|r| !r.is_empty()) {
            self.reasoning.push_str(reasoning);
            if self.options.forward_thinking {
                sink.on_thinking(reasoning);
            }
        }

        for fragment in delta.tool_calls {
            let partial = self.tool_calls.entry(fragment.index).or_default();
            if partial.id.is_none() {
                partial.id = fragment.id.filter(|id| !id.is_empty());
            }
            if partial.name.is_none() {
                partial.name = fragment.name.filter(|name| !name.is_empty());
            }
            if let Some(args) = fragment.arguments {
                partial.arguments.push_str(&args);
            }
        }
    }

    /// Close the stream and build the final result.
    pub fn finish(mut self, sink: &mut dyn ResponseSink) -> CompletionResult {
        if let Some(scanner) = self.scanner.as_mut() {
            let segments = scanner.finish();
            self.forward(segments, sink);
        }

        let mut thinking_parts = vec![self.reasoning.trim().to_string()];
        let text = if self.options.thinking_model {
            let (in_band, response) = split_thinking(&self.content, &self.options.markers);
            thinking_parts.extend(in_band);
            let mut text = clean_response_text(&response);
            // Cleanup drops invisible characters, which can join a marker back
            // together. Each pass removes at least one marker, so this ends.
            while contains_marker(&text, &self.options.markers) {
                let (in_band, rest) = split_thinking(&text, &self.options.markers);
                thinking_parts.extend(in_band);
                text = clean_response_text(&rest);
            }
            text
        } else {
            clean_response_text(&self.content)
        };

        let thinking = thinking_parts
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let tool_calls = std::mem::take(&mut self.tool_calls)
            .into_iter()
            .filter_map(|(index, partial)| finalize_tool_call(index, partial))
            .collect();

        CompletionResult {
            text,
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
            tool_calls,
        }
    }

    fn forward(&self, segments: Vec<Segment>, sink: &mut dyn ResponseSink) {
        for segment in segments {
            match segment {
                Segment::Text(text) => sink.on_text(&text),
                Segment::Thinking(thinking) => {
                    if self.options.forward_thinking {
                        sink.on_thinking(&thinking);
                    }
                }
            }
        }
    }
}

/// Turn accumulated fragments into a `ToolInvocation`.
///
/// Unparseable arguments become an empty object; the game-side handler
/// reports missing required arguments itself.
fn finalize_tool_call(index: u32, partial: PartialToolCall) -> Option<ToolInvocation> {
    let Some(name) = partial.name else {
        tracing::warn!(index, "dropping streamed tool call without a name");
        return None;
    };

    let id = partial
        .id
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));

    let raw = partial.arguments.trim();
    let arguments = if raw.is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(other) => {
                tracing::warn!(tool = %name, value = %other, "tool arguments are not an object, using empty arguments");
                serde_json::json!({})
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, raw = %raw, "failed to parse tool arguments, using empty arguments");
                serde_json::json!({})
            }
        }
    };

    Some(ToolInvocation {
        id,
        name,
        arguments,
    })
}

/// Drive a delta stream to completion.
///
/// Stops at the first stream error; nothing partial is returned.
pub async fn reconstruct<S>(
    deltas: S,
    options: ReconstructOptions,
    sink: &mut dyn ResponseSink,
) -> Result<CompletionResult, InferenceError>
where
    S: Stream<Item = Result<StreamDelta, InferenceError>>,
{
    let mut deltas = Box::pin(deltas);
    let mut reconstructor = StreamReconstructor::new(options);

    while let Some(delta) = deltas.next().await {
        reconstructor.push(delta?, sink);
    }

    Ok(reconstructor.finish(sink))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
