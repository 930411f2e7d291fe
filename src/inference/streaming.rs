//! Provider response decoding: SSE event framing for streamed completions
//! and the single-body form for non-streamed ones.
//!
//! Both produce `StreamDelta`s; merging fragments into a result is the
//! reconstructor's job.

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, StreamDelta, ToolCallFragment};

// ─── SSE parser ──────────────────────────────────────────────────────────────

/// Decode a streamed completion body, one delta per SSE event.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<StreamDelta, InferenceError>> {
    sse_deltas(response.bytes_stream())
}

/// Parse any byte stream of SSE events. Split out from [`parse_sse_stream`]
/// so the framing logic can run without an HTTP response.
pub fn sse_deltas<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<StreamDelta, InferenceError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream::unfold(
        (Box::pin(byte_stream), String::new(), false),
        |(mut byte_stream, mut buffer, mut done)| async move {
            loop {
                if done {
                    return None;
                }

                if let Some(end) = buffer.find("\n\n") {
                    let event: String = buffer.drain(..end + 2).collect();

                    match process_event(&event) {
                        Ok(EventOutcome::Delta(delta)) => {
                            return Some((Ok(delta), (byte_stream, buffer, done)))
                        }
                        Ok(EventOutcome::Done) => {
                            done = true;
                            continue;
                        }
                        Ok(EventOutcome::Skip) => continue,
                        Err(e) => return Some((Err(e), (byte_stream, buffer, done))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        let text = String::from_utf8_lossy(bytes.as_ref());
                        // Some servers frame events with CRLF.
                        buffer.push_str(&text.replace("\r\n", "\n"));
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, done),
                        ));
                    }
                    None => {
                        // An unterminated final event still counts.
                        done = true;
                        let rest = buffer.trim().to_string();
                        buffer.clear();
                        if rest.is_empty() {
                            return None;
                        }
                        match process_event(&rest) {
                            Ok(EventOutcome::Delta(delta)) => {
                                return Some((Ok(delta), (byte_stream, buffer, done)))
                            }
                            Ok(_) => return None,
                            Err(e) => return Some((Err(e), (byte_stream, buffer, done))),
                        }
                    }
                }
            }
        },
    )
}

enum EventOutcome {
    Delta(StreamDelta),
    Done,
    Skip,
}

/// Decode one event. Multiple `data:` lines are concatenated.
fn process_event(event: &str) -> Result<EventOutcome, InferenceError> {
    let mut payload = String::new();

    for line in event.lines() {
        if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(EventOutcome::Done);
            }
            payload.push_str(data);
        }
    }

    if payload.is_empty() {
        return Ok(EventOutcome::Skip);
    }

    let chunk: ChatCompletionChunk =
        serde_json::from_str(&payload).map_err(|e| InferenceError::StreamError {
            reason: format!("bad SSE payload: {e} ({payload})"),
        })?;

    match chunk.choices.into_iter().next() {
        Some(choice) => Ok(EventOutcome::Delta(StreamDelta::from(choice.delta))),
        None => Ok(EventOutcome::Skip),
    }
}

// ─── Non-streaming ───────────────────────────────────────────────────────────

/// Parse a non-streaming response body into a single delta.
///
/// Every tool call becomes one complete fragment, so the reconstructor treats
/// the whole response as a degenerate one-delta stream.
pub fn parse_non_streaming_response(body: &str) -> Result<StreamDelta, InferenceError> {
    #[derive(Deserialize)]
    struct NonStreamResponse {
        choices: Vec<NonStreamChoice>,
    }

    #[derive(Deserialize)]
    struct NonStreamChoice {
        message: NonStreamMessage,
    }

    #[derive(Deserialize)]
    struct NonStreamMessage {
        content: Option<String>,
        #[serde(default, alias = "reasoning_content")]
        reasoning: Option<String>,
        tool_calls: Option<Vec<NonStreamToolCall>>,
    }

    #[derive(Deserialize)]
    struct NonStreamToolCall {
        id: Option<String>,
        function: NonStreamFunction,
    }

    #[derive(Deserialize)]
    struct NonStreamFunction {
        name: String,
        #[serde(default)]
        arguments: Option<String>,
    }

    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::StreamError {
            reason: "empty choices array".into(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, tc)| ToolCallFragment {
            index: index as u32,
            id: tc.id,
            name: Some(tc.function.name),
            arguments: tc.function.arguments,
        })
        .collect();

    Ok(StreamDelta {
        content: choice.message.content.filter(|c| !c.is_empty()),
        reasoning: choice.message.reasoning.filter(|r| !r.is_empty()),
        tool_calls,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
