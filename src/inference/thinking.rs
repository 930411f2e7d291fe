//! Incremental thinking-marker scanner.
//!
//! Reasoning models embed chain-of-thought in the content stream between
//! marker pairs such as `<think>…</think>`. The scanner splits incoming text
//! into response and thinking segments as fragments arrive, holding back only
//! the short suffix that could still turn out to be the start of a marker.
//! Previously flushed text is never rescanned.
//!
//! Matching is ASCII case-insensitive.

use serde::{Deserialize, Serialize};

// ─── Markers ─────────────────────────────────────────────────────────────────

/// An open/close marker pair delimiting thinking content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPair {
    pub open: String,
    pub close: String,
}

impl MarkerPair {
    pub fn new(open: &str, close: &str) -> Self {
        Self {
            open: open.to_string(),
            close: close.to_string(),
        }
    }
}

/// The marker pairs recognised when none are configured.
pub fn default_markers() -> Vec<MarkerPair> {
    vec![
        MarkerPair::new("<think>", "</think>"),
        MarkerPair::new("<thinking>", "</thinking>"),
        MarkerPair::new("<reasoning>", "</reasoning>"),
    ]
}

/// A resolved piece of scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Thinking(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    /// Inside a thinking span opened by `markers[pair]`.
    Thinking { pair: usize },
}

// ─── ThinkingScanner ─────────────────────────────────────────────────────────

/// Splits a text stream into response and thinking segments.
#[derive(Debug, Clone)]
pub struct ThinkingScanner {
    /// Lowercased marker pairs (empty markers removed).
    markers: Vec<MarkerPair>,
    state: ScanState,
    /// Unflushed text. Only ever holds a possible marker prefix once `feed`
    /// returns.
    pending: String,
}

impl ThinkingScanner {
    pub fn new(markers: &[MarkerPair]) -> Self {
        let markers = markers
            .iter()
            .filter(|m| !m.open.is_empty() && !m.close.is_empty())
            .map(|m| MarkerPair {
                open: m.open.to_ascii_lowercase(),
                close: m.close.to_ascii_lowercase(),
            })
            .collect();
        Self {
            markers,
            state: ScanState::Normal,
            pending: String::new(),
        }
    }

    /// Whether the scanner is currently inside a thinking span.
    pub fn in_thinking(&self) -> bool {
        matches!(self.state, ScanState::Thinking { .. })
    }

    /// Feed a fragment and return every segment that can be resolved so far.
    pub fn feed(&mut self, fragment: &str) -> Vec<Segment> {
        self.pending.push_str(fragment);
        let mut out = Vec::new();
        self.drain(&mut out);
        out
    }

    /// Flush whatever is still held back.
    ///
    /// A dangling marker prefix in normal mode is plain text. An unterminated
    /// thinking span is emitted as thinking.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        match self.state {
            ScanState::Normal => push_segment(&mut out, Segment::Text(rest)),
            ScanState::Thinking { .. } => push_segment(&mut out, Segment::Thinking(rest)),
        }
        self.state = ScanState::Normal;
        out
    }

    fn drain(&mut self, out: &mut Vec<Segment>) {
        loop {
            let lower = self.pending.to_ascii_lowercase();
            match self.state {
                ScanState::Normal => {
                    if let Some(hit) = self.earliest_marker(&lower) {
                        let before = self.pending[..hit.pos].to_string();
                        push_segment(out, Segment::Text(before));
                        self.pending.drain(..hit.pos + hit.len);
                        if let MarkerKind::Open(pair) = hit.kind {
                            self.state = ScanState::Thinking { pair };
                        }
                        // A stray close marker is dropped and scanning continues.
                        continue;
                    }

                    let held = self
                        .markers
                        .iter()
                        .flat_map(|m| [m.open.as_str(), m.close.as_str()])
                        .map(|needle| partial_suffix_len(&lower, needle))
                        .max()
                        .unwrap_or(0);
                    let split = self.pending.len() - held;
                    let flushed: String = self.pending.drain(..split).collect();
                    push_segment(out, Segment::Text(flushed));
                    return;
                }
                ScanState::Thinking { pair } => {
                    let close = &self.markers[pair].close;
                    if let Some(pos) = lower.find(close.as_str()) {
                        let len = close.len();
                        let inner = self.pending[..pos].to_string();
                        push_segment(out, Segment::Thinking(inner));
                        self.pending.drain(..pos + len);
                        self.state = ScanState::Normal;
                        continue;
                    }

                    let held = partial_suffix_len(&lower, close);
                    let split = self.pending.len() - held;
                    let flushed: String = self.pending.drain(..split).collect();
                    push_segment(out, Segment::Thinking(flushed));
                    return;
                }
            }
        }
    }

    /// Earliest open or close marker in `lower`; ties go to the longer marker.
    fn earliest_marker(&self, lower: &str) -> Option<MarkerHit> {
        let mut best: Option<MarkerHit> = None;
        for (pair, marker) in self.markers.iter().enumerate() {
            let candidates = [
                (marker.open.as_str(), MarkerKind::Open(pair)),
                (marker.close.as_str(), MarkerKind::Close),
            ];
            for (needle, kind) in candidates {
                if let Some(pos) = lower.find(needle) {
                    let better = match &best {
                        None => true,
                        Some(b) => pos < b.pos || (pos == b.pos && needle.len() > b.len),
                    };
                    if better {
                        best = Some(MarkerHit {
                            pos,
                            len: needle.len(),
                            kind,
                        });
                    }
                }
            }
        }
        best
    }
}

#[derive(Debug, Clone, Copy)]
enum MarkerKind {
    Open(usize),
    Close,
}

#[derive(Debug, Clone, Copy)]
struct MarkerHit {
    pos: usize,
    len: usize,
    kind: MarkerKind,
}

/// Length of the longest proper prefix of `needle` that `haystack` ends with.
fn partial_suffix_len(haystack: &str, needle: &str) -> usize {
    let max = needle.len().saturating_sub(1).min(haystack.len());
    (1..=max)
        .rev()
        .find(|&k| needle.is_char_boundary(k) && haystack.ends_with(&needle[..k]))
        .unwrap_or(0)
}

fn push_segment(out: &mut Vec<Segment>, segment: Segment) {
    let empty = match &segment {
        Segment::Text(s) | Segment::Thinking(s) => s.is_empty(),
    };
    if !empty {
        out.push(segment);
    }
}

// ─── Whole-text extraction ───────────────────────────────────────────────────

/// Split a complete text into `(thinking, response)`.
///
/// Runs the scanner over the whole text, then repeats until no marker is left,
/// so the returned response never contains a configured marker however the
/// provider chunked or nested them.
pub fn split_thinking(text: &str, markers: &[MarkerPair]) -> (Option<String>, String) {
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut response = text.to_string();

    loop {
        let mut scanner = ThinkingScanner::new(markers);
        let mut segments = scanner.feed(&response);
        segments.extend(scanner.finish());

        let mut next = String::with_capacity(response.len());
        for segment in segments {
            match segment {
                Segment::Text(s) => next.push_str(&s),
                Segment::Thinking(s) => thinking_parts.push(s),
            }
        }
        response = next;

        if !contains_marker(&response, markers) {
            break;
        }
    }

    let thinking = thinking_parts
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let thinking = if thinking.is_empty() {
        None
    } else {
        Some(thinking)
    };
    (thinking, response.trim().to_string())
}

/// Whether `text` contains any open or close marker.
pub fn contains_marker(text: &str, markers: &[MarkerPair]) -> bool {
    let lower = text.to_ascii_lowercase();
    markers.iter().any(|m| {
        (!m.open.is_empty() && lower.contains(&m.open.to_ascii_lowercase()))
            || (!m.close.is_empty() && lower.contains(&m.close.to_ascii_lowercase()))
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
