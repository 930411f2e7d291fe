//! Conversation store — per-player turn logs under a size ceiling.
//!
//! Each player gets one `Conversation` behind its own async mutex, so all
//! operations for a player are serialized while different players proceed
//! independently. Nothing is persisted; history lives until reset or exit.
//!
//! ## Trimming
//!
//! Once a log exceeds `max_turns`, it is cut back to: the system turn, every
//! older assistant turn defining an invocation that a tool result in the
//! recent window answers, and the last `recent_window` turns. A tool result
//! whose defining assistant turn is gone makes the provider reject the whole
//! request, so that second rule is not optional.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::types::Turn;
use crate::inference::types::ChatMessage;

/// Async mutex guarding a single player's conversation.
pub type TokioMutex<T> = tokio::sync::Mutex<T>;

// ─── Limits ──────────────────────────────────────────────────────────────────

/// Size ceiling and recent window for trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    /// Trim once the log is longer than this.
    pub max_turns: usize,
    /// Turns kept verbatim from the end of the log.
    pub recent_window: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_turns: 21,
            recent_window: 20,
        }
    }
}

// ─── Conversation ────────────────────────────────────────────────────────────

/// One player's ordered turn log. Always starts with the system turn.
#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<Turn>,
    limits: HistoryLimits,
}

impl Conversation {
    pub fn new(system_prompt: &str, limits: HistoryLimits) -> Self {
        Self {
            turns: vec![Turn::System {
                content: system_prompt.to_string(),
            }],
            limits,
        }
    }

    /// Append a turn, trimming afterwards if the ceiling is exceeded.
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        if self.turns.len() > self.limits.max_turns {
            self.trim();
        }
    }

    /// Append the answer to one tool invocation.
    pub fn append_tool_result(
        &mut self,
        invocation_id: &str,
        tool_name: &str,
        success: bool,
        result: serde_json::Value,
    ) {
        self.append(Turn::ToolResult {
            tool_call_id: invocation_id.to_string(),
            name: tool_name.to_string(),
            success,
            result,
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The log in provider wire format.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.turns.iter().map(Turn::to_chat_message).collect()
    }

    /// Cut the log back under the ceiling. Returns the number of turns dropped.
    ///
    /// A no-op when the log is within `max_turns`, and a fixed point otherwise:
    /// trimming a trimmed log keeps the same turns.
    pub fn trim(&mut self) -> usize {
        let len = self.turns.len();
        if len <= self.limits.max_turns {
            return 0;
        }

        // Index 0 is the system turn and never part of the window.
        let recent_start = len.saturating_sub(self.limits.recent_window).max(1);

        let keep: Vec<bool> = {
            let referenced: HashSet<&str> = self.turns[recent_start..]
                .iter()
                .filter_map(Turn::referenced_invocation)
                .collect();

            self.turns
                .iter()
                .enumerate()
                .map(|(i, turn)| {
                    i == 0
                        || i >= recent_start
                        || turn.invocation_ids().any(|id| referenced.contains(id))
                })
                .collect()
        };

        let mut flags = keep.into_iter();
        self.turns.retain(|_| flags.next().unwrap_or(false));

        let dropped = len - self.turns.len();
        if dropped > 0 {
            tracing::debug!(before = len, after = self.turns.len(), dropped, "trimmed conversation");
        }
        dropped
    }
}

// ─── ConversationStore ───────────────────────────────────────────────────────

/// All live conversations, keyed by player ID.
pub struct ConversationStore {
    system_prompt: String,
    limits: HistoryLimits,
    conversations: Mutex<HashMap<String, Arc<TokioMutex<Conversation>>>>,
}

impl ConversationStore {
    pub fn new(system_prompt: impl Into<String>, limits: HistoryLimits) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            limits,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TokioMutex<Conversation>>>> {
        self.conversations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The player's conversation, created (system turn only) on first use.
    ///
    /// Lock the returned handle to serialize work for this player.
    pub fn handle(&self, player_id: &str) -> Arc<TokioMutex<Conversation>> {
        self.map()
            .entry(player_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(player_id, "new conversation");
                Arc::new(TokioMutex::new(Conversation::new(
                    &self.system_prompt,
                    self.limits,
                )))
            })
            .clone()
    }

    pub async fn append(&self, player_id: &str, turn: Turn) {
        self.handle(player_id).lock().await.append(turn);
    }

    pub async fn append_tool_result(
        &self,
        player_id: &str,
        invocation_id: &str,
        tool_name: &str,
        success: bool,
        result: serde_json::Value,
    ) {
        self.handle(player_id)
            .lock()
            .await
            .append_tool_result(invocation_id, tool_name, success, result);
    }

    pub async fn snapshot(&self, player_id: &str) -> Vec<ChatMessage> {
        self.handle(player_id).lock().await.snapshot()
    }

    /// Discard one player's history. Returns whether any existed.
    pub fn reset(&self, player_id: &str) -> bool {
        self.map().remove(player_id).is_some()
    }

    /// Discard all history.
    pub fn reset_all(&self) -> usize {
        let mut map = self.map();
        let count = map.len();
        map.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::ToolInvocation;

    fn call(id: &str) -> ToolInvocation {
        ToolInvocation {
            id: id.to_string(),
            name: "spawn_prop".to_string(),
            arguments: serde_json::json!({}),
        }
    }

    fn assistant_calls(ids: &[&str]) -> Turn {
        Turn::Assistant {
            content: None,
            tool_calls: ids.iter().map(|id| call(id)).collect(),
        }
    }

    fn tool_result(id: &str) -> Turn {
        Turn::ToolResult {
            tool_call_id: id.to_string(),
            name: "spawn_prop".to_string(),
            success: true,
            result: serde_json::json!({}),
        }
    }

    /// Build a log without trimming on append.
    fn raw(turns: Vec<Turn>) -> Conversation {
        let mut conv = Conversation::new("system", HistoryLimits::default());
        conv.turns.extend(turns);
        conv
    }

    fn assert_referential_integrity(conv: &Conversation) {
        let defined: HashSet<&str> = conv.turns().iter().flat_map(Turn::invocation_ids).collect();
        for turn in conv.turns() {
            if let Some(id) = turn.referenced_invocation() {
                assert!(defined.contains(id), "orphaned tool result {id}");
            }
        }
    }

    #[test]
    fn test_new_conversation_has_system_turn() {
        let conv = Conversation::new("be helpful", HistoryLimits::default());
        assert_eq!(conv.len(), 1);
        assert!(matches!(&conv.turns()[0], Turn::System { content } if content == "be helpful"));
    }

    #[test]
    fn test_trim_noop_under_ceiling() {
        let mut conv = raw((0..20).map(|i| Turn::user(format!("u{i}"))).collect());
        assert_eq!(conv.len(), 21);
        assert_eq!(conv.trim(), 0);
        assert_eq!(conv.len(), 21);
    }

    #[test]
    fn test_trim_keeps_system_and_recent_window() {
        let mut conv = raw((0..30).map(|i| Turn::user(format!("u{i}"))).collect());
        conv.trim();
        assert_eq!(conv.len(), 21);
        assert!(matches!(conv.turns()[0], Turn::System { .. }));
        assert!(matches!(&conv.turns()[1], Turn::User { content } if content == "u10"));
        assert!(matches!(&conv.turns()[20], Turn::User { content } if content == "u29"));
    }

    #[test]
    fn test_trim_retains_referenced_older_assistant_turn() {
        // 25 turns: #0 system, #3 assistant defining X, #23 tool result for X.
        let mut turns = Vec::new();
        for i in 1..25 {
            let turn = match i {
                3 => assistant_calls(&["X"]),
                23 => tool_result("X"),
                _ => Turn::user(format!("u{i}")),
            };
            turns.push(turn);
        }
        let mut conv = raw(turns);
        assert_eq!(conv.len(), 25);

        conv.trim();
        assert_eq!(conv.len(), 22);
        assert!(conv.turns()[1].invocation_ids().any(|id| id == "X"));
        assert_referential_integrity(&conv);
    }

    #[test]
    fn test_trim_keeps_whole_turn_if_any_id_referenced() {
        let mut turns = vec![assistant_calls(&["A", "B"]), tool_result("A")];
        turns.extend((0..19).map(|i| Turn::user(format!("u{i}"))));
        turns.push(tool_result("B"));
        let mut conv = raw(turns);

        conv.trim();
        let ids: Vec<&str> = conv.turns()[1].invocation_ids().collect();
        assert_eq!(ids, vec!["A", "B"]);
        // The old result for A falls outside the window and is dropped.
        assert_eq!(
            conv.turns().iter().filter(|t| t.referenced_invocation() == Some("A")).count(),
            0
        );
        assert_referential_integrity(&conv);
    }

    #[test]
    fn test_trim_drops_unreferenced_assistant_turns() {
        let mut turns = vec![assistant_calls(&["old"]), tool_result("old")];
        turns.extend((0..25).map(|i| Turn::user(format!("u{i}"))));
        let mut conv = raw(turns);
        conv.trim();
        assert_eq!(conv.len(), 21);
        assert_eq!(conv.turns().iter().flat_map(Turn::invocation_ids).count(), 0);
    }

    #[test]
    fn test_trim_is_idempotent() {
        let mut turns = Vec::new();
        for i in 0..40 {
            turns.push(assistant_calls(&[&format!("c{i}")]));
            turns.push(Turn::user(format!("u{i}")));
        }
        // Recent results reference calls from far back.
        for i in (0..40).step_by(4) {
            turns.push(tool_result(&format!("c{i}")));
        }
        let mut conv = raw(turns);

        conv.trim();
        let once = conv.turns().to_vec();
        assert_referential_integrity(&conv);

        assert_eq!(conv.trim(), 0);
        assert_eq!(conv.turns(), once.as_slice());
    }

    #[test]
    fn test_append_trims_automatically() {
        let mut conv = Conversation::new("system", HistoryLimits::default());
        conv.append(assistant_calls(&["early"]));
        conv.append_tool_result("early", "spawn_prop", true, serde_json::json!({}));
        for i in 0..30 {
            conv.append(Turn::user(format!("u{i}")));
            assert!(conv.len() <= 22);
            assert_referential_integrity(&conv);
        }
        assert_eq!(conv.len(), 21);
    }

    #[test]
    fn test_snapshot_wire_format() {
        let mut conv = Conversation::new("system", HistoryLimits::default());
        conv.append(Turn::user("spawn a crate"));
        conv.append(assistant_calls(&["call_1"]));
        conv.append_tool_result("call_1", "spawn_prop", true, serde_json::json!("ok"));
        let snapshot = conv.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_store_isolates_players_and_resets() {
        let store = ConversationStore::new("system", HistoryLimits::default());
        store.append("p1", Turn::user("hello")).await;
        store.append("p2", Turn::user("hi")).await;
        store.append("p2", Turn::assistant_text("hey")).await;

        assert_eq!(store.snapshot("p1").await.len(), 2);
        assert_eq!(store.snapshot("p2").await.len(), 3);
        assert_eq!(store.len(), 2);

        assert!(store.reset("p1"));
        assert_eq!(store.snapshot("p1").await.len(), 1);

        assert_eq!(store.reset_all(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_append_tool_result() {
        let store = ConversationStore::new("system", HistoryLimits::default());
        store.append("p1", assistant_calls(&["c1"])).await;
        store
            .append_tool_result("p1", "c1", "spawn_prop", false, serde_json::json!("no room"))
            .await;
        let snapshot = store.snapshot("p1").await;
        assert_eq!(snapshot.last().unwrap().name.as_deref(), Some("spawn_prop"));
    }
}
