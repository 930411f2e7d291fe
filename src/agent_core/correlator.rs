//! Tool-call correlator — the orchestration state machine.
//!
//! Per originating chat message the turn moves through
//! `AwaitingCompletion → (ToolsPending)* → Finalized | Failed`:
//!
//! 1. The user turn is appended and a completion is requested.
//! 2. Plain text finalizes the turn. Tool calls are appended as part of the
//!    assistant turn, registered as pending (the whole wave at once), then
//!    dispatched to the game server.
//! 3. Each `tool_result` removes one pending call and appends a tool-result
//!    turn. When the last call of the wave is answered, the continuation
//!    completion runs, which may open another wave under the same message ID.
//!
//! All work for one player runs under that player's conversation lock, so a
//! turn never has two completion calls in flight and turns are appended in
//! processing order. Different players never contend on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::conversation::{Conversation, ConversationStore};
use super::errors::AgentError;
use super::prompt::build_user_message;
use super::session::{ChannelId, SessionRegistry};
use super::types::{PendingCall, Turn, TurnKey, TurnRecord, TurnState};
use crate::bridge::protocol::{ChatRequest, DirectToolCall, OutboundMessage, ToolResultReport};
use crate::inference::types::ToolInvocation;
use crate::inference::{CompletionGateway, ResponseSink};
use crate::tools::ToolCatalog;

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CorrelatorSettings {
    /// Send thinking text to the game as `thinking{content}` messages.
    pub show_thinking: bool,
    /// Resolve a pending call with a failure after this long. `None` waits
    /// forever.
    pub result_timeout: Option<Duration>,
}

// ─── Streaming sink ──────────────────────────────────────────────────────────

/// Forwards incremental output of one completion to the chat's channel.
struct ChannelSink<'a> {
    sessions: &'a SessionRegistry,
    channel: ChannelId,
    message_id: &'a str,
    show_thinking: bool,
}

impl ResponseSink for ChannelSink<'_> {
    fn on_text(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let msg = OutboundMessage::ResponseStream {
            message_id: self.message_id.to_string(),
            chunk: chunk.to_string(),
        };
        if let Err(e) = self.sessions.send(self.channel, msg) {
            tracing::debug!(message_id = %self.message_id, error = %e, "dropping stream chunk");
        }
    }

    fn on_thinking(&mut self, chunk: &str) {
        if !self.show_thinking || chunk.is_empty() {
            return;
        }
        let msg = OutboundMessage::Thinking {
            message_id: self.message_id.to_string(),
            content: Some(chunk.to_string()),
        };
        if let Err(e) = self.sessions.send(self.channel, msg) {
            tracing::debug!(message_id = %self.message_id, error = %e, "dropping thinking chunk");
        }
    }
}

// ─── Correlator ──────────────────────────────────────────────────────────────

pub struct Correlator {
    gateway: CompletionGateway,
    catalog: Arc<ToolCatalog>,
    conversations: ConversationStore,
    sessions: Arc<SessionRegistry>,
    /// Outstanding tool calls by invocation ID, in registration order so the
    /// fallback match picks the earliest.
    pending: Mutex<IndexMap<String, PendingCall>>,
    /// Live originating turns. Removed on `Finalized` / `Failed`.
    turns: Mutex<HashMap<TurnKey, TurnRecord>>,
    settings: CorrelatorSettings,
    /// Pending calls whose result timer fired.
    expired_tx: mpsc::UnboundedSender<PendingCall>,
}

impl Correlator {
    /// Build the correlator and start its timeout worker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        gateway: CompletionGateway,
        catalog: Arc<ToolCatalog>,
        conversations: ConversationStore,
        sessions: Arc<SessionRegistry>,
        settings: CorrelatorSettings,
    ) -> Arc<Self> {
        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel::<PendingCall>();

        let correlator = Arc::new(Self {
            gateway,
            catalog,
            conversations,
            sessions,
            pending: Mutex::new(IndexMap::new()),
            turns: Mutex::new(HashMap::new()),
            settings,
            expired_tx,
        });

        // Holds only a weak reference so dropping the correlator ends it.
        let weak: Weak<Self> = Arc::downgrade(&correlator);
        tokio::spawn(async move {
            while let Some(call) = expired_rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                this.expire(call).await;
            }
        });

        correlator
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    fn pending(&self) -> MutexGuard<'_, IndexMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn turns(&self) -> MutexGuard<'_, HashMap<TurnKey, TurnRecord>> {
        self.turns.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, channel: ChannelId, message: OutboundMessage) {
        let kind = message.kind();
        if let Err(e) = self.sessions.send(channel, message) {
            tracing::warn!(channel = %channel, kind, error = %e, "outbound message dropped");
        }
    }

    // ─── Chat ────────────────────────────────────────────────────────────

    /// Handle a player's chat message through to a final response or error.
    pub async fn handle_chat(&self, channel: ChannelId, request: ChatRequest) {
        let player_id = request.player_id().to_string();
        let key = TurnKey::new(&player_id, &request.message_id);

        tracing::info!(
            message_id = %key.message_id,
            player_id = %player_id,
            channel = %channel,
            "chat received"
        );

        self.send(
            channel,
            OutboundMessage::Thinking {
                message_id: key.message_id.clone(),
                content: None,
            },
        );

        let conversation = self.conversations.handle(&player_id);
        let mut conv = conversation.lock().await;

        conv.append(Turn::user(build_user_message(&request)));
        self.begin_turn(&key);
        self.run_completion(&key, &mut conv, channel).await;
    }

    /// One completion call and its outcome. Caller holds the player's lock.
    async fn run_completion(&self, key: &TurnKey, conv: &mut Conversation, reply_to: ChannelId) {
        self.set_state(key, TurnState::AwaitingCompletion);

        let mut sink = ChannelSink {
            sessions: &self.sessions,
            channel: reply_to,
            message_id: &key.message_id,
            show_thinking: self.settings.show_thinking,
        };

        let result = match self.gateway.complete(conv.snapshot(), &mut sink).await {
            Ok(result) => result,
            Err(e) => {
                let err = AgentError::from_provider(e, self.gateway.max_attempts());
                self.fail_turn(key, reply_to, err);
                return;
            }
        };

        if !result.has_tool_calls() {
            conv.append(Turn::assistant_text(result.text.clone()));
            self.send(
                reply_to,
                OutboundMessage::ResponseEnd {
                    message_id: key.message_id.clone(),
                },
            );
            self.send(
                reply_to,
                OutboundMessage::Response {
                    message_id: key.message_id.clone(),
                    text: result.text,
                },
            );
            self.finish_turn(key, TurnState::Finalized);
            return;
        }

        let wave = self.next_wave(key);
        let calls = self.register_wave(key, reply_to, wave, result.tool_calls);

        // The assistant turn must carry the calls so their results have a referent.
        conv.append(Turn::Assistant {
            content: Some(result.text).filter(|t| !t.is_empty()),
            tool_calls: calls.iter().map(|c| c.invocation.clone()).collect(),
        });

        self.set_state(
            key,
            TurnState::ToolsPending {
                wave,
                outstanding: calls.len(),
            },
        );

        if let Err(err) = self.dispatch(&calls) {
            self.fail_turn(key, reply_to, err);
        }
    }

    /// Register every call of a wave in one critical section.
    ///
    /// Missing or colliding invocation IDs are replaced, so the returned
    /// calls carry the IDs the conversation must record.
    fn register_wave(
        &self,
        key: &TurnKey,
        channel: ChannelId,
        wave: u32,
        invocations: Vec<ToolInvocation>,
    ) -> Vec<PendingCall> {
        let mut pending = self.pending();
        let mut calls = Vec::with_capacity(invocations.len());

        for mut invocation in invocations {
            if invocation.id.is_empty() || pending.contains_key(&invocation.id) {
                let replacement = format!("call_{}", Uuid::new_v4());
                tracing::warn!(
                    original = %invocation.id,
                    replacement = %replacement,
                    "invocation id missing or already pending, reassigning"
                );
                invocation.id = replacement;
            }

            if let Err(e) = self.catalog.validate_arguments(&invocation.name, &invocation.arguments) {
                // Dispatch anyway; the game reports its own error.
                tracing::warn!(tool = %invocation.name, error = %e, "suspicious tool call");
            }

            let call = PendingCall {
                invocation_id: invocation.id.clone(),
                originating_turn_id: key.message_id.clone(),
                player_id: Some(key.player_id.clone()),
                channel,
                reply_to: channel,
                invocation,
                is_direct_dispatch: false,
                wave,
            };
            pending.insert(call.invocation_id.clone(), call.clone());
            calls.push(call);
        }

        tracing::info!(
            message_id = %key.message_id,
            player_id = %key.player_id,
            wave,
            count = calls.len(),
            tools = ?calls.iter().map(|c| c.invocation.name.as_str()).collect::<Vec<_>>(),
            "tool wave registered"
        );

        calls
    }

    /// Send one `tool_call` per registered call and arm their timers.
    fn dispatch(&self, calls: &[PendingCall]) -> Result<(), AgentError> {
        for call in calls {
            self.sessions.send(
                call.channel,
                OutboundMessage::ToolCall {
                    message_id: call.originating_turn_id.clone(),
                    tool: call.invocation.name.clone(),
                    tool_call_id: Some(call.invocation_id.clone()),
                    args: call.invocation.arguments.clone(),
                    player_id: call.player_id.clone(),
                },
            )?;
            self.arm_timeout(call);
        }
        Ok(())
    }

    fn arm_timeout(&self, call: &PendingCall) {
        let Some(timeout) = self.settings.result_timeout else {
            return;
        };
        let tx = self.expired_tx.clone();
        let call = call.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Receiver gone means the correlator was dropped.
            let _ = tx.send(call);
        });
    }

    /// Resolve a timed-out call with a synthesized failure, if still pending.
    async fn expire(&self, call: PendingCall) {
        let still_pending = self.pending().get(&call.invocation_id) == Some(&call);
        if !still_pending {
            return;
        }

        let secs = self.settings.result_timeout.map(|t| t.as_secs()).unwrap_or_default();
        tracing::warn!(
            tool_call_id = %call.invocation_id,
            tool = %call.invocation.name,
            message_id = %call.originating_turn_id,
            timeout_secs = secs,
            "tool result timed out"
        );

        let report = ToolResultReport {
            message_id: Some(call.originating_turn_id.clone()),
            tool_call_id: Some(call.invocation_id.clone()),
            tool: Some(call.invocation.name.clone()),
            success: false,
            result: serde_json::Value::String(format!(
                "timed out after {secs}s waiting for the game server"
            )),
        };
        self.handle_tool_result(report).await;
    }

    // ─── Tool results ────────────────────────────────────────────────────

    /// Find the pending call a result answers, optionally limited to one
    /// player's calls.
    ///
    /// `tool_call_id` first; otherwise the earliest call with the same
    /// originating message ID and tool name.
    fn match_pending<'a>(
        pending: &'a IndexMap<String, PendingCall>,
        report: &ToolResultReport,
        player_id: Option<&str>,
    ) -> Option<&'a PendingCall> {
        let owned = |c: &&PendingCall| player_id.is_none() || c.player_id.as_deref() == player_id;

        if let Some(id) = report.tool_call_id.as_deref().filter(|id| !id.is_empty()) {
            if let Some(call) = pending.get(id).filter(owned) {
                return Some(call);
            }
        }

        let (Some(message_id), Some(tool)) = (report.message_id.as_deref(), report.tool.as_deref())
        else {
            return None;
        };

        pending
            .values()
            .filter(owned)
            .find(|c| c.originating_turn_id == message_id && c.invocation.name == tool)
    }

    fn find_pending(&self, report: &ToolResultReport) -> Option<PendingCall> {
        Self::match_pending(&self.pending(), report, None).cloned()
    }

    /// Match and remove in one critical section, so concurrent id-less
    /// results for the same tool each claim a different call.
    fn take_matching(&self, report: &ToolResultReport, player_id: &str) -> Option<PendingCall> {
        let mut pending = self.pending();
        let id = Self::match_pending(&pending, report, Some(player_id))?
            .invocation_id
            .clone();
        pending.shift_remove(&id)
    }

    fn take_pending(&self, invocation_id: &str) -> Option<PendingCall> {
        self.pending().shift_remove(invocation_id)
    }

    /// Pending calls still owed for a turn.
    fn remaining_for(&self, key: &TurnKey) -> usize {
        self.pending()
            .values()
            .filter(|c| {
                !c.is_direct_dispatch
                    && c.originating_turn_id == key.message_id
                    && c.player_id.as_deref() == Some(key.player_id.as_str())
            })
            .count()
    }

    /// Feed a game-side tool result into its turn. Unmatched results are
    /// logged and dropped.
    pub async fn handle_tool_result(&self, report: ToolResultReport) {
        let Some(found) = self.find_pending(&report) else {
            let err = AgentError::UnresolvedCorrelation {
                tool_call_id: report.tool_call_id.clone(),
                message_id: report.message_id.clone().unwrap_or_default(),
                tool: report.tool.clone().unwrap_or_default(),
            };
            tracing::warn!(error = %err, pending = self.pending().len(), "dropping tool result");
            return;
        };

        if found.is_direct_dispatch {
            if let Some(call) = self.take_pending(&found.invocation_id) {
                self.relay_direct_result(call, report);
            }
            return;
        }

        // The lookup above only picks the player. The call itself is claimed
        // under that player's lock, since other results may land meanwhile.
        let player_id = found.player_id.clone().unwrap_or_default();
        let conversation = self.conversations.handle(&player_id);
        let mut conv = conversation.lock().await;

        let Some(call) = self.take_matching(&report, &player_id) else {
            tracing::debug!(
                tool_call_id = ?report.tool_call_id,
                message_id = ?report.message_id,
                tool = ?report.tool,
                "pending call already resolved"
            );
            return;
        };

        conv.append_tool_result(
            &call.invocation.id,
            &call.invocation.name,
            report.success,
            report.result,
        );

        let key = TurnKey::new(&player_id, &call.originating_turn_id);
        let remaining = self.remaining_for(&key);

        tracing::info!(
            message_id = %key.message_id,
            player_id = %player_id,
            tool_call_id = %call.invocation_id,
            tool = %call.invocation.name,
            success = report.success,
            wave = call.wave,
            remaining,
            "tool result correlated"
        );

        if remaining > 0 {
            self.set_state(
                &key,
                TurnState::ToolsPending {
                    wave: call.wave,
                    outstanding: remaining,
                },
            );
            return;
        }

        // Wave closed: continue the conversation with every result in place.
        self.run_completion(&key, &mut conv, call.reply_to).await;
    }

    fn relay_direct_result(&self, call: PendingCall, report: ToolResultReport) {
        tracing::info!(
            message_id = %call.originating_turn_id,
            tool = %call.invocation.name,
            success = report.success,
            "relaying direct tool result"
        );
        self.send(
            call.reply_to,
            OutboundMessage::ToolResult {
                message_id: call.originating_turn_id,
                success: report.success,
                result: Some(report.result),
                error: None,
            },
        );
    }

    // ─── Direct dispatch ─────────────────────────────────────────────────

    /// Forward a pre-formed tool call to a game server, bypassing the model.
    /// The result goes back to `from` without touching any conversation.
    pub fn handle_direct_tool_call(&self, from: ChannelId, request: DirectToolCall) {
        let message_id = request.message_id;

        let reject = |error: String| {
            self.send(
                from,
                OutboundMessage::ToolResult {
                    message_id: message_id.clone(),
                    success: false,
                    result: None,
                    error: Some(error),
                },
            );
        };

        let Some(target) = self.sessions.pick_game_channel() else {
            tracing::warn!(message_id = %message_id, tool = %request.tool, "direct tool call with no game server");
            reject(AgentError::NoTargetChannel.user_message());
            return;
        };

        let call = PendingCall {
            invocation_id: message_id.clone(),
            originating_turn_id: message_id.clone(),
            player_id: None,
            channel: target,
            reply_to: from,
            invocation: ToolInvocation {
                id: message_id.clone(),
                name: request.tool,
                arguments: request.args,
            },
            is_direct_dispatch: true,
            wave: 0,
        };

        {
            let mut pending = self.pending();
            if pending.contains_key(&message_id) {
                drop(pending);
                tracing::warn!(message_id = %message_id, "direct tool call id already pending");
                reject(format!("tool call '{message_id}' is already pending"));
                return;
            }
            pending.insert(message_id.clone(), call.clone());
        }

        tracing::info!(
            message_id = %message_id,
            tool = %call.invocation.name,
            target = %target,
            "dispatching direct tool call"
        );

        if let Err(err) = self.dispatch(std::slice::from_ref(&call)) {
            self.take_pending(&message_id);
            reject(err.user_message());
        }
    }

    // ─── Turn lifecycle ──────────────────────────────────────────────────

    fn begin_turn(&self, key: &TurnKey) {
        let record = TurnRecord {
            state: TurnState::AwaitingCompletion,
            waves: 0,
            started_at: Utc::now(),
        };
        if self.turns().insert(key.clone(), record).is_some() {
            tracing::warn!(message_id = %key.message_id, player_id = %key.player_id, "message id reused while its turn was live");
        }
    }

    fn next_wave(&self, key: &TurnKey) -> u32 {
        let mut turns = self.turns();
        match turns.get_mut(key) {
            Some(record) => {
                record.waves += 1;
                record.waves
            }
            None => 1,
        }
    }

    fn set_state(&self, key: &TurnKey, state: TurnState) {
        if let Some(record) = self.turns().get_mut(key) {
            tracing::debug!(
                message_id = %key.message_id,
                from = record.state.label(),
                to = state.label(),
                "turn state"
            );
            record.state = state;
        }
    }

    fn finish_turn(&self, key: &TurnKey, state: TurnState) {
        debug_assert!(state.is_terminal());
        if let Some(record) = self.turns().remove(key) {
            let elapsed_ms = (Utc::now() - record.started_at).num_milliseconds();
            tracing::info!(
                message_id = %key.message_id,
                player_id = %key.player_id,
                state = state.label(),
                waves = record.waves,
                elapsed_ms,
                "turn finished"
            );
        }
    }

    /// Abort a turn: discard its pending calls and send one error reply.
    fn fail_turn(&self, key: &TurnKey, reply_to: ChannelId, err: AgentError) {
        tracing::error!(
            message_id = %key.message_id,
            player_id = %key.player_id,
            error = %err,
            "turn failed"
        );

        let discarded = {
            let mut pending = self.pending();
            let before = pending.len();
            pending.retain(|_, c| {
                c.is_direct_dispatch
                    || c.originating_turn_id != key.message_id
                    || c.player_id.as_deref() != Some(key.player_id.as_str())
            });
            before - pending.len()
        };
        if discarded > 0 {
            tracing::debug!(message_id = %key.message_id, discarded, "discarded pending calls");
        }

        self.send(
            reply_to,
            OutboundMessage::Error {
                message_id: key.message_id.clone(),
                error: err.user_message(),
            },
        );
        self.finish_turn(key, TurnState::Failed);
    }

    // ─── Reset ───────────────────────────────────────────────────────────

    /// Discard a player's history, pending calls and turn records.
    pub fn reset(&self, player_id: &str) {
        let had_history = self.conversations.reset(player_id);
        self.pending()
            .retain(|_, c| c.player_id.as_deref() != Some(player_id));
        self.turns().retain(|k, _| k.player_id != player_id);
        tracing::info!(player_id, had_history, "conversation reset");
    }

    /// Discard everything.
    pub fn reset_all(&self) {
        let conversations = self.conversations.reset_all();
        let pending = {
            let mut pending = self.pending();
            let n = pending.len();
            pending.clear();
            n
        };
        self.turns().clear();
        tracing::info!(conversations, pending, "all conversations reset");
    }

    /// Number of outstanding tool calls.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// State of a live turn.
    pub fn turn_state(&self, player_id: &str, message_id: &str) -> Option<TurnState> {
        self.turns()
            .get(&TurnKey::new(player_id, message_id))
            .map(|r| r.state)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::agent_core::conversation::HistoryLimits;
    use crate::agent_core::errors::RATE_LIMIT_MESSAGE;
    use crate::bridge::protocol::{PlayerInfo, ServerInfo};
    use crate::inference::types::{ChatCompletionRequest, Role, StreamDelta, ToolCallFragment};
    use crate::inference::{
        CompletionProvider, InferenceError, ProviderResponse, ReconstructOptions, RequestOptions,
        RetryPolicy,
    };

    // ─── Scripted provider ───────────────────────────────────────────────

    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<ProviderResponse, InferenceError>>>,
        requests: Mutex<Vec<ChatCompletionRequest>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<ProviderResponse, InferenceError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, n: usize) -> ChatCompletionRequest {
            self.requests.lock().unwrap()[n].clone()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(
            &self,
            request: ChatCompletionRequest,
        ) -> Result<ProviderResponse, InferenceError> {
            self.requests.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ProviderResponse::Full(StreamDelta::text("script exhausted"))))
        }
    }

    fn text(t: &str) -> Result<ProviderResponse, InferenceError> {
        Ok(ProviderResponse::Full(StreamDelta::text(t)))
    }

    fn tool_calls(calls: &[(&str, &str)]) -> Result<ProviderResponse, InferenceError> {
        let fragments = calls
            .iter()
            .enumerate()
            .map(|(i, (id, name))| ToolCallFragment {
                index: i as u32,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some("{\"npc_type\":\"zombie\"}".to_string()),
            })
            .collect();
        Ok(ProviderResponse::Full(StreamDelta {
            tool_calls: fragments,
            ..StreamDelta::default()
        }))
    }

    // ─── Harness ─────────────────────────────────────────────────────────

    struct Harness {
        correlator: Arc<Correlator>,
        provider: Arc<ScriptedProvider>,
        game: ChannelId,
        game_rx: UnboundedReceiver<OutboundMessage>,
    }

    fn harness(
        script: Vec<Result<ProviderResponse, InferenceError>>,
        settings: CorrelatorSettings,
    ) -> Harness {
        let provider = ScriptedProvider::new(script);
        let catalog = Arc::new(ToolCatalog::builtin().unwrap());
        let sessions = Arc::new(SessionRegistry::new());

        let (tx, game_rx) = mpsc::unbounded_channel();
        let game = sessions.register(tx);
        sessions.set_info(
            game,
            ServerInfo {
                server_name: "Test Server".to_string(),
                map: "gm_construct".to_string(),
                max_players: 8,
                player_count: 1,
            },
        );

        let gateway = CompletionGateway::new(
            provider.clone(),
            catalog.definitions(),
            RequestOptions {
                model: "test-model".to_string(),
                stream: false,
                ..RequestOptions::default()
            },
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            ReconstructOptions {
                forward_thinking: settings.show_thinking,
                ..ReconstructOptions::default()
            },
        );

        let correlator = Correlator::new(
            gateway,
            catalog,
            ConversationStore::new("system", HistoryLimits::default()),
            sessions,
            settings,
        );

        Harness {
            correlator,
            provider,
            game,
            game_rx,
        }
    }

    fn chat(message_id: &str, player: &str, text: &str) -> ChatRequest {
        ChatRequest {
            message_id: message_id.to_string(),
            player: PlayerInfo {
                steamid: Some(player.to_string()),
                name: Some("Tester".to_string()),
                ..PlayerInfo::default()
            },
            text: text.to_string(),
            map: Some("gm_construct".to_string()),
        }
    }

    fn report(tool_call_id: Option<&str>, message_id: &str, tool: &str) -> ToolResultReport {
        ToolResultReport {
            message_id: Some(message_id.to_string()),
            tool_call_id: tool_call_id.map(String::from),
            tool: Some(tool.to_string()),
            success: true,
            result: serde_json::json!({"ok": true}),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn kinds(messages: &[OutboundMessage]) -> Vec<&'static str> {
        messages.iter().map(OutboundMessage::kind).collect()
    }

    fn tool_message_ids(request: &ChatCompletionRequest) -> Vec<String> {
        request
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.clone())
            .collect()
    }

    // ─── Plain responses ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_plain_text_finalizes() {
        let mut h = harness(vec![text("Hello there!")], CorrelatorSettings::default());
        h.correlator.handle_chat(h.game, chat("m1", "p1", "hi")).await;

        let out = drain(&mut h.game_rx);
        assert_eq!(kinds(&out), vec!["thinking", "response_end", "response"]);
        assert_eq!(
            out[2],
            OutboundMessage::Response {
                message_id: "m1".to_string(),
                text: "Hello there!".to_string(),
            }
        );
        assert!(h.correlator.turn_state("p1", "m1").is_none());

        let req = h.provider.request(0);
        assert_eq!(req.messages.len(), 2);
        assert!(req.messages[1].content.as_deref().unwrap().contains("[Player Message]\nhi"));
        assert_eq!(req.tool_choice.as_deref(), Some("auto"));
    }

    #[tokio::test]
    async fn test_history_carries_across_turns() {
        let h = harness(vec![text("one"), text("two")], CorrelatorSettings::default());
        h.correlator.handle_chat(h.game, chat("m1", "p1", "first")).await;
        h.correlator.handle_chat(h.game, chat("m2", "p1", "second")).await;

        let req = h.provider.request(1);
        let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
    }

    // ─── Waves ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_wave_closes_only_after_all_results() {
        let mut h = harness(
            vec![tool_calls(&[("A", "spawn_npc"), ("B", "spawn_npc")]), text("Done!")],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "two zombies")).await;

        let out = drain(&mut h.game_rx);
        assert_eq!(kinds(&out), vec!["thinking", "tool_call", "tool_call"]);
        assert!(matches!(
            &out[1],
            OutboundMessage::ToolCall { tool_call_id: Some(id), player_id: Some(p), .. } if id == "A" && p == "p1"
        ));
        assert_eq!(h.correlator.pending_count(), 2);
        assert_eq!(
            h.correlator.turn_state("p1", "M1"),
            Some(TurnState::ToolsPending { wave: 1, outstanding: 2 })
        );

        // B first: the wave stays open.
        h.correlator.handle_tool_result(report(Some("B"), "M1", "spawn_npc")).await;
        assert_eq!(h.provider.calls(), 1);
        assert_eq!(
            h.correlator.turn_state("p1", "M1"),
            Some(TurnState::ToolsPending { wave: 1, outstanding: 1 })
        );
        assert!(drain(&mut h.game_rx).is_empty());

        // A closes it: exactly one continuation.
        h.correlator.handle_tool_result(report(Some("A"), "M1", "spawn_npc")).await;
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(h.correlator.pending_count(), 0);

        let continuation = h.provider.request(1);
        let roles: Vec<Role> = continuation.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Tool]
        );
        let calls = continuation.messages[2].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(tool_message_ids(&continuation), vec!["B", "A"]);

        let out = drain(&mut h.game_rx);
        assert_eq!(kinds(&out), vec!["response_end", "response"]);
        assert!(h.correlator.turn_state("p1", "M1").is_none());
    }

    #[tokio::test]
    async fn test_chained_waves_share_message_id() {
        let mut h = harness(
            vec![
                tool_calls(&[("A", "spawn_npc")]),
                tool_calls(&[("C", "give_weapon")]),
                text("All set."),
            ],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "arm a zombie")).await;
        h.correlator.handle_tool_result(report(Some("A"), "M1", "spawn_npc")).await;

        assert_eq!(
            h.correlator.turn_state("p1", "M1"),
            Some(TurnState::ToolsPending { wave: 2, outstanding: 1 })
        );
        let out = drain(&mut h.game_rx);
        assert!(matches!(
            out.last(),
            Some(OutboundMessage::ToolCall { message_id, tool, .. }) if message_id == "M1" && tool == "give_weapon"
        ));

        h.correlator.handle_tool_result(report(Some("C"), "M1", "give_weapon")).await;
        assert_eq!(h.provider.calls(), 3);
        assert_eq!(tool_message_ids(&h.provider.request(2)), vec!["A", "C"]);
        assert_eq!(kinds(&drain(&mut h.game_rx)), vec!["response_end", "response"]);
    }

    #[tokio::test]
    async fn test_fallback_correlation_without_call_id() {
        let h = harness(
            vec![tool_calls(&[("A", "spawn_npc"), ("B", "give_weapon")]), text("ok")],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;

        h.correlator.handle_tool_result(report(None, "M1", "give_weapon")).await;
        h.correlator.handle_tool_result(report(None, "M1", "spawn_npc")).await;

        assert_eq!(h.provider.calls(), 2);
        assert_eq!(tool_message_ids(&h.provider.request(1)), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_fallback_takes_first_match_for_duplicate_tool() {
        let h = harness(
            vec![tool_calls(&[("A", "spawn_npc"), ("B", "spawn_npc")]), text("ok")],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;

        h.correlator.handle_tool_result(report(None, "M1", "spawn_npc")).await;
        h.correlator.handle_tool_result(report(None, "M1", "spawn_npc")).await;

        assert_eq!(tool_message_ids(&h.provider.request(1)), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_concurrent_idless_results_claim_distinct_calls() {
        let h = harness(
            vec![tool_calls(&[("A", "spawn_npc"), ("B", "spawn_npc")]), text("ok")],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;

        // Both results queue up behind a busy player lock.
        let conversation = h.correlator.conversations.handle("p1");
        let guard = conversation.lock().await;
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let correlator = h.correlator.clone();
                tokio::spawn(async move {
                    correlator.handle_tool_result(report(None, "M1", "spawn_npc")).await;
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(h.correlator.pending_count(), 0);
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(tool_message_ids(&h.provider.request(1)), vec!["A", "B"]);
        assert!(h.correlator.turn_state("p1", "M1").is_none());
    }

    #[tokio::test]
    async fn test_results_stay_with_their_player() {
        let h = harness(
            vec![tool_calls(&[("A", "spawn_npc")]), tool_calls(&[("B", "spawn_npc")])],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;
        h.correlator.handle_chat(h.game, chat("M1", "p2", "y")).await;

        h.correlator.handle_tool_result(report(Some("B"), "M1", "spawn_npc")).await;
        assert_eq!(h.correlator.pending_count(), 1);
        assert_eq!(
            h.correlator.turn_state("p1", "M1"),
            Some(TurnState::ToolsPending { wave: 1, outstanding: 1 })
        );
    }

    #[tokio::test]
    async fn test_unresolved_result_is_dropped() {
        let mut h = harness(vec![tool_calls(&[("A", "spawn_npc")])], CorrelatorSettings::default());
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;
        drain(&mut h.game_rx);

        h.correlator.handle_tool_result(report(Some("nope"), "M9", "spawn_npc")).await;
        h.correlator.handle_tool_result(report(None, "M1", "give_weapon")).await;

        assert_eq!(h.correlator.pending_count(), 1);
        assert_eq!(h.provider.calls(), 1);
        assert!(drain(&mut h.game_rx).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_result_after_resolution_is_dropped() {
        let h = harness(
            vec![tool_calls(&[("A", "spawn_npc")]), text("ok")],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;
        h.correlator.handle_tool_result(report(Some("A"), "M1", "spawn_npc")).await;
        h.correlator.handle_tool_result(report(Some("A"), "M1", "spawn_npc")).await;
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_colliding_invocation_ids_are_reassigned() {
        let h = harness(
            vec![
                tool_calls(&[("call_0", "spawn_npc")]),
                tool_calls(&[("call_0", "spawn_npc")]),
            ],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;
        h.correlator.handle_chat(h.game, chat("M2", "p2", "y")).await;

        assert_eq!(h.correlator.pending_count(), 2);
        assert_eq!(
            h.correlator.turn_state("p2", "M2"),
            Some(TurnState::ToolsPending { wave: 1, outstanding: 1 })
        );
    }

    // ─── Failures ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_provider_error_yields_single_error_reply() {
        let mut h = harness(
            vec![Err(InferenceError::HttpError {
                status: 500,
                body: "model crashed".to_string(),
            })],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("m1", "p1", "hi")).await;

        let out = drain(&mut h.game_rx);
        assert_eq!(kinds(&out), vec!["thinking", "error"]);
        assert!(matches!(&out[1], OutboundMessage::Error { message_id, .. } if message_id == "m1"));
        assert!(h.correlator.turn_state("p1", "m1").is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_is_explicit() {
        let limited = || {
            Err(InferenceError::RateLimited {
                status: 429,
                body: String::new(),
            })
        };
        let mut h = harness(vec![limited(), limited(), limited()], CorrelatorSettings::default());
        h.correlator.handle_chat(h.game, chat("m1", "p1", "hi")).await;

        assert_eq!(h.provider.calls(), 3);
        let out = drain(&mut h.game_rx);
        assert_eq!(
            out.last(),
            Some(&OutboundMessage::Error {
                message_id: "m1".to_string(),
                error: RATE_LIMIT_MESSAGE.to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_continuation_failure_reports_error() {
        let mut h = harness(
            vec![
                tool_calls(&[("A", "spawn_npc")]),
                Err(InferenceError::StreamError {
                    reason: "reset".to_string(),
                }),
            ],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;
        drain(&mut h.game_rx);

        h.correlator.handle_tool_result(report(Some("A"), "M1", "spawn_npc")).await;
        assert_eq!(kinds(&drain(&mut h.game_rx)), vec!["error"]);
        assert!(h.correlator.turn_state("p1", "M1").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_to_closed_channel_discards_wave() {
        let h = harness(
            vec![tool_calls(&[("A", "spawn_npc"), ("B", "spawn_npc")])],
            CorrelatorSettings::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let gone = h.correlator.sessions().register(tx);
        drop(rx);

        h.correlator.handle_chat(gone, chat("M1", "p1", "x")).await;
        assert_eq!(h.correlator.pending_count(), 0);
        assert!(h.correlator.turn_state("p1", "M1").is_none());
    }

    // ─── Direct dispatch ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_direct_dispatch_round_trip() {
        let mut h = harness(vec![], CorrelatorSettings::default());
        let (tx, mut caller_rx) = mpsc::unbounded_channel();
        let caller = h.correlator.sessions().register(tx);

        h.correlator.handle_direct_tool_call(
            caller,
            DirectToolCall {
                message_id: "x1".to_string(),
                tool: "get_players".to_string(),
                args: serde_json::json!({}),
            },
        );

        let sent = drain(&mut h.game_rx);
        assert!(matches!(
            &sent[..],
            [OutboundMessage::ToolCall { message_id, tool, player_id: None, .. }] if message_id == "x1" && tool == "get_players"
        ));

        h.correlator.handle_tool_result(report(None, "x1", "get_players")).await;

        let relayed = drain(&mut caller_rx);
        assert_eq!(
            relayed,
            vec![OutboundMessage::ToolResult {
                message_id: "x1".to_string(),
                success: true,
                result: Some(serde_json::json!({"ok": true})),
                error: None,
            }]
        );
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(h.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_direct_dispatch_without_game_server() {
        let h = harness(vec![], CorrelatorSettings::default());
        h.correlator.sessions().unregister(h.game);
        let (tx, mut caller_rx) = mpsc::unbounded_channel();
        let caller = h.correlator.sessions().register(tx);

        h.correlator.handle_direct_tool_call(
            caller,
            DirectToolCall {
                message_id: "x1".to_string(),
                tool: "get_players".to_string(),
                args: serde_json::json!({}),
            },
        );

        assert_eq!(
            drain(&mut caller_rx),
            vec![OutboundMessage::ToolResult {
                message_id: "x1".to_string(),
                success: false,
                result: None,
                error: Some("No GMod server connected".to_string()),
            }]
        );
        assert_eq!(h.correlator.pending_count(), 0);
    }

    // ─── Timeouts, reset, streaming ──────────────────────────────────────

    #[tokio::test]
    async fn test_result_timeout_closes_wave() {
        let h = harness(
            vec![tool_calls(&[("A", "spawn_npc")]), text("Sorry, that took too long.")],
            CorrelatorSettings {
                show_thinking: false,
                result_timeout: Some(Duration::from_millis(20)),
            },
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;

        for _ in 0..50 {
            if h.provider.calls() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(h.provider.calls(), 2);
        let continuation = h.provider.request(1);
        let tool_msg = continuation.messages.last().unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("A"));
        let body: serde_json::Value =
            serde_json::from_str(tool_msg.content.as_deref().unwrap()).unwrap();
        assert_eq!(body["success"], false);
        assert!(body["result"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_reset_discards_pending_calls() {
        let h = harness(vec![tool_calls(&[("A", "spawn_npc")])], CorrelatorSettings::default());
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;
        assert_eq!(h.correlator.pending_count(), 1);

        h.correlator.reset("p1");
        assert_eq!(h.correlator.pending_count(), 0);
        assert!(h.correlator.turn_state("p1", "M1").is_none());

        h.correlator.handle_tool_result(report(Some("A"), "M1", "spawn_npc")).await;
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_reset_all_clears_everything() {
        let h = harness(
            vec![tool_calls(&[("A", "spawn_npc")]), tool_calls(&[("B", "spawn_npc")])],
            CorrelatorSettings::default(),
        );
        h.correlator.handle_chat(h.game, chat("M1", "p1", "x")).await;
        h.correlator.handle_chat(h.game, chat("M2", "p2", "y")).await;
        h.correlator.reset_all();
        assert_eq!(h.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_streamed_thinking_forwarded_when_enabled() {
        let deltas = futures::stream::iter(vec![
            Ok(StreamDelta::text("<thi")),
            Ok(StreamDelta::text("nk>plan</thi")),
            Ok(StreamDelta::text("nk>Hi")),
        ])
        .boxed();
        let mut h = harness(
            vec![Ok(ProviderResponse::Stream(deltas))],
            CorrelatorSettings {
                show_thinking: true,
                result_timeout: None,
            },
        );
        h.correlator.handle_chat(h.game, chat("m1", "p1", "hi")).await;

        let out = drain(&mut h.game_rx);
        assert_eq!(
            kinds(&out),
            vec!["thinking", "thinking", "response_stream", "response_end", "response"]
        );
        assert_eq!(
            out[1],
            OutboundMessage::Thinking {
                message_id: "m1".to_string(),
                content: Some("plan".to_string()),
            }
        );
        assert_eq!(
            out[2],
            OutboundMessage::ResponseStream {
                message_id: "m1".to_string(),
                chunk: "Hi".to_string(),
            }
        );
    }
}
