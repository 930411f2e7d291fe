//! WebSocket server. Accepts game servers and tool callers and routes their
//! frames into the correlator.
//!
//! Each connection gets one writer task fed by an unbounded channel registered
//! in the session registry, so any task can send to any channel. Inbound
//! frames are parsed in order; chat and tool results run on their own tasks
//! so a slow completion never stalls the connection's reader.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{parse_inbound, InboundMessage, OutboundMessage, ResetRequest};
use crate::agent_core::{ChannelId, Correlator};

/// Longest payload excerpt written to debug logs.
const LOG_PAYLOAD_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("accept failed: {reason}")]
    AcceptFailed { reason: String },
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub struct BridgeServer {
    listener: TcpListener,
    correlator: Arc<Correlator>,
}

impl BridgeServer {
    pub async fn bind(addr: &str, correlator: Arc<Correlator>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            listener,
            correlator,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections until `shutdown` resolves, then discard all
    /// conversation state.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(addr = ?self.local_addr(), "bridge listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(|e| ServerError::AcceptFailed {
                        reason: e.to_string(),
                    })?;
                    let correlator = self.correlator.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, correlator).await;
                    });
                }
            }
        }

        self.correlator.reset_all();
        Ok(())
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer: SocketAddr, correlator: Arc<Correlator>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut writer, mut reader) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let channel = correlator.sessions().register(tx);
    tracing::info!(peer = %peer, channel = %channel, "client connected");

    // Ends once the registry drops the sender.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(channel = %channel, kind = message.kind(), error = %e, "failed to serialize outbound message");
                    continue;
                }
            };
            tracing::debug!(channel = %channel, payload = %truncate_for_log(&payload), "send");
            if let Err(e) = writer.send(Message::Text(payload)).await {
                tracing::warn!(channel = %channel, error = %e, "send failed, closing writer");
                break;
            }
        }
        let _ = writer.close().await;
    });

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&correlator, channel, &text),
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                tracing::warn!(channel = %channel, "ignoring binary frame");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "websocket read failed");
                break;
            }
        }
    }

    correlator.sessions().unregister(channel);
    tracing::info!(peer = %peer, channel = %channel, "client disconnected");
    writer_task.abort();
}

/// Route one inbound text frame. Malformed frames are logged and dropped
/// without a reply.
fn dispatch(correlator: &Arc<Correlator>, channel: ChannelId, text: &str) {
    tracing::debug!(channel = %channel, payload = %truncate_for_log(text), "recv");

    let message = match parse_inbound(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "dropping malformed message");
            return;
        }
    };

    match message {
        InboundMessage::Handshake(info) => {
            tracing::info!(
                channel = %channel,
                server_name = %info.server_name,
                map = %info.map,
                players = info.player_count,
                max_players = info.max_players,
                "game server handshake"
            );
            correlator.sessions().set_info(channel, info);
        }
        InboundMessage::Chat(request) => {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator.handle_chat(channel, request).await;
            });
        }
        InboundMessage::ToolResult(report) => {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator.handle_tool_result(report).await;
            });
        }
        InboundMessage::DirectToolCall(call) => {
            correlator.handle_direct_tool_call(channel, call);
        }
        InboundMessage::Reset(ResetRequest { player_id }) => match player_id {
            Some(player_id) => correlator.reset(&player_id),
            None => correlator.reset_all(),
        },
    }
}

fn truncate_for_log(payload: &str) -> &str {
    match payload.char_indices().nth(LOG_PAYLOAD_CHARS) {
        Some((idx, _)) => &payload[..idx],
        None => payload,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::oneshot;

    use crate::agent_core::{ConversationStore, CorrelatorSettings, HistoryLimits, SessionRegistry};
    use crate::inference::types::ChatCompletionRequest;
    use crate::inference::{
        CompletionGateway, CompletionProvider, InferenceError, ProviderResponse,
        ReconstructOptions, RequestOptions, RetryPolicy, StreamDelta,
    };
    use crate::tools::ToolCatalog;

    /// Replies with the last user message's player text.
    struct EchoProvider;

    #[async_trait]
    impl CompletionProvider for EchoProvider {
        async fn complete(
            &self,
            request: ChatCompletionRequest,
        ) -> Result<ProviderResponse, InferenceError> {
            let last = request
                .messages
                .last()
                .and_then(|m| m.content.clone())
                .unwrap_or_default();
            let text = last.rsplit("[Player Message]\n").next().unwrap_or_default();
            Ok(ProviderResponse::Full(StreamDelta::text(format!("echo: {text}"))))
        }
    }

    async fn start() -> (SocketAddr, oneshot::Sender<()>) {
        let catalog = Arc::new(ToolCatalog::builtin().unwrap());
        let gateway = CompletionGateway::new(
            Arc::new(EchoProvider),
            catalog.definitions(),
            RequestOptions::default(),
            RetryPolicy::default(),
            ReconstructOptions::default(),
        );
        let correlator = Correlator::new(
            gateway,
            catalog,
            ConversationStore::new("system", HistoryLimits::default()),
            Arc::new(SessionRegistry::new()),
            CorrelatorSettings::default(),
        );

        let server = BridgeServer::bind("127.0.0.1:0", correlator).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(server.serve(async move {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx)
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >;

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut Client, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let (addr, _stop) = start().await;
        let mut game = connect(addr).await;

        send(&mut game, json!({"type": "handshake", "server_name": "Test", "map": "gm_flatgrass"})).await;
        send(
            &mut game,
            json!({
                "type": "chat",
                "message_id": "m1",
                "player": {"steamid": "STEAM_0:0:1", "name": "Alyx"},
                "text": "hello"
            }),
        )
        .await;

        assert_eq!(recv(&mut game).await, json!({"type": "thinking", "message_id": "m1"}));
        assert_eq!(recv(&mut game).await, json!({"type": "response_end", "message_id": "m1"}));
        let response = recv(&mut game).await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["text"], "echo: hello");
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_no_reply() {
        let (addr, _stop) = start().await;
        let mut client = connect(addr).await;

        client.send(Message::Text("not json".to_string())).await.unwrap();
        send(&mut client, json!({"type": "teleport"})).await;
        send(&mut client, json!({"type": "mcp_tool_call", "message_id": "x1", "tool": "get_players"})).await;

        // First reply belongs to the valid frame.
        let reply = recv(&mut client).await;
        assert_eq!(reply["type"], "tool_result");
        assert_eq!(reply["message_id"], "x1");
    }

    #[tokio::test]
    async fn test_direct_call_without_game_server() {
        let (addr, _stop) = start().await;
        let mut caller = connect(addr).await;

        send(&mut caller, json!({"type": "direct_tool_call", "message_id": "x1", "tool": "get_players", "args": {}})).await;
        assert_eq!(
            recv(&mut caller).await,
            json!({
                "type": "tool_result",
                "message_id": "x1",
                "success": false,
                "error": "No GMod server connected"
            })
        );
    }

    #[tokio::test]
    async fn test_direct_call_relayed_through_game_server() {
        let (addr, _stop) = start().await;
        let mut game = connect(addr).await;
        send(&mut game, json!({"type": "handshake", "server_name": "Test"})).await;
        // Handshake is processed in order with the next frame on this connection.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut caller = connect(addr).await;
        send(&mut caller, json!({"type": "direct_tool_call", "message_id": "x7", "tool": "get_players", "args": {}})).await;

        let call = recv(&mut game).await;
        assert_eq!(call["type"], "tool_call");
        assert_eq!(call["tool"], "get_players");
        assert_eq!(call["tool_call_id"], "x7");

        send(&mut game, json!({"type": "tool_result", "message_id": "x7", "tool": "get_players", "success": true, "result": {"count": 3}})).await;
        let relayed = recv(&mut caller).await;
        assert_eq!(relayed["success"], true);
        assert_eq!(relayed["result"]["count"], 3);
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short"), "short");
        let long = "é".repeat(300);
        assert_eq!(truncate_for_log(&long).chars().count(), LOG_PAYLOAD_CHARS);
    }
}
