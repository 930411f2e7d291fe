//! Registry of connected peers and their outbound queues.
//!
//! Each WebSocket connection registers an unbounded sender; the connection's
//! writer task drains the other end. Sending never blocks, and a send to a
//! channel that has gone away fails fast instead of hanging.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;

use super::errors::AgentError;
use crate::bridge::protocol::{OutboundMessage, ServerInfo};

// ─── Channel IDs ─────────────────────────────────────────────────────────────

/// Global monotonic channel ID counter.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for one connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a fresh, never reused ID.
    pub fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

struct ChannelEntry {
    sender: UnboundedSender<OutboundMessage>,
    /// Set once the peer identifies itself as a game server.
    info: Option<ServerInfo>,
    connected_at: DateTime<Utc>,
}

/// Tracks connected channels. Ordered by ID, so "first game server" means
/// the longest-connected one.
#[derive(Default)]
pub struct SessionRegistry {
    channels: RwLock<BTreeMap<ChannelId, ChannelEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ChannelId, ChannelEntry>> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ChannelId, ChannelEntry>> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new connection.
    pub fn register(&self, sender: UnboundedSender<OutboundMessage>) -> ChannelId {
        let id = ChannelId::next();
        self.write().insert(
            id,
            ChannelEntry {
                sender,
                info: None,
                connected_at: Utc::now(),
            },
        );
        tracing::info!(channel = %id, "channel registered");
        id
    }

    /// Drop a connection. In-flight work that later targets it gets
    /// `ChannelClosed` / `NoTargetChannel`.
    pub fn unregister(&self, id: ChannelId) -> bool {
        match self.write().remove(&id) {
            Some(entry) => {
                let connected_secs = (Utc::now() - entry.connected_at).num_seconds();
                tracing::info!(
                    channel = %id,
                    connected_secs,
                    server = entry.info.as_ref().map(|i| i.server_name.as_str()).unwrap_or("-"),
                    "channel unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Record handshake metadata, marking the channel as a game server.
    pub fn set_info(&self, id: ChannelId, info: ServerInfo) -> bool {
        match self.write().get_mut(&id) {
            Some(entry) => {
                tracing::info!(
                    channel = %id,
                    server = %info.server_name,
                    map = %info.map,
                    players = info.player_count,
                    max_players = info.max_players,
                    "game server connected"
                );
                entry.info = Some(info);
                true
            }
            None => false,
        }
    }

    pub fn info(&self, id: ChannelId) -> Option<ServerInfo> {
        self.read().get(&id).and_then(|e| e.info.clone())
    }

    /// First channel that completed a handshake.
    pub fn pick_game_channel(&self) -> Option<ChannelId> {
        self.read()
            .iter()
            .find(|(_, entry)| entry.info.is_some())
            .map(|(id, _)| *id)
    }

    /// Queue a message for a channel.
    pub fn send(&self, id: ChannelId, message: OutboundMessage) -> Result<(), AgentError> {
        let guard = self.read();
        let entry = guard.get(&id).ok_or(AgentError::ChannelClosed { channel: id })?;

        tracing::debug!(
            channel = %id,
            kind = message.kind(),
            message_id = %message.message_id(),
            "queue outbound"
        );

        entry
            .sender
            .send(message)
            .map_err(|_| AgentError::ChannelClosed { channel: id })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
