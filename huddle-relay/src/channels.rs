//! Channel membership for the relay.
//!
//! A channel is a named set of live connections. It exists only while it has
//! members: the first join creates it and the last leave deletes it. Entries
//! are ephemeral and lost on relay restart.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Relay-assigned identifier of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocates the next process-wide connection id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound queue of one connection, drained by its writer task.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinRejection {
    /// The channel already holds `max_peers` members.
    #[error("channel is full (max {max_peers} peers)")]
    ChannelFull {
        /// The configured cap.
        max_peers: usize,
    },
}

#[derive(Debug, Default)]
struct Channel {
    members: HashMap<ConnId, Outbound>,
}

/// In-memory map from channel key to members.
///
/// Guarded by a single mutex; critical sections never await.
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Channel>>,
    max_peers: Option<usize>,
    echo_to_sender: bool,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(None, true)
    }
}

impl ChannelRegistry {
    /// Creates an empty registry.
    ///
    /// `max_peers` caps every channel; `echo_to_sender` controls whether a
    /// broadcast also reaches the connection that sent it.
    #[must_use]
    pub fn new(max_peers: Option<usize>, echo_to_sender: bool) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            max_peers,
            echo_to_sender,
        }
    }

    /// Adds `conn` to the channel `key`, creating the channel if absent.
    ///
    /// The cap is checked before membership, so a full channel refuses even a
    /// connection that is already a member.
    ///
    /// # Errors
    ///
    /// Returns [`JoinRejection::ChannelFull`] if the channel is at capacity.
    pub fn join(&self, key: &str, conn: ConnId, outbound: Outbound) -> Result<(), JoinRejection> {
        let mut channels = self.channels.lock();
        let current = channels.get(key).map_or(0, |c| c.members.len());
        if let Some(max_peers) = self.max_peers
            && current >= max_peers
        {
            return Err(JoinRejection::ChannelFull { max_peers });
        }
        channels
            .entry(key.to_string())
            .or_default()
            .members
            .insert(conn, outbound);
        drop(channels);
        Ok(())
    }

    /// Removes `conn` from `key`, deleting the channel once empty.
    ///
    /// Returns `true` if `conn` was a member.
    pub fn leave(&self, key: &str, conn: ConnId) -> bool {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(key) else {
            return false;
        };
        let removed = channel.members.remove(&conn).is_some();
        if channel.members.is_empty() {
            channels.remove(key);
        }
        removed
    }

    /// Removes `conn` from every channel. Used when the channel is unknown.
    pub fn detach_all(&self, conn: ConnId) {
        let mut channels = self.channels.lock();
        channels.retain(|_, channel| {
            channel.members.remove(&conn);
            !channel.members.is_empty()
        });
    }

    /// Queues `frame` for every member of `key`, returning how many members
    /// it was delivered to.
    ///
    /// Members whose writer has gone away are skipped; their own disconnect
    /// path removes them.
    pub fn broadcast(&self, key: &str, frame: &Message, sender: ConnId) -> usize {
        let channels = self.channels.lock();
        let Some(channel) = channels.get(key) else {
            return 0;
        };
        channel
            .members
            .iter()
            .filter(|(id, _)| self.echo_to_sender || **id != sender)
            .filter(|(_, tx)| tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Members currently in `key`.
    #[must_use]
    pub fn member_count(&self, key: &str) -> usize {
        self.channels.lock().get(key).map_or(0, |c| c.members.len())
    }

    /// Number of non-empty channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether broadcasts reach their sender.
    #[must_use]
    pub const fn echoes_to_sender(&self) -> bool {
        self.echo_to_sender
    }
}
