//! # Session Registry Module
//!
//! Process-wide map from session id to [`TerminalSession`], created lazily
//! on first reference: clients name their sessions (a dashboard typically
//! uses "1", "2", ...), and a HELLO for an unknown id brings the session
//! into existence dormant. The registry also owns the server identity token
//! every HELLO must present; it is generated once at construction and stays
//! stable for the process lifetime.
//!
//! Connection closure is not session-scoped at the transport layer, so
//! [`SessionRegistry::on_connection_close`] scans every session. That is
//! O(sessions) per close, which is fine at the expected cardinality of a
//! handful of sessions per user.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::protocol::Frame;
use crate::pty::PtyBackend;
use crate::session::TerminalSession;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<TerminalSession>>,
    backend: Arc<dyn PtyBackend>,
    token: String,
    replay_limit: usize,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn PtyBackend>, replay_limit: usize) -> Self {
        let token = Uuid::new_v4().to_string();
        info!("generated server identity token");
        Self {
            sessions: DashMap::new(),
            backend,
            token,
            replay_limit,
        }
    }

    /// The shared secret clients must present in HELLO frames.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Existing session for `id`, or a fresh dormant one registered
    /// atomically with respect to concurrent lookups for the same id.
    pub fn get_or_create(&self, id: &str) -> Arc<TerminalSession> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                TerminalSession::new(id, self.backend.clone(), self.replay_limit)
            })
            .clone()
    }

    /// Decode one inbound message and dispatch it to its session.
    ///
    /// Malformed frames are logged and dropped; the connection stays open.
    pub async fn route(&self, conn: &Connection, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection = %conn.id(), "dropping malformed frame: {err}");
                return;
            }
        };

        let session = self.get_or_create(&frame.session);
        session.handle_frame(&self.token, conn, frame.payload).await;
    }

    /// Remove a closed connection from every session's attachment set.
    pub async fn on_connection_close(&self, conn: &Connection) {
        conn.mark_closed();

        // Snapshot first: detach takes the per-session lock, and awaiting
        // while iterating would hold DashMap shard locks.
        let sessions: Vec<Arc<TerminalSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.detach(conn.id()).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
