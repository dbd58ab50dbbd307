//! # Terminal Session Module
//!
//! One [`TerminalSession`] binds a shell subprocess, its replay buffer, and
//! the set of attached connections, and implements the attach/hijack/resize
//! state machine:
//!
//! - A session is dormant until the first HELLO carrying the server identity
//!   token; that spawns the shell at the HELLO-supplied size.
//! - A HELLO against a live session is a hijack: every currently attached
//!   viewer is notified with `ERROR{Hijacked}` before the new connection
//!   joins, then the newcomer receives buffered output after its declared
//!   sequence number as a single DATA frame.
//! - Every accepted HELLO concludes by running the resize routine with the
//!   HELLO-supplied dimensions, so a reconnecting client always forces a
//!   repaint at its own size.
//! - When the subprocess exits the session returns to dormant: the process
//!   slot is cleared, the replay buffer reset, and attached connections are
//!   force-closed so clients reconnect and re-HELLO.
//!
//! All session state lives behind one `tokio::sync::Mutex`, which makes
//! inbound message handling, subprocess output delivery, and close handling
//! mutually exclusive; sequence numbering and eviction stay consistent, and
//! the replay snapshot taken during attach cannot interleave with a live
//! broadcast.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::protocol::{ErrorReason, Frame, Payload};
use crate::pty::{PtyBackend, PtyController, PtyDims};
use crate::replay::ReplayBuffer;

/// Pause between the rows+1 nudge and the settling resize. Terminal
/// applications ignore a resize that is immediately followed by another, so
/// the two calls have to be separated in time.
pub const RESIZE_SETTLE_DELAY: Duration = Duration::from_millis(30);

struct ProcessHandle {
    controller: Box<dyn PtyController>,
    dims: PtyDims,
}

/// Incremental UTF-8 decoder for the subprocess output stream.
///
/// Reads come off the pty at arbitrary byte boundaries, so a multi-byte
/// sequence can span two chunks. An incomplete trailing sequence is held
/// back and prepended to the next chunk instead of being mangled into
/// replacement characters; only bytes that can never form a valid sequence
/// are replaced.
#[derive(Default)]
struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let buf = std::mem::take(&mut self.pending);
        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();

        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match err.error_len() {
                        // Bytes that cannot start or continue any sequence.
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + len..];
                        }
                        // Possibly the prefix of a sequence the next read
                        // completes; hold it back.
                        None => {
                            self.pending = rest[valid_up_to..].to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }
}

struct SessionInner {
    clients: Vec<Connection>,
    process: Option<ProcessHandle>,
    replay: ReplayBuffer,
    /// Bumped on every spawn; delayed resizes and output pumps from an
    /// earlier subprocess compare against it and stand down.
    generation: u64,
}

/// A named, server-resident shell instance plus its attached viewers
pub struct TerminalSession {
    id: String,
    backend: Arc<dyn PtyBackend>,
    inner: Mutex<SessionInner>,
}

impl TerminalSession {
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn PtyBackend>,
        replay_limit: usize,
    ) -> Arc<Self> {
        let id = id.into();
        info!(session = %id, "initializing terminal session");
        Arc::new(Self {
            id,
            backend,
            inner: Mutex::new(SessionInner {
                clients: Vec::new(),
                process: None,
                replay: ReplayBuffer::new(replay_limit),
                generation: 0,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Dispatch one inbound frame payload from `conn`.
    pub async fn handle_frame(
        self: Arc<Self>,
        server_token: &str,
        conn: &Connection,
        payload: Payload,
    ) {
        match payload {
            Payload::Hello {
                token,
                cols,
                rows,
                seq,
            } => self.handle_hello(server_token, conn, &token, cols, rows, seq).await,
            Payload::Data { data, .. } => self.handle_data(&data).await,
            Payload::Resize { cols, rows } => self.handle_resize(cols, rows).await,
            Payload::Ping => {}
            Payload::Error { reason } => {
                debug!(session = %self.id, "ignoring client error frame: {}", reason.as_str());
            }
        }
    }

    async fn handle_hello(
        self: Arc<Self>,
        server_token: &str,
        conn: &Connection,
        token: &str,
        cols: u16,
        rows: u16,
        seq: i64,
    ) {
        if token != server_token {
            warn!(session = %self.id, connection = %conn.id(), "rejecting hello with bad token");
            conn.send_frame(&Frame::new(
                &self.id,
                Payload::Error {
                    reason: ErrorReason::Forbidden,
                },
            ));
            return;
        }

        let mut inner = self.inner.lock().await;

        if inner.process.is_none() {
            if let Err(err) = Self::spawn_process(&self, &mut inner, PtyDims { cols, rows }) {
                error!(session = %self.id, "failed to spawn shell: {err:#}");
                conn.send_frame(&Frame::new(
                    &self.id,
                    Payload::Error {
                        reason: ErrorReason::SpawnFailed,
                    },
                ));
                return;
            }
        }

        // Existing viewers learn they are being superseded before the new
        // connection joins the set. They stay attached; disconnecting is the
        // client's call.
        Self::broadcast(
            &inner,
            &Frame::new(
                &self.id,
                Payload::Error {
                    reason: ErrorReason::Hijacked,
                },
            ),
        );

        if !inner.clients.iter().any(|c| c.id() == conn.id()) {
            info!(session = %self.id, connection = %conn.id(), "attaching connection");
            inner.clients.push(conn.clone());
        }

        // Buffered output was produced at the previous terminal size, so it
        // may render oddly; the resize below forces a repaint that cleans
        // that up.
        let (data, latest) = inner.replay.replay_since(seq);
        conn.send_frame(&Frame::new(
            &self.id,
            Payload::Data {
                data,
                seq: Some(latest),
            },
        ));

        // A hello always concludes with the resize routine for the
        // dimensions it carried.
        Self::apply_resize(&self, &mut inner, cols, rows);
    }

    async fn handle_data(&self, data: &str) {
        let mut inner = self.inner.lock().await;
        // Input for a dormant session is dropped.
        if let Some(process) = inner.process.as_mut() {
            if let Err(err) = process.controller.write(data.as_bytes()) {
                warn!(session = %self.id, "failed to write to pty: {err:#}");
            }
        }
    }

    async fn handle_resize(self: Arc<Self>, cols: u16, rows: u16) {
        let mut inner = self.inner.lock().await;
        if inner.process.is_some() {
            Self::apply_resize(&self, &mut inner, cols, rows);
        }
    }

    /// Remove a connection from the attachment set. Session state and the
    /// subprocess are unaffected.
    pub async fn detach(&self, conn_id: Uuid) {
        let mut inner = self.inner.lock().await;
        let before = inner.clients.len();
        inner.clients.retain(|c| c.id() != conn_id);
        if inner.clients.len() != before {
            info!(session = %self.id, connection = %conn_id, "detached connection");
        }
    }

    fn spawn_process(
        session: &Arc<Self>,
        inner: &mut SessionInner,
        dims: PtyDims,
    ) -> Result<()> {
        let spawned = session.backend.spawn(dims)?;
        inner.generation += 1;
        inner.process = Some(ProcessHandle {
            controller: spawned.controller,
            dims,
        });

        info!(session = %session.id, cols = dims.cols, rows = dims.rows, "spawned shell subprocess");

        let generation = inner.generation;
        let pump = session.clone();
        tokio::spawn(async move {
            pump.pump_output(generation, spawned.output).await;
        });

        Ok(())
    }

    /// Forwards subprocess output until the channel closes, then handles the
    /// exit. Runs as its own task, one per spawned process.
    async fn pump_output(
        self: Arc<Self>,
        generation: u64,
        mut output: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let mut decoder = OutputDecoder::default();
        while let Some(chunk) = output.recv().await {
            let data = decoder.push(&chunk);
            if data.is_empty() {
                // The whole chunk was an incomplete trailing sequence; it
                // will be delivered with the next read.
                continue;
            }
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            let seq = inner.replay.append(data.clone());
            Self::broadcast(
                &inner,
                &Frame::new(
                    &self.id,
                    Payload::Data {
                        data,
                        seq: Some(seq as i64),
                    },
                ),
            );
        }

        self.handle_exit(generation).await;
    }

    async fn handle_exit(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }

        info!(session = %self.id, "shell subprocess exited, closing terminal session");
        inner.process = None;
        inner.replay.reset();

        // Viewers must reconnect and re-hello to resume; removal from the
        // attachment set stays transport-driven.
        for client in &inner.clients {
            client.close();
        }
    }

    /// Applies a size change to the live process.
    ///
    /// Resizing to the current size is a no-op at the OS level and the
    /// application would never repaint, so that case goes one row taller
    /// immediately and settles back to the requested size after
    /// [`RESIZE_SETTLE_DELAY`].
    fn apply_resize(session: &Arc<Self>, inner: &mut SessionInner, cols: u16, rows: u16) {
        let generation = inner.generation;
        let Some(process) = inner.process.as_mut() else {
            return;
        };

        if process.dims.cols == cols && process.dims.rows == rows {
            // At the u16 ceiling the nudge goes one row shorter instead.
            let nudged = if rows == u16::MAX { rows - 1 } else { rows + 1 };
            if let Err(err) = process.controller.resize(cols, nudged) {
                warn!(session = %session.id, "pty resize failed: {err:#}");
                return;
            }
            process.dims = PtyDims { cols, rows: nudged };

            let settle = session.clone();
            tokio::spawn(async move {
                sleep(RESIZE_SETTLE_DELAY).await;
                settle.settle_resize(generation, cols, rows).await;
            });
        } else {
            if let Err(err) = process.controller.resize(cols, rows) {
                warn!(session = %session.id, "pty resize failed: {err:#}");
                return;
            }
            process.dims = PtyDims { cols, rows };
        }
    }

    async fn settle_resize(&self, generation: u64, cols: u16, rows: u16) {
        let mut inner = self.inner.lock().await;
        // The process may have exited or been respawned during the pause.
        if inner.generation != generation {
            return;
        }
        if let Some(process) = inner.process.as_mut() {
            if let Err(err) = process.controller.resize(cols, rows) {
                warn!(session = %self.id, "pty settle resize failed: {err:#}");
                return;
            }
            process.dims = PtyDims { cols, rows };
        }
    }

    fn broadcast(inner: &SessionInner, frame: &Frame) {
        for client in &inner.clients {
            client.send_frame(frame);
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_active(&self) -> bool {
        self.inner.lock().await.process.is_some()
    }

    #[cfg(test)]
    pub(crate) async fn replay_is_empty(&self) -> bool {
        self.inner.lock().await.replay.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }
}
