//! # Connection Module
//!
//! Core-facing handle for one transport connection. Sessions hold clones of
//! [`Connection`] in their attachment sets and push frames through it; the
//! transport adapter owns the receiving half and drains it into the actual
//! socket. Connections have no semantic identity on the wire, only object
//! identity, so each handle carries a generated id.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::Frame;

/// Event for the transport writer task
pub enum Outbound {
    /// Encoded frame to deliver to the peer
    Frame(String),
    /// Request to close the underlying socket
    Close,
}

/// Handle to one attached transport connection
#[derive(Clone)]
pub struct Connection {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl Connection {
    /// Create a connection handle plus the outbound event stream the
    /// transport writer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id: Uuid::new_v4(),
            outbound,
            open: Arc::new(AtomicBool::new(true)),
        };
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Send a frame, silently skipping connections that are no longer open.
    pub fn send_frame(&self, frame: &Frame) {
        if !self.is_open() {
            return;
        }
        match frame.encode() {
            Ok(text) => {
                let _ = self.outbound.send(Outbound::Frame(text));
            }
            Err(err) => warn!(connection = %self.id, "failed to encode frame: {err}"),
        }
    }

    /// Force-close the connection: marks it closed immediately and asks the
    /// transport writer to shut the socket.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Called by the transport when the socket is gone.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;

    #[test]
    fn frames_are_delivered_while_open() {
        let (conn, mut rx) = Connection::new();
        conn.send_frame(&Frame::new("1", Payload::Ping));

        match rx.try_recv().unwrap() {
            Outbound::Frame(text) => {
                assert_eq!(Frame::decode(&text).unwrap().payload, Payload::Ping);
            }
            Outbound::Close => panic!("expected a frame"),
        }
    }

    #[test]
    fn sends_after_close_are_skipped() {
        let (conn, mut rx) = Connection::new();
        conn.close();
        conn.send_frame(&Frame::new("1", Payload::Ping));

        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close));
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_open());
    }

    #[test]
    fn dropping_the_receiver_counts_as_closed() {
        let (conn, rx) = Connection::new();
        drop(rx);
        assert!(!conn.is_open());
        // Must not panic or error.
        conn.send_frame(&Frame::new("1", Payload::Ping));
    }
}
