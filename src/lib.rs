//! # Shellmux - Multiplexed Browser Terminals
//!
//! Shellmux exposes interactive shell sessions running on a server to remote
//! browser clients over a single WebSocket endpoint. Many independent
//! terminal sessions are multiplexed over one transport, and a session
//! survives its viewers disconnecting: the shell keeps running, recent
//! output is buffered, and a reconnecting client replays what it missed.
//!
//! ## Quick Start
//!
//! ```bash
//! shellmux --host 0.0.0.0 --port 8080
//! ```
//!
//! The server logs its identity token at startup; clients present it in
//! their HELLO frame to attach to a session.
//!
//! ## Architecture
//!
//! - **[protocol]**: the JSON frame types exchanged on the wire
//!   (HELLO/PING/DATA/RESIZE/ERROR).
//! - **[replay]**: the bounded per-session output buffer that makes
//!   reconnect-and-resume possible.
//! - **[pty]**: the pseudo-terminal seam and its `portable-pty` backed
//!   implementation.
//! - **[session]**: the per-session state machine - lazy shell spawn,
//!   attach/hijack, output fan-out, resize coalescing, exit handling.
//! - **[registry]**: the process-wide session map and server identity token.
//! - **[connection]** and **[server]**: the transport adapter between axum
//!   WebSockets and the session core.
//!
//! ## Protocol
//!
//! Clients open one WebSocket and send `HELLO {token, cols, rows, seq}` per
//! session they want to attach to. A valid HELLO spawns the shell if needed,
//! notifies existing viewers they are being hijacked, replays buffered
//! output after `seq`, and applies the client's terminal size. DATA frames
//! then flow both ways; RESIZE adjusts the pty; the server answers a bad
//! token with `ERROR {reason: "Forbidden"}`.

pub mod connection;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod replay;
pub mod server;
pub mod session;
