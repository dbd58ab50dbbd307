//! # Pseudo-Terminal Module
//!
//! The session core drives subprocesses through the [`PtyBackend`] /
//! [`PtyController`] seam: a backend spawns a shell on a pty of a given size
//! and hands back a controller (write + resize) together with an output
//! channel. Chunks arrive on the channel in the order the subprocess
//! produced them, with arbitrary chunk boundaries; the channel closing is
//! the one and only exit signal.
//!
//! [`NativePtyBackend`] is the production implementation on top of
//! `portable-pty`: a blocking reader thread pumps master output into the
//! channel, a blocking writer thread drains input into the master, and a
//! reaper thread waits on the child so it does not linger as a zombie.

use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;

use anyhow::{Context, Result, anyhow};
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Terminal dimensions in character cells
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtyDims {
    pub cols: u16,
    pub rows: u16,
}

/// Live control half of a spawned pty process
pub trait PtyController: Send {
    /// Send bytes to the subprocess's input stream.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Ask the pty layer for a terminal size change.
    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;
}

/// Result of spawning: the controller plus the ordered output stream.
///
/// The output channel closes exactly once, when the subprocess exits; no
/// chunk is delivered after that.
pub struct SpawnedPty {
    pub controller: Box<dyn PtyController>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Provider of pseudo-terminal-backed subprocesses
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, size: PtyDims) -> Result<SpawnedPty>;
}

/// Determines the shell to run inside new pty sessions
///
/// Uses the `SHELL` environment variable, falling back to `/bin/bash`.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

/// Spawns login shells on a native pty via `portable-pty`
pub struct NativePtyBackend {
    shell: String,
}

impl NativePtyBackend {
    pub fn new(shell: String) -> Self {
        Self { shell }
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, size: PtyDims) -> Result<SpawnedPty> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg("-il");
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn shell {}", self.shell))?;
        drop(pair.slave);
        let master = pair.master;

        info!(shell = %self.shell, pid = ?child.process_id(), "spawned pty subprocess");

        // Reader thread: forwards output chunks until EOF or error, then
        // drops the sender, which is the exit signal the session relies on.
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let mut reader = master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        std::thread::spawn(move || {
            let mut buffer = [0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // EIO here is the normal Linux way of reporting that
                        // the subprocess side of the pty is gone.
                        warn!("pty read ended: {err}");
                        break;
                    }
                }
            }
        });

        // Writer thread: pty writes are blocking, so they run off-runtime.
        let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();
        let mut writer = master.take_writer().context("failed to take pty writer")?;
        std::thread::spawn(move || {
            while let Ok(data) = input_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // Reaper thread: collects the child's exit status.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(SpawnedPty {
            controller: Box::new(NativePtyController { master, input_tx }),
            output: output_rx,
        })
    }
}

struct NativePtyController {
    master: Box<dyn portable_pty::MasterPty + Send>,
    input_tx: std_mpsc::Sender<Vec<u8>>,
}

impl PtyController for NativePtyController {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| anyhow!("pty writer is gone"))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("pty resize failed")
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted pty backend for session and registry tests: records spawn
    //! sizes, writes and resizes, and lets tests emit output or simulate the
    //! subprocess exiting.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct BackendState {
        spawns: Vec<PtyDims>,
        handles: Vec<ScriptedPty>,
        fail_next: bool,
    }

    /// Backend that spawns [`ScriptedPty`] instances instead of subprocesses
    #[derive(Clone, Default)]
    pub struct ScriptedBackend {
        state: Arc<Mutex<BackendState>>,
    }

    /// Control handle for one scripted pty
    #[derive(Clone)]
    pub struct ScriptedPty {
        output: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    }

    impl ScriptedPty {
        /// Simulate the subprocess producing one output chunk.
        pub fn emit(&self, data: &str) {
            self.emit_bytes(data.as_bytes());
        }

        /// Like [`emit`](Self::emit), but with a raw byte chunk, so tests
        /// can cut output at boundaries a real read would produce.
        pub fn emit_bytes(&self, data: &[u8]) {
            let guard = self.output.lock().unwrap();
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(data.to_vec());
            }
        }

        /// Simulate the subprocess exiting: closes the output channel.
        pub fn exit(&self) {
            self.output.lock().unwrap().take();
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }

        pub fn resizes(&self) -> Vec<(u16, u16)> {
            self.resizes.lock().unwrap().clone()
        }
    }

    struct ScriptedController {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    }

    impl PtyController for ScriptedController {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
            self.resizes.lock().unwrap().push((cols, rows));
            Ok(())
        }
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next spawn fail, as a missing shell binary would.
        pub fn fail_next_spawn(&self) {
            self.state.lock().unwrap().fail_next = true;
        }

        pub fn spawned_sizes(&self) -> Vec<PtyDims> {
            self.state.lock().unwrap().spawns.clone()
        }

        pub fn spawn_count(&self) -> usize {
            self.state.lock().unwrap().spawns.len()
        }

        /// Control handle for the `index`-th spawned pty.
        pub fn pty(&self, index: usize) -> ScriptedPty {
            self.state.lock().unwrap().handles[index].clone()
        }
    }

    impl PtyBackend for ScriptedBackend {
        fn spawn(&self, size: PtyDims) -> Result<SpawnedPty> {
            let mut state = self.state.lock().unwrap();
            if state.fail_next {
                state.fail_next = false;
                return Err(anyhow!("scripted spawn failure"));
            }

            let (output_tx, output_rx) = mpsc::unbounded_channel();
            let writes = Arc::new(Mutex::new(Vec::new()));
            let resizes = Arc::new(Mutex::new(Vec::new()));

            state.spawns.push(size);
            state.handles.push(ScriptedPty {
                output: Arc::new(Mutex::new(Some(output_tx))),
                writes: writes.clone(),
                resizes: resizes.clone(),
            });

            Ok(SpawnedPty {
                controller: Box::new(ScriptedController { writes, resizes }),
                output: output_rx,
            })
        }
    }
}
