use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    sync::{mpsc, oneshot, watch},
};

use crate::{ReadinessScanner, VmCommand, VmEvent, VmState, tail::OutputTail};

const BOOT_LOG_TAIL_BYTES: usize = 64 * 1024;
const EARLY_EXIT: Duration = Duration::from_secs(5);
const RESPAWN_PAUSE: Duration = Duration::from_secs(1);
const STDOUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies (crash/kill), take the emulator down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Owns the readiness flag for the single emulator instance on this host.
///
/// The flag is published on a `watch` channel: sessions query it at connect
/// time, waiting sessions subscribe to it. Restart policy lives with the
/// caller; see [`Supervisor::supervise`].
pub struct Supervisor {
    marker: String,
    state: Arc<watch::Sender<VmState>>,
    generation: Arc<AtomicU64>,
}

/// Handle to one emulator process instance.
pub struct VmProcess {
    pid: Option<u32>,
    events: mpsc::UnboundedReceiver<VmEvent>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl Supervisor {
    pub fn new(marker: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(VmState::Starting);
        Self {
            marker: marker.into(),
            state: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn state(&self) -> VmState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn subscribe(&self) -> watch::Receiver<VmState> {
        self.state.subscribe()
    }

    /// Launch the emulator and attach to its output.
    ///
    /// Resets the published state to `Starting`. Notifications for this
    /// instance arrive on the returned handle; once a newer instance is
    /// spawned, a stale one can no longer touch the published state.
    pub fn spawn(&self, cmd: &VmCommand) -> anyhow::Result<VmProcess> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(VmState::Starting);

        tracing::info!(command = %cmd.display(), "starting emulator");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(set_parent_death_signal);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn emulator {}", cmd.program.display()))?;
        let pid = child.id();
        let started = tokio::time::Instant::now();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let stdout_task = child.stdout.take().map(|out| {
            let mut scanner = ReadinessScanner::new(self.marker.clone());
            let state = self.state.clone();
            let current = self.generation.clone();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let mut out = out;
                let mut tail = OutputTail::new(BOOT_LOG_TAIL_BYTES);
                let mut buf = [0u8; 8192];
                loop {
                    let n = match out.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    tail.push(&buf[..n]);
                    if scanner.feed(&buf[..n]) {
                        tracing::info!(pid, "emulator reached login prompt");
                        if current.load(Ordering::SeqCst) == generation {
                            state.send_replace(VmState::Ready);
                        }
                        let _ = events_tx.send(VmEvent::Ready);
                    }
                }
                tail
            })
        });

        if let Some(err) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "vm", "{line}");
                }
            });
        }

        let state = self.state.clone();
        let current = self.generation.clone();
        tokio::spawn(async move {
            let res = tokio::select! {
                res = child.wait() => res,
                Ok(()) = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match res {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(%err, "wait on emulator failed");
                    None
                }
            };

            // Keep Ready strictly before Exited: let the reader see EOF first.
            let tail = match stdout_task {
                Some(task) => tokio::time::timeout(STDOUT_DRAIN_GRACE, task)
                    .await
                    .ok()
                    .and_then(|r| r.ok()),
                None => None,
            };

            let runtime = started.elapsed();
            if code == Some(0) {
                tracing::info!(?code, runtime_ms = runtime.as_millis() as u64, "emulator exited");
            } else {
                let tail = tail
                    .map(|t| t.render())
                    .unwrap_or_default();
                tracing::warn!(
                    ?code,
                    runtime_ms = runtime.as_millis() as u64,
                    output_tail = %tail,
                    "emulator exited"
                );
            }

            if current.load(Ordering::SeqCst) == generation {
                state.send_replace(VmState::Exited(code));
            }
            let _ = events_tx.send(VmEvent::Exited(code));
        });

        Ok(VmProcess {
            pid,
            events: events_rx,
            kill_tx: Some(kill_tx),
        })
    }

    /// Run the emulator until it exits; with `respawn`, start it again each time.
    ///
    /// Returns the exit code of the last instance (only reachable without `respawn`).
    pub async fn supervise(&self, cmd: &VmCommand, respawn: bool) -> anyhow::Result<Option<i32>> {
        loop {
            let started = tokio::time::Instant::now();
            let mut process = self.spawn(cmd)?;
            let code = process.wait().await;

            if !respawn {
                return Ok(code);
            }

            // An instance that died during boot is restarted after a pause.
            if started.elapsed() < EARLY_EXIT {
                tokio::time::sleep(RESPAWN_PAUSE).await;
            }
            tracing::warn!(?code, "emulator exited; respawning");
        }
    }
}

impl VmProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn next_event(&mut self) -> Option<VmEvent> {
        self.events.recv().await
    }

    /// Block until the login prompt shows up. `false` if the process exited first.
    pub async fn wait_ready(&mut self) -> bool {
        while let Some(ev) = self.events.recv().await {
            match ev {
                VmEvent::Ready => return true,
                VmEvent::Exited(_) => return false,
            }
        }
        false
    }

    /// Wait for exit and return its code.
    pub async fn wait(&mut self) -> Option<i32> {
        while let Some(ev) = self.events.recv().await {
            if let VmEvent::Exited(code) = ev {
                return code;
            }
        }
        None
    }

    /// Request an immediate kill. The `Exited` notification still follows.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}
