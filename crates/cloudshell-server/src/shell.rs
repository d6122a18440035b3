use std::{
    future::Future,
    io::{Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use cloudshell_process::SessionId;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

/// Placeholder replaced by the session id in shell arguments.
pub const SESSION_PLACEHOLDER: &str = "{session}";
const SHELL_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TermSize {
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output(Vec<u8>),
    Exited(Option<i32>),
}

/// One interactive shell attached to a session.
pub trait Shell: Send + 'static {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;

    fn resize(&mut self, size: TermSize) -> anyhow::Result<()>;

    /// Next output chunk or the exit. Cancel-safe.
    fn next_event(&mut self) -> impl Future<Output = Option<ShellEvent>> + Send;

    /// Terminate immediately. Idempotent.
    fn kill(&mut self);
}

pub trait ShellLauncher: Send + Sync + 'static {
    type Shell: Shell;

    fn launch(&self, session: &SessionId, size: TermSize) -> anyhow::Result<Self::Shell>;
}

/// Starts the session shell under a fresh pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtyLauncher {
    program: String,
    args: Vec<String>,
}

impl PtyLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `ssh -t <host> "TEMP_HOME=/tmp/<session> bash"`
    pub fn ssh(host: &str) -> Self {
        Self::new(
            "ssh",
            vec![
                "-t".to_string(),
                host.to_string(),
                format!("TEMP_HOME=/tmp/{SESSION_PLACEHOLDER} bash"),
            ],
        )
    }

    pub fn args_for(&self, session: &SessionId) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(SESSION_PLACEHOLDER, session.as_str()))
            .collect()
    }
}

impl ShellLauncher for PtyLauncher {
    type Shell = PtyShell;

    fn launch(&self, session: &SessionId, size: TermSize) -> anyhow::Result<PtyShell> {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(self.args_for(session));
        cmd.env("TERM", "xterm-256color");

        let pair = portable_pty::native_pty_system().openpty(pty_size(size))?;
        let mut child = pair.slave.spawn_command(cmd)?;
        // Only the child keeps the slave open, so the reader sees EOF when it exits.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut reader = pair.master.try_clone_reader()?;
        let mut writer = pair.master.take_writer()?;

        let (events_tx, events_rx) = mpsc::channel(SHELL_EVENT_BUFFER);
        let exited = Arc::new(AtomicBool::new(false));

        let reaped = exited.clone();
        std::thread::Builder::new()
            .name(format!("pty-reader-{session}"))
            .spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if events_tx
                                .blocking_send(ShellEvent::Output(buf[..n].to_vec()))
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        // EIO once the last slave fd is closed.
                        Err(_) => break,
                    }
                }
                let code = match child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(e) => {
                        tracing::debug!(error = %e, "wait on shell failed");
                        None
                    }
                };
                reaped.store(true, Ordering::SeqCst);
                let _ = events_tx.blocking_send(ShellEvent::Exited(code));
            })?;

        let (input_tx, input_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        std::thread::Builder::new()
            .name(format!("pty-writer-{session}"))
            .spawn(move || {
                while let Ok(chunk) = input_rx.recv() {
                    if writer.write_all(&chunk).and_then(|_| writer.flush()).is_err() {
                        break;
                    }
                }
            })?;

        tracing::debug!(?pid, program = %self.program, "shell started");
        Ok(PtyShell {
            master: pair.master,
            killer,
            pid,
            exited,
            killed: false,
            input: input_tx,
            events: events_rx,
        })
    }
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub struct PtyShell {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    killed: bool,
    input: std::sync::mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<ShellEvent>,
}

impl PtyShell {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Shell for PtyShell {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.input
            .send(data.to_vec())
            .map_err(|_| anyhow::anyhow!("shell input closed"))
    }

    fn resize(&mut self, size: TermSize) -> anyhow::Result<()> {
        self.master.resize(pty_size(size))
    }

    async fn next_event(&mut self) -> Option<ShellEvent> {
        self.events.recv().await
    }

    fn kill(&mut self) {
        if self.killed || self.exited.load(Ordering::SeqCst) {
            return;
        }
        self.killed = true;
        match self.pid {
            // The portable-pty killer sends SIGHUP; sessions are torn down with SIGKILL.
            Some(pid) => unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            },
            None => {
                let _ = self.killer.kill();
            }
        }
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// What the bridge did to one fake shell.
    pub(crate) struct ShellTap {
        pub session: SessionId,
        pub initial_size: TermSize,
        pub writes: Mutex<Vec<u8>>,
        pub resizes: Mutex<Vec<TermSize>>,
        pub killed: AtomicBool,
        pub events: mpsc::UnboundedSender<ShellEvent>,
    }

    impl ShellTap {
        pub fn output(&self, bytes: &[u8]) {
            let _ = self.events.send(ShellEvent::Output(bytes.to_vec()));
        }

        pub fn exit(&self, code: i32) {
            let _ = self.events.send(ShellEvent::Exited(Some(code)));
        }

        pub fn resizes(&self) -> Vec<TermSize> {
            self.resizes.lock().unwrap().clone()
        }

        pub fn written(&self) -> Vec<u8> {
            self.writes.lock().unwrap().clone()
        }
    }

    pub(crate) struct FakeShell {
        tap: Arc<ShellTap>,
        events: mpsc::UnboundedReceiver<ShellEvent>,
        echo: bool,
    }

    impl Shell for FakeShell {
        fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
            self.tap.writes.lock().unwrap().extend_from_slice(data);
            if self.echo {
                self.tap.output(data);
            }
            Ok(())
        }

        fn resize(&mut self, size: TermSize) -> anyhow::Result<()> {
            self.tap.resizes.lock().unwrap().push(size);
            Ok(())
        }

        async fn next_event(&mut self) -> Option<ShellEvent> {
            self.events.recv().await
        }

        fn kill(&mut self) {
            self.tap.killed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub echo: bool,
        pub fail: bool,
        launched: Mutex<Vec<Arc<ShellTap>>>,
    }

    impl FakeLauncher {
        pub fn echo() -> Self {
            Self {
                echo: true,
                ..Self::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn launched(&self) -> Vec<Arc<ShellTap>> {
            self.launched.lock().unwrap().clone()
        }

        pub async fn wait_launch(&self, n: usize) -> Arc<ShellTap> {
            for _ in 0..200 {
                if let Some(p) = self.launched().get(n) {
                    return p.clone();
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            panic!("shell #{n} never launched");
        }
    }

    impl ShellLauncher for FakeLauncher {
        type Shell = FakeShell;

        fn launch(&self, session: &SessionId, size: TermSize) -> anyhow::Result<FakeShell> {
            if self.fail {
                anyhow::bail!("launch refused");
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let tap = Arc::new(ShellTap {
                session: session.clone(),
                initial_size: size,
                writes: Mutex::new(Vec::new()),
                resizes: Mutex::new(Vec::new()),
                killed: AtomicBool::new(false),
                events: tx,
            });
            self.launched.lock().unwrap().push(tap.clone());
            Ok(FakeShell {
                tap,
                events: rx,
                echo: self.echo,
            })
        }
    }
}
