use std::{str::FromStr, sync::Arc};

use cloudshell_process::{SessionId, VmState};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::Instrument;

use crate::{
    protocol::ServerFrame,
    shell::{Shell, ShellEvent, ShellLauncher, TermSize},
    upload::{UploadChannel, UploadConfig, validate_file_name},
};

/// What happens to a client that connects before the VM reached login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotReadyPolicy {
    /// Send `not-ready` and close.
    Close,
    /// Send `not-ready`, keep the connection, start the shell once ready.
    #[default]
    Wait,
}

impl FromStr for NotReadyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "close" => Ok(Self::Close),
            "wait" => Ok(Self::Wait),
            other => anyhow::bail!("unknown not-ready policy {other:?} (expected close|wait)"),
        }
    }
}

/// Decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Data(Vec<u8>),
    Resize(TermSize),
    Upload {
        id: String,
        name: String,
        payload: Vec<u8>,
    },
}

/// Message for the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(Vec<u8>),
    Frame(ServerFrame),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Turned away (close policy) or the VM never became ready while connected.
    NotReady,
    ShellExited(Option<i32>),
    ClientGone,
    LaunchFailed,
}

/// Everything a session needs besides its own transport.
pub struct SessionContext<L> {
    pub launcher: Arc<L>,
    pub readiness: watch::Receiver<VmState>,
    pub policy: NotReadyPolicy,
    pub uploads: UploadConfig,
    pub initial_size: TermSize,
}

impl<L> SessionContext<L> {
    pub fn vm_state(&self) -> VmState {
        *self.readiness.borrow()
    }
}

enum Gate {
    Ready(Option<TermSize>),
    Closed(SessionOutcome),
}

/// Hold the client until the VM is ready, per policy.
async fn wait_until_ready(
    readiness: &mut watch::Receiver<VmState>,
    policy: NotReadyPolicy,
    inbound: &mut mpsc::Receiver<ClientEvent>,
    outbound: &mpsc::Sender<Outbound>,
) -> Gate {
    if readiness.borrow_and_update().is_ready() {
        return Gate::Ready(None);
    }

    tracing::info!(?policy, "vm not ready");
    let _ = outbound.send(Outbound::Frame(ServerFrame::NotReady)).await;
    if policy == NotReadyPolicy::Close {
        let _ = outbound.send(Outbound::Close).await;
        return Gate::Closed(SessionOutcome::NotReady);
    }

    let mut size = None;
    loop {
        // Client messages queued before the flip are handled first.
        tokio::select! {
            biased;
            ev = inbound.recv() => match ev {
                None => return Gate::Closed(SessionOutcome::ClientGone),
                Some(ClientEvent::Resize(sz)) if sz.is_valid() => size = Some(sz),
                Some(ClientEvent::Upload { id, .. }) => {
                    let frame = ServerFrame::upload_result(
                        id,
                        &Err(cloudshell_core::Error::Validation("vm not ready".to_string())),
                    );
                    let _ = outbound.send(Outbound::Frame(frame)).await;
                }
                Some(_) => {}
            },
            changed = readiness.changed() => {
                if changed.is_err() {
                    let _ = outbound.send(Outbound::Close).await;
                    return Gate::Closed(SessionOutcome::NotReady);
                }
                if readiness.borrow_and_update().is_ready() {
                    return Gate::Ready(size);
                }
            }
        }
    }
}

/// Drive one client connection from connect to teardown.
///
/// `inbound` closing means the client went away. Every path out of the
/// active state kills the shell and drops the staging directory.
pub async fn run_session<L: ShellLauncher>(
    ctx: &SessionContext<L>,
    mut inbound: mpsc::Receiver<ClientEvent>,
    outbound: mpsc::Sender<Outbound>,
) -> SessionOutcome {
    let mut readiness = ctx.readiness.clone();
    let client_size = match wait_until_ready(&mut readiness, ctx.policy, &mut inbound, &outbound).await
    {
        Gate::Ready(size) => size,
        Gate::Closed(outcome) => return outcome,
    };

    let session = SessionId::new();
    let span = tracing::info_span!("session", session_id = %session);
    active_session(ctx, session, client_size, inbound, outbound)
        .instrument(span)
        .await
}

async fn active_session<L: ShellLauncher>(
    ctx: &SessionContext<L>,
    session: SessionId,
    client_size: Option<TermSize>,
    mut inbound: mpsc::Receiver<ClientEvent>,
    outbound: mpsc::Sender<Outbound>,
) -> SessionOutcome {
    let mut size = client_size.unwrap_or(ctx.initial_size);
    let mut shell = match ctx.launcher.launch(&session, size) {
        Ok(shell) => shell,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "shell launch failed");
            let _ = outbound
                .send(Outbound::Frame(ServerFrame::Exit { exit_code: None }))
                .await;
            let _ = outbound.send(Outbound::Close).await;
            return SessionOutcome::LaunchFailed;
        }
    };
    tracing::info!("session active");

    let uploads = Arc::new(UploadChannel::new(&ctx.uploads, &session));
    let mut transfers = JoinSet::new();
    // Set by the first output chunk or an explicit client resize.
    let mut size_pushed = client_size.is_some();

    let outcome = loop {
        tokio::select! {
            biased;
            ev = inbound.recv() => match ev {
                None => {
                    shell.kill();
                    break SessionOutcome::ClientGone;
                }
                Some(ClientEvent::Data(bytes)) => {
                    if let Err(err) = shell.write(&bytes) {
                        tracing::debug!(error = %err, "shell write failed");
                    }
                }
                Some(ClientEvent::Resize(sz)) => {
                    if !sz.is_valid() {
                        continue;
                    }
                    size = sz;
                    size_pushed = true;
                    if let Err(err) = shell.resize(sz) {
                        tracing::debug!(error = %err, "resize failed");
                    }
                }
                Some(ClientEvent::Upload { id, name, payload }) => {
                    if let Err(err) = validate_file_name(&name) {
                        tracing::info!(%name, "upload rejected");
                        let frame = ServerFrame::upload_result(id, &Err(err));
                        let _ = outbound.send(Outbound::Frame(frame)).await;
                        continue;
                    }
                    let uploads = uploads.clone();
                    let outbound = outbound.clone();
                    transfers.spawn(
                        async move {
                            let res = uploads.handle(&name, &payload).await;
                            if let Err(err) = &res {
                                tracing::warn!(%name, error = %err, "upload failed");
                            }
                            let _ = outbound.send(Outbound::Frame(ServerFrame::upload_result(id, &res))).await;
                        }
                        .in_current_span(),
                    );
                }
            },
            ev = shell.next_event() => match ev {
                Some(ShellEvent::Output(bytes)) => {
                    if !size_pushed {
                        size_pushed = true;
                        if let Err(err) = shell.resize(size) {
                            tracing::debug!(error = %err, "initial resize failed");
                        }
                    }
                    if outbound.send(Outbound::Data(bytes)).await.is_err() {
                        shell.kill();
                        break SessionOutcome::ClientGone;
                    }
                }
                Some(ShellEvent::Exited(code)) => {
                    let _ = outbound.send(Outbound::Frame(ServerFrame::Exit { exit_code: code })).await;
                    let _ = outbound.send(Outbound::Close).await;
                    break SessionOutcome::ShellExited(code);
                }
                None => {
                    let _ = outbound.send(Outbound::Frame(ServerFrame::Exit { exit_code: None })).await;
                    let _ = outbound.send(Outbound::Close).await;
                    break SessionOutcome::ShellExited(None);
                }
            },
            Some(_) = transfers.join_next(), if !transfers.is_empty() => {}
        }
    };

    transfers.shutdown().await;
    drop(shell);
    // Last owner; staging removal is spawned from its drop.
    drop(uploads);
    tracing::info!(?outcome, "session ended");
    outcome
}
