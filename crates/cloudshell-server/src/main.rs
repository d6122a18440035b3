use std::sync::Arc;

use anyhow::Context;
use cloudshell_core::{Config, config::config_path};
use cloudshell_process::{Supervisor, VmSpec, readiness::boot_marker, vm::memory_from_env};
use cloudshell_server::{
    PtyLauncher, ServerSettings, ServerState, SessionContext, router, shell::TermSize,
    upload::UploadConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = ServerSettings::from_env()?;
    let config_path = config_path();
    let config = Config::load(&config_path).context("provision the VM before starting the server")?;

    let mut spec = VmSpec::new(&config.qemu, &config.image);
    spec.memory = memory_from_env();
    spec.ssh_forward_port = settings.vm_ssh_port;
    let command = spec.command();

    let supervisor = Arc::new(Supervisor::new(boot_marker()));
    let readiness = supervisor.subscribe();
    tokio::spawn({
        let supervisor = supervisor.clone();
        let respawn = settings.respawn;
        async move {
            match supervisor.supervise(&command, respawn).await {
                Ok(code) => tracing::warn!(?code, "emulator stopped; respawn disabled"),
                Err(err) => tracing::error!(error = %format!("{err:#}"), "emulator supervision failed"),
            }
        }
    });

    let state = Arc::new(ServerState {
        sessions: SessionContext {
            launcher: Arc::new(PtyLauncher::ssh(&settings.shell_host)),
            readiness,
            policy: settings.not_ready_policy,
            uploads: UploadConfig::new(&settings.upload_root, &settings.shell_host),
            initial_size: TermSize::default(),
        },
        max_message_bytes: settings.max_message_bytes,
    });

    tracing::info!(
        addr = %settings.listen,
        policy = ?settings.not_ready_policy,
        marker = supervisor.marker(),
        "cloudshell-server listening"
    );
    let listener = tokio::net::TcpListener::bind(settings.listen).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
