use std::path::Path;

use cloudshell_core::env::env_string;
use cloudshell_provision::Provisioner;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// stdout always; a daily log file as well when `CLOUDSHELL_LOG_DIR` is set.
fn init_logging() -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(dir) = env_string("CLOUDSHELL_LOG_DIR") else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    std::fs::create_dir_all(Path::new(&dir))?;
    let appender = tracing_appender::rolling::daily(&dir, "cloudshell-provision.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging()?;

    let provisioner = Provisioner::from_env()?;
    tracing::info!(
        cache_dir = %provisioner.cache_dir.display(),
        config = %provisioner.config_path.display(),
        "provisioning"
    );

    let config = provisioner.run().await?;
    tracing::info!(
        image = %config.image.display(),
        qemu = %config.qemu.display(),
        "provisioning complete"
    );
    Ok(())
}
