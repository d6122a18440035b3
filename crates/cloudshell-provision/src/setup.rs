use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use cloudshell_core::{Error, Result};
use cloudshell_process::{Supervisor, VmSpec};

use crate::tool::run_tool;

pub const DEFAULT_SETUP_SCRIPT: &str = "setupcloudshell.sh";
pub const DEFAULT_SETUP_HOST: &str = "imagesetup";
pub const REMOTE_SCRIPT_PATH: &str = "/etc/rc.d/setupcloudshell.sh";
const SETUP_VM_MEMORY: &str = "512M";
const SETUP_VM_SMP: usize = 4;
const SETUP_VM_SSH_PORT: u16 = 2223;

/// How the guest is reached for the one-time image setup.
#[derive(Debug, Clone)]
pub enum ImageSetup {
    /// Boot the fresh image under a supervisor and run setup once it reaches login.
    Boot {
        marker: String,
        boot_timeout: Duration,
    },
    /// A VM answering on the setup host alias is already running.
    Attach,
    Skip,
}

/// ssh alias and local script used for setup.
#[derive(Debug, Clone)]
pub struct SetupTarget {
    pub host: String,
    pub script: PathBuf,
}

impl Default for SetupTarget {
    fn default() -> Self {
        Self {
            host: DEFAULT_SETUP_HOST.to_string(),
            script: PathBuf::from(DEFAULT_SETUP_SCRIPT),
        }
    }
}

async fn copy_and_run(target: &SetupTarget) -> Result<()> {
    tracing::info!(host = %target.host, script = %target.script.display(), "copying setup script");
    run_tool(
        "scp",
        [
            std::ffi::OsString::from("-o"),
            "StrictHostKeyChecking=no".into(),
            "-q".into(),
            target.script.as_os_str().to_owned(),
            format!("{}:{}", target.host, REMOTE_SCRIPT_PATH).into(),
        ],
        None,
    )
    .await?;

    tracing::info!(host = %target.host, "executing setup script");
    let remote_cmd = format!("sh {REMOTE_SCRIPT_PATH}");
    run_tool(
        "ssh",
        [
            "-o",
            "StrictHostKeyChecking=no",
            target.host.as_str(),
            remote_cmd.as_str(),
        ],
        None,
    )
    .await
}

/// Prepare the guest image in place. Every remote step must succeed.
pub async fn run_image_setup(
    mode: &ImageSetup,
    target: &SetupTarget,
    image: &Path,
    qemu_root: &Path,
) -> Result<()> {
    match mode {
        ImageSetup::Skip => {
            tracing::info!("image setup skipped");
            Ok(())
        }
        ImageSetup::Attach => copy_and_run(target).await,
        ImageSetup::Boot {
            marker,
            boot_timeout,
        } => {
            let mut spec = VmSpec::new(qemu_root, image);
            spec.memory = SETUP_VM_MEMORY.to_string();
            spec.smp = SETUP_VM_SMP;
            spec.ssh_forward_port = SETUP_VM_SSH_PORT;

            let supervisor = Supervisor::new(marker.clone());
            let mut vm = supervisor
                .spawn(&spec.command())
                .map_err(|e| Error::Process(format!("{e:#}")))?;

            let booted = tokio::time::timeout(*boot_timeout, vm.wait_ready()).await;
            let res = match booted {
                Ok(true) => copy_and_run(target).await,
                Ok(false) => Err(Error::Process(
                    "setup vm exited before reaching login".to_string(),
                )),
                Err(_) => Err(Error::Process(format!(
                    "setup vm did not reach login within {}s",
                    boot_timeout.as_secs()
                ))),
            };

            vm.kill();
            let code = vm.wait().await;
            tracing::info!(?code, "setup vm stopped");
            res
        }
    }
}
