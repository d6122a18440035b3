use std::{net::SocketAddr, path::PathBuf};

use cloudshell_core::env::{env_bool, env_string, env_string_or, env_u64, env_usize};

use crate::bridge::NotReadyPolicy;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
pub const DEFAULT_SHELL_HOST: &str = "cloudshell";
pub const DEFAULT_UPLOAD_ROOT: &str = "/tmp/upload";
pub const DEFAULT_VM_SSH_PORT: u16 = 2222;
/// Largest single websocket message accepted from a client.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 5_000_000;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    pub vm_ssh_port: u16,
    pub respawn: bool,
    pub shell_host: String,
    pub upload_root: PathBuf,
    pub not_ready_policy: NotReadyPolicy,
    pub max_message_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 3000).into(),
            vm_ssh_port: DEFAULT_VM_SSH_PORT,
            respawn: true,
            shell_host: DEFAULT_SHELL_HOST.to_string(),
            upload_root: PathBuf::from(DEFAULT_UPLOAD_ROOT),
            not_ready_policy: NotReadyPolicy::default(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen = env_string_or("CLOUDSHELL_LISTEN", DEFAULT_LISTEN);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid CLOUDSHELL_LISTEN {listen:?}: {e}"))?;

        let not_ready_policy = match env_string("CLOUDSHELL_NOT_READY_POLICY") {
            Some(raw) => raw.parse()?,
            None => NotReadyPolicy::default(),
        };

        Ok(Self {
            listen,
            vm_ssh_port: env_u64("CLOUDSHELL_VM_SSH_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p != 0)
                .unwrap_or(DEFAULT_VM_SSH_PORT),
            respawn: env_bool("CLOUDSHELL_VM_RESPAWN").unwrap_or(true),
            shell_host: env_string_or("CLOUDSHELL_SHELL_HOST", DEFAULT_SHELL_HOST),
            upload_root: PathBuf::from(env_string_or("CLOUDSHELL_UPLOAD_ROOT", DEFAULT_UPLOAD_ROOT)),
            not_ready_policy,
            max_message_bytes: env_usize("CLOUDSHELL_MAX_MESSAGE_BYTES")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES),
        })
    }
}
