use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "cloudshell.json";

/// Location of the persisted record, `CLOUDSHELL_CONFIG` or the default.
pub fn config_path() -> PathBuf {
    PathBuf::from(crate::env::env_string_or(
        "CLOUDSHELL_CONFIG",
        DEFAULT_CONFIG_PATH,
    ))
}

/// Written once by the provisioner, read once by the server at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Absolute path of the decompressed raw disk image.
    pub image: PathBuf,
    /// Absolute path of the extracted emulator root (contains `bin/`).
    pub qemu: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: format!("read failed: {e}"),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: format!("invalid json: {e}"),
        })
    }

    /// Atomic write: serialize to `<path>.tmp`, then rename over `path`.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let data = serde_json::to_vec_pretty(self).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: format!("serialize failed: {e}"),
        })?;
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        std::fs::write(&tmp, data).map_err(|e| Error::io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::io(path, e));
        }

        tracing::info!(path = %path.display(), image = %self.image.display(), qemu = %self.qemu.display(), "config persisted");
        Ok(())
    }
}
