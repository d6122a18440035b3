use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use cloudshell_core::{Error, Result};
use cloudshell_process::SessionId;

const STDERR_TAIL_BYTES: usize = 4096;

/// Where uploads are staged and how they reach the guest.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub root: PathBuf,
    pub host: String,
    /// Secure-copy program; always invoked as `<program> -q <file> <host>:/tmp/<session>/`.
    pub copy_program: String,
}

impl UploadConfig {
    pub fn new(root: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            host: host.into(),
            copy_program: "scp".to_string(),
        }
    }
}

/// Accept only `[A-Za-z0-9_. -]+`. Never touches the filesystem.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("file name is empty".to_string()));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ' ' | '-')))
    {
        return Err(Error::Validation(format!(
            "file name {name:?} contains {bad:?}; allowed: letters, digits, '_', '.', ' ', '-'"
        )));
    }
    // The class admits these; they would resolve to the staging directory or its parent.
    if name == "." || name == ".." {
        return Err(Error::Validation(format!("file name {name:?} is reserved")));
    }
    Ok(())
}

/// Per-session staging directory. Created on first use, removed when dropped.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure(&self) -> Result<&Path> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(&self.path)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match tokio::fs::remove_dir_all(&path).await {
                        Ok(()) => tracing::debug!(path = %path.display(), "staging removed"),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            tracing::debug!(path = %path.display(), error = %e, "staging cleanup failed")
                        }
                    }
                });
            }
            Err(_) => {
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }
}

/// Upload side channel of one session.
#[derive(Debug)]
pub struct UploadChannel {
    session: SessionId,
    staging: StagingDir,
    host: String,
    copy_program: String,
}

impl UploadChannel {
    pub fn new(config: &UploadConfig, session: &SessionId) -> Self {
        Self {
            session: session.clone(),
            staging: StagingDir::new(config.root.join(session.as_str())),
            host: config.host.clone(),
            copy_program: config.copy_program.clone(),
        }
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    /// Guest directory that receives this session's files.
    pub fn remote_dir(&self) -> String {
        format!("/tmp/{}/", self.session)
    }

    /// Write `payload` to `<staging>/<name>`. Same name again overwrites.
    pub async fn stage(&self, name: &str, payload: &[u8]) -> Result<PathBuf> {
        validate_file_name(name)?;
        let dir = self.staging.ensure().await?;
        let path = dir.join(name);
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| Error::io(&path, e))?;
        tracing::debug!(path = %path.display(), bytes = payload.len(), "upload staged");
        Ok(path)
    }

    /// Copy a staged file into the guest. Non-zero exit is a `Process` error.
    pub async fn deliver(&self, staged: &Path) -> Result<()> {
        let target = format!("{}:{}", self.host, self.remote_dir());
        let out = tokio::process::Command::new(&self.copy_program)
            .arg("-q")
            .arg(staged)
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Process(format!("spawn {}: {e}", self.copy_program)))?;

        if !out.status.success() {
            let stderr = &out.stderr[out.stderr.len().saturating_sub(STDERR_TAIL_BYTES)..];
            return Err(Error::Process(format!(
                "{} to {target} exited with {}: {}",
                self.copy_program,
                out.status,
                String::from_utf8_lossy(stderr).trim()
            )));
        }
        tracing::info!(file = %staged.display(), %target, "upload delivered");
        Ok(())
    }

    pub async fn handle(&self, name: &str, payload: &[u8]) -> Result<()> {
        let staged = self.stage(name, payload).await?;
        self.deliver(&staged).await
    }
}
