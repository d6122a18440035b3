use std::path::{Path, PathBuf};

use cloudshell_core::{Error, Result};

use crate::tool::{run_tool, run_tool_to_file};

/// Directory name every emulator archive unpacks to.
pub const EMULATOR_ARCHIVE_ROOT: &str = "sdk";

/// Sibling of `target` used while its content is still being written.
fn partial_path(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    target.with_file_name(name)
}

/// `xz -d -k -c <archive>` into `<target>.part`, renamed to `target` on success.
///
/// Skipped entirely when `target` already exists. The compressed file is kept
/// so the download cache stays valid.
pub async fn decompress_image(archive: &Path, target: &Path) -> Result<PathBuf> {
    if target.exists() {
        tracing::info!(path = %target.display(), "image already decompressed, skipping");
        return Ok(target.to_path_buf());
    }
    if archive.extension().is_none_or(|ext| ext != "xz") {
        return Err(Error::Process(format!(
            "not an .xz archive: {}",
            archive.display()
        )));
    }

    let part = partial_path(target, ".part");
    tracing::info!(archive = %archive.display(), "decompressing image");
    let res = run_tool_to_file(
        "xz",
        [
            std::ffi::OsString::from("-d"),
            "-k".into(),
            "-c".into(),
            archive.as_os_str().to_owned(),
        ],
        &part,
    )
    .await;
    if let Err(err) = res {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(err);
    }

    tokio::fs::rename(&part, target)
        .await
        .map_err(|e| Error::io(target, e))?;
    tracing::info!(path = %target.display(), "image decompressed");
    Ok(target.to_path_buf())
}

/// `tar -xf <archive>` into `<target>.partial/`, then move the fixed
/// [`EMULATOR_ARCHIVE_ROOT`] directory from there to `target`.
///
/// A scratch directory left by an interrupted run is discarded first.
pub async fn extract_emulator(archive: &Path, target: &Path) -> Result<PathBuf> {
    if target.exists() {
        tracing::info!(path = %target.display(), "emulator already extracted, skipping");
        return Ok(target.to_path_buf());
    }

    let scratch = partial_path(target, ".partial");
    if scratch.exists() {
        tracing::warn!(path = %scratch.display(), "removing leftover extraction");
        tokio::fs::remove_dir_all(&scratch)
            .await
            .map_err(|e| Error::io(&scratch, e))?;
    }
    tokio::fs::create_dir_all(&scratch)
        .await
        .map_err(|e| Error::io(&scratch, e))?;

    tracing::info!(archive = %archive.display(), "extracting emulator");
    run_tool(
        "tar",
        [
            std::ffi::OsString::from("-xf"),
            archive.as_os_str().to_owned(),
            "-C".into(),
            scratch.as_os_str().to_owned(),
        ],
        None,
    )
    .await?;

    let produced = scratch.join(EMULATOR_ARCHIVE_ROOT);
    if !produced.is_dir() {
        return Err(Error::Process(format!(
            "{} missing after extracting {}",
            EMULATOR_ARCHIVE_ROOT,
            archive.display()
        )));
    }
    tokio::fs::rename(&produced, target)
        .await
        .map_err(|e| Error::io(target, e))?;
    if let Err(err) = tokio::fs::remove_dir_all(&scratch).await {
        tracing::debug!(path = %scratch.display(), error = %err, "scratch cleanup failed");
    }
    tracing::info!(path = %target.display(), "emulator extracted");
    Ok(target.to_path_buf())
}
