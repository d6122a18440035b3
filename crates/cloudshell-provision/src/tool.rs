use std::{path::Path, process::Stdio};

use cloudshell_core::{Error, Result};
use tokio::process::Command;

const STDERR_TAIL_BYTES: usize = 4 * 1024;

fn tail_lossy(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

/// Run an external utility to completion. Non-zero exit is a `Process` error.
pub async fn run_tool<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    run(program, args, cwd, None).await
}

/// [`run_tool`] with stdout written to `out`, which is created or truncated.
pub async fn run_tool_to_file<I, S>(program: &str, args: I, out: &Path) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let file = tokio::fs::File::create(out)
        .await
        .map_err(|e| Error::io(out, e))?
        .into_std()
        .await;
    run(program, args, None, Some(file)).await
}

async fn run<I, S>(
    program: &str,
    args: I,
    cwd: Option<&Path>,
    stdout: Option<std::fs::File>,
) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(stdout.map_or_else(Stdio::piped, Stdio::from))
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let out = cmd
        .output()
        .await
        .map_err(|e| Error::Process(format!("spawn {program}: {e}")))?;

    let stdout = tail_lossy(&out.stdout);
    if !stdout.is_empty() {
        tracing::debug!(program, %stdout, "tool output");
    }

    if !out.status.success() {
        return Err(Error::Process(format!(
            "{program} failed ({}): {}",
            out.status,
            tail_lossy(&out.stderr)
        )));
    }
    Ok(())
}
