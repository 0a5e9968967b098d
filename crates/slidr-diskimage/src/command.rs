//! External tool invocation.
//!
//! The disk image facility is driven through `hdiutil`/`diskutil`. Passwords
//! are written to the child's standard input, never passed as arguments,
//! so they do not appear in process listings.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::Stdio;

use secrecy::zeroize::Zeroizing;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::DiskImageError;
use crate::service::Result;

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub(crate) struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, feeding `stdin` (if any) and collecting output.
///
/// A non-zero exit status is not an error here; callers classify it with
/// [`classify_failure`] because the meaning depends on the operation.
pub(crate) async fn run_tool<I, S>(
    program: &str,
    args: I,
    stdin: Option<Zeroizing<Vec<u8>>>,
) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|error| map_spawn_error(program, error))?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            // A tool that exits before reading its password closes the pipe;
            // its exit status carries the real failure.
            if let Err(e) = pipe.write_all(&input).await {
                tracing::debug!("{} closed stdin early: {}", program, e);
            }
            drop(pipe);
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|error| map_spawn_error(program, error))?;

    Ok(ToolOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}

fn map_spawn_error(program: &str, error: io::Error) -> DiskImageError {
    if error.kind() == io::ErrorKind::NotFound {
        return DiskImageError::ToolMissing(program.to_owned());
    }
    DiskImageError::io(program, error)
}

/// Map a failed tool run onto the error taxonomy.
///
/// `subject` is the container or mount point the operation was about.
pub(crate) fn classify_failure(program: &str, output: &ToolOutput, subject: &Path) -> DiskImageError {
    let stderr = output.stderr.to_lowercase();

    if stderr.contains("authentication error") || stderr.contains("incorrect passphrase") {
        return DiskImageError::InvalidCredential(subject.to_path_buf());
    }
    if stderr.contains("resource busy") || stderr.contains("in use by") {
        return DiskImageError::DeviceBusy(subject.to_path_buf());
    }
    if stderr.contains("already attached") {
        return DiskImageError::AlreadyAttached(subject.to_path_buf());
    }
    if stderr.contains("no such file or directory") {
        return DiskImageError::ContainerNotFound(subject.to_path_buf());
    }

    DiskImageError::CommandFailed {
        program: program.to_owned(),
        code: output.code,
        stderr: output.stderr.clone(),
    }
}
