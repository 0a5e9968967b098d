//! Forced detach fallback chain.
//!
//! Used when a consumer crashed with file handles open on a vault volume
//! and the container must be reclaimed anyway.
//!
//! # Order
//!
//! 1. `hdiutil detach -force` (detaches the image and all its partitions)
//! 2. `diskutil unmount force` (unmounts the volume if the image is wedged)
//! 3. `umount -f` (last resort)
//!
//! **Callers must only pass mount points of containers they own.** These
//! commands will unmount any path.

use std::ffi::OsStr;
use std::path::Path;

use crate::command::{ToolOutput, run_tool};
use crate::error::DiskImageError;
use crate::service::Result;

/// Programs used by the fallback chain.
#[derive(Debug, Clone)]
pub(crate) struct ForceDetachTools<'a> {
    pub hdiutil: &'a str,
    pub diskutil: &'a str,
    pub umount: &'a str,
}

/// Force a mount point off the system, trying each tool in turn.
pub(crate) async fn force_detach(tools: &ForceDetachTools<'_>, mount_point: &Path) -> Result<()> {
    let attempts: [(&str, Vec<&OsStr>); 3] = [
        (
            tools.hdiutil,
            vec![OsStr::new("detach"), OsStr::new("-force"), mount_point.as_os_str()],
        ),
        (
            tools.diskutil,
            vec![OsStr::new("unmount"), OsStr::new("force"), mount_point.as_os_str()],
        ),
        (tools.umount, vec![OsStr::new("-f"), mount_point.as_os_str()]),
    ];

    let mut last: Option<(String, ToolOutput)> = None;
    for (program, args) in attempts {
        match run_tool(program, args, None).await {
            Ok(output) if output.success => {
                tracing::debug!(
                    "Force detach via {} succeeded for {}",
                    program,
                    mount_point.display()
                );
                return Ok(());
            }
            Ok(output) => {
                tracing::debug!(
                    "{} failed to force detach {}: {}",
                    program,
                    mount_point.display(),
                    output.stderr
                );
                last = Some((program.to_owned(), output));
            }
            Err(DiskImageError::ToolMissing(tool)) => {
                tracing::debug!("{} not available, trying next fallback", tool);
            }
            Err(e) => return Err(e),
        }
    }

    match last {
        Some((program, output)) => Err(DiskImageError::CommandFailed {
            program,
            code: output.code,
            stderr: output.stderr,
        }),
        None => Err(DiskImageError::ToolMissing(tools.hdiutil.to_owned())),
    }
}
