//! Inline script runner for `inline` cron jobs

use hive_foundation::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Cap on captured output stored in a run record
pub const MAX_OUTPUT_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, truncated to `MAX_OUTPUT_BYTES`
    pub output: String,
    pub timed_out: bool,
}

/// Run a short-lived script
///
/// With no `args` the command is a shell line run through `sh -c`; otherwise
/// it is executed directly with `args`.
pub async fn run_script(
    command: &str,
    args: &[String],
    cwd: Option<&Path>,
    limit: Duration,
) -> Result<ScriptOutput> {
    let mut cmd = if args.is_empty() {
        let (shell, shell_arg) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg).arg(command);
        cmd
    } else {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd
    };

    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| Error::Cron(format!("Failed to spawn {:?}: {}", command, e)))?;

    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            let mut content = stdout.trim_end().to_string();
            if !stderr.trim().is_empty() {
                if !content.is_empty() {
                    content.push_str("\n--- stderr ---\n");
                }
                content.push_str(stderr.trim_end());
            }

            Ok(ScriptOutput {
                success: output.status.success(),
                exit_code: output.status.code(),
                output: truncate(content, MAX_OUTPUT_BYTES),
                timed_out: false,
            })
        }
        Ok(Err(e)) => Err(Error::Cron(format!("Process error: {}", e))),
        // The child is dropped with the future and killed
        Err(_) => Ok(ScriptOutput {
            success: false,
            exit_code: None,
            output: format!("timed out after {}ms", limit.as_millis()),
            timed_out: true,
        }),
    }
}

/// Truncate on a char boundary, marking the cut
pub fn truncate(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[truncated]");
    text
}
