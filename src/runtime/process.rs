//! CLI plumbing shared by the engine and cluster backends.

use std::process::Stdio;

use chrono::Utc;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::trace;

use super::{LogLine, LogStream};
use crate::error::RuntimeError;

/// Captured result of one CLI invocation.
#[derive(Debug)]
pub(super) struct CliOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program args…` to completion.
///
/// Failing to spawn the program (socket down, binary missing) is transient; the exit
/// status is left for the caller to classify.
pub(super) async fn run(
    program: &str,
    args: &[String],
    op: &'static str,
) -> Result<CliOutput, RuntimeError> {
    trace!(program, ?args, op, "runtime cli call");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RuntimeError::Transient {
            op,
            error: format!("cannot run {program}: {e}"),
        })?;

    Ok(CliOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Spawns a following log command and turns its stdout into a [`LogStream`].
///
/// The first `from_offset` lines are skipped. The child is killed when the stream is
/// dropped.
pub(super) fn follow_lines(
    program: &str,
    args: &[String],
    from_offset: u64,
) -> Result<LogStream, RuntimeError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RuntimeError::Transient {
            op: "logs",
            error: format!("cannot run {program}: {e}"),
        })?;

    let stdout = child.stdout.take().ok_or_else(|| RuntimeError::Transient {
        op: "logs",
        error: "log process has no stdout".into(),
    })?;
    let lines = BufReader::new(stdout).lines();

    let stream = stream::unfold(
        (child, lines, 0u64),
        move |(child, mut lines, mut offset)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let current = offset;
                        offset += 1;
                        if current < from_offset {
                            continue;
                        }
                        let out = LogLine {
                            offset: current,
                            at: Utc::now(),
                            line,
                        };
                        return Some((out, (child, lines, offset)));
                    }
                    Ok(None) | Err(_) => return None,
                }
            }
        },
    );
    Ok(Box::pin(stream))
}

/// Lowercased stderr contains any of `needles`.
pub(super) fn mentions(stderr: &str, needles: &[&str]) -> bool {
    let lower = stderr.to_ascii_lowercase();
    needles.iter().any(|n| lower.contains(n))
}
