// src/utils/streams.rs
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use anyhow::Result;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;

use crate::config::defs::{PipelineError, STDERR_TAIL_LINES};
use crate::utils::command::ToolCommand;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}


/// Runs an external command to completion in `cwd`, logging its output as it arrives.
/// stdout lines go to info, stderr lines to debug.
///
/// # Arguments
///
/// * `cmd` - Tool and argument vector. Not passed through a shell.
/// * `cwd` - Working directory for the child.
///
/// # Returns
/// Ok on exit status 0, otherwise PipelineError::ToolFailed carrying the stderr tail.
pub async fn run_command(cmd: &ToolCommand, cwd: &Path) -> Result<(), PipelineError> {
    let mut child = Command::new(&cmd.tool)
        .args(&cmd.args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::ToolExecution {
            tool: cmd.tool.clone(),
            error: e.to_string(),
        })?;

    let stdout = child.stdout.take().ok_or_else(|| PipelineError::ToolExecution {
        tool: cmd.tool.clone(),
        error: "failed to capture stdout".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| PipelineError::ToolExecution {
        tool: cmd.tool.clone(),
        error: "failed to capture stderr".to_string(),
    })?;

    let out_task = tokio::spawn(log_child_lines(stdout, ChildStream::Stdout, cmd.tool.clone(), 0));
    let err_task = tokio::spawn(log_child_lines(stderr, ChildStream::Stderr, cmd.tool.clone(), STDERR_TAIL_LINES));

    let status = child.wait().await.map_err(|e| PipelineError::ToolExecution {
        tool: cmd.tool.clone(),
        error: e.to_string(),
    })?;

    out_task
        .await
        .map_err(|e| PipelineError::Other(e.into()))?
        .map_err(PipelineError::Other)?;
    let stderr_tail = err_task
        .await
        .map_err(|e| PipelineError::Other(e.into()))?
        .map_err(PipelineError::Other)?;

    if status.success() {
        Ok(())
    } else {
        Err(PipelineError::ToolFailed {
            tool: cmd.tool.clone(),
            code: status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "terminated by signal".to_string()),
            stderr: Vec::from(stderr_tail).join("\n"),
        })
    }
}


/// Drains a child output pipe line by line into the log.
/// Output is decoded lossily; tools occasionally emit non-UTF-8 bytes.
///
/// # Arguments
///
/// * `reader` - Child stdout or stderr.
/// * `stream` - Which pipe, selects the log level.
/// * `tool` - Tag prefixed to each logged line.
/// * `keep` - Number of trailing lines to return.
///
/// # Returns
/// The last `keep` lines.
async fn log_child_lines<R>(reader: R, stream: ChildStream, tool: String, keep: usize) -> Result<VecDeque<String>>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(keep);
    let mut lines = SplitStream::new(BufReader::new(reader).split(b'\n'));

    while let Some(line) = lines.next().await {
        let line = line?;
        let line = String::from_utf8_lossy(&line).trim_end_matches('\r').to_string();
        match stream {
            ChildStream::Stdout => info!("[{}] {}", tool, line),
            ChildStream::Stderr => debug!("[{}] {}", tool, line),
        }
        if keep > 0 {
            if tail.len() == keep {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
    Ok(tail)
}
