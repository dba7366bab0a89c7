//! Packet capture subprocess (tshark)
//!
//! Invocation:
//!   tshark -a duration:<secs> -I -i <adapter> -Tfields -e wlan.sa
//!
//! The tool blocks for the capture duration and prints one source address per
//! captured frame on stdout. A spawn failure or non-zero exit is reported as a
//! `CaptureError` instead of an empty capture.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Bytes of stderr kept in error reports
const STDERR_TAIL: usize = 512;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to start capture tool {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("capture tool exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("capture task aborted: {0}")]
    Aborted(String),
}

/// Capture collaborator
#[async_trait]
pub trait Capture: Send + Sync {
    /// Run one capture on `adapter` for `duration`; returns raw stdout text
    async fn capture(&self, adapter: &str, duration: Duration) -> Result<String, CaptureError>;
}

/// tshark-backed capture
pub struct TsharkCapture {
    tool_path: String,
    field: String,
}

impl TsharkCapture {
    pub fn new(tool_path: &str, field: &str) -> Self {
        Self { tool_path: tool_path.to_string(), field: field.to_string() }
    }

    fn args(&self, adapter: &str, duration: Duration) -> Vec<String> {
        vec![
            "-a".to_string(),
            format!("duration:{}", duration.as_secs().max(1)),
            "-I".to_string(),
            "-i".to_string(),
            adapter.to_string(),
            "-Tfields".to_string(),
            "-e".to_string(),
            self.field.clone(),
        ]
    }
}

#[async_trait]
impl Capture for TsharkCapture {
    async fn capture(&self, adapter: &str, duration: Duration) -> Result<String, CaptureError> {
        let args = self.args(adapter, duration);
        debug!(tool = %self.tool_path, args = ?args, "capture_spawn");

        let output = Command::new(&self.tool_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CaptureError::Spawn { tool: self.tool_path.clone(), source })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let trimmed = stderr.trim();
            let tail = match trimmed.char_indices().rev().nth(STDERR_TAIL) {
                Some((idx, _)) => &trimmed[idx..],
                None => trimmed,
            };
            return Err(CaptureError::Exit { code: output.status.code(), stderr: tail.to_string() });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Split capture output into identifiers, dropping anything too short
///
/// A frame can carry several comma-separated addresses when the field repeats.
pub fn split_identifiers(raw: &str, min_len: usize) -> Vec<String> {
    raw.lines()
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|candidate| candidate.len() >= min_len)
        .map(str::to_string)
        .collect()
}
