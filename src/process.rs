use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration for spawning a plugin process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub log_prefix: String,
}

/// Output from a completed child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Standard output followed by standard error.
    pub fn combined(&self) -> String {
        self.stdout_lines
            .iter()
            .chain(self.stderr_lines.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn describe_exit(&self) -> String {
        match self.signal {
            Some(sig) => format!("killed by signal {sig}"),
            None => format!("exit status {}", self.exit_code),
        }
    }
}

/// Spawn a child process and collect its output line by line. There is no
/// timeout; the call returns when the child exits.
pub async fn spawn_and_stream(config: ProcessConfig) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Process("stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Process("stderr not captured".into()))?;

    let prefix_out = config.log_prefix.clone();
    let prefix_err = config.log_prefix;

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_out}] {line}");
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_err}] stderr: {line}");
            lines.push(line);
        }
        lines
    });

    let status = child
        .wait()
        .await
        .map_err(|e| Error::Process(format!("wait error: {e}")))?;

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = extract_exit_info(&status);

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout_lines,
        stderr_lines,
    })
}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output_order() {
        let output = ProcessOutput {
            exit_code: 0,
            signal: None,
            stdout_lines: vec!["a".into(), "b".into()],
            stderr_lines: vec!["warn".into()],
        };
        assert_eq!(output.combined(), "a\nb\nwarn");
        assert!(output.success());
    }

    #[test]
    fn test_describe_exit() {
        let output = ProcessOutput {
            exit_code: 137,
            signal: Some(9),
            stdout_lines: vec![],
            stderr_lines: vec![],
        };
        assert!(!output.success());
        assert_eq!(output.describe_exit(), "killed by signal 9");
    }
}
