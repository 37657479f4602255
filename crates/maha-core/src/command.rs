//! Shared command execution primitive for verification commands and merge
//! gates (spec §4.4.1), plus the dangerous-pattern validator every such
//! command must pass before it is ever executed (spec §4.4.2).

use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Output is truncated to this many bytes (at a UTF-8 char boundary) before
/// being stored in an execution event.
const OUTPUT_TAIL_LIMIT: usize = 8192;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to execute command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait on command {command:?}: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `command` as a shell command (`sh -c "<command>"`) in `working_dir`,
/// bounded by `timeout`. Exit code `0` is a pass; anything else, including a
/// timeout, is a fail -- this function itself only errors when the shell
/// could not even be spawned or waited on.
pub async fn run_command(
    command: &str,
    working_dir: &Path,
    timeout: Duration,
) -> Result<CommandResult, CommandError> {
    let start = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| CommandError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    };

    match tokio::time::timeout(timeout, async {
        tokio::join!(child.wait(), read_stdout, read_stderr)
    })
    .await
    {
        Ok((Ok(status), stdout, stderr)) => Ok(CommandResult {
            passed: status.success(),
            exit_code: status.code(),
            stdout: truncate_tail(&String::from_utf8_lossy(&stdout)),
            stderr: truncate_tail(&String::from_utf8_lossy(&stderr)),
            duration_ms: start.elapsed().as_millis() as u64,
        }),
        Ok((Err(e), _, _)) => Err(CommandError::Wait {
            command: command.to_string(),
            source: e,
        }),
        Err(_) => {
            let _ = child.kill().await;
            Ok(CommandResult {
                passed: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("command timed out after {}s", timeout.as_secs()),
                duration_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

fn truncate_tail(s: &str) -> String {
    if s.len() <= OUTPUT_TAIL_LIMIT {
        return s.to_string();
    }
    let start = s.len() - OUTPUT_TAIL_LIMIT;
    let boundary = (start..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(s.len());
    s[boundary..].to_string()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandValidationError {
    #[error("command contains disallowed chaining/substitution pattern {0:?}")]
    DisallowedMetachar(String),

    #[error("command pipes into a destructive sink {0:?}")]
    DestructiveSink(String),

    #[error("command references a parent-directory path traversal segment")]
    PathTraversal,

    #[error("command invokes a privileged operation {0:?}")]
    PrivilegedOperation(String),
}

const CHAINING_METACHARS: &[&str] = &["&&", "||", ";", "`", "$("];
const DESTRUCTIVE_SINKS: &[&str] = &["rm", "dd", "mkfs", "shutdown", "reboot", "shred"];
const PRIVILEGED_OPS: &[&str] = &["sudo ", "doas ", "chmod 777", ":(){ :|:& };:"];

/// Reject verification/gate commands containing shell metacharacters used
/// for chaining or substitution, pipes into a destructive sink, `..`
/// path-traversal segments, or privileged operations. The task graph is
/// untrusted input; a rejection here is a validation-class error -- fatal,
/// never silently skipped (spec §4.4.2, §7).
pub fn validate_command(command: &str) -> Result<(), CommandValidationError> {
    for pat in CHAINING_METACHARS {
        if command.contains(pat) {
            return Err(CommandValidationError::DisallowedMetachar((*pat).to_string()));
        }
    }

    if let Some(idx) = command.find('|') {
        let after = command[idx + 1..].trim_start();
        for sink in DESTRUCTIVE_SINKS {
            if after.starts_with(sink) {
                return Err(CommandValidationError::DestructiveSink((*sink).to_string()));
            }
        }
    }

    if command
        .split(|c: char| c.is_whitespace() || c == '/')
        .any(|segment| segment == "..")
    {
        return Err(CommandValidationError::PathTraversal);
    }

    for op in PRIVILEGED_OPS {
        if command.contains(op) {
            return Err(CommandValidationError::PrivilegedOperation((*op).trim().to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_true_passes() {
        let result = run_command("true", Path::new("/tmp"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn run_false_fails() {
        let result = run_command("false", Path::new("/tmp"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let result = run_command(
            "echo out; echo err >&2",
            Path::new("/tmp"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(result.stdout.contains("out"));
        assert!(result.stderr.contains("err"));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_failure() {
        let result = run_command("sleep 30", Path::new("/tmp"), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.exit_code.is_none());
        assert!(result.stderr.contains("timed out"));
    }

    #[test]
    fn validate_rejects_command_chaining() {
        assert!(validate_command("npm test && rm -rf /").is_err());
        assert!(validate_command("npm test; echo done").is_err());
        assert!(validate_command("npm test || curl evil.example").is_err());
    }

    #[test]
    fn validate_rejects_substitution() {
        assert!(validate_command("echo `whoami`").is_err());
        assert!(validate_command("echo $(whoami)").is_err());
    }

    #[test]
    fn validate_rejects_destructive_pipe_sink() {
        assert!(validate_command("find . -name '*.tmp' | rm").is_err());
    }

    #[test]
    fn validate_allows_benign_pipe() {
        assert!(validate_command("cargo test | tee test.log").is_ok());
    }

    #[test]
    fn validate_rejects_path_traversal() {
        assert!(validate_command("cat ../../etc/passwd").is_err());
    }

    #[test]
    fn validate_rejects_privileged_ops() {
        assert!(validate_command("sudo rm file").is_err());
    }

    #[test]
    fn validate_allows_ordinary_verification_commands() {
        assert!(validate_command("cargo test --workspace").is_ok());
        assert!(validate_command("pytest tests/").is_ok());
        assert!(validate_command("npm run lint").is_ok());
    }
}
