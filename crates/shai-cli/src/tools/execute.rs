//! Shell command execution function

use async_trait::async_trait;
use serde_json::{Map, Value};
use shai_agent::{FunctionHandler, HandlerError};
use shai_llm::{FunctionDefinition, ParameterSchema};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub const EXECUTE_COMMAND: &str = "executeCommand";

/// Maximum output size in bytes before truncation
const MAX_OUTPUT_SIZE: usize = 100_000;
/// Maximum number of lines before truncation
const MAX_OUTPUT_LINES: usize = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Upper bound on a requested timeout
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Decides whether a proposed command may run
#[async_trait]
pub trait CommandApproval: Send + Sync {
    async fn approve(&self, command: &str) -> bool;
}

/// Approves everything (`--yes`)
pub struct AutoApprove;

#[async_trait]
impl CommandApproval for AutoApprove {
    async fn approve(&self, _command: &str) -> bool {
        true
    }
}

pub fn definition() -> FunctionDefinition {
    FunctionDefinition::new(
        EXECUTE_COMMAND,
        "Execute a shell command in the current working directory. Returns stdout and stderr.",
    )
    .param(
        "command",
        ParameterSchema::string("The shell command to execute"),
        true,
    )
    .param(
        "timeout",
        ParameterSchema::integer("Timeout in seconds (optional, at most 3600)"),
        false,
    )
}

pub struct ExecuteCommand {
    approval: Arc<dyn CommandApproval>,
    echo: bool,
}

impl ExecuteCommand {
    pub fn new(approval: Arc<dyn CommandApproval>) -> Self {
        Self {
            approval,
            echo: false,
        }
    }

    /// Print the command and its output to the terminal
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

#[async_trait]
impl FunctionHandler for ExecuteCommand {
    async fn call(&self, arguments: Map<String, Value>) -> Result<String, HandlerError> {
        let command = arguments
            .get("command")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or("Missing 'command' argument")?;

        let timeout_secs = arguments
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        if !self.approval.approve(command).await {
            tracing::info!("Command declined: {}", command);
            return Err("The user declined to run this command".into());
        }

        tracing::debug!("Running command: {}", command);
        if self.echo {
            println!("$ {}", command);
        }
        let result = run_command(command, timeout_secs).await;

        if self.echo {
            match &result {
                Ok(output) => println!("{}", output),
                Err(e) => eprintln!("{}", e),
            }
        }
        result
    }
}

/// Run `command` through the platform shell, collecting both output streams.
///
/// `timeout_secs` is capped at [`MAX_TIMEOUT_SECS`].
pub async fn run_command(command: &str, timeout_secs: u64) -> Result<String, HandlerError> {
    let timeout_secs = timeout_secs.min(MAX_TIMEOUT_SECS);
    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let mut child = Command::new(shell)
        .arg(shell_arg)
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to spawn command: {}", e))?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err("Failed to capture command output".into());
    };

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout = CapturedOutput::default();
    let mut stderr = CapturedOutput::default();
    let mut stdout_open = true;
    let mut stderr_open = true;

    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(timeout_secs);

    // Drain both pipes before reaping so no trailing output is lost
    while stdout_open || stderr_open {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                return Err(format!(
                    "{}\n\nCommand timed out after {} seconds",
                    stdout.combine(stderr),
                    timeout_secs
                )
                .into());
            }
            line = stdout_reader.next_line(), if stdout_open => match line {
                Ok(Some(l)) => stdout.push(&l),
                Ok(None) => stdout_open = false,
                Err(e) => {
                    stderr.push(&format!("Stdout read error: {}", e));
                    stdout_open = false;
                }
            },
            line = stderr_reader.next_line(), if stderr_open => match line {
                Ok(Some(l)) => stderr.push(&l),
                Ok(None) => stderr_open = false,
                Err(e) => {
                    stderr.push(&format!("Stderr read error: {}", e));
                    stderr_open = false;
                }
            },
        }
    }

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => status.map_err(|e| format!("Failed to wait for command: {}", e))?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(format!("Command timed out after {} seconds", timeout_secs).into());
        }
    };

    let mut result = stdout.combine(stderr);
    if result.is_empty() {
        result = "(no output)".to_string();
    }

    if status.success() {
        Ok(result)
    } else {
        let code = status.code().unwrap_or(-1);
        Err(format!("{}\n\nCommand exited with code {}", result, code).into())
    }
}

#[derive(Default)]
struct CapturedOutput {
    text: String,
    lines: usize,
    truncated: bool,
}

impl CapturedOutput {
    fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.lines >= MAX_OUTPUT_LINES || self.text.len() + line.len() > MAX_OUTPUT_SIZE {
            self.truncated = true;
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.lines += 1;
    }

    fn finish(mut self, stream: &str) -> String {
        if self.truncated {
            self.text.push_str(&format!(
                "\n\n... ({} truncated at {} lines / {}KB)",
                stream,
                self.lines,
                MAX_OUTPUT_SIZE / 1024
            ));
        }
        self.text
    }

    /// Stdout followed by stderr
    fn combine(self, stderr: CapturedOutput) -> String {
        let mut result = self.finish("stdout");
        let errors = stderr.finish("stderr");
        if !errors.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&errors);
        }
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records proposed commands and answers with a fixed verdict
    struct Recorded {
        verdict: bool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandApproval for Recorded {
        async fn approve(&self, command: &str) -> bool {
            self.seen.lock().unwrap().push(command.to_string());
            self.verdict
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_runs_command() {
        let output = run_command("echo hello", 10).await.unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn test_empty_output() {
        let output = run_command("true", 10).await.unwrap();
        assert_eq!(output, "(no output)");
    }

    #[tokio::test]
    async fn test_stderr_is_appended() {
        let output = run_command("echo out; echo err >&2", 10).await.unwrap();
        assert_eq!(output, "out\nerr");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let err = run_command("echo nope; exit 3", 10).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("nope"));
        assert!(message.ends_with("Command exited with code 3"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = run_command("sleep 5", 1).await.unwrap_err();
        assert!(err.to_string().contains("timed out after 1 seconds"));
    }

    #[tokio::test]
    async fn test_huge_timeout_is_capped() {
        let handler = ExecuteCommand::new(Arc::new(AutoApprove));
        let output = handler
            .call(args(json!({ "command": "echo hi", "timeout": u64::MAX })))
            .await
            .unwrap();
        assert_eq!(output, "hi");
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let output = run_command("seq 1 2000", 10).await.unwrap();
        assert!(output.contains("stdout truncated at 1000 lines"));
        assert!(output.starts_with("1\n2\n"));
    }

    #[tokio::test]
    async fn test_declined_command_does_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let approval = Arc::new(Recorded {
            verdict: false,
            seen: Default::default(),
        });
        let handler = ExecuteCommand::new(approval.clone());

        let command = format!("touch {}", marker.display());
        let err = handler
            .call(args(json!({ "command": command.clone() })))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("declined"));
        assert!(!marker.exists());
        assert_eq!(approval.seen.lock().unwrap().as_slice(), [command]);
    }

    #[tokio::test]
    async fn test_approved_command_runs() {
        let handler = ExecuteCommand::new(Arc::new(AutoApprove));
        let output = handler
            .call(args(json!({ "command": "printf 'a\\nb'" })))
            .await
            .unwrap();
        assert_eq!(output, "a\nb");
    }

    #[tokio::test]
    async fn test_blank_command_is_rejected() {
        let handler = ExecuteCommand::new(Arc::new(AutoApprove));
        let err = handler
            .call(args(json!({ "command": "   " })))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing 'command' argument");
    }

    #[test]
    fn test_definition_schema() {
        let schema = definition().json_schema();
        assert_eq!(schema["required"], json!(["command"]));
        assert_eq!(schema["properties"]["timeout"]["type"], "integer");
    }
}
