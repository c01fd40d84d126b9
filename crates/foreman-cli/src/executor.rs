//! Step executors available to `foreman worker run`.
//!
//! The real domain logic lives outside this process: a configured command
//! receives the claimed step as JSON on stdin and must print the output
//! payload as JSON on stdout. A non-zero exit or non-JSON stdout is a step
//! failure. The command is responsible for bounding its own latency; the
//! worker enforces no timeout, and the stale-recovery sweep is the backstop.

use std::io::Write;
use std::process::{Command, Stdio};

use foreman_core::error::{ForemanError, Result};
use foreman_core::mission::Step;
use foreman_core::worker::StepExecutor;
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    /// Fails fast when the command's program can't be found on PATH, so a
    /// misconfigured pool doesn't burn through its queue failing steps.
    pub fn new(command: impl Into<String>) -> Result<Self> {
        let command = command.into();
        let program = command.split_whitespace().next().unwrap_or("");
        if program.is_empty() {
            return Err(ForemanError::Validation("worker command is empty".into()));
        }
        if !program.contains('/') && which::which(program).is_err() {
            return Err(ForemanError::Validation(format!(
                "worker command not found on PATH: {program}"
            )));
        }
        Ok(Self { command })
    }
}

impl StepExecutor for CommandExecutor {
    fn execute(&self, step: &Step) -> Result<Value> {
        let stdin_json = serde_json::to_string(step)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // stderr flows through so the command's log lines reach the terminal
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ForemanError::StepExecution(format!("spawn failed: {e}")))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(stdin_json.as_bytes())
                .map_err(|e| ForemanError::StepExecution(format!("failed to write stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ForemanError::StepExecution(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let hint: String = stdout.chars().take(500).collect();
            return Err(ForemanError::StepExecution(format!(
                "command exited with {}: {hint}",
                output.status
            )));
        }

        serde_json::from_str(&stdout)
            .map_err(|_| ForemanError::StepExecution("command printed non-JSON output".into()))
    }
}

// ---------------------------------------------------------------------------
// EchoExecutor
// ---------------------------------------------------------------------------

/// Builtin fallback when no command is configured for a kind: wraps the
/// step's input back as the output. Useful for wiring checks and demos.
pub struct EchoExecutor;

impl StepExecutor for EchoExecutor {
    fn execute(&self, step: &Step) -> Result<Value> {
        Ok(json!({ "echo": step.input, "title": step.title }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn step() -> Step {
        Step::new(Uuid::new_v4(), "analyze", "Run analysis", json!({ "n": 7 }))
    }

    #[test]
    fn echo_wraps_input() {
        let out = EchoExecutor.execute(&step()).unwrap();
        assert_eq!(out["echo"]["n"], 7);
        assert_eq!(out["title"], "Run analysis");
    }

    #[test]
    fn command_executor_parses_stdout_json() {
        let exec = CommandExecutor::new("cat > /dev/null; echo '{\"ok\": true}'").unwrap();
        let out = exec.execute(&step()).unwrap();
        assert_eq!(out["ok"], true);
    }

    #[test]
    fn command_executor_receives_step_on_stdin() {
        // jq-free field probe: grep the raw JSON for the step kind.
        let exec = CommandExecutor::new(
            "grep -q '\"kind\":\"analyze\"' && echo '{\"seen\": true}'",
        )
        .unwrap();
        let out = exec.execute(&step()).unwrap();
        assert_eq!(out["seen"], true);
    }

    #[test]
    fn nonzero_exit_is_a_step_failure() {
        let exec = CommandExecutor::new("cat > /dev/null; exit 3").unwrap();
        let err = exec.execute(&step()).unwrap_err();
        assert!(matches!(err, ForemanError::StepExecution(_)));
    }

    #[test]
    fn non_json_stdout_is_a_step_failure() {
        let exec = CommandExecutor::new("cat > /dev/null; echo not-json").unwrap();
        assert!(exec.execute(&step()).is_err());
    }

    #[test]
    fn missing_program_is_rejected_up_front() {
        assert!(CommandExecutor::new("definitely-not-a-real-binary-xyz").is_err());
        assert!(CommandExecutor::new("").is_err());
    }
}
