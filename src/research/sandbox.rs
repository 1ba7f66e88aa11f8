//! Sandboxed execution of analysis snippets.
//!
//! A snippet is written to a temporary file in the run's working directory
//! and run by the configured interpreter with a cleared environment. The
//! child is killed when the wall-clock timeout fires.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::util::{sanitize_output, truncate_chars};

/// Environment variables passed through to the interpreter.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "LANG"];

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub interpreter: String,
    pub timeout: Duration,
    pub max_output_chars: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            timeout: Duration::from_secs(30),
            max_output_chars: 50_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to prepare snippet: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        source: std::io::Error,
    },
}

/// Outcome of one snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct CodeSandbox {
    config: SandboxConfig,
}

impl CodeSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn cap(&self, text: String) -> String {
        if text.chars().count() > self.config.max_output_chars {
            format!(
                "{}\n... (output truncated)",
                truncate_chars(&text, self.config.max_output_chars)
            )
        } else {
            text
        }
    }

    pub async fn run(&self, code: &str, working_dir: &Path) -> Result<ExecutionResult, SandboxError> {
        tracing::info!("Executing snippet ({} chars) with {}", code.len(), self.config.interpreter);

        let script = tempfile::Builder::new()
            .prefix("snippet_")
            .suffix(".py")
            .tempfile_in(working_dir)?
            .into_temp_path();
        tokio::fs::write(&script, code).await?;

        let mut command = Command::new(&self.config.interpreter);
        command
            .arg(&*script)
            .current_dir(working_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let child = command.spawn().map_err(|source| SandboxError::Spawn {
            interpreter: self.config.interpreter.clone(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!("Snippet timed out after {:?}", self.config.timeout);
                return Ok(ExecutionResult {
                    success: false,
                    output: String::new(),
                    error: format!(
                        "Execution timed out after {} seconds",
                        self.config.timeout.as_secs()
                    ),
                });
            }
        };

        let stdout = self.cap(sanitize_output(&output.stdout).trim().to_string());
        let stderr = sanitize_output(&output.stderr).trim().to_string();

        if output.status.success() {
            tracing::debug!("Snippet succeeded ({} chars output)", stdout.len());
            Ok(ExecutionResult {
                success: true,
                output: if stdout.is_empty() { "(no output)".to_string() } else { stdout },
                error: String::new(),
            })
        } else {
            let code = output.status.code().unwrap_or(-1);
            tracing::warn!("Snippet exited with code {}", code);
            Ok(ExecutionResult {
                success: false,
                output: stdout,
                error: if stderr.is_empty() {
                    format!("Process exited with code {}", code)
                } else {
                    self.cap(stderr)
                },
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell(timeout: Duration) -> CodeSandbox {
        CodeSandbox::new(SandboxConfig {
            interpreter: "sh".to_string(),
            timeout,
            max_output_chars: 20,
        })
    }

    #[tokio::test]
    async fn test_success_and_truncation() {
        let dir = TempDir::new().unwrap();
        let sandbox = shell(Duration::from_secs(5));

        let result = sandbox.run("echo hello", dir.path()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hello");

        let result = sandbox.run("printf '%050d' 0", dir.path()).await.unwrap();
        assert!(result.output.ends_with("... (output truncated)"));

        let result = sandbox.run("true", dir.path()).await.unwrap();
        assert_eq!(result.output, "(no output)");
    }

    #[tokio::test]
    async fn test_failure_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let sandbox = shell(Duration::from_secs(5));

        let result = sandbox.run("echo partial; echo boom >&2; exit 2", dir.path()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.output, "partial");
        assert_eq!(result.error, "boom");
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        let dir = TempDir::new().unwrap();
        let sandbox = shell(Duration::from_secs(5));
        std::env::set_var("REPORT_SANDBOX_SECRET", "leak");

        let result = sandbox
            .run("echo \"[${REPORT_SANDBOX_SECRET:-}]\"", dir.path())
            .await
            .unwrap();
        assert_eq!(result.output, "[]");
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let sandbox = shell(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = sandbox.run("sleep 10", dir.path()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let dir = TempDir::new().unwrap();
        let sandbox = CodeSandbox::new(SandboxConfig {
            interpreter: "/definitely/not/an/interpreter".to_string(),
            ..SandboxConfig::default()
        });
        assert!(matches!(
            sandbox.run("1", dir.path()).await,
            Err(SandboxError::Spawn { .. })
        ));
    }
}
