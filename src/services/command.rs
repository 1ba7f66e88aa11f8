//! Text extraction and rendering through external commands.
//!
//! Commands run under `/bin/sh -c`, receive their input on stdin and write
//! the result to stdout. Extra arguments are passed as positional shell
//! parameters, so a command line like `extract-text` is invoked as
//! `extract-text "$@"`.

use super::{DocumentTextProvider, Renderer, ServiceError};
use crate::content::{GeneratedPresentation, GeneratedReport};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Extensions decoded as UTF-8 without calling out.
const PLAIN_TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json"];

async fn run_piped(
    command: &str,
    args: &[&str],
    input: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, String> {
    let script = format!("{} \"$@\"", command);
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&script)
        .arg("sh")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to start '{}': {}", command, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        let input = input.to_vec();
        // Writer runs alongside the reader so large inputs cannot deadlock on a full pipe.
        tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("'{}' failed: {}", command, e)),
        Err(_) => {
            return Err(format!(
                "'{}' timed out after {} seconds",
                command,
                timeout.as_secs()
            ))
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "'{}' exited with code {}: {}",
            command,
            output.status.code().unwrap_or(-1),
            crate::util::truncate_chars(stderr.trim(), 500)
        ));
    }
    Ok(output.stdout)
}

/// Decodes plain-text formats directly; other formats go through a command.
#[derive(Debug, Clone, Default)]
pub struct CommandTextProvider {
    command: Option<String>,
    timeout: Duration,
}

impl CommandTextProvider {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DocumentTextProvider for CommandTextProvider {
    async fn parse(&self, data: &[u8], extension: &str, file_name: &str) -> Result<String, ServiceError> {
        let ext = extension.trim_start_matches('.').to_lowercase();
        if PLAIN_TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Ok(String::from_utf8_lossy(data).into_owned());
        }

        let command = self.command.as_deref().ok_or_else(|| {
            ServiceError::Extraction(format!(
                "No text extractor configured for .{} ({})",
                ext, file_name
            ))
        })?;

        tracing::debug!("Extracting text from {} via '{}'", file_name, command);
        let stdout = run_piped(command, &[&ext, file_name], data, self.timeout)
            .await
            .map_err(ServiceError::Extraction)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

/// One render command per output format. Unset formats cannot be rendered.
#[derive(Debug, Clone, Default)]
pub struct RenderCommands {
    pub pdf: Option<String>,
    pub docx: Option<String>,
    pub pptx: Option<String>,
}

/// Pipes JSON content to the format's render command and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    commands: RenderCommands,
    timeout: Duration,
}

impl CommandRenderer {
    pub fn new(commands: RenderCommands) -> Self {
        Self {
            commands,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn render<T: Serialize + Sync>(
        &self,
        format: &str,
        command: Option<&String>,
        content: &T,
    ) -> Result<Bytes, ServiceError> {
        let command = command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ServiceError::Render(format!("No {} renderer configured", format)))?;
        let json = serde_json::to_vec(content)
            .map_err(|e| ServiceError::Render(format!("Failed to serialize content: {}", e)))?;

        let stdout = run_piped(command, &[format], &json, self.timeout)
            .await
            .map_err(ServiceError::Render)?;
        if stdout.is_empty() {
            return Err(ServiceError::Render(format!("{} renderer produced no output", format)));
        }
        Ok(Bytes::from(stdout))
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render_pdf(&self, report: &GeneratedReport) -> Result<Bytes, ServiceError> {
        self.render("pdf", self.commands.pdf.as_ref(), report).await
    }

    async fn render_docx(&self, report: &GeneratedReport) -> Result<Bytes, ServiceError> {
        self.render("docx", self.commands.docx.as_ref(), report).await
    }

    async fn render_pptx(&self, presentation: &GeneratedPresentation) -> Result<Bytes, ServiceError> {
        self.render("pptx", self.commands.pptx.as_ref(), presentation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::tests::sample_report;

    #[tokio::test]
    async fn test_plain_text_decoded_without_command() {
        let provider = CommandTextProvider::new(None);
        let text = provider.parse(b"a,b\n1,2", ".CSV", "data.csv").await.unwrap();
        assert_eq!(text, "a,b\n1,2");

        let err = provider.parse(b"%PDF", "pdf", "doc.pdf").await.unwrap_err();
        assert!(matches!(err, ServiceError::Extraction(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_command_receives_args_and_stdin() {
        let provider = CommandTextProvider::new(Some("printf '%s|%s|' \"$1\" \"$2\"; cat; true".to_string()));
        let text = provider.parse(b"body", "pdf", "q3.pdf").await.unwrap();
        assert_eq!(text, "pdf|q3.pdf|body");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_render_pipes_json() {
        let renderer = CommandRenderer::new(RenderCommands {
            pdf: Some("cat; true".to_string()),
            docx: Some("exit 3; true".to_string()),
            pptx: None,
        });
        let report = sample_report();

        let bytes = renderer.render_pdf(&report).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["title"], report.title.as_str());

        let err = renderer.render_docx(&report).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let provider = CommandTextProvider::new(Some("sleep 5; true".to_string()))
            .with_timeout(Duration::from_millis(100));
        let err = provider.parse(b"", "pdf", "slow.pdf").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
