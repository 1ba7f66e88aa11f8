//! Tools offered to the per-file analysis conversation.
//!
//! The model sees these through the gateway's tool-calling support. Every
//! tool works on the run's [`SourceLibrary`] by file name, never on raw paths,
//! so a model cannot reach outside the files registered for the report.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};

use super::sandbox::CodeSandbox;
use super::sources::SourceLibrary;
use crate::budget::COUNTING_MODEL;
use crate::llm::{FunctionDefinition, TokenCounter, ToolDefinition};
use crate::util::truncate_chars;

pub const MAX_SEARCH_MATCHES: usize = 10;
const SEARCH_CONTEXT_LINES: usize = 3;
pub const MAX_CODE_OUTPUT_CHARS: usize = 4_000;
const MAX_PARTIAL_OUTPUT_CHARS: usize = 1_000;

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool. `working_dir` is the run's scratch directory.
    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String>;
}

/// Registry of the tools available to one analysis conversation.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// The three file-analysis tools, reading at most `token_limit` tokens per file.
    pub fn for_file_analysis(
        library: Arc<SourceLibrary>,
        sandbox: Arc<CodeSandbox>,
        token_limit: u64,
    ) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ReadFile {
            library: Arc::clone(&library),
            token_limit,
        }));
        registry.register(Arc::new(SearchFile { library }));
        registry.register(Arc::new(RunCode { sandbox }));
        tracing::debug!(
            "Tool registry ready with {} tools (file token limit {})",
            registry.tools.len(),
            token_limit
        );
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool schemas in LLM-compatible format, sorted by name.
    pub fn get_tool_schemas(&self) -> Vec<ToolDefinition> {
        let mut schemas: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                },
            })
            .collect();
        schemas.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        schemas
    }

    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        working_dir: &Path,
    ) -> anyhow::Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;

        tool.execute(args, working_dir).await
    }
}

fn not_found(library: &SourceLibrary, file_name: &str) -> String {
    format!(
        "File not found: '{}'. Available: {}",
        file_name,
        library.file_names().join(", ")
    )
}

/// Full extracted text of one source file, truncated to the per-file allowance.
pub struct ReadFile {
    library: Arc<SourceLibrary>,
    token_limit: u64,
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read and parse a source file to extract its text content. Large files are truncated; use search_file to find specific sections."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_name": {
                    "type": "string",
                    "description": "Name of the file to read (must match an uploaded file)"
                }
            },
            "required": ["file_name"]
        })
    }

    async fn execute(&self, args: Value, _working_dir: &Path) -> anyhow::Result<String> {
        let file_name = args["file_name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'file_name' argument"))?;

        let Some(entry) = self.library.find(file_name) else {
            return Ok(not_found(&self.library, file_name));
        };

        let content = self
            .library
            .text(entry)
            .await
            .map_err(|e| anyhow::anyhow!("Error reading '{}': {}", file_name, e))?;

        let token_count = TokenCounter::new().count_tokens(&content, COUNTING_MODEL);
        tracing::info!(
            "Read file: {} ({} chars, ~{} tokens, limit: {})",
            entry.file_name,
            content.len(),
            token_count,
            self.token_limit
        );

        if token_count <= self.token_limit {
            return Ok(content.to_string());
        }

        let ratio = self.token_limit as f64 / token_count as f64;
        let keep = (content.chars().count() as f64 * ratio * 0.95) as usize;
        Ok(format!(
            "{}\n\n... (truncated: ~{} of ~{} tokens)\nUse search_file() to find specific sections.",
            truncate_chars(&content, keep),
            self.token_limit,
            token_count
        ))
    }
}

/// Case-insensitive search within one file, with surrounding lines.
pub struct SearchFile {
    library: Arc<SourceLibrary>,
}

#[async_trait]
impl Tool for SearchFile {
    fn name(&self) -> &str {
        "search_file"
    }

    fn description(&self) -> &str {
        "Search for a term or phrase within a source file. Returns each matching line with 3 lines of context."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_name": {
                    "type": "string",
                    "description": "Name of the file to search"
                },
                "query": {
                    "type": "string",
                    "description": "Search term or phrase (case-insensitive, literal)"
                }
            },
            "required": ["file_name", "query"]
        })
    }

    async fn execute(&self, args: Value, _working_dir: &Path) -> anyhow::Result<String> {
        let file_name = args["file_name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'file_name' argument"))?;
        let query = args["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' argument"))?;

        let Some(entry) = self.library.find(file_name) else {
            return Ok(not_found(&self.library, file_name));
        };

        let content = self
            .library
            .text(entry)
            .await
            .map_err(|e| anyhow::anyhow!("Error searching '{}': {}", file_name, e))?;

        let pattern = RegexBuilder::new(&regex::escape(query))
            .case_insensitive(true)
            .build()?;

        let lines: Vec<&str> = content.split('\n').collect();
        let matches: Vec<String> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| pattern.is_match(line))
            .map(|(i, _)| {
                let start = i.saturating_sub(SEARCH_CONTEXT_LINES);
                let end = (i + SEARCH_CONTEXT_LINES + 1).min(lines.len());
                format!("[Line {}]:\n{}", i + 1, lines[start..end].join("\n"))
            })
            .collect();

        tracing::info!(
            "Searched {} for '{}': {} matches",
            entry.file_name,
            query,
            matches.len()
        );

        if matches.is_empty() {
            return Ok(format!("No matches for '{}' in {}.", query, file_name));
        }

        let mut result = format!(
            "Found {} match(es) for '{}' in {}:\n\n",
            matches.len(),
            query,
            file_name
        );
        for block in matches.iter().take(MAX_SEARCH_MATCHES) {
            result.push_str(block);
            result.push_str("\n---\n");
        }
        if matches.len() > MAX_SEARCH_MATCHES {
            result.push_str(&format!(
                "\n... and {} more matches.",
                matches.len() - MAX_SEARCH_MATCHES
            ));
        }
        Ok(result)
    }
}

/// Snippet execution for numeric and tabular analysis.
pub struct RunCode {
    sandbox: Arc<CodeSandbox>,
}

#[async_trait]
impl Tool for RunCode {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Execute a Python snippet for data analysis or calculations. Print results to stdout. Runs with a hard timeout and no network credentials."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Source code to execute"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let code = args["code"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'code' argument"))?;

        let result = self.sandbox.run(code, working_dir).await?;

        if result.success {
            let total = result.output.chars().count();
            let output = if total > MAX_CODE_OUTPUT_CHARS {
                format!(
                    "{}\n... (truncated, {} total chars)",
                    truncate_chars(&result.output, MAX_CODE_OUTPUT_CHARS),
                    total
                )
            } else {
                result.output
            };
            return Ok(format!("Code executed successfully:\n{}", output));
        }

        let error = if result.error.is_empty() {
            "Unknown error"
        } else {
            result.error.as_str()
        };
        let mut response = format!("Code execution failed:\nError: {}", error);
        if !result.output.is_empty() {
            response.push_str(&format!(
                "\nPartial output: {}",
                truncate_chars(&result.output, MAX_PARTIAL_OUTPUT_CHARS)
            ));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::sandbox::SandboxConfig;
    use crate::research::sources::tests::library;
    use crate::services::PlainTextProvider;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn registry(files: &[(&str, &str)], token_limit: u64) -> ToolRegistry {
        let (lib, _) = library(files, PlainTextProvider::new()).await;
        let sandbox = CodeSandbox::new(SandboxConfig {
            interpreter: "sh".to_string(),
            timeout: Duration::from_secs(5),
            max_output_chars: 50_000,
        });
        ToolRegistry::for_file_analysis(Arc::new(lib), Arc::new(sandbox), token_limit)
    }

    #[tokio::test]
    async fn test_schemas_sorted() {
        let tools = registry(&[], 1_500).await;
        let names: Vec<String> = tools
            .get_tool_schemas()
            .into_iter()
            .map(|s| s.function.name)
            .collect();
        assert_eq!(names, vec!["read_file", "run_code", "search_file"]);
        assert!(tools.has_tool("search_file"));
        assert_eq!(tools.list_tools().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let tools = registry(&[], 1_500).await;
        let dir = TempDir::new().unwrap();
        let err = tools.execute("delete_file", json!({}), dir.path()).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown tool: delete_file");
    }

    #[tokio::test]
    async fn test_read_file_truncates_to_limit() {
        let text = "word ".repeat(4_000);
        let tools = registry(&[("big.txt", &text), ("small.md", "short")], 1_500).await;
        let dir = TempDir::new().unwrap();

        let small = tools
            .execute("read_file", json!({"file_name": "SMALL.md"}), dir.path())
            .await
            .unwrap();
        assert_eq!(small, "short");

        let big = tools
            .execute("read_file", json!({"file_name": "big"}), dir.path())
            .await
            .unwrap();
        assert!(big.contains("... (truncated: ~1500 of ~"));
        assert!(big.ends_with("Use search_file() to find specific sections."));
        assert!(big.len() < text.len());
    }

    #[tokio::test]
    async fn test_read_file_not_found_lists_files() {
        let tools = registry(&[("a.csv", ""), ("b.md", "")], 1_500).await;
        let dir = TempDir::new().unwrap();
        let out = tools
            .execute("read_file", json!({"file_name": "zzz.pdf"}), dir.path())
            .await
            .unwrap();
        assert_eq!(out, "File not found: 'zzz.pdf'. Available: a.csv, b.md");
    }

    #[tokio::test]
    async fn test_search_file_context_and_cap() {
        let mut lines: Vec<String> = (1..=30).map(|i| format!("line {}", i)).collect();
        lines[9] = "Revenue grew (12%)".to_string();
        let text = lines.join("\n");
        let tools = registry(&[("r.txt", &text)], 1_500).await;
        let dir = TempDir::new().unwrap();

        let out = tools
            .execute(
                "search_file",
                json!({"file_name": "r.txt", "query": "revenue GREW (12"}),
                dir.path(),
            )
            .await
            .unwrap();
        assert!(out.starts_with("Found 1 match(es) for 'revenue GREW (12' in r.txt:"));
        assert!(out.contains("[Line 10]:\nline 7\nline 8\nline 9\nRevenue grew (12%)\nline 11\nline 12\nline 13\n---"));

        let out = tools
            .execute("search_file", json!({"file_name": "r.txt", "query": "line"}), dir.path())
            .await
            .unwrap();
        assert!(out.starts_with("Found 29 match(es)"));
        assert!(out.ends_with("... and 19 more matches."));

        let out = tools
            .execute("search_file", json!({"file_name": "r.txt", "query": "absent"}), dir.path())
            .await
            .unwrap();
        assert_eq!(out, "No matches for 'absent' in r.txt.");
    }

    #[tokio::test]
    async fn test_run_code_reports_success_and_failure() {
        let tools = registry(&[], 1_500).await;
        let dir = TempDir::new().unwrap();

        let ok = tools
            .execute("run_code", json!({"code": "echo 42"}), dir.path())
            .await
            .unwrap();
        assert_eq!(ok, "Code executed successfully:\n42");

        let failed = tools
            .execute("run_code", json!({"code": "echo part; echo bad >&2; exit 1"}), dir.path())
            .await
            .unwrap();
        assert_eq!(failed, "Code execution failed:\nError: bad\nPartial output: part");

        let long = tools
            .execute("run_code", json!({"code": "printf '%05000d' 0"}), dir.path())
            .await
            .unwrap();
        assert!(long.ends_with("... (truncated, 5000 total chars)"));
    }

    #[tokio::test]
    async fn test_missing_argument_is_error() {
        let tools = registry(&[("a.txt", "x")], 1_500).await;
        let dir = TempDir::new().unwrap();
        assert!(tools
            .execute("search_file", json!({"file_name": "a.txt"}), dir.path())
            .await
            .is_err());
    }
}
