//! Research agent: turns registered source files into condensed research notes.
//!
//! Three phases, all inside the `researching` workflow step:
//!
//! 1. **Plan** - research questions (cheap model, structured) and a short
//!    analysis strategy naming what to look for in each file.
//! 2. **Analyze** - one fresh tool-calling conversation per file, strictly in
//!    order. Findings are appended to a [`ProgressDoc`], which is the only
//!    context carried from one file to the next.
//! 3. **Synthesize** - one call that compiles the progress document into the
//!    research notes handed to report generation.
//!
//! A failed file is recorded and skipped. A rate limit on a file analysis ends
//! the whole step. Before each file the agent checks that enough budget is left
//! for synthesis and report generation; if not, the remaining files are skipped.

mod plan;
mod progress;
mod sandbox;
mod sources;
mod tools;

pub use plan::{PlannedResearch, ResearchPlan, ResearchPlanner};
pub use progress::ProgressDoc;
pub use sandbox::{CodeSandbox, ExecutionResult, SandboxConfig, SandboxError};
pub use sources::SourceLibrary;
pub use tools::{ReadFile, RunCode, SearchFile, Tool, ToolInfo, ToolRegistry};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::budget::{BudgetError, TokenBudget, TokenMetrics, COUNTING_MODEL};
use crate::llm::{ChatMessage, ChatRequest, GatewayError, ModelGateway, TaskType, TokenUsage};
use crate::skills::LoadedSkill;
use crate::workflow::{FileRegistryEntry, ReportConfig};

/// Tokens that must remain before another file is analyzed.
pub const RESEARCH_SAFETY_MARGIN: u64 = 30_000;
/// Tool-calling rounds per file before the model must answer without tools.
pub const MAX_TOOL_ROUNDS: usize = 8;

const STRATEGY_MAX_TOKENS: u32 = 1000;
const FILE_MAX_TOKENS: u32 = 2000;
const SYNTHESIS_MAX_TOKENS: u32 = 5000;

const STRATEGY_SYSTEM: &str = "You are a research planning agent. Given a list of uploaded files \
and user instructions, create a brief analysis plan.\n\n\
Output a numbered list of files in the order they should be analyzed, \
with 1-2 bullet points per file describing what to look for.\n\
Keep your response concise, under 500 words.";

const FILE_ANALYSIS_SYSTEM: &str = "You are a research analyst. Your task is to analyze a single file \
and extract key findings.\n\n\
Focus on:\n\
- Specific numbers, metrics, and data points\n\
- Key conclusions and insights\n\
- Notable patterns or anomalies\n\
- Relevant quotes or statements\n\n\
Output ONLY concise bullet points of findings. \
Do NOT include raw data dumps or reproduce file content verbatim.\n\
Keep findings under 800 words.";

const SYNTHESIS_SYSTEM: &str = "You are a research synthesizer. Compile the accumulated research findings \
into well-organized research notes for a report writer.\n\n\
OUTPUT FORMAT:\n\
## Key Findings\nList the most important discoveries.\n\n\
## Detailed Notes\nOrganized by topic/theme with specific data points.\n\n\
## Data & Statistics\nNumerical findings, calculations, results.\n\n\
## Source References\nWhich files provided which information.\n\n\
## Recommendations for Report\nSuggestions for report structure.\n\n\
Be thorough but concise. Preserve all specific numbers and evidence. \
Do not fabricate; only include what is present in the findings.";

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("No files registered for research")]
    NoFiles,

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("No usable research findings: every file was skipped or failed analysis")]
    NoFindings,

    #[error("Synthesis returned empty research notes")]
    EmptyNotes,

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("Failed to prepare research workspace: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single file's analysis failed. Never fatal on its own except for rate limits.
#[derive(Debug, Error)]
enum AnalysisError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("Model returned no findings")]
    Empty,
}

impl AnalysisError {
    fn is_rate_limit(&self) -> bool {
        matches!(self, Self::Gateway(e) if e.is_rate_limit())
    }
}

/// Outcome for one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAnalysis {
    Analyzed { file_name: String, findings: String },
    Failed { file_name: String, error: String },
    Skipped { file_name: String },
}

impl FileAnalysis {
    pub fn file_name(&self) -> &str {
        match self {
            Self::Analyzed { file_name, .. }
            | Self::Failed { file_name, .. }
            | Self::Skipped { file_name } => file_name,
        }
    }

    pub fn is_analyzed(&self) -> bool {
        matches!(self, Self::Analyzed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub notes: String,
    pub plan: ResearchPlan,
    pub strategy: String,
    pub analyses: Vec<FileAnalysis>,
    /// Progress document as handed to synthesis
    pub progress_doc: String,
}

/// Receives intermediate progress while the agent runs.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: u8, message: &str);
}

/// Discards progress.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _progress: u8, _message: &str) {}
}

pub struct ResearchAgent {
    report_id: Uuid,
    gateway: Arc<ModelGateway>,
    library: Arc<SourceLibrary>,
    sandbox: Arc<CodeSandbox>,
    skills: Vec<LoadedSkill>,
    budget: TokenBudget,
    metrics: TokenMetrics,
}

impl ResearchAgent {
    pub fn new(
        report_id: Uuid,
        gateway: Arc<ModelGateway>,
        library: Arc<SourceLibrary>,
        sandbox: Arc<CodeSandbox>,
    ) -> Self {
        Self {
            report_id,
            gateway,
            library,
            sandbox,
            skills: Vec::new(),
            budget: TokenBudget::default(),
            metrics: TokenMetrics::default(),
        }
    }

    pub fn with_skills(mut self, skills: Vec<LoadedSkill>) -> Self {
        self.skills = skills;
        self
    }

    /// Continue from a budget that earlier steps already drew on.
    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    /// Usage of this agent's calls only.
    pub fn metrics(&self) -> &TokenMetrics {
        &self.metrics
    }

    fn bill(&mut self, usage: &TokenUsage) {
        if usage.total_tokens == 0 {
            return;
        }
        self.budget.record(usage);
        self.metrics.record(usage);
    }

    /// Refuse a call the remaining budget cannot cover.
    fn authorize(&self, messages: &[ChatMessage], system: &str, max_tokens: u32) -> Result<(), BudgetError> {
        let estimate =
            self.gateway
                .token_counter()
                .estimate_request(messages, Some(system), max_tokens, COUNTING_MODEL);
        self.budget.authorize(estimate)
    }

    fn bill_failure(&mut self, error: &GatewayError) {
        if let Some(usage) = error.billed_usage() {
            let usage = usage.clone();
            self.bill(&usage);
        }
    }

    pub async fn run(
        &mut self,
        config: &ReportConfig,
        progress: &dyn ProgressSink,
    ) -> Result<ResearchOutcome, ResearchError> {
        let files: Vec<FileRegistryEntry> = self.library.files().to_vec();
        if files.is_empty() {
            return Err(ResearchError::NoFiles);
        }
        let workdir = tempfile::Builder::new().prefix("research_").tempdir()?;

        progress.report(18, "Planning document analysis...").await;

        let descriptions: Vec<String> = files.iter().map(describe_file).collect();
        let planned = ResearchPlanner::new(Arc::clone(&self.gateway))
            .plan(&self.budget, &config.title, config.custom_instructions.as_deref(), &descriptions)
            .await;
        self.bill(&planned.usage);

        let strategy = self.plan_strategy(config, &files, &planned.plan).await?;
        tracing::info!(
            "Report {} | RESEARCH | Plan ready ({} questions), budget used {}/{}",
            self.report_id,
            planned.plan.questions.len(),
            self.budget.used(),
            self.budget.max_cumulative()
        );
        progress.report(20, "Analysis plan created, reading files...").await;

        let mut doc = ProgressDoc::new(&strategy);
        let mut analyses = Vec::with_capacity(files.len());
        let n = files.len();

        for (i, entry) in files.iter().enumerate() {
            if self.budget.ensure_available(RESEARCH_SAFETY_MARGIN).is_err() {
                let skipped: Vec<&str> = files[i..].iter().map(|f| f.file_name.as_str()).collect();
                tracing::warn!(
                    "Report {} | RESEARCH | Budget tight ({} remaining), skipping {} files",
                    self.report_id,
                    self.budget.remaining(),
                    skipped.len()
                );
                doc.append_skipped(&skipped);
                analyses.extend(files[i..].iter().map(|f| FileAnalysis::Skipped {
                    file_name: f.file_name.clone(),
                }));
                break;
            }

            let pct = 20 + (i * 25 / n) as u8;
            progress
                .report(pct, &format!("Analyzing {} ({}/{})...", entry.file_name, i + 1, n))
                .await;

            let limit = self.budget.adaptive_file_limit(n - i);
            match self.analyze_file(entry, &strategy, &doc, limit, workdir.path()).await {
                Ok(findings) => {
                    tracing::info!(
                        "Report {} | RESEARCH | {} analyzed ({} chars), budget used {}",
                        self.report_id,
                        entry.file_name,
                        findings.len(),
                        self.budget.used()
                    );
                    doc.append(&entry.file_name, &findings);
                    analyses.push(FileAnalysis::Analyzed {
                        file_name: entry.file_name.clone(),
                        findings,
                    });
                }
                Err(e) if e.is_rate_limit() => {
                    tracing::error!(
                        "Report {} | RESEARCH | Rate limit on {}: {}",
                        self.report_id,
                        entry.file_name,
                        e
                    );
                    return Err(ResearchError::RateLimited(e.to_string()));
                }
                Err(e) => {
                    tracing::error!(
                        "Report {} | RESEARCH | Failed to analyze {}: {}",
                        self.report_id,
                        entry.file_name,
                        e
                    );
                    let error = e.to_string();
                    doc.append_failure(&entry.file_name, &error);
                    analyses.push(FileAnalysis::Failed {
                        file_name: entry.file_name.clone(),
                        error,
                    });
                }
            }
        }

        if !analyses.iter().any(FileAnalysis::is_analyzed) {
            return Err(ResearchError::NoFindings);
        }

        progress.report(45, "Synthesizing research findings...").await;
        let notes = self.synthesize(config, &doc).await?;

        tracing::info!(
            "Report {} | RESEARCH | Complete. Notes: {} chars, budget used: {}/{}",
            self.report_id,
            notes.len(),
            self.budget.used(),
            self.budget.max_cumulative()
        );

        Ok(ResearchOutcome {
            notes,
            plan: planned.plan,
            strategy,
            analyses,
            progress_doc: doc.as_str().to_string(),
        })
    }

    async fn plan_strategy(
        &mut self,
        config: &ReportConfig,
        files: &[FileRegistryEntry],
        plan: &ResearchPlan,
    ) -> Result<String, ResearchError> {
        let questions: Vec<String> = plan
            .questions
            .iter()
            .enumerate()
            .map(|(i, q)| format!("{}. {}", i + 1, q))
            .collect();
        let file_list: Vec<String> = files.iter().map(|f| format!("- {}", describe_file(f))).collect();

        let user = format!(
            "REPORT TITLE: {}\nDETAIL LEVEL: {}\nUSER INSTRUCTIONS: {}\n\n\
             RESEARCH QUESTIONS:\n{}\n\n\
             AVAILABLE FILES:\n{}\n\n\
             Create an analysis plan for these files.",
            config.title,
            config.detail_level.as_str(),
            config
                .custom_instructions
                .as_deref()
                .unwrap_or("Analyze the provided documents"),
            questions.join("\n"),
            file_list.join("\n")
        );

        let messages = vec![ChatMessage::user(user)];
        self.authorize(&messages, STRATEGY_SYSTEM, STRATEGY_MAX_TOKENS)?;

        match self
            .gateway
            .generate_text(
                TaskType::Classification,
                messages,
                Some(STRATEGY_SYSTEM),
                Some(STRATEGY_MAX_TOKENS),
                None,
            )
            .await
        {
            Ok(generation) => {
                self.bill(&generation.usage);
                Ok(generation.content.trim().to_string())
            }
            Err(e) => {
                self.bill_failure(&e);
                Err(e.into())
            }
        }
    }

    fn file_system_prompt(&self) -> String {
        if self.skills.is_empty() {
            return FILE_ANALYSIS_SYSTEM.to_string();
        }
        let mut prompt = format!("{}\n\nANALYSIS SKILLS:\n", FILE_ANALYSIS_SYSTEM);
        for skill in &self.skills {
            prompt.push_str(&format!("\n### {}\n{}\n", skill.name, skill.content.trim()));
        }
        prompt
    }

    /// One fresh tool-calling conversation for `entry`.
    async fn analyze_file(
        &mut self,
        entry: &FileRegistryEntry,
        strategy: &str,
        doc: &ProgressDoc,
        token_limit: u64,
        workdir: &Path,
    ) -> Result<String, AnalysisError> {
        let tools = ToolRegistry::for_file_analysis(
            Arc::clone(&self.library),
            Arc::clone(&self.sandbox),
            token_limit,
        );
        let schemas = tools.get_tool_schemas();
        let system = self.file_system_prompt();
        let counter = *self.gateway.token_counter();
        let system_tokens = counter.count_tokens(&system, COUNTING_MODEL);

        let mut messages = vec![ChatMessage::user(format!(
            "Analyze the file '{name}' ({kind}).\n\n\
             ANALYSIS GUIDANCE:\n{strategy}\n\n\
             ACCUMULATED FINDINGS SO FAR:\n{findings}\n\n\
             INSTRUCTIONS:\n\
             1. Read the file using read_file('{name}')\n\
             2. If the file is large or truncated, use search_file() for specific data\n\
             3. If data analysis is needed, use run_code()\n\
             4. Output ONLY your key findings as concise bullet points\n\
             5. Include specific numbers, data points, and quotes\n\
             6. Do NOT repeat findings already in the accumulated notes above\n",
            name = entry.file_name,
            kind = entry.file_type,
            strategy = strategy,
            findings = doc.as_str(),
        ))];

        for round in 0..=MAX_TOOL_ROUNDS {
            let tools_allowed = round < MAX_TOOL_ROUNDS;
            let estimate = counter.count_messages_tokens(&messages, COUNTING_MODEL) + system_tokens;
            self.budget.check_call(estimate)?;

            let mut request = ChatRequest::new(messages.clone())
                .with_system(system.clone())
                .with_max_tokens(FILE_MAX_TOKENS);
            if tools_allowed {
                request = request.with_tools(schemas.clone());
            }

            let generation = match self.gateway.complete(TaskType::Research, request).await {
                Ok(generation) => generation,
                Err(e) => {
                    self.bill_failure(&e);
                    return Err(e.into());
                }
            };
            self.bill(&generation.usage);

            if !tools_allowed || generation.tool_calls.is_empty() {
                let findings = generation.content.trim();
                if findings.is_empty() {
                    return Err(AnalysisError::Empty);
                }
                return Ok(findings.to_string());
            }

            let content = Some(generation.content.clone()).filter(|c| !c.trim().is_empty());
            messages.push(ChatMessage::assistant_tool_calls(content, generation.tool_calls.clone()));

            for call in &generation.tool_calls {
                tracing::debug!(
                    "Report {} | RESEARCH | Tool {} args {}",
                    self.report_id,
                    call.function.name,
                    call.function.arguments
                );
                let output = match parse_arguments(&call.function.arguments) {
                    Ok(args) => match tools.execute(&call.function.name, args, workdir).await {
                        Ok(output) => output,
                        Err(e) => format!("Error: {}", e),
                    },
                    Err(e) => format!("Error: invalid tool arguments: {}", e),
                };
                messages.push(ChatMessage::tool_result(&call.id, output));
            }
        }

        // The last round runs without tools and always returns above.
        Err(AnalysisError::Empty)
    }

    async fn synthesize(&mut self, config: &ReportConfig, doc: &ProgressDoc) -> Result<String, ResearchError> {
        let user = format!(
            "REPORT TITLE: {}\nDETAIL LEVEL: {}\n\nRESEARCH FINDINGS:\n{}\n\n\
             Synthesize these findings into polished research notes.",
            config.title,
            config.detail_level.as_str(),
            doc.as_str()
        );

        let messages = vec![ChatMessage::user(user)];
        self.authorize(&messages, SYNTHESIS_SYSTEM, SYNTHESIS_MAX_TOKENS)?;

        let generation = match self
            .gateway
            .generate_text(
                TaskType::Research,
                messages,
                Some(SYNTHESIS_SYSTEM),
                Some(SYNTHESIS_MAX_TOKENS),
                None,
            )
            .await
        {
            Ok(generation) => generation,
            Err(e) => {
                self.bill_failure(&e);
                return Err(e.into());
            }
        };
        self.bill(&generation.usage);

        let notes = generation.content.trim();
        if notes.is_empty() {
            return Err(ResearchError::EmptyNotes);
        }
        Ok(notes.to_string())
    }
}

fn describe_file(entry: &FileRegistryEntry) -> String {
    format!(
        "{} (type: {}, size: {:.1} KB)",
        entry.file_name,
        entry.file_type,
        entry.file_size as f64 / 1024.0
    )
}

fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{fast_config, text, tool_call, HandlerClient};
    use crate::llm::{LlmClient, LlmError, Provider, Role};
    use crate::services::PlainTextProvider;
    use std::sync::Mutex;

    const PLAN_JSON: &str =
        r#"{"title": "Sales", "summary": "s", "questions": ["q1?", "q2?", "q3?"]}"#;

    fn last_user(request: &ChatRequest) -> String {
        request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .last()
            .and_then(|m| m.content.clone())
            .unwrap_or_default()
    }

    fn system(request: &ChatRequest) -> &str {
        request.system_prompt.as_deref().unwrap_or_default()
    }

    /// Plans, strategy and synthesis answer fixed text; file analysis goes through `per_file`.
    fn client<F>(per_file: F) -> Arc<HandlerClient>
    where
        F: Fn(&ChatRequest) -> Result<crate::llm::ChatResponse, LlmError> + Send + Sync + 'static,
    {
        Arc::new(HandlerClient::new(Provider::Anthropic, move |request| {
            let sys = system(request);
            if sys.starts_with("You are a research planning assistant") {
                text(PLAN_JSON)
            } else if sys.starts_with("You are a research planning agent") {
                text("1. a.txt - totals")
            } else if sys.starts_with("You are a research synthesizer") {
                text(&format!("## Key Findings\n{}", last_user(request)))
            } else {
                per_file(request)
            }
        }))
    }

    async fn agent(client: Arc<HandlerClient>, files: &[(&str, &str)]) -> ResearchAgent {
        let gateway = Arc::new(ModelGateway::new(
            vec![client as Arc<dyn LlmClient>],
            None,
            fast_config(),
        ));
        let (library, _) = sources::tests::library(files, PlainTextProvider::new()).await;
        let sandbox = CodeSandbox::new(SandboxConfig {
            interpreter: "sh".to_string(),
            ..SandboxConfig::default()
        });
        ResearchAgent::new(Uuid::new_v4(), gateway, Arc::new(library), Arc::new(sandbox))
    }

    fn config() -> ReportConfig {
        ReportConfig::from_value(&json!({"title": "Sales"})).unwrap()
    }

    struct Recorder(Mutex<Vec<u8>>);

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn report(&self, progress: u8, _message: &str) {
            self.0.lock().unwrap().push(progress);
        }
    }

    #[tokio::test]
    async fn test_failed_file_is_recorded_and_others_synthesized() {
        let llm = client(|request| {
            let user = last_user(request);
            if user.contains("Analyze the file 'b.txt'") {
                Err(LlmError::client_error(400, "context too long"))
            } else if user.contains("Analyze the file 'a.txt'") {
                text("- alpha revenue 12%")
            } else {
                text("- gamma churn 3%")
            }
        });
        let mut agent = agent(
            llm.clone(),
            &[("a.txt", "alpha"), ("b.txt", "beta"), ("c.txt", "gamma")],
        )
        .await;
        let recorder = Recorder(Mutex::new(Vec::new()));

        let outcome = agent.run(&config(), &recorder).await.unwrap();

        assert!(outcome.notes.contains("- alpha revenue 12%"));
        assert!(outcome.notes.contains("- gamma churn 3%"));
        assert!(outcome.notes.contains("### b.txt\n(analysis failed:"));
        assert!(matches!(&outcome.analyses[1], FileAnalysis::Failed { file_name, .. } if file_name == "b.txt"));
        assert_eq!(outcome.analyses.iter().filter(|a| a.is_analyzed()).count(), 2);
        assert_eq!(outcome.plan.questions.len(), 3);

        assert_eq!(*recorder.0.lock().unwrap(), vec![18, 20, 20, 28, 36, 45]);

        // plan, strategy, a, b, c, synthesis
        assert_eq!(llm.requests().len(), 6);
        assert_eq!(agent.metrics().calls, 5);
        assert_eq!(agent.budget().used(), agent.metrics().total_tokens());
    }

    #[tokio::test]
    async fn test_rate_limit_on_file_is_fatal() {
        let llm = client(|_| Err(LlmError::rate_limited("429 Too Many Requests", None)));
        let mut agent = agent(llm, &[("a.txt", "alpha"), ("b.txt", "beta")]).await;

        let err = agent.run(&config(), &NoProgress).await.unwrap_err();
        assert!(matches!(err, ResearchError::RateLimited(_)));
        assert!(err.to_string().starts_with("Rate limit exceeded:"));
    }

    #[tokio::test]
    async fn test_tool_loop_reads_file() {
        let llm = client(|request| {
            let last = request.messages.last().unwrap();
            if last.role == Role::Tool {
                let output = last.content.clone().unwrap_or_default();
                text(&format!("- file said: {}", output))
            } else {
                tool_call("call_1", "read_file", json!({"file_name": "a.txt"}))
            }
        });
        let mut agent = agent(llm.clone(), &[("a.txt", "net margin 41%")]).await;

        let outcome = agent.run(&config(), &NoProgress).await.unwrap();
        assert_eq!(
            outcome.analyses[0],
            FileAnalysis::Analyzed {
                file_name: "a.txt".to_string(),
                findings: "- file said: net margin 41%".to_string(),
            }
        );

        let requests = llm.requests();
        let with_tools: Vec<&ChatRequest> = requests.iter().filter(|r| r.tools.is_some()).collect();
        assert_eq!(with_tools.len(), 2);
        let second = with_tools[1];
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.messages[1].role, Role::Assistant);
        assert_eq!(second.messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_endless_tool_calls_end_with_forced_answer() {
        let llm = client(|request| {
            if request.tools.is_some() {
                tool_call("c", "search_file", json!({"file_name": "a.txt", "query": "x"}))
            } else {
                text("- final")
            }
        });
        let mut agent = agent(llm.clone(), &[("a.txt", "x")]).await;

        let outcome = agent.run(&config(), &NoProgress).await.unwrap();
        assert!(outcome.analyses[0].is_analyzed());
        let tool_rounds = llm.requests().iter().filter(|r| r.tools.is_some()).count();
        assert_eq!(tool_rounds, MAX_TOOL_ROUNDS);
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_every_file() {
        let llm = client(|_| text("- never"));
        let mut budget = TokenBudget::default();
        // enough for plan and strategy, below the per-file margin
        budget.record_usage(DEFAULT_MAX - 20_000, 0);
        let mut agent = agent(llm.clone(), &[("a.txt", "alpha"), ("b.txt", "beta")])
            .await
            .with_budget(budget);

        let err = agent.run(&config(), &NoProgress).await.unwrap_err();
        assert!(matches!(err, ResearchError::NoFindings));
        // plan and strategy only
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_spent_budget_never_reaches_the_model() {
        let llm = client(|_| text("- never"));
        let mut budget = TokenBudget::default();
        budget.record_usage(DEFAULT_MAX - 500, 0);
        let mut agent = agent(llm.clone(), &[("a.txt", "alpha")]).await.with_budget(budget);

        let err = agent.run(&config(), &NoProgress).await.unwrap_err();
        assert!(matches!(err, ResearchError::Budget(BudgetError::Insufficient { .. })));
        assert!(llm.requests().is_empty());
        assert_eq!(agent.budget().used(), DEFAULT_MAX - 500);
    }

    #[tokio::test]
    async fn test_synthesis_is_refused_when_files_spend_the_budget() {
        let llm = client(|_| {
            Ok(crate::llm::ChatResponse {
                content: Some("- found it".to_string()),
                usage: Some(crate::llm::Usage::new(36_000, 2_000)),
                ..Default::default()
            })
        });
        // plan and strategy leave 39_700, the file bills 38_000
        let mut agent = agent(llm.clone(), &[("a.txt", "alpha")])
            .await
            .with_budget(TokenBudget::new(80_000, 40_000));

        let err = agent.run(&config(), &NoProgress).await.unwrap_err();
        assert!(matches!(err, ResearchError::Budget(BudgetError::Insufficient { .. })));
        assert_eq!(llm.requests().len(), 3);
        assert!(llm
            .requests()
            .iter()
            .all(|r| !system(r).starts_with("You are a research synthesizer")));
    }

    const DEFAULT_MAX: u64 = crate::budget::DEFAULT_MAX_CUMULATIVE;

    #[tokio::test]
    async fn test_skills_reach_file_prompt() {
        let llm = client(|_| text("- ok"));
        let mut agent = agent(llm.clone(), &[("a.txt", "alpha")]).await.with_skills(vec![LoadedSkill {
            name: "csv-analysis".to_string(),
            description: "d".to_string(),
            content: "Sum columns first.".to_string(),
        }]);

        agent.run(&config(), &NoProgress).await.unwrap();
        let file_request = llm
            .requests()
            .into_iter()
            .find(|r| system(r).starts_with("You are a research analyst"))
            .unwrap();
        assert!(system(&file_request).contains("ANALYSIS SKILLS:\n\n### csv-analysis\nSum columns first."));
    }
}
