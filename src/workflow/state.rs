//! The value threaded through the workflow.
//!
//! Every step takes a [`WorkflowState`] by value and returns the next one.
//! Nothing outside this struct carries run state between steps.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::{TokenBudget, TokenMetrics};
use crate::content::{GeneratedPresentation, GeneratedReport};
use crate::llm::TokenUsage;
use crate::research::FileAnalysis;
use crate::services::OutputFile;
use crate::skills::LoadedSkill;

/// Steps of a report run.
///
/// # State Machine
/// ```text
/// Pending -> RegisteringFiles -> PlanningSkills -> Researching -> GeneratingReport
///   -> [GeneratingPresentation] -> Rendering -> Finalizing -> Completed
///
/// any non-terminal step -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Pending,
    RegisteringFiles,
    PlanningSkills,
    Researching,
    GeneratingReport,
    GeneratingPresentation,
    Rendering,
    Finalizing,
    Completed,
    Failed,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RegisteringFiles => "registering_files",
            Self::PlanningSkills => "planning_skills",
            Self::Researching => "researching",
            Self::GeneratingReport => "generating_report",
            Self::GeneratingPresentation => "generating_presentation",
            Self::Rendering => "rendering",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Label used in log lines, e.g. `Report … | RESEARCH | …`.
    pub fn log_label(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::RegisteringFiles => "REGISTER_FILES",
            Self::PlanningSkills => "SKILLS",
            Self::Researching => "RESEARCH",
            Self::GeneratingReport => "REPORT",
            Self::GeneratingPresentation => "PRESENTATION",
            Self::Rendering => "RENDER",
            Self::Finalizing => "FINALIZE",
            Self::Completed => "COMPLETED",
            Self::Failed => "ERROR",
        }
    }

    /// # Property
    /// Terminal steps have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Executive,
    #[default]
    Standard,
    Comprehensive,
}

impl DetailLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executive => "executive",
            Self::Standard => "standard",
            Self::Comprehensive => "comprehensive",
        }
    }

    /// Length and depth instructions for the report writer.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Executive => "Create a concise executive summary report (1-2 pages equivalent). Focus on key takeaways and actionable recommendations.",
            Self::Standard => "Create a balanced report (3-5 pages equivalent). Include executive summary, analysis, and recommendations.",
            Self::Comprehensive => "Create an in-depth analytical report (5-10 pages equivalent). Provide thorough analysis with detailed findings.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Pdf,
    Docx,
    Pptx,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Pptx => "pptx",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Self::Pptx => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

fn default_title() -> String {
    "Research Report".to_string()
}

fn default_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Pdf]
}

fn default_slide_min() -> u32 {
    10
}

fn default_slide_max() -> u32 {
    15
}

/// Report options as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub detail_level: DetailLevel,
    #[serde(default = "default_formats")]
    pub output_formats: Vec<OutputFormat>,
    #[serde(default = "default_slide_min")]
    pub slide_count_min: u32,
    #[serde(default = "default_slide_max")]
    pub slide_count_max: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            custom_instructions: None,
            detail_level: DetailLevel::default(),
            output_formats: default_formats(),
            slide_count_min: default_slide_min(),
            slide_count_max: default_slide_max(),
        }
    }
}

impl ReportConfig {
    /// Parse and validate a stored configuration.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, String> {
        let value = if value.is_null() {
            serde_json::json!({})
        } else {
            value.clone()
        };
        let mut config: Self =
            serde_json::from_value(value).map_err(|e| format!("Invalid report config: {}", e))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.title.trim().is_empty() {
            self.title = default_title();
        } else {
            self.title = self.title.trim().to_string();
        }
        self.custom_instructions = self
            .custom_instructions
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let mut seen = HashSet::new();
        self.output_formats.retain(|f| seen.insert(*f));
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.output_formats.is_empty() {
            return Err("Invalid report config: output_formats must not be empty".to_string());
        }
        if self.wants(OutputFormat::Pptx) {
            if self.slide_count_min == 0 {
                return Err("Invalid report config: slide_count_min must be at least 1".to_string());
            }
            if self.slide_count_min > self.slide_count_max {
                return Err(format!(
                    "Invalid report config: slide_count_min ({}) exceeds slide_count_max ({})",
                    self.slide_count_min, self.slide_count_max
                ));
            }
        }
        Ok(())
    }

    pub fn wants(&self, format: OutputFormat) -> bool {
        self.output_formats.contains(&format)
    }

    pub fn format_names(&self) -> Vec<String> {
        self.output_formats.iter().map(|f| f.extension().to_string()).collect()
    }
}

/// Metadata of one registered source file. No content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRegistryEntry {
    pub file_id: Uuid,
    pub file_name: String,
    /// Lowercase extension with dot, e.g. `.pdf`
    pub file_type: String,
    pub file_size: u64,
    pub storage_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: WorkflowStep,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Single source of truth for one run.
///
/// # Invariants
/// - `failed` implies `!errors.is_empty()`
/// - `progress <= 100`
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub report_id: Uuid,
    pub user_id: Uuid,
    /// Raw configuration as submitted
    pub raw_config: serde_json::Value,
    pub config: ReportConfig,
    pub file_registry: Vec<FileRegistryEntry>,
    pub input_file_types: HashSet<String>,
    pub loaded_skills: Vec<LoadedSkill>,
    pub skill_plan_notes: String,
    pub research_questions: Vec<String>,
    pub file_analyses: Vec<FileAnalysis>,
    pub research_notes: String,
    pub generated_report: Option<GeneratedReport>,
    pub generated_presentation: Option<GeneratedPresentation>,
    pub output_files: Vec<OutputFile>,
    pub current_step: WorkflowStep,
    pub progress: u8,
    pub status_message: String,
    pub errors: Vec<String>,
    pub failed: bool,
    pub token_budget: TokenBudget,
    pub token_metrics: TokenMetrics,
    pub step_timings: Vec<StepTiming>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Fresh state at `Pending`.
    ///
    /// An invalid configuration yields a state that is already failed, so the
    /// run still terminates through the error path.
    pub fn new(report_id: Uuid, user_id: Uuid, raw_config: serde_json::Value) -> Self {
        let parsed = ReportConfig::from_value(&raw_config);
        let mut state = Self {
            report_id,
            user_id,
            raw_config,
            config: parsed.clone().unwrap_or_default(),
            file_registry: Vec::new(),
            input_file_types: HashSet::new(),
            loaded_skills: Vec::new(),
            skill_plan_notes: String::new(),
            research_questions: Vec::new(),
            file_analyses: Vec::new(),
            research_notes: String::new(),
            generated_report: None,
            generated_presentation: None,
            output_files: Vec::new(),
            current_step: WorkflowStep::Pending,
            progress: 0,
            status_message: "Initializing...".to_string(),
            errors: Vec::new(),
            failed: false,
            token_budget: TokenBudget::default(),
            token_metrics: TokenMetrics::default(),
            step_timings: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        if let Err(e) = parsed {
            state = state.mark_failed(e);
        }
        state
    }

    pub fn with_progress(mut self, step: WorkflowStep, progress: u8, message: impl Into<String>) -> Self {
        self.current_step = step;
        self.progress = progress.min(100);
        self.status_message = message.into();
        self
    }

    pub fn mark_failed(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self.failed = true;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn mark_step_complete(mut self, step: WorkflowStep, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        self.step_timings.push(StepTiming {
            step,
            started_at,
            completed_at,
            duration: (completed_at - started_at).to_std().unwrap_or_default(),
        });
        self
    }

    /// Bill one model call to both the budget and the run metrics.
    pub fn record_usage(&mut self, usage: &TokenUsage) {
        if usage.total_tokens == 0 {
            return;
        }
        self.token_budget.record(usage);
        self.token_metrics.record(usage);
    }

    pub fn last_error(&self) -> &str {
        self.errors.last().map(String::as_str).unwrap_or("Unknown error")
    }

    pub fn elapsed_secs(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub(crate) fn label(&self) -> String {
        format!("Report {} | {}", self.report_id, self.current_step.log_label())
    }
}
