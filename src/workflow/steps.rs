//! Step functions.
//!
//! Each step takes the state by value and returns the next state. Errors never
//! escape a step: they are recorded with [`WorkflowState::mark_failed`] and the
//! runner routes the run to [`handle_error`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::budget::{BudgetError, COUNTING_MODEL};
use crate::content::{GeneratedPresentation, GeneratedReport};
use crate::llm::{ChatMessage, GatewayError, TaskType};
use crate::research::{CodeSandbox, ProgressSink, ResearchAgent, SourceLibrary};
use crate::services::{
    CompletionRecord, GenerationLogEntry, OutputFile, ReportRecordStore, ReportStatus, ServiceError,
    SourceFileRecord, StatusUpdate,
};
use crate::skills::LoadedSkill;
use crate::util::truncate_chars;

use super::prompts;
use super::state::{FileRegistryEntry, OutputFormat, ReportConfig, WorkflowState, WorkflowStep};
use super::WorkflowDeps;

const SKILL_PLANNING_MAX_TOKENS: u32 = 1000;
const REPORT_MAX_TOKENS: u32 = 8000;
const PRESENTATION_MAX_TOKENS: u32 = 4000;
const SKILL_NOTES_MAX_CHARS: usize = 500;

/// Write the current progress as `processing`. Best-effort.
pub(crate) async fn persist_progress(deps: &WorkflowDeps, state: &WorkflowState) {
    let update = StatusUpdate {
        status: ReportStatus::Processing,
        progress: state.progress,
        status_message: Some(state.status_message.clone()),
        error_message: None,
    };
    if let Err(e) = deps.records.update_status(state.report_id, &update).await {
        tracing::warn!("{} | Failed to persist progress: {}", state.label(), e);
    }
}

/// Refuse a gateway call the run's remaining budget cannot cover.
fn authorize_call(
    deps: &WorkflowDeps,
    state: &WorkflowState,
    messages: &[ChatMessage],
    system: &str,
    max_tokens: u32,
) -> Result<(), BudgetError> {
    let estimate =
        deps.gateway
            .token_counter()
            .estimate_request(messages, Some(system), max_tokens, COUNTING_MODEL);
    state.token_budget.authorize(estimate)
}

fn bill_failure(state: &mut WorkflowState, error: &GatewayError) {
    if let Some(usage) = error.billed_usage() {
        let usage = usage.clone();
        state.record_usage(&usage);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Register files
// ─────────────────────────────────────────────────────────────────────────────

fn is_empty_config(value: &serde_json::Value) -> bool {
    value.is_null() || value.as_object().is_some_and(|o| o.is_empty())
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
}

fn registry_entry(record: &SourceFileRecord) -> Option<FileRegistryEntry> {
    let file_name = record.file_name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
    let storage_path = record.storage_path.as_deref().filter(|p| !p.trim().is_empty())?;
    let file_type = record
        .extension
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e.trim_start_matches('.').to_lowercase()))
        .or_else(|| extension_of(file_name))?;

    Some(FileRegistryEntry {
        file_id: record.file_id,
        file_name: file_name.to_string(),
        file_type,
        file_size: record.size_bytes.unwrap_or(0),
        storage_path: storage_path.to_string(),
    })
}

pub(crate) async fn register_files(deps: &WorkflowDeps, state: WorkflowState) -> WorkflowState {
    let started_at = Utc::now();
    let mut state = state.with_progress(WorkflowStep::RegisteringFiles, 5, "Registering source files...");
    tracing::info!("{} | Loading source files", state.label());
    persist_progress(deps, &state).await;

    let inputs = match deps.records.load_inputs(state.report_id).await {
        Ok(inputs) => inputs,
        Err(e) => return state.mark_failed(format!("Failed to load report inputs: {}", e)),
    };

    // The stored configuration stands in when the caller passed none.
    if is_empty_config(&state.raw_config) && !is_empty_config(&inputs.config) {
        match ReportConfig::from_value(&inputs.config) {
            Ok(config) => {
                state.config = config;
                state.raw_config = inputs.config.clone();
            }
            Err(e) => return state.mark_failed(e),
        }
    }

    if inputs.source_files.is_empty() {
        return state.mark_failed("No source files found for report");
    }
    let max_files = deps.settings.max_files_per_report;
    if inputs.source_files.len() > max_files {
        return state.mark_failed(format!(
            "Too many source files: {} (maximum {})",
            inputs.source_files.len(),
            max_files
        ));
    }

    let mut registry = Vec::with_capacity(inputs.source_files.len());
    for record in &inputs.source_files {
        match registry_entry(record) {
            Some(entry) => {
                tracing::debug!(
                    "{} | Registered {} ({}, {} bytes)",
                    state.label(),
                    entry.file_name,
                    entry.file_type,
                    entry.file_size
                );
                registry.push(entry);
            }
            None => tracing::warn!(
                "{} | Skipping file {} with incomplete metadata",
                state.label(),
                record.file_id
            ),
        }
    }
    if registry.is_empty() {
        return state.mark_failed("No valid source files found");
    }

    state.input_file_types = registry.iter().map(|f| f.file_type.clone()).collect();
    state.file_registry = registry;

    tracing::info!(
        "{} | COMPLETED | {} files, types: {:?}",
        state.label(),
        state.file_registry.len(),
        state.input_file_types
    );
    let count = state.file_registry.len();
    state
        .with_progress(
            WorkflowStep::RegisteringFiles,
            10,
            format!("Registered {} source files", count),
        )
        .mark_step_complete(WorkflowStep::RegisteringFiles, started_at)
}

// ─────────────────────────────────────────────────────────────────────────────
// Plan skills
// ─────────────────────────────────────────────────────────────────────────────

async fn load_skills(deps: &WorkflowDeps, label: &str, names: Vec<&str>) -> Vec<LoadedSkill> {
    let mut loaded = Vec::with_capacity(names.len());
    for name in names {
        match deps.skills.load_skill(name).await {
            Ok(skill) => loaded.push(skill),
            Err(e) => tracing::warn!("{} | Failed to load skill {}: {}", label, name, e),
        }
    }
    loaded
}

/// Names of known skills mentioned in a planner reply.
fn mentioned_skills<'a>(reply: &str, known: &[&'a str]) -> Vec<&'a str> {
    let reply = reply.to_lowercase();
    known
        .iter()
        .copied()
        .filter(|name| reply.contains(&name.to_lowercase()))
        .collect()
}

pub(crate) async fn plan_skills(deps: &WorkflowDeps, state: WorkflowState) -> WorkflowState {
    let started_at = Utc::now();
    let mut state = state.with_progress(WorkflowStep::PlanningSkills, 12, "Planning analysis skills...");
    persist_progress(deps, &state).await;

    if deps.skills.is_empty() {
        tracing::info!("{} | No skills available, skipping", state.label());
        state.skill_plan_notes = "No skills available".to_string();
        return state
            .with_progress(WorkflowStep::PlanningSkills, 15, "No skills needed")
            .mark_step_complete(WorkflowStep::PlanningSkills, started_at);
    }

    let formats = state.config.format_names();
    let relevant: Vec<&str> = deps
        .skills
        .get_relevant_skills(&state.input_file_types, &formats)
        .into_iter()
        .map(|s| s.name.as_str())
        .collect();

    let label = state.label();
    if !relevant.is_empty() {
        let loaded = load_skills(deps, &label, relevant).await;
        let names: Vec<&str> = loaded.iter().map(|s| s.name.as_str()).collect();
        let mut types: Vec<&String> = state.input_file_types.iter().collect();
        types.sort();
        state.skill_plan_notes = format!(
            "Skills loaded based on input types {:?} and output formats {:?}: {}",
            types,
            formats,
            names.join(", ")
        );
        tracing::info!("{} | COMPLETED (deterministic) | Loaded {} skills: {}", label, names.len(), names.join(", "));
        let message = format!("Loaded {} skills", loaded.len());
        state.loaded_skills = loaded;
        return state
            .with_progress(WorkflowStep::PlanningSkills, 15, message)
            .mark_step_complete(WorkflowStep::PlanningSkills, started_at);
    }

    tracing::info!("{} | No clear trigger match, asking the model", label);
    let system = prompts::skill_planning_system(&deps.skills.catalog_prompt(&state.input_file_types, &formats));
    let messages = vec![ChatMessage::user(prompts::skill_planning_user(&state))];
    if let Err(e) = authorize_call(deps, &state, &messages, &system, SKILL_PLANNING_MAX_TOKENS) {
        tracing::warn!("{} | SKIPPED (non-fatal) | {}", label, e);
        state.skill_plan_notes = format!("Skill planning failed: {}", e);
        return state
            .with_progress(WorkflowStep::PlanningSkills, 15, "Continuing without skills")
            .mark_step_complete(WorkflowStep::PlanningSkills, started_at);
    }

    match deps
        .gateway
        .generate_text(
            TaskType::SkillPlanning,
            messages,
            Some(&system),
            Some(SKILL_PLANNING_MAX_TOKENS),
            None,
        )
        .await
    {
        Ok(generation) => {
            state.record_usage(&generation.usage);
            let known: Vec<&str> = deps.skills.list_skills().into_iter().map(|s| s.name.as_str()).collect();
            let chosen = mentioned_skills(&generation.content, &known);
            state.loaded_skills = load_skills(deps, &label, chosen).await;
            state.skill_plan_notes = truncate_chars(&generation.content, SKILL_NOTES_MAX_CHARS).to_string();
            tracing::info!("{} | COMPLETED (model) | Loaded {} skills", label, state.loaded_skills.len());
            let message = format!("Loaded {} skills", state.loaded_skills.len());
            state
                .with_progress(WorkflowStep::PlanningSkills, 15, message)
                .mark_step_complete(WorkflowStep::PlanningSkills, started_at)
        }
        Err(e) => {
            tracing::warn!("{} | FAILED (non-fatal) | {}", label, e);
            bill_failure(&mut state, &e);
            state.loaded_skills.clear();
            state.skill_plan_notes = format!("Skill planning failed: {}", e);
            state
                .with_progress(WorkflowStep::PlanningSkills, 15, "Continuing without skills")
                .mark_step_complete(WorkflowStep::PlanningSkills, started_at)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Research
// ─────────────────────────────────────────────────────────────────────────────

/// Forwards research progress to the record store.
struct RecordProgress {
    records: Arc<dyn ReportRecordStore>,
    report_id: Uuid,
}

#[async_trait]
impl ProgressSink for RecordProgress {
    async fn report(&self, progress: u8, message: &str) {
        let update = StatusUpdate {
            status: ReportStatus::Processing,
            progress,
            status_message: Some(message.to_string()),
            error_message: None,
        };
        if let Err(e) = self.records.update_status(self.report_id, &update).await {
            tracing::warn!("Report {} | RESEARCH | Failed to persist progress: {}", self.report_id, e);
        }
    }
}

pub(crate) async fn research(deps: &WorkflowDeps, state: WorkflowState) -> WorkflowState {
    let started_at = Utc::now();
    let mut state = state.with_progress(WorkflowStep::Researching, 15, "Starting research...");
    persist_progress(deps, &state).await;

    let library = Arc::new(SourceLibrary::new(
        state.file_registry.clone(),
        deps.settings.upload_bucket.clone(),
        Arc::clone(&deps.objects),
        Arc::clone(&deps.parser),
    ));
    let sandbox = Arc::new(CodeSandbox::new(deps.settings.sandbox.clone()));
    let mut agent = ResearchAgent::new(state.report_id, Arc::clone(&deps.gateway), library, sandbox)
        .with_skills(state.loaded_skills.clone())
        .with_budget(state.token_budget.clone());
    let sink = RecordProgress {
        records: Arc::clone(&deps.records),
        report_id: state.report_id,
    };

    let result = agent.run(&state.config, &sink).await;
    state.token_budget = agent.budget().clone();
    state.token_metrics.merge(agent.metrics());

    match result {
        Ok(outcome) => {
            let analyzed = outcome.analyses.iter().filter(|a| a.is_analyzed()).count();
            let total = outcome.analyses.len();
            state.research_questions = outcome.plan.questions;
            state.file_analyses = outcome.analyses;
            state.research_notes = outcome.notes;
            tracing::info!(
                "{} | COMPLETED | {}/{} files analyzed, {} chars of notes",
                state.label(),
                analyzed,
                total,
                state.research_notes.len()
            );
            state
                .with_progress(
                    WorkflowStep::Researching,
                    50,
                    format!("Research complete: {} of {} files analyzed", analyzed, total),
                )
                .mark_step_complete(WorkflowStep::Researching, started_at)
        }
        Err(e) => {
            tracing::error!("{} | FAILED | {}", state.label(), e);
            state.mark_failed(format!("Research failed: {}", e))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) async fn generate_report(deps: &WorkflowDeps, state: WorkflowState) -> WorkflowState {
    let started_at = Utc::now();
    let mut state = state.with_progress(WorkflowStep::GeneratingReport, 55, "Generating report content...");
    persist_progress(deps, &state).await;

    if state.research_notes.trim().is_empty() {
        return state.mark_failed("No research notes or context available");
    }
    tracing::info!(
        "{} | Using research notes ({} chars), detail_level={}",
        state.label(),
        state.research_notes.len(),
        state.config.detail_level.as_str()
    );

    let system = prompts::report_system(&state.config);
    let messages = vec![ChatMessage::user(prompts::report_user(&state.config, &state.research_notes))];
    if let Err(e) = authorize_call(deps, &state, &messages, &system, REPORT_MAX_TOKENS) {
        tracing::error!("{} | FAILED | {}", state.label(), e);
        return state.mark_failed(format!("Report generation failed: {}", e));
    }

    match deps
        .gateway
        .generate_structured::<GeneratedReport>(
            TaskType::ReportGeneration,
            messages,
            Some(&system),
            Some(REPORT_MAX_TOKENS),
            None,
        )
        .await
    {
        Ok(generation) => {
            state.record_usage(&generation.usage);
            let report = generation.value;
            tracing::info!(
                "{} | COMPLETED | title={}, sections={}, findings={}, model={}{}",
                state.label(),
                report.title,
                report.sections.len(),
                report.key_findings.len(),
                generation.model_used,
                if generation.fallback_used { " (fallback)" } else { "" }
            );
            state.generated_report = Some(report);
            state
                .with_progress(WorkflowStep::GeneratingReport, 60, "Report content generated")
                .mark_step_complete(WorkflowStep::GeneratingReport, started_at)
        }
        Err(e) => {
            tracing::error!("{} | FAILED | {}", state.label(), e);
            bill_failure(&mut state, &e);
            state.mark_failed(format!("Report generation failed: {}", e))
        }
    }
}

pub(crate) async fn generate_presentation(deps: &WorkflowDeps, state: WorkflowState) -> WorkflowState {
    let started_at = Utc::now();
    let mut state = state.with_progress(
        WorkflowStep::GeneratingPresentation,
        65,
        "Generating presentation slides...",
    );
    persist_progress(deps, &state).await;

    let Some(report) = state.generated_report.as_ref() else {
        return state.mark_failed("No report available for presentation generation");
    };
    tracing::info!(
        "{} | Requesting {}-{} slides",
        state.label(),
        state.config.slide_count_min,
        state.config.slide_count_max
    );

    let system = prompts::presentation_system(&state.config);
    let messages = vec![ChatMessage::user(prompts::presentation_user(report))];
    if let Err(e) = authorize_call(deps, &state, &messages, &system, PRESENTATION_MAX_TOKENS) {
        tracing::error!("{} | FAILED | {}", state.label(), e);
        return state.mark_failed(format!("Presentation generation failed: {}", e));
    }

    match deps
        .gateway
        .generate_structured::<GeneratedPresentation>(
            TaskType::PresentationGeneration,
            messages,
            Some(&system),
            Some(PRESENTATION_MAX_TOKENS),
            None,
        )
        .await
    {
        Ok(generation) => {
            state.record_usage(&generation.usage);
            let slides = generation.value.slides.len();
            tracing::info!("{} | COMPLETED | {} slides", state.label(), slides);
            state.generated_presentation = Some(generation.value);
            state
                .with_progress(
                    WorkflowStep::GeneratingPresentation,
                    80,
                    format!("Generated {} slides", slides),
                )
                .mark_step_complete(WorkflowStep::GeneratingPresentation, started_at)
        }
        Err(e) => {
            tracing::error!("{} | FAILED | {}", state.label(), e);
            bill_failure(&mut state, &e);
            state.mark_failed(format!("Presentation generation failed: {}", e))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Render
// ─────────────────────────────────────────────────────────────────────────────

async fn render_one(
    deps: &WorkflowDeps,
    state: &WorkflowState,
    report: &GeneratedReport,
    format: OutputFormat,
) -> Result<Option<OutputFile>, ServiceError> {
    let data = match format {
        OutputFormat::Pdf => deps.renderer.render_pdf(report).await?,
        OutputFormat::Docx => deps.renderer.render_docx(report).await?,
        OutputFormat::Pptx => match state.generated_presentation.as_ref() {
            Some(presentation) => deps.renderer.render_pptx(presentation).await?,
            None => return Ok(None),
        },
    };

    let storage_path = format!("{}/{}/output.{}", state.user_id, state.report_id, format.extension());
    let size_bytes = data.len() as u64;
    let sha256 = hex::encode(Sha256::digest(&data));
    let bucket = &deps.settings.output_bucket;

    deps.objects
        .upload(bucket, &storage_path, data, format.content_type())
        .await?;
    let download_url = deps
        .objects
        .signed_url(bucket, &storage_path, deps.settings.url_ttl)
        .await?;
    let ttl = chrono::Duration::from_std(deps.settings.url_ttl).unwrap_or_else(|_| chrono::Duration::days(7));

    Ok(Some(OutputFile {
        format: format.extension().to_string(),
        storage_path,
        download_url,
        expires_at: Utc::now() + ttl,
        size_bytes,
        sha256,
    }))
}

pub(crate) async fn render_outputs(deps: &WorkflowDeps, state: WorkflowState) -> WorkflowState {
    let started_at = Utc::now();
    let mut state = state.with_progress(WorkflowStep::Rendering, 82, "Rendering output files...");
    persist_progress(deps, &state).await;

    let Some(report) = state.generated_report.clone() else {
        return state.mark_failed("No report available for rendering");
    };

    let mut outputs = Vec::new();
    for format in state.config.output_formats.clone() {
        match render_one(deps, &state, &report, format).await {
            Ok(Some(file)) => {
                tracing::info!(
                    "{} | Rendered {} ({} bytes) -> {}",
                    state.label(),
                    file.format,
                    file.size_bytes,
                    file.storage_path
                );
                outputs.push(file);
            }
            Ok(None) => tracing::warn!("{} | No presentation available, skipping {}", state.label(), format),
            Err(e) => tracing::error!("{} | Failed to render {}: {}", state.label(), format, e),
        }
    }

    if outputs.is_empty() {
        return state.mark_failed("Failed to render any output files");
    }

    let message = format!("Rendered {} output files", outputs.len());
    state.output_files = outputs;
    state
        .with_progress(WorkflowStep::Rendering, 95, message)
        .mark_step_complete(WorkflowStep::Rendering, started_at)
}

// ─────────────────────────────────────────────────────────────────────────────
// Terminal steps
// ─────────────────────────────────────────────────────────────────────────────

fn log_entry(state: &WorkflowState, status: ReportStatus, error_message: Option<String>) -> GenerationLogEntry {
    GenerationLogEntry {
        report_id: state.report_id,
        user_id: state.user_id,
        status,
        error_message,
        input_tokens: state.token_metrics.total_input_tokens,
        output_tokens: state.token_metrics.total_output_tokens,
        estimated_cost: state.token_metrics.estimated_cost,
        duration_secs: state.elapsed_secs(),
        created_at: Utc::now(),
    }
}

/// Persist the completed report. Persistence failures are logged only.
pub(crate) async fn finalize(deps: &WorkflowDeps, state: WorkflowState) -> WorkflowState {
    let started_at = Utc::now();
    let mut state = state.with_progress(WorkflowStep::Finalizing, 98, "Saving report...");
    persist_progress(deps, &state).await;

    let completed_at = Utc::now();
    let generated_content = serde_json::json!({
        "report": state.generated_report,
        "presentation": state.generated_presentation,
    });
    let title = state
        .generated_report
        .as_ref()
        .map(|r| r.title.clone())
        .unwrap_or_else(|| state.config.title.clone());
    let record = CompletionRecord {
        title,
        generated_content,
        output_files: state.output_files.clone(),
        total_input_tokens: state.token_metrics.total_input_tokens,
        total_output_tokens: state.token_metrics.total_output_tokens,
        estimated_cost: state.token_metrics.estimated_cost,
        generation_time_secs: state.elapsed_secs(),
        completed_at,
    };

    if let Err(e) = deps.records.complete_report(state.report_id, &record).await {
        tracing::error!("{} | Failed to save completed report: {}", state.label(), e);
    }
    if let Err(e) = deps
        .records
        .log_generation(&log_entry(&state, ReportStatus::Completed, None))
        .await
    {
        tracing::error!("{} | Failed to write generation log: {}", state.label(), e);
    }

    tracing::info!(
        "{} | COMPLETED | {} outputs, {} tokens, ${:.4}, {:.1}s",
        state.label(),
        state.output_files.len(),
        state.token_metrics.total_tokens(),
        state.token_metrics.estimated_cost,
        record.generation_time_secs
    );
    state.completed_at = Some(completed_at);
    state
        .with_progress(WorkflowStep::Finalizing, 100, "Report generated successfully")
        .mark_step_complete(WorkflowStep::Finalizing, started_at)
}

/// Persist the failure. Best-effort.
pub(crate) async fn handle_error(deps: &WorkflowDeps, state: WorkflowState) -> WorkflowState {
    let error = state.last_error().to_string();
    tracing::error!("{} | Run failed: {}", state.label(), error);

    let update = StatusUpdate {
        status: ReportStatus::Failed,
        progress: 0,
        status_message: Some("Report generation failed".to_string()),
        error_message: Some(error.clone()),
    };
    if let Err(e) = deps.records.update_status(state.report_id, &update).await {
        tracing::error!("{} | Failed to persist failure: {}", state.label(), e);
    }
    if let Err(e) = deps
        .records
        .log_generation(&log_entry(&state, ReportStatus::Failed, Some(error)))
        .await
    {
        tracing::error!("{} | Failed to write generation log: {}", state.label(), e);
    }

    let mut state = state.with_progress(WorkflowStep::Failed, 0, "Report generation failed");
    state.failed = true;
    if state.completed_at.is_none() {
        state.completed_at = Some(Utc::now());
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: Option<&str>, ext: Option<&str>, path: Option<&str>) -> SourceFileRecord {
        SourceFileRecord {
            file_id: Uuid::new_v4(),
            file_name: name.map(str::to_string),
            extension: ext.map(str::to_string),
            size_bytes: Some(10),
            storage_path: path.map(str::to_string),
        }
    }

    #[test]
    fn test_registry_entry_normalizes_extension() {
        let entry = registry_entry(&record(Some("Sales.CSV"), None, Some("u/sales.csv"))).unwrap();
        assert_eq!(entry.file_type, ".csv");

        let entry = registry_entry(&record(Some("deck"), Some("PDF"), Some("u/deck"))).unwrap();
        assert_eq!(entry.file_type, ".pdf");

        assert!(registry_entry(&record(None, Some("pdf"), Some("u/x"))).is_none());
        assert!(registry_entry(&record(Some("a.pdf"), None, None)).is_none());
        assert!(registry_entry(&record(Some("noext"), None, Some("u/noext"))).is_none());
    }

    #[test]
    fn test_mentioned_skills() {
        let known = ["excel_data_analysis", "deck_design", "pdf_tables"];
        let reply = "Load EXCEL_DATA_ANALYSIS and maybe deck_design.";
        assert_eq!(mentioned_skills(reply, &known), vec!["excel_data_analysis", "deck_design"]);
        assert!(mentioned_skills("none apply", &known).is_empty());
    }
}
