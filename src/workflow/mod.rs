//! Report generation workflow.
//!
//! A run threads one [`WorkflowState`] through the steps named in
//! [`graph::EDGES`]. The runner asks the table for the next step, runs it, and
//! writes a progress projection to the record store after every step. A failed
//! state routes to the error handler, which persists the failure and ends the run.
//!
//! ```text
//! register files -> plan skills -> research -> generate report
//!     -> [generate presentation, only when pptx is requested]
//!     -> render outputs -> finalize -> completed
//! ```

pub mod graph;
mod prompts;
mod state;
mod steps;

pub use graph::{next_step, validate, Edge, Guard, TransitionError, EDGES};
pub use state::{
    DetailLevel, FileRegistryEntry, OutputFormat, ReportConfig, StepTiming, WorkflowState,
    WorkflowStep,
};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;
use crate::llm::ModelGateway;
use crate::research::SandboxConfig;
use crate::services::{DocumentTextProvider, ObjectStore, Renderer, ReportRecordStore};
use crate::skills::SkillRegistry;

/// Download links for rendered outputs stay valid this long.
pub const OUTPUT_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Tunables of a run.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub upload_bucket: String,
    pub output_bucket: String,
    pub max_files_per_report: usize,
    pub sandbox: SandboxConfig,
    pub url_ttl: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            upload_bucket: "uploads".to_string(),
            output_bucket: "generated-reports".to_string(),
            max_files_per_report: 20,
            sandbox: SandboxConfig::default(),
            url_ttl: OUTPUT_URL_TTL,
        }
    }
}

impl WorkflowSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            upload_bucket: config.upload_bucket.clone(),
            output_bucket: config.output_bucket.clone(),
            max_files_per_report: config.max_files_per_report,
            sandbox: SandboxConfig {
                interpreter: config.sandbox_interpreter.clone(),
                timeout: config.sandbox_timeout,
                ..SandboxConfig::default()
            },
            url_ttl: OUTPUT_URL_TTL,
        }
    }
}

/// Everything a run talks to. Built once at startup and shared by all runs.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub gateway: Arc<ModelGateway>,
    pub records: Arc<dyn ReportRecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub parser: Arc<dyn DocumentTextProvider>,
    pub renderer: Arc<dyn Renderer>,
    pub skills: Arc<SkillRegistry>,
    pub settings: WorkflowSettings,
}

async fn execute(deps: &WorkflowDeps, step: WorkflowStep, state: WorkflowState) -> WorkflowState {
    match step {
        WorkflowStep::RegisteringFiles => steps::register_files(deps, state).await,
        WorkflowStep::PlanningSkills => steps::plan_skills(deps, state).await,
        WorkflowStep::Researching => steps::research(deps, state).await,
        WorkflowStep::GeneratingReport => steps::generate_report(deps, state).await,
        WorkflowStep::GeneratingPresentation => steps::generate_presentation(deps, state).await,
        WorkflowStep::Rendering => steps::render_outputs(deps, state).await,
        WorkflowStep::Finalizing => steps::finalize(deps, state).await,
        WorkflowStep::Failed => steps::handle_error(deps, state).await,
        WorkflowStep::Pending | WorkflowStep::Completed => state,
    }
}

/// Run one report to a terminal state.
///
/// Never returns an error: failures end in a state with `failed` set, and the
/// caller observes them through the record store.
pub async fn run_workflow(
    deps: &WorkflowDeps,
    report_id: Uuid,
    user_id: Uuid,
    config: serde_json::Value,
) -> WorkflowState {
    drive(deps, WorkflowState::new(report_id, user_id, config), None).await
}

/// Last state seen at a step boundary.
type Checkpoint = Mutex<WorkflowState>;

fn save(checkpoint: Option<&Checkpoint>, state: &WorkflowState) {
    if let Some(checkpoint) = checkpoint {
        *checkpoint.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
    }
}

async fn drive(deps: &WorkflowDeps, mut state: WorkflowState, checkpoint: Option<&Checkpoint>) -> WorkflowState {
    let (report_id, user_id) = (state.report_id, state.user_id);
    let mut step = WorkflowStep::Pending;
    tracing::info!("Report {} | START | user {}", report_id, user_id);

    loop {
        let next = match next_step(step, &state).and_then(|next| validate(step, next).map(|_| next)) {
            Ok(next) => next,
            Err(e) => {
                state = state.mark_failed(format!("Internal workflow error: {}", e));
                WorkflowStep::Failed
            }
        };

        if next == WorkflowStep::Completed {
            state.current_step = WorkflowStep::Completed;
            tracing::info!(
                "Report {} | DONE | {} outputs in {:.1}s",
                report_id,
                state.output_files.len(),
                state.elapsed_secs()
            );
            return state;
        }

        state = execute(deps, next, state).await;
        if next == WorkflowStep::Failed {
            return state;
        }
        save(checkpoint, &state);
        // Failures are written by the error handler and completion by finalize.
        if !state.failed && next != WorkflowStep::Finalizing {
            steps::persist_progress(deps, &state).await;
        }
        // Step boundaries are scheduling points for other runs on this worker.
        tokio::task::yield_now().await;
        step = next;
    }
}

/// [`run_workflow`] under a wall-clock deadline.
///
/// On expiry the in-flight step is abandoned and the run is recorded as failed
/// from the last completed step, so usage billed up to there is kept.
pub async fn run_workflow_with_deadline(
    deps: &WorkflowDeps,
    report_id: Uuid,
    user_id: Uuid,
    config: serde_json::Value,
    deadline: Duration,
) -> WorkflowState {
    let state = WorkflowState::new(report_id, user_id, config);
    let checkpoint: Checkpoint = Mutex::new(state.clone());
    let outcome = tokio::time::timeout(deadline, drive(deps, state, Some(&checkpoint))).await;
    match outcome {
        Ok(state) => state,
        Err(_) => {
            tracing::error!("Report {} | TIMEOUT | after {:?}", report_id, deadline);
            let state = checkpoint
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .mark_failed(format!("Workflow timed out after {}s", deadline.as_secs()));
            steps::handle_error(deps, state).await
        }
    }
}
