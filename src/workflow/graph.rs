//! Transition table of the report workflow.
//!
//! Edges are data: each row names a source step, a target step and the guard
//! that must hold. The runner asks [`next_step`] where to go and never
//! compares step names itself.

use thiserror::Error;

use super::state::{OutputFormat, WorkflowState, WorkflowStep};

/// Predicate an edge requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    WantsPresentation,
    SkipsPresentation,
}

impl Guard {
    fn holds(&self, state: &WorkflowState) -> bool {
        match self {
            Self::Always => true,
            Self::WantsPresentation => state.config.wants(OutputFormat::Pptx),
            Self::SkipsPresentation => !state.config.wants(OutputFormat::Pptx),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub from: WorkflowStep,
    pub to: WorkflowStep,
    pub guard: Guard,
}

const fn edge(from: WorkflowStep, to: WorkflowStep, guard: Guard) -> Edge {
    Edge { from, to, guard }
}

/// Success edges. Every non-terminal step additionally has an implicit edge
/// to [`WorkflowStep::Failed`].
pub const EDGES: &[Edge] = &[
    edge(WorkflowStep::Pending, WorkflowStep::RegisteringFiles, Guard::Always),
    edge(WorkflowStep::RegisteringFiles, WorkflowStep::PlanningSkills, Guard::Always),
    edge(WorkflowStep::PlanningSkills, WorkflowStep::Researching, Guard::Always),
    edge(WorkflowStep::Researching, WorkflowStep::GeneratingReport, Guard::Always),
    edge(
        WorkflowStep::GeneratingReport,
        WorkflowStep::GeneratingPresentation,
        Guard::WantsPresentation,
    ),
    edge(WorkflowStep::GeneratingReport, WorkflowStep::Rendering, Guard::SkipsPresentation),
    edge(WorkflowStep::GeneratingPresentation, WorkflowStep::Rendering, Guard::Always),
    edge(WorkflowStep::Rendering, WorkflowStep::Finalizing, Guard::Always),
    edge(WorkflowStep::Finalizing, WorkflowStep::Completed, Guard::Always),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Step {0} is terminal")]
    Terminal(WorkflowStep),

    #[error("No transition from {0} matches the current state")]
    NoMatch(WorkflowStep),

    #[error("Invalid transition {from} -> {to}")]
    Invalid { from: WorkflowStep, to: WorkflowStep },
}

/// Where a run at `from` goes next.
///
/// A failed state always routes to [`WorkflowStep::Failed`].
pub fn next_step(from: WorkflowStep, state: &WorkflowState) -> Result<WorkflowStep, TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError::Terminal(from));
    }
    if state.failed {
        return Ok(WorkflowStep::Failed);
    }
    EDGES
        .iter()
        .find(|e| e.from == from && e.guard.holds(state))
        .map(|e| e.to)
        .ok_or(TransitionError::NoMatch(from))
}

/// Check a transition against the table, ignoring guards.
pub fn validate(from: WorkflowStep, to: WorkflowStep) -> Result<(), TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError::Terminal(from));
    }
    if to == WorkflowStep::Failed || EDGES.iter().any(|e| e.from == from && e.to == to) {
        Ok(())
    } else {
        Err(TransitionError::Invalid { from, to })
    }
}
