//! Token budgeting for a workflow run.
//!
//! # Key Concepts
//! - TokenBudget: per-call and cumulative ceilings, adaptive per-file allowance
//! - TokenMetrics: token and cost totals reported at finalize

#[allow(clippy::module_inception)]
mod budget;
mod metrics;

pub use budget::{
    BudgetError, TokenBudget, COUNTING_MODEL, DEFAULT_MAX_CUMULATIVE, DEFAULT_MAX_PER_CALL, MAX_FILE_LIMIT,
    MIN_FILE_LIMIT, SYNTHESIS_RESERVE,
};
pub use metrics::TokenMetrics;
