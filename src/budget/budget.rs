//! Token budget for a single workflow run.
//!
//! # Invariants
//! - `cumulative_input` and `cumulative_output` never decrease
//! - `remaining() == max_cumulative - used()` (saturating, so never above `max_cumulative`)

use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

pub const DEFAULT_MAX_PER_CALL: u64 = 80_000;
pub const DEFAULT_MAX_CUMULATIVE: u64 = 400_000;
/// Model whose tokenizer estimates are used for budget checks.
pub const COUNTING_MODEL: &str = "claude-sonnet-4";
/// Held back from per-file allowances for synthesis and system prompts.
pub const SYNTHESIS_RESERVE: u64 = 20_000;
/// Floor for the per-file pool once the reserve is taken out.
pub const MIN_AVAILABLE: u64 = 10_000;
pub const MIN_FILE_LIMIT: u64 = 1_500;
pub const MAX_FILE_LIMIT: u64 = 6_000;

/// Per-call and cumulative token ceilings for one run.
///
/// # Invariants
/// - usage is only ever added, never subtracted
/// - `remaining() <= max_cumulative`
///
/// # Design for Provability
/// Fields are private; all mutation goes through [`TokenBudget::record_usage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    max_per_call: u64,
    max_cumulative: u64,
    cumulative_input: u64,
    cumulative_output: u64,
}

impl TokenBudget {
    /// # Postconditions
    /// - `used() == 0`
    /// - `remaining() == max_cumulative`
    pub fn new(max_per_call: u64, max_cumulative: u64) -> Self {
        Self {
            max_per_call,
            max_cumulative,
            cumulative_input: 0,
            cumulative_output: 0,
        }
    }

    pub fn max_per_call(&self) -> u64 {
        self.max_per_call
    }

    pub fn max_cumulative(&self) -> u64 {
        self.max_cumulative
    }

    pub fn cumulative_input(&self) -> u64 {
        self.cumulative_input
    }

    pub fn cumulative_output(&self) -> u64 {
        self.cumulative_output
    }

    /// Total tokens recorded so far.
    pub fn used(&self) -> u64 {
        self.cumulative_input.saturating_add(self.cumulative_output)
    }

    /// # Property
    /// `remaining() == max_cumulative - used()`, saturating at 0
    pub fn remaining(&self) -> u64 {
        self.max_cumulative.saturating_sub(self.used())
    }

    pub fn can_afford(&self, tokens: u64) -> bool {
        tokens <= self.remaining()
    }

    /// Record billed tokens. Strictly additive.
    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.cumulative_input = self.cumulative_input.saturating_add(input_tokens);
        self.cumulative_output = self.cumulative_output.saturating_add(output_tokens);
    }

    pub fn record(&mut self, usage: &TokenUsage) {
        self.record_usage(usage.input_tokens, usage.output_tokens);
    }

    /// Reject a single call estimated above the per-call ceiling.
    ///
    /// # Errors
    /// [`BudgetError::PerCallExceeded`] if `estimated > max_per_call`.
    pub fn check_call(&self, estimated: u64) -> Result<(), BudgetError> {
        if estimated > self.max_per_call {
            return Err(BudgetError::PerCallExceeded {
                estimated,
                limit: self.max_per_call,
            });
        }
        Ok(())
    }

    /// Require at least `needed` tokens to be left in the run.
    pub fn ensure_available(&self, needed: u64) -> Result<(), BudgetError> {
        if !self.can_afford(needed) {
            return Err(BudgetError::Insufficient {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Gate one model call against both ceilings.
    ///
    /// `estimated` is the worst case for the call: prompt plus the full output allowance.
    ///
    /// # Errors
    /// [`BudgetError::PerCallExceeded`] or [`BudgetError::Insufficient`].
    pub fn authorize(&self, estimated: u64) -> Result<(), BudgetError> {
        self.check_call(estimated)?;
        self.ensure_available(estimated)
    }

    /// Per-file token allowance for `n_files` files still to analyze.
    ///
    /// # Property
    /// Non-increasing in `n_files`; always within `[MIN_FILE_LIMIT, MAX_FILE_LIMIT]`.
    pub fn adaptive_file_limit(&self, n_files: usize) -> u64 {
        let available = self
            .remaining()
            .saturating_sub(SYNTHESIS_RESERVE)
            .max(MIN_AVAILABLE);
        let per_file = available / n_files.max(1) as u64;
        per_file.clamp(MIN_FILE_LIMIT, MAX_FILE_LIMIT)
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_CALL, DEFAULT_MAX_CUMULATIVE)
    }
}

/// Errors related to budget operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BudgetError {
    #[error("Call estimated at {estimated} tokens exceeds per-call limit of {limit}")]
    PerCallExceeded { estimated: u64, limit: u64 },

    #[error("Insufficient token budget: need {needed}, have {remaining}")]
    Insufficient { needed: u64, remaining: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_usage_is_additive() {
        let mut budget = TokenBudget::new(1_000, 10_000);
        assert_eq!(budget.remaining(), 10_000);

        budget.record_usage(300, 200);
        assert_eq!(budget.used(), 500);
        assert_eq!(budget.remaining(), 9_500);

        budget.record_usage(0, 0);
        assert_eq!(budget.used(), 500);

        budget.record(&TokenUsage::new(1_000, 500, "gpt-4o", 0.0));
        assert_eq!(budget.cumulative_input(), 1_300);
        assert_eq!(budget.cumulative_output(), 700);
    }

    #[test]
    fn test_remaining_saturates() {
        let mut budget = TokenBudget::new(1_000, 1_000);
        budget.record_usage(900, 900);
        assert_eq!(budget.remaining(), 0);
        assert!(!budget.can_afford(1));
        assert!(budget.can_afford(0));
        assert!(budget.remaining() <= budget.max_cumulative());
    }

    #[test]
    fn test_check_call() {
        let budget = TokenBudget::default();
        assert!(budget.check_call(80_000).is_ok());
        assert!(matches!(
            budget.check_call(80_001),
            Err(BudgetError::PerCallExceeded { limit: 80_000, .. })
        ));
    }

    #[test]
    fn test_ensure_available() {
        let mut budget = TokenBudget::new(1_000, 50_000);
        assert!(budget.ensure_available(30_000).is_ok());
        budget.record_usage(25_000, 0);
        assert!(matches!(
            budget.ensure_available(30_000),
            Err(BudgetError::Insufficient { needed: 30_000, remaining: 25_000 })
        ));
    }

    #[test]
    fn test_authorize_checks_both_ceilings() {
        let mut budget = TokenBudget::new(10_000, 50_000);
        assert!(budget.authorize(9_000).is_ok());
        assert!(matches!(
            budget.authorize(12_000),
            Err(BudgetError::PerCallExceeded { limit: 10_000, .. })
        ));

        budget.record_usage(45_000, 0);
        assert!(budget.authorize(5_000).is_ok());
        assert!(matches!(
            budget.authorize(9_000),
            Err(BudgetError::Insufficient { needed: 9_000, remaining: 5_000 })
        ));
    }

    #[test]
    fn test_adaptive_file_limit_bounds() {
        let budget = TokenBudget::default();
        // 380k available
        assert_eq!(budget.adaptive_file_limit(0), 6_000);
        assert_eq!(budget.adaptive_file_limit(1), 6_000);
        assert_eq!(budget.adaptive_file_limit(100), 3_800);
        assert_eq!(budget.adaptive_file_limit(1_000), 1_500);

        let mut spent = TokenBudget::default();
        spent.record_usage(400_000, 0);
        // floor of 10k available
        assert_eq!(spent.adaptive_file_limit(2), 5_000);
    }

    #[test]
    fn test_adaptive_file_limit_is_monotone() {
        for used in [0u64, 150_000, 370_000, 500_000] {
            let mut budget = TokenBudget::default();
            budget.record_usage(used, 0);
            let mut previous = u64::MAX;
            for n in 1..300 {
                let limit = budget.adaptive_file_limit(n);
                assert!((MIN_FILE_LIMIT..=MAX_FILE_LIMIT).contains(&limit));
                assert!(limit <= previous);
                previous = limit;
            }
        }
    }
}
