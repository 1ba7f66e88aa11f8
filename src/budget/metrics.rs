use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

/// Token and cost totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub estimated_cost: f64,
    pub calls: u32,
}

impl TokenMetrics {
    pub fn record(&mut self, usage: &TokenUsage) {
        self.total_input_tokens = self.total_input_tokens.saturating_add(usage.input_tokens);
        self.total_output_tokens = self.total_output_tokens.saturating_add(usage.output_tokens);
        self.estimated_cost += usage.estimated_cost;
        self.calls += 1;
    }

    /// Fold totals gathered elsewhere (e.g. by a sub-agent) into these.
    pub fn merge(&mut self, other: &TokenMetrics) {
        self.total_input_tokens = self.total_input_tokens.saturating_add(other.total_input_tokens);
        self.total_output_tokens = self.total_output_tokens.saturating_add(other.total_output_tokens);
        self.estimated_cost += other.estimated_cost;
        self.calls += other.calls;
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens.saturating_add(self.total_output_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates() {
        let mut metrics = TokenMetrics::default();
        metrics.record(&TokenUsage::new(100, 20, "gpt-4o", 0.5));
        metrics.record(&TokenUsage::new(10, 2, "gpt-4o-mini", 0.25));
        assert_eq!(metrics.total_tokens(), 132);
        assert_eq!(metrics.calls, 2);
        assert!((metrics.estimated_cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_merge() {
        let mut run = TokenMetrics::default();
        run.record(&TokenUsage::new(5, 5, "gpt-4o", 0.1));
        let mut sub = TokenMetrics::default();
        sub.record(&TokenUsage::new(100, 20, "gpt-4o", 0.5));
        sub.record(&TokenUsage::new(1, 1, "gpt-4o", 0.0));
        run.merge(&sub);
        assert_eq!(run.total_input_tokens, 106);
        assert_eq!(run.total_output_tokens, 26);
        assert_eq!(run.calls, 3);
    }
}
