//! Research questions derived from the report title and instructions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::budget::{TokenBudget, COUNTING_MODEL};
use crate::llm::{ChatMessage, ModelGateway, StructuredOutput, TaskType, TokenUsage, ValidationError};

const MIN_QUESTIONS: usize = 3;
const MAX_QUESTIONS: usize = 10;
const PLAN_MAX_TOKENS: u32 = 2000;

const PLANNING_PROMPT: &str = "You are a research planning assistant. Given a report title and user \
instructions, generate a focused set of research questions that will guide analysis of the uploaded documents.

Your task:
1. Understand the user's research intent from the title and instructions
2. Generate 5-8 specific, targeted research questions that:
   - Cover different aspects of the topic
   - Range from broad overview questions to specific detail questions
   - Can be answered from the source documents

Keep questions concise. Each question should target a different dimension of the topic.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub title: String,
    pub summary: String,
    pub questions: Vec<String>,
}

impl ResearchPlan {
    /// Generic plan used when the model cannot produce one.
    pub fn fallback(title: &str, custom_instructions: Option<&str>) -> Self {
        let mut questions = vec![
            format!("What are the main findings related to {}?", title),
            format!("What data and evidence support the conclusions about {}?", title),
            format!("What are the key trends and patterns in {}?", title),
            format!("What recommendations can be made based on {}?", title),
            format!("What are the challenges and limitations related to {}?", title),
        ];
        if let Some(instructions) = custom_instructions.map(str::trim).filter(|s| !s.is_empty()) {
            questions.push(instructions.to_string());
        }
        Self {
            title: title.to_string(),
            summary: format!("General analysis of {}", title),
            questions,
        }
    }
}

impl StructuredOutput for ResearchPlan {
    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["title", "summary", "questions"],
            "properties": {
                "title": {"type": "string", "description": "Research title"},
                "summary": {"type": "string", "description": "Brief summary of the research approach"},
                "questions": {
                    "type": "array",
                    "minItems": MIN_QUESTIONS,
                    "maxItems": MAX_QUESTIONS,
                    "items": {"type": "string"}
                }
            }
        })
    }

    fn normalize(&mut self) {
        self.title = self.title.trim().to_string();
        self.questions = self
            .questions
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.title.is_empty() {
            return Err(ValidationError::new("Research plan title cannot be empty"));
        }
        if !(MIN_QUESTIONS..=MAX_QUESTIONS).contains(&self.questions.len()) {
            return Err(ValidationError::new(format!(
                "Research plan must have {}-{} questions, got {}",
                MIN_QUESTIONS,
                MAX_QUESTIONS,
                self.questions.len()
            )));
        }
        Ok(())
    }
}

/// A plan plus what it cost.
#[derive(Debug, Clone)]
pub struct PlannedResearch {
    pub plan: ResearchPlan,
    /// Billed usage, including rejected replies when the fallback was used
    pub usage: TokenUsage,
    pub used_fallback: bool,
}

pub struct ResearchPlanner {
    gateway: Arc<ModelGateway>,
}

impl ResearchPlanner {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway }
    }

    /// Never fails: any gateway error yields [`ResearchPlan::fallback`], and so
    /// does a call `budget` cannot cover, without reaching the gateway.
    pub async fn plan(
        &self,
        budget: &TokenBudget,
        title: &str,
        custom_instructions: Option<&str>,
        file_descriptions: &[String],
    ) -> PlannedResearch {
        let mut system = PLANNING_PROMPT.to_string();
        if !file_descriptions.is_empty() {
            system.push_str("\n\nAvailable source documents:\n");
            for desc in file_descriptions {
                system.push_str(&format!("- {}\n", desc));
            }
        }

        let mut user = format!("Title: {}\n", title);
        if let Some(instructions) = custom_instructions {
            user.push_str(&format!("\nUser instructions: {}\n", instructions));
        }
        user.push_str("\nGenerate the research plan with targeted questions.");

        let messages = vec![ChatMessage::user(user)];
        let estimate =
            self.gateway
                .token_counter()
                .estimate_request(&messages, Some(system.as_str()), PLAN_MAX_TOKENS, COUNTING_MODEL);
        if let Err(e) = budget.authorize(estimate) {
            tracing::warn!("Research plan skipped, using template plan: {}", e);
            return PlannedResearch {
                plan: ResearchPlan::fallback(title, custom_instructions),
                usage: TokenUsage::default(),
                used_fallback: true,
            };
        }

        match self
            .gateway
            .generate_structured::<ResearchPlan>(
                TaskType::Summarization,
                messages,
                Some(&system),
                Some(PLAN_MAX_TOKENS),
                None,
            )
            .await
        {
            Ok(generation) => {
                tracing::info!(
                    "Research plan generated: {} questions ({} in / {} out tokens)",
                    generation.value.questions.len(),
                    generation.usage.input_tokens,
                    generation.usage.output_tokens
                );
                PlannedResearch {
                    plan: generation.value,
                    usage: generation.usage,
                    used_fallback: false,
                }
            }
            Err(e) => {
                tracing::error!("Research plan generation failed, using template plan: {}", e);
                PlannedResearch {
                    plan: ResearchPlan::fallback(title, custom_instructions),
                    usage: e.billed_usage().cloned().unwrap_or_default(),
                    used_fallback: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{fast_config, text, ScriptedClient};
    use crate::llm::{LlmClient, Provider};

    fn gateway(client: Arc<ScriptedClient>) -> Arc<ModelGateway> {
        Arc::new(ModelGateway::new(
            vec![client as Arc<dyn LlmClient>],
            None,
            fast_config(),
        ))
    }

    #[test]
    fn test_fallback_questions() {
        let plan = ResearchPlan::fallback("Q3 Sales", Some("Focus on EMEA"));
        assert_eq!(plan.questions.len(), 6);
        assert_eq!(plan.questions[0], "What are the main findings related to Q3 Sales?");
        assert_eq!(plan.questions[5], "Focus on EMEA");
        assert!(plan.validate().is_ok());

        assert_eq!(ResearchPlan::fallback("X", Some("  ")).questions.len(), 5);
    }

    #[tokio::test]
    async fn test_plan_from_model() {
        let reply = r#"```json
{"title": " Q3 Sales ", "summary": "s", "questions": ["a?", "", "b?", "c?"]}
```"#;
        let client = Arc::new(ScriptedClient::new(Provider::Anthropic, vec![text(reply)]));
        let planned = ResearchPlanner::new(gateway(client))
            .plan(&TokenBudget::default(), "Q3 Sales", None, &["sales.csv (csv)".to_string()])
            .await;

        assert!(!planned.used_fallback);
        assert_eq!(planned.plan.title, "Q3 Sales");
        assert_eq!(planned.plan.questions, vec!["a?", "b?", "c?"]);
        assert_eq!(planned.usage.total_tokens, 150);
    }

    #[tokio::test]
    async fn test_too_few_questions_falls_back_and_bills() {
        let reply = r#"{"title": "T", "summary": "s", "questions": ["only one?"]}"#;
        let client = Arc::new(ScriptedClient::repeating(Provider::Anthropic, text(reply)));
        let planned = ResearchPlanner::new(gateway(client.clone()))
            .plan(&TokenBudget::default(), "T", Some("extra"), &[])
            .await;

        assert!(planned.used_fallback);
        assert_eq!(planned.plan.questions.len(), 6);
        assert_eq!(client.call_count(), 1);
        assert_eq!(planned.usage.total_tokens, 150);
    }

    #[tokio::test]
    async fn test_unaffordable_plan_uses_template_without_calling() {
        let client = Arc::new(ScriptedClient::repeating(Provider::Anthropic, text("{}")));
        let mut budget = TokenBudget::default();
        budget.record_usage(budget.max_cumulative() - 500, 0);

        let planned = ResearchPlanner::new(gateway(client.clone()))
            .plan(&budget, "T", None, &[])
            .await;

        assert!(planned.used_fallback);
        assert_eq!(planned.plan.questions.len(), 5);
        assert_eq!(planned.usage.total_tokens, 0);
        assert_eq!(client.call_count(), 0);
    }
}
