//! Model catalog, task types and task → model routing.
//!
//! The catalog is static; the routing table is a compiled-in default that a
//! deployment may override per task. Chains are filtered down to models whose
//! provider has credentials configured.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ─────────────────────────────────────────────────────────────────────────────
// Providers and tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

/// Purpose of an LLM call. Drives model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Summarization,
    ReportGeneration,
    PresentationGeneration,
    SectionEdit,
    Classification,
    SkillPlanning,
    Research,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::Summarization,
        TaskType::ReportGeneration,
        TaskType::PresentationGeneration,
        TaskType::SectionEdit,
        TaskType::Classification,
        TaskType::SkillPlanning,
        TaskType::Research,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarization => "summarization",
            Self::ReportGeneration => "report_generation",
            Self::PresentationGeneration => "presentation_generation",
            Self::SectionEdit => "section_edit",
            Self::Classification => "classification",
            Self::SkillPlanning => "skill_planning",
            Self::Research => "research",
        }
    }

    /// Parse the wire name used in routing overrides.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s.trim())
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a routable model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    /// Short catalog key (e.g. "claude-sonnet-4").
    pub key: &'static str,
    pub provider: Provider,
    /// Provider-side model identifier sent on the wire.
    pub model_id: &'static str,
    pub max_output_tokens: u32,
    pub supports_structured_output: bool,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub context_window: u32,
}

impl ModelDescriptor {
    /// Estimated USD cost for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.cost_per_1k_input
            + (output_tokens as f64 / 1000.0) * self.cost_per_1k_output
    }
}

const MODELS: &[ModelDescriptor] = &[
    ModelDescriptor {
        key: "claude-sonnet-4",
        provider: Provider::Anthropic,
        model_id: "claude-sonnet-4-20250514",
        max_output_tokens: 8192,
        supports_structured_output: true,
        cost_per_1k_input: 0.003,
        cost_per_1k_output: 0.015,
        context_window: 200_000,
    },
    ModelDescriptor {
        key: "claude-3-5-haiku",
        provider: Provider::Anthropic,
        model_id: "claude-3-5-haiku-20241022",
        max_output_tokens: 8192,
        supports_structured_output: true,
        cost_per_1k_input: 0.0008,
        cost_per_1k_output: 0.004,
        context_window: 200_000,
    },
    ModelDescriptor {
        key: "gpt-4o",
        provider: Provider::OpenAi,
        model_id: "gpt-4o",
        max_output_tokens: 16384,
        supports_structured_output: true,
        cost_per_1k_input: 0.0025,
        cost_per_1k_output: 0.01,
        context_window: 128_000,
    },
    ModelDescriptor {
        key: "gpt-4o-mini",
        provider: Provider::OpenAi,
        model_id: "gpt-4o-mini",
        max_output_tokens: 16384,
        supports_structured_output: true,
        cost_per_1k_input: 0.00015,
        cost_per_1k_output: 0.0006,
        context_window: 128_000,
    },
];

/// All catalog entries.
pub fn models() -> &'static [ModelDescriptor] {
    MODELS
}

/// Look up a model by catalog key or provider model id.
pub fn lookup(model: &str) -> Option<&'static ModelDescriptor> {
    MODELS
        .iter()
        .find(|m| m.key == model)
        .or_else(|| MODELS.iter().find(|m| m.model_id == model))
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing
// ─────────────────────────────────────────────────────────────────────────────

/// Task → ordered model keys (primary first).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    routes: HashMap<TaskType, Vec<String>>,
}

impl RoutingTable {
    /// The compiled-in default routing.
    pub fn default_routes() -> Self {
        let fast = || vec!["claude-3-5-haiku".to_string(), "gpt-4o-mini".to_string()];
        let quality = || vec!["claude-sonnet-4".to_string(), "gpt-4o".to_string()];

        let mut routes = HashMap::new();
        routes.insert(TaskType::Summarization, fast());
        routes.insert(TaskType::Classification, fast());
        routes.insert(TaskType::SkillPlanning, fast());
        routes.insert(TaskType::ReportGeneration, quality());
        routes.insert(TaskType::PresentationGeneration, quality());
        routes.insert(TaskType::Research, quality());
        routes.insert(
            TaskType::SectionEdit,
            vec!["claude-sonnet-4".to_string(), "gpt-4o-mini".to_string()],
        );
        Self { routes }
    }

    /// Parse a JSON override of the form `{"research": ["gpt-4o", ...]}`.
    ///
    /// Unknown task names and unknown model keys are rejected.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let parsed: HashMap<String, Vec<String>> =
            serde_json::from_str(raw).map_err(|e| format!("invalid routing JSON: {}", e))?;

        let mut routes = HashMap::new();
        for (task, keys) in parsed {
            let task = TaskType::parse(&task).ok_or_else(|| format!("unknown task '{}'", task))?;
            if let Some(bad) = keys.iter().find(|k| lookup(k).is_none()) {
                return Err(format!("unknown model '{}' for task '{}'", bad, task));
            }
            routes.insert(task, keys);
        }
        Ok(Self { routes })
    }

    pub fn set(&mut self, task: TaskType, keys: Vec<String>) {
        self.routes.insert(task, keys);
    }

    pub fn get(&self, task: TaskType) -> Option<&[String]> {
        self.routes.get(&task).map(|v| v.as_slice())
    }
}

/// Resolves fallback chains for a task.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    overrides: Option<RoutingTable>,
    defaults: RoutingTable,
    available: HashSet<Provider>,
}

impl ModelRouter {
    pub fn new(overrides: Option<RoutingTable>, available: HashSet<Provider>) -> Self {
        Self {
            overrides,
            defaults: RoutingTable::default_routes(),
            available,
        }
    }

    /// Ordered, provider-filtered chain for `task`. May be empty.
    ///
    /// A per-deployment override for the task wins; tasks it does not mention
    /// fall back to the compiled-in default.
    pub fn fallback_chain(&self, task: TaskType) -> Vec<&'static ModelDescriptor> {
        let keys = self
            .overrides
            .as_ref()
            .and_then(|o| o.get(task))
            .or_else(|| self.defaults.get(task))
            .unwrap_or(&[]);

        keys.iter()
            .filter_map(|k| lookup(k))
            .filter(|m| self.available.contains(&m.provider))
            .collect()
    }

    pub fn has_fallback(&self, task: TaskType) -> bool {
        self.fallback_chain(task).len() > 1
    }

    pub fn available_providers(&self) -> &HashSet<Provider> {
        &self.available
    }
}
