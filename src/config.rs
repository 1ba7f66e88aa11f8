//! Configuration management for the report worker.
//!
//! Configuration is read from environment variables:
//! - `ANTHROPIC_API_KEY` / `OPENAI_API_KEY` - At least one is required.
//! - `ANTHROPIC_BASE_URL` / `OPENAI_BASE_URL` - Optional API endpoints.
//! - `LLM_MAX_RETRIES` - Attempts per model. Defaults to `3`.
//! - `LLM_INITIAL_DELAY_MS` / `LLM_MAX_DELAY_MS` / `LLM_BACKOFF_FACTOR` - Backoff schedule.
//! - `LLM_TIMEOUT_SECS` - Per-request timeout. Defaults to `120`.
//! - `LLM_ENABLE_FALLBACKS` - Try later models in a chain. Defaults to `true`.
//! - `LLM_RATE_LIMIT_COOLDOWN_SECS` - Pause after a rate limit. Defaults to `5`.
//! - `LLM_ROUTING_TABLE` - Optional JSON routing override, `{"research": ["gpt-4o"]}`.
//! - `MAX_CONCURRENT_GENERATIONS` - Runs in flight per process. Defaults to `2`.
//! - `WORKFLOW_TIMEOUT_SECS` - Optional deadline per run.
//! - `DATA_DIR` - Database and object storage root. Defaults to `./data`.
//! - `UPLOAD_BUCKET` / `OUTPUT_BUCKET` - Defaults `uploads` / `generated-reports`.
//! - `SKILLS_DIR` - Analysis skills. Defaults to `./skills`.
//! - `SANDBOX_INTERPRETER` / `SANDBOX_TIMEOUT_SECS` - Defaults `python3` / `30`.
//! - `POLL_INTERVAL_SECS` - Worker poll period. Defaults to `5`.
//! - `MAX_FILES_PER_REPORT` - Defaults to `20`.
//! - `RENDER_PDF_CMD` / `RENDER_DOCX_CMD` / `RENDER_PPTX_CMD` / `EXTRACT_TEXT_CMD` - External commands.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::llm::{GatewayConfig, RetryPolicy, RoutingTable};
use crate::services::RenderCommands;
use crate::util::parse_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub openai_base_url: Option<String>,

    pub retry: RetryPolicy,
    pub llm_timeout: Duration,
    pub enable_fallbacks: bool,
    pub rate_limit_cooldown: Duration,
    /// Per-task override of the default routing
    pub routing: Option<RoutingTable>,

    pub max_concurrent_generations: usize,
    pub workflow_timeout: Option<Duration>,
    pub max_files_per_report: usize,
    pub poll_interval: Duration,

    pub data_dir: PathBuf,
    pub upload_bucket: String,
    pub output_bucket: String,
    pub skills_dir: PathBuf,

    pub sandbox_interpreter: String,
    pub sandbox_timeout: Duration,

    pub render_commands: RenderCommands,
    pub extract_text_cmd: Option<String>,
}

fn parse_var<T>(name: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if neither API key is set and
    /// `ConfigError::InvalidValue` for unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let anthropic_api_key = get("ANTHROPIC_API_KEY");
        let openai_api_key = get("OPENAI_API_KEY");
        if anthropic_api_key.is_none() && openai_api_key.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "ANTHROPIC_API_KEY or OPENAI_API_KEY".to_string(),
            ));
        }

        let defaults = RetryPolicy::default();
        let max_attempts: u32 = parse_var("LLM_MAX_RETRIES", get("LLM_MAX_RETRIES"), defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "LLM_MAX_RETRIES".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let initial_ms: u64 = parse_var("LLM_INITIAL_DELAY_MS", get("LLM_INITIAL_DELAY_MS"), 1_000)?;
        let max_ms: u64 = parse_var("LLM_MAX_DELAY_MS", get("LLM_MAX_DELAY_MS"), 60_000)?;
        let backoff_factor: f64 = parse_var("LLM_BACKOFF_FACTOR", get("LLM_BACKOFF_FACTOR"), defaults.backoff_factor)?;
        if !(backoff_factor >= 1.0) {
            return Err(ConfigError::InvalidValue(
                "LLM_BACKOFF_FACTOR".to_string(),
                "must be >= 1.0".to_string(),
            ));
        }
        let retry = RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms.max(initial_ms)),
            backoff_factor,
            jitter: true,
        };

        let routing = match get("LLM_ROUTING_TABLE") {
            Some(raw) => Some(
                RoutingTable::from_json(&raw)
                    .map_err(|e| ConfigError::InvalidValue("LLM_ROUTING_TABLE".to_string(), e))?,
            ),
            None => None,
        };

        let workflow_timeout = match get("WORKFLOW_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = parse_var("WORKFLOW_TIMEOUT_SECS", Some(raw), 0)?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };

        let max_concurrent_generations: usize =
            parse_var("MAX_CONCURRENT_GENERATIONS", get("MAX_CONCURRENT_GENERATIONS"), 2)?;
        if max_concurrent_generations == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONCURRENT_GENERATIONS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            anthropic_api_key,
            openai_api_key,
            anthropic_base_url: get("ANTHROPIC_BASE_URL"),
            openai_base_url: get("OPENAI_BASE_URL"),
            retry,
            llm_timeout: Duration::from_secs(parse_var("LLM_TIMEOUT_SECS", get("LLM_TIMEOUT_SECS"), 120)?),
            enable_fallbacks: get("LLM_ENABLE_FALLBACKS").map_or(true, |v| parse_bool(&v)),
            rate_limit_cooldown: Duration::from_secs(parse_var(
                "LLM_RATE_LIMIT_COOLDOWN_SECS",
                get("LLM_RATE_LIMIT_COOLDOWN_SECS"),
                5,
            )?),
            routing,
            max_concurrent_generations,
            workflow_timeout,
            max_files_per_report: parse_var("MAX_FILES_PER_REPORT", get("MAX_FILES_PER_REPORT"), 20)?,
            poll_interval: Duration::from_secs(
                parse_var("POLL_INTERVAL_SECS", get("POLL_INTERVAL_SECS"), 5u64)?.max(1),
            ),
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./data")),
            upload_bucket: get("UPLOAD_BUCKET").unwrap_or_else(|| "uploads".to_string()),
            output_bucket: get("OUTPUT_BUCKET").unwrap_or_else(|| "generated-reports".to_string()),
            skills_dir: get("SKILLS_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./skills")),
            sandbox_interpreter: get("SANDBOX_INTERPRETER").unwrap_or_else(|| "python3".to_string()),
            sandbox_timeout: Duration::from_secs(parse_var(
                "SANDBOX_TIMEOUT_SECS",
                get("SANDBOX_TIMEOUT_SECS"),
                30,
            )?),
            render_commands: RenderCommands {
                pdf: get("RENDER_PDF_CMD"),
                docx: get("RENDER_DOCX_CMD"),
                pptx: get("RENDER_PPTX_CMD"),
            },
            extract_text_cmd: get("EXTRACT_TEXT_CMD"),
        })
    }

    /// Create a config with default values (useful for testing).
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            anthropic_api_key: None,
            openai_api_key: None,
            anthropic_base_url: None,
            openai_base_url: None,
            retry: RetryPolicy::default(),
            llm_timeout: Duration::from_secs(120),
            enable_fallbacks: true,
            rate_limit_cooldown: Duration::from_secs(5),
            routing: None,
            max_concurrent_generations: 2,
            workflow_timeout: None,
            max_files_per_report: 20,
            poll_interval: Duration::from_secs(5),
            skills_dir: data_dir.join("skills"),
            data_dir,
            upload_bucket: "uploads".to_string(),
            output_bucket: "generated-reports".to_string(),
            sandbox_interpreter: "python3".to_string(),
            sandbox_timeout: Duration::from_secs(30),
            render_commands: RenderCommands::default(),
            extract_text_cmd: None,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            retry: self.retry.clone(),
            enable_fallbacks: self.enable_fallbacks,
            rate_limit_cooldown: self.rate_limit_cooldown,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("reports.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TaskType;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn requires_an_api_key() {
        let err = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.rate_limit_cooldown, Duration::from_secs(5));
        assert!(config.enable_fallbacks);
        assert_eq!(config.max_concurrent_generations, 2);
        assert_eq!(config.workflow_timeout, None);
        assert_eq!(config.output_bucket, "generated-reports");
        assert_eq!(config.sandbox_interpreter, "python3");
        assert!(config.render_commands.pdf.is_none());
    }

    #[test]
    fn overrides_parse() {
        let config = Config::from_lookup(lookup(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("LLM_MAX_RETRIES", "5"),
            ("LLM_ENABLE_FALLBACKS", "no"),
            ("WORKFLOW_TIMEOUT_SECS", "900"),
            ("LLM_ROUTING_TABLE", r#"{"research": ["gpt-4o"]}"#),
            ("RENDER_PDF_CMD", "render-pdf"),
        ]))
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.enable_fallbacks);
        assert_eq!(config.workflow_timeout, Some(Duration::from_secs(900)));
        let routes = config.routing.unwrap();
        assert_eq!(routes.get(TaskType::Research), Some(&["gpt-4o".to_string()][..]));
        assert_eq!(config.render_commands.pdf.as_deref(), Some("render-pdf"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "k"),
            ("LLM_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "LLM_TIMEOUT_SECS"));

        let err = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "k"),
            ("LLM_ROUTING_TABLE", r#"{"research": ["nope"]}"#),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "LLM_ROUTING_TABLE"));
    }
}
