//! Schema-validated structured output.
//!
//! Models are asked for JSON matching a schema embedded in the system prompt.
//! Replies are unwrapped from code fences, deserialized, normalized and
//! validated before anything downstream sees them.

use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::Value;
use thiserror::Error;

use super::error::LlmError;

/// A structured value failed its invariants.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A type the gateway can request as structured output.
pub trait StructuredOutput: DeserializeOwned + Send {
    /// JSON schema shown to the model.
    fn schema() -> Value;

    /// Clean up cosmetic defects (whitespace, blank list items) before validation.
    fn normalize(&mut self) {}

    fn validate(&self) -> Result<(), ValidationError>;
}

/// Strip markdown code fences and surrounding prose from a JSON reply.
///
/// A reply that already parses is returned as is, so fences inside JSON
/// strings are left alone. A leading fence closes at the last fence.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if serde_json::from_str::<IgnoredAny>(trimmed).is_ok() {
        return trimmed;
    }

    if let Some(after) = trimmed.strip_prefix("```") {
        // skip a language tag such as `json`
        let body_start = after.find('\n').map_or(0, |i| i + 1);
        let body = &after[body_start..];
        return match body.rfind("```") {
            Some(end) => body[..end].trim(),
            None => body.trim(),
        };
    }

    match (trimmed.find(['{', '[']), trimmed.rfind(['}', ']'])) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// System prompt suffix describing the required JSON shape.
pub fn schema_instruction(schema: &Value) -> String {
    let rendered = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "\n\nRespond ONLY with a single JSON object that conforms to this JSON schema. \
         Do not include any prose before or after the JSON.\n\nSCHEMA:\n{}",
        rendered
    )
}

/// Parse, normalize and validate a model reply.
///
/// Every failure maps to [`LlmError::validation`] so the gateway treats it as
/// a candidate failure.
pub fn parse_structured<T: StructuredOutput>(text: &str) -> Result<T, LlmError> {
    let json = extract_json(text);
    let mut value: T = serde_json::from_str(json)
        .map_err(|e| LlmError::validation(format!("Reply is not valid JSON for schema: {}", e)))?;
    value.normalize();
    value
        .validate()
        .map_err(|e| LlmError::validation(format!("Structured output failed validation: {}", e)))?;
    Ok(value)
}
