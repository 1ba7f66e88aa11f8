//! Single entry point for every model call.
//!
//! For a task the gateway resolves the fallback chain, runs each candidate
//! under the retry policy and advances down the chain on failure:
//!
//! - transient errors are retried on the same model, then the chain advances
//! - a rate limit stops retrying that model, sleeps a cooldown, then advances
//! - structured replies that fail validation count as a candidate failure
//! - with fallbacks disabled the first candidate failure is returned as-is

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::catalog::{ModelDescriptor, ModelRouter, Provider, RoutingTable, TaskType};
use super::error::LlmError;
use super::retry::RetryPolicy;
use super::structured::{parse_structured, schema_instruction, StructuredOutput};
use super::token_counter::TokenCounter;
use super::{ChatMessage, ChatRequest, ChatResponse, LlmClient, TokenUsage, ToolCall};

const TEXT_TEMPERATURE: f64 = 0.7;
const STRUCTURED_TEMPERATURE: f64 = 0.3;

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub retry: RetryPolicy,
    pub enable_fallbacks: bool,
    /// Pause after a rate limit before the next candidate.
    pub rate_limit_cooldown: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            enable_fallbacks: true,
            rate_limit_cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No models available for task '{0}' (no configured provider serves it)")]
    NoModelsAvailable(TaskType),

    #[error("LLM call for task '{task}' failed on {model}: {source}")]
    CallFailed {
        task: TaskType,
        model: String,
        source: LlmError,
        /// Tokens billed by replies received before the failure
        billed: TokenUsage,
    },
}

impl GatewayError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::CallFailed { source, .. } if source.is_rate_limit())
    }

    pub fn llm_error(&self) -> Option<&LlmError> {
        match self {
            Self::CallFailed { source, .. } => Some(source),
            Self::NoModelsAvailable(_) => None,
        }
    }

    /// Usage that was billed even though the call failed (e.g. invalid structured replies).
    pub fn billed_usage(&self) -> Option<&TokenUsage> {
        match self {
            Self::CallFailed { billed, .. } if billed.total_tokens > 0 => Some(billed),
            _ => None,
        }
    }
}

/// Result of a text or tool-calling turn.
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Usage across every reply billed for this call, including rejected ones
    pub usage: TokenUsage,
    pub model_used: String,
    pub fallback_used: bool,
}

/// Result of a structured call. `value` has passed validation.
#[derive(Debug, Clone)]
pub struct StructuredGeneration<T> {
    pub value: T,
    pub usage: TokenUsage,
    pub model_used: String,
    pub fallback_used: bool,
}

struct Attempt<T> {
    value: T,
    response: ChatResponse,
    usage: TokenUsage,
    model: &'static ModelDescriptor,
    fallback_used: bool,
}

pub struct ModelGateway {
    router: ModelRouter,
    clients: HashMap<Provider, Arc<dyn LlmClient>>,
    config: GatewayConfig,
    counter: TokenCounter,
}

impl ModelGateway {
    /// Build a gateway over the given provider clients.
    ///
    /// Only providers with a client are routable.
    pub fn new(
        clients: Vec<Arc<dyn LlmClient>>,
        routes: Option<RoutingTable>,
        config: GatewayConfig,
    ) -> Self {
        let clients: HashMap<Provider, Arc<dyn LlmClient>> =
            clients.into_iter().map(|c| (c.provider(), c)).collect();
        let available: HashSet<Provider> = clients.keys().copied().collect();
        Self {
            router: ModelRouter::new(routes, available),
            clients,
            config,
            counter: TokenCounter::new(),
        }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn token_counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Free-text generation.
    pub async fn generate_text(
        &self,
        task: TaskType,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> Result<Generation, GatewayError> {
        let mut request =
            ChatRequest::new(messages).with_temperature(temperature.unwrap_or(TEXT_TEMPERATURE));
        request.system_prompt = system_prompt.map(str::to_string);
        request.max_tokens = max_tokens;

        self.complete(task, request).await
    }

    /// Structured generation validated against `T`'s schema.
    pub async fn generate_structured<T: StructuredOutput>(
        &self,
        task: TaskType,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> Result<StructuredGeneration<T>, GatewayError> {
        let system = format!(
            "{}{}",
            system_prompt.unwrap_or("You are a precise assistant that outputs JSON."),
            schema_instruction(&T::schema())
        );
        let mut request = ChatRequest::new(messages)
            .with_system(system)
            .with_temperature(temperature.unwrap_or(STRUCTURED_TEMPERATURE));
        request.max_tokens = max_tokens;

        let attempt = self
            .execute(task, &request, |response| {
                let text = response.content.as_deref().unwrap_or_default();
                parse_structured::<T>(text)
            })
            .await?;

        Ok(StructuredGeneration {
            value: attempt.value,
            usage: attempt.usage,
            model_used: attempt.model.key.to_string(),
            fallback_used: attempt.fallback_used,
        })
    }

    /// One raw chat turn (tools allowed) with routing, retry and fallback.
    pub async fn complete(
        &self,
        task: TaskType,
        request: ChatRequest,
    ) -> Result<Generation, GatewayError> {
        let attempt = self.execute(task, &request, |_| Ok(())).await?;
        Ok(Generation {
            content: attempt.response.content.unwrap_or_default(),
            tool_calls: attempt.response.tool_calls.unwrap_or_default(),
            usage: attempt.usage,
            model_used: attempt.model.key.to_string(),
            fallback_used: attempt.fallback_used,
        })
    }

    async fn execute<T, F>(
        &self,
        task: TaskType,
        request: &ChatRequest,
        accept: F,
    ) -> Result<Attempt<T>, GatewayError>
    where
        F: Fn(&ChatResponse) -> Result<T, LlmError>,
    {
        let chain = self.router.fallback_chain(task);
        if chain.is_empty() {
            tracing::error!("No models available for task {}", task);
            return Err(GatewayError::NoModelsAvailable(task));
        }

        let last = chain.len() - 1;
        let mut billed = TokenUsage::default();

        for (i, model) in chain.iter().copied().enumerate() {
            let error = match self.try_candidate(task, model, request).await {
                Ok(response) => {
                    let usage = self.usage_for(model, request, &response);
                    billed.add(&usage);
                    tracing::info!(
                        "LLM {} via {}: {} in / {} out tokens, ${:.4}",
                        task,
                        model.key,
                        usage.input_tokens,
                        usage.output_tokens,
                        usage.estimated_cost
                    );
                    match accept(&response) {
                        Ok(value) => {
                            if i > 0 {
                                tracing::info!("Task {} served by fallback model {}", task, model.key);
                            }
                            return Ok(Attempt {
                                value,
                                response,
                                usage: billed,
                                model,
                                fallback_used: i > 0,
                            });
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            tracing::warn!(
                "Model {} failed for task {} ({}/{}): {}",
                model.key,
                task,
                i + 1,
                chain.len(),
                error
            );

            if !self.config.enable_fallbacks || i == last {
                return Err(GatewayError::CallFailed {
                    task,
                    model: model.key.to_string(),
                    source: error,
                    billed,
                });
            }

            if error.is_rate_limit() {
                let cooldown = error
                    .retry_after
                    .unwrap_or(self.config.rate_limit_cooldown)
                    .min(self.config.retry.max_delay);
                tracing::warn!(
                    "Rate limited on {}, cooling down {:?} before {}",
                    model.key,
                    cooldown,
                    chain[i + 1].key
                );
                tokio::time::sleep(cooldown).await;
            }
        }

        // chain is non-empty and the last candidate always returns above
        Err(GatewayError::NoModelsAvailable(task))
    }

    async fn try_candidate(
        &self,
        task: TaskType,
        model: &'static ModelDescriptor,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let client: &dyn LlmClient = match self.clients.get(&model.provider) {
            Some(client) => client.as_ref(),
            None => {
                return Err(LlmError::client_error(
                    400,
                    format!("No client configured for provider {}", model.provider),
                ))
            }
        };

        let mut request = request.clone();
        request.max_tokens = Some(
            request
                .max_tokens
                .unwrap_or(model.max_output_tokens)
                .min(model.max_output_tokens),
        );
        let request = &request;
        let model_id = model.model_id;
        let label = format!("{} via {}", task, model.key);

        self.config
            .retry
            .run(&label, move |_| client.chat_completion(model_id, request))
            .await
    }

    /// Priced usage, estimated from text when the provider reports none.
    fn usage_for(
        &self,
        model: &ModelDescriptor,
        request: &ChatRequest,
        response: &ChatResponse,
    ) -> TokenUsage {
        let (input, output) = match response.usage {
            Some(u) => (u.input_tokens, u.output_tokens),
            None => {
                let system = request
                    .system_prompt
                    .as_deref()
                    .map_or(0, |s| self.counter.count_tokens(s, model.key));
                let input = self.counter.count_messages_tokens(&request.messages, model.key) + system;
                let text = response
                    .content
                    .as_deref()
                    .map_or(0, |c| self.counter.count_tokens(c, model.key));
                let args: u64 = response
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|c| self.counter.count_tokens(&c.function.arguments, model.key))
                    .sum();
                (input, text + args)
            }
        };
        TokenUsage::new(input, output, model.key, model.cost(input, output))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::structured::ValidationError;
    use crate::llm::{LlmErrorKind, Usage};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Client that replays a script of responses and records the models it was asked for.
    pub(crate) struct ScriptedClient {
        provider: Provider,
        script: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
        fallback: Option<Result<ChatResponse, LlmError>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(provider: Provider, script: Vec<Result<ChatResponse, LlmError>>) -> Self {
            Self {
                provider,
                script: Mutex::new(script.into()),
                fallback: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Response returned once the script is exhausted.
        pub(crate) fn repeating(provider: Provider, response: Result<ChatResponse, LlmError>) -> Self {
            Self {
                fallback: Some(response),
                ..Self::new(provider, Vec::new())
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn chat_completion(
            &self,
            model_id: &str,
            _request: &ChatRequest,
        ) -> Result<ChatResponse, LlmError> {
            self.calls.lock().unwrap().push(model_id.to_string());
            let next = self.script.lock().unwrap().pop_front();
            match next.or_else(|| self.fallback.clone()) {
                Some(result) => result,
                None => Err(LlmError::client_error(400, "script exhausted")),
            }
        }
    }

    type Handler = dyn Fn(&ChatRequest) -> Result<ChatResponse, LlmError> + Send + Sync;
    type Stall = dyn Fn(&ChatRequest) -> bool + Send + Sync;

    /// Client that answers each request through a closure and keeps every request.
    pub(crate) struct HandlerClient {
        provider: Provider,
        handler: Box<Handler>,
        stall: Option<Box<Stall>>,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl HandlerClient {
        pub(crate) fn new<F>(provider: Provider, handler: F) -> Self
        where
            F: Fn(&ChatRequest) -> Result<ChatResponse, LlmError> + Send + Sync + 'static,
        {
            Self {
                provider,
                handler: Box::new(handler),
                stall: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Requests matching `predicate` never get an answer.
        pub(crate) fn stalling<P>(mut self, predicate: P) -> Self
        where
            P: Fn(&ChatRequest) -> bool + Send + Sync + 'static,
        {
            self.stall = Some(Box::new(predicate));
            self
        }

        pub(crate) fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmClient for HandlerClient {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn chat_completion(
            &self,
            _model_id: &str,
            request: &ChatRequest,
        ) -> Result<ChatResponse, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.stall.as_ref().is_some_and(|stall| stall(request)) {
                std::future::pending::<()>().await;
            }
            (self.handler)(request)
        }
    }

    /// A reply that asks for one tool call.
    pub(crate) fn tool_call(id: &str, name: &str, arguments: Value) -> Result<ChatResponse, LlmError> {
        Ok(ChatResponse {
            tool_calls: Some(vec![ToolCall {
                id: id.to_string(),
                call_type: "function".to_string(),
                function: crate::llm::FunctionCall {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }]),
            usage: Some(Usage::new(100, 20)),
            ..Default::default()
        })
    }

    pub(crate) fn text(content: &str) -> Result<ChatResponse, LlmError> {
        Ok(ChatResponse {
            content: Some(content.to_string()),
            usage: Some(Usage::new(100, 50)),
            ..Default::default()
        })
    }

    pub(crate) fn fast_config() -> GatewayConfig {
        GatewayConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(20),
                backoff_factor: 2.0,
                jitter: false,
            },
            enable_fallbacks: true,
            rate_limit_cooldown: Duration::from_millis(10),
        }
    }

    fn gateway(clients: Vec<Arc<ScriptedClient>>, config: GatewayConfig) -> ModelGateway {
        let clients = clients
            .into_iter()
            .map(|c| c as Arc<dyn LlmClient>)
            .collect();
        ModelGateway::new(clients, None, config)
    }

    #[derive(Debug, Deserialize)]
    struct Outline {
        sections: Vec<String>,
    }

    impl StructuredOutput for Outline {
        fn schema() -> Value {
            json!({"type": "object", "properties": {"sections": {"type": "array"}}})
        }

        fn validate(&self) -> Result<(), ValidationError> {
            if self.sections.is_empty() {
                return Err(ValidationError::new("at least one section required"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transient_primary_falls_back() {
        let primary = Arc::new(ScriptedClient::repeating(
            Provider::Anthropic,
            Err(LlmError::server_error(503, "overloaded")),
        ));
        let secondary = Arc::new(ScriptedClient::new(Provider::OpenAi, vec![text("from gpt")]));
        let gw = gateway(vec![primary.clone(), secondary.clone()], fast_config());

        let result = gw
            .generate_text(TaskType::ReportGeneration, vec![ChatMessage::user("hi")], None, None, None)
            .await
            .unwrap();

        assert_eq!(result.content, "from gpt");
        assert!(result.fallback_used);
        assert_eq!(result.model_used, "gpt-4o");
        assert_eq!(primary.call_count(), 3);
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_primary_success_is_not_fallback() {
        let primary = Arc::new(ScriptedClient::new(Provider::Anthropic, vec![text("ok")]));
        let gw = gateway(vec![primary.clone()], fast_config());

        let result = gw
            .generate_text(TaskType::Summarization, vec![ChatMessage::user("hi")], None, None, None)
            .await
            .unwrap();
        assert!(!result.fallback_used);
        assert_eq!(result.model_used, "claude-3-5-haiku");
        assert_eq!(result.usage.total_tokens, 150);
        assert!(result.usage.estimated_cost > 0.0);
    }

    #[tokio::test]
    async fn test_empty_chain_fails_fast() {
        let gw = gateway(vec![], fast_config());
        let err = gw
            .generate_text(TaskType::Research, vec![ChatMessage::user("hi")], None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoModelsAvailable(TaskType::Research)));
    }

    #[tokio::test]
    async fn test_rate_limit_cools_down_and_advances() {
        let primary = Arc::new(ScriptedClient::new(
            Provider::Anthropic,
            vec![Err(LlmError::rate_limited("429", None))],
        ));
        let secondary = Arc::new(ScriptedClient::new(Provider::OpenAi, vec![text("ok")]));
        let gw = gateway(vec![primary.clone(), secondary.clone()], fast_config());

        let started = std::time::Instant::now();
        let result = gw
            .generate_text(TaskType::Research, vec![ChatMessage::user("hi")], None, None, None)
            .await
            .unwrap();

        assert!(result.fallback_used);
        // rate limit is not retried on the same model
        assert_eq!(primary.call_count(), 1);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_rate_limit_on_last_candidate_surfaces() {
        let only = Arc::new(ScriptedClient::new(
            Provider::OpenAi,
            vec![Err(LlmError::rate_limited("too many requests", None))],
        ));
        let gw = gateway(vec![only], fast_config());
        let err = gw
            .generate_text(TaskType::Research, vec![ChatMessage::user("hi")], None, None, None)
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn test_permanent_error_still_tries_next_candidate() {
        let primary = Arc::new(ScriptedClient::new(
            Provider::Anthropic,
            vec![Err(LlmError::client_error(400, "bad request"))],
        ));
        let secondary = Arc::new(ScriptedClient::new(Provider::OpenAi, vec![text("ok")]));
        let gw = gateway(vec![primary.clone(), secondary], fast_config());

        let result = gw
            .generate_text(TaskType::Research, vec![ChatMessage::user("hi")], None, None, None)
            .await
            .unwrap();
        assert!(result.fallback_used);
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fallbacks_disabled_surfaces_first_failure() {
        let primary = Arc::new(ScriptedClient::new(
            Provider::Anthropic,
            vec![Err(LlmError::client_error(401, "bad key"))],
        ));
        let secondary = Arc::new(ScriptedClient::new(Provider::OpenAi, vec![text("ok")]));
        let config = GatewayConfig {
            enable_fallbacks: false,
            ..fast_config()
        };
        let gw = gateway(vec![primary, secondary.clone()], config);

        let err = gw
            .generate_text(TaskType::Research, vec![ChatMessage::user("hi")], None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.llm_error().unwrap().status_code, Some(401));
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_structured_output_never_succeeds() {
        let primary = Arc::new(ScriptedClient::new(
            Provider::Anthropic,
            vec![text(r#"{"sections": []}"#)],
        ));
        let secondary = Arc::new(ScriptedClient::new(
            Provider::OpenAi,
            vec![text("I cannot produce JSON today")],
        ));
        let gw = gateway(vec![primary, secondary], fast_config());

        let err = gw
            .generate_structured::<Outline>(
                TaskType::ReportGeneration,
                vec![ChatMessage::user("outline")],
                None,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.llm_error().unwrap().kind, LlmErrorKind::Validation);
        // both rejected replies were billed
        assert_eq!(err.billed_usage().unwrap().total_tokens, 300);
    }

    #[tokio::test]
    async fn test_invalid_structured_output_falls_back_to_valid() {
        let primary = Arc::new(ScriptedClient::new(
            Provider::Anthropic,
            vec![text(r#"{"sections": []}"#)],
        ));
        let secondary = Arc::new(ScriptedClient::new(
            Provider::OpenAi,
            vec![text("```json\n{\"sections\": [\"Intro\"]}\n```")],
        ));
        let gw = gateway(vec![primary, secondary], fast_config());

        let result = gw
            .generate_structured::<Outline>(
                TaskType::ReportGeneration,
                vec![ChatMessage::user("outline")],
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.value.sections, vec!["Intro"]);
        assert!(result.fallback_used);
        assert_eq!(result.usage.total_tokens, 300);
    }

    #[tokio::test]
    async fn test_usage_estimated_when_provider_omits_it() {
        let client = Arc::new(ScriptedClient::new(
            Provider::OpenAi,
            vec![Ok(ChatResponse {
                content: Some("x".repeat(400)),
                ..Default::default()
            })],
        ));
        let gw = gateway(vec![client], fast_config());
        let result = gw
            .generate_text(TaskType::Summarization, vec![ChatMessage::user("hi")], None, None, None)
            .await
            .unwrap();
        assert_eq!(result.usage.output_tokens, 100);
        assert!(result.usage.input_tokens > 0);
    }
}
