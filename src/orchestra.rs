use crate::client::{self, RetryPolicy};
use crate::config::{self, ModelLibrary};
use crate::datam::{format_tool_message, Message, ResponsePayload, Usage};
use crate::error::FinRagError;
use crate::providers::{self, ProviderAdapter, ResponseParser};
use crate::tools::{render_tool_output, Tool, ToolCall, ToolDefinition, ToolLibrary};

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 6;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// One round trip to a chat model.
///
/// The HTTP implementation talks to a provider from `models.json`; tests
/// substitute scripted backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        temperature: f32,
    ) -> Result<ResponsePayload, FinRagError>;

    /// The user-facing name of the model behind this backend.
    fn model_name(&self) -> &str;
}

/// A chat model reached over HTTP, configured from `models.json`.
pub struct HttpChatBackend {
    api_key: String,
    base_url: String,
    model_tag: String,
    pub user_facing_model_name: String,
    input_price: f32,
    output_price: f32,
    provider_adapter: Arc<dyn ProviderAdapter>,
    response_parser: Arc<dyn ResponseParser>,
    retry_policy: RetryPolicy,
}

impl HttpChatBackend {
    /// Creates a backend for the chat model registered under `model_name`.
    pub fn new(model_name: &str) -> Result<Self, FinRagError> {
        Self::from_library(&config::MODEL_LIBRARY, model_name)
    }

    pub fn from_library(library: &ModelLibrary, model_name: &str) -> Result<Self, FinRagError> {
        let (provider_name, provider_data, model_details) =
            library.find_model(model_name).ok_or_else(|| {
                FinRagError::Config(format!("Model '{}' not found in `models.json`", model_name))
            })?;

        let (provider_adapter, response_parser) = providers::resolve(provider_name)?;
        let api_key = config::get_env_var(&provider_data.api_key)?;
        let base_url = config::get_env_var(&provider_data.base_url)?;

        Ok(Self {
            api_key,
            base_url,
            model_tag: model_details.model_tag.clone(),
            user_facing_model_name: model_name.to_string(),
            input_price: model_details.input_price,
            output_price: model_details.output_price,
            provider_adapter,
            response_parser,
            retry_policy: RetryPolicy::default(),
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        temperature: f32,
    ) -> Result<ResponsePayload, FinRagError> {
        let tools = match tools {
            Some(defs) if !self.provider_adapter.supports_tools(&self.model_tag) => {
                warn!(
                    "{} does not support native tools; sending {} definitions was skipped",
                    self.user_facing_model_name,
                    defs.len()
                );
                None
            }
            other => other,
        };

        let url = self.provider_adapter.get_request_url(&self.base_url, &self.model_tag);
        let headers = self.provider_adapter.get_request_headers(&self.api_key)?;
        let payload = self.provider_adapter.prepare_request_payload(
            &self.model_tag,
            messages.to_vec(),
            temperature,
            tools,
        );

        let raw = client::execute_single_call(&url, headers, &payload, &self.retry_policy).await?;
        let mut response = self
            .response_parser
            .parse_response(&raw, self.input_price, self.output_price)?;
        if response.model.is_empty() {
            response.model = self.user_facing_model_name.clone();
        }
        Ok(response)
    }

    fn model_name(&self) -> &str {
        &self.user_facing_model_name
    }
}

/// What the model asked for on a given turn.
#[derive(Debug, Clone)]
pub enum ModelTurn {
    ToolCalls(Vec<ToolCall>),
    FinalText(String),
}

impl ModelTurn {
    /// Classifies the first choice of a response.
    pub fn classify(payload: &ResponsePayload) -> Result<Self, FinRagError> {
        let choice = payload.choices.first().ok_or_else(|| {
            FinRagError::ResponseParse("Model response contained no choices".to_string())
        })?;
        match &choice.message.tool_calls {
            Some(calls) if !calls.is_empty() => Ok(ModelTurn::ToolCalls(calls.clone())),
            _ => Ok(ModelTurn::FinalText(
                choice.message.content.clone().unwrap_or_default(),
            )),
        }
    }
}

/// Drives one request through the model, executing any tools it calls.
///
/// The loop is bounded by `max_tool_iterations`. When the budget runs out the
/// model gets one last call without tools and must answer from what it has.
#[derive(Clone)]
pub struct Orchestra {
    backend: Arc<dyn ChatBackend>,
    tools: Option<Arc<ToolLibrary>>,
    temperature: f32,
    max_tool_iterations: usize,
    tool_timeout: Duration,
}

impl Orchestra {
    pub fn new(
            backend: Arc<dyn ChatBackend>,
            temperature: Option<f32>,
            tools: Option<ToolLibrary>,
        ) -> Self {
        Self {
            backend,
            tools: tools.filter(|lib| !lib.is_empty()).map(Arc::new),
            temperature: temperature.unwrap_or(0.1),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_max_tool_iterations(mut self, max_tool_iterations: usize) -> Self {
        self.max_tool_iterations = max_tool_iterations.max(1);
        self
    }

    pub fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Tool definitions in a stable order, so identical requests produce
    /// identical payloads.
    fn tool_definitions(&self) -> Option<Vec<ToolDefinition>> {
        self.tools.as_ref().map(|library| {
            let mut definitions: Vec<ToolDefinition> =
                library.values().map(|tool| tool.definition().clone()).collect();
            definitions.sort_by(|a, b| a.function.name.cmp(&b.function.name));
            definitions
        })
    }

    /// The main entry point for a single conversational turn.
    ///
    /// Returns the model's final response with `usage` summed over every call
    /// made along the way.
    pub async fn call_ai(&self, mut messages: Vec<Message>) -> Result<ResponsePayload, FinRagError> {
        let definitions = self.tool_definitions();
        let mut total_usage: Option<Usage> = None;

        for iteration in 0..self.max_tool_iterations {
            debug!("[Orchestra] ModelInvoked (iteration {})", iteration + 1);
            let payload = self
                .backend
                .generate(&messages, definitions.as_deref(), self.temperature)
                .await?;
            accumulate(&mut total_usage, &payload);

            let calls = match ModelTurn::classify(&payload)? {
                ModelTurn::FinalText(_) => {
                    debug!("[Orchestra] FinalAnswer after {} model call(s)", iteration + 1);
                    return Ok(finish(payload, total_usage));
                }
                ModelTurn::ToolCalls(_) if self.tools.is_none() => {
                    warn!("[Orchestra] Model requested tools but none are registered");
                    return Ok(finish(payload, total_usage));
                }
                ModelTurn::ToolCalls(calls) => normalize_calls(calls),
            };

            let mut assistant_message = payload.choices[0].message.clone();
            assistant_message.tool_calls = Some(calls.clone());
            messages.push(assistant_message);

            for call in calls {
                debug!("[Orchestra] ToolRequested: {}", call.function.name);
                let result = self.execute_tool(&call.function.name, call.function.arguments).await;
                debug!("[Orchestra] ToolCompleted: {} ({} bytes)", call.function.name, result.len());
                messages.push(format_tool_message(result, call.id, call.function.name));
            }
        }

        debug!(
            "[Orchestra] Tool budget of {} iterations exhausted; synthesizing",
            self.max_tool_iterations
        );
        let payload = self.backend.generate(&messages, None, self.temperature).await?;
        accumulate(&mut total_usage, &payload);
        Ok(finish(payload, total_usage))
    }

    /// Executes a single tool and returns its result as a string.
    ///
    /// Every failure (unknown tool, tool error, panic, timeout) becomes text
    /// for the model rather than an error for the caller.
    pub async fn execute_tool(&self, name: &str, args: JsonValue) -> String {
        let tool = match self.tools.as_ref().and_then(|library| library.get(name)) {
            Some(tool) => tool.clone(),
            None => return format!("Tool '{}' not found in library.", name),
        };
        let args = normalize_arguments(args);

        let run = async move {
            match tool {
                // Synchronous tools run on the blocking pool so they cannot stall the runtime.
                Tool::Blocking { function, .. } => tokio::task::spawn_blocking(move || function(args))
                    .await
                    .map_err(|e| format!("Tool panicked during execution: {}", e))
                    .and_then(|result| result),
                Tool::Async { function, .. } => tokio::spawn(function(args))
                    .await
                    .map_err(|e| format!("Tool panicked during execution: {}", e))
                    .and_then(|result| result),
            }
        };

        match tokio::time::timeout(self.tool_timeout, run).await {
            Ok(Ok(value)) => render_tool_output(&value),
            Ok(Err(message)) => message,
            Err(_) => format!(
                "Tool '{}' timed out after {} ms.",
                name,
                self.tool_timeout.as_millis()
            ),
        }
    }
}

fn accumulate(total: &mut Option<Usage>, payload: &ResponsePayload) {
    if let Some(usage) = payload.usage.clone() {
        match total {
            Some(sum) => *sum += usage,
            None => *total = Some(usage),
        }
    }
}

fn finish(mut payload: ResponsePayload, usage: Option<Usage>) -> ResponsePayload {
    if usage.is_some() {
        payload.usage = usage;
    }
    payload
}

/// Gives every call an id so tool results can be matched to their request.
fn normalize_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() {
                call.id = format!("call-{}", uuid::Uuid::new_v4());
            }
            if call.tool_type.is_empty() {
                call.tool_type = "function".to_string();
            }
            call
        })
        .collect()
}

/// Providers sometimes send arguments as a JSON-encoded string, or nothing at all.
fn normalize_arguments(args: JsonValue) -> JsonValue {
    match args {
        JsonValue::Object(_) => args,
        JsonValue::String(raw) => match serde_json::from_str::<JsonValue>(&raw) {
            Ok(parsed @ JsonValue::Object(_)) => parsed,
            _ => json!({}),
        },
        _ => json!({}),
    }
}
