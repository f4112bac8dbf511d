use crate::config::toolkit::{self, CODE_TOOL, RETRIEVE_TOOL};
use crate::config::AppConfig;
use crate::datam::{format_system_message, format_user_message};
use crate::embed::{Embedder, EmbeddingProvider};
use crate::error::FinRagError;
use crate::orchestra::{ChatBackend, HttpChatBackend, Orchestra};
use crate::retrieval::{RetrievalEngine, RetrievalSettings, TopicFilter, TopicSource};
use crate::sandbox::{CodeExecutor, SandboxLimits};

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Returned when the model's final turn carries no text.
pub const EMPTY_ANSWER: &str = "The model returned no answer. Please try rephrasing the question.";

/// Instruction sent with every request.
pub fn system_instruction() -> String {
    format!(
        "You are a helpful Financial Assistant. Use the {retrieve} tool to find information \
         from the knowledge base. Use {code} for calculations.\n\
         The {code} tool runs a small calculator language: assignments, arithmetic (+ - * / % **), \
         comparisons, lists like [1, 2, 3], `if cond {{ ... }} else {{ ... }}` and \
         `for x in list {{ ... }}` blocks. Only these functions exist: {builtins}. \
         `append(list, x)` returns a new list. Always print() the values you need.",
        retrieve = RETRIEVE_TOOL,
        code = CODE_TOOL,
        builtins = crate::sandbox::builtins::NAMES.join(", "),
    )
}

/// Knobs for a single `answer()`.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub temperature: f32,
    pub top_k: usize,
    pub max_tool_iterations: usize,
    pub tool_timeout: Duration,
    pub sandbox: SandboxLimits,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for AgentSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            max_tool_iterations: config.max_tool_iterations,
            tool_timeout: Duration::from_millis(config.tool_timeout_ms),
            sandbox: SandboxLimits {
                timeout: Duration::from_millis(config.code_timeout_ms),
                max_output: config.code_max_output,
                ..SandboxLimits::default()
            },
        }
    }
}

/// The financial assistant: retrieval and calculation tools around a chat model.
///
/// Stateless across calls; concurrent `answer()` calls share only the
/// engine, the executor and the backend.
pub struct FinancialAgent {
    engine: Arc<RetrievalEngine>,
    backend: Arc<dyn ChatBackend>,
    executor: CodeExecutor,
    settings: AgentSettings,
}

impl FinancialAgent {
    pub fn new(
            engine: Arc<RetrievalEngine>,
            backend: Arc<dyn ChatBackend>,
            settings: AgentSettings,
        ) -> Self {
        let executor = CodeExecutor::new(settings.sandbox);
        Self { engine, backend, executor, settings }
    }

    /// Builds the agent from configuration, opening the collection and
    /// indexing the corpus when it does not exist yet.
    ///
    /// Missing credentials and unknown models are reported here, not on the
    /// first question.
    pub async fn from_config(config: &AppConfig) -> Result<Self, FinRagError> {
        config.validate()?;
        let backend = HttpChatBackend::new(&config.chat_model)?;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(Embedder::new(&config.embedding_model)?);
        debug!("[Agent] ConfigBuilt for model {}", config.chat_model);

        let engine = RetrievalEngine::open_or_ingest(RetrievalSettings::from(config), embedder).await?;
        info!(
            "Financial agent ready: model {}, collection {}",
            config.chat_model,
            engine.collection_dir().display()
        );
        Ok(Self::new(Arc::new(engine), Arc::new(backend), AgentSettings::from(config)))
    }

    pub fn engine(&self) -> &Arc<RetrievalEngine> {
        &self.engine
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Topics a user may filter on.
    pub async fn topics(&self) -> Vec<String> {
        self.engine.topics(TopicSource::Static).await
    }

    /// Answers one question. Never fails: errors come back as user-facing text.
    ///
    /// `topic_filter` of `None` or `"All"` searches the whole knowledge base;
    /// any other value restricts every retrieval to that topic.
    pub async fn answer(&self, user_message: &str, topic_filter: Option<&str>) -> String {
        if user_message.trim().is_empty() {
            return String::new();
        }
        let filter = TopicFilter::parse(topic_filter);

        let tools = toolkit::build_tool_library(
            Arc::clone(&self.engine),
            filter.clone(),
            self.settings.top_k,
            self.executor.clone(),
        );
        let orchestra = Orchestra::new(
            Arc::clone(&self.backend),
            Some(self.settings.temperature),
            Some(tools),
        )
        .with_max_tool_iterations(self.settings.max_tool_iterations)
        .with_tool_timeout(self.settings.tool_timeout);

        let messages = vec![
            format_system_message(system_instruction()),
            format_user_message(format!("{} (Context Filter: {})", user_message, filter)),
        ];

        match orchestra.call_ai(messages).await {
            Ok(response) => {
                debug!("[Agent] FinalTextReceived");
                if let Some(usage) = &response.usage {
                    match usage.cost_usd {
                        Some(cost) => debug!("[Agent] Used {} tokens (${:.6})", usage.total_tokens, cost),
                        None => debug!("[Agent] Used {} tokens", usage.total_tokens),
                    }
                }
                match response.first_text().map(str::trim) {
                    Some(text) if !text.is_empty() => {
                        debug!("[Agent] Returned {} chars", text.len());
                        text.to_string()
                    }
                    _ => {
                        warn!("[Agent] Final turn carried no text");
                        EMPTY_ANSWER.to_string()
                    }
                }
            }
            Err(e) => {
                debug!("[Agent] Errored: {}", e);
                if e.is_model_not_found() {
                    format!(
                        "Error: Model {} not found. Please check API key access or model name.",
                        self.backend.model_name()
                    )
                } else {
                    format!("Error generation: {}", e)
                }
            }
        }
    }
}
