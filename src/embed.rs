use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::client::{self, RetryPolicy};
use crate::config::{self, ModelLibrary};
use crate::error::FinRagError;
use crate::providers::{self, ProviderAdapter, ResponseParser};

/// Whether text is embedded for storage or for searching.
///
/// Providers with asymmetric retrieval models (Gemini) embed documents and
/// queries differently; symmetric providers ignore the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    Document,
    Query,
}

/// Maps text to fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds a batch of texts; the output has one vector per input, in order.
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>, FinRagError>;

    /// Dimensionality of the vectors produced.
    fn dimensions(&self) -> usize;
}

/// The HTTP embedding engine, configured from `models.json`.
pub struct Embedder {
    api_key: String,
    base_url: String,
    model_tag: String,
    pub dimensions: usize,
    provider_adapter: Arc<dyn ProviderAdapter>,
    response_parser: Arc<dyn ResponseParser>,
    retry_policy: RetryPolicy,
}

impl Embedder {
    /// Creates a new `Embedder` for the embedding model registered under `model_name`.
    pub fn new(model_name: &str) -> Result<Self, FinRagError> {
        Self::from_library(&config::MODEL_LIBRARY, model_name)
    }

    pub fn from_library(library: &ModelLibrary, model_name: &str) -> Result<Self, FinRagError> {
        let (provider_name, provider_data, model_details) =
            library.find_embedder(model_name).ok_or_else(|| {
                FinRagError::Config(format!("Embedder '{}' not found in config", model_name))
            })?;

        let (provider_adapter, response_parser) = providers::resolve(provider_name)?;

        if !provider_adapter.supports_embeddings(&model_details.model_tag) {
            return Err(FinRagError::Config(format!(
                "Model '{}' via provider '{}' does not support embeddings.",
                model_name, provider_name
            )));
        }
        if model_details.dimensions == 0 {
            return Err(FinRagError::Config(format!(
                "Embedder '{}' has no dimensions configured.",
                model_name
            )));
        }

        let api_key = config::get_env_var(&provider_data.api_key)?;
        let base_url = config::get_env_var(&provider_data.base_url)?;

        Ok(Self {
            api_key,
            base_url,
            model_tag: model_details.model_tag.clone(),
            dimensions: model_details.dimensions,
            provider_adapter,
            response_parser,
            retry_policy: RetryPolicy::default(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for Embedder {
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>, FinRagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = self
            .provider_adapter
            .prepare_embedding_request(&self.model_tag, texts, mode);
        let headers = self.provider_adapter.get_request_headers(&self.api_key)?;
        let url = self.provider_adapter.get_embedding_url(&self.base_url, &self.model_tag);

        debug!("Embedding {} texts ({:?}) with {}", texts.len(), mode, self.model_tag);
        let response_text =
            client::execute_single_call(&url, headers, &payload, &self.retry_policy).await?;

        let vectors = self.response_parser.parse_embedding_response(&response_text)?;
        if vectors.len() != texts.len() {
            return Err(FinRagError::Retrieval(format!(
                "Expected {} embeddings, provider returned {}",
                texts.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(FinRagError::Retrieval(format!(
                "Embedding has {} dimensions, expected {}",
                bad.len(),
                self.dimensions
            )));
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
