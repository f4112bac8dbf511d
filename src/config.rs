use crate::error::FinRagError;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub mod storage;
pub mod toolkit;

// --- Data Structures for models.json ---

/// Holds the specific details for an individual AI model.
#[derive(Deserialize, Debug, Clone)]
pub struct ModelDetails {
    pub model_tag: String,
    pub input_price: f32,
    #[serde(default)]
    pub output_price: f32,
    #[serde(default)]
    pub token_window: u32,
    #[serde(default)]
    pub dimensions: usize,
}

/// Holds the configuration for a specific provider, including API keys and models.
#[derive(Deserialize, Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub models: HashMap<String, ModelDetails>,
    #[serde(default)]
    pub embedders: HashMap<String, ModelDetails>,
}

// --- Helper Function ---

/// Gets a variable from the environment, loading from a .env file first.
/// The `key_ref` is expected to be in the format "env:VAR_NAME".
pub fn get_env_var(key_ref: &str) -> Result<String, FinRagError> {
    dotenvy::dotenv().ok();
    if let Some(var_name) = key_ref.strip_prefix("env:") {
        env::var(var_name).map_err(|_| {
            FinRagError::Config(format!(
                "Environment variable '{}' not found. Please set it in your .env file.",
                var_name
            ))
        })
    } else {
        // Anything else is a literal value.
        Ok(key_ref.to_string())
    }
}

// --- ModelLibrary for loading and accessing model data ---

pub struct ModelLibrary {
    pub providers: HashMap<String, ProviderConfig>,
}

impl ModelLibrary {
    fn new() -> Result<Self, FinRagError> {
        // The `models.json` is included at compile time, making the library self-contained.
        Self::from_json(include_str!("config/models.json"))
    }

    pub fn from_json(json_str: &str) -> Result<Self, FinRagError> {
        let providers: HashMap<String, ProviderConfig> = serde_json::from_str(json_str)
            .map_err(|e| FinRagError::Config(format!("Failed to parse models.json: {}", e)))?;
        Ok(ModelLibrary { providers })
    }

    /// Finds a chat model by its user-facing name, returning the provider's
    /// friendly name (e.g., "Google") alongside its configuration.
    pub fn find_model(&self, model_name: &str) -> Option<(&str, &ProviderConfig, &ModelDetails)> {
        self.providers.iter().find_map(|(provider_name, provider_data)| {
            provider_data
                .models
                .get(model_name)
                .map(|details| (provider_name.as_str(), provider_data, details))
        })
    }

    pub fn find_embedder(
            &self,
            embedder_name: &str,
        ) -> Option<(&str, &ProviderConfig, &ModelDetails)> {
        self.providers.iter().find_map(|(provider_name, provider_data)| {
            provider_data
                .embedders
                .get(embedder_name)
                .map(|details| (provider_name.as_str(), provider_data, details))
        })
    }
}

/// A global, lazily-initialized instance of the ModelLibrary.
///
/// `models.json` is parsed once, the first time it is accessed.
pub static MODEL_LIBRARY: Lazy<ModelLibrary> =
    Lazy::new(|| ModelLibrary::new().expect("Failed to load model library from models.json"));

pub static DEFAULT_APP_DIR: Lazy<PathBuf> = Lazy::new(|| {
    home::home_dir()
        .map(|mut path| {
            path.push(".finrag");
            path
        })
        .unwrap_or_else(|| PathBuf::from(".finrag"))
});

pub const DEFAULT_COLLECTION: &str = "finance_knowledge";
pub const DEFAULT_CHAT_MODEL: &str = "GEMINI 2.5 FLASH";
pub const DEFAULT_EMBEDDING_MODEL: &str = "GEMINI TEXT EMBEDDING 004";

/// The PRBench finance splits on the Hugging Face Hub.
pub const DEFAULT_CORPUS_SOURCES: [&str; 2] = [
    "hf://datasets/ScaleAI/PRBench/data/finance_hard-00000-of-00001.parquet",
    "hf://datasets/ScaleAI/PRBench/data/finance-00000-of-00001.parquet",
];

// --- Application settings ---

/// Runtime settings for the assistant.
///
/// `Default` gives the stock configuration; `from_env` layers `FINRAG_*`
/// environment variables (and `.env`) on top of it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory holding one sub-directory per collection.
    pub data_dir: PathBuf,
    pub collection_name: String,
    pub chat_model: String,
    pub embedding_model: String,
    /// Safety limit on the number of corpus rows considered during ingestion.
    /// `None` ingests everything.
    pub max_records: Option<usize>,
    /// Records embedded and written per batch.
    pub batch_size: usize,
    pub top_k: usize,
    pub temperature: f32,
    pub max_tool_iterations: usize,
    pub tool_timeout_ms: u64,
    pub code_timeout_ms: u64,
    pub code_max_output: usize,
    pub corpus_sources: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_APP_DIR.clone(),
            collection_name: DEFAULT_COLLECTION.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            max_records: Some(100),
            batch_size: 20,
            top_k: 3,
            temperature: 0.1,
            max_tool_iterations: 6,
            tool_timeout_ms: 30_000,
            code_timeout_ms: 5_000,
            code_max_output: 16 * 1024,
            corpus_sources: DEFAULT_CORPUS_SOURCES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AppConfig {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, FinRagError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Unset keys keep
    /// their defaults; set but unparsable keys are configuration errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FinRagError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(dir) = lookup("FINRAG_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(name) = lookup("FINRAG_COLLECTION") {
            config.collection_name = name;
        }
        if let Some(model) = lookup("FINRAG_CHAT_MODEL") {
            config.chat_model = model;
        }
        if let Some(model) = lookup("FINRAG_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Some(limit) = parse_var::<usize, _>(&lookup, "FINRAG_MAX_RECORDS")? {
            config.max_records = if limit == 0 { None } else { Some(limit) };
        }
        if let Some(size) = parse_var(&lookup, "FINRAG_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(k) = parse_var(&lookup, "FINRAG_TOP_K")? {
            config.top_k = k;
        }
        if let Some(t) = parse_var(&lookup, "FINRAG_TEMPERATURE")? {
            config.temperature = t;
        }
        if let Some(n) = parse_var(&lookup, "FINRAG_MAX_TOOL_ITERATIONS")? {
            config.max_tool_iterations = n;
        }
        if let Some(ms) = parse_var(&lookup, "FINRAG_TOOL_TIMEOUT_MS")? {
            config.tool_timeout_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "FINRAG_CODE_TIMEOUT_MS")? {
            config.code_timeout_ms = ms;
        }
        if let Some(bytes) = parse_var(&lookup, "FINRAG_CODE_MAX_OUTPUT")? {
            config.code_max_output = bytes;
        }
        if let Some(sources) = lookup("FINRAG_CORPUS_SOURCES") {
            config.corpus_sources = sources
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FinRagError> {
        if self.batch_size == 0 {
            return Err(FinRagError::Config("batch_size must be at least 1".to_string()));
        }
        if self.top_k == 0 {
            return Err(FinRagError::Config("top_k must be at least 1".to_string()));
        }
        if self.max_tool_iterations == 0 {
            return Err(FinRagError::Config(
                "max_tool_iterations must be at least 1".to_string(),
            ));
        }
        if self.collection_name.trim().is_empty() {
            return Err(FinRagError::Config("collection_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Directory holding the on-disk index for the configured collection.
    pub fn collection_dir(&self) -> PathBuf {
        self.data_dir.join(&self.collection_name)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, FinRagError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            FinRagError::Config(format!("Invalid value '{}' for {}: {}", raw, key, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn bundled_models_json_parses() {
        let (provider, _, details) = MODEL_LIBRARY.find_model(DEFAULT_CHAT_MODEL).unwrap();
        assert_eq!(provider, "Google");
        assert_eq!(details.model_tag, "gemini-2.5-flash");

        let (_, _, embedder) = MODEL_LIBRARY.find_embedder(DEFAULT_EMBEDDING_MODEL).unwrap();
        assert_eq!(embedder.dimensions, 768);
    }

    #[test]
    fn unknown_model_is_none() {
        assert!(MODEL_LIBRARY.find_model("NOT A MODEL").is_none());
    }

    #[test]
    fn defaults_without_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.max_records, Some(100));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.top_k, 3);
        assert_eq!(config.collection_name, DEFAULT_COLLECTION);
        assert_eq!(config.corpus_sources.len(), 2);
    }

    #[test]
    fn overrides_are_applied() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("FINRAG_MAX_RECORDS", "0"),
            ("FINRAG_BATCH_SIZE", "5"),
            ("FINRAG_CORPUS_SOURCES", "a.jsonl, ,b.json"),
            ("FINRAG_DATA_DIR", "/tmp/finrag-test"),
        ]))
        .unwrap();
        assert_eq!(config.max_records, None);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.corpus_sources, vec!["a.jsonl", "b.json"]);
        assert_eq!(
            config.collection_dir(),
            PathBuf::from("/tmp/finrag-test").join(DEFAULT_COLLECTION)
        );
    }

    #[test]
    fn invalid_numbers_are_config_errors() {
        let err = AppConfig::from_lookup(lookup_from(&[("FINRAG_TOP_K", "three")])).unwrap_err();
        assert!(matches!(err, FinRagError::Config(_)));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[("FINRAG_BATCH_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }
}
