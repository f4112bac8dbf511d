use std::path::PathBuf;

use bytes::Bytes;
use log::{info, warn};
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

use crate::client::{self, RetryPolicy};
use crate::error::FinRagError;

const DEFAULT_TOPIC: &str = "General";

/// Cells whose text ends up in a document. A row with any of them cut short
/// by datasets-server is dropped.
const CONTENT_CELLS: [&str; 4] = ["prompt_0", "scratchpad", "response_0", "reference_texts_0"];

/// One row of the financial corpus, before it is shaped into a document.
///
/// Cells that are not strings (lists of reference texts, numbers) are kept as
/// their JSON text, so an empty list reads as `"[]"`. Missing or null cells
/// read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "prompt_0", default, deserialize_with = "lenient_string")]
    pub prompt: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub scratchpad: String,
    #[serde(rename = "response_0", default, deserialize_with = "lenient_string")]
    pub response: String,
    #[serde(rename = "reference_texts_0", default, deserialize_with = "lenient_string")]
    pub reference_texts: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub topic: String,
}

impl RawRecord {
    fn normalized(mut self) -> Self {
        if self.topic.trim().is_empty() {
            self.topic = DEFAULT_TOPIC.to_string();
        }
        self
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s,
        other => other.to_string(),
    })
}

/// Where corpus rows are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusSource {
    Local(PathBuf),
    Remote(String),
}

impl CorpusSource {
    /// Classifies a configured source. `hf://datasets/...` URIs are resolved
    /// to their download URL on the Hub.
    pub fn parse(source: &str) -> Self {
        let source = source.trim();
        if let Some(url) = resolve_hf_uri(source) {
            return CorpusSource::Remote(url);
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            CorpusSource::Remote(source.to_string())
        } else {
            CorpusSource::Local(PathBuf::from(source))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CorpusSource::Local(path) => path.display().to_string(),
            CorpusSource::Remote(url) => url.clone(),
        }
    }

    fn is_parquet(&self) -> bool {
        self.describe().to_ascii_lowercase().ends_with(".parquet")
    }

    /// Fetches and parses every row of this source.
    pub async fn load(&self, retry_policy: &RetryPolicy) -> Result<Vec<RawRecord>, FinRagError> {
        if self.is_parquet() {
            let data = match self {
                CorpusSource::Local(path) => Bytes::from(tokio::fs::read(path).await?),
                CorpusSource::Remote(url) => client::fetch_bytes(url, retry_policy).await?,
            };
            return tokio::task::spawn_blocking(move || parse_parquet(data)).await?;
        }
        let text = match self {
            CorpusSource::Local(path) => tokio::fs::read_to_string(path).await?,
            CorpusSource::Remote(url) => client::fetch_text(url, retry_policy).await?,
        };
        parse_corpus(&text)
    }
}

/// Maps `hf://datasets/{owner}/{name}/{file}` to its `resolve/main` URL.
pub fn resolve_hf_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("hf://datasets/")?;
    let mut parts = rest.splitn(3, '/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let name = parts.next().filter(|s| !s.is_empty())?;
    let file = parts.next().filter(|s| !s.is_empty())?;
    Some(format!(
        "https://huggingface.co/datasets/{}/{}/resolve/main/{}",
        owner, name, file
    ))
}

/// Parses corpus text in any of the supported layouts: a datasets-server
/// `rows` response, a JSON array of row objects, a single row object, or
/// JSON Lines. Parquet files go through [`parse_parquet`] instead.
pub fn parse_corpus(text: &str) -> Result<Vec<RawRecord>, FinRagError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<JsonValue>(trimmed) {
        Ok(JsonValue::Object(mut object)) => match object.remove("rows") {
            Some(JsonValue::Array(rows)) => {
                let mut records = Vec::with_capacity(rows.len());
                for mut entry in rows {
                    let truncated = truncated_content(&entry);
                    if !truncated.is_empty() {
                        warn!(
                            "Skipping row {}: datasets-server truncated {}",
                            entry.get("row_idx").unwrap_or(&JsonValue::Null),
                            truncated.join(", ")
                        );
                        continue;
                    }
                    match entry.get_mut("row").map(JsonValue::take) {
                        Some(row) => records.push(parse_row(row)?),
                        None => {
                            return Err(FinRagError::Corpus(
                                "datasets-server entry without a 'row' field".to_string(),
                            ))
                        }
                    }
                }
                Ok(records)
            }
            Some(_) => Err(FinRagError::Corpus("'rows' is not an array".to_string())),
            None => Ok(vec![parse_row(JsonValue::Object(object))?]),
        },
        Ok(JsonValue::Array(rows)) => rows.into_iter().map(parse_row).collect(),
        Ok(other) => Err(FinRagError::Corpus(format!(
            "expected rows of objects, found {}",
            json_kind(&other)
        ))),
        Err(_) => trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str::<JsonValue>(line)
                    .map_err(|e| FinRagError::Corpus(format!("line {}: {}", n + 1, e)))
                    .and_then(parse_row)
            })
            .collect(),
    }
}

/// Content cells listed in a datasets-server entry's `truncated_cells`.
fn truncated_content(entry: &JsonValue) -> Vec<&str> {
    entry
        .get("truncated_cells")
        .and_then(JsonValue::as_array)
        .map(|cells| {
            cells
                .iter()
                .filter_map(JsonValue::as_str)
                .filter(|cell| CONTENT_CELLS.contains(cell))
                .collect()
        })
        .unwrap_or_default()
}

/// Reads every row of a parquet file. Columns are matched by name, so the
/// file may carry extra columns in any order.
pub fn parse_parquet(data: Bytes) -> Result<Vec<RawRecord>, FinRagError> {
    let reader = SerializedFileReader::new(data)?;
    let rows = reader.get_row_iter(None)?;
    rows.map(|row| parse_row(row?.to_json_value())).collect()
}

fn parse_row(row: JsonValue) -> Result<RawRecord, FinRagError> {
    if !row.is_object() {
        return Err(FinRagError::Corpus(format!(
            "expected a row object, found {}",
            json_kind(&row)
        )));
    }
    let record: RawRecord = serde_json::from_value(row)
        .map_err(|e| FinRagError::Corpus(format!("malformed row: {}", e)))?;
    Ok(record.normalized())
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Loads every configured source in order and concatenates their rows.
/// A source that cannot be fetched or parsed is logged and skipped.
pub async fn load_corpus(sources: &[String], retry_policy: &RetryPolicy) -> Vec<RawRecord> {
    let mut records = Vec::new();
    for source in sources.iter().map(|s| CorpusSource::parse(s)) {
        info!("Loading corpus from {}", source.describe());
        match source.load(retry_policy).await {
            Ok(rows) => {
                info!("Loaded {} rows from {}", rows.len(), source.describe());
                records.extend(rows);
            }
            Err(e) => warn!("Error loading {}: {}", source.describe(), e),
        }
    }
    records
}
