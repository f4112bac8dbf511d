use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::client::RetryPolicy;
use crate::config::storage::{DocumentRecord, StoreStats};
use crate::config::AppConfig;
use crate::embed::{EmbedMode, EmbeddingProvider};
use crate::error::FinRagError;
use crate::ingest::{self, RawRecord};
use crate::vector::VectorIndex;

pub use crate::vector::RetrievedSnippet;

/// The fixed financial taxonomy the corpus is labelled with.
pub const KNOWN_TOPICS: [&str; 12] = [
    "Risk Management & Stress Testing",
    "International Finance & FX Hedging",
    "Market Microstructure, Trading & Liquidity",
    "Accounting & Financial Statement Analysis",
    "Taxation & Cross-Border Structuring",
    "Derivatives & Structured Products",
    "Wealth Management, Financial Planning & Advice",
    "FinTech, Crypto & Digital Assets",
    "Regulation, Compliance & Ethics",
    "Corporate Finance",
    "Investment Strategy & Portfolio Design",
    "Alternative Investments & Private Markets",
];

const ALL_TOPICS: &str = "All";
const PROMPT_SNIPPET_CHARS: usize = 500;
const NO_SNIPPETS: &str = "No snippets found in the knowledge base for this query.";

/// Restricts a query to one topic, or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TopicFilter {
    #[default]
    All,
    Topic(String),
}

impl TopicFilter {
    /// `None`, blank and `"All"` mean no filter.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some(ALL_TOPICS) => TopicFilter::All,
            Some(topic) => TopicFilter::Topic(topic.to_string()),
        }
    }

    pub fn as_topic(&self) -> Option<&str> {
        match self {
            TopicFilter::All => None,
            TopicFilter::Topic(topic) => Some(topic),
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_topic().unwrap_or(ALL_TOPICS))
    }
}

/// Where the topic list comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopicSource {
    #[default]
    Static,
    Indexed,
}

/// What an ingestion pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Rows examined before the record cap was reached.
    pub considered: usize,
    pub skipped_blank: usize,
    pub indexed: usize,
    pub failed_batches: usize,
}

/// Settings that shape ingestion and querying.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub collection_dir: PathBuf,
    pub max_records: Option<usize>,
    pub batch_size: usize,
    pub corpus_sources: Vec<String>,
}

impl From<&AppConfig> for RetrievalSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            collection_dir: config.collection_dir(),
            max_records: config.max_records,
            batch_size: config.batch_size,
            corpus_sources: config.corpus_sources.clone(),
        }
    }
}

/// Shapes a corpus row into a document. Returns `None` when the row has no
/// usable content.
///
/// The embedded text is built from the prompt and scratchpad only; the
/// response rides along as metadata.
pub fn build_record(idx: usize, raw: &RawRecord) -> Option<DocumentRecord> {
    let content = if raw.response.trim().is_empty() {
        raw.reference_texts.as_str()
    } else {
        raw.response.as_str()
    };
    let content = content.trim();
    if content.is_empty() || content == "[]" {
        return None;
    }

    Some(DocumentRecord {
        id: format!("doc_{}", idx),
        embed_text: format!("Prompt: {}\nScratchpad: {}", raw.prompt, raw.scratchpad),
        topic: raw.topic.clone(),
        response: raw.response.clone(),
        prompt_snippet: raw.prompt.chars().take(PROMPT_SNIPPET_CHARS).collect(),
    })
}

/// Formats hits as the context block handed to the model.
pub fn render_snippets(snippets: &[RetrievedSnippet]) -> String {
    if snippets.is_empty() {
        return NO_SNIPPETS.to_string();
    }
    snippets
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            format!(
                "\nSnippet {} (Topic: {}):\n{}\nAnswer: {}\n",
                i + 1,
                hit.record.topic,
                hit.record.embed_text,
                hit.record.response
            )
        })
        .collect()
}

/// Owns one collection and the embedder used to fill and search it.
pub struct RetrievalEngine {
    index: RwLock<Option<VectorIndex>>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: RetrievalSettings,
    write_lock: Mutex<()>,
}

impl RetrievalEngine {
    /// Opens (or creates, empty) the collection described by `settings`.
    pub fn open(
            settings: RetrievalSettings,
            embedder: Arc<dyn EmbeddingProvider>,
        ) -> Result<Self, FinRagError> {
        let index = VectorIndex::open(&settings.collection_dir, embedder.dimensions())?;
        Ok(Self {
            index: RwLock::new(Some(index)),
            embedder,
            settings,
            write_lock: Mutex::new(()),
        })
    }

    /// Opens the collection and, when it did not exist yet or holds nothing,
    /// populates it from the configured corpus sources.
    pub async fn open_or_ingest(
            settings: RetrievalSettings,
            embedder: Arc<dyn EmbeddingProvider>,
        ) -> Result<Self, FinRagError> {
        let existed = VectorIndex::exists(&settings.collection_dir);
        let engine = Self::open(settings, embedder)?;
        if !existed || engine.count().await? == 0 {
            info!(
                "Collection at {} not found, creating and indexing",
                engine.settings.collection_dir.display()
            );
            let report = engine.ingest_from_sources().await?;
            info!("Indexing complete: {:?}", report);
        }
        Ok(engine)
    }

    pub fn collection_dir(&self) -> &Path {
        &self.settings.collection_dir
    }

    /// Loads the configured corpus sources and ingests them.
    pub async fn ingest_from_sources(&self) -> Result<IngestReport, FinRagError> {
        let rows =
            ingest::load_corpus(&self.settings.corpus_sources, &RetryPolicy::default()).await;
        if rows.is_empty() {
            warn!("No corpus rows loaded; the collection stays empty");
        }
        self.ingest(&rows).await
    }

    /// Shapes, embeds and stores `rows`, then rebuilds the forest once.
    ///
    /// Only one ingestion runs at a time. A batch that fails to embed or store
    /// is logged and skipped.
    pub async fn ingest(&self, rows: &[RawRecord]) -> Result<IngestReport, FinRagError> {
        let _writer = self.write_lock.lock().await;
        let mut report = IngestReport::default();

        let mut documents = Vec::new();
        for (idx, raw) in rows.iter().enumerate() {
            if self.settings.max_records.map_or(false, |limit| idx >= limit) {
                break;
            }
            report.considered += 1;
            match build_record(idx, raw) {
                Some(record) => documents.push(record),
                None => report.skipped_blank += 1,
            }
        }
        info!(
            "Indexing {} of {} rows ({} blank)",
            documents.len(),
            rows.len(),
            report.skipped_blank
        );

        let guard = self.index.read().await;
        let index = guard
            .as_ref()
            .ok_or_else(|| FinRagError::Retrieval("collection is closed".to_string()))?;

        for batch in documents.chunks(self.settings.batch_size.max(1)) {
            match self.index_batch(index, batch).await {
                Ok(n) => report.indexed += n,
                Err(e) => {
                    warn!("Error batch indexing ({} .. {}): {}", batch[0].id, batch[batch.len() - 1].id, e);
                    report.failed_batches += 1;
                }
            }
        }

        index.build()?;
        Ok(report)
    }

    async fn index_batch(
            &self,
            index: &VectorIndex,
            batch: &[DocumentRecord],
        ) -> Result<usize, FinRagError> {
        let texts: Vec<String> = batch.iter().map(|r| r.embed_text.clone()).collect();
        let vectors = self.embedder.embed(&texts, EmbedMode::Document).await?;
        index.upsert(batch, &vectors)
    }

    /// Returns at most `n` snippets closest to `text`. Failures are logged and
    /// yield an empty result.
    pub async fn query(&self, text: &str, filter: &TopicFilter, n: usize) -> Vec<RetrievedSnippet> {
        match self.try_query(text, filter, n).await {
            Ok(hits) => {
                debug!("Query matched {} snippets (filter: {})", hits.len(), filter);
                hits
            }
            Err(e) => {
                warn!("Retrieval failed for filter {}: {}", filter, e);
                Vec::new()
            }
        }
    }

    async fn try_query(
            &self,
            text: &str,
            filter: &TopicFilter,
            n: usize,
        ) -> Result<Vec<RetrievedSnippet>, FinRagError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let vectors = self.embedder.embed(&[text.to_string()], EmbedMode::Query).await?;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            FinRagError::Retrieval("Failed to generate embedding for query".to_string())
        })?;

        let guard = self.index.read().await;
        let index = guard
            .as_ref()
            .ok_or_else(|| FinRagError::Retrieval("collection is closed".to_string()))?;
        index.search(&vector, n, filter.as_topic())
    }

    /// The topics a user may filter on, sorted and deduplicated.
    pub async fn topics(&self, source: TopicSource) -> Vec<String> {
        if source == TopicSource::Indexed {
            let guard = self.index.read().await;
            match guard.as_ref().map(VectorIndex::topics) {
                Some(Ok(topics)) if !topics.is_empty() => return topics,
                Some(Err(e)) => warn!("Could not list indexed topics: {}", e),
                _ => debug!("No indexed topics; using the static taxonomy"),
            }
        }
        static_topics()
    }

    pub async fn count(&self) -> Result<usize, FinRagError> {
        let guard = self.index.read().await;
        guard.as_ref().map_or(Ok(0), VectorIndex::count)
    }

    pub async fn stats(&self) -> Result<StoreStats, FinRagError> {
        let guard = self.index.read().await;
        guard.as_ref().map_or_else(|| Ok(StoreStats::default()), VectorIndex::stats)
    }

    /// Flushes and releases the collection. Later queries return nothing.
    pub async fn close(&self) -> Result<(), FinRagError> {
        let _writer = self.write_lock.lock().await;
        let index = self.index.write().await.take();
        match index {
            Some(index) => index.close(),
            None => Ok(()),
        }
    }

    /// Drops the collection from disk so the next open starts empty.
    pub async fn destroy(&self) -> Result<(), FinRagError> {
        let _writer = self.write_lock.lock().await;
        let index = self.index.write().await.take();
        match index {
            Some(index) => index.destroy(),
            None => Ok(()),
        }
    }
}

/// The static taxonomy, sorted.
pub fn static_topics() -> Vec<String> {
    let mut topics: Vec<String> = KNOWN_TOPICS.iter().map(|t| t.to_string()).collect();
    topics.sort();
    topics.dedup();
    topics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(prompt: &str, response: &str, refs: &str) -> RawRecord {
        RawRecord {
            prompt: prompt.to_string(),
            scratchpad: "pad".to_string(),
            response: response.to_string(),
            reference_texts: refs.to_string(),
            topic: "Corporate Finance".to_string(),
        }
    }

    #[test]
    fn embed_text_excludes_the_response() {
        let record = build_record(7, &raw("What is WACC?", "Weighted cost of capital.", "")).unwrap();
        assert_eq!(record.id, "doc_7");
        assert_eq!(record.embed_text, "Prompt: What is WACC?\nScratchpad: pad");
        assert!(!record.embed_text.contains("Weighted"));
        assert_eq!(record.response, "Weighted cost of capital.");
    }

    #[test]
    fn reference_texts_stand_in_for_a_blank_response() {
        let record = build_record(0, &raw("q", "  ", "[\"ref\"]")).unwrap();
        assert_eq!(record.response, "  ");
        assert!(build_record(1, &raw("q", "", "[]")).is_none());
        assert!(build_record(2, &raw("q", "", "   ")).is_none());
    }

    #[test]
    fn prompt_snippet_is_capped_by_characters() {
        let prompt = "é".repeat(600);
        let record = build_record(0, &raw(&prompt, "r", "")).unwrap();
        assert_eq!(record.prompt_snippet.chars().count(), 500);
    }

    #[test]
    fn topic_filter_parsing() {
        assert_eq!(TopicFilter::parse(None), TopicFilter::All);
        assert_eq!(TopicFilter::parse(Some("")), TopicFilter::All);
        assert_eq!(TopicFilter::parse(Some("All")), TopicFilter::All);
        assert_eq!(
            TopicFilter::parse(Some("Corporate Finance")),
            TopicFilter::Topic("Corporate Finance".to_string())
        );
        assert_eq!(TopicFilter::All.to_string(), "All");
    }

    #[test]
    fn static_topics_are_sorted_and_unique() {
        let topics = static_topics();
        assert_eq!(topics.len(), 12);
        assert!(topics.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(topics[0], "Accounting & Financial Statement Analysis");
    }

    #[test]
    fn empty_hits_render_a_notice() {
        assert_eq!(render_snippets(&[]), NO_SNIPPETS);
        let hit = RetrievedSnippet {
            record: build_record(0, &raw("q", "a", "")).unwrap(),
            distance: 0.1,
        };
        assert_eq!(
            render_snippets(&[hit]),
            "\nSnippet 1 (Topic: Corporate Finance):\nPrompt: q\nScratchpad: pad\nAnswer: a\n"
        );
    }
}
