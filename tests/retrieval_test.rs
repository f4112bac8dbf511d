mod common;

use common::{open_engine, record, sample_corpus, HashingEmbedder};
use finrag_core::retrieval::{render_snippets, RetrievalEngine, TopicFilter, TopicSource};
use std::sync::Arc;
use tempfile::tempdir;

// --- Test: Embedded Text ---
// Goal: Documents are embedded from prompt and scratchpad; the response is stored but never embedded.
#[tokio::test]
async fn test_embed_text_excludes_response() {
    let dir = tempdir().unwrap();
    let embedder = Arc::new(HashingEmbedder::default());
    let engine = open_engine(dir.path(), embedder.clone());

    let rows = vec![record("What is VaR?", "Quantile of the loss distribution.", "SECRET ANSWER", "Risk")];
    let report = engine.ingest(&rows).await.unwrap();
    assert_eq!(report.indexed, 1);

    let embedded = embedder.documents.lock().unwrap().clone();
    assert_eq!(embedded, vec!["Prompt: What is VaR?\nScratchpad: Quantile of the loss distribution."]);
    assert!(!embedded[0].contains("SECRET ANSWER"));

    let hits = engine.query("VaR quantile", &TopicFilter::All, 3).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.response, "SECRET ANSWER");
    assert_eq!(hits[0].record.id, "doc_0");
    engine.close().await.unwrap();
}

// --- Test: Blank Rows ---
// Goal: Rows without a response or reference texts are never indexed.
#[tokio::test]
async fn test_blank_rows_are_skipped() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(HashingEmbedder::default()));

    let mut with_refs = record("Define duration", "", "", "Corporate Finance");
    with_refs.reference_texts = "[\"Macaulay duration is a weighted average time\"]".into();
    let rows = vec![
        record("Empty one", "nothing", "", "Corporate Finance"),
        record("Whitespace", "nothing", "   ", "Corporate Finance"),
        with_refs,
    ];
    let report = engine.ingest(&rows).await.unwrap();
    assert_eq!(report.considered, 3);
    assert_eq!(report.skipped_blank, 2);
    assert_eq!(report.indexed, 1);
    assert_eq!(engine.count().await.unwrap(), 1);

    let hits = engine.query("duration", &TopicFilter::All, 5).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.id, "doc_2");
    engine.close().await.unwrap();
}

// --- Test: Idempotent Re-ingestion ---
// Goal: Ingesting the same corpus twice leaves one document per row.
#[tokio::test]
async fn test_reingest_is_idempotent() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(HashingEmbedder::default()));
    let corpus = sample_corpus();

    engine.ingest(&corpus).await.unwrap();
    let first = engine.count().await.unwrap();
    engine.ingest(&corpus).await.unwrap();
    assert_eq!(engine.count().await.unwrap(), first);
    assert_eq!(first, corpus.len());

    let hits = engine.query("stress testing", &TopicFilter::All, 10).await;
    let mut ids: Vec<String> = hits.iter().map(|h| h.record.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), hits.len());
    engine.close().await.unwrap();
}

// --- Test: Topic Filter ---
// Goal: A topic filter only ever returns documents of that topic.
#[tokio::test]
async fn test_topic_filter_restricts_results() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(HashingEmbedder::default()));
    engine.ingest(&sample_corpus()).await.unwrap();

    let filter = TopicFilter::parse(Some("Risk Management & Stress Testing"));
    let hits = engine.query("stress testing", &filter, 10).await;
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.record.topic == "Risk Management & Stress Testing"));

    let unknown = TopicFilter::parse(Some("Astrology"));
    assert!(engine.query("stress testing", &unknown, 10).await.is_empty());
    engine.close().await.unwrap();
}

// --- Test: Result Count Bounds ---
// Goal: A query returns at most n results, and never more than the index holds.
#[tokio::test]
async fn test_result_count_is_bounded() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(HashingEmbedder::default()));
    engine.ingest(&sample_corpus()).await.unwrap();

    assert_eq!(engine.query("stress", &TopicFilter::All, 2).await.len(), 2);
    assert_eq!(engine.query("stress", &TopicFilter::All, 50).await.len(), 5);
    assert!(engine.query("stress", &TopicFilter::All, 0).await.is_empty());

    let hits = engine.query("tail dependence crash", &TopicFilter::All, 3).await;
    assert_eq!(hits[0].record.topic, "Investment Strategy & Portfolio Design");
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    engine.close().await.unwrap();
}

// --- Test: Empty Index ---
// Goal: Querying an empty collection yields nothing rather than an error.
#[tokio::test]
async fn test_empty_index_returns_nothing() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(HashingEmbedder::default()));
    let hits = engine.query("anything", &TopicFilter::All, 3).await;
    assert!(hits.is_empty());
    assert!(render_snippets(&hits).starts_with("No snippets found"));
    engine.close().await.unwrap();
}

// --- Test: Record Cap and Failed Batches ---
// Goal: max_records bounds ingestion, and a batch that fails to embed is skipped.
#[tokio::test]
async fn test_cap_and_failed_batches() {
    let dir = tempdir().unwrap();
    let mut settings = common::settings(dir.path());
    settings.max_records = Some(4);
    settings.batch_size = 2;
    let embedder = Arc::new(HashingEmbedder::failing_on("reverse"));
    let engine = RetrievalEngine::open(settings, embedder).unwrap();

    let report = engine.ingest(&sample_corpus()).await.unwrap();
    assert_eq!(report.considered, 4);
    // Rows 2 and 3 share the batch that mentions "reverse".
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.indexed, 2);
    assert_eq!(engine.count().await.unwrap(), 2);
    engine.close().await.unwrap();
}

// --- Test: Persistence ---
// Goal: A collection survives closing and reopening.
#[tokio::test]
async fn test_collection_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), Arc::new(HashingEmbedder::default()));
    engine.ingest(&sample_corpus()).await.unwrap();
    engine.close().await.unwrap();
    assert!(engine.query("stress", &TopicFilter::All, 3).await.is_empty());

    let reopened = open_engine(dir.path(), Arc::new(HashingEmbedder::default()));
    assert_eq!(reopened.count().await.unwrap(), 5);
    assert_eq!(reopened.query("stress", &TopicFilter::All, 3).await.len(), 3);

    let indexed = reopened.topics(TopicSource::Indexed).await;
    assert_eq!(
        indexed,
        vec![
            "Corporate Finance",
            "Investment Strategy & Portfolio Design",
            "Risk Management & Stress Testing",
        ]
    );
    assert_eq!(reopened.topics(TopicSource::Static).await.len(), 12);
    reopened.destroy().await.unwrap();
    assert!(!dir.path().join("finance_knowledge").exists());
}

// --- Test: Concurrent Ingest and Query ---
// Goal: Re-ingesting while queries run on other threads keeps one document per
// row, and every query stays within its result bound.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_and_query() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(open_engine(dir.path(), Arc::new(HashingEmbedder::default())));
    let corpus = sample_corpus();
    engine.ingest(&corpus).await.unwrap();
    let before = engine.count().await.unwrap();
    assert_eq!(before, corpus.len());

    let mut tasks = Vec::new();
    for round in 0..3 {
        let writer = Arc::clone(&engine);
        let rows = corpus.clone();
        tasks.push(tokio::spawn(async move {
            writer.ingest(&rows).await.unwrap();
            0
        }));
        for n in 1..=3 {
            let reader = Arc::clone(&engine);
            let filter = if round % 2 == 0 {
                TopicFilter::All
            } else {
                TopicFilter::parse(Some("Risk Management & Stress Testing"))
            };
            tasks.push(tokio::spawn(async move {
                let hits = reader.query("stress test tail risk", &filter, n).await;
                assert!(hits.len() <= n, "asked for {} got {}", n, hits.len());
                hits.len()
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(engine.count().await.unwrap(), before);
    let hits = engine.query("stress test tail risk", &TopicFilter::All, 3).await;
    assert_eq!(hits.len(), 3);
    engine.close().await.unwrap();
}
