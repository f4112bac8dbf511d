use crate::error::FinRagError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A single indexed snippet of the financial corpus.
///
/// `embed_text` is what gets embedded. `response` is carried alongside for the
/// agent to read, but never influences the vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub embed_text: String,
    pub topic: String,
    pub response: String,
    pub prompt_snippet: String,
}

/// Summary of what the store currently holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

/// Manages the SQLite database holding document rows and their metadata.
///
/// Each row owns an integer `item_id` which doubles as the arroy item id of
/// its vector, and a unique string `doc_id` used for idempotent re-ingestion.
pub struct Storage {
    db_path: PathBuf,
}

const SELECT_COLUMNS: &str = "item_id, doc_id, embed_text, topic, response, full_prompt";

impl Storage {
    pub fn new(db_path: &Path) -> Result<Self, FinRagError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let storage = Self { db_path: db_path.to_path_buf() };
        storage.initialize_db()?;
        Ok(storage)
    }

    fn get_conn(&self) -> Result<Connection, FinRagError> {
        Connection::open(&self.db_path).map_err(Into::into)
    }

    fn initialize_db(&self) -> Result<(), FinRagError> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                item_id INTEGER PRIMARY KEY,
                doc_id TEXT NOT NULL UNIQUE,
                embed_text TEXT NOT NULL,
                topic TEXT NOT NULL,
                response TEXT NOT NULL,
                full_prompt TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            CREATE INDEX IF NOT EXISTS documents_topic_idx ON documents(topic);",
        )?;
        Ok(())
    }

    /// Inserts or replaces a batch of records inside one transaction and
    /// returns the item id of each record, in input order. Re-inserting an
    /// existing `doc_id` keeps its item id.
    pub fn upsert_records(&self, records: &[DocumentRecord]) -> Result<Vec<u32>, FinRagError> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut item_ids = Vec::with_capacity(records.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO documents (doc_id, embed_text, topic, response, full_prompt)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(doc_id) DO UPDATE SET
                    embed_text = excluded.embed_text,
                    topic = excluded.topic,
                    response = excluded.response,
                    full_prompt = excluded.full_prompt
                 RETURNING item_id",
            )?;
            for record in records {
                let item_id: i64 = stmt.query_row(
                    params![
                        record.id,
                        record.embed_text,
                        record.topic,
                        record.response,
                        record.prompt_snippet
                    ],
                    |row| row.get(0),
                )?;
                let item_id = u32::try_from(item_id).map_err(|_| {
                    FinRagError::Retrieval(format!("item id {} exceeds the index range", item_id))
                })?;
                item_ids.push(item_id);
            }
        }
        tx.commit()?;
        Ok(item_ids)
    }

    pub fn get_record(&self, doc_id: &str) -> Result<Option<DocumentRecord>, FinRagError> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM documents WHERE doc_id = ?1", SELECT_COLUMNS);
        let record = conn
            .query_row(&sql, params![doc_id], |row| row_to_record(row).map(|(_, r)| r))
            .optional()?;
        Ok(record)
    }

    /// Fetches records by item id, keyed by item id. Unknown ids are absent.
    pub fn records_by_item_id(
            &self,
            item_ids: &[u32],
        ) -> Result<HashMap<u32, DocumentRecord>, FinRagError> {
        let mut by_id = HashMap::with_capacity(item_ids.len());
        if item_ids.is_empty() {
            return Ok(by_id);
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; item_ids.len()].join(",");
        let sql = format!(
            "SELECT {} FROM documents WHERE item_id IN ({})",
            SELECT_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(item_ids.iter()), row_to_record)?;
        for row in rows {
            let (item_id, record) = row?;
            by_id.insert(item_id, record);
        }
        Ok(by_id)
    }

    /// Item ids of every row whose topic equals `topic` exactly.
    pub fn item_ids_for_topic(&self, topic: &str) -> Result<Vec<u32>, FinRagError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT item_id FROM documents WHERE topic = ?1")?;
        let rows = stmt.query_map(params![topic], |row| row.get::<_, u32>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Retrieves all distinct topics, sorted.
    pub fn distinct_topics(&self) -> Result<Vec<String>, FinRagError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT topic FROM documents ORDER BY topic")?;
        let mut rows = stmt.query([])?;
        let mut topics = Vec::new();
        while let Some(row) = rows.next()? {
            topics.push(row.get(0)?);
        }
        Ok(topics)
    }

    pub fn count(&self) -> Result<usize, FinRagError> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn stats(&self) -> Result<StoreStats, FinRagError> {
        let conn = self.get_conn()?;
        let (count, last): (i64, Option<String>) = conn.query_row(
            "SELECT COUNT(*), MAX(created_at) FROM documents",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let last_indexed_at = last
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        Ok(StoreStats { documents: count as usize, last_indexed_at })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(u32, DocumentRecord)> {
    Ok((
        row.get(0)?,
        DocumentRecord {
            id: row.get(1)?,
            embed_text: row.get(2)?,
            topic: row.get(3)?,
            response: row.get(4)?,
            prompt_snippet: row.get(5)?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, topic: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            embed_text: format!("Prompt: {}\nScratchpad: ", id),
            topic: topic.to_string(),
            response: "answer".to_string(),
            prompt_snippet: id.to_string(),
        }
    }

    #[test]
    fn upsert_keeps_item_ids_stable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("documents.sqlite3")).unwrap();

        let first = storage.upsert_records(&[record("doc_0", "Corporate Finance")]).unwrap();
        let mut changed = record("doc_0", "Corporate Finance");
        changed.response = "revised".to_string();
        let second = storage.upsert_records(&[changed]).unwrap();

        assert_eq!(first, second);
        assert_eq!(storage.count().unwrap(), 1);
        assert_eq!(storage.get_record("doc_0").unwrap().unwrap().response, "revised");
    }

    #[test]
    fn lookups_by_item_id_and_topic() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(&dir.path().join("documents.sqlite3")).unwrap();
        let ids = storage
            .upsert_records(&[record("doc_0", "A"), record("doc_1", "B"), record("doc_2", "A")])
            .unwrap();

        let records = storage.records_by_item_id(&[ids[2], ids[0], 9_999]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[&ids[2]].id, "doc_2");
        assert_eq!(records[&ids[0]].id, "doc_0");

        assert_eq!(storage.item_ids_for_topic("A").unwrap().len(), 2);
        assert_eq!(storage.distinct_topics().unwrap(), vec!["A", "B"]);
        assert!(storage.stats().unwrap().last_indexed_at.is_some());
    }
}
