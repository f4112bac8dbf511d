use std::fs;
use std::path::{Path, PathBuf};

use arroy::distances::Cosine;
use arroy::{Database, Reader, Writer};
use heed::{Env, EnvOpenOptions};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use roaring::RoaringBitmap;
use serde::Serialize;

use crate::config::storage::{DocumentRecord, Storage, StoreStats};
use crate::error::FinRagError;

const DOCUMENTS_FILE: &str = "documents.sqlite3";
const ANN_DIR: &str = "ann";
const INDEX: u16 = 0;
const MAP_SIZE: usize = 256 * 1024 * 1024;
const BUILD_SEED: u64 = 42;

/// A record returned by a similarity search, closest first.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedSnippet {
    pub record: DocumentRecord,
    /// Cosine distance to the query; smaller is closer.
    pub distance: f32,
}

/// A persistent collection: document rows in SQLite, their vectors in an
/// arroy forest stored in LMDB. The SQLite `item_id` is the arroy item id.
pub struct VectorIndex {
    dir: PathBuf,
    env: Env,
    db: Database<Cosine>,
    storage: Storage,
    dimensions: usize,
}

impl VectorIndex {
    /// Whether a collection has been created under `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(DOCUMENTS_FILE).is_file() && dir.join(ANN_DIR).is_dir()
    }

    /// Opens the collection under `dir`, creating it when absent.
    pub fn open(dir: &Path, dimensions: usize) -> Result<Self, FinRagError> {
        let ann_dir = dir.join(ANN_DIR);
        fs::create_dir_all(&ann_dir)?;

        // SAFETY: the environment is opened once per collection directory and
        // the file is never modified by anything but this process.
        let env = unsafe { EnvOpenOptions::new().map_size(MAP_SIZE).open(&ann_dir)? };
        let mut wtxn = env.write_txn()?;
        let db: Database<Cosine> = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;

        let storage = Storage::new(&dir.join(DOCUMENTS_FILE))?;
        debug!("Opened collection at {}", dir.display());
        Ok(Self { dir: dir.to_path_buf(), env, db, storage, dimensions })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Writes a batch of records and their vectors. Records whose id is
    /// already present overwrite the previous row and vector. The forest is
    /// not rebuilt; call [`VectorIndex::build`] once all batches are in.
    pub fn upsert(
            &self,
            records: &[DocumentRecord],
            vectors: &[Vec<f32>],
        ) -> Result<usize, FinRagError> {
        if records.len() != vectors.len() {
            return Err(FinRagError::Retrieval(format!(
                "{} records but {} vectors",
                records.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(FinRagError::Retrieval(format!(
                "vector has {} dimensions, index expects {}",
                bad.len(),
                self.dimensions
            )));
        }
        if records.is_empty() {
            return Ok(0);
        }

        let item_ids = self.storage.upsert_records(records)?;

        let mut wtxn = self.env.write_txn()?;
        let writer = Writer::<Cosine>::new(self.db, INDEX, self.dimensions);
        for (item_id, vector) in item_ids.iter().zip(vectors) {
            writer.add_item(&mut wtxn, *item_id, vector)?;
        }
        wtxn.commit()?;

        Ok(item_ids.len())
    }

    /// Rebuilds the ANN forest over every stored vector.
    pub fn build(&self) -> Result<(), FinRagError> {
        if self.storage.count()? == 0 {
            debug!("Skipping forest build for empty collection");
            return Ok(());
        }
        let mut wtxn = self.env.write_txn()?;
        let writer = Writer::<Cosine>::new(self.db, INDEX, self.dimensions);
        let mut rng = StdRng::seed_from_u64(BUILD_SEED);
        writer.builder(&mut rng).build(&mut wtxn)?;
        wtxn.commit()?;
        info!("Built vector forest for {}", self.dir.display());
        Ok(())
    }

    /// Returns up to `n` records nearest to `vector`. With a topic, only
    /// records whose topic matches exactly are candidates.
    pub fn search(
            &self,
            vector: &[f32],
            n: usize,
            topic: Option<&str>,
        ) -> Result<Vec<RetrievedSnippet>, FinRagError> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let candidates = match topic {
            Some(topic) => {
                let ids = self.storage.item_ids_for_topic(topic)?;
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                Some(ids.into_iter().collect::<RoaringBitmap>())
            }
            None => None,
        };

        let rtxn = self.env.read_txn()?;
        let reader = Reader::<Cosine>::open(&rtxn, INDEX, self.db)?;
        let mut query = reader.nns(n);
        if let Some(candidates) = candidates.as_ref() {
            query.candidates(candidates);
        }
        let hits = query.by_vector(&rtxn, vector)?;

        let item_ids: Vec<u32> = hits.iter().map(|(id, _)| *id).collect();
        let mut rows = self.storage.records_by_item_id(&item_ids)?;

        // A hit without a row (vector written, row rolled back) is dropped.
        Ok(hits
            .into_iter()
            .filter_map(|(item_id, distance)| {
                rows.remove(&item_id).map(|record| RetrievedSnippet { record, distance })
            })
            .collect())
    }

    pub fn count(&self) -> Result<usize, FinRagError> {
        self.storage.count()
    }

    /// Distinct topics of the stored records, sorted.
    pub fn topics(&self) -> Result<Vec<String>, FinRagError> {
        self.storage.distinct_topics()
    }

    pub fn stats(&self) -> Result<StoreStats, FinRagError> {
        self.storage.stats()
    }

    /// Flushes the LMDB environment and waits for it to be released.
    pub fn close(self) -> Result<(), FinRagError> {
        self.env.force_sync()?;
        self.env.prepare_for_closing().wait();
        debug!("Closed collection at {}", self.dir.display());
        Ok(())
    }

    /// Closes the collection and removes it from disk.
    pub fn destroy(self) -> Result<(), FinRagError> {
        let dir = self.dir.clone();
        self.close()?;
        fs::remove_dir_all(&dir)?;
        info!("Removed collection at {}", dir.display());
        Ok(())
    }
}
