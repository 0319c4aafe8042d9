//! Long-term memory store.
//!
//! A single `memories` table in an embedded SQLite file under the per-user
//! configuration directory. Records carry an optional embedding vector;
//! a record without one is stored but never returned by similarity search.
//! Search is brute-force cosine over the embedded rows, refined by the
//! rerank endpoint when it is available.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use sable_llm::EmbeddingClient;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Cosine floor applied before rerank.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.7;

/// Top-k candidate pool handed to the reranker.
const CANDIDATE_POOL: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Preference,
    Mistake,
    Knowledge,
    TaskContext,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Mistake => "mistake",
            Self::Knowledge => "knowledge",
            Self::TaskContext => "task_context",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "preference" => Some(Self::Preference),
            "mistake" => Some(Self::Mistake),
            "knowledge" => Some(Self::Knowledge),
            "task_context" => Some(Self::TaskContext),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Memory {
    pub id: Uuid,
    pub content: String,
    pub kind: MemoryKind,
    pub metadata: Value,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub memory: Memory,
    pub score: f32,
}

pub struct MemoryStore {
    conn: Mutex<Connection>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl MemoryStore {
    /// Open (creating on first use) the store at an explicit path.
    pub fn open(path: &Path, embedder: Arc<dyn EmbeddingClient>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                type TEXT NOT NULL,
                metadata TEXT NOT NULL,
                embedding TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            embedder,
        })
    }

    /// Open `~/.sable/memory.db`.
    pub fn open_default(embedder: Arc<dyn EmbeddingClient>) -> Result<Self> {
        let dir = sable_core::global_dir()
            .ok_or_else(|| anyhow!("HOME/USERPROFILE is not set; cannot locate memory store"))?;
        Self::open(&dir.join("memory.db"), embedder)
    }

    /// Persist a new memory. An embedding failure is logged and the record
    /// is stored with an empty vector (excluded from similarity search).
    pub fn remember(&self, content: &str, kind: MemoryKind, metadata: Value) -> Result<Memory> {
        let embedding = match self.embedder.embed(&[content.to_string()]) {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => Vec::new(),
            Err(err) => {
                eprintln!("[sable WARN] embedding failed, storing without vector: {err}");
                Vec::new()
            }
        };

        let now = Utc::now();
        let memory = Memory {
            id: Uuid::new_v4(),
            content: content.to_string(),
            kind,
            metadata,
            embedding,
            created_at: now,
            updated_at: now,
        };

        self.conn.lock().expect("memory store poisoned").execute(
            "INSERT INTO memories (id, content, type, metadata, embedding, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                memory.id.to_string(),
                memory.content,
                memory.kind.as_str(),
                memory.metadata.to_string(),
                serde_json::to_string(&memory.embedding)?,
                memory.created_at.to_rfc3339(),
                memory.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(memory)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Memory>> {
        let conn = self.conn.lock().expect("memory store poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, content, type, metadata, embedding, created_at, updated_at
             FROM memories WHERE id = ?1",
        )?;
        let row = stmt.query_row([id.to_string()], row_to_memory);
        match row {
            Ok(memory) => Ok(Some(memory)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn forget(&self, id: Uuid) -> Result<bool> {
        let removed = self
            .conn
            .lock()
            .expect("memory store poisoned")
            .execute("DELETE FROM memories WHERE id = ?1", [id.to_string()])?;
        Ok(removed > 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn
            .lock()
            .expect("memory store poisoned")
            .execute("DELETE FROM memories", [])?;
        Ok(())
    }

    /// Semantic search. Cosine over embedded rows filtered by
    /// `min_similarity`, top candidates optionally reordered by the rerank
    /// endpoint; rerank failure falls back to cosine order.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<SearchResult>> {
        let query_vec = match self.embedder.embed(&[query.to_string()]) {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            _ => return Ok(Vec::new()),
        };

        let embedded = self.load_embedded()?;
        let mut candidates: Vec<SearchResult> = embedded
            .into_iter()
            .map(|memory| {
                let score = cosine_similarity(&query_vec, &memory.embedding);
                SearchResult { memory, score }
            })
            .filter(|result| result.score >= min_similarity)
            .collect();
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(CANDIDATE_POOL);

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let documents: Vec<String> = candidates
            .iter()
            .map(|result| result.memory.content.clone())
            .collect();
        match self.embedder.rerank(query, &documents, limit) {
            Ok(entries) => {
                let mut reranked = Vec::with_capacity(limit.min(entries.len()));
                for entry in entries {
                    if let Some(candidate) = candidates.get(entry.index) {
                        reranked.push(SearchResult {
                            memory: candidate.memory.clone(),
                            score: entry.score,
                        });
                    }
                }
                reranked.truncate(limit);
                Ok(reranked)
            }
            Err(_) => {
                candidates.truncate(limit);
                Ok(candidates)
            }
        }
    }

    fn load_embedded(&self) -> Result<Vec<Memory>> {
        let conn = self.conn.lock().expect("memory store poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, content, type, metadata, embedding, created_at, updated_at
             FROM memories WHERE embedding != '[]'",
        )?;
        let rows = stmt.query_map([], row_to_memory)?;
        let mut out = Vec::new();
        for row in rows {
            let memory = row?;
            if !memory.embedding.is_empty() {
                out.push(memory);
            }
        }
        Ok(out)
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let id: String = row.get(0)?;
    let kind: String = row.get(2)?;
    let metadata: String = row.get(3)?;
    let embedding: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Memory {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        content: row.get(1)?,
        kind: MemoryKind::parse(&kind).unwrap_or(MemoryKind::Knowledge),
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        embedding: serde_json::from_str(&embedding).unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

/// Cosine similarity with the degenerate cases pinned to 0: zero-norm
/// vectors and differing dimensions never produce NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_llm::RerankEntry;
    use serde_json::json;
    use std::collections::HashMap;

    /// Deterministic embedder: fixed vectors per known text, a fallback
    /// vector otherwise; embed/rerank can be scripted to fail.
    struct StubEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        fail_embed: bool,
        fail_rerank: bool,
        rerank_entries: Option<Vec<RerankEntry>>,
    }

    impl StubEmbedder {
        fn new(vectors: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: vectors
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                fail_embed: false,
                fail_rerank: true,
                rerank_entries: None,
            }
        }
    }

    impl EmbeddingClient for StubEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.fail_embed {
                return Err(anyhow!("embeddings endpoint unavailable"));
            }
            Ok(texts
                .iter()
                .map(|text| {
                    self.vectors
                        .get(text)
                        .cloned()
                        .unwrap_or_else(|| vec![0.1, 0.1, 0.1])
                })
                .collect())
        }

        fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
            _top_n: usize,
        ) -> Result<Vec<RerankEntry>> {
            if self.fail_rerank {
                return Err(anyhow!("rerank endpoint unavailable"));
            }
            Ok(self.rerank_entries.clone().unwrap_or_default())
        }
    }

    fn store_with(embedder: StubEmbedder) -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            MemoryStore::open(&dir.path().join("memory.db"), Arc::new(embedder)).expect("open");
        (dir, store)
    }

    #[test]
    fn remember_and_get_round_trip() {
        let (_dir, store) = store_with(StubEmbedder::new(&[("prefer tabs", vec![1.0, 0.0, 0.0])]));
        let memory = store
            .remember("prefer tabs", MemoryKind::Preference, json!({"scope": "rust"}))
            .expect("remember");

        let loaded = store.get(memory.id).expect("get").expect("present");
        assert_eq!(loaded.content, "prefer tabs");
        assert_eq!(loaded.kind, MemoryKind::Preference);
        assert_eq!(loaded.metadata["scope"], "rust");
        assert_eq!(loaded.embedding, vec![1.0, 0.0, 0.0]);
        assert_eq!(loaded.created_at, loaded.updated_at);
    }

    #[test]
    fn embedding_failure_persists_record_without_vector() {
        let mut embedder = StubEmbedder::new(&[]);
        embedder.fail_embed = true;
        let (_dir, store) = store_with(embedder);

        let memory = store
            .remember("unembedded fact", MemoryKind::Knowledge, Value::Null)
            .expect("remember must still persist");
        assert!(memory.embedding.is_empty());
        assert!(store.get(memory.id).expect("get").is_some());
    }

    #[test]
    fn records_without_vectors_are_invisible_to_search() {
        let mut embedder = StubEmbedder::new(&[("query", vec![1.0, 0.0, 0.0])]);
        embedder.fail_embed = false;
        let (_dir, store) = store_with(embedder);

        // Stored with the fallback vector, then one stored with no vector
        // by clearing it via a failing embedder path is hard to script in
        // one store; emulate by inserting with empty embedding directly.
        store
            .remember("embedded", MemoryKind::Knowledge, Value::Null)
            .expect("remember");
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO memories VALUES ('00000000-0000-0000-0000-000000000001',
                 'bare', 'knowledge', 'null', '[]', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )
            .expect("insert bare");

        let results = store.search("query", 10, 0.0).expect("search");
        assert!(results.iter().all(|r| r.memory.content != "bare"));
    }

    #[test]
    fn search_orders_by_cosine_and_applies_floor() {
        let (_dir, store) = store_with(StubEmbedder::new(&[
            ("close", vec![1.0, 0.0, 0.0]),
            ("near", vec![0.9, 0.1, 0.0]),
            ("far", vec![0.0, 1.0, 0.0]),
            ("the query", vec![1.0, 0.0, 0.0]),
        ]));
        for content in ["close", "near", "far"] {
            store
                .remember(content, MemoryKind::Knowledge, Value::Null)
                .expect("remember");
        }

        let results = store.search("the query", 10, 0.7).expect("search");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].memory.content, "close");
        assert_eq!(results[1].memory.content, "near");
        assert!(results[0].score >= results[1].score);
        assert!(results.iter().all(|r| r.score >= 0.7));
    }

    #[test]
    fn deterministic_embedding_returns_self_with_near_unit_score() {
        let (_dir, store) = store_with(StubEmbedder::new(&[(
            "prefer tabs",
            vec![0.4, 0.2, 0.9],
        )]));
        store
            .remember("prefer tabs", MemoryKind::Preference, Value::Null)
            .expect("remember");
        let results = store.search("prefer tabs", 5, 0.7).expect("search");
        assert_eq!(results.len(), 1);
        assert!(results[0].score >= 0.99);
    }

    #[test]
    fn rerank_failure_falls_back_to_cosine_order() {
        // Scenario: remember a preference; rerank endpoint raises; the
        // record must still come back within the top-limit by cosine.
        let (_dir, store) = store_with(StubEmbedder::new(&[
            ("prefer tabs", vec![1.0, 0.0, 0.0]),
            ("indentation style", vec![0.95, 0.05, 0.0]),
        ]));
        store
            .remember("prefer tabs", MemoryKind::Preference, Value::Null)
            .expect("remember");

        let results = store.search("indentation style", 3, 0.7).expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content, "prefer tabs");
    }

    #[test]
    fn rerank_scores_replace_cosine_and_reorder() {
        let mut embedder = StubEmbedder::new(&[
            ("alpha", vec![1.0, 0.0, 0.0]),
            ("beta", vec![0.9, 0.1, 0.0]),
            ("q", vec![1.0, 0.0, 0.0]),
        ]);
        embedder.fail_rerank = false;
        // Reranker prefers the cosine runner-up.
        embedder.rerank_entries = Some(vec![
            RerankEntry { index: 1, score: 0.99 },
            RerankEntry { index: 0, score: 0.42 },
        ]);
        let (_dir, store) = store_with(embedder);
        for content in ["alpha", "beta"] {
            store
                .remember(content, MemoryKind::Knowledge, Value::Null)
                .expect("remember");
        }

        let results = store.search("q", 5, 0.5).expect("search");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].memory.content, "beta");
        assert!((results[0].score - 0.99).abs() < f32::EPSILON);
        assert_eq!(results[1].memory.content, "alpha");
    }

    #[test]
    fn query_embedding_failure_returns_empty() {
        let mut embedder = StubEmbedder::new(&[]);
        embedder.fail_embed = true;
        let (_dir, store) = store_with(embedder);
        let results = store.search("anything", 5, 0.0).expect("search");
        assert!(results.is_empty());
    }

    #[test]
    fn forget_and_clear_remove_records() {
        let (_dir, store) = store_with(StubEmbedder::new(&[]));
        let memory = store
            .remember("transient", MemoryKind::TaskContext, Value::Null)
            .expect("remember");
        assert!(store.forget(memory.id).expect("forget"));
        assert!(!store.forget(memory.id).expect("forget again"));

        store
            .remember("another", MemoryKind::Knowledge, Value::Null)
            .expect("remember");
        store.clear().expect("clear");
        let results = store.search("another", 5, 0.0).expect("search");
        assert!(results.is_empty());
    }

    #[test]
    fn cosine_degenerate_cases_are_zero_not_nan() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        let value = cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]);
        assert!(!value.is_nan());
        assert_eq!(value, 0.0);
    }
}
