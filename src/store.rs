// Copyright 2026 Ragkit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Persistent vector index.
//!
//! Entries live in SQLite and are mirrored in memory for scoring. Writers
//! hold the in-memory write lock across the SQLite transaction and the
//! in-memory update, so concurrent `retrieve` calls observe either the state
//! before a write or the state after it, and a write is durable before it
//! returns.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;
use std::time::Instant;

use fs2::FileExt;
use parking_lot::Mutex;
use parking_lot::RwLock;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;

use crate::embed::cosine_similarity;
use crate::embed::from_bytes;
use crate::embed::to_bytes;
use crate::error::RagError;
use crate::error::Result;
use crate::model::IndexEntry;
use crate::model::ScoredEntry;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    ReadOnly,
    ReadWrite,
}

/// Model and dimension every vector in one index shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingSignature {
    pub model: String,
    pub dim: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub entry_count: usize,
    pub document_count: usize,
    pub embedding: Option<EmbeddingSignature>,
    pub db_size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
}

struct StoredEntry {
    seq: i64,
    entry: IndexEntry,
}

#[derive(Default)]
struct IndexState {
    /// Ascending `seq`, i.e. insertion order.
    entries: Vec<StoredEntry>,
    positions: HashMap<String, usize>,
    signature: Option<EmbeddingSignature>,
}

impl IndexState {
    fn reindex(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, stored)| (stored.entry.chunk_id.clone(), i))
            .collect();
    }
}

enum WriteScope<'a> {
    Document(&'a str),
    All,
}

/// Holds the advisory lock until dropped. The lock file itself stays on
/// disk so every process contends on the same inode.
struct StoreLock {
    _file: File,
}

pub struct VectorIndex {
    conn: Mutex<Connection>,
    state: RwLock<IndexState>,
    path: PathBuf,
    mode: StoreMode,
    _lock: StoreLock,
}

impl VectorIndex {
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(RagError::Index(format!(
                "index already exists at {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let _lock = acquire_lock(path, StoreMode::ReadWrite)?;
        let conn = open_connection(path, StoreMode::ReadWrite)?;
        apply_pragmas(&conn, StoreMode::ReadWrite)?;
        create_schema(&conn)?;
        set_meta(&conn, "schema_version", &SCHEMA_VERSION.to_string())?;
        info!(path = %path.display(), "initialized vector index");
        Ok(())
    }

    pub fn open(path: &Path, mode: StoreMode) -> Result<Self> {
        if !path.exists() {
            return Err(RagError::Index(format!(
                "index not found at {}; run `ragkit init` first",
                path.display()
            )));
        }
        let lock = acquire_lock(path, mode)?;
        let conn = open_connection(path, mode)?;
        apply_pragmas(&conn, mode)?;
        if mode == StoreMode::ReadWrite {
            create_schema(&conn)?;
        }
        let version = schema_version(&conn)?;
        if version != SCHEMA_VERSION {
            return Err(RagError::Index(format!(
                "index schema version {version} is not supported (expected {SCHEMA_VERSION})"
            )));
        }

        let mut state = IndexState {
            entries: load_entries(&conn)?,
            signature: load_signature(&conn)?,
            ..Default::default()
        };
        state.reindex();
        debug!(path = %path.display(), entries = state.entries.len(), "opened vector index");

        Ok(Self {
            conn: Mutex::new(conn),
            state: RwLock::new(state),
            path: path.to_path_buf(),
            mode,
            _lock: lock,
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn signature(&self) -> Option<EmbeddingSignature> {
        self.state.read().signature.clone()
    }

    /// Rejects queries embedded with a model other than the index's.
    pub fn check_query_model(&self, model: &str) -> Result<()> {
        match self.signature() {
            Some(existing) if existing.model != model => Err(RagError::Index(format!(
                "index was built with {}, queries use {}; rebuild with `ragkit index --rebuild`",
                existing.model, model
            ))),
            _ => Ok(()),
        }
    }

    /// Upserts `entries` by `chunk_id` and drops the document's entries not
    /// among them. A replaced entry keeps its original insertion position.
    pub fn replace_document(
        &self,
        document_id: &str,
        entries: &[IndexEntry],
        signature: &EmbeddingSignature,
    ) -> Result<UpsertReport> {
        self.write(WriteScope::Document(document_id), entries, signature)
    }

    /// Replaces every entry and the embedding signature with `entries` and
    /// `signature` in one transaction.
    pub fn rebuild(
        &self,
        entries: &[IndexEntry],
        signature: &EmbeddingSignature,
    ) -> Result<UpsertReport> {
        self.write(WriteScope::All, entries, signature)
    }

    fn write(
        &self,
        scope: WriteScope<'_>,
        entries: &[IndexEntry],
        signature: &EmbeddingSignature,
    ) -> Result<UpsertReport> {
        self.ensure_writable()?;
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != signature.dim) {
            return Err(RagError::Index(format!(
                "entry {} has dimension {}, expected {}",
                bad.chunk_id,
                bad.embedding.len(),
                signature.dim
            )));
        }

        let mut state = self.state.write();
        let rebuild = matches!(scope, WriteScope::All);
        if !rebuild
            && let Some(existing) = &state.signature
            && existing != signature
        {
            return Err(RagError::Index(format!(
                "index was built with {} (dim {}), not {} (dim {}); rebuild with `ragkit index --rebuild`",
                existing.model, existing.dim, signature.model, signature.dim
            )));
        }

        let keep: HashSet<&str> = entries.iter().map(|e| e.chunk_id.as_str()).collect();
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|s| !keep.contains(s.entry.chunk_id.as_str()))
            .filter(|s| match scope {
                WriteScope::Document(doc) => s.entry.document_id == doc,
                WriteScope::All => true,
            })
            .map(|s| s.entry.chunk_id.clone())
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if rebuild {
            tx.execute("DELETE FROM entry", [])?;
        } else {
            for chunk_id in &stale {
                tx.execute("DELETE FROM entry WHERE chunk_id = ?1", params![chunk_id])?;
            }
        }
        if rebuild || state.signature.is_none() {
            set_meta(&tx, "embedding_model", &signature.model)?;
            set_meta(&tx, "embedding_dim", &signature.dim.to_string())?;
        }
        let mut seqs = Vec::with_capacity(entries.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO entry (chunk_id, document_id, source_path, start_offset, end_offset, text, metadata, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                   document_id = excluded.document_id,
                   source_path = excluded.source_path,
                   start_offset = excluded.start_offset,
                   end_offset = excluded.end_offset,
                   text = excluded.text,
                   metadata = excluded.metadata,
                   embedding = excluded.embedding
                 RETURNING seq",
            )?;
            for entry in entries {
                let metadata = serde_json::to_string(&entry.metadata)?;
                let seq: i64 = stmt.query_row(
                    params![
                        entry.chunk_id,
                        entry.document_id,
                        entry.source_path,
                        entry.start_offset as i64,
                        entry.end_offset as i64,
                        entry.chunk_text,
                        metadata,
                        to_bytes(&entry.embedding),
                    ],
                    |row| row.get(0),
                )?;
                seqs.push(seq);
            }
        }
        tx.commit()?;
        drop(conn);

        let mut report = UpsertReport {
            removed: stale.len(),
            ..Default::default()
        };
        if rebuild {
            *state = IndexState::default();
        } else if !stale.is_empty() {
            let stale: HashSet<&str> = stale.iter().map(String::as_str).collect();
            state
                .entries
                .retain(|s| !stale.contains(s.entry.chunk_id.as_str()));
            state.reindex();
        }
        for (entry, seq) in entries.iter().zip(seqs) {
            match state.positions.get(&entry.chunk_id).copied() {
                Some(pos) => {
                    state.entries[pos].entry = entry.clone();
                    report.updated += 1;
                }
                None => {
                    let pos = state.entries.len();
                    state.entries.push(StoredEntry {
                        seq,
                        entry: entry.clone(),
                    });
                    state.positions.insert(entry.chunk_id.clone(), pos);
                    report.inserted += 1;
                }
            }
        }
        if state.signature.is_none() {
            state.signature = Some(signature.clone());
        }
        debug!(
            inserted = report.inserted,
            updated = report.updated,
            removed = report.removed,
            "index write committed"
        );
        Ok(report)
    }

    /// Removes every entry and the embedding signature.
    pub fn clear(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut state = self.state.write();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM entry", [])?;
        tx.execute(
            "DELETE FROM meta WHERE key IN ('embedding_model', 'embedding_dim')",
            [],
        )?;
        tx.commit()?;
        *state = IndexState::default();
        info!(path = %self.path.display(), "cleared vector index");
        Ok(())
    }

    /// Entries with cosine similarity `>= min_score`, best first, ties in
    /// insertion order, at most `top_k`.
    pub fn retrieve(&self, query: &[f32], top_k: usize, min_score: f32) -> Result<Vec<ScoredEntry>> {
        let state = self.state.read();
        if state.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if let Some(signature) = &state.signature
            && signature.dim != query.len()
        {
            return Err(RagError::Index(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                signature.dim
            )));
        }

        let mut scored: Vec<(f32, i64, &IndexEntry)> = state
            .entries
            .iter()
            .map(|s| (cosine_similarity(query, &s.entry.embedding), s.seq, &s.entry))
            .filter(|(score, _, _)| *score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, _, entry)| ScoredEntry {
                score,
                entry: entry.clone(),
            })
            .collect())
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        let documents: BTreeSet<&str> = state
            .entries
            .iter()
            .map(|s| s.entry.document_id.as_str())
            .collect();
        IndexStats {
            entry_count: state.entries.len(),
            document_count: documents.len(),
            embedding: state.signature.clone(),
            db_size_bytes: fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == StoreMode::ReadOnly {
            return Err(RagError::Index(format!(
                "index {} is open read-only",
                self.path.display()
            )));
        }
        Ok(())
    }
}

fn open_connection(path: &Path, mode: StoreMode) -> Result<Connection> {
    let flags = match mode {
        StoreMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
        StoreMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection, mode: StoreMode) -> Result<()> {
    if mode == StoreMode::ReadWrite {
        conn.execute_batch("PRAGMA journal_mode=DELETE;\nPRAGMA synchronous=FULL;")?;
    }
    Ok(())
}

fn lock_path_for(path: &Path) -> Result<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = parent.canonicalize().unwrap_or(parent);
    let file_name = path.file_name().unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(parent.join(file_name).to_string_lossy().as_bytes());
    let hash = hex::encode(hasher.finalize());
    let mut dir = std::env::temp_dir();
    dir.push("ragkit");
    fs::create_dir_all(&dir)?;
    Ok(dir.join(format!("ragkit-{hash}.lock")))
}

fn acquire_lock(path: &Path, mode: StoreMode) -> Result<StoreLock> {
    let lock_path = lock_path_for(path)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    let deadline = Instant::now() + Duration::from_millis(5000);
    loop {
        let locked = match mode {
            StoreMode::ReadOnly => FileExt::try_lock_shared(&file),
            StoreMode::ReadWrite => FileExt::try_lock_exclusive(&file),
        };
        match locked {
            Ok(()) => {
                return Ok(StoreLock { _file: file });
            }
            Err(_) if Instant::now() >= deadline => {
                let mode_label = match mode {
                    StoreMode::ReadOnly => "read",
                    StoreMode::ReadWrite => "write",
                };
                return Err(RagError::Index(format!(
                    "index is locked for {mode_label} access; another process may be using {}",
                    path.display()
                )));
            }
            Err(_) => sleep(Duration::from_millis(50)),
        }
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT
);

CREATE TABLE IF NOT EXISTS entry (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  chunk_id TEXT NOT NULL UNIQUE,
  document_id TEXT NOT NULL,
  source_path TEXT NOT NULL,
  start_offset INTEGER NOT NULL,
  end_offset INTEGER NOT NULL,
  text TEXT NOT NULL,
  metadata TEXT NOT NULL,
  embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entry_document ON entry(document_id);",
    )?;
    Ok(())
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

fn schema_version(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='meta'",
        [],
        |row| row.get(0),
    )?;
    if count == 0 {
        return Ok(0);
    }
    Ok(get_meta(conn, "schema_version")?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0))
}

fn load_signature(conn: &Connection) -> Result<Option<EmbeddingSignature>> {
    let model = get_meta(conn, "embedding_model")?;
    let dim = get_meta(conn, "embedding_dim")?.and_then(|v| v.parse::<usize>().ok());
    Ok(match (model, dim) {
        (Some(model), Some(dim)) => Some(EmbeddingSignature { model, dim }),
        _ => None,
    })
}

fn load_entries(conn: &Connection) -> Result<Vec<StoredEntry>> {
    let mut stmt = conn.prepare(
        "SELECT seq, chunk_id, document_id, source_path, start_offset, end_offset, text, metadata, embedding
         FROM entry ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let metadata: String = row.get(7)?;
        let embedding: Vec<u8> = row.get(8)?;
        Ok((
            row.get::<_, i64>(0)?,
            IndexEntry {
                chunk_id: row.get(1)?,
                document_id: row.get(2)?,
                source_path: row.get(3)?,
                start_offset: row.get::<_, i64>(4)? as usize,
                end_offset: row.get::<_, i64>(5)? as usize,
                chunk_text: row.get(6)?,
                metadata: BTreeMap::new(),
                embedding: from_bytes(&embedding),
            },
            metadata,
        ))
    })?;
    let mut entries = Vec::new();
    for row in rows {
        let (seq, mut entry, metadata) = row?;
        entry.metadata = serde_json::from_str(&metadata)?;
        entries.push(StoredEntry { seq, entry });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    fn signature(dim: usize) -> EmbeddingSignature {
        EmbeddingSignature {
            model: "test".to_string(),
            dim,
        }
    }

    fn entry(chunk_id: &str, document_id: &str, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            source_path: format!("{document_id}.txt"),
            start_offset: 0,
            end_offset: 4,
            chunk_text: format!("text of {chunk_id}"),
            metadata: BTreeMap::from([("format".to_string(), "txt".to_string())]),
            embedding,
        }
    }

    /// Writes `entries` one document at a time.
    fn put(index: &VectorIndex, entries: &[IndexEntry]) -> Result<UpsertReport> {
        let mut total = UpsertReport::default();
        let mut documents: Vec<&str> = entries.iter().map(|e| e.document_id.as_str()).collect();
        documents.dedup();
        for document in documents {
            let batch: Vec<IndexEntry> = entries
                .iter()
                .filter(|e| e.document_id == document)
                .cloned()
                .collect();
            let report = index.replace_document(document, &batch, &signature(2))?;
            total.inserted += report.inserted;
            total.updated += report.updated;
            total.removed += report.removed;
        }
        Ok(total)
    }

    fn fresh(dir: &Path) -> Result<VectorIndex> {
        let path = dir.join("ragkit.db");
        VectorIndex::init(&path)?;
        VectorIndex::open(&path, StoreMode::ReadWrite)
    }

    #[test]
    fn shared_lock_allows_multiple_readers() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ragkit.db");
        VectorIndex::init(&path)?;

        let a = VectorIndex::open(&path, StoreMode::ReadOnly)?;
        let b = VectorIndex::open(&path, StoreMode::ReadOnly)?;
        assert_eq!(a.stats().entry_count, 0);
        assert_eq!(b.stats().entry_count, 0);
        assert!(a.replace_document("a", &[], &signature(2)).is_err());
        assert!(a.rebuild(&[], &signature(2)).is_err());
        Ok(())
    }

    #[test]
    fn upsert_is_idempotent_by_chunk_id() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        let batch = vec![
            entry("a_0", "a", vec![1.0, 0.0]),
            entry("a_1", "a", vec![0.0, 1.0]),
        ];
        let first = put(&index, &batch)?;
        let second = put(&index, &batch)?;
        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(index.len(), 2);
        Ok(())
    }

    #[test]
    fn entries_are_durable_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ragkit.db");
        {
            let index = fresh(dir.path())?;
            put(&index, &[entry("a_0", "a", vec![0.6, 0.8])])?;
        }
        let index = VectorIndex::open(&path, StoreMode::ReadOnly)?;
        let hits = index.retrieve(&[0.6, 0.8], 5, 0.0)?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk_text, "text of a_0");
        assert_eq!(hits[0].entry.metadata.get("format").map(String::as_str), Some("txt"));
        assert_eq!(index.signature(), Some(signature(2)));
        Ok(())
    }

    #[test]
    fn retrieve_respects_top_k_and_min_score() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        put(
            &index,
            &[
                entry("a_0", "a", vec![1.0, 0.0]),
                entry("a_1", "a", vec![0.8, 0.6]),
                entry("b_0", "b", vec![0.0, 1.0]),
                entry("b_1", "b", vec![-1.0, 0.0]),
            ],
        )?;

        let hits = index.retrieve(&[1.0, 0.0], 2, 0.5)?;
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a_0", "a_1"]);

        let hits = index.retrieve(&[1.0, 0.0], 10, 0.0)?;
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.score >= 0.0));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

        assert!(index.retrieve(&[1.0, 0.0], 10, 0.99)?.len() <= 1);
        assert!(index.retrieve(&[1.0, 0.0], 0, -1.0)?.is_empty());
        Ok(())
    }

    #[test]
    fn ties_break_by_insertion_order() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        put(&index, &[entry("z", "d1", vec![1.0, 0.0])])?;
        put(&index, &[entry("m", "d2", vec![1.0, 0.0])])?;
        put(&index, &[entry("a", "d3", vec![1.0, 0.0])])?;
        // re-upserting keeps the original position
        put(&index, &[entry("z", "d1", vec![1.0, 0.0])])?;

        let hits = index.retrieve(&[1.0, 0.0], 3, 0.0)?;
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "m", "a"]);
        Ok(())
    }

    #[test]
    fn retrieve_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        put(
            &index,
            &[
                entry("a_0", "a", vec![0.3, 0.7]),
                entry("b_0", "b", vec![0.7, 0.3]),
            ],
        )?;
        let first = index.retrieve(&[0.5, 0.5], 2, 0.0)?;
        for _ in 0..10 {
            assert_eq!(index.retrieve(&[0.5, 0.5], 2, 0.0)?, first);
        }
        Ok(())
    }

    #[test]
    fn empty_index_returns_nothing() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        assert!(index.retrieve(&[1.0, 0.0, 0.0], 5, -1.0)?.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_mismatched_signature() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        put(&index, &[entry("a_0", "a", vec![1.0, 0.0])])?;
        let other = EmbeddingSignature {
            model: "other".to_string(),
            dim: 2,
        };
        assert!(
            index
                .replace_document("b", &[entry("b_0", "b", vec![1.0, 0.0])], &other)
                .is_err()
        );
        assert!(index.retrieve(&[1.0, 0.0, 0.0], 5, 0.0).is_err());
        assert!(index.check_query_model("test").is_ok());
        assert!(index.check_query_model("other").is_err());

        index.clear()?;
        assert!(index.signature().is_none());
        index.replace_document("b", &[entry("b_0", "b", vec![1.0, 0.0])], &other)?;
        assert_eq!(index.len(), 1);
        Ok(())
    }

    #[test]
    fn replace_document_drops_stale_chunks() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        put(
            &index,
            &[
                entry("a_0", "a", vec![1.0, 0.0]),
                entry("a_1", "a", vec![1.0, 0.0]),
                entry("b_0", "b", vec![1.0, 0.0]),
            ],
        )?;
        let report = index.replace_document("a", &[entry("a_0", "a", vec![0.0, 1.0])], &signature(2))?;
        assert_eq!(report.removed, 1);
        assert_eq!(report.updated, 1);
        let stats = index.stats();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.document_count, 2);
        Ok(())
    }

    #[test]
    fn rebuild_swaps_entries_and_signature() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        put(
            &index,
            &[
                entry("a_0", "a", vec![1.0, 0.0]),
                entry("b_0", "b", vec![0.0, 1.0]),
            ],
        )?;
        let other = EmbeddingSignature {
            model: "other".to_string(),
            dim: 3,
        };
        let report = index.rebuild(&[entry("c_0", "c", vec![0.0, 0.0, 1.0])], &other)?;
        assert_eq!(report.removed, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(index.signature(), Some(other.clone()));
        drop(index);

        let index = VectorIndex::open(&dir.path().join("ragkit.db"), StoreMode::ReadOnly)?;
        let stats = index.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.embedding, Some(other));
        Ok(())
    }

    #[test]
    fn failed_rebuild_keeps_previous_entries() -> Result<()> {
        let dir = tempdir()?;
        let index = fresh(dir.path())?;
        put(&index, &[entry("a_0", "a", vec![1.0, 0.0])])?;
        // wrong dimension for the new signature
        assert!(index.rebuild(&[entry("c_0", "c", vec![1.0, 0.0])], &signature(3)).is_err());
        assert_eq!(index.len(), 1);
        assert_eq!(index.signature(), Some(signature(2)));
        Ok(())
    }

    #[test]
    fn lock_file_survives_close() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ragkit.db");
        VectorIndex::init(&path)?;
        drop(VectorIndex::open(&path, StoreMode::ReadWrite)?);
        assert!(lock_path_for(&path)?.exists());
        let reopened = VectorIndex::open(&path, StoreMode::ReadWrite)?;
        assert_eq!(reopened.len(), 0);
        Ok(())
    }

    #[test]
    fn readers_see_whole_writes() -> Result<()> {
        let dir = tempdir()?;
        let index = Arc::new(fresh(dir.path())?);
        put(&index, &[entry("seed", "s", vec![1.0, 0.0])])?;

        let batch: Vec<IndexEntry> = (0..50)
            .map(|i| entry(&format!("w_{i}"), "w", vec![1.0, 0.0]))
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..200 {
                        let hits = index.retrieve(&[1.0, 0.0], 1000, 0.0).expect("retrieve");
                        seen.push(hits.len());
                    }
                    seen
                })
            })
            .collect();
        put(&index, &batch)?;

        for reader in readers {
            let seen = reader.join().expect("reader thread");
            assert!(seen.iter().all(|&n| n == 1 || n == 51), "{seen:?}");
        }
        Ok(())
    }
}
