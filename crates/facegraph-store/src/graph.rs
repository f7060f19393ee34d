//! SQLite-backed identity graph.
//!
//! Identities carry their display attributes and embedding in one row, so
//! enrollment commits atomically. Confirmed relationships are stored as
//! two directed edges written together in one transaction; the edge set
//! is symmetric by construction.

use crate::index::SimilarityIndex;
use facegraph_core::types::{Embedding, MatchCandidate};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown identity: {0}")]
    UnknownIdentity(i64),
    #[error("cannot connect an identity to itself: {0}")]
    SelfLink(i64),
    #[error("embedding dimension {got} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("index inconsistency: {0}")]
    IndexInconsistency(String),
}

/// Display attributes supplied at enrollment.
#[derive(Debug, Clone)]
pub struct IdentityAttrs {
    pub first_name: String,
    pub last_name: String,
    pub color: String,
    pub image_ref: Option<String>,
}

/// A persisted identity node.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityRow {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub color: String,
    pub image_ref: Option<String>,
    pub created_at: String,
}

/// A directed relationship edge.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeRow {
    pub source: i64,
    pub target: i64,
    pub value: f64,
}

/// A ranked query result joined with display attributes.
#[derive(Debug, Clone, Serialize)]
pub struct RankedMatch {
    pub id: i64,
    pub name: String,
    pub image_ref: Option<String>,
    pub distance: f32,
    pub similarity_score: f32,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          INTEGER PRIMARY KEY,
    first_name  TEXT NOT NULL,
    last_name   TEXT NOT NULL,
    color       TEXT NOT NULL DEFAULT '#ffffff',
    image_ref   TEXT,
    embedding   BLOB NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS edges (
    source  INTEGER NOT NULL REFERENCES identities(id),
    target  INTEGER NOT NULL REFERENCES identities(id),
    value   REAL NOT NULL DEFAULT 1.0,
    PRIMARY KEY (source, target)
);
";

/// The identity graph plus its similarity index, sharing one lifecycle:
/// the index is rebuilt from the embedding column at open and kept in
/// sync by every enrollment.
pub struct GraphStore {
    conn: Mutex<Connection>,
    index: SimilarityIndex,
    dimension: usize,
}

impl GraphStore {
    /// Open (creating if absent) the store at `path`.
    pub fn open(path: &Path, dimension: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_conn(conn, dimension)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory(dimension: usize) -> Result<Self, StoreError> {
        Self::from_conn(Connection::open_in_memory()?, dimension)
    }

    fn from_conn(conn: Connection, dimension: usize) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;

        let store = Self { conn: Mutex::new(conn), index: SimilarityIndex::new(), dimension };
        store.rebuild_index()?;

        tracing::info!(
            identities = store.index.len(),
            dimension,
            "identity graph opened"
        );
        Ok(store)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuild the in-memory index from persisted embeddings, verifying
    /// the row/vector invariant. A mismatch here is an integrity error,
    /// not a per-request condition.
    fn rebuild_index(&self) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT id, embedding FROM identities")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        for row in rows {
            let (id, blob) = row?;
            let values = blob_to_vec(&blob).ok_or_else(|| {
                StoreError::IndexInconsistency(format!("identity {id}: malformed embedding blob"))
            })?;
            if values.len() != self.dimension {
                return Err(StoreError::IndexInconsistency(format!(
                    "identity {id}: embedding dimension {} != {}",
                    values.len(),
                    self.dimension
                )));
            }
            self.index.enroll(id, &Embedding::from_unit(values));
        }
        Ok(())
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    /// Atomically persist a new identity and enroll its embedding.
    ///
    /// The row (attributes + embedding blob) commits in one INSERT, so
    /// either both are visible or neither is.
    pub fn create_identity(
        &self,
        attrs: &IdentityAttrs,
        embedding: &Embedding,
    ) -> Result<i64, StoreError> {
        self.check_dimension(embedding)?;

        let created_at = chrono::Utc::now().to_rfc3339();
        let id = {
            let conn = self.lock_conn();
            conn.execute(
                "INSERT INTO identities (first_name, last_name, color, image_ref, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attrs.first_name,
                    attrs.last_name,
                    attrs.color,
                    attrs.image_ref,
                    vec_to_blob(&embedding.values),
                    created_at,
                ],
            )?;
            conn.last_insert_rowid()
        };

        self.index.enroll(id, embedding);
        tracing::info!(id, first_name = %attrs.first_name, "identity created");
        Ok(id)
    }

    /// Replace an identity's live embedding (re-enrollment).
    pub fn update_embedding(&self, id: i64, embedding: &Embedding) -> Result<(), StoreError> {
        self.check_dimension(embedding)?;

        let updated = {
            let conn = self.lock_conn();
            conn.execute(
                "UPDATE identities SET embedding = ?1 WHERE id = ?2",
                params![vec_to_blob(&embedding.values), id],
            )?
        };
        if updated == 0 {
            return Err(StoreError::UnknownIdentity(id));
        }

        self.index.enroll(id, embedding);
        tracing::info!(id, "embedding replaced");
        Ok(())
    }

    /// Create the symmetric edge pair (a→b, b→a) in one transaction.
    ///
    /// Idempotent: an already-connected pair is a no-op. Both endpoints
    /// must reference live identities.
    pub fn connect(&self, a: i64, b: i64, value: f64) -> Result<(), StoreError> {
        if a == b {
            return Err(StoreError::SelfLink(a));
        }

        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        for id in [a, b] {
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM identities WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::UnknownIdentity(id));
            }
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO edges (source, target, value) VALUES (?1, ?2, ?3)",
            params![a, b, value],
        )? + tx.execute(
            "INSERT OR IGNORE INTO edges (source, target, value) VALUES (?1, ?2, ?3)",
            params![b, a, value],
        )?;
        tx.commit()?;

        if inserted > 0 {
            tracing::info!(a, b, value, "identities connected");
        }
        Ok(())
    }

    /// Identities directly reachable via an outgoing edge from `id`.
    pub fn neighbors(&self, id: i64) -> Result<BTreeSet<i64>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT target FROM edges WHERE source = ?1")?;
        let ids = stmt
            .query_map(params![id], |row| row.get::<_, i64>(0))?
            .collect::<Result<BTreeSet<i64>, _>>()?;
        Ok(ids)
    }

    /// One identity's display row, or `None` if it does not exist.
    pub fn identity(&self, id: i64) -> Result<Option<IdentityRow>, StoreError> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT id, first_name, last_name, color, image_ref, created_at
                 FROM identities WHERE id = ?1",
                params![id],
                identity_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All identities and all directed edges.
    pub fn full_graph(&self) -> Result<(Vec<IdentityRow>, Vec<EdgeRow>), StoreError> {
        let conn = self.lock_conn();

        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, color, image_ref, created_at
             FROM identities ORDER BY id",
        )?;
        let identities = stmt
            .query_map([], identity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt =
            conn.prepare("SELECT source, target, value FROM edges ORDER BY source, target")?;
        let edges = stmt
            .query_map([], |row| {
                Ok(EdgeRow { source: row.get(0)?, target: row.get(1)?, value: row.get(2)? })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((identities, edges))
    }

    /// Ranked similarity query joined with display attributes, for the
    /// "show possible matches" flow.
    pub fn ranked_matches(&self, probe: &Embedding, k: usize) -> Result<Vec<RankedMatch>, StoreError> {
        let candidates = self.index.query(probe, k);
        self.annotate(&candidates)
    }

    /// Join ranked candidates with their display attributes. A candidate
    /// without a backing row violates the row/vector invariant.
    pub fn annotate(&self, candidates: &[MatchCandidate]) -> Result<Vec<RankedMatch>, StoreError> {
        let mut matches = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let row = self.identity(candidate.identity_id)?.ok_or_else(|| {
                StoreError::IndexInconsistency(format!(
                    "indexed identity {} has no row",
                    candidate.identity_id
                ))
            })?;
            matches.push(RankedMatch {
                id: row.id,
                name: format!("{} {}", row.first_name, row.last_name),
                image_ref: row.image_ref,
                distance: candidate.distance,
                similarity_score: candidate.similarity,
            });
        }
        Ok(matches)
    }

    fn check_dimension(&self, embedding: &Embedding) -> Result<(), StoreError> {
        if embedding.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.dimension(),
            });
        }
        Ok(())
    }
}

fn identity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        color: row.get(3)?,
        image_ref: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Embedding vectors persist as little-endian f32 blobs.
fn vec_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
