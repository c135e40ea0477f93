//! facematch-store — SQLite persistence for the face registry.
//!
//! The core keeps everything in memory; this crate lets a host survive
//! restarts. Embeddings are stored as little-endian `f32` blobs so every
//! value round-trips bit for bit, and rows are read back in insertion order
//! so a reloaded registry iterates labels exactly as the original did.

use chrono::Utc;
use facematch_core::{Embedding, FaceError, Label, Profile, Registry};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS labels (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    label       TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    label_id    INTEGER NOT NULL REFERENCES labels(id) ON DELETE CASCADE,
    dimension   INTEGER NOT NULL,
    vector      BLOB NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
    label       TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    linkedin    TEXT,
    telegram    TEXT,
    updated_at  TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("stored embeddings are inconsistent: {0}")]
    Face(#[from] FaceError),
}

/// SQLite-backed store of enrolled embeddings and profiles.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "face store opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Rebuild a registry from every stored embedding.
    pub fn load_registry(&self) -> Result<Registry, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT l.label, e.dimension, e.vector
             FROM embeddings e JOIN labels l ON l.id = e.label_id
             ORDER BY l.id, e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut registry = Registry::new();
        for row in rows {
            let (label, dimension, blob) = row?;
            let embedding = decode_embedding(&blob, dimension)
                .map_err(|e| StoreError::Corrupt(format!("label {label:?}: {e}")))?;
            registry.enroll(label, embedding)?;
        }

        tracing::info!(
            labels = registry.len(),
            embeddings = registry.embedding_count(),
            dimension = ?registry.dimension(),
            "registry loaded"
        );
        Ok(registry)
    }

    /// Persist `embeddings` under `label`, and `profile` if given, in one
    /// transaction. An empty batch writes nothing, not even the profile.
    ///
    /// Dimension checks are the registry's job; validate before calling.
    pub fn enroll(
        &mut self,
        label: &Label,
        embeddings: &[Embedding],
        profile: Option<&Profile>,
    ) -> Result<(), StoreError> {
        if embeddings.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO labels (label, created_at) VALUES (?1, ?2)",
            params![label.as_str(), now],
        )?;
        let label_id: i64 = tx.query_row(
            "SELECT id FROM labels WHERE label = ?1",
            [label.as_str()],
            |row| row.get(0),
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO embeddings (label_id, dimension, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for embedding in embeddings {
                insert.execute(params![
                    label_id,
                    embedding.len() as i64,
                    encode_embedding(embedding),
                    now
                ])?;
            }
        }
        if let Some(profile) = profile {
            tx.execute(
                "INSERT INTO profiles (label, name, linkedin, telegram, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(label) DO UPDATE SET
                    name = excluded.name,
                    linkedin = excluded.linkedin,
                    telegram = excluded.telegram,
                    updated_at = excluded.updated_at",
                params![
                    label.as_str(),
                    profile.name,
                    profile.linkedin,
                    profile.telegram,
                    now
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!(
            label = %label,
            count = embeddings.len(),
            profile = profile.is_some(),
            "enrollment persisted"
        );
        Ok(())
    }

    /// Delete a label with its embeddings and profile. Returns whether the
    /// label had any stored embeddings.
    pub fn remove_label(&mut self, label: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM labels WHERE label = ?1", [label])?;
        tx.execute("DELETE FROM profiles WHERE label = ?1", [label])?;
        tx.commit()?;
        tracing::debug!(label, removed = removed > 0, "label removed from store");
        Ok(removed > 0)
    }

    pub fn load_profiles(&self) -> Result<HashMap<Label, Profile>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT label, name, linkedin, telegram FROM profiles")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                Label::new(row.get::<_, String>(0)?),
                Profile {
                    name: row.get(1)?,
                    linkedin: row.get(2)?,
                    telegram: row.get(3)?,
                },
            ))
        })?;
        let profiles = rows.collect::<Result<HashMap<_, _>, _>>()?;
        Ok(profiles)
    }
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_embedding(blob: &[u8], dimension: i64) -> Result<Embedding, String> {
    let expected = usize::try_from(dimension)
        .map_err(|_| format!("negative dimension {dimension}"))?
        * 4;
    if blob.len() != expected {
        return Err(format!(
            "vector blob is {} bytes, expected {expected} for dimension {dimension}",
            blob.len()
        ));
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding::new(values))
}
