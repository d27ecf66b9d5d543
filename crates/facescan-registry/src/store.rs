//! SQLite persistence for identities and their feature vectors.

use chrono::{DateTime, Utc};
use facescan_core::{encoding, Candidate, FeatureVector};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Schema applied on every open. `name_key` holds the lowercased display name
/// and carries the case-insensitive uniqueness constraint.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feature_vectors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT NOT NULL UNIQUE REFERENCES identities(id) ON DELETE CASCADE,
    encoding BLOB NOT NULL
);
"#;

const TIMESTAMP_DISPLAY: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("an identity named {0:?} already exists")]
    DuplicateName(String),
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Creation time as `YYYY-MM-DD HH:MM:SS`.
    pub fn added(&self) -> String {
        self.created_at.format(TIMESTAMP_DISPLAY).to_string()
    }
}

/// Key used for case-insensitive name comparison.
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "opened identity store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert an identity and its vector atomically.
    pub fn insert(&mut self, identity: &Identity, vector: &FeatureVector) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO identities (id, name, name_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                identity.id,
                identity.name,
                name_key(&identity.name),
                identity.created_at.to_rfc3339()
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::DuplicateName(identity.name.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        tx.execute(
            "INSERT INTO feature_vectors (identity_id, encoding) VALUES (?1, ?2)",
            params![identity.id, encoding::encode(vector)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Find an identity by name, ignoring case.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM identities WHERE name_key = ?1",
                [name_key(name)],
                identity_from_row,
            )
            .optional()?)
    }

    pub fn get(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM identities WHERE id = ?1",
                [id],
                identity_from_row,
            )
            .optional()?)
    }

    /// All identities in enrollment order.
    pub fn list(&self) -> Result<Vec<Identity>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM identities ORDER BY rowid")?;
        let identities = stmt
            .query_map([], identity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(identities)
    }

    /// Delete an identity; its vector goes with it. Returns whether a row existed.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM identities WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Every stored (identity, vector) pair in enrollment order, read by one
    /// statement. Blobs that fail to decode are skipped.
    pub fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT i.id, v.encoding
            FROM identities i
            JOIN feature_vectors v ON v.identity_id = i.id
            ORDER BY i.rowid
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let candidates = rows
            .into_iter()
            .filter_map(|(id, blob)| match encoding::decode(&blob) {
                Ok(vector) => Some(Candidate::new(id, vector)),
                Err(e) => {
                    tracing::warn!(identity = %id, error = %e, "skipping undecodable feature vector");
                    None
                }
            })
            .collect();
        Ok(candidates)
    }

    #[cfg(test)]
    fn vector_count(&self) -> u64 {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM feature_vectors", [], |row| row.get(0))
            .unwrap();
        count as u64
    }
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let raw: String = row.get(2)?;
    let created_at = DateTime::parse_from_rfc3339(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);
    Ok(Identity {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at,
    })
}
