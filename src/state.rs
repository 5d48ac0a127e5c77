//! State Management - SQLite-based persistence for tracked repositories
//!
//! This module provides persistent storage for:
//! - The set of tracked repositories loaded from the reference list
//! - The last release tag or commit hash observed for each of them
//!
//! The database is stored in XDG_DATA_HOME/ratatoskr/tracker.db unless configured otherwise.
//! Every mutating operation runs in its own transaction; dropping the transaction guard on
//! an error path rolls it back.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::model::{Change, ChangeKind, NewRepository, Provider, TrackedRepository, TrackedSignal};

/// Schema revision written to `PRAGMA user_version`
const SCHEMA_VERSION: i64 = 1;

const TABLE: &str = "tracked_repositories";

const COLUMNS: &[&str] = &[
    "id",
    "url",
    "provider",
    "owner",
    "name",
    "category",
    "added_date",
    "last_release",
    "last_commit",
    "last_checked",
];

const SELECT_REPO: &str = r#"
    SELECT id, url, provider, owner, name, category, added_date, last_release, last_commit, last_checked
    FROM tracked_repositories
"#;

/// State database manager
#[derive(Debug)]
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open or create the state database at a specific path
    pub fn open_at(path: &Path) -> StoreResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let mut db = Self { conn };
        db.initialize()?;

        info!("State database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Get the default database path
    pub fn default_db_path() -> PathBuf {
        let data_dir = if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(data_home)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".local/share")
        } else {
            PathBuf::from("/tmp")
        };

        data_dir.join("ratatoskr").join("tracker.db")
    }

    /// Ensure the schema exists.
    ///
    /// Creates the table on an empty database and is a no-op when the expected structure is
    /// already present. A table missing any expected column, or a database written by a
    /// newer schema revision, is rejected instead of being altered.
    pub fn initialize(&mut self) -> StoreResult<()> {
        let tx = self.conn.transaction()?;

        let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::Schema(format!(
                "database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        let existing = table_columns(&tx)?;
        if existing.is_empty() {
            tx.execute_batch(
                r#"
                CREATE TABLE tracked_repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    url TEXT UNIQUE NOT NULL,
                    provider TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    category TEXT,
                    added_date TEXT,
                    last_release TEXT,
                    last_commit TEXT,
                    last_checked TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tracked_provider ON tracked_repositories(provider);
                "#,
            )?;
            debug!("Created {} table", TABLE);
        } else {
            let missing: Vec<&str> = COLUMNS
                .iter()
                .copied()
                .filter(|column| !existing.iter().any(|c| c == column))
                .collect();

            if !missing.is_empty() {
                return Err(StoreError::Schema(format!(
                    "table {} exists but lacks columns: {}",
                    TABLE,
                    missing.join(", ")
                )));
            }

            if !url_is_unique(&tx)? {
                return Err(StoreError::Schema(format!(
                    "table {} has no unique index on url",
                    TABLE
                )));
            }
        }

        if version != SCHEMA_VERSION {
            tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        tx.commit()?;
        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Repository Operations
    // =========================================================================

    /// Insert a repository unless one with the same URL is already tracked.
    ///
    /// Returns whether a row was inserted.
    pub fn insert_if_absent(&mut self, repo: &NewRepository) -> StoreResult<bool> {
        let tx = self.conn.transaction()?;

        let inserted = tx.execute(
            r#"
            INSERT INTO tracked_repositories (url, provider, owner, name, category, added_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(url) DO NOTHING
            "#,
            params![
                repo.url,
                repo.provider.as_str(),
                repo.owner,
                repo.name,
                repo.category,
                repo.added_date,
            ],
        )?;

        tx.commit()?;

        if inserted == 1 {
            debug!("Tracking new repository: {}", repo.url);
        } else {
            debug!("Repository already tracked: {}", repo.url);
        }
        Ok(inserted == 1)
    }

    /// All tracked repositories in insertion order
    pub fn list_all(&self) -> StoreResult<Vec<TrackedRepository>> {
        let mut stmt = self.conn.prepare(&format!("{} ORDER BY id", SELECT_REPO))?;

        let repos = stmt
            .query_map([], repo_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// Look up a tracked repository by its canonical URL
    pub fn get_by_url(&self, url: &str) -> StoreResult<Option<TrackedRepository>> {
        let repo = self
            .conn
            .query_row(
                &format!("{} WHERE url = ?1", SELECT_REPO),
                params![url],
                repo_from_row,
            )
            .optional()?;

        Ok(repo)
    }

    /// Number of tracked repositories
    pub fn count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tracked_repositories", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Record a newly observed release or commit.
    ///
    /// Only the column matching the change kind is written, so a stored release is never
    /// overwritten by commit tracking.
    pub fn update_last_seen(&mut self, id: i64, change: &Change) -> StoreResult<()> {
        let now = Utc::now().to_rfc3339();
        let sql = match change.kind {
            ChangeKind::Release => {
                "UPDATE tracked_repositories SET last_release = ?1, last_checked = ?2 WHERE id = ?3"
            }
            ChangeKind::Commit => {
                "UPDATE tracked_repositories SET last_commit = ?1, last_checked = ?2 WHERE id = ?3"
            }
        };

        let tx = self.conn.transaction()?;
        let updated = tx.execute(sql, params![change.value, now, id])?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        tx.commit()?;

        debug!("Updated repo {} -> {} {}", id, change.kind, change.value);
        Ok(())
    }

    /// Stop tracking a repository. Returns whether a row was deleted.
    pub fn remove(&mut self, url: &str) -> StoreResult<bool> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM tracked_repositories WHERE url = ?1",
            params![url],
        )?;
        tx.commit()?;
        Ok(deleted > 0)
    }
}

fn table_columns(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map(params![TABLE], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Whether some unique index covers exactly the `url` column
fn url_is_unique(conn: &Connection) -> rusqlite::Result<bool> {
    let mut list = conn.prepare(r#"SELECT name FROM pragma_index_list(?1) WHERE "unique" = 1"#)?;
    let indexes = list
        .query_map(params![TABLE], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1)")?;
    for index in indexes {
        let columns = info
            .query_map(params![index], |row| row.get::<_, Option<String>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if columns == [Some("url".to_string())] {
            return Ok(true);
        }
    }
    Ok(false)
}

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<TrackedRepository> {
    let provider: String = row.get(2)?;
    let provider = Provider::parse(&provider).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown provider '{}'", provider).into(),
        )
    })?;

    Ok(TrackedRepository {
        id: row.get(0)?,
        url: row.get(1)?,
        provider,
        owner: row.get(3)?,
        name: row.get(4)?,
        category: row.get(5)?,
        added_date: row.get(6)?,
        signal: TrackedSignal::from_columns(row.get(7)?, row.get(8)?),
        last_checked: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}
