//! SQLite-backed ingest status store.
//!
//! The single source of truth for "have we seen this archive or member
//! before, and in what state". Two persisted levels: `archives` rows for the
//! remote ZIP files and `archive_files` rows for XML members inside them,
//! plus the `records` table holding the parsed payloads.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("archive member '{0}' has no stored row")]
    MissingRow(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS archives (
    id            INTEGER PRIMARY KEY,
    name          TEXT NOT NULL,
    size          INTEGER NOT NULL,
    law_number    TEXT NOT NULL DEFAULT '44',
    folder_name   TEXT NOT NULL,
    downloaded_on TEXT NOT NULL,
    parsed_on     TEXT,
    has_parsed    INTEGER NOT NULL DEFAULT 0,
    reason        TEXT,
    updated_on    TEXT
);
CREATE INDEX IF NOT EXISTS idx_archives_name ON archives(name);

CREATE TABLE IF NOT EXISTS archive_files (
    id         INTEGER PRIMARY KEY,
    archive_id INTEGER NOT NULL REFERENCES archives(id),
    name       TEXT NOT NULL,
    size       INTEGER NOT NULL,
    xml_type   TEXT,
    parsed_on  TEXT,
    has_parsed INTEGER NOT NULL DEFAULT 0,
    reason     TEXT
);
CREATE INDEX IF NOT EXISTS idx_archive_files_archive ON archive_files(archive_id, name);

CREATE TABLE IF NOT EXISTS records (
    id              INTEGER PRIMARY KEY,
    archive_file_id INTEGER NOT NULL REFERENCES archive_files(id),
    data            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_file ON records(archive_file_id);
";

/// How a remote archive or member relates to what the store already holds.
///
/// Recomputed on every run; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    DoesNotExist,
    /// Known, fully parsed, size unchanged.
    Exists,
    /// Known but a previous run never finished parsing it.
    ExistsNotParsed,
    /// Known but the remote size changed, so the stored content is stale.
    ExistsSizeDiffers,
}

impl Classification {
    /// Shared precedence rule for both levels: absence, then size mismatch
    /// (changed content invalidates any previous parse), then the parse flag.
    fn of(stored: Option<(u64, bool)>, remote_size: u64) -> Self {
        match stored {
            None => Classification::DoesNotExist,
            Some((size, _)) if size != remote_size => Classification::ExistsSizeDiffers,
            Some((_, false)) => Classification::ExistsNotParsed,
            Some((_, true)) => Classification::Exists,
        }
    }
}

/// One `archives` row.
#[derive(Debug, Clone)]
pub struct ArchiveRow {
    pub id: i64,
    pub name: String,
    pub size: u64,
    pub has_parsed: bool,
}

/// One `archive_files` row.
#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: i64,
    pub name: String,
    pub size: u64,
    pub has_parsed: bool,
}

/// Row counts for the `status` subcommand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub archives: u64,
    pub archives_parsed: u64,
    pub files: u64,
    pub files_parsed: u64,
    pub records: u64,
}

pub struct StatusStore {
    conn: Connection,
}

impl StatusStore {
    /// Open (or create) the store at `path`. With `echo` every SQL statement
    /// is logged at debug level.
    pub fn open(path: impl AsRef<Path>, echo: bool) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?, echo)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, false)
    }

    fn init(mut conn: Connection, echo: bool) -> Result<Self, StoreError> {
        if echo {
            fn trace_sql(sql: &str) {
                debug!(target: "fcsload::sql", "{sql}");
            }
            conn.trace(Some(trace_sql));
        }
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Classify a remote archive against the stored state. Lookup is by name
    /// only; the size is compared against the stored row so a mismatch is
    /// detectable instead of silently treated as a new archive.
    pub fn classify_archive(&self, name: &str, size: u64) -> Result<Classification, StoreError> {
        debug!("check whether archive {} was parsed before", name);
        let stored = self
            .conn
            .query_row(
                "SELECT size, has_parsed FROM archives WHERE name = ?1 ORDER BY id DESC LIMIT 1",
                params![name],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        Ok(Classification::of(stored, size))
    }

    /// Same rule as [`classify_archive`](Self::classify_archive), scoped to
    /// the members of one archive.
    pub fn classify_file(
        &self,
        archive_id: i64,
        name: &str,
        size: u64,
    ) -> Result<Classification, StoreError> {
        let stored = self
            .conn
            .query_row(
                "SELECT size, has_parsed FROM archive_files
                 WHERE archive_id = ?1 AND name = ?2 ORDER BY id DESC LIMIT 1",
                params![archive_id, name],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        Ok(Classification::of(stored, size))
    }

    pub fn get_archive(&self, name: &str) -> Result<Option<ArchiveRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, size, has_parsed FROM archives
                 WHERE name = ?1 ORDER BY id DESC LIMIT 1",
                params![name],
                |row| {
                    Ok(ArchiveRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        has_parsed: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Register a newly downloaded archive; returns its row id.
    pub fn add_archive(
        &self,
        name: &str,
        size: u64,
        law_number: &str,
        folder_name: &str,
    ) -> Result<i64, StoreError> {
        debug!("add info about a new archive {} to the store", name);
        self.conn.execute(
            "INSERT INTO archives (name, size, law_number, folder_name, downloaded_on)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, size as i64, law_number, folder_name, Utc::now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Flag an archive as fully parsed.
    pub fn mark_archive_parsed(&self, archive_id: i64, reason: &str) -> Result<(), StoreError> {
        debug!("mark archive {} as parsed", archive_id);
        self.conn.execute(
            "UPDATE archives SET has_parsed = 1, parsed_on = ?2, reason = ?3 WHERE id = ?1",
            params![archive_id, Utc::now(), reason],
        )?;
        Ok(())
    }

    /// Annotate an archive without changing its parse state.
    pub fn set_archive_reason(&self, archive_id: i64, reason: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE archives SET reason = ?2, updated_on = ?3 WHERE id = ?1",
            params![archive_id, reason, Utc::now()],
        )?;
        Ok(())
    }

    /// Record the new size of a stale archive after a successful re-ingest.
    pub fn update_archive_size(&self, archive_id: i64, size: u64) -> Result<(), StoreError> {
        debug!("update size of archive {} to {}", archive_id, size);
        self.conn.execute(
            "UPDATE archives SET size = ?2, updated_on = ?3 WHERE id = ?1",
            params![archive_id, size as i64, Utc::now()],
        )?;
        Ok(())
    }

    pub fn touch_archive(&self, archive_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE archives SET updated_on = ?2 WHERE id = ?1",
            params![archive_id, Utc::now()],
        )?;
        Ok(())
    }

    /// Register a member first seen inside a known archive; returns its id.
    pub fn add_file(&self, archive_id: i64, name: &str, size: u64) -> Result<i64, StoreError> {
        debug!("add info about a new member {} of archive {}", name, archive_id);
        self.conn.execute(
            "INSERT INTO archive_files (archive_id, name, size) VALUES (?1, ?2, ?3)",
            params![archive_id, name, size as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_file(&self, archive_id: i64, name: &str) -> Result<Option<FileRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, size, has_parsed FROM archive_files
                 WHERE archive_id = ?1 AND name = ?2 ORDER BY id DESC LIMIT 1",
                params![archive_id, name],
                |row| {
                    Ok(FileRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        has_parsed: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Rewrite a stale member's size and clear its parse flag, so an
    /// interrupted re-ingest leaves it classified not-parsed rather than
    /// perpetually stale.
    pub fn update_file_size(&self, file_id: i64, size: u64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE archive_files SET size = ?2, has_parsed = 0 WHERE id = ?1",
            params![file_id, size as i64],
        )?;
        Ok(())
    }

    /// Flag a member as parsed, with the record type inferred from its XML.
    pub fn mark_file_parsed(
        &self,
        file_id: i64,
        xml_type: Option<&str>,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE archive_files SET has_parsed = 1, parsed_on = ?2, xml_type = ?3, reason = ?4
             WHERE id = ?1",
            params![file_id, Utc::now(), xml_type, reason],
        )?;
        Ok(())
    }

    /// Insert a member's parsed record and flag it parsed in one transaction;
    /// a crash between the two statements must not leave a parsed-but-
    /// unflagged or flagged-but-recordless state.
    pub fn persist_parsed_file(
        &mut self,
        file_id: i64,
        xml_type: Option<&str>,
        reason: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO records (archive_file_id, data) VALUES (?1, ?2)",
            params![file_id, data],
        )?;
        tx.execute(
            "UPDATE archive_files SET has_parsed = 1, parsed_on = ?2, xml_type = ?3, reason = ?4
             WHERE id = ?1",
            params![file_id, Utc::now(), xml_type, reason],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Purge every member row of an archive together with their records.
    /// Used when the archive's remote size changed and all stored content
    /// is stale.
    pub fn delete_files_of_archive(&mut self, archive_id: i64) -> Result<(), StoreError> {
        debug!("delete members of archive {}", archive_id);
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE archive_file_id IN
                 (SELECT id FROM archive_files WHERE archive_id = ?1)",
            params![archive_id],
        )?;
        tx.execute(
            "DELETE FROM archive_files WHERE archive_id = ?1",
            params![archive_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop the stale records of one member, keeping its row.
    pub fn delete_records_of_file(&self, file_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM records WHERE archive_file_id = ?1",
            params![file_id],
        )?;
        Ok(())
    }

    pub fn records_of_file(&self, file_id: i64) -> Result<u64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE archive_file_id = ?1",
            params![file_id],
            |row| row.get::<_, i64>(0).map(|n| n as u64),
        )?)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let count = |sql: &str| -> Result<u64, rusqlite::Error> {
            self.conn
                .query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        };
        Ok(StoreStats {
            archives: count("SELECT COUNT(*) FROM archives")?,
            archives_parsed: count("SELECT COUNT(*) FROM archives WHERE has_parsed = 1")?,
            files: count("SELECT COUNT(*) FROM archive_files")?,
            files_parsed: count("SELECT COUNT(*) FROM archive_files WHERE has_parsed = 1")?,
            records: count("SELECT COUNT(*) FROM records")?,
        })
    }
}
