pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

use crate::dsp;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("schema mismatch: database has {field} = {found}, this build uses {expected}")]
    SchemaMismatch {
        field: String,
        expected: String,
        found: String,
    },
    #[error("unknown track id {0}")]
    UnknownTrack(u32),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        self.recover_interrupted()?;
        self.verify_header()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn.pragma_update(None, "user_version", 1)?;
        Ok(())
    }

    /// V1: tracks + committed postings + staging + parameter header.
    ///
    /// `hashes` holds only committed postings, and `lookup` reads it and
    /// nothing else. Rows sit in `hashes_staging` until `commit_ingest`
    /// moves them over in one transaction, which is what makes ingest atomic.
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tracks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                title       TEXT NOT NULL,
                artist      TEXT NOT NULL,
                source_ref  TEXT NOT NULL UNIQUE,
                frame_count INTEGER NOT NULL,
                committed   INTEGER NOT NULL DEFAULT 0,
                ingested_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS hashes (
                hash        INTEGER NOT NULL,
                track_id    INTEGER NOT NULL REFERENCES tracks(id),
                anchor_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_hashes_hash ON hashes(hash);
            CREATE INDEX IF NOT EXISTS idx_hashes_track ON hashes(track_id);

            CREATE TABLE IF NOT EXISTS hashes_staging (
                hash        INTEGER NOT NULL,
                track_id    INTEGER NOT NULL,
                anchor_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_staging_track ON hashes_staging(track_id);
            ",
        )?;
        Ok(())
    }

    /// Crash recovery: staged rows from ingests that never committed must not
    /// become visible. Their track ids are burned (AUTOINCREMENT never
    /// reissues them); the source can be re-ingested under a fresh id.
    fn recover_interrupted(&self) -> Result<()> {
        let staged: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM hashes_staging", [], |r| r.get(0))?;
        let uncommitted: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tracks WHERE committed = 0",
            [],
            |r| r.get(0),
        )?;
        if staged == 0 && uncommitted == 0 {
            return Ok(());
        }

        log::warn!(
            "recovering from interrupted ingest: discarding {} staged rows, {} uncommitted tracks",
            staged,
            uncommitted
        );
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM hashes_staging", [])?;
        tx.execute("DELETE FROM tracks WHERE committed = 0", [])?;
        tx.commit()?;
        Ok(())
    }

    /// The extraction parameters this binary was built with. Fingerprints are
    /// only comparable when every one matches the database that stored them.
    fn build_params() -> Vec<(&'static str, String)> {
        vec![
            ("layout_version", dsp::HASH_LAYOUT_VERSION.to_string()),
            ("sample_rate", dsp::SAMPLE_RATE.to_string()),
            ("window_size", dsp::WINDOW_SIZE.to_string()),
            ("hop_size", dsp::HOP_SIZE.to_string()),
            ("window_type", dsp::WINDOW_TYPE.to_string()),
            ("nbhd_frames", dsp::NEIGHBORHOOD_FRAMES.to_string()),
            ("nbhd_bins", dsp::NEIGHBORHOOD_BINS.to_string()),
            ("percentile", dsp::MAGNITUDE_PERCENTILE.to_string()),
            ("peak_density", dsp::PEAK_DENSITY_PER_SEC.to_string()),
            ("fan_out", dsp::FAN_OUT.to_string()),
            ("dt_min", dsp::DT_MIN.to_string()),
            ("dt_max", dsp::DT_MAX.to_string()),
        ]
    }

    /// Verify the parameter header, writing it on a fresh database.
    /// Refuses to operate on any mismatch: a single differing parameter
    /// makes every stored hash incomparable with ours.
    pub(crate) fn verify_header(&self) -> Result<()> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM meta", [], |r| r.get(0))?;

        if count == 0 {
            let tx = self.conn.unchecked_transaction()?;
            for (key, value) in Self::build_params() {
                tx.execute(
                    "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                    rusqlite::params![key, value],
                )?;
            }
            tx.commit()?;
            log::debug!("wrote parameter header to fresh database");
            return Ok(());
        }

        for (key, expected) in Self::build_params() {
            let found: Option<String> = self
                .conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    rusqlite::params![key],
                    |r| r.get(0),
                )
                .ok();
            match found {
                Some(ref v) if *v == expected => {}
                Some(v) => {
                    return Err(DbError::SchemaMismatch {
                        field: key.to_string(),
                        expected,
                        found: v,
                    })
                }
                None => {
                    return Err(DbError::SchemaMismatch {
                        field: key.to_string(),
                        expected,
                        found: "<absent>".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Flush WAL to the main database file and release the connection.
    pub fn close(self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .ok();
        self.conn.close().map_err(|(_, e)| DbError::Sqlite(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_gets_header() {
        let db = Database::open_in_memory().unwrap();
        let layout: String = db
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'layout_version'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(layout, dsp::HASH_LAYOUT_VERSION.to_string());
        // Re-verification of an untouched header passes.
        db.verify_header().unwrap();
    }

    #[test]
    fn tampered_header_is_a_schema_mismatch() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "UPDATE meta SET value = '4096' WHERE key = 'window_size'",
                [],
            )
            .unwrap();

        match db.verify_header() {
            Err(DbError::SchemaMismatch { field, found, .. }) => {
                assert_eq!(field, "window_size");
                assert_eq!(found, "4096");
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn missing_header_key_is_a_schema_mismatch() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute("DELETE FROM meta WHERE key = 'fan_out'", [])
            .unwrap();

        match db.verify_header() {
            Err(DbError::SchemaMismatch { field, found, .. }) => {
                assert_eq!(field, "fan_out");
                assert_eq!(found, "<absent>");
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }
}
