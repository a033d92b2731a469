use rusqlite::{params, OptionalExtension};

use super::models::{BeginIngest, IndexStats, NewTrack, Posting, TrackRow};
use super::{Database, DbError, Result};
use crate::dsp::pairs::Fingerprint;

/// Rows per staged insert batch. Keeps statement re-binding cheap without
/// holding a giant transaction open.
const BATCH_SIZE: usize = 10_000;

impl Database {
    /// Reserve a track id for ingest, idempotent per `source_ref`.
    ///
    /// A leftover uncommitted row for the same source (from an ingest this
    /// process aborted without `abort_ingest`, which should not happen, or a
    /// crash the opener already recovered) is cleared and restarted.
    pub fn begin_ingest(&self, t: &NewTrack) -> Result<BeginIngest> {
        let existing: Option<(u32, bool)> = self
            .conn
            .query_row(
                "SELECT id, committed FROM tracks WHERE source_ref = ?1",
                params![t.source_ref],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;

        if let Some((id, committed)) = existing {
            if committed {
                log::debug!("source {} already ingested as track {}", t.source_ref, id);
                return Ok(BeginIngest::AlreadyIngested(id));
            }
            log::warn!("restarting stale ingest of {} (was track {})", t.source_ref, id);
            let tx = self.conn.unchecked_transaction()?;
            tx.execute("DELETE FROM hashes_staging WHERE track_id = ?1", params![id])?;
            tx.execute("DELETE FROM tracks WHERE id = ?1", params![id])?;
            tx.commit()?;
        }

        self.conn.execute(
            "INSERT INTO tracks (title, artist, source_ref, frame_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![t.title, t.artist, t.source_ref, t.frame_count],
        )?;
        Ok(BeginIngest::Started(self.conn.last_insert_rowid() as u32))
    }

    /// Stage a batch of fingerprints for an in-flight ingest. Safe to call
    /// repeatedly; nothing becomes visible to `lookup` until `commit_ingest`.
    pub fn append_fingerprints(&self, track_id: u32, batch: &[Fingerprint]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO hashes_staging (hash, track_id, anchor_time)
                 VALUES (?1, ?2, ?3)",
            )?;
            for chunk in batch.chunks(BATCH_SIZE) {
                for fp in chunk {
                    stmt.execute(params![fp.hash as i64, track_id, fp.anchor_time])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Promote a track's staged fingerprints to the visible index in one
    /// transaction. Queries observe all of them or none.
    pub fn commit_ingest(&self, track_id: u32) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO hashes (hash, track_id, anchor_time)
             SELECT hash, track_id, anchor_time FROM hashes_staging WHERE track_id = ?1",
            params![track_id],
        )?;
        tx.execute(
            "DELETE FROM hashes_staging WHERE track_id = ?1",
            params![track_id],
        )?;
        let updated = tx.execute(
            "UPDATE tracks SET committed = 1 WHERE id = ?1 AND committed = 0",
            params![track_id],
        )?;
        if updated == 0 {
            return Err(DbError::UnknownTrack(track_id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Discard a track's staged fingerprints and its reservation. The id is
    /// burned; the source may be re-ingested under a fresh one.
    pub fn abort_ingest(&self, track_id: u32) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM hashes_staging WHERE track_id = ?1",
            params![track_id],
        )?;
        tx.execute(
            "DELETE FROM tracks WHERE id = ?1 AND committed = 0",
            params![track_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All committed postings under a hash. Hot path: one cached statement,
    /// index-backed, cost proportional to the posting count.
    pub fn lookup(&self, hash: u64) -> Result<Vec<Posting>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT track_id, anchor_time FROM hashes WHERE hash = ?1",
        )?;
        let postings = stmt
            .query_map(params![hash as i64], |row| {
                Ok(Posting {
                    track_id: row.get(0)?,
                    anchor_time: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(postings)
    }

    /// Metadata for a committed track. Immutable after commit, so callers
    /// may cache the result freely.
    pub fn track_info(&self, track_id: u32) -> Result<Option<TrackRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, artist, source_ref, frame_count
                 FROM tracks WHERE id = ?1 AND committed = 1",
                params![track_id],
                |row| {
                    Ok(TrackRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        artist: row.get(2)?,
                        source_ref: row.get(3)?,
                        frame_count: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Index statistics for the CLI.
    pub fn stats(&self) -> Result<IndexStats> {
        let track_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tracks WHERE committed = 1",
            [],
            |r| r.get(0),
        )?;
        let posting_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM hashes", [], |r| r.get(0))?;
        let distinct_hashes: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT hash) FROM hashes",
            [],
            |r| r.get(0),
        )?;
        Ok(IndexStats {
            track_count,
            posting_count,
            distinct_hashes,
        })
    }
}
