use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use walkdir::WalkDir;

use crate::db::models::{BeginIngest, NewTrack};
use crate::db::Database;
use crate::decode;
use crate::dsp;
use crate::SUPPORTED_EXTENSIONS;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("ingest cancelled")]
    Cancelled,
}

pub struct IngestResult {
    pub ingested: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Fingerprint batch size per `append_fingerprints` call.
const APPEND_BATCH: usize = 50_000;

/// Collect audio files under the given paths (files pass through directly,
/// directories are walked recursively).
pub fn collect_audio_files(paths: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files
}

/// Everything one worker produces for a track before any DB write happens.
struct PreparedTrack {
    meta: NewTrack,
    fingerprints: Vec<dsp::pairs::Fingerprint>,
}

/// Ingest reference tracks in parallel.
///
/// Decode + extraction run in a rayon pool, one worker per track; each
/// worker owns its FFT plan. Database writes are serialized on this thread
/// in chunks, so the store sees one writer while extraction saturates the
/// cores. Cancellation is observed between stages; an ingest that already
/// reserved an id aborts it before bailing out.
pub fn ingest_tracks(
    db: &Database,
    files: &[PathBuf],
    jobs: usize,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<IngestResult, IngestError> {
    if files.is_empty() {
        log::info!("No tracks to ingest");
        return Ok(IngestResult {
            ingested: 0,
            skipped: 0,
            failed: 0,
        });
    }

    log::info!("Ingesting {} tracks with {} workers", files.len(), jobs);

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .expect("rayon pool");

    let mut result = IngestResult {
        ingested: 0,
        skipped: 0,
        failed: 0,
    };

    let cancelled = || cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed));

    // Extract a chunk in parallel, then write it out, then move on. Bounded
    // memory, and the database gains committed tracks incrementally.
    let chunk_size = (jobs * 2).max(1);

    for chunk in files.chunks(chunk_size) {
        if cancelled() {
            return Err(IngestError::Cancelled);
        }

        let prepared: Vec<Result<PreparedTrack, String>> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|path| {
                    if cancelled() {
                        return Err("cancelled".to_string());
                    }
                    let track = prepare_track(path).map_err(|e| {
                        format!("{}: {}", path.display(), e)
                    });
                    pb.inc(1);
                    track
                })
                .collect()
        });

        for item in prepared {
            let track = match item {
                Ok(t) => t,
                Err(msg) => {
                    log::warn!("Extraction failed: {}", msg);
                    result.failed += 1;
                    continue;
                }
            };

            if cancelled() {
                return Err(IngestError::Cancelled);
            }

            match write_track(db, &track, &cancelled) {
                Ok(true) => result.ingested += 1,
                Ok(false) => result.skipped += 1,
                Err(e) => return Err(e),
            }
        }

        pb.set_message(format!(
            "{} ingested, {} skipped, {} failed",
            result.ingested, result.skipped, result.failed
        ));
    }

    pb.finish_with_message(format!(
        "Done: {} ingested, {} skipped, {} failed",
        result.ingested, result.skipped, result.failed
    ));

    Ok(result)
}

/// Decode + extract one track. CPU-bound; runs on a pool worker.
fn prepare_track(path: &Path) -> Result<PreparedTrack, String> {
    log::debug!(
        "Extracting: {}",
        path.file_name().and_then(|f| f.to_str()).unwrap_or("?")
    );

    let pcm = decode::load_audio(path).map_err(|e| e.to_string())?;
    let extraction = dsp::extract_fingerprints(&pcm).map_err(|e| e.to_string())?;

    let title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();
    let artist = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();

    Ok(PreparedTrack {
        meta: NewTrack {
            title,
            artist,
            source_ref: path.to_string_lossy().to_string(),
            frame_count: extraction.frame_count,
        },
        fingerprints: extraction.fingerprints,
    })
}

/// Stage, then commit, one prepared track. Returns false when the source was
/// already ingested. Any failure or cancellation after the id is reserved
/// aborts the reservation so no staged rows outlive this call.
fn write_track(
    db: &Database,
    track: &PreparedTrack,
    cancelled: &dyn Fn() -> bool,
) -> Result<bool, IngestError> {
    let id = match db.begin_ingest(&track.meta)? {
        BeginIngest::AlreadyIngested(id) => {
            log::debug!(
                "Skipping {} (already track {})",
                track.meta.source_ref,
                id
            );
            return Ok(false);
        }
        BeginIngest::Started(id) => id,
    };

    for batch in track.fingerprints.chunks(APPEND_BATCH) {
        if cancelled() {
            db.abort_ingest(id)?;
            return Err(IngestError::Cancelled);
        }
        if let Err(e) = db.append_fingerprints(id, batch) {
            db.abort_ingest(id).ok();
            return Err(e.into());
        }
    }

    if cancelled() {
        db.abort_ingest(id)?;
        return Err(IngestError::Cancelled);
    }
    if let Err(e) = db.commit_ingest(id) {
        db.abort_ingest(id).ok();
        return Err(e.into());
    }

    log::debug!(
        "Committed track {} ({} fingerprints, {} frames)",
        id,
        track.fingerprints.len(),
        track.meta.frame_count
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::testsig;

    fn prepared(source: &str, seconds: f64, seed: u64) -> PreparedTrack {
        let pcm = testsig::chirp_with_noise(seconds, 300.0, 3000.0, 0.05, seed);
        let extraction = dsp::extract_fingerprints(&pcm).unwrap();
        PreparedTrack {
            meta: NewTrack {
                title: source.to_string(),
                artist: "test".to_string(),
                source_ref: source.to_string(),
                frame_count: extraction.frame_count,
            },
            fingerprints: extraction.fingerprints,
        }
    }

    #[test]
    fn write_track_commits_and_skips_reingest() {
        let db = Database::open_in_memory().unwrap();
        let track = prepared("/music/a.wav", 3.0, 1);

        assert!(write_track(&db, &track, &|| false).unwrap());
        assert_eq!(db.stats().unwrap().track_count, 1);
        assert!(db.stats().unwrap().posting_count > 0);

        // Same source again: skipped, nothing duplicated.
        let before = db.stats().unwrap().posting_count;
        assert!(!write_track(&db, &track, &|| false).unwrap());
        assert_eq!(db.stats().unwrap().posting_count, before);
    }

    #[test]
    fn cancellation_mid_write_leaves_no_trace() {
        let db = Database::open_in_memory().unwrap();
        let track = prepared("/music/a.wav", 3.0, 1);

        // Cancel fires on the first poll after the id is reserved.
        match write_track(&db, &track, &|| true) {
            Err(IngestError::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }

        assert_eq!(db.stats().unwrap().track_count, 0);
        assert_eq!(db.stats().unwrap().posting_count, 0);
        let staged: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM hashes_staging", [], |r| r.get(0))
            .unwrap();
        assert_eq!(staged, 0);

        // The store is consistent: the same source ingests cleanly after.
        assert!(write_track(&db, &track, &|| false).unwrap());
        assert_eq!(db.stats().unwrap().track_count, 1);
    }

    #[test]
    fn collect_skips_unsupported_extensions() {
        let dir = std::env::temp_dir().join(format!("earmark_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.wav"), b"").unwrap();
        std::fs::write(dir.join("b.txt"), b"").unwrap();
        std::fs::write(dir.join("c.FLAC"), b"").unwrap();

        let files = collect_audio_files(&[dir.to_string_lossy().to_string()]);
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["a.wav", "c.FLAC"]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
