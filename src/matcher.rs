use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::db::{Database, DbError};
use crate::dsp::{self, ExtractError};

/// How often the lookup loop polls for cancellation and the deadline.
const POLL_INTERVAL: usize = 64;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("query cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    /// At least one candidate cleared `min_support`.
    Ok,
    /// Nothing matched. A successful outcome, not an error.
    Empty,
    /// The deadline expired mid-query; results are best-effort.
    Partial,
}

/// One ranked candidate.
#[derive(Debug, Clone)]
pub struct TrackMatch {
    pub track_id: u32,
    pub title: String,
    pub artist: String,
    /// Height of the tallest offset-histogram bucket.
    pub score: u32,
    /// Where the query aligns in the reference, in seconds.
    pub offset_seconds: f64,
}

#[derive(Debug)]
pub struct Recognition {
    pub status: MatchStatus,
    pub results: Vec<TrackMatch>,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchParams {
    /// Ranked candidates to return. Ties at the boundary are all included,
    /// so the result may be longer.
    pub topk: usize,
    /// Minimum histogram-mode height for a candidate to count at all.
    pub min_support: u32,
    /// Wall-clock budget; when it runs out the best completed scoring is
    /// returned with `MatchStatus::Partial`.
    pub deadline: Option<Duration>,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            topk: 3,
            min_support: 5,
            deadline: None,
        }
    }
}

/// Recognize a snippet against the index.
///
/// For every query fingerprint, each posting votes for its track at offset
/// `δ = t_ref − t_query`. A true match concentrates votes in one bucket (the
/// query aligns at a single offset into the reference); chance hash
/// collisions spread uniformly. The mode of each track's histogram is its
/// score.
pub fn recognize(
    db: &Database,
    pcm: &[f32],
    params: &MatchParams,
    cancel: Option<&AtomicBool>,
) -> Result<Recognition, MatchError> {
    let start = Instant::now();
    let extraction = dsp::extract_fingerprints(pcm)?;

    if extraction.fingerprints.is_empty() {
        log::debug!("query produced no fingerprints");
        return Ok(Recognition {
            status: MatchStatus::Empty,
            results: Vec::new(),
        });
    }

    // track_id → offset bucket → votes, one frame per bucket. Only tracks
    // that actually appear in postings ever allocate a histogram.
    let mut histograms: HashMap<u32, HashMap<i32, u32>> = HashMap::new();
    let mut partial = false;

    for (i, fp) in extraction.fingerprints.iter().enumerate() {
        if i % POLL_INTERVAL == 0 {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(MatchError::Cancelled);
            }
            if let Some(budget) = params.deadline {
                if start.elapsed() > budget {
                    log::warn!(
                        "query deadline exceeded after {} of {} fingerprints",
                        i,
                        extraction.fingerprints.len()
                    );
                    partial = true;
                    break;
                }
            }
        }

        for posting in db.lookup(fp.hash)? {
            let delta = posting.anchor_time as i64 - fp.anchor_time as i64;
            *histograms
                .entry(posting.track_id)
                .or_default()
                .entry(delta as i32)
                .or_default() += 1;
        }
    }

    let mut candidates = score_candidates(histograms, params.min_support);
    rank(&mut candidates);
    truncate_with_ties(&mut candidates, params.topk);

    let mut results = Vec::with_capacity(candidates.len());
    for (track_id, score, delta) in candidates {
        // Committed postings always have a track row; a miss here would mean
        // the index integrity invariant is broken.
        let info = db
            .track_info(track_id)?
            .ok_or(DbError::UnknownTrack(track_id))?;
        results.push(TrackMatch {
            track_id,
            title: info.title,
            artist: info.artist,
            score,
            offset_seconds: delta as f64 * dsp::frame_duration(),
        });
    }

    let status = if partial {
        MatchStatus::Partial
    } else if results.is_empty() {
        MatchStatus::Empty
    } else {
        MatchStatus::Ok
    };
    Ok(Recognition { status, results })
}

/// Collapse histograms to `(track_id, mode height, mode offset)`.
///
/// A track whose *total* vote count is below `min_support` can never reach it
/// in a single bucket, so those are dropped before the mode scan.
fn score_candidates(
    histograms: HashMap<u32, HashMap<i32, u32>>,
    min_support: u32,
) -> Vec<(u32, u32, i32)> {
    let mut out = Vec::new();
    for (track_id, hist) in histograms {
        let total: u32 = hist.values().sum();
        if total < min_support {
            continue;
        }
        // Mode; ties break toward the smaller offset for determinism.
        let (delta, count) = hist
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .unwrap_or((0, 0));
        if count >= min_support {
            out.push((track_id, count, delta));
        }
    }
    out
}

fn rank(candidates: &mut [(u32, u32, i32)]) {
    candidates.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
}

/// Keep the top K, plus anything tied with the Kth score.
fn truncate_with_ties(candidates: &mut Vec<(u32, u32, i32)>, topk: usize) {
    if topk == 0 {
        candidates.clear();
        return;
    }
    if candidates.len() <= topk {
        return;
    }
    let boundary = candidates[topk - 1].1;
    let cut = candidates
        .iter()
        .position(|c| c.1 < boundary)
        .unwrap_or(candidates.len());
    candidates.truncate(cut.max(topk));
}
