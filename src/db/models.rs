/// Metadata supplied when ingest of a track begins.
#[derive(Debug, Clone)]
pub struct NewTrack {
    pub title: String,
    pub artist: String,
    /// Provenance key (canonical path or URL). Ingest is idempotent per
    /// `source_ref`: re-ingesting the same source returns the prior id.
    pub source_ref: String,
    pub frame_count: u32,
}

/// A committed track row.
#[derive(Debug, Clone)]
pub struct TrackRow {
    pub id: u32,
    pub title: String,
    pub artist: String,
    pub source_ref: String,
    pub frame_count: u32,
}

/// One inverted-index posting under a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub track_id: u32,
    pub anchor_time: u32,
}

/// Outcome of `begin_ingest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginIngest {
    /// A fresh id was reserved; the caller owns staging it to completion.
    Started(u32),
    /// This `source_ref` is already committed under the given id.
    AlreadyIngested(u32),
}

/// Library statistics for the CLI.
#[derive(Debug)]
pub struct IndexStats {
    pub track_count: i64,
    pub posting_count: i64,
    pub distinct_hashes: i64,
}
