pub mod pairs;
pub mod peaks;
pub mod spectrogram;

use thiserror::Error;

use pairs::Fingerprint;
use peaks::Peak;
use spectrogram::Stft;

// Extraction parameters. These are build-time constants, not configuration:
// the packed hash is only comparable between ingest and query when every one
// of them matches, so the set is recorded in the database header and verified
// on open (see `db`).
pub const SAMPLE_RATE: u32 = 22050;
pub const WINDOW_SIZE: usize = 2048;
pub const HOP_SIZE: usize = 512;
pub const WINDOW_TYPE: &str = "hann";
pub const NEIGHBORHOOD_FRAMES: u32 = 3;
pub const NEIGHBORHOOD_BINS: u16 = 20;
pub const MAGNITUDE_PERCENTILE: u8 = 85;
pub const PEAK_DENSITY_PER_SEC: usize = 30;
pub const FAN_OUT: usize = 5;
pub const DT_MIN: u32 = 1;
pub const DT_MAX: u32 = 100;
pub const HASH_LAYOUT_VERSION: u32 = 1;

/// Seconds per STFT frame.
pub fn frame_duration() -> f64 {
    HOP_SIZE as f64 / SAMPLE_RATE as f64
}

/// More than this fraction of non-finite samples rejects the input outright;
/// anything below is absorbed (the samples are zeroed and counted).
const MAX_NON_FINITE_RATIO: f64 = 0.01;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("corrupt input: {bad} of {total} samples are non-finite")]
    CorruptInput { bad: u64, total: u64 },
}

/// Everything one extraction pass produces for a track or query.
#[derive(Debug)]
pub struct Extraction {
    pub fingerprints: Vec<Fingerprint>,
    pub frame_count: u32,
}

/// Run the full pipeline: PCM → spectrogram → peaks → fingerprints.
///
/// Expects mono samples at `SAMPLE_RATE` (the decoder boundary resamples).
/// Input shorter than one window produces an empty extraction, not an error.
pub fn extract_fingerprints(pcm: &[f32]) -> Result<Extraction, ExtractError> {
    let (peaks, frame_count) = extract_peaks(pcm)?;
    let fingerprints = pairs::pair_peaks(&peaks);
    log::debug!(
        "extracted {} peaks, {} fingerprints from {} frames",
        peaks.len(),
        fingerprints.len(),
        frame_count
    );
    Ok(Extraction {
        fingerprints,
        frame_count,
    })
}

/// Spectrogram + peak picking only, without the pairing stage.
pub fn extract_peaks(pcm: &[f32]) -> Result<(Vec<Peak>, u32), ExtractError> {
    let mut stft = Stft::new();
    stft.feed(pcm);
    let (frames, stats) = stft.finish();

    if stats.total > 0 {
        let ratio = stats.non_finite as f64 / stats.total as f64;
        if ratio > MAX_NON_FINITE_RATIO {
            return Err(ExtractError::CorruptInput {
                bad: stats.non_finite,
                total: stats.total,
            });
        }
    }

    let frame_count = frames.len() as u32;
    Ok((peaks::find_peaks(&frames), frame_count))
}

/// Deterministic synthetic signals shared by the DSP, matcher and ingest
/// tests. Real fixtures would bloat the repo; a chirp through noise exercises
/// the same paths.
#[cfg(test)]
pub(crate) mod testsig {
    use super::SAMPLE_RATE;

    /// Tiny LCG so tests never depend on an RNG crate or global state.
    pub struct Lcg(u64);

    impl Lcg {
        pub fn new(seed: u64) -> Self {
            Lcg(seed.wrapping_mul(2862933555777941757).wrapping_add(3037000493))
        }

        /// Uniform in [-1, 1).
        pub fn next_f32(&mut self) -> f32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 40) as f32 / (1 << 23) as f32) - 1.0
        }
    }

    /// Linear chirp from `f0` to `f1` Hz with additive noise. The sweep gives
    /// the peak picker a clean ridge to lock onto at every second of the
    /// track, which is what a melodic reference looks like to the extractor.
    pub fn chirp_with_noise(seconds: f64, f0: f64, f1: f64, noise_amp: f32, seed: u64) -> Vec<f32> {
        let n = (seconds * SAMPLE_RATE as f64) as usize;
        let mut rng = Lcg::new(seed);
        (0..n)
            .map(|i| {
                let t = i as f64 / SAMPLE_RATE as f64;
                let phase =
                    2.0 * std::f64::consts::PI * (f0 * t + (f1 - f0) * t * t / (2.0 * seconds));
                0.5 * phase.sin() as f32 + noise_amp * rng.next_f32()
            })
            .collect()
    }

    /// Pure noise clip, for unknown-query scenarios.
    pub fn noise(seconds: f64, amp: f32, seed: u64) -> Vec<f32> {
        let n = (seconds * SAMPLE_RATE as f64) as usize;
        let mut rng = Lcg::new(seed);
        (0..n).map(|_| amp * rng.next_f32()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_is_deterministic() {
        let pcm = testsig::chirp_with_noise(3.0, 300.0, 3000.0, 0.05, 42);
        let a = extract_fingerprints(&pcm).unwrap();
        let b = extract_fingerprints(&pcm).unwrap();
        assert_eq!(a.fingerprints, b.fingerprints);
        assert_eq!(a.frame_count, b.frame_count);
        assert!(!a.fingerprints.is_empty());
    }

    #[test]
    fn anchor_times_stay_inside_track() {
        let pcm = testsig::chirp_with_noise(2.0, 400.0, 2000.0, 0.05, 7);
        let ex = extract_fingerprints(&pcm).unwrap();
        assert!(ex.fingerprints.iter().all(|f| f.anchor_time < ex.frame_count));
    }

    #[test]
    fn short_input_is_empty_not_error() {
        let ex = extract_fingerprints(&[0.1; 100]).unwrap();
        assert_eq!(ex.frame_count, 0);
        assert!(ex.fingerprints.is_empty());
    }

    #[test]
    fn mostly_nan_input_is_corrupt() {
        let mut pcm = testsig::noise(1.0, 0.3, 1);
        let bad = pcm.len() / 50; // 2%
        for s in pcm.iter_mut().take(bad) {
            *s = f32::NAN;
        }
        match extract_fingerprints(&pcm) {
            Err(ExtractError::CorruptInput { bad: b, .. }) => assert_eq!(b, bad as u64),
            other => panic!("expected CorruptInput, got {:?}", other),
        }
    }

    #[test]
    fn sparse_nan_input_is_absorbed() {
        let mut pcm = testsig::chirp_with_noise(2.0, 400.0, 2000.0, 0.05, 9);
        let bad = pcm.len() / 500; // 0.2%
        for s in pcm.iter_mut().take(bad) {
            *s = f32::INFINITY;
        }
        assert!(extract_fingerprints(&pcm).is_ok());
    }
}
