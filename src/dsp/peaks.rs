use super::{
    HOP_SIZE, MAGNITUDE_PERCENTILE, NEIGHBORHOOD_BINS, NEIGHBORHOOD_FRAMES, PEAK_DENSITY_PER_SEC,
    SAMPLE_RATE,
};

/// A local maximum of the log-magnitude spectrogram.
///
/// Transient: peaks exist only between extraction and pairing, they are never
/// persisted. The magnitude rides along for the density cap and is dropped
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub t_frame: u32,
    pub f_bin: u16,
    pub magnitude: f32,
}

/// Pick spectral peaks from log-magnitude frames.
///
/// A bin qualifies iff it is strictly louder than every neighbor within
/// ±`NEIGHBORHOOD_FRAMES` frames and ±`NEIGHBORHOOD_BINS` bins, and strictly
/// above the `MAGNITUDE_PERCENTILE`th percentile of the whole pass.
/// Survivors are then capped at `PEAK_DENSITY_PER_SEC` per one-second bucket,
/// keeping the loudest (ties: lower bin, then earlier frame).
///
/// Output is ordered by `t_frame` ascending, then `f_bin` ascending.
pub fn find_peaks(frames: &[Vec<f32>]) -> Vec<Peak> {
    if frames.is_empty() {
        return Vec::new();
    }

    let threshold = magnitude_percentile(frames, MAGNITUDE_PERCENTILE);
    let candidates = local_maxima(frames, threshold);
    cap_density(candidates)
}

/// Percentile over every bin of every frame, nearest-rank.
fn magnitude_percentile(frames: &[Vec<f32>], pct: u8) -> f32 {
    let mut all: Vec<f32> = frames.iter().flatten().copied().collect();
    all.sort_unstable_by(f32::total_cmp);
    let idx = (all.len() * pct as usize / 100).min(all.len() - 1);
    all[idx]
}

fn local_maxima(frames: &[Vec<f32>], threshold: f32) -> Vec<Peak> {
    let n_frames = frames.len();
    let n_bins = frames[0].len();
    let dt = NEIGHBORHOOD_FRAMES as usize;
    let df = NEIGHBORHOOD_BINS as usize;

    let mut peaks = Vec::new();

    for t in 0..n_frames {
        let t_lo = t.saturating_sub(dt);
        let t_hi = (t + dt).min(n_frames - 1);

        for f in 0..n_bins {
            let val = frames[t][f];
            // Threshold gate first: it rejects most bins before the
            // neighborhood scan has to run.
            if val <= threshold {
                continue;
            }

            let f_lo = f.saturating_sub(df);
            let f_hi = (f + df).min(n_bins - 1);

            let mut is_peak = true;
            'scan: for tn in t_lo..=t_hi {
                let row = &frames[tn];
                for fn_ in f_lo..=f_hi {
                    if tn == t && fn_ == f {
                        continue;
                    }
                    if row[fn_] >= val {
                        is_peak = false;
                        break 'scan;
                    }
                }
            }

            if is_peak {
                peaks.push(Peak {
                    t_frame: t as u32,
                    f_bin: f as u16,
                    magnitude: val,
                });
            }
        }
    }

    peaks
}

/// Cap peaks per one-second bucket, keeping the loudest.
/// Ties break toward lower `f_bin`, then lower `t_frame`.
fn cap_density(candidates: Vec<Peak>) -> Vec<Peak> {
    let frames_per_sec = (SAMPLE_RATE as f32 / HOP_SIZE as f32).round() as u32;

    let mut buckets: Vec<Vec<Peak>> = Vec::new();
    for peak in candidates {
        let bucket = (peak.t_frame / frames_per_sec) as usize;
        if bucket >= buckets.len() {
            buckets.resize_with(bucket + 1, Vec::new);
        }
        buckets[bucket].push(peak);
    }

    let mut kept = Vec::new();
    for mut bucket in buckets {
        if bucket.len() > PEAK_DENSITY_PER_SEC {
            bucket.sort_unstable_by(|a, b| {
                b.magnitude
                    .total_cmp(&a.magnitude)
                    .then(a.f_bin.cmp(&b.f_bin))
                    .then(a.t_frame.cmp(&b.t_frame))
            });
            bucket.truncate(PEAK_DENSITY_PER_SEC);
        }
        kept.extend(bucket);
    }

    kept.sort_unstable_by(|a, b| a.t_frame.cmp(&b.t_frame).then(a.f_bin.cmp(&b.f_bin)));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::spectrogram::NUM_BINS;

    /// A quiet spectrogram with a handful of loud isolated bins.
    fn synthetic_frames(spikes: &[(usize, usize, f32)]) -> Vec<Vec<f32>> {
        let mut frames = vec![vec![0.01_f32; NUM_BINS]; 50];
        for &(t, f, mag) in spikes {
            frames[t][f] = mag;
        }
        frames
    }

    #[test]
    fn isolated_spikes_become_peaks() {
        let frames = synthetic_frames(&[(10, 100, 5.0), (20, 300, 4.0), (30, 50, 6.0)]);
        let peaks = find_peaks(&frames);
        assert_eq!(peaks.len(), 3);
        assert_eq!((peaks[0].t_frame, peaks[0].f_bin), (10, 100));
        assert_eq!((peaks[1].t_frame, peaks[1].f_bin), (20, 300));
        assert_eq!((peaks[2].t_frame, peaks[2].f_bin), (30, 50));
    }

    #[test]
    fn neighborhood_suppresses_adjacent_bins() {
        // Two spikes 5 bins apart inside the ±20 bin neighborhood: only the
        // louder survives.
        let frames = synthetic_frames(&[(10, 100, 5.0), (10, 105, 4.0)]);
        let peaks = find_peaks(&frames);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].f_bin, 100);
    }

    #[test]
    fn far_apart_bins_both_survive() {
        // 25 bins apart, outside ±20.
        let frames = synthetic_frames(&[(10, 100, 5.0), (10, 125, 4.0)]);
        let peaks = find_peaks(&frames);
        assert_eq!(peaks.len(), 2);
    }

    #[test]
    fn equal_neighbors_are_not_peaks() {
        // Strict inequality: a plateau produces no peak.
        let frames = synthetic_frames(&[(10, 100, 5.0), (10, 101, 5.0)]);
        let peaks = find_peaks(&frames);
        assert!(peaks.is_empty());
    }

    #[test]
    fn density_cap_keeps_loudest_per_second() {
        // 43 frames ≈ one second at 22050/512. Plant more spikes than the
        // cap allows, all in bucket 0, far enough apart to all be maxima.
        let mut frames = vec![vec![0.01_f32; NUM_BINS]; 43];
        let mut planted = 0;
        'outer: for t in (0..43).step_by(7) {
            for f in (40..NUM_BINS - 40).step_by(45) {
                frames[t][f] = 2.0 + planted as f32 * 0.01;
                planted += 1;
                if planted >= PEAK_DENSITY_PER_SEC + 10 {
                    break 'outer;
                }
            }
        }
        assert!(planted > PEAK_DENSITY_PER_SEC);

        let peaks = find_peaks(&frames);
        assert_eq!(peaks.len(), PEAK_DENSITY_PER_SEC);
        // The quietest plants are the ones dropped.
        let min_kept = peaks
            .iter()
            .map(|p| p.magnitude)
            .fold(f32::INFINITY, f32::min);
        assert!(min_kept >= 2.0 + 10.0 * 0.01 - 1e-6);
    }

    #[test]
    fn output_is_time_then_bin_ordered() {
        let frames = synthetic_frames(&[(30, 50, 6.0), (10, 400, 5.0), (10, 100, 5.5)]);
        let peaks = find_peaks(&frames);
        let order: Vec<(u32, u16)> = peaks.iter().map(|p| (p.t_frame, p.f_bin)).collect();
        assert_eq!(order, vec![(10, 100), (10, 400), (30, 50)]);
    }

    #[test]
    fn empty_spectrogram_yields_no_peaks() {
        assert!(find_peaks(&[]).is_empty());
    }
}
