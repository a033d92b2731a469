use super::peaks::Peak;
use super::{DT_MAX, DT_MIN, FAN_OUT};

/// One fingerprint: a packed anchor/target hash plus the anchor's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: u64,
    pub anchor_time: u32,
}

const FREQ_BITS: u32 = 9;
const DT_BITS: u32 = 14;
const FREQ_MAX: u64 = (1 << FREQ_BITS) - 1;
const DT_FIELD_MAX: u64 = (1 << DT_BITS) - 1;

/// Pack an anchor bin, target bin and frame delta into one hash.
///
/// Layout (low to high): Δt in 14 bits, target bin in 9 bits, anchor bin in
/// 9 bits. Out-of-range fields saturate rather than wrap, so a widened bin
/// count can never silently alias two different relations. The layout is
/// frozen per database and recorded in the `meta` header.
pub fn pack_hash(f_anchor: u16, f_target: u16, dt: u32) -> u64 {
    let fa = (f_anchor as u64).min(FREQ_MAX);
    let fb = (f_target as u64).min(FREQ_MAX);
    let dt = (dt as u64).min(DT_FIELD_MAX);
    (fa << (FREQ_BITS + DT_BITS)) | (fb << DT_BITS) | dt
}

/// Inverse of `pack_hash`, for tests and debugging dumps.
pub fn unpack_hash(hash: u64) -> (u16, u16, u32) {
    let fa = (hash >> (FREQ_BITS + DT_BITS)) & FREQ_MAX;
    let fb = (hash >> DT_BITS) & FREQ_MAX;
    let dt = hash & DT_FIELD_MAX;
    (fa as u16, fb as u16, dt as u32)
}

/// Combine peaks into anchor/target fingerprints.
///
/// For each anchor, targets are taken in ascending `(t_frame, f_bin)` order
/// (the order `find_peaks` already emits) from the window
/// `Δt ∈ [DT_MIN, DT_MAX]`, at most `FAN_OUT` per anchor. Output is ordered
/// by anchor time, then pairing order. A degenerate peak list produces an
/// empty output, not an error.
pub fn pair_peaks(peaks: &[Peak]) -> Vec<Fingerprint> {
    let mut out = Vec::with_capacity(peaks.len() * FAN_OUT);

    for (i, anchor) in peaks.iter().enumerate() {
        let t_max = anchor.t_frame + DT_MAX;
        let mut emitted = 0;

        for target in &peaks[i + 1..] {
            if target.t_frame > t_max {
                break;
            }
            let dt = target.t_frame - anchor.t_frame;
            if dt < DT_MIN {
                continue;
            }
            out.push(Fingerprint {
                hash: pack_hash(anchor.f_bin, target.f_bin, dt),
                anchor_time: anchor.t_frame,
            });
            emitted += 1;
            if emitted >= FAN_OUT {
                break;
            }
        }
    }

    out
}
