use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::{HOP_SIZE, WINDOW_SIZE};

/// Number of magnitude bins per frame (real input, half spectrum + DC).
pub const NUM_BINS: usize = WINDOW_SIZE / 2 + 1;

/// Counts kept while feeding samples, used to decide whether the input
/// was usable at all (see `ExtractError::CorruptInput`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleStats {
    pub total: u64,
    pub non_finite: u64,
}

/// Streaming short-time Fourier transform.
///
/// Samples arrive in chunks of any size; a ring buffer holds the tail that
/// hasn't formed a full window yet. Each emitted frame is the log-compressed
/// magnitude spectrum `ln(1 + |S|)` of one Hann-windowed slice.
///
/// The FFT plan and window are owned by this instance, so each worker builds
/// its own; extraction passes share no mutable state.
pub struct Stft {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    ring: VecDeque<f32>,
    scratch: Vec<Complex<f32>>,
    frames: Vec<Vec<f32>>,
    stats: SampleStats,
}

impl Stft {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            fft: planner.plan_fft_forward(WINDOW_SIZE),
            window: hann_window(WINDOW_SIZE),
            ring: VecDeque::with_capacity(WINDOW_SIZE + HOP_SIZE),
            scratch: vec![Complex::default(); WINDOW_SIZE],
            frames: Vec::new(),
            stats: SampleStats::default(),
        }
    }

    /// Feed a chunk of mono PCM. Non-finite samples are zeroed and counted;
    /// the caller decides afterwards whether the count is fatal.
    pub fn feed(&mut self, samples: &[f32]) {
        self.stats.total += samples.len() as u64;
        for &s in samples {
            if s.is_finite() {
                self.ring.push_back(s);
            } else {
                self.stats.non_finite += 1;
                self.ring.push_back(0.0);
            }
        }

        while self.ring.len() >= WINDOW_SIZE {
            self.emit_frame();
            self.ring.drain(..HOP_SIZE);
        }
    }

    /// Consume the transform, returning all magnitude frames and the sample
    /// counts. Input shorter than one window yields zero frames.
    pub fn finish(self) -> (Vec<Vec<f32>>, SampleStats) {
        (self.frames, self.stats)
    }

    fn emit_frame(&mut self) {
        for (i, c) in self.scratch.iter_mut().enumerate() {
            *c = Complex {
                re: self.ring[i] * self.window[i],
                im: 0.0,
            };
        }
        self.fft.process(&mut self.scratch);

        let mags: Vec<f32> = self.scratch[..NUM_BINS]
            .iter()
            .map(|c| c.norm().ln_1p())
            .collect();
        self.frames.push(mags);
    }
}

impl Default for Stft {
    fn default() -> Self {
        Self::new()
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (n - 1.0)).cos()))
        .collect()
}
