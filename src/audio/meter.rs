//! Output volume metering.
//!
//! [`VolumeMeter`] reduces the most recent output samples to one level in
//! `[0.0, 1.0]` the way a browser `AnalyserNode` does for its byte
//! frequency data:
//!
//! 1. Hann window over the last [`FFT_SIZE`] samples (zero-padded in front).
//! 2. Real FFT, magnitude of each of the `FFT_SIZE / 2` bins scaled by
//!    `1 / FFT_SIZE`, then smoothed over time per bin.
//! 3. Each bin converted to dB and mapped from `[MIN_DB, MAX_DB]` onto
//!    `[0, 1]`, clamped.
//! 4. The mean over all bins.
//!
//! # Example
//!
//! ```rust
//! use live_tutor::audio::VolumeMeter;
//!
//! let mut meter = VolumeMeter::new();
//! assert_eq!(meter.level(&[0.0; 256]), 0.0);
//! ```

use std::sync::Arc;
use std::time::Duration;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use tokio::task::JoinHandle;

use crate::audio::playback::OutputTap;

pub const FFT_SIZE: usize = 256;
pub const MIN_DB: f32 = -100.0;
pub const MAX_DB: f32 = -30.0;
pub const DEFAULT_SMOOTHING: f32 = 0.8;

// ---------------------------------------------------------------------------
// VolumeMeter
// ---------------------------------------------------------------------------

pub struct VolumeMeter {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    smoothing: f32,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::with_smoothing(DEFAULT_SMOOTHING)
    }

    /// `smoothing` in `[0, 1)`: weight of the previous reading per bin.
    pub fn with_smoothing(smoothing: f32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        let window = (0..FFT_SIZE)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / FFT_SIZE as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        Self {
            input: fft.make_input_vec(),
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            fft,
            window,
            smoothed: vec![0.0; FFT_SIZE / 2],
            smoothing: smoothing.clamp(0.0, 0.99),
        }
    }

    /// Level of `samples` (oldest first; only the newest [`FFT_SIZE`] count).
    pub fn level(&mut self, samples: &[f32]) -> f32 {
        let take = samples.len().min(FFT_SIZE);
        self.input.fill(0.0);
        self.input[FFT_SIZE - take..].copy_from_slice(&samples[samples.len() - take..]);
        for (x, w) in self.input.iter_mut().zip(&self.window) {
            *x *= w;
        }

        if let Err(e) =
            self.fft
                .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
        {
            log::debug!("meter: fft failed: {e}");
            return 0.0;
        }

        let scale = 1.0 / FFT_SIZE as f32;
        let tau = self.smoothing;
        let mut total = 0.0;
        for (prev, bin) in self.smoothed.iter_mut().zip(&self.spectrum) {
            *prev = tau * *prev + (1.0 - tau) * bin.norm() * scale;
            total += normalize_db(*prev);
        }
        total / self.smoothed.len() as f32
    }

    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear magnitude → `[0, 1]` over the `[MIN_DB, MAX_DB]` range.
fn normalize_db(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    ((db - MIN_DB) / (MAX_DB - MIN_DB)).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Metering task
// ---------------------------------------------------------------------------

/// Sample `tap` every `interval` and hand each level to `emit`. Stops when
/// `emit` returns `false` or the task is aborted.
pub fn spawn_meter<F>(tap: Arc<dyn OutputTap>, interval: Duration, mut emit: F) -> JoinHandle<()>
where
    F: FnMut(f32) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut meter = VolumeMeter::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !emit(meter.level(&tap.recent_samples())) {
                break;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
