//! # Spectrum Analyser
//!
//! Produces byte-range frequency magnitudes from the most recent window of a
//! waveform, the same shape of data the band reducer consumes.
//!
//! ## Processing steps (per frame):
//! 1. Copy the last `fft_size` samples out of a ring buffer, Blackman-windowed
//! 2. Forward FFT (rustfft) using pre-allocated input and scratch buffers
//! 3. Normalise magnitudes and smooth them against the previous frame
//! 4. Map decibels linearly from `min_db..max_db` onto `0..=255`
//!
//! All buffers are allocated once in `new`; computing a frame allocates nothing.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::config::VisualizationConfig;

pub struct SpectrumAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    history: Vec<f32>,
    write_pos: usize,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl SpectrumAnalyser {
    /// Create an analyser. `fft_size` must be a power of two.
    pub fn new(fft_size: usize, smoothing: f32, min_db: f32, max_db: f32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();

        let window = (0..fft_size)
            .map(|n| {
                let phase = 2.0 * PI * n as f32 / fft_size as f32;
                0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
            })
            .collect();

        Self {
            fft_size,
            fft,
            window,
            history: vec![0.0; fft_size],
            write_pos: 0,
            spectrum: vec![Complex::new(0.0, 0.0); fft_size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            smoothed: vec![0.0; fft_size / 2],
            smoothing: smoothing.clamp(0.0, 0.99),
            min_db,
            max_db,
        }
    }

    pub fn from_config(config: &VisualizationConfig) -> Self {
        Self::new(
            config.fft_size,
            config.smoothing,
            config.min_decibels,
            config.max_decibels,
        )
    }

    /// Number of magnitude bins a frame produces.
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Append rendered or captured samples to the analysis window.
    pub fn push_samples(&mut self, samples: &[f32]) {
        // Only the tail can survive in the window
        let tail = if samples.len() > self.fft_size {
            &samples[samples.len() - self.fft_size..]
        } else {
            samples
        };
        for &sample in tail {
            self.history[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.fft_size;
        }
    }

    /// Compute one frame of byte magnitudes into `out`.
    ///
    /// Writes `min(out.len(), frequency_bin_count())` bins; the rest of `out`
    /// is left untouched.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        for i in 0..self.fft_size {
            let sample = self.history[(self.write_pos + i) % self.fft_size];
            self.spectrum[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);

        let norm = 1.0 / self.fft_size as f32;
        let range = self.max_db - self.min_db;
        let bins = out.len().min(self.smoothed.len());
        for k in 0..self.smoothed.len() {
            let magnitude = self.spectrum[k].norm() * norm;
            self.smoothed[k] =
                self.smoothing * self.smoothed[k] + (1.0 - self.smoothing) * magnitude;
            if k < bins {
                out[k] = Self::to_byte(self.smoothed[k], self.min_db, range);
            }
        }
    }

    /// Forget the window and smoothing history.
    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.smoothed.fill(0.0);
        self.write_pos = 0;
    }

    fn to_byte(magnitude: f32, min_db: f32, range: f32) -> u8 {
        if magnitude <= 0.0 {
            return 0;
        }
        let db = 20.0 * magnitude.log10();
        let scaled = (db - min_db) / range * 255.0;
        scaled.clamp(0.0, 255.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| (2.0 * PI * freq * n as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn test_silence_produces_zero_bytes() {
        let mut analyser = SpectrumAnalyser::new(256, 0.0, -100.0, -30.0);
        analyser.push_samples(&[0.0; 256]);
        let mut out = vec![7u8; 128];
        analyser.byte_frequency_data(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sine_peaks_at_its_bin() {
        let sample_rate = 48_000.0;
        let mut analyser = SpectrumAnalyser::new(2048, 0.0, -100.0, -30.0);
        analyser.push_samples(&sine(1_000.0, sample_rate, 4096));

        let mut out = vec![0u8; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut out);

        let peak = out
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .map(|(i, _)| i)
            .unwrap();
        // 48000 / 2048 = 23.4375 Hz per bin → 1 kHz sits between bins 42 and 43
        assert!((42..=43).contains(&peak), "peak at bin {}", peak);
        assert_eq!(out[peak], 255);
    }

    #[test]
    fn test_smoothing_decays_towards_silence() {
        let mut analyser = SpectrumAnalyser::new(512, 0.8, -100.0, 0.0);
        analyser.push_samples(&sine(3_000.0, 48_000.0, 512));
        let mut loud = vec![0u8; 256];
        analyser.byte_frequency_data(&mut loud);

        analyser.push_samples(&[0.0; 512]);
        let mut after = vec![0u8; 256];
        analyser.byte_frequency_data(&mut after);

        let loud_peak = *loud.iter().max().unwrap();
        let after_peak = *after.iter().max().unwrap();
        assert!(after_peak > 0, "smoothing keeps some energy");
        assert!(after_peak < loud_peak);
    }

    #[test]
    fn test_short_output_buffer_is_partially_filled() {
        let signal = sine(500.0, 48_000.0, 256);
        let mut full = SpectrumAnalyser::new(256, 0.0, -100.0, -30.0);
        let mut partial = SpectrumAnalyser::new(256, 0.0, -100.0, -30.0);
        full.push_samples(&signal);
        partial.push_samples(&signal);

        let mut all_bins = vec![0u8; 128];
        let mut first_bins = vec![0u8; 8];
        full.byte_frequency_data(&mut all_bins);
        partial.byte_frequency_data(&mut first_bins);
        assert_eq!(&all_bins[..8], &first_bins[..]);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut analyser = SpectrumAnalyser::new(256, 0.5, -100.0, -30.0);
        analyser.push_samples(&sine(2_000.0, 48_000.0, 256));
        let mut out = vec![0u8; 128];
        analyser.byte_frequency_data(&mut out);
        analyser.reset();
        analyser.byte_frequency_data(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }
}
