//! Spectrum analyser producing byte-scaled frequency levels
//!
//! Mirrors the browser `AnalyserNode`: Blackman window over the most recent
//! `fft_size` samples, magnitude normalised by the FFT size, exponential
//! smoothing across calls, then decibels mapped linearly onto 0..=255
//! between `min_decibels` and `max_decibels`.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use crate::config::SpeakingConfig;
use crate::error::{AppError, Result};

pub struct SpectrumAnalyser {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
}

impl SpectrumAnalyser {
    pub fn new(config: &SpeakingConfig) -> Result<Self> {
        let size = config.fft_size;
        if size < 32 || !size.is_power_of_two() {
            return Err(AppError::Config(format!(
                "fft_size must be a power of two >= 32, got {}",
                size
            )));
        }
        if config.max_decibels <= config.min_decibels {
            return Err(AppError::Config(
                "max_decibels must be greater than min_decibels".to_string(),
            ));
        }

        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();

        Ok(Self {
            fft,
            window: blackman(size),
            history: VecDeque::from(vec![0.0; size]),
            input,
            spectrum,
            scratch,
            smoothed: vec![0.0; size / 2],
            smoothing: config.smoothing.clamp(0.0, 1.0),
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
        })
    }

    /// Number of frequency bins (half the FFT size)
    pub fn bin_count(&self) -> usize {
        self.smoothed.len()
    }

    /// Append time-domain samples; only the most recent `fft_size` are kept
    pub fn push_samples(&mut self, samples: &[f32]) {
        let size = self.window.len();
        let samples = if samples.len() > size {
            &samples[samples.len() - size..]
        } else {
            samples
        };
        for &s in samples {
            self.history.pop_front();
            self.history.push_back(s);
        }
    }

    /// Current byte frequency data
    pub fn byte_frequency_data(&mut self) -> Result<Vec<u8>> {
        for ((dst, src), w) in self.input.iter_mut().zip(self.history.iter()).zip(&self.window) {
            *dst = src * w;
        }

        self.fft
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .map_err(|e| AppError::Internal(format!("FFT failed: {}", e)))?;

        let size = self.window.len() as f32;
        let range = self.max_decibels - self.min_decibels;
        let tau = self.smoothing;

        let bytes = self
            .smoothed
            .iter_mut()
            .zip(&self.spectrum)
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() / size;
                *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;

                let db = 20.0 * smoothed.log10();
                let scaled = 255.0 / range * (db - self.min_decibels);
                if scaled.is_nan() {
                    0
                } else {
                    scaled.clamp(0.0, 255.0) as u8
                }
            })
            .collect();

        Ok(bytes)
    }

    /// Mean of the byte frequency data
    pub fn average_level(&mut self) -> Result<f32> {
        let data = self.byte_frequency_data()?;
        let sum: u32 = data.iter().map(|&b| b as u32).sum();
        Ok(sum as f32 / data.len() as f32)
    }
}

fn blackman(size: usize) -> Vec<f32> {
    const ALPHA: f32 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a1 = 0.5;
    let a2 = 0.5 * ALPHA;
    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}
