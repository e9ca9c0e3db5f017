use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::config::Config;

/// Tuning for turning magnitudes into bar heights.
#[derive(Debug, Clone)]
pub struct SpectrumSettings {
    pub num_bars: usize,
    pub max_freq: f32,
    pub max_value: f32,
    pub decay: f32,
    pub smoothing: f32,
    pub log_exponent: f32,
    pub log_scale: f32,
    pub bar_exponent: f32,
}

impl From<&Config> for SpectrumSettings {
    fn from(config: &Config) -> Self {
        Self {
            num_bars: config.num_bars.max(1),
            max_freq: config.max_freq,
            max_value: config.max_db_value,
            decay: config.decay,
            smoothing: config.smoothing,
            log_exponent: config.log_exponent,
            log_scale: config.log_scale,
            bar_exponent: config.bar_exponent,
        }
    }
}

/// Windowed FFT plus the bar mapping, scaling and smoothing on top of it.
///
/// The window, FFT plan and bin map depend on the chunk length and sample
/// rate, so they are rebuilt whenever a chunk arrives with different ones.
pub struct SpectrumProcessor {
    settings: SpectrumSettings,
    planner: FftPlanner<f32>,
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    sample_rate: u32,
    window: Vec<f32>,
    bin_map: Vec<usize>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// Last published frame, already clipped.
    last: Option<Vec<f32>>,
}

impl SpectrumProcessor {
    pub fn new(settings: SpectrumSettings, size: usize, sample_rate: u32) -> Self {
        let size = size.max(1);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();

        Self {
            window: hann_window(size),
            bin_map: build_bin_map(
                size,
                sample_rate,
                settings.num_bars,
                settings.max_freq,
                settings.bar_exponent,
            ),
            settings,
            planner,
            fft,
            size,
            sample_rate,
            buffer: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            last: None,
        }
    }

    pub fn num_bars(&self) -> usize {
        self.settings.num_bars
    }

    #[cfg(test)]
    pub fn bin_map(&self) -> &[usize] {
        &self.bin_map
    }

    /// Analyse one chunk of mono samples and return the next display frame.
    pub fn process(&mut self, samples: &[f32], sample_rate: u32) -> Vec<f32> {
        if samples.is_empty() {
            return self.decay().unwrap_or_else(|| vec![0.0; self.num_bars()]);
        }
        self.configure(samples.len(), sample_rate);

        // Hann window, into complex
        for ((slot, &s), &w) in self.buffer.iter_mut().zip(samples).zip(&self.window) {
            *slot = Complex::new(s * w, 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        // Non-negative frequencies only, the same bins a real-input FFT yields.
        let norm = self.size as f32;
        let magnitudes: Vec<f32> = self.buffer[..num_fft_bins(self.size)]
            .iter()
            .map(|c| c.norm() / norm)
            .collect();

        let peaks = group_into_bars(&magnitudes, &self.bin_map);
        let s = &self.settings;
        let mut frame: Vec<f32> = peaks
            .iter()
            .map(|&m| s.log_scale * (1.0 + m.powf(s.log_exponent)).ln())
            .collect();

        if let Some(last) = &self.last {
            for (new, &old) in frame.iter_mut().zip(last) {
                *new = s.smoothing * *new + (1.0 - s.smoothing) * old;
            }
        }

        self.publish(frame)
    }

    /// Nothing new to analyse: let the previous frame fall. `None` until the
    /// first chunk has been processed.
    pub fn decay(&mut self) -> Option<Vec<f32>> {
        let factor = self.settings.decay;
        let frame: Vec<f32> = self.last.as_ref()?.iter().map(|v| v * factor).collect();
        Some(self.publish(frame))
    }

    fn publish(&mut self, mut frame: Vec<f32>) -> Vec<f32> {
        let max = self.settings.max_value;
        for v in frame.iter_mut() {
            // NaN would survive `clamp`, so map it to zero first.
            *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, max) };
        }
        self.last = Some(frame.clone());
        frame
    }

    fn configure(&mut self, size: usize, sample_rate: u32) {
        if size == self.size && sample_rate == self.sample_rate {
            return;
        }
        log::debug!(
            "Spectrum layout {}@{}Hz -> {}@{}Hz",
            self.size,
            self.sample_rate,
            size,
            sample_rate
        );
        self.size = size;
        self.sample_rate = sample_rate;
        self.fft = self.planner.plan_fft_forward(size);
        self.window = hann_window(size);
        self.bin_map = build_bin_map(
            size,
            sample_rate,
            self.settings.num_bars,
            self.settings.max_freq,
            self.settings.bar_exponent,
        );
        self.buffer = vec![Complex::new(0.0, 0.0); size];
        self.scratch = vec![Complex::new(0.0, 0.0); self.fft.get_inplace_scratch_len()];
    }
}

/// Number of bins a real-input FFT of `size` samples produces.
pub fn num_fft_bins(size: usize) -> usize {
    size / 2 + 1
}

/// Symmetric Hann window. Reduces spectral leakage at chunk boundaries.
fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos()))
        .collect()
}

/// Edges of `num_bars` bars as FFT bin indices (`num_bars + 1` entries).
///
/// Edge `i` sits at `max_freq * (i / num_bars)^exponent`, capped at Nyquist,
/// and maps to the first bin whose centre frequency is not below it. The
/// result is non-decreasing and every index is a valid bin.
pub fn build_bin_map(
    size: usize,
    sample_rate: u32,
    num_bars: usize,
    max_freq: f32,
    exponent: f32,
) -> Vec<usize> {
    let bins = num_fft_bins(size.max(1));
    let bin_hz = sample_rate as f32 / size.max(1) as f32;
    let nyquist = (bins - 1) as f32 * bin_hz;
    let top = max_freq.max(0.0).min(nyquist);
    let num_bars = num_bars.max(1);

    (0..=num_bars)
        .map(|i| {
            let edge = top * (i as f32 / num_bars as f32).powf(exponent);
            let idx = (0..bins).position(|k| k as f32 * bin_hz >= edge);
            idx.unwrap_or(bins).min(bins - 1)
        })
        .collect()
}

/// Peak magnitude within each bar's bin range. Empty ranges give zero.
fn group_into_bars(magnitudes: &[f32], bin_map: &[usize]) -> Vec<f32> {
    bin_map
        .windows(2)
        .map(|edge| {
            let (start, end) = (edge[0], edge[1].min(magnitudes.len()));
            if start < end {
                magnitudes[start..end].iter().copied().fold(0.0, f32::max)
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SpectrumSettings {
        SpectrumSettings::from(&Config::default())
    }

    fn sine(freq: f32, sample_rate: u32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn bin_map_is_monotonic_and_in_range() {
        for &(size, rate, bars, max_freq) in &[
            (1024, 44_100, 100, 8000.0),
            (2048, 48_000, 64, 20_000.0),
            (256, 8000, 100, 8000.0),
            (16, 22_050, 300, 1000.0),
            (1, 44_100, 10, 8000.0),
        ] {
            let map = build_bin_map(size, rate, bars, max_freq, 1.2);
            assert_eq!(map.len(), bars + 1);
            assert!(map.windows(2).all(|w| w[0] <= w[1]), "{size} {rate} {bars}");
            assert!(map.iter().all(|&i| i < num_fft_bins(size)));
        }
    }

    #[test]
    fn bin_map_spends_more_bars_on_low_end() {
        let map = build_bin_map(1024, 44_100, 100, 8000.0, 1.2);
        assert_eq!(map[0], 0);
        // 8 kHz at ~43 Hz per bin
        assert_eq!(map[100], 186);
        let low = map[10] - map[0];
        let high = map[100] - map[90];
        assert!(low < high);
    }

    #[test]
    fn frames_have_bar_count_and_stay_in_range() {
        let mut p = SpectrumProcessor::new(settings(), 1024, 44_100);
        for amp in [0.0, 0.01, 1.0, 1000.0] {
            let frame = p.process(&sine(440.0, 44_100, 1024, amp), 44_100);
            assert_eq!(frame.len(), 100);
            assert!(frame.iter().all(|&v| (0.0..=90.0).contains(&v)), "{amp}");
        }
    }

    #[test]
    fn tone_peaks_in_matching_bar() {
        let mut p = SpectrumProcessor::new(settings(), 1024, 44_100);
        let frame = p.process(&sine(1000.0, 44_100, 1024, 0.05), 44_100);
        let loudest = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        let map = p.bin_map();
        let bin = (1000.0_f32 / (44_100.0 / 1024.0)).round() as usize;
        assert!(map[loudest] <= bin + 1 && bin <= map[loudest + 1] + 1);
    }

    #[test]
    fn smoothing_blends_with_previous_frame() {
        let mut p = SpectrumProcessor::new(settings(), 1024, 44_100);
        let tone = sine(440.0, 44_100, 1024, 0.5);
        let first = p.process(&tone, 44_100);
        let second = p.process(&vec![0.0; 1024], 44_100);
        for (a, b) in first.iter().zip(&second) {
            assert!((b - 0.4 * a).abs() < 1e-3);
        }
    }

    #[test]
    fn decay_falls_geometrically() {
        let mut p = SpectrumProcessor::new(settings(), 1024, 44_100);
        assert!(p.decay().is_none());

        let mut prev = p.process(&sine(300.0, 44_100, 1024, 0.8), 44_100);
        for _ in 0..100 {
            let next = p.decay().unwrap();
            assert_eq!(next.len(), prev.len());
            for (n, o) in next.iter().zip(&prev) {
                assert!(*n <= 0.9 * o + 1e-6);
            }
            prev = next;
        }
        assert!(prev.iter().all(|&v| v < 0.1));
    }

    #[test]
    fn new_chunk_length_rebuilds_layout() {
        let mut p = SpectrumProcessor::new(settings(), 1024, 44_100);
        let frame = p.process(&sine(440.0, 48_000, 512, 0.3), 48_000);
        assert_eq!(frame.len(), 100);
        assert_eq!(p.bin_map().len(), 101);
        assert!(p.bin_map().iter().all(|&i| i < num_fft_bins(512)));
    }

    #[test]
    fn hann_window_is_zero_at_edges() {
        let w = hann_window(1024);
        assert!(w[0].abs() < 1e-6 && w[1023].abs() < 1e-6);
        assert!(w.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(hann_window(1), vec![1.0]);
    }
}
