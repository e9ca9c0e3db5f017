use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::AudioBatch;
use crate::config::Config;
use crate::fft::{SpectrumProcessor, SpectrumSettings};
use crate::queue::DropOldestQueue;
use crate::worker::join_with_timeout;

/// Background worker turning audio batches into bar heights.
///
/// Input and output are both drop-oldest queues, so neither the audio side
/// nor the renderer ever waits on it.
pub struct SpectrumAnalyzer {
    settings: SpectrumSettings,
    chunk_size: usize,
    sample_rate: u32,
    idle_sleep: Duration,
    join_timeout: Duration,
    input: DropOldestQueue<AudioBatch>,
    output: DropOldestQueue<Vec<f32>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SpectrumAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            settings: SpectrumSettings::from(config),
            chunk_size: config.chunk_size,
            sample_rate: config.sample_rate,
            idle_sleep: config.idle_sleep,
            join_timeout: config.join_timeout,
            input: DropOldestQueue::new(config.frame_queue_depth),
            output: DropOldestQueue::new(config.spectrum_queue_depth),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Handle for feeding batches in.
    pub fn input(&self) -> &DropOldestQueue<AudioBatch> {
        &self.input
    }

    pub fn num_bars(&self) -> usize {
        self.settings.num_bars
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        // A previous worker that outlived its join timeout is detached here.
        self.worker = None;
        self.running.store(true, Ordering::Release);

        let mut processor =
            SpectrumProcessor::new(self.settings.clone(), self.chunk_size, self.sample_rate);
        let input = self.input.clone();
        let output = self.output.clone();
        let running = self.running.clone();
        let idle_sleep = self.idle_sleep;

        let spawned = thread::Builder::new()
            .name("spectrum-analyzer".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    if !analyze_once(&mut processor, &input, &output) {
                        thread::sleep(idle_sleep);
                    }
                }
                log::debug!("Spectrum analyzer stopped");
            });

        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                log::error!("Could not start spectrum analyzer: {e}");
            }
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            join_with_timeout(worker, self.join_timeout);
        }
    }

    /// Newest published frame, or `None` when nothing new arrived since the
    /// last call.
    pub fn get_latest_spectrum_frame(&self) -> Option<Vec<f32>> {
        self.output.pop_latest()
    }
}

impl Drop for SpectrumAnalyzer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One analyzer iteration. Returns `false` when there was no new audio, in
/// which case the previous frame is decayed and republished.
fn analyze_once(
    processor: &mut SpectrumProcessor,
    input: &DropOldestQueue<AudioBatch>,
    output: &DropOldestQueue<Vec<f32>>,
) -> bool {
    match input.pop_latest() {
        Some(batch) => {
            output.push(processor.process(&batch.to_mono(), batch.sample_rate));
            true
        }
        None => {
            if let Some(frame) = processor.decay() {
                output.push(frame);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn tone_batch(len: usize, freq: f32) -> AudioBatch {
        let samples = (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / 44_100.0).sin() * 0.8)
            .collect();
        AudioBatch {
            samples,
            channels: 1,
            sample_rate: 44_100,
        }
    }

    #[test]
    fn analyzes_only_the_newest_batch() {
        let config = Config::default();
        let mut processor = SpectrumProcessor::new(SpectrumSettings::from(&config), 1024, 44_100);
        let input = DropOldestQueue::new(10);
        let output = DropOldestQueue::new(2);

        input.push(tone_batch(1024, 200.0));
        input.push(AudioBatch {
            samples: vec![0.0; 1024],
            channels: 1,
            sample_rate: 44_100,
        });
        assert!(analyze_once(&mut processor, &input, &output));
        assert_eq!(input.len(), 0);

        let frame = output.pop_latest().unwrap();
        assert_eq!(frame.len(), config.num_bars);
        assert!(frame.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn idle_iterations_decay_the_last_frame() {
        let config = Config::default();
        let mut processor = SpectrumProcessor::new(SpectrumSettings::from(&config), 1024, 44_100);
        let input = DropOldestQueue::new(10);
        let output = DropOldestQueue::new(2);

        // Nothing has ever been analysed: nothing to decay.
        assert!(!analyze_once(&mut processor, &input, &output));
        assert!(output.pop().is_none());

        input.push(tone_batch(1024, 500.0));
        analyze_once(&mut processor, &input, &output);
        let mut prev = output.pop_latest().unwrap();
        for _ in 0..5 {
            assert!(!analyze_once(&mut processor, &input, &output));
            let next = output.pop_latest().unwrap();
            for (n, p) in next.iter().zip(&prev) {
                assert!(*n <= 0.9 * p + 1e-6);
            }
            prev = next;
        }
    }

    #[test]
    fn output_queue_keeps_only_recent_frames() {
        let config = Config::default();
        let mut processor = SpectrumProcessor::new(SpectrumSettings::from(&config), 1024, 44_100);
        let input = DropOldestQueue::new(10);
        let output = DropOldestQueue::new(2);
        for _ in 0..5 {
            input.push(tone_batch(1024, 1000.0));
            analyze_once(&mut processor, &input, &output);
        }
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn worker_publishes_and_stops() {
        let config = Config {
            num_bars: 32,
            ..Config::default()
        };
        let mut analyzer = SpectrumAnalyzer::new(&config);
        analyzer.start();
        analyzer.start();
        assert!(analyzer.is_running());

        analyzer.input().push(tone_batch(1024, 440.0));
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut frame = None;
        while frame.is_none() && Instant::now() < deadline {
            frame = analyzer.get_latest_spectrum_frame();
            thread::sleep(Duration::from_millis(5));
        }
        let frame = frame.expect("analyzer produced a frame");
        assert_eq!(frame.len(), 32);
        assert!(frame.iter().all(|&v| (0.0..=config.max_db_value).contains(&v)));

        analyzer.stop();
        analyzer.stop();
        assert!(!analyzer.is_running());
    }
}
