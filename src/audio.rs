use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::Config;
use crate::decoder::{Decoder, DecoderProcess, PcmReader, PcmStream, StreamDescriptor, SAMPLE_BYTES};
use crate::error::{PlayerError, Result};
use crate::queue::DropOldestQueue;
use crate::worker::join_with_timeout;

/// How often the output thread checks whether its session is over.
const OUTPUT_POLL: Duration = Duration::from_millis(20);
/// How long `play` waits for the device to come up.
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 8;

/// One callback period of decoded audio, interleaved, before volume scaling.
#[derive(Debug, Clone)]
pub struct AudioBatch {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioBatch {
    #[cfg(test)]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Average the channels down to one sample per frame.
    pub fn to_mono(&self) -> Vec<f32> {
        let ch = self.channels.max(1) as usize;
        if ch == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }
}

/// Reported once per session from the audio side.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    Finished,
    Failed(PlayerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
    Stopped,
    Finished,
}

// ---------------------------------------------------------------------------
// State shared with the callback
// ---------------------------------------------------------------------------

/// Written only by the controller side, read by the callback.
struct Controls {
    paused: AtomicBool,
    volume: AtomicU32,
}

impl Controls {
    fn new(volume: f32) -> Self {
        Self {
            paused: AtomicBool::new(false),
            volume: AtomicU32::new(volume.to_bits()),
        }
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }
}

/// Progress of one session. `frames` and `finished` are written only by the
/// callback; `stopping` only by the engine.
#[derive(Default)]
struct Progress {
    frames: AtomicU64,
    finished: AtomicBool,
    done: AtomicBool,
    stopping: AtomicBool,
}

impl Progress {
    fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    /// Claim the session's single terminal report. Only the first caller
    /// gets `true`.
    fn terminate(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Real-time side
// ---------------------------------------------------------------------------

/// Fills one output period per call from the decoder's byte stream. Runs on
/// the audio thread: no locks, no logging, and the only blocking call is the
/// bounded pipe read.
struct PeriodRenderer<R> {
    reader: PcmReader<R>,
    channels: u16,
    sample_rate: u32,
    bytes: Vec<u8>,
    controls: Arc<Controls>,
    progress: Arc<Progress>,
    batches: DropOldestQueue<AudioBatch>,
    events: Sender<PlaybackEvent>,
}

impl<R: Read> PeriodRenderer<R> {
    fn new(
        reader: PcmReader<R>,
        descriptor: &StreamDescriptor,
        block_size: u32,
        controls: Arc<Controls>,
        progress: Arc<Progress>,
        batches: DropOldestQueue<AudioBatch>,
        events: Sender<PlaybackEvent>,
    ) -> Self {
        Self {
            reader,
            channels: descriptor.channels,
            sample_rate: descriptor.sample_rate,
            bytes: vec![0; block_size as usize * descriptor.frame_bytes()],
            controls,
            progress,
            batches,
            events,
        }
    }

    fn render(&mut self, out: &mut [f32]) {
        if self.progress.is_done() || self.progress.is_stopping() || self.controls.is_paused() {
            out.fill(0.0);
            return;
        }

        let wanted = out.len() * SAMPLE_BYTES;
        if self.bytes.len() < wanted {
            self.bytes.resize(wanted, 0);
        }

        let got = match self.reader.read_chunk(&mut self.bytes[..wanted]) {
            Ok(n) => n,
            Err(e) => {
                out.fill(0.0);
                self.fail(format!("read from decoder failed: {e}"));
                return;
            }
        };

        let frame_bytes = self.channels as usize * SAMPLE_BYTES;
        let whole = got - got % frame_bytes;
        let pcm = &self.bytes[..whole];

        // Decode straight into the device buffer.
        let volume = self.controls.volume();
        for (dst, b) in out.iter_mut().zip(pcm.chunks_exact(SAMPLE_BYTES)) {
            *dst = decode_sample(b) * volume;
        }
        out[whole / SAMPLE_BYTES..].fill(0.0);
        self.progress.advance((whole / frame_bytes) as u64);

        if got == wanted {
            self.batches.push(AudioBatch {
                samples: pcm.chunks_exact(SAMPLE_BYTES).map(decode_sample).collect(),
                channels: self.channels,
                sample_rate: self.sample_rate,
            });
            return;
        }

        // Short read. Either the decoder ran out, or stop() killed it.
        if self.progress.is_stopping() {
            return;
        }
        if got != whole {
            self.fail(format!(
                "stream ended inside a frame ({} stray bytes)",
                got - whole
            ));
        } else {
            // `finished` must be visible no later than `done`.
            self.progress.finished.store(true, Ordering::Release);
            if self.progress.terminate() {
                let _ = self.events.try_send(PlaybackEvent::Finished);
            }
        }
    }

    fn fail(&self, reason: String) {
        if self.progress.terminate() {
            let _ = self
                .events
                .try_send(PlaybackEvent::Failed(PlayerError::MidStreamDecode(reason)));
        }
    }
}

fn decode_sample(b: &[u8]) -> f32 {
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Body of the per-session output thread. Owns the cpal stream (which is not
/// `Send` everywhere) from creation to drop.
fn run_output(
    renderer: PeriodRenderer<std::process::ChildStdout>,
    descriptor: StreamDescriptor,
    block_size: u32,
    progress: Arc<Progress>,
    events: Sender<PlaybackEvent>,
    stop_rx: Receiver<()>,
    ready_tx: Sender<Result<()>>,
) {
    let stream = match open_output_stream(renderer, &descriptor, block_size, progress.clone(), events)
    {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    loop {
        match stop_rx.recv_timeout(OUTPUT_POLL) {
            Err(RecvTimeoutError::Timeout) if !progress.is_done() => continue,
            _ => break,
        }
    }

    if let Err(e) = stream.pause() {
        log::debug!("Pausing output stream failed: {e}");
    }
    // Dropping the stream closes the device.
    drop(stream);
}

fn open_output_stream(
    mut renderer: PeriodRenderer<std::process::ChildStdout>,
    descriptor: &StreamDescriptor,
    block_size: u32,
    progress: Arc<Progress>,
    events: Sender<PlaybackEvent>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::Device("no output device available".into()))?;

    let buffer_size = match device.default_output_config() {
        Ok(supported) => match supported.buffer_size() {
            &cpal::SupportedBufferSize::Range { min, max } if (min..=max).contains(&block_size) => {
                cpal::BufferSize::Fixed(block_size)
            }
            cpal::SupportedBufferSize::Range { min, max } => {
                log::warn!("Device buffer range {min}..={max} excludes {block_size}; using default");
                cpal::BufferSize::Default
            }
            cpal::SupportedBufferSize::Unknown => cpal::BufferSize::Default,
        },
        Err(e) => {
            log::warn!("No default output config ({e}); using default buffer size");
            cpal::BufferSize::Default
        }
    };

    let config = cpal::StreamConfig {
        channels: descriptor.channels,
        sample_rate: cpal::SampleRate(descriptor.sample_rate),
        buffer_size,
    };

    log::debug!(
        "Opening {} with {:?}",
        device.name().unwrap_or_default(),
        config
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.render(data),
            move |err| {
                if progress.terminate() {
                    let _ = events.try_send(PlaybackEvent::Failed(PlayerError::Device(
                        err.to_string(),
                    )));
                }
            },
            None,
        )
        .map_err(|e| PlayerError::Device(format!("cannot open output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| PlayerError::Device(format!("cannot start output stream: {e}")))?;

    Ok(stream)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One live decode + output pair.
struct Session {
    start_offset: f64,
    sample_rate: u32,
    progress: Arc<Progress>,
    process: DecoderProcess,
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Session {
    fn position(&self) -> f64 {
        self.start_offset + self.progress.frames() as f64 / self.sample_rate as f64
    }

    fn shutdown(mut self, join_timeout: Duration) {
        self.progress.stopping.store(true, Ordering::Release);
        let _ = self.stop_tx.try_send(());
        // Killing the decoder also unblocks a callback stuck in a read.
        self.process.close();
        if let Some(thread) = self.thread.take() {
            join_with_timeout(thread, join_timeout);
        }
    }
}

/// Plays one track. Seeking tears the session down and starts a new decoder
/// at the target, so the byte stream always lines up with the position.
pub struct PlaybackEngine {
    source: PathBuf,
    decoder: Decoder,
    block_size: u32,
    join_timeout: Duration,
    descriptor: Option<StreamDescriptor>,
    controls: Arc<Controls>,
    batches: DropOldestQueue<AudioBatch>,
    events_tx: Sender<PlaybackEvent>,
    events_rx: Receiver<PlaybackEvent>,
    session: Option<Session>,
    phase: PlaybackState,
    /// Position reported while no session is live.
    held_position: f64,
}

impl PlaybackEngine {
    pub fn new(source: impl Into<PathBuf>, config: &Config) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        Self {
            source: source.into(),
            decoder: Decoder::new(config),
            block_size: config.block_size.max(1),
            join_timeout: config.join_timeout,
            descriptor: None,
            controls: Arc::new(Controls::new(1.0)),
            batches: DropOldestQueue::new(config.frame_queue_depth),
            events_tx,
            events_rx,
            session: None,
            phase: PlaybackState::Idle,
            held_position: 0.0,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Probe the track once; later calls reuse the result.
    pub fn load(&mut self) -> Result<StreamDescriptor> {
        if let Some(descriptor) = self.descriptor {
            return Ok(descriptor);
        }
        let descriptor = self.decoder.probe(&self.source)?;
        log::info!(
            "Loaded {} ({} Hz, {} ch, {:.1}s)",
            self.source.display(),
            descriptor.sample_rate,
            descriptor.channels,
            descriptor.duration
        );
        self.descriptor = Some(descriptor);
        Ok(descriptor)
    }

    /// Start playing from the beginning. Does nothing while a session is
    /// already running.
    pub fn play(&mut self) -> Result<()> {
        if self.session.as_ref().is_some_and(|s| !s.progress.is_done()) {
            return Ok(());
        }
        self.controls.set_paused(false);
        self.start_session(0.0)
    }

    pub fn pause(&self) {
        self.controls.set_paused(true);
    }

    pub fn resume(&self) {
        self.controls.set_paused(false);
    }

    pub fn is_paused(&self) -> bool {
        self.controls.is_paused()
    }

    /// Tear the session down. Position goes back to zero.
    pub fn stop(&mut self) {
        if self.session.is_some() {
            log::info!("Stopping {}", self.source.display());
        }
        self.teardown();
        self.held_position = 0.0;
        if self.phase != PlaybackState::Idle {
            self.phase = PlaybackState::Stopped;
        }
    }

    /// Release the decoder and device after a failure. Unlike `stop`, the
    /// position stays where playback broke off.
    pub fn abort(&mut self) {
        let position = self.get_position();
        if self.session.is_some() {
            log::info!(
                "Aborting {} at {position:.2}s",
                self.source.display()
            );
        }
        self.teardown();
        self.held_position = position;
        if self.phase != PlaybackState::Idle {
            self.phase = PlaybackState::Stopped;
        }
    }

    /// Restart the decode at `target` seconds, clamped to the track length.
    /// The pause flag carries over to the new session.
    pub fn seek(&mut self, target: f64) -> Result<()> {
        let descriptor = self.load()?;
        let target = clamp_seek(target, descriptor.duration);
        log::info!("Seeking {} to {target:.2}s", self.source.display());
        self.start_session(target)
    }

    pub fn set_volume(&self, volume: f32) {
        self.controls.set_volume(clamp_volume(volume));
    }

    #[cfg(test)]
    pub fn volume(&self) -> f32 {
        self.controls.volume()
    }

    pub fn get_position(&self) -> f64 {
        self.session
            .as_ref()
            .map_or(self.held_position, Session::position)
    }

    pub fn get_duration(&self) -> f64 {
        self.descriptor.map_or(0.0, |d| d.duration)
    }

    pub fn is_finished(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.progress.is_finished())
    }

    pub fn state(&self) -> PlaybackState {
        match (&self.session, self.phase) {
            (Some(s), PlaybackState::Playing) => {
                if self.is_finished() {
                    PlaybackState::Finished
                } else if s.progress.is_done() {
                    PlaybackState::Stopped
                } else if self.controls.is_paused() {
                    PlaybackState::Paused
                } else {
                    PlaybackState::Playing
                }
            }
            (_, phase) => phase,
        }
    }

    /// Newest period of audio for analysis, if any. Older unclaimed periods
    /// are discarded.
    pub fn get_latest_audio_batch(&self) -> Option<AudioBatch> {
        self.batches.pop_latest()
    }

    /// Next pending finish/failure notification.
    pub fn poll_event(&self) -> Option<PlaybackEvent> {
        self.events_rx.try_recv().ok()
    }

    fn start_session(&mut self, offset: f64) -> Result<()> {
        self.teardown();
        self.held_position = 0.0;
        self.phase = PlaybackState::Loading;
        match self.launch(offset) {
            Ok(session) => {
                self.session = Some(session);
                self.phase = PlaybackState::Playing;
                Ok(())
            }
            Err(e) => {
                log::error!("Could not play {}: {e}", self.source.display());
                self.phase = PlaybackState::Stopped;
                Err(e)
            }
        }
    }

    fn launch(&mut self, offset: f64) -> Result<Session> {
        let descriptor = self.load()?;
        let PcmStream { process, reader } =
            self.decoder.open_stream(&self.source, offset, &descriptor)?;

        let progress = Arc::new(Progress::default());
        let renderer = PeriodRenderer::new(
            reader,
            &descriptor,
            self.block_size,
            self.controls.clone(),
            progress.clone(),
            self.batches.clone(),
            self.events_tx.clone(),
        );

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread = {
            let progress = progress.clone();
            let events = self.events_tx.clone();
            let block_size = self.block_size;
            thread::Builder::new()
                .name("playback-output".into())
                .spawn(move || {
                    run_output(
                        renderer, descriptor, block_size, progress, events, stop_rx, ready_tx,
                    )
                })
                .map_err(|e| PlayerError::Device(format!("cannot spawn output thread: {e}")))?
        };

        let session = Session {
            start_offset: offset,
            sample_rate: descriptor.sample_rate,
            progress,
            process,
            stop_tx,
            thread: Some(thread),
        };

        match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                log::info!(
                    "Playing {} from {offset:.2}s",
                    self.source.display()
                );
                Ok(session)
            }
            Ok(Err(e)) => {
                session.shutdown(self.join_timeout);
                Err(e)
            }
            Err(_) => {
                session.shutdown(self.join_timeout);
                Err(PlayerError::Device("output device did not start in time".into()))
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown(self.join_timeout);
        }
        self.batches.clear();
        // Notifications from the discarded session are stale now.
        while self.events_rx.try_recv().is_ok() {}
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Stands in for the audio callback of a session that has no decoder or
/// device behind it.
#[cfg(test)]
pub(crate) struct FakeCallback {
    progress: Arc<Progress>,
    batches: DropOldestQueue<AudioBatch>,
    events: Sender<PlaybackEvent>,
}

#[cfg(test)]
impl FakeCallback {
    pub fn play_frames(&self, frames: u64) {
        self.progress.advance(frames);
    }

    pub fn publish(&self, batch: AudioBatch) {
        self.batches.push(batch);
    }

    pub fn finish(&self) {
        self.progress.finished.store(true, Ordering::Release);
        if self.progress.terminate() {
            let _ = self.events.try_send(PlaybackEvent::Finished);
        }
    }

    pub fn fail(&self, reason: &str) {
        if self.progress.terminate() {
            let _ = self.events.try_send(PlaybackEvent::Failed(PlayerError::MidStreamDecode(
                reason.to_string(),
            )));
        }
    }
}

#[cfg(test)]
impl PlaybackEngine {
    /// Install a live session starting at `offset` seconds, driven by the
    /// returned callback instead of a device.
    pub(crate) fn attach_fake_session(
        &mut self,
        descriptor: StreamDescriptor,
        offset: f64,
    ) -> FakeCallback {
        self.teardown();
        let progress = Arc::new(Progress::default());
        let (stop_tx, _) = crossbeam_channel::bounded(1);
        self.descriptor = Some(descriptor);
        self.session = Some(Session {
            start_offset: offset,
            sample_rate: descriptor.sample_rate,
            progress: progress.clone(),
            process: DecoderProcess::detached(),
            stop_tx,
            thread: None,
        });
        self.phase = PlaybackState::Playing;
        FakeCallback {
            progress,
            batches: self.batches.clone(),
            events: self.events_tx.clone(),
        }
    }
}

pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Clamp to `[0, duration]`. An unknown (zero) duration only bounds below.
fn clamp_seek(target: f64, duration: f64) -> f64 {
    let target = if target.is_finite() { target.max(0.0) } else { 0.0 };
    if duration > 0.0 {
        target.min(duration)
    } else {
        target
    }
}
