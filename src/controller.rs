use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::analyzer::SpectrumAnalyzer;
use crate::audio::{clamp_volume, PlaybackEngine, PlaybackEvent, PlaybackState};
use crate::config::Config;
use crate::error::{PlayerError, Result};

/// What happens when a track ends or the user skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayMode {
    #[default]
    Sequence,
    Random,
    Single,
}

impl PlayMode {
    pub fn cycle(self) -> Self {
        match self {
            PlayMode::Sequence => PlayMode::Random,
            PlayMode::Random => PlayMode::Single,
            PlayMode::Single => PlayMode::Sequence,
        }
    }
}

impl fmt::Display for PlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlayMode::Sequence => "sequence",
            PlayMode::Random => "random",
            PlayMode::Single => "single",
        })
    }
}

impl FromStr for PlayMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequence" => Ok(PlayMode::Sequence),
            "random" => Ok(PlayMode::Random),
            "single" => Ok(PlayMode::Single),
            other => Err(format!("unknown play mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

// ---------------------------------------------------------------------------
// Playlist
// ---------------------------------------------------------------------------

/// Ordered tracks, the current position in them, and a "play next" queue.
#[derive(Debug, Default)]
pub struct Playlist {
    tracks: Vec<PathBuf>,
    current: Option<usize>,
    up_next: VecDeque<PathBuf>,
}

impl Playlist {
    pub fn new(tracks: Vec<PathBuf>) -> Self {
        Self {
            tracks,
            current: None,
            up_next: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn current_track(&self) -> Option<&Path> {
        self.current.map(|i| self.tracks[i].as_path())
    }

    pub fn track(&self, index: usize) -> Option<&Path> {
        self.tracks.get(index).map(PathBuf::as_path)
    }

    fn select(&mut self, index: usize) -> Option<&Path> {
        if index < self.tracks.len() {
            self.current = Some(index);
        }
        self.track(index)
    }

    /// Queue `path` to play after the current track. Duplicates are ignored.
    pub fn enqueue_next(&mut self, path: PathBuf) -> bool {
        if self.up_next.contains(&path) {
            return false;
        }
        self.up_next.push_back(path);
        true
    }

    #[cfg(test)]
    pub fn up_next(&self) -> impl Iterator<Item = &Path> {
        self.up_next.iter().map(PathBuf::as_path)
    }

    /// Pick the index to play after the current one. Queued tracks win over
    /// the play mode; a queued path not in the list is appended to it.
    fn advance(&mut self, mode: PlayMode, rng: &mut impl Rng) -> Option<usize> {
        if let Some(path) = self.up_next.pop_front() {
            let index = match self.tracks.iter().position(|t| *t == path) {
                Some(i) => i,
                None => {
                    self.tracks.push(path);
                    self.tracks.len() - 1
                }
            };
            return Some(index);
        }
        self.step(mode, Direction::Forward, rng)
    }

    fn step(&self, mode: PlayMode, direction: Direction, rng: &mut impl Rng) -> Option<usize> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }
        let Some(current) = self.current else {
            return Some(0);
        };
        let next = match mode {
            PlayMode::Single => current,
            PlayMode::Random if len > 1 => {
                // Any other track, uniformly.
                let pick = rng.gen_range(0..len - 1);
                if pick >= current {
                    pick + 1
                } else {
                    pick
                }
            }
            PlayMode::Random => 0,
            PlayMode::Sequence => match direction {
                Direction::Forward => (current + 1) % len,
                Direction::Backward => (current + len - 1) % len,
            },
        };
        Some(next)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Snapshot of the player for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub track: Option<String>,
    pub position: f64,
    pub duration: f64,
    pub state: PlaybackState,
    pub volume: f32,
    pub mode: PlayMode,
    pub error: Option<String>,
}

/// Owns the engine for the current track and the spectrum analyzer, and
/// moves audio from one to the other on every UI tick.
pub struct PlayerController {
    config: Config,
    playlist: Playlist,
    mode: PlayMode,
    volume: f32,
    engine: Option<PlaybackEngine>,
    analyzer: SpectrumAnalyzer,
    last_error: Option<PlayerError>,
    clear_display: bool,
}

impl PlayerController {
    pub fn new(config: Config, tracks: Vec<PathBuf>, mode: PlayMode, volume: f32) -> Self {
        let mut analyzer = SpectrumAnalyzer::new(&config);
        analyzer.start();
        Self {
            playlist: Playlist::new(tracks),
            mode,
            volume: clamp_volume(volume),
            engine: None,
            analyzer,
            last_error: None,
            clear_display: false,
            config,
        }
    }

    #[cfg(test)]
    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn set_mode(&mut self, mode: PlayMode) {
        log::info!("Play mode: {mode}");
        self.mode = mode;
    }

    pub fn cycle_mode(&mut self) -> PlayMode {
        self.set_mode(self.mode.cycle());
        self.mode
    }

    pub fn enqueue_next(&mut self, path: PathBuf) {
        self.playlist.enqueue_next(path);
    }

    /// Drop the current engine and start track `index` from the top.
    pub fn play_index(&mut self, index: usize) -> Result<()> {
        let path = self
            .playlist
            .select(index)
            .ok_or(PlayerError::EmptyPlaylist)?
            .to_path_buf();

        self.stop_engine();
        self.clear_display = true;

        let mut engine = PlaybackEngine::new(path, &self.config);
        engine.set_volume(self.volume);
        let result = engine.play();
        self.engine = Some(engine);
        self.record(result)
    }

    pub fn next(&mut self) -> Result<()> {
        let index = self
            .playlist
            .advance(self.mode, &mut rand::thread_rng())
            .ok_or(PlayerError::EmptyPlaylist)?;
        self.play_index(index)
    }

    pub fn previous(&mut self) -> Result<()> {
        let index = self
            .playlist
            .step(self.mode, Direction::Backward, &mut rand::thread_rng())
            .ok_or(PlayerError::EmptyPlaylist)?;
        self.play_index(index)
    }

    /// Restart the current track, or the first one if nothing played yet.
    pub fn replay(&mut self) -> Result<()> {
        let index = self.playlist.current().unwrap_or(0);
        self.play_index(index)
    }

    pub fn toggle_pause(&mut self) {
        let Some(engine) = &self.engine else {
            return;
        };
        if engine.is_paused() {
            engine.resume();
        } else {
            engine.pause();
            self.clear_display = true;
        }
    }

    pub fn stop(&mut self) {
        if let Some(engine) = &mut self.engine {
            engine.stop();
            self.clear_display = true;
        }
    }

    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let Some(engine) = &mut self.engine else {
            return Ok(());
        };
        let result = engine.seek(seconds);
        self.record(result)
    }

    pub fn seek_relative(&mut self, delta: f64) -> Result<()> {
        let position = self.engine.as_ref().map_or(0.0, |e| e.get_position());
        self.seek(position + delta)
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = clamp_volume(volume);
        if let Some(engine) = &self.engine {
            engine.set_volume(self.volume);
        }
    }

    pub fn adjust_volume(&mut self, delta: f32) {
        self.set_volume(self.volume + delta);
    }

    /// Called once per UI tick. Moves the newest audio batch, if any, to the
    /// analyzer and reacts to finish/failure notifications.
    pub fn tick(&mut self) {
        let Some(engine) = &self.engine else {
            return;
        };

        if let Some(batch) = engine.get_latest_audio_batch() {
            self.analyzer.input().push(batch);
        }

        let mut finished = false;
        let mut failure = None;
        while let Some(event) = engine.poll_event() {
            match event {
                PlaybackEvent::Finished => finished = true,
                PlaybackEvent::Failed(err) => failure = Some(err),
            }
        }

        if let Some(err) = failure {
            log::error!("Playback failed: {err}");
            self.last_error = Some(err);
            // The position stays frozen where the stream broke.
            if let Some(engine) = &mut self.engine {
                engine.abort();
            }
            self.clear_display = true;
        } else if finished {
            log::info!("Finished {}", engine.source().display());
            let result = match self.mode {
                PlayMode::Single => self.replay(),
                _ => self.next(),
            };
            // Already recorded and logged by play_index.
            let _ = result;
        }
    }

    /// Newest bar heights for the renderer. Right after a track change,
    /// pause or stop this is a frame of zeros.
    pub fn latest_spectrum(&mut self) -> Option<Vec<f32>> {
        if std::mem::take(&mut self.clear_display) {
            self.analyzer.input().clear();
            let _ = self.analyzer.get_latest_spectrum_frame();
            return Some(vec![0.0; self.analyzer.num_bars()]);
        }
        self.analyzer.get_latest_spectrum_frame()
    }

    pub fn status(&self) -> PlayerStatus {
        let engine = self.engine.as_ref();
        PlayerStatus {
            track: self.playlist.current_track().map(track_name),
            position: engine.map_or(0.0, |e| e.get_position()),
            duration: engine.map_or(0.0, |e| e.get_duration()),
            state: engine.map_or(PlaybackState::Idle, PlaybackEngine::state),
            volume: self.volume,
            mode: self.mode,
            error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    pub fn shutdown(&mut self) {
        self.stop_engine();
        self.analyzer.stop();
    }

    fn stop_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }
    }

    fn record(&mut self, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => self.last_error = None,
            Err(err) => self.last_error = Some(err.clone()),
        }
        result
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn track_name(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// `mm:ss`. Negative or non-finite input shows as `00:00`.
pub fn format_time(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "00:00".to_string();
    }
    let total = seconds as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}
