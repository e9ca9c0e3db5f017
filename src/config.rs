use std::path::PathBuf;
use std::time::Duration;

/// Everything the player needs to know up front. Built once in `main` and
/// handed to each component; nothing reads configuration from globals.
#[derive(Debug, Clone)]
pub struct Config {
    // ---- playback -----------------------------------------------------------
    /// Frames requested from the output device per callback.
    pub block_size: u32,
    /// Depth of the callback -> analyzer queue.
    pub frame_queue_depth: usize,

    // ---- spectrum -----------------------------------------------------------
    /// Sample rate assumed for the bin map until a real batch arrives.
    pub sample_rate: u32,
    /// Analysis window length assumed until a real batch arrives.
    pub chunk_size: usize,
    /// Highest frequency shown by the last bar, in Hz.
    pub max_freq: f32,
    pub num_bars: usize,
    /// Upper clip for bar heights (display units).
    pub max_db_value: f32,
    /// Depth of the analyzer -> renderer queue.
    pub spectrum_queue_depth: usize,
    /// Multiplier applied to the last frame when no audio arrived.
    pub decay: f32,
    /// Weight of the new frame in the moving average.
    pub smoothing: f32,
    pub log_exponent: f32,
    pub log_scale: f32,
    /// Exponent of the bar edge curve. Values > 1 widen the low end.
    pub bar_exponent: f32,
    pub idle_sleep: Duration,

    // ---- threads and processes ---------------------------------------------
    pub join_timeout: Duration,
    pub kill_timeout: Duration,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,

    // ---- ui -----------------------------------------------------------------
    pub ui_tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 1024,
            frame_queue_depth: 10,

            sample_rate: 44_100,
            chunk_size: 1024,
            max_freq: 8000.0,
            num_bars: 100,
            max_db_value: 90.0,
            spectrum_queue_depth: 2,
            decay: 0.9,
            smoothing: 0.6,
            log_exponent: 0.35,
            log_scale: 250.0,
            bar_exponent: 1.2,
            idle_sleep: Duration::from_millis(10),

            join_timeout: Duration::from_secs(1),
            kill_timeout: Duration::from_millis(500),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),

            ui_tick: Duration::from_millis(15),
        }
    }
}

impl Config {
    /// Defaults, with tool paths and bar count overridable from the environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup("SPECTRUM_PLAYER_FFMPEG") {
            self.ffmpeg = PathBuf::from(path);
        }
        if let Some(path) = lookup("SPECTRUM_PLAYER_FFPROBE") {
            self.ffprobe = PathBuf::from(path);
        }
        if let Some(bars) = lookup("SPECTRUM_PLAYER_BARS") {
            match bars.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.num_bars = n,
                _ => log::warn!("Ignoring invalid SPECTRUM_PLAYER_BARS={bars:?}"),
            }
        }
        self
    }
}
