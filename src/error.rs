use std::path::PathBuf;

/// Failures the player can surface to the controller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlayerError {
    #[error("Failed to probe {path}: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("Failed to start decoder for {path}: {reason}")]
    DecodeLaunch { path: PathBuf, reason: String },

    #[error("Decoder stream broke during playback: {0}")]
    MidStreamDecode(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Playlist is empty")]
    EmptyPlaylist,
}

pub type Result<T> = std::result::Result<T, PlayerError>;
