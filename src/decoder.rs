use serde::Deserialize;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{PlayerError, Result};

/// Bytes per decoded sample (f32le).
pub const SAMPLE_BYTES: usize = 4;

/// What the probe learned about the first audio stream of a file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamDescriptor {
    pub sample_rate: u32,
    pub channels: u16,
    /// Seconds. Zero when neither the stream nor the container reports one.
    pub duration: f64,
}

impl StreamDescriptor {
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * SAMPLE_BYTES
    }
}

/// Runs `ffprobe` / `ffmpeg` as child processes. Demuxing and decoding are
/// entirely theirs; this side only frames the byte stream and owns the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct Decoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    kill_timeout: Duration,
}

/// A freshly launched decode: the process handle and its stdout.
pub struct PcmStream {
    pub process: DecoderProcess,
    pub reader: PcmReader,
}

impl Decoder {
    pub fn new(config: &Config) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            kill_timeout: config.kill_timeout,
        }
    }

    /// Inspect `path` and describe its first audio stream. Blocks until the
    /// probe process exits.
    pub fn probe(&self, path: &Path) -> Result<StreamDescriptor> {
        let probe_err = |reason: String| PlayerError::Probe {
            path: path.to_path_buf(),
            reason,
        };

        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(probe_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_console_window(&mut cmd);

        let output = cmd
            .output()
            .map_err(|e| probe_err(format!("cannot run {}: {e}", self.ffprobe.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(probe_err(format!(
                "{} exited with {}: {}",
                self.ffprobe.display(),
                output.status,
                stderr.trim()
            )));
        }

        let descriptor = parse_probe_output(&output.stdout).map_err(probe_err)?;
        log::debug!("Probed {}: {:?}", path.display(), descriptor);
        Ok(descriptor)
    }

    /// Launch a decoder writing interleaved f32le PCM for `path` to its
    /// stdout, starting `start_offset` seconds in.
    pub fn open_stream(
        &self,
        path: &Path,
        start_offset: f64,
        descriptor: &StreamDescriptor,
    ) -> Result<PcmStream> {
        let launch_err = |reason: String| PlayerError::DecodeLaunch {
            path: path.to_path_buf(),
            reason,
        };

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(decode_args(path, start_offset, descriptor))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        hide_console_window(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| launch_err(format!("cannot run {}: {e}", self.ffmpeg.display())))?;

        let Some(stdout) = child.stdout.take() else {
            let mut process = DecoderProcess::new(child, self.kill_timeout);
            process.close();
            return Err(launch_err("decoder stdout was not captured".into()));
        };

        log::debug!(
            "Decoder started for {} at {start_offset:.3}s (pid {})",
            path.display(),
            child.id()
        );

        Ok(PcmStream {
            process: DecoderProcess::new(child, self.kill_timeout),
            reader: PcmReader::new(stdout),
        })
    }
}

fn probe_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(path.as_os_str().to_owned());
    args
}

fn decode_args(path: &Path, start_offset: f64, descriptor: &StreamDescriptor) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-v".into(), "error".into(), "-nostdin".into()];
    // Input-side seek: ffmpeg jumps before decoding instead of discarding.
    if start_offset > 0.0 {
        args.push("-ss".into());
        args.push(format!("{start_offset:.3}").into());
    }
    args.push("-i".into());
    args.push(path.as_os_str().to_owned());
    args.extend(
        [
            "-vn".to_string(),
            "-f".into(),
            "f32le".into(),
            "-acodec".into(),
            "pcm_f32le".into(),
            "-ac".into(),
            descriptor.channels.to_string(),
            "-ar".into(),
            descriptor.sample_rate.to_string(),
            "pipe:1".into(),
        ]
        .into_iter()
        .map(OsString::from),
    );
    args
}

#[cfg(windows)]
fn hide_console_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console_window(_cmd: &mut Command) {}

// ---------------------------------------------------------------------------
// ffprobe output
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn parse_probe_output(json: &[u8]) -> std::result::Result<StreamDescriptor, String> {
    let probe: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| format!("unreadable probe output: {e}"))?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .ok_or("no audio stream found")?;

    let sample_rate = stream
        .sample_rate
        .as_deref()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|&sr| sr > 0)
        .ok_or("audio stream has no valid sample rate")?;

    let channels = stream
        .channels
        .filter(|&c| c > 0)
        .ok_or("audio stream has no valid channel count")?;

    let parse_secs = |s: &Option<String>| {
        s.as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
    };
    let duration = parse_secs(&stream.duration)
        .or_else(|| probe.format.as_ref().and_then(|f| parse_secs(&f.duration)))
        .unwrap_or(0.0);

    Ok(StreamDescriptor {
        sample_rate,
        channels,
        duration,
    })
}

// ---------------------------------------------------------------------------
// Byte stream and process handle
// ---------------------------------------------------------------------------

/// Reads fixed-size chunks from the decoder's stdout.
pub struct PcmReader<R = ChildStdout> {
    inner: R,
    eof: bool,
}

impl<R: Read> PcmReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, eof: false }
    }

    /// Fill `buf` completely unless the stream ends first. A return value
    /// smaller than `buf.len()` means end of stream; later calls return 0.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    #[cfg(test)]
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

/// Owns the decoder child. Killing it closes the pipe, which unblocks any
/// pending read on the other end.
pub struct DecoderProcess {
    child: Option<Child>,
    kill_timeout: Duration,
}

impl DecoderProcess {
    fn new(child: Child, kill_timeout: Duration) -> Self {
        Self {
            child: Some(child),
            kill_timeout,
        }
    }

    /// A handle with no process behind it.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            child: None,
            kill_timeout: Duration::ZERO,
        }
    }

    /// Terminate and reap the process. Safe to call more than once; never
    /// waits longer than the configured kill timeout.
    pub fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => log::warn!("Could not query decoder status: {e}"),
        }

        if let Err(e) = child.kill() {
            // Already gone between try_wait and kill.
            log::debug!("Decoder kill failed: {e}");
        }

        let deadline = Instant::now() + self.kill_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Ok(None) => {
                    log::warn!("Decoder (pid {}) did not exit in time", child.id());
                    return;
                }
                Err(e) => {
                    log::warn!("Could not reap decoder: {e}");
                    return;
                }
            }
        }
    }
}

impl Drop for DecoderProcess {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const PROBE_JSON: &str = r#"{
        "streams": [
            { "index": 0, "codec_type": "video", "width": 640 },
            { "index": 1, "codec_type": "audio", "sample_rate": "48000",
              "channels": 2, "duration": "183.250000" }
        ],
        "format": { "duration": "184.000000" }
    }"#;

    #[test]
    fn probe_reads_first_audio_stream() {
        let d = parse_probe_output(PROBE_JSON.as_bytes()).unwrap();
        assert_eq!(d.sample_rate, 48_000);
        assert_eq!(d.channels, 2);
        assert!((d.duration - 183.25).abs() < 1e-9);
        assert_eq!(d.frame_bytes(), 8);
    }

    #[test]
    fn probe_falls_back_to_container_duration() {
        let json = r#"{
            "streams": [{ "codec_type": "audio", "sample_rate": "44100", "channels": 1 }],
            "format": { "duration": "10.5" }
        }"#;
        let d = parse_probe_output(json.as_bytes()).unwrap();
        assert!((d.duration - 10.5).abs() < 1e-9);
    }

    #[test]
    fn probe_without_audio_is_an_error() {
        let json = r#"{ "streams": [{ "codec_type": "video" }] }"#;
        let err = parse_probe_output(json.as_bytes()).unwrap_err();
        assert!(err.contains("no audio stream"));
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[test]
    fn probe_rejects_zero_channels() {
        let json = r#"{ "streams": [{ "codec_type": "audio", "sample_rate": "44100", "channels": 0 }] }"#;
        assert!(parse_probe_output(json.as_bytes()).is_err());
    }

    #[test]
    fn decode_args_seek_only_when_positive() {
        let d = StreamDescriptor {
            sample_rate: 44_100,
            channels: 2,
            duration: 30.0,
        };
        let from_start = decode_args(Path::new("song.flac"), 0.0, &d);
        assert!(!from_start.iter().any(|a| a == "-ss"));

        let seeked = decode_args(Path::new("song.flac"), 12.5, &d);
        let ss = seeked.iter().position(|a| a == "-ss").unwrap();
        let input = seeked.iter().position(|a| a == "-i").unwrap();
        assert_eq!(seeked[ss + 1], "12.500");
        assert!(ss < input, "seek must come before the input");

        let tail: Vec<_> = seeked[input + 2..].iter().map(|a| a.to_string_lossy()).collect();
        assert_eq!(
            tail,
            ["-vn", "-f", "f32le", "-acodec", "pcm_f32le", "-ac", "2", "-ar", "44100", "pipe:1"]
        );
    }

    #[test]
    fn short_read_happens_once_at_end() {
        let mut reader = PcmReader::new(Cursor::new(vec![7u8; 10]));
        let mut buf = [0u8; 4];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 4);
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 4);
        assert!(!reader.is_eof());
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 2);
        assert!(reader.is_eof());
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_tool_is_a_probe_error() {
        let config = Config {
            ffprobe: PathBuf::from("/nonexistent/ffprobe-for-tests"),
            ..Config::default()
        };
        let err = Decoder::new(&config).probe(Path::new("a.mp3")).unwrap_err();
        assert!(matches!(err, PlayerError::Probe { .. }));
    }

    #[test]
    fn missing_tool_is_a_launch_error() {
        let config = Config {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg-for-tests"),
            ..Config::default()
        };
        let d = StreamDescriptor {
            sample_rate: 44_100,
            channels: 1,
            duration: 1.0,
        };
        let err = Decoder::new(&config)
            .open_stream(Path::new("a.mp3"), 0.0, &d)
            .err()
            .unwrap();
        assert!(matches!(err, PlayerError::DecodeLaunch { .. }));
    }
    #[test]
    #[ignore] // needs ffmpeg and ffprobe on PATH
    fn decoded_length_matches_probed_duration() {
        let path = crate::test_support::write_tone("decoder_len", 3.0, 22_050, 2);
        let decoder = Decoder::new(&Config::default());
        let d = decoder.probe(&path).unwrap();
        assert_eq!((d.sample_rate, d.channels), (22_050, 2));

        let PcmStream { mut process, mut reader } = decoder.open_stream(&path, 0.0, &d).unwrap();
        let mut buf = vec![0u8; 1024 * d.frame_bytes()];
        let mut total = 0;
        loop {
            let n = reader.read_chunk(&mut buf).unwrap();
            total += n;
            if n < buf.len() {
                break;
            }
        }
        process.close();
        process.close();

        let seconds = total as f64 / d.frame_bytes() as f64 / d.sample_rate as f64;
        let period = 1024.0 / d.sample_rate as f64;
        assert!((seconds - d.duration).abs() <= period, "{seconds} vs {}", d.duration);
        let _ = std::fs::remove_file(path);
    }
}
