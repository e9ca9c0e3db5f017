mod analyzer;
mod audio;
mod config;
mod controller;
mod decoder;
mod error;
mod fft;
mod queue;
mod renderer;
#[cfg(test)]
mod test_support;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes, WindowId};

use audio::PlaybackState;
use config::Config;
use controller::{format_time, PlayMode, PlayerController};

const SEEK_STEP: f64 = 5.0;
const VOLUME_STEP: f32 = 0.05;

const USAGE: &str = "usage: spectrum-player [--mode sequence|random|single] [--volume V] FILE...";

#[derive(Debug, PartialEq)]
struct Args {
    mode: PlayMode,
    volume: f32,
    files: Vec<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args {
        mode: PlayMode::Sequence,
        volume: 1.0,
        files: Vec::new(),
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args.next().ok_or("--mode needs a value")?;
                parsed.mode = value.parse()?;
            }
            "--volume" => {
                let value = args.next().ok_or("--volume needs a value")?;
                let volume: f32 = value
                    .parse()
                    .map_err(|_| format!("invalid volume '{value}'"))?;
                parsed.volume = audio::clamp_volume(volume);
            }
            flag if flag.starts_with("--") => return Err(format!("unknown option '{flag}'")),
            file => parsed.files.push(PathBuf::from(file)),
        }
    }
    if parsed.files.is_empty() {
        return Err("no files given".into());
    }
    Ok(parsed)
}

struct App {
    window: Option<Arc<Window>>,
    renderer: Option<renderer::Renderer>,
    controller: PlayerController,
    bars: Vec<f32>,
    max_value: f32,
    ui_tick: Duration,
    next_tick: Instant,
    title: String,
}

impl App {
    fn new(config: Config, args: Args) -> Self {
        let bars = vec![0.0; config.num_bars.max(1)];
        let max_value = config.max_db_value;
        let ui_tick = config.ui_tick;
        Self {
            window: None,
            renderer: None,
            controller: PlayerController::new(config, args.files, args.mode, args.volume),
            bars,
            max_value,
            ui_tick,
            next_tick: Instant::now(),
            title: String::new(),
        }
    }

    fn handle_key(&mut self, event: &KeyEvent) {
        if event.state != ElementState::Pressed {
            return;
        }
        // Errors are recorded by the controller and shown in the title.
        let _ = match &event.logical_key {
            Key::Named(NamedKey::Space) => {
                self.controller.toggle_pause();
                Ok(())
            }
            Key::Named(NamedKey::ArrowLeft) => self.controller.seek_relative(-SEEK_STEP),
            Key::Named(NamedKey::ArrowRight) => self.controller.seek_relative(SEEK_STEP),
            Key::Named(NamedKey::ArrowUp) => {
                self.controller.adjust_volume(VOLUME_STEP);
                Ok(())
            }
            Key::Named(NamedKey::ArrowDown) => {
                self.controller.adjust_volume(-VOLUME_STEP);
                Ok(())
            }
            Key::Named(NamedKey::Enter) => self.controller.replay(),
            Key::Character(c) => match c.to_lowercase().as_str() {
                "s" => {
                    self.controller.stop();
                    Ok(())
                }
                "n" => self.controller.next(),
                "p" => self.controller.previous(),
                "m" => {
                    self.controller.cycle_mode();
                    Ok(())
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        };
    }

    fn update_title(&mut self) {
        let status = self.controller.status();
        let mut title = format!(
            "{}  {} / {}  [{}]",
            status.track.as_deref().unwrap_or("-"),
            format_time(status.position),
            format_time(status.duration),
            status.mode
        );
        match status.state {
            PlaybackState::Paused => title.push_str("  (paused)"),
            PlaybackState::Stopped => title.push_str("  (stopped)"),
            _ => {}
        }
        if let Some(err) = &status.error {
            title.push_str("  ! ");
            title.push_str(err);
        }
        if title != self.title {
            if let Some(w) = &self.window {
                w.set_title(&title);
            }
            self.title = title;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        // Only initialise once
        if self.window.is_some() {
            return;
        }

        let attrs = WindowAttributes::default()
            .with_title("Spectrum Player")
            .with_inner_size(LogicalSize::new(1200, 600));

        let window = match event_loop.create_window(attrs) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {e}");
                event_loop.exit();
                return;
            }
        };

        let renderer = pollster::block_on(renderer::Renderer::new(
            window.clone(),
            self.bars.len() as u32,
            self.max_value,
        ));
        match renderer {
            Ok(r) => self.renderer = Some(r),
            Err(e) => {
                log::error!("{e}");
                event_loop.exit();
                return;
            }
        }
        self.window = Some(window);

        // Failures are logged and shown in the title; the window stays up.
        let _ = self.controller.play_index(0);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                self.controller.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(r) = &mut self.renderer {
                    r.resize(size);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => self.handle_key(&event),

            WindowEvent::RedrawRequested => {
                self.controller.tick();
                // No new frame: redraw the last one unchanged.
                if let Some(frame) = self.controller.latest_spectrum() {
                    self.bars = frame;
                }
                self.update_title();
                if let Some(r) = &mut self.renderer {
                    r.render(&self.bars);
                }
            }

            _ => {}
        }
    }

    /// Redraw once per UI tick instead of at the display rate.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let now = Instant::now();
        if now >= self.next_tick {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
            self.next_tick = now + self.ui_tick;
        }
        event_loop.set_control_flow(ControlFlow::WaitUntil(self.next_tick));
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            std::process::exit(2);
        }
    };

    let config = Config::from_env();
    log::info!(
        "{} track(s), mode {}, volume {:.2}",
        args.files.len(),
        args.mode,
        args.volume
    );

    let event_loop = EventLoop::new().expect("Failed to create event loop");

    let mut app = App::new(config, args);
    event_loop.run_app(&mut app).expect("Event loop error");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, String> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_mode_volume_and_files() {
        let parsed = args(&["--mode", "random", "a.mp3", "--volume", "0.5", "b.flac"]).unwrap();
        assert_eq!(parsed.mode, PlayMode::Random);
        assert_eq!(parsed.volume, 0.5);
        assert_eq!(
            parsed.files,
            vec![PathBuf::from("a.mp3"), PathBuf::from("b.flac")]
        );
    }

    #[test]
    fn defaults_and_volume_clamp() {
        let parsed = args(&["--volume", "3", "song.ogg"]).unwrap();
        assert_eq!(parsed.mode, PlayMode::Sequence);
        assert_eq!(parsed.volume, 1.0);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(args(&[]).is_err());
        assert!(args(&["--mode", "song.mp3"]).is_err());
        assert!(args(&["--volume", "loud", "a.mp3"]).is_err());
        assert!(args(&["--mode"]).is_err());
        assert!(args(&["--shuffle", "a.mp3"]).is_err());
    }
}
