//! floatplay binary: plays one file on a loop, headless or in a borderless always-on-top window.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use floatplay::media::synthetic::SyntheticOptions;
use floatplay::platform::{self, MediaChoice};
use floatplay::render::NullPresenter;
use floatplay::{DecodeMode, Player, PlayerConfig, PlayerControl, PlayerEvent};

#[derive(Parser, Debug)]
#[command(name = "floatplay", version, about = "Floating video-loop player")]
struct Cli {
    /// Media file to play
    path: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Play a generated test pattern instead of a file
    #[arg(long)]
    test_pattern: bool,

    /// Test pattern length in seconds
    #[arg(long, default_value_t = 5.0)]
    duration: f64,

    /// auto, hardware or software
    #[arg(long)]
    decode_mode: Option<DecodeMode>,

    /// Initial volume, 0-100
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    /// Stop at the end instead of looping
    #[arg(long)]
    no_loop: bool,

    /// Discard audio instead of opening the output device
    #[arg(long)]
    muted: bool,

    /// Start position in seconds
    #[arg(long)]
    start: Option<f64>,

    /// Stop after this many seconds
    #[arg(long)]
    run_for: Option<f64>,

    /// Run without a window even when built with `gpu`
    #[arg(long)]
    headless: bool,

    /// Print the available renderers and exit
    #[arg(long)]
    list_renderers: bool,
}

impl Cli {
    fn player_config(&self) -> anyhow::Result<PlayerConfig> {
        let mut config = match &self.config {
            Some(path) => PlayerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PlayerConfig::default(),
        };
        if let Some(mode) = self.decode_mode {
            config.decode_mode = mode;
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        if self.no_loop {
            config.loop_playback = false;
        }
        Ok(config)
    }

    fn media_path(&self) -> anyhow::Result<PathBuf> {
        match (&self.path, self.test_pattern) {
            (_, true) => Ok(PathBuf::from("test-pattern")),
            (Some(path), false) => Ok(path.clone()),
            (None, false) => anyhow::bail!("no media file given (pass a path or --test-pattern)"),
        }
    }
}

fn build_player(cli: &Cli) -> anyhow::Result<Player> {
    let config = cli.player_config()?;
    let media = platform::media_backend(if cli.test_pattern {
        MediaChoice::TestPattern(SyntheticOptions {
            duration: cli.duration,
            ..SyntheticOptions::default()
        })
    } else {
        MediaChoice::Native
    })?;
    let audio = platform::audio_backend(cli.muted);
    let mut player = Player::new(config, media, audio, Box::new(NullPresenter::new()));

    player.open(&cli.media_path()?)?;
    if let Some(start) = cli.start {
        player.seek(start);
    }
    tracing::info!(
        "media={} audio={} renderer={} duration={:.3}s",
        player.media_backend_name(),
        player.audio_backend_name(),
        player.renderer_name(),
        player.duration()
    );
    Ok(player)
}

/// Log an event; returns true when playback is over.
fn handle_event(event: &PlayerEvent) -> bool {
    match event {
        PlayerEvent::PositionChanged(_) => false,
        PlayerEvent::EndOfFile => {
            tracing::info!("end of file");
            true
        }
        PlayerEvent::ErrorOccurred(message) => {
            tracing::error!("playback error: {}", message);
            true
        }
        other => {
            tracing::debug!("{:?}", other);
            false
        }
    }
}

fn run_headless(mut player: Player, run_for: Option<Duration>) -> anyhow::Result<()> {
    let events = player.events();
    let ticks = player.config().ticks.clone();
    player.play()?;

    let started = Instant::now();
    let mut next_render = started;
    let mut next_audio = started;
    loop {
        let now = Instant::now();
        if now >= next_audio {
            player.audio_tick();
            next_audio = now + ticks.audio_interval();
        }
        if now >= next_render {
            player.render_tick(now);
            next_render = now + ticks.render_interval();
        }
        if events.try_iter().any(|event| handle_event(&event)) {
            break;
        }
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        let wake = next_render.min(next_audio);
        thread::sleep(wake.saturating_duration_since(Instant::now()));
    }

    player.stop();
    tracing::info!("played {:.3}s", started.elapsed().as_secs_f64());
    Ok(())
}

#[cfg(feature = "gpu")]
mod window {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crossbeam::channel::Receiver;
    use winit::application::ApplicationHandler;
    use winit::dpi::LogicalSize;
    use winit::event::{ElementState, MouseButton, WindowEvent};
    use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
    use winit::keyboard::{Key, NamedKey};
    use winit::window::{Window, WindowId, WindowLevel};

    use floatplay::config::TickConfig;
    use floatplay::render::WgpuPresenter;
    use floatplay::{Player, PlayerControl, PlayerEvent};

    const SEEK_STEP: f64 = 5.0;
    const VOLUME_STEP: u8 = 10;

    struct App {
        player: Player,
        events: Receiver<PlayerEvent>,
        ticks: TickConfig,
        window: Option<Arc<Window>>,
        next_render: Instant,
        next_audio: Instant,
        deadline: Option<Instant>,
        error: Option<anyhow::Error>,
    }

    impl App {
        fn create_window(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
            let (width, height) = self.player.video_size().unwrap_or((640, 360));
            let attributes = Window::default_attributes()
                .with_title("floatplay")
                .with_decorations(false)
                .with_window_level(WindowLevel::AlwaysOnTop)
                .with_inner_size(LogicalSize::new(width.min(960), height.min(540)));
            let window = Arc::new(event_loop.create_window(attributes)?);
            let presenter = WgpuPresenter::new(Arc::clone(&window))?;
            self.player.set_presenter(Box::new(presenter));
            self.player.play()?;
            self.window = Some(window);
            Ok(())
        }

        fn handle_key(&mut self, key: &Key, event_loop: &ActiveEventLoop) {
            let result = match key {
                Key::Named(NamedKey::Space) => self.player.toggle_pause(),
                Key::Named(NamedKey::Escape) => {
                    event_loop.exit();
                    Ok(())
                }
                Key::Named(NamedKey::ArrowRight) => {
                    self.player.seek(self.player.position() + SEEK_STEP);
                    Ok(())
                }
                Key::Named(NamedKey::ArrowLeft) => {
                    self.player.seek(self.player.position() - SEEK_STEP);
                    Ok(())
                }
                Key::Named(NamedKey::ArrowUp) => {
                    self.player.set_volume(self.player.volume().saturating_add(VOLUME_STEP));
                    Ok(())
                }
                Key::Named(NamedKey::ArrowDown) => {
                    self.player.set_volume(self.player.volume().saturating_sub(VOLUME_STEP));
                    Ok(())
                }
                Key::Character(c) if c.as_str() == "l" => {
                    let enabled = !self.player.loop_enabled();
                    self.player.set_loop(enabled);
                    tracing::info!("loop {}", if enabled { "on" } else { "off" });
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(err) = result {
                tracing::warn!("{}", err);
            }
        }
    }

    impl ApplicationHandler for App {
        fn resumed(&mut self, event_loop: &ActiveEventLoop) {
            if self.window.is_some() {
                return;
            }
            if let Err(err) = self.create_window(event_loop) {
                self.error = Some(err);
                event_loop.exit();
            }
        }

        fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
            match event {
                WindowEvent::CloseRequested => event_loop.exit(),
                WindowEvent::Resized(size) => self.player.resize(size.width, size.height),
                WindowEvent::MouseInput {
                    state: ElementState::Pressed,
                    button: MouseButton::Left,
                    ..
                } => {
                    if let Some(window) = &self.window {
                        // borderless window: drag anywhere to move
                        let _ = window.drag_window();
                    }
                }
                WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed => {
                    self.handle_key(&event.logical_key, event_loop);
                }
                _ => {}
            }
        }

        fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
            let now = Instant::now();
            if now >= self.next_audio {
                self.player.audio_tick();
                self.next_audio = now + self.ticks.audio_interval();
            }
            if now >= self.next_render {
                self.player.render_tick(now);
                self.next_render = now + self.ticks.render_interval();
            }
            if self.events.try_iter().any(|event| super::handle_event(&event))
                || self.deadline.is_some_and(|deadline| now >= deadline)
            {
                event_loop.exit();
                return;
            }
            event_loop.set_control_flow(ControlFlow::WaitUntil(
                self.next_render.min(self.next_audio),
            ));
        }
    }

    pub fn run(player: Player, run_for: Option<Duration>) -> anyhow::Result<()> {
        let event_loop = EventLoop::new()?;
        let now = Instant::now();
        let mut app = App {
            events: player.events(),
            ticks: player.config().ticks.clone(),
            player,
            window: None,
            next_render: now,
            next_audio: now,
            deadline: run_for.map(|limit| now + limit),
            error: None,
        };
        event_loop.run_app(&mut app)?;
        app.player.stop();
        match app.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.list_renderers {
        for name in platform::available_renderers() {
            println!("{}", name);
        }
        return Ok(());
    }

    let run_for = cli.run_for.map(|secs| Duration::from_secs_f64(secs.max(0.0)));
    let player = build_player(&cli)?;

    #[cfg(feature = "gpu")]
    if !cli.headless {
        return window::run(player, run_for);
    }
    #[cfg(not(feature = "gpu"))]
    if !cli.headless {
        tracing::debug!("built without `gpu`; running headless");
    }
    run_headless(player, run_for)
}
