//! Player: the control surface driving a playback session.
//!
//! A session owns three worker threads (demux, video decode, audio decode) connected by
//! bounded queues. The control thread (the GUI thread, or the headless loop of the binary)
//! drives the player through [`Player::render_tick`] and [`Player::audio_tick`]; neither ever
//! blocks. Notifications go out over a crossbeam channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use crate::audio::device::{AudioBackend, AudioError, PcmFormat};
use crate::audio::output::AudioOutput;
use crate::config::PlayerConfig;
use crate::core::time::Seconds;
use crate::media::{DecodeMode, MediaBackend, MediaInfo, OpenError, OpenedMedia};
use crate::pipeline::audio::AudioStage;
use crate::pipeline::demux::DemuxStage;
use crate::pipeline::video::VideoStage;
use crate::pipeline::{
    SessionControl, SessionQueues, WorkerNotice, AUDIO_THREAD, DEMUX_THREAD, VIDEO_THREAD,
};
use crate::playback::clock::ClockState;
use crate::playback::events::PlayerEvent;
use crate::playback::metrics::{Metric, MetricsSink, WindowedMetrics};
use crate::playback::scheduler::RenderScheduler;
use crate::playback::state::PlaybackState;
use crate::render::{GpuLock, PresentationBackend, RenderError};

/// How long stop waits for each worker before detaching it
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Error type for player operations
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("No media loaded")]
    NoMedia,
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Commands the GUI issues to the player core.
pub trait PlayerControl {
    /// Open `path`, stopping any current session.
    fn open(&mut self, path: &Path) -> Result<(), PlayerError>;

    fn play(&mut self) -> Result<(), PlayerError>;

    fn pause(&mut self);

    fn stop(&mut self);

    fn toggle_pause(&mut self) -> Result<(), PlayerError>;

    /// Seek to `seconds`, clamped to the media duration.
    fn seek(&mut self, seconds: Seconds);

    /// Output volume, 0..=100.
    fn set_volume(&mut self, volume: u8);

    fn set_loop(&mut self, enabled: bool);

    /// Decode path for the next open.
    fn set_decode_mode(&mut self, mode: DecodeMode);

    fn decode_mode(&self) -> DecodeMode;
}

/// State of one running session
struct Session {
    control: Arc<SessionControl>,
    queues: SessionQueues,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    notices: Receiver<WorkerNotice>,
    clock: ClockState,
    scheduler: Option<RenderScheduler>,
    audio: Option<AudioOutput>,
}

impl Session {
    fn spawn(
        &mut self,
        name: &'static str,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<(), PlayerError> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|source| PlayerError::Spawn { name, source })?;
        self.workers.push((name, handle));
        Ok(())
    }

    /// Stop every worker and release queued data.
    fn shutdown(&mut self) {
        self.control.shutdown();
        self.queues.wake_all();
        for (name, handle) in self.workers.drain(..) {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                self.queues.wake_all();
                thread::sleep(Duration::from_millis(2));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!("{} thread panicked", name);
                }
            } else {
                tracing::warn!("{} thread did not exit within {:?}, detaching", name, JOIN_TIMEOUT);
            }
        }
        self.queues.clear_all();
    }

    /// True once every present stream satisfies `predicate`.
    fn all_streams(
        &self,
        video: impl Fn(&RenderScheduler) -> bool,
        audio: impl Fn(&AudioOutput) -> bool,
    ) -> bool {
        if self.scheduler.is_none() && self.audio.is_none() {
            return false;
        }
        self.scheduler.as_ref().map_or(true, video) && self.audio.as_ref().map_or(true, audio)
    }
}

/// Video-loop player core.
pub struct Player {
    config: PlayerConfig,
    media_backend: Arc<dyn MediaBackend>,
    audio_backend: Arc<dyn AudioBackend>,
    presenter: Box<dyn PresentationBackend>,
    gpu: GpuLock,
    metrics: Arc<dyn MetricsSink>,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    path: Option<PathBuf>,
    info: Option<MediaInfo>,
    /// Opened media waiting for the next session
    media: Option<OpenedMedia>,
    session: Option<Session>,
    state: PlaybackState,
    volume: u8,
    loop_enabled: bool,
    decode_mode: DecodeMode,
    position: Seconds,
    /// Seek made while stopped, applied when playback starts
    start_position: Option<Seconds>,
}

impl Player {
    pub fn new(
        config: PlayerConfig,
        media_backend: Arc<dyn MediaBackend>,
        audio_backend: Arc<dyn AudioBackend>,
        presenter: Box<dyn PresentationBackend>,
    ) -> Self {
        let (events_tx, events_rx) = channel::unbounded();
        let metrics: Arc<dyn MetricsSink> = Arc::new(WindowedMetrics::new(config.metrics_window));
        Self {
            volume: config.volume.min(100),
            loop_enabled: config.loop_playback,
            decode_mode: config.decode_mode,
            config,
            media_backend,
            audio_backend,
            presenter,
            gpu: GpuLock::new(),
            metrics,
            events_tx,
            events_rx,
            path: None,
            info: None,
            media: None,
            session: None,
            state: PlaybackState::Stopped,
            position: 0.0,
            start_position: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share `gpu` with the presentation backend.
    pub fn with_gpu_lock(mut self, gpu: GpuLock) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn set_presenter(&mut self, presenter: Box<dyn PresentationBackend>) {
        self.presenter = presenter;
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.presenter.resize(width, height);
    }

    /// Receiver for player notifications. Clones share one stream of events.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events_rx.clone()
    }

    pub fn gpu_lock(&self) -> &GpuLock {
        &self.gpu
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn position(&self) -> Seconds {
        self.position
    }

    pub fn duration(&self) -> Seconds {
        self.info.as_ref().map_or(0.0, |info| info.duration)
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.info.as_ref()
    }

    pub fn is_hardware_decoding(&self) -> bool {
        self.info
            .as_ref()
            .and_then(|info| info.video.as_ref())
            .is_some_and(|video| video.hardware)
    }

    pub fn video_size(&self) -> Option<(u32, u32)> {
        self.info
            .as_ref()
            .and_then(|info| info.video.as_ref())
            .map(|video| (video.width, video.height))
    }

    pub fn renderer_name(&self) -> &'static str {
        self.presenter.name()
    }

    pub fn media_backend_name(&self) -> &'static str {
        self.media_backend.name()
    }

    pub fn audio_backend_name(&self) -> &'static str {
        self.audio_backend.name()
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            let was_playing = self.state.is_playing();
            self.state = state;
            if was_playing != state.is_playing() {
                self.emit(PlayerEvent::PlaybackStateChanged(state.is_playing()));
            }
        }
    }

    /// Spawn the workers for the loaded media.
    fn start_session(&mut self) -> Result<(), PlayerError> {
        let media = match self.media.take() {
            Some(media) => media,
            None => {
                let path = self.path.clone().ok_or(PlayerError::NoMedia)?;
                self.media_backend.open(&path, self.decode_mode)?
            }
        };
        let OpenedMedia {
            mut info,
            demux,
            video,
            audio,
        } = media;

        let control = Arc::new(SessionControl::new(self.loop_enabled));
        let queues = SessionQueues::new(&self.config.queues);
        let (notice_tx, notice_rx) = channel::unbounded();

        let mut output = None;
        let mut audio_decoder = None;
        if let (Some(decoder), Some(_)) = (audio, info.audio.as_ref()) {
            match self.audio_backend.open(PcmFormat::OUTPUT) {
                Ok(device) => {
                    output = Some(AudioOutput::new(
                        device,
                        Arc::clone(&queues.audio),
                        self.config.audio.target_buffer_ms,
                    ));
                    audio_decoder = Some(decoder);
                }
                Err(err) => {
                    tracing::warn!("audio output unavailable, playing without sound: {}", err);
                    info.audio = None;
                }
            }
        }
        let video_decoder = video.filter(|_| info.video.is_some());

        let mut session = Session {
            control: Arc::clone(&control),
            queues: queues.clone(),
            workers: Vec::new(),
            notices: notice_rx,
            clock: ClockState::new(&self.config.sync),
            scheduler: video_decoder
                .as_ref()
                .map(|_| RenderScheduler::new(Arc::clone(&queues.frames), self.config.sync.clone())),
            audio: output,
        };

        let mut spawned = Ok(());
        if let (Some(decoder), Some(stream)) = (video_decoder, info.video.as_ref()) {
            let stage = VideoStage::new(
                decoder,
                stream.time_base,
                Arc::clone(&queues.video_packets),
                Arc::clone(&queues.frames),
                Arc::clone(&control),
                self.gpu.clone(),
                Arc::clone(&self.metrics),
                notice_tx.clone(),
            );
            spawned = spawned.and_then(|_| session.spawn(VIDEO_THREAD, move || stage.run()));
        }
        if let (Some(decoder), Some(stream)) = (audio_decoder, info.audio.as_ref()) {
            let stage = AudioStage::new(
                decoder,
                stream.time_base,
                Arc::clone(&queues.audio_packets),
                Arc::clone(&queues.audio),
                Arc::clone(&control),
                Arc::clone(&self.metrics),
                notice_tx.clone(),
            );
            spawned = spawned.and_then(|_| session.spawn(AUDIO_THREAD, move || stage.run()));
        }
        let stage = DemuxStage::new(demux, info.clone(), &queues, Arc::clone(&control), notice_tx);
        spawned = spawned.and_then(|_| session.spawn(DEMUX_THREAD, move || stage.run()));

        if let Err(err) = spawned {
            session.shutdown();
            return Err(err);
        }

        tracing::info!(
            "playback started: video={} audio={}",
            session.scheduler.is_some(),
            session.audio.is_some()
        );
        self.session = Some(session);
        Ok(())
    }

    /// Tear down the session. Emits position 0 unless `at_end`.
    fn end_session(&mut self, at_end: bool) {
        if let Some(mut session) = self.session.take() {
            session.shutdown();
            tracing::info!("playback stopped");
        }
        self.start_position = None;
        self.set_state(PlaybackState::Stopped);
        if !at_end {
            self.position = 0.0;
            self.emit(PlayerEvent::PositionChanged(0.0));
        }
    }

    /// Handle worker notices; a fatal error ends the session.
    fn supervise(&mut self) {
        let Some(notice) = self
            .session
            .as_ref()
            .and_then(|session| session.notices.try_recv().ok())
        else {
            return;
        };
        tracing::error!("{} failed: {}", notice.stage, notice.error);
        self.end_session(false);
        self.emit(PlayerEvent::ErrorOccurred(notice.error.to_string()));
    }

    /// Release the loop barrier and detect end of playback.
    fn check_stream_ends(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.all_streams(RenderScheduler::is_parked, AudioOutput::is_parked) {
            tracing::debug!("loop wrap");
            session.clock.reset();
            if let Some(scheduler) = session.scheduler.as_mut() {
                scheduler.resume_after_rewind();
            }
            if let Some(audio) = session.audio.as_mut() {
                audio.resume_after_rewind();
            }
        } else if session.all_streams(RenderScheduler::is_finished, AudioOutput::is_finished) {
            tracing::info!("end of file");
            self.emit(PlayerEvent::EndOfFile);
            self.end_session(true);
        }
    }

    /// Render tick: present the head frame once it is due.
    pub fn render_tick(&mut self, now: Instant) {
        self.supervise();
        if !self.state.is_playing() {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(audio) = session.audio.as_ref() {
            audio.sync_clock(&mut session.clock);
        }

        let mut new_position = None;
        if let Some(scheduler) = session.scheduler.as_mut() {
            if let Some(frame) = scheduler.tick(now, &mut session.clock, self.metrics.as_ref()) {
                let start = Instant::now();
                let result = {
                    let _guard = self.gpu.lock();
                    self.presenter.present(&frame)
                };
                self.metrics.record(Metric::Present(start.elapsed()));
                self.metrics.record(Metric::FramePresented);
                if let Err(err) = result {
                    tracing::warn!("present failed: {}", err);
                }
                new_position = Some(frame.pts);
            }
        } else if let Some(clock) = session.clock.audio_clock() {
            if (clock - self.position).abs() >= 0.001 {
                new_position = Some(clock);
            }
        }

        if let Some(position) = new_position {
            self.position = position;
            self.emit(PlayerEvent::PositionChanged(position));
        }
        self.check_stream_ends();
    }

    /// Audio tick: keep the device fed.
    pub fn audio_tick(&mut self) {
        self.supervise();
        if !self.state.is_playing() {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            if let Some(audio) = session.audio.as_mut() {
                audio.tick(&mut session.clock, self.volume, self.metrics.as_ref());
            }
        }
        self.check_stream_ends();
    }

    /// Both ticks at once, for callers with a single timer.
    pub fn tick(&mut self, now: Instant) {
        self.audio_tick();
        self.render_tick(now);
    }
}

impl PlayerControl for Player {
    fn open(&mut self, path: &Path) -> Result<(), PlayerError> {
        if self.session.is_some() {
            self.stop();
        }
        self.media = None;
        self.info = None;
        self.path = None;
        self.start_position = None;
        self.position = 0.0;

        match self.media_backend.open(path, self.decode_mode) {
            Ok(media) => {
                tracing::info!(
                    "opened {} ({:.3}s, video={}, audio={}, hardware={})",
                    path.display(),
                    media.info.duration,
                    media.info.video.is_some(),
                    media.info.audio.is_some(),
                    media.info.video.as_ref().is_some_and(|v| v.hardware)
                );
                let duration = media.info.duration;
                self.gpu.set_multithread_protected(
                    media
                        .info
                        .video
                        .as_ref()
                        .is_some_and(|v| v.multithread_protected),
                );
                self.info = Some(media.info.clone());
                self.media = Some(media);
                self.path = Some(path.to_path_buf());
                self.emit(PlayerEvent::FileLoaded);
                self.emit(PlayerEvent::DurationChanged(duration));
                Ok(())
            }
            Err(err) => {
                tracing::error!("cannot open {}: {}", path.display(), err);
                self.emit(PlayerEvent::ErrorOccurred(err.to_string()));
                Err(err.into())
            }
        }
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        match self.state {
            PlaybackState::Playing => Ok(()),
            PlaybackState::Paused => {
                if let Some(session) = self.session.as_mut() {
                    if let Some(audio) = session.audio.as_mut() {
                        audio.resume();
                    }
                    // re-base the frame timer on the next tick
                    session.clock.frame_timer = None;
                }
                self.set_state(PlaybackState::Playing);
                Ok(())
            }
            PlaybackState::Stopped => {
                if let Err(err) = self.start_session() {
                    tracing::error!("cannot start playback: {}", err);
                    self.emit(PlayerEvent::ErrorOccurred(err.to_string()));
                    return Err(err);
                }
                self.set_state(PlaybackState::Playing);
                if let Some(target) = self.start_position.take() {
                    if target > 0.0 {
                        self.seek(target);
                    }
                }
                Ok(())
            }
        }
    }

    fn pause(&mut self) {
        if !self.state.is_playing() {
            return;
        }
        if let Some(audio) = self.session.as_mut().and_then(|s| s.audio.as_mut()) {
            audio.pause();
        }
        self.set_state(PlaybackState::Paused);
    }

    fn stop(&mut self) {
        self.end_session(false);
    }

    fn toggle_pause(&mut self) -> Result<(), PlayerError> {
        if self.state.is_playing() {
            self.pause();
            Ok(())
        } else {
            self.play()
        }
    }

    fn seek(&mut self, seconds: Seconds) {
        let target = seconds.clamp(0.0, self.duration().max(0.0));
        match self.session.as_mut() {
            None => {
                self.start_position = Some(target);
            }
            Some(session) => {
                let serial = session.control.request_seek(target);
                session.queues.wake_all();
                session.queues.frames.clear();
                session.queues.audio.clear();
                session.clock.reset();
                if let Some(scheduler) = session.scheduler.as_mut() {
                    scheduler.begin_seek(serial);
                }
                if let Some(audio) = session.audio.as_mut() {
                    audio.begin_seek(serial);
                }
                tracing::debug!("seek to {:.3}s (serial {})", target, serial);
            }
        }
        self.position = target;
        self.emit(PlayerEvent::PositionChanged(target));
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(100);
    }

    fn set_loop(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
        if let Some(session) = self.session.as_ref() {
            session.control.set_loop(enabled);
        }
    }

    fn set_decode_mode(&mut self, mode: DecodeMode) {
        self.decode_mode = mode;
    }

    fn decode_mode(&self) -> DecodeMode {
        self.decode_mode
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::VirtualAudio;
    use crate::media::synthetic::{SyntheticBackend, SyntheticOptions};
    use crate::render::NullPresenter;

    fn player(options: SyntheticOptions) -> Player {
        Player::new(
            PlayerConfig::default(),
            Arc::new(SyntheticBackend::new(options)),
            Arc::new(VirtualAudio::manual()),
            Box::new(NullPresenter::new()),
        )
    }

    fn drain(events: &Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn test_open_emits_loaded_and_duration() {
        let mut player = player(SyntheticOptions::default());
        let events = player.events();
        player.open(Path::new("a.mp4")).unwrap();
        assert_eq!(
            drain(&events),
            vec![PlayerEvent::FileLoaded, PlayerEvent::DurationChanged(2.0)]
        );
        assert_eq!(player.video_size(), Some((64, 36)));
        assert!(!player.is_hardware_decoding());
        assert_eq!(player.media_backend_name(), "synthetic");
    }

    #[test]
    fn test_open_failure_emits_error() {
        let mut player = player(SyntheticOptions {
            open_failure: Some("invalid data".into()),
            ..SyntheticOptions::default()
        });
        let events = player.events();
        assert!(player.open(Path::new("bad.mp4")).is_err());
        assert!(matches!(drain(&events).as_slice(), [PlayerEvent::ErrorOccurred(_)]));
        assert!(matches!(player.play(), Err(PlayerError::NoMedia)));
    }

    #[test]
    fn test_seek_while_stopped_is_clamped_and_recorded() {
        let mut player = player(SyntheticOptions::default());
        player.open(Path::new("a.mp4")).unwrap();
        let events = player.events();
        drain(&events);
        player.seek(7.5);
        player.seek(-1.0);
        player.seek(1.25);
        assert_eq!(
            drain(&events),
            vec![
                PlayerEvent::PositionChanged(2.0),
                PlayerEvent::PositionChanged(0.0),
                PlayerEvent::PositionChanged(1.25),
            ]
        );
        assert_eq!(player.position(), 1.25);
    }

    #[test]
    fn test_play_pause_stop_transitions() {
        let mut player = player(SyntheticOptions::default());
        let events = player.events();
        player.open(Path::new("a.mp4")).unwrap();
        drain(&events);

        player.play().unwrap();
        assert!(player.state().is_playing());
        player.toggle_pause().unwrap();
        assert!(player.state().is_paused());
        player.toggle_pause().unwrap();
        player.stop();
        assert!(player.state().is_stopped());

        assert_eq!(
            drain(&events),
            vec![
                PlayerEvent::PlaybackStateChanged(true),
                PlayerEvent::PlaybackStateChanged(false),
                PlayerEvent::PlaybackStateChanged(true),
                PlayerEvent::PlaybackStateChanged(false),
                PlayerEvent::PositionChanged(0.0),
            ]
        );

        // a stopped player reopens its media on the next play
        player.play().unwrap();
        assert!(player.state().is_playing());
        player.stop();
    }

    #[test]
    fn test_volume_and_settings() {
        let mut player = player(SyntheticOptions::default());
        player.set_volume(250);
        assert_eq!(player.volume(), 100);
        player.set_loop(false);
        assert!(!player.loop_enabled());
        player.set_decode_mode(DecodeMode::Software);
        assert_eq!(player.decode_mode(), DecodeMode::Software);
        assert_eq!(player.renderer_name(), "null");
    }
}
