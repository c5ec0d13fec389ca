//! End-to-end playback against the synthetic backend and a manually clocked audio device.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;

use floatplay::audio::VirtualAudio;
use floatplay::media::synthetic::{SyntheticBackend, SyntheticOptions, SyntheticVideo};
use floatplay::media::{OpenError, PixelLayout};
use floatplay::render::{GpuLock, NullPresenter, PresentLog};
use floatplay::{DecodeMode, Player, PlayerConfig, PlayerControl, PlayerError, PlayerEvent};

const STEP: Duration = Duration::from_millis(10);

struct Harness {
    player: Player,
    events: Receiver<PlayerEvent>,
    audio: VirtualAudio,
    presented: PresentLog,
    now: Instant,
}

impl Harness {
    fn new(options: SyntheticOptions, config: PlayerConfig) -> Self {
        let audio = VirtualAudio::manual();
        let gpu = GpuLock::new();
        let (presenter, presented) = NullPresenter::recording(gpu.clone());
        let player = Player::new(
            config,
            Arc::new(SyntheticBackend::new(options)),
            Arc::new(audio.clone()),
            Box::new(presenter),
        )
        .with_gpu_lock(gpu);
        let events = player.events();
        Self {
            player,
            events,
            audio,
            presented,
            now: Instant::now(),
        }
    }

    fn looping(options: SyntheticOptions, enabled: bool) -> Self {
        let config = PlayerConfig {
            loop_playback: enabled,
            ..PlayerConfig::default()
        };
        Self::new(options, config)
    }

    fn open_and_play(&mut self) {
        self.player.open(Path::new("clip.mp4")).unwrap();
        self.player.play().unwrap();
    }

    /// Advance virtual time by one step, giving the workers a moment of real time.
    fn step(&mut self) -> Vec<PlayerEvent> {
        thread::sleep(Duration::from_millis(1));
        self.audio.advance(STEP);
        self.now += STEP;
        self.player.audio_tick();
        self.player.render_tick(self.now);
        self.events.try_iter().collect()
    }

    /// Step until `done` sees a matching event or `max_steps` elapse.
    fn run_until(
        &mut self,
        max_steps: usize,
        mut done: impl FnMut(&PlayerEvent) -> bool,
    ) -> Vec<PlayerEvent> {
        let mut seen = Vec::new();
        for _ in 0..max_steps {
            for event in self.step() {
                let stop = done(&event);
                seen.push(event);
                if stop {
                    return seen;
                }
            }
        }
        panic!("condition not reached within {} steps; last events: {:?}", max_steps, seen.iter().rev().take(5).collect::<Vec<_>>());
    }
}

fn positions(events: &[PlayerEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|event| match event {
            PlayerEvent::PositionChanged(p) => Some(*p),
            _ => None,
        })
        .collect()
}

fn samples(bytes: &[u8]) -> impl Iterator<Item = i16> + '_ {
    bytes.chunks_exact(2).map(|s| i16::from_le_bytes([s[0], s[1]]))
}

#[test]
fn test_plays_to_end_without_loop() {
    let mut h = Harness::looping(SyntheticOptions { duration: 10.0, ..Default::default() }, false);
    h.player.open(Path::new("clip.mp4")).unwrap();
    let opened: Vec<_> = h.events.try_iter().collect();
    assert_eq!(
        opened,
        vec![PlayerEvent::FileLoaded, PlayerEvent::DurationChanged(10.0)]
    );
    h.player.play().unwrap();

    let events = h.run_until(3_000, |e| matches!(e, PlayerEvent::EndOfFile));
    let positions = positions(&events);
    assert!(positions.windows(2).all(|w| w[0] <= w[1]), "positions went backwards");
    assert!(*positions.last().unwrap() >= 9.9);
    assert!(!events.iter().any(|e| matches!(e, PlayerEvent::ErrorOccurred(_))));

    // stopped at the end without a position reset
    assert!(h.player.state().is_stopped());
    assert!(h.player.position() >= 9.9);
    assert!(!h.events.try_iter().any(|e| e == PlayerEvent::PositionChanged(0.0)));
}

#[test]
fn test_loop_wraps_to_start() {
    let mut h = Harness::looping(SyntheticOptions { duration: 10.0, ..Default::default() }, true);
    h.open_and_play();

    let mut reached_end = false;
    let events = h.run_until(3_000, |e| match e {
        PlayerEvent::PositionChanged(p) if *p >= 9.9 => {
            reached_end = true;
            false
        }
        PlayerEvent::PositionChanged(p) => reached_end && *p < 0.2,
        _ => false,
    });
    assert!(!events.iter().any(|e| matches!(e, PlayerEvent::EndOfFile)));
    assert!(h.player.state().is_playing());

    // the second pass keeps advancing
    let more = h.run_until(200, |e| matches!(e, PlayerEvent::PositionChanged(p) if *p >= 1.0));
    assert!(!more.iter().any(|e| matches!(e, PlayerEvent::EndOfFile)));
    h.player.stop();
}

#[test]
fn test_seek_while_playing_drops_stale_frames() {
    let mut h = Harness::looping(SyntheticOptions { duration: 10.0, ..Default::default() }, false);
    h.open_and_play();
    h.run_until(500, |e| matches!(e, PlayerEvent::PositionChanged(p) if *p >= 1.0));

    h.player.seek(5.0);
    let after_seek: Vec<_> = h.events.try_iter().collect();
    assert_eq!(positions(&after_seek), vec![5.0]);

    let events = h.run_until(500, |e| matches!(e, PlayerEvent::PositionChanged(p) if *p >= 6.0));
    let positions = positions(&events);
    let first = positions[0];
    assert!((5.0..5.5).contains(&first), "first position after seek was {}", first);
    assert!(positions.iter().all(|p| *p >= 4.9), "stale position in {:?}", positions);
    h.player.stop();
}

#[test]
fn test_volume_applies_to_following_buffers() {
    let config = PlayerConfig {
        volume: 0,
        ..PlayerConfig::default()
    };
    let mut h = Harness::new(SyntheticOptions { duration: 10.0, ..Default::default() }, config);
    h.open_and_play();
    h.run_until(500, |e| matches!(e, PlayerEvent::PositionChanged(p) if *p >= 1.0));

    let silent_len = h.audio.captured().len();
    assert!(silent_len > 0);
    h.player.set_volume(100);
    h.run_until(500, |e| matches!(e, PlayerEvent::PositionChanged(p) if *p >= 2.0));

    let captured = h.audio.captured();
    assert!(samples(&captured[..silent_len]).all(|s| s == 0));
    // the buffer in flight at the change keeps its volume; later ones are at full amplitude
    let tail = &captured[silent_len + 8_192..];
    let peak = samples(tail).map(|s| s.unsigned_abs()).max().unwrap();
    assert!((7_500..=8_200).contains(&peak), "peak {}", peak);
    h.player.stop();
}

#[test]
fn test_presents_under_gpu_lock() {
    let mut h = Harness::looping(SyntheticOptions::video_only(1.0), false);
    h.open_and_play();
    h.run_until(500, |e| matches!(e, PlayerEvent::EndOfFile));

    let log = h.presented.lock();
    assert!(!log.is_empty());
    assert!(log.iter().all(|record| record.locked));
    assert!(log.iter().all(|record| record.layout == PixelLayout::Packed));
}

#[test]
fn test_hardware_frames_present_biplanar() {
    let options = SyntheticOptions {
        video: Some(SyntheticVideo {
            hardware: true,
            failed_download: Some(3),
            ..SyntheticVideo::default()
        }),
        ..SyntheticOptions::video_only(1.0)
    };
    let mut h = Harness::looping(options, false);
    h.open_and_play();
    assert!(h.player.is_hardware_decoding());
    h.run_until(500, |e| matches!(e, PlayerEvent::EndOfFile));

    let log = h.presented.lock();
    assert!(log.iter().all(|record| record.layout == PixelLayout::Biplanar));
    // frame 3 failed to download and was skipped
    assert!(!log.iter().any(|record| (record.pts - 0.1).abs() < 1e-6));
}

#[test]
fn test_protected_device_marks_gpu_lock() {
    let options = SyntheticOptions {
        video: Some(SyntheticVideo {
            hardware: true,
            multithread_protected: true,
            ..SyntheticVideo::default()
        }),
        ..SyntheticOptions::video_only(1.0)
    };
    let mut h = Harness::looping(options, false);
    h.player.open(Path::new("clip.mp4")).unwrap();
    assert!(h.player.gpu_lock().multithread_protected());

    // the software path has no device to protect
    h.player.set_decode_mode(DecodeMode::Software);
    h.player.open(Path::new("clip.mp4")).unwrap();
    assert!(!h.player.is_hardware_decoding());
    assert!(!h.player.gpu_lock().multithread_protected());
}

#[test]
fn test_audio_only_positions_follow_audio_clock() {
    let mut h = Harness::looping(SyntheticOptions::audio_only(1.0), false);
    h.open_and_play();
    let events = h.run_until(500, |e| matches!(e, PlayerEvent::EndOfFile));

    let positions = positions(&events);
    assert!(positions.len() > 10);
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    assert!(*positions.last().unwrap() > 0.8);
}

#[test]
fn test_hardware_mode_requires_hardware_path() {
    let mut h = Harness::looping(SyntheticOptions::default(), false);
    h.player.set_decode_mode(DecodeMode::Hardware);
    let result = h.player.open(Path::new("clip.mp4"));
    assert!(matches!(
        result,
        Err(PlayerError::Open(OpenError::HardwareUnavailable(_)))
    ));
    assert!(h
        .events
        .try_iter()
        .any(|e| matches!(e, PlayerEvent::ErrorOccurred(_))));

    h.player.set_decode_mode(DecodeMode::Auto);
    h.player.open(Path::new("clip.mp4")).unwrap();
    assert!(!h.player.is_hardware_decoding());
}

#[test]
fn test_open_failure_reports_error() {
    let options = SyntheticOptions {
        open_failure: Some("moov atom not found".into()),
        ..SyntheticOptions::default()
    };
    let mut h = Harness::looping(options, false);
    assert!(h.player.open(Path::new("broken.mp4")).is_err());
    let events: Vec<_> = h.events.try_iter().collect();
    assert!(matches!(
        events.as_slice(),
        [PlayerEvent::ErrorOccurred(message)] if message.contains("moov atom not found")
    ));
    assert!(h.player.state().is_stopped());
}

#[test]
fn test_read_error_stops_session() {
    let options = SyntheticOptions {
        duration: 5.0,
        fail_read_at: Some(1.0),
        ..SyntheticOptions::default()
    };
    let mut h = Harness::looping(options, true);
    h.open_and_play();
    let events = h.run_until(1_000, |e| matches!(e, PlayerEvent::ErrorOccurred(_)));

    assert!(events.contains(&PlayerEvent::PlaybackStateChanged(false)));
    assert!(h.player.state().is_stopped());
    assert!(!events.iter().any(|e| matches!(e, PlayerEvent::EndOfFile)));
}

#[test]
fn test_pause_holds_position() {
    let mut h = Harness::looping(SyntheticOptions { duration: 10.0, ..Default::default() }, false);
    h.open_and_play();
    h.run_until(500, |e| matches!(e, PlayerEvent::PositionChanged(p) if *p >= 0.5));

    h.player.pause();
    let held = h.player.position();
    for _ in 0..50 {
        let events = h.step();
        assert!(positions(&events).is_empty());
    }
    assert_eq!(h.player.position(), held);
    assert!(h.audio.is_paused());

    h.player.play().unwrap();
    let events = h.run_until(200, |e| matches!(e, PlayerEvent::PositionChanged(_)));
    assert!(positions(&events)[0] >= held);
    h.player.stop();
}
