//! Decode pipeline: demuxer, video and audio decode stages and the queues between them.
//!
//! ```text
//! demux ──▶ video packets ──▶ video decode ──▶ frames ──▶ render scheduler
//!       └─▶ audio packets ──▶ audio decode ──▶ audio  ──▶ audio output
//! ```
//!
//! Every queue carries [`QueueItem`]s so discontinuities travel in-band, in order with the
//! data they separate.

use std::sync::Arc;

use crate::audio::buffer::PcmBuffer;
use crate::config::QueueConfig;
use crate::core::time::Seconds;
use crate::media::{CompressedUnit, DecodeError, VideoFrame};

pub mod audio;
pub mod control;
pub mod demux;
pub mod queue;
pub mod video;

pub use control::{SeekRequest, SessionControl};
pub use queue::{BoundedQueue, WAIT_TICK};

/// Thread names of the session workers
pub const DEMUX_THREAD: &str = "demux";
pub const VIDEO_THREAD: &str = "video-decode";
pub const AUDIO_THREAD: &str = "audio-decode";

/// Why a stream is discontinuous at a flush marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Discontinuity {
    /// The user seeked; consumers waiting for `serial` resume here
    Seek { target: Seconds, serial: u64 },
    /// End of stream with looping enabled; the next item starts the next pass at 0
    Rewind,
}

/// Entry of any pipeline queue.
#[derive(Debug, Clone)]
pub enum QueueItem<T> {
    Data(T),
    /// Reset decoder state; items before and after are not contiguous
    Flush(Discontinuity),
    /// No further items for this stream
    End,
}

impl<T> QueueItem<T> {
    pub fn is_data(&self) -> bool {
        matches!(self, QueueItem::Data(_))
    }

    pub fn as_data(&self) -> Option<&T> {
        match self {
            QueueItem::Data(data) => Some(data),
            _ => None,
        }
    }
}

pub type PacketItem = QueueItem<CompressedUnit>;
pub type FrameItem = QueueItem<VideoFrame>;
pub type AudioItem = QueueItem<PcmBuffer>;

/// A fatal stage failure, reported to the player.
#[derive(Debug, Clone)]
pub struct WorkerNotice {
    pub stage: &'static str,
    pub error: DecodeError,
}

/// The four queues of one session.
#[derive(Debug, Clone)]
pub struct SessionQueues {
    pub video_packets: Arc<BoundedQueue<PacketItem>>,
    pub audio_packets: Arc<BoundedQueue<PacketItem>>,
    pub frames: Arc<BoundedQueue<FrameItem>>,
    pub audio: Arc<BoundedQueue<AudioItem>>,
}

impl SessionQueues {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            video_packets: Arc::new(BoundedQueue::new(config.video_packets)),
            audio_packets: Arc::new(BoundedQueue::new(config.audio_packets)),
            frames: Arc::new(BoundedQueue::new(config.video_frames)),
            audio: Arc::new(BoundedQueue::new(config.audio_buffers)),
        }
    }

    /// Unblock every waiting producer and consumer.
    pub fn wake_all(&self) {
        self.video_packets.wake_all();
        self.audio_packets.wake_all();
        self.frames.wake_all();
        self.audio.wake_all();
    }

    /// Drop every queued item.
    pub fn clear_all(&self) {
        self.video_packets.clear();
        self.audio_packets.clear();
        self.frames.clear();
        self.audio.clear();
    }
}
