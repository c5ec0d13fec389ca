//! Flags shared by the control thread and the workers of one playback session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::core::time::Seconds;

/// A pending seek. `serial` identifies the flush markers the seek produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    pub target: Seconds,
    pub serial: u64,
}

/// Session-wide control state.
///
/// `running` goes false exactly once, at shutdown. `seeking` is true from the moment a seek
/// is requested until the demuxer has injected the flush markers of the newest request.
#[derive(Debug)]
pub struct SessionControl {
    running: AtomicBool,
    seeking: AtomicBool,
    loop_enabled: AtomicBool,
    serial: AtomicU64,
    request: Mutex<Option<SeekRequest>>,
    /// Wakes the demuxer while it idles at end of stream
    idle: Condvar,
    idle_lock: Mutex<()>,
}

impl SessionControl {
    pub fn new(loop_enabled: bool) -> Self {
        Self {
            running: AtomicBool::new(true),
            seeking: AtomicBool::new(false),
            loop_enabled: AtomicBool::new(loop_enabled),
            serial: AtomicU64::new(0),
            request: Mutex::new(None),
            idle: Condvar::new(),
            idle_lock: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking.load(Ordering::Acquire)
    }

    /// Producers abandon blocked enqueues when this is true.
    pub fn is_cancelled(&self) -> bool {
        !self.is_running() || self.is_seeking()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.notify_idle();
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled.load(Ordering::Acquire)
    }

    pub fn set_loop(&self, enabled: bool) {
        self.loop_enabled.store(enabled, Ordering::Release);
        self.notify_idle();
    }

    /// Record a seek to `target`, superseding any request not yet taken. Returns its serial.
    pub fn request_seek(&self, target: Seconds) -> u64 {
        let mut request = self.request.lock();
        let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
        *request = Some(SeekRequest { target, serial });
        self.seeking.store(true, Ordering::Release);
        drop(request);
        self.notify_idle();
        serial
    }

    /// Take the newest pending seek, if any. Called by the demuxer.
    pub fn take_seek_request(&self) -> Option<SeekRequest> {
        self.request.lock().take()
    }

    /// The flush markers for `serial` are in place. Clears `seeking` unless a newer request
    /// is waiting to be taken.
    pub fn complete_seek(&self, serial: u64) {
        let request = self.request.lock();
        if request.is_none() && self.serial.load(Ordering::Acquire) == serial {
            self.seeking.store(false, Ordering::Release);
        }
    }

    /// Block for at most `timeout`, returning early on seek, loop toggle or shutdown.
    pub fn wait_idle(&self, timeout: Duration) {
        let mut guard = self.idle_lock.lock();
        self.idle.wait_for(&mut guard, timeout);
    }

    fn notify_idle(&self) {
        let _guard = self.idle_lock.lock();
        self.idle.notify_all();
    }
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_flag_lifecycle() {
        let control = SessionControl::new(false);
        assert!(!control.is_cancelled());

        let serial = control.request_seek(3.0);
        assert!(control.is_seeking());
        assert!(control.is_cancelled());

        let request = control.take_seek_request().unwrap();
        assert_eq!(request, SeekRequest { target: 3.0, serial });
        control.complete_seek(request.serial);
        assert!(!control.is_seeking());
    }

    #[test]
    fn test_newer_request_keeps_seeking() {
        let control = SessionControl::default();
        let first = control.request_seek(1.0);
        let taken = control.take_seek_request().unwrap();
        assert_eq!(taken.serial, first);

        let second = control.request_seek(2.0);
        control.complete_seek(first);
        assert!(control.is_seeking());

        let taken = control.take_seek_request().unwrap();
        assert_eq!(taken.serial, second);
        control.complete_seek(second);
        assert!(!control.is_seeking());
    }

    #[test]
    fn test_shutdown_cancels() {
        let control = SessionControl::default();
        control.shutdown();
        assert!(!control.is_running());
        assert!(control.is_cancelled());
    }
}
