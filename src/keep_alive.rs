//! Liveness supervision for an established attachment.

use std::time::Duration;

use crate::packet::{self, KEEP_ALIVE_REQUEST};
use crate::platform::PacketCounts;

/// What the session should do after a keep-alive wake
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KeepAliveAction {
    /// Traffic is flowing; re-arm the timer and do nothing else
    Nothing,
    /// Send a probe request and re-arm the timer
    SendProbe,
    /// The connection is considered dead; close the channel
    Timeout,
}

/// Strategy deciding when an attached connection is dead
///
/// The session consults the supervisor from its keep-alive timer and closes
/// the channel on [`KeepAliveAction::Timeout`], which drives the ordinary
/// detach path.
pub trait KeepAlive {
    /// Classify connection liveness from the channel's datagram counters
    fn classify(&mut self, counts: PacketCounts) -> KeepAliveAction;
    /// How long to wait before the next wake
    fn next_wait(&self) -> Duration;
    /// The probe request frame to send
    fn probe_request(&self) -> Vec<u8>;
    /// Handle an inbound probe frame, returning the response to send, if any
    fn handle_probe(&mut self, frame: &[u8]) -> Option<Vec<u8>>;
    /// Forget accumulated liveness state, e.g. after a reattach
    fn reset(&mut self);
    /// Permanently stop probing
    fn stop(&mut self);
}

/// Default supervisor using the channel's datagram counters
///
/// A wake where both counters advanced counts as proof of life. A wake where
/// either stalled sends a probe; too many consecutive probes without counter
/// movement is a timeout.
pub struct CountingKeepAlive {
    interval: Duration,
    retry_interval: Duration,
    max_retries: u32,
    last_counts: PacketCounts,
    lost_probes: u32,
    stopped: bool,
}

impl CountingKeepAlive {
    /// Create a supervisor with explicit timing parameters
    pub fn new(interval: Duration, retry_interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            retry_interval,
            max_retries,
            last_counts: PacketCounts::default(),
            lost_probes: 0,
            stopped: false,
        }
    }
}

impl Default for CountingKeepAlive {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(2), 15)
    }
}

impl KeepAlive for CountingKeepAlive {
    fn classify(&mut self, counts: PacketCounts) -> KeepAliveAction {
        if self.stopped {
            return KeepAliveAction::Nothing;
        }
        if counts.received > self.last_counts.received && counts.sent > self.last_counts.sent {
            self.last_counts = counts;
            self.lost_probes = 0;
            return KeepAliveAction::Nothing;
        }
        if self.lost_probes >= self.max_retries {
            return KeepAliveAction::Timeout;
        }
        self.lost_probes += 1;
        KeepAliveAction::SendProbe
    }

    fn next_wait(&self) -> Duration {
        if self.lost_probes == 0 {
            self.interval
        } else {
            self.retry_interval
        }
    }

    fn probe_request(&self) -> Vec<u8> {
        packet::keep_alive_request()
    }

    fn handle_probe(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        match frame.get(1) {
            Some(&KEEP_ALIVE_REQUEST) => Some(packet::keep_alive_response()),
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.last_counts = PacketCounts::default();
        self.lost_probes = 0;
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
