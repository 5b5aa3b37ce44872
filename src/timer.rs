use std::time::Instant;

/// Timers a session may need armed at any given moment
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to leave `RetryWait` and reattach
    RetryWait = 0,
    /// When to leave `AccessDeniedWait` and reattach
    AccessDeniedWait = 1,
    /// When to wake the keep-alive supervisor
    KeepAlive = 2,
}

impl Timer {
    pub(crate) const VALUES: [Self; 3] = [Self::RetryWait, Self::AccessDeniedWait, Self::KeepAlive];
}

/// A table of data associated with each distinct kind of `Timer`
#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 3],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    pub(crate) fn is_expired(&self, timer: Timer, after: Instant) -> bool {
        self.data[timer as usize].map_or(false, |x| x <= after)
    }

    pub(crate) fn reset(&mut self) {
        self.data = [None; 3];
    }
}
