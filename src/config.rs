use std::time::Duration;

/// Parameters governing the attach state machine
///
/// Default values are suitable for most deployments.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub(crate) retry_wait: Duration,
    pub(crate) access_denied_wait: Duration,
    pub(crate) max_redirects: u8,
    pub(crate) max_endpoints: usize,
}

impl AttachConfig {
    /// How long to wait after a transient failure before reattaching
    ///
    /// Applied after handshake failures, rejected attach requests, lost
    /// connections, and keep-alive timeouts.
    pub fn retry_wait(&mut self, value: Duration) -> &mut Self {
        self.retry_wait = value;
        self
    }

    /// How long to wait after the basestation denies access
    ///
    /// Denial is rarely resolved quickly, so this should dwarf the transient
    /// retry wait to avoid hammering a server that has rejected the device.
    pub fn access_denied_wait(&mut self, value: Duration) -> &mut Self {
        self.access_denied_wait = value;
        self
    }

    /// Maximum number of consecutive redirects followed within one attach
    /// attempt before giving up and entering the retry wait
    pub fn max_redirects(&mut self, value: u8) -> &mut Self {
        self.max_redirects = value;
        self
    }

    /// Maximum number of resolved addresses kept as initial fan-out
    /// candidates
    pub fn max_endpoints(&mut self, value: usize) -> &mut Self {
        self.max_endpoints = value;
        self
    }
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            retry_wait: Duration::from_secs(10),
            access_denied_wait: Duration::from_secs(3600),
            max_redirects: 5,
            max_endpoints: 4,
        }
    }
}
