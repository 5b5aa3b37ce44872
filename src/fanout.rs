use std::net::{IpAddr, SocketAddr};

/// Destination bookkeeping for the initial handshake flight
///
/// Until the basestation answers, outbound datagrams are copied to every
/// resolved candidate. The source of the first inbound datagram the channel
/// accepts becomes the active endpoint and the only destination thereafter.
#[derive(Debug, Default)]
pub(crate) struct Fanout {
    candidates: Vec<SocketAddr>,
    active: Option<SocketAddr>,
}

impl Fanout {
    /// Replace the candidate set from a fresh resolution
    pub(crate) fn reset(&mut self, addrs: &[IpAddr], port: u16, limit: usize) {
        self.candidates.clear();
        self.candidates
            .extend(addrs.iter().take(limit).map(|&ip| SocketAddr::new(ip, port)));
        self.active = None;
    }

    /// Record the remote of an accepted inbound datagram; returns whether
    /// this confirmed the active endpoint
    pub(crate) fn confirm(&mut self, remote: SocketAddr) -> bool {
        if self.active.is_some() {
            return false;
        }
        self.active = Some(remote);
        true
    }

    pub(crate) fn active(&self) -> Option<SocketAddr> {
        self.active
    }

    pub(crate) fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }
}
