use std::net::SocketAddr;

/// An outgoing datagram for the driver to put on the wire
#[derive(Debug, Clone)]
pub struct Transmit {
    /// The socket address to send the datagram to
    pub destination: SocketAddr,
    /// Ciphertext to send
    pub contents: Vec<u8>,
}

/// Application-visible attach lifecycle events
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionEvent {
    /// The device completed the attach sub-protocol and is reachable through
    /// the basestation
    Attached,
    /// An established attachment was lost
    Detached,
}
