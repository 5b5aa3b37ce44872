//! Contracts for the collaborators a session is wired to.
//!
//! The session owns a secure channel, a DNS resolver, and a request/response
//! transport, but only through the narrow traits below. Implementations live
//! outside this crate; every method here must return promptly, and anything
//! that completes later is reported back through [`crate::Event`].

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Completion events reported by the secure channel
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelEvent {
    /// The handshake finished and application data may flow
    HandshakeComplete,
    /// The channel is closed, whether locally requested or from failure
    Closed,
    /// The peer rejected the device's credentials
    AccessDenied,
}

/// Cumulative datagram counts observed by the secure channel
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PacketCounts {
    /// Datagrams accepted from the peer
    pub received: u64,
    /// Datagrams handed to the wire
    pub sent: u64,
}

/// Errors reported synchronously by the secure channel
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ChannelError {
    /// The operation is not valid in the channel's current state
    #[error("invalid state for this operation")]
    InvalidState,
    /// The channel refused the data
    #[error("channel rejected the data")]
    Rejected,
    /// The supplied key material is unusable
    #[error("invalid key material")]
    InvalidKeys,
}

/// A DTLS-like secure datagram channel
///
/// Handshake completion, closure, and credential rejection arrive later as
/// [`ChannelEvent`]s through [`crate::Event::Channel`].
pub trait SecureChannel {
    /// Set the server name for the next handshake
    fn set_sni(&mut self, hostname: &str);
    /// Install the device keypair used to authenticate
    fn set_keys(&mut self, public_key: &[u8], private_key: &[u8]) -> Result<(), ChannelError>;
    /// Bound the handshake retransmission schedule
    fn set_handshake_timeout(&mut self, min: Duration, max: Duration);
    /// Begin a handshake; failure surfaces as a later `Closed` event
    fn connect(&mut self);
    /// Begin an orderly shutdown, completing with a `Closed` event
    fn close(&mut self);
    /// Return a closed channel to a connectable state
    fn reset(&mut self) -> Result<(), ChannelError>;
    /// The application protocol negotiated by the completed handshake
    fn alpn_protocol(&self) -> Option<Vec<u8>>;
    /// Datagram counters for keep-alive liveness classification
    fn packet_counts(&self) -> PacketCounts;
    /// Queue plaintext for encryption and transmission
    fn send_data(&mut self, data: &[u8]) -> Result<(), ChannelError>;
    /// Feed one inbound ciphertext datagram; `Ok` means it was accepted as
    /// part of this channel's exchange
    fn handle_packet(&mut self, datagram: &[u8]) -> Result<(), ChannelError>;
    /// Take the next outbound ciphertext datagram, if any
    fn poll_transmit(&mut self) -> Option<Vec<u8>>;
}

/// Failure reported by a completed DNS resolution
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("name resolution failed: {reason}")]
pub struct ResolveError {
    reason: String,
}

impl ResolveError {
    /// Describe a failed resolution
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An asynchronous name resolver
///
/// The outcome arrives later through [`crate::Event::ResolveResult`].
pub trait DnsResolver {
    /// Begin resolving `hostname` to addresses
    fn start_resolve(&mut self, hostname: &str);
}

/// Failure of one attach request round trip
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum RequestError {
    /// The request could not be sent
    #[error("failed to send request")]
    SendFailed,
    /// No response arrived in time
    #[error("request timed out")]
    Timeout,
    /// The server answered with an error status
    #[error("request rejected by the server")]
    Rejected,
    /// The channel closed while the request was pending
    #[error("channel closed while request was pending")]
    ChannelClosed,
}

/// Request/response transport for the attach sub-protocol
///
/// Runs over the secure channel's plaintext stream. Responses arrive later
/// through [`crate::Event::StartResponse`], [`crate::Event::TokenUploadResponse`],
/// and [`crate::Event::EndResponse`].
pub trait AttachTransport {
    /// Send an attach-start request
    fn attach_start(&mut self, request: Bytes) -> Result<(), RequestError>;
    /// Send a server-connect-token upload request
    fn upload_tokens(&mut self, request: Bytes) -> Result<(), RequestError>;
    /// Send an attach-end request
    fn attach_end(&mut self, request: Bytes) -> Result<(), RequestError>;
    /// Feed one inbound plaintext frame in the request/response range
    fn handle_frame(&mut self, frame: &[u8]);
    /// Drop any pending exchanges; their completions must not be delivered
    fn discard_pending(&mut self);
}
