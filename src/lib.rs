//! Device-side attach protocol logic for a relay rendezvous service.
//!
//! An embedded device becomes reachable by attaching to a basestation: it
//! resolves the basestation's hostname, fans its handshake out to every
//! resolved address, runs a short request/response sub-protocol over the
//! resulting secure channel, and then holds the attachment open under
//! keep-alive supervision, reattaching after failures, redirects, and access
//! denials.
//!
//! This crate contains the deterministic protocol logic only. The
//! [`AttachSession`] performs no I/O and never blocks: the driver owns the
//! sockets, the secure transport, and the clock, wires them in through the
//! [`SecureChannel`], [`DnsResolver`], and [`AttachTransport`] traits, and
//! pumps the session with events, datagrams, and timeouts. This makes the
//! whole protocol testable without networking and portable to any runtime.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]

mod coding;
mod config;
mod fanout;
mod keep_alive;
mod packet;
mod platform;
mod session;
mod shared;
mod timer;


pub use crate::config::AttachConfig;
pub use crate::keep_alive::{CountingKeepAlive, KeepAlive, KeepAliveAction};
pub use crate::packet::{
    ApplicationType, AttachResponse, AttachStatus, CodecError, Extension, ExtensionIter,
    ExtensionType, Identity, Packet, PacketBuilder, Redirect, HEADER_SIZE,
};
pub use crate::platform::{
    AttachTransport, ChannelError, ChannelEvent, DnsResolver, PacketCounts, RequestError,
    ResolveError, SecureChannel,
};
pub use crate::session::{AttachSession, AttachState, Event, InvalidStateError, Lifecycle};
pub use crate::shared::{SessionEvent, Transmit};
