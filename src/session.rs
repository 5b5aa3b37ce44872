use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, error, info_span, trace, warn};

use crate::config::AttachConfig;
use crate::fanout::Fanout;
use crate::keep_alive::{CountingKeepAlive, KeepAlive, KeepAliveAction};
use crate::packet::{self, ApplicationType, AttachResponse, AttachStatus, Identity};
use crate::platform::{
    AttachTransport, ChannelError, ChannelEvent, DnsResolver, RequestError, ResolveError,
    SecureChannel,
};
use crate::shared::{SessionEvent, Transmit};
use crate::timer::{Timer, TimerTable};

/// Protocol state of an attach session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AttachState {
    /// Resolving the basestation hostname
    Dns,
    /// Handshaking and running the attach sub-protocol
    Connecting,
    /// Attached and supervised by keep-alive probing
    Attached,
    /// Waiting out a transient failure before reattaching
    RetryWait,
    /// Waiting out an access denial before reattaching
    AccessDeniedWait,
    /// Following a redirect; waiting for the channel to finish closing
    Redirect,
    /// Fully torn down
    Closed,
}

/// Lifecycle of the session object, independent of the protocol state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lifecycle {
    /// Constructed but not started; configuration is still mutable
    Setup,
    /// Started and not yet asked to close
    Running,
    /// Close requested; the machine is draining toward `AttachState::Closed`
    Closed,
}

/// Completions delivered to [`AttachSession::handle_event`]
#[derive(Debug)]
pub enum Event {
    /// A resolution started through the session's resolver finished
    ResolveResult(Result<Vec<IpAddr>, ResolveError>),
    /// The secure channel reported a state change
    Channel(ChannelEvent),
    /// The attach-start round trip finished
    StartResponse(Result<Bytes, RequestError>),
    /// A token-upload round trip finished
    TokenUploadResponse(Result<(), RequestError>),
    /// The attach-end round trip finished
    EndResponse(Result<(), RequestError>),
}

/// The operation is not allowed in the session's current lifecycle state
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("operation not allowed in the current state")]
pub struct InvalidStateError;

/// Server connect token bookkeeping
///
/// `version` counts local mutations, `synchronized_version` the newest
/// version the basestation has acknowledged, and `uploading_version` the
/// version captured when the in-flight upload started.
#[derive(Default)]
struct TokenContext {
    tokens: FxHashSet<String>,
    version: u64,
    synchronized_version: u64,
    uploading_version: u64,
    upload_in_flight: bool,
}

enum UploadStart {
    Started,
    NothingToDo,
    Failed,
}

/// Device-side attach state machine
///
/// Owns a secure channel `C`, a resolver `R`, and a request/response
/// transport `T`, and drives them toward an established attachment with the
/// basestation. The session performs no I/O and never blocks; the driver
/// feeds it completions through [`handle_event`](Self::handle_event), wakes
/// it at [`poll_timeout`](Self::poll_timeout) via
/// [`handle_timeout`](Self::handle_timeout), and flushes
/// [`poll_transmit`](Self::poll_transmit) after every call.
pub struct AttachSession<C, R, T> {
    config: AttachConfig,
    lifecycle: Lifecycle,
    state: AttachState,
    channel: C,
    resolver: R,
    transport: T,
    keep_alive: Box<dyn KeepAlive>,
    span: tracing::Span,
    configured_host: String,
    current_host: String,
    default_port: u16,
    current_port: u16,
    fanout: Fanout,
    pending_transmits: VecDeque<Transmit>,
    redirect_attempts: u8,
    timers: TimerTable,
    identity: Identity,
    tokens: TokenContext,
    state_listener: Option<Box<dyn FnMut(AttachState)>>,
    event_listener: Option<Box<dyn FnMut(SessionEvent)>>,
    close_callback: Option<Box<dyn FnOnce()>>,
    close_requested: bool,
}

impl<C, R, T> AttachSession<C, R, T>
where
    C: SecureChannel,
    R: DnsResolver,
    T: AttachTransport,
{
    /// Create a session in the `Setup` lifecycle
    pub fn new(config: AttachConfig, channel: C, resolver: R, transport: T) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::Setup,
            state: AttachState::Dns,
            channel,
            resolver,
            transport,
            keep_alive: Box::<CountingKeepAlive>::default(),
            span: info_span!("attach", host = tracing::field::Empty),
            configured_host: String::new(),
            current_host: String::new(),
            default_port: 0,
            current_port: 0,
            fanout: Fanout::default(),
            pending_transmits: VecDeque::new(),
            redirect_attempts: 0,
            timers: TimerTable::default(),
            identity: Identity::default(),
            tokens: TokenContext::default(),
            state_listener: None,
            event_listener: None,
            close_callback: None,
            close_requested: false,
        }
    }

    /// Install the device keypair on the secure channel
    ///
    /// Only allowed during `Setup`.
    pub fn set_keys(&mut self, public_key: &[u8], private_key: &[u8]) -> Result<(), ChannelError> {
        if self.lifecycle != Lifecycle::Setup {
            return Err(ChannelError::InvalidState);
        }
        self.channel.set_keys(public_key, private_key)
    }

    /// Set the product and device identifiers sent in the attach request
    ///
    /// Only allowed during `Setup`.
    pub fn set_device_info(
        &mut self,
        product_id: &str,
        device_id: &str,
    ) -> Result<(), InvalidStateError> {
        if self.lifecycle != Lifecycle::Setup {
            return Err(InvalidStateError);
        }
        self.identity.product_id = Some(product_id.to_owned());
        self.identity.device_id = Some(device_id.to_owned());
        Ok(())
    }

    /// Set the application name and version sent in the attach request
    ///
    /// Only allowed during `Setup`.
    pub fn set_app_info(&mut self, name: &str, version: &str) -> Result<(), InvalidStateError> {
        if self.lifecycle != Lifecycle::Setup {
            return Err(InvalidStateError);
        }
        self.identity.app_name = Some(name.to_owned());
        self.identity.app_version = Some(version.to_owned());
        Ok(())
    }

    /// Bound the secure channel's handshake retransmission schedule
    ///
    /// Only allowed during `Setup`.
    pub fn set_handshake_timeout(
        &mut self,
        min: Duration,
        max: Duration,
    ) -> Result<(), InvalidStateError> {
        if self.lifecycle != Lifecycle::Setup {
            return Err(InvalidStateError);
        }
        self.channel.set_handshake_timeout(min, max);
        Ok(())
    }

    /// Replace the keep-alive supervisor
    ///
    /// Only allowed during `Setup`.
    pub fn set_keep_alive(&mut self, keep_alive: Box<dyn KeepAlive>) -> Result<(), InvalidStateError> {
        if self.lifecycle != Lifecycle::Setup {
            return Err(InvalidStateError);
        }
        self.keep_alive = keep_alive;
        Ok(())
    }

    /// Observe every protocol state transition
    pub fn set_state_listener(&mut self, listener: impl FnMut(AttachState) + 'static) {
        self.state_listener = Some(Box::new(listener));
    }

    /// Observe attach and detach events
    pub fn set_event_listener(&mut self, listener: impl FnMut(SessionEvent) + 'static) {
        self.event_listener = Some(Box::new(listener));
    }

    /// Start attaching to `hostname`:`port`
    ///
    /// Moves the lifecycle to `Running`; fails if called more than once.
    pub fn start(&mut self, now: Instant, hostname: &str, port: u16) -> Result<(), InvalidStateError> {
        if self.lifecycle != Lifecycle::Setup {
            return Err(InvalidStateError);
        }
        self.span.record("host", hostname);
        let span = self.span.clone();
        let _guard = span.enter();
        self.lifecycle = Lifecycle::Running;
        self.configured_host = hostname.to_owned();
        self.current_host = hostname.to_owned();
        self.default_port = port;
        self.current_port = port;
        self.enter_state(now, AttachState::Dns);
        Ok(())
    }

    /// Tear the session down without a completion callback
    ///
    /// Also stops keep-alive supervision permanently.
    pub fn stop(&mut self, now: Instant) {
        let span = self.span.clone();
        let _guard = span.enter();
        self.keep_alive.stop();
        self.timers.stop(Timer::KeepAlive);
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        self.do_close(now);
    }

    /// Begin an orderly close, invoking `on_closed` once the session reaches
    /// `AttachState::Closed`
    ///
    /// Requesting a close more than once is a no-op; only the first callback
    /// is retained.
    pub fn async_close(&mut self, now: Instant, on_closed: impl FnOnce() + 'static) {
        let span = self.span.clone();
        let _guard = span.enter();
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        self.close_callback = Some(Box::new(on_closed));
        self.do_close(now);
    }

    /// Process one completion
    pub fn handle_event(&mut self, now: Instant, event: Event) {
        let span = self.span.clone();
        let _guard = span.enter();
        match event {
            Event::ResolveResult(result) => self.on_resolve_result(now, result),
            Event::Channel(event) => self.on_channel_event(now, event),
            Event::StartResponse(result) => self.on_start_response(now, result),
            Event::TokenUploadResponse(result) => self.on_token_upload_response(result),
            Event::EndResponse(result) => self.on_end_response(now, result),
        }
    }

    /// Process timer expirations up to `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        let span = self.span.clone();
        let _guard = span.enter();
        for &timer in Timer::VALUES.iter() {
            if !self.timers.is_expired(timer, now) {
                continue;
            }
            trace!(timer = ?timer, "timeout");
            self.timers.stop(timer);
            match timer {
                Timer::RetryWait | Timer::AccessDeniedWait => self.reattach(now),
                Timer::KeepAlive => self.keep_alive_wake(now),
            }
        }
    }

    /// When the next call to [`handle_timeout`](Self::handle_timeout) is
    /// needed
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Feed one inbound ciphertext datagram
    ///
    /// The source of the first datagram the channel accepts becomes the
    /// active endpoint for all subsequent transmits.
    pub fn handle_datagram(&mut self, remote: SocketAddr, datagram: &[u8]) {
        let span = self.span.clone();
        let _guard = span.enter();
        if self.channel.handle_packet(datagram).is_err() {
            trace!(%remote, "datagram not accepted by the channel");
            return;
        }
        if self.fanout.confirm(remote) {
            trace!(%remote, "active endpoint confirmed");
        }
    }

    /// Feed one plaintext frame delivered by the secure channel
    pub fn handle_channel_data(&mut self, data: &[u8]) {
        let span = self.span.clone();
        let _guard = span.enter();
        match data.first() {
            Some(&ty) if ty == ApplicationType::KeepAlive as u8 => {
                if let Some(response) = self.keep_alive.handle_probe(data) {
                    if let Err(e) = self.channel.send_data(&response) {
                        debug!("failed to answer keep-alive probe: {e}");
                    }
                }
            }
            Some(&ty) if ApplicationType::is_request_response(ty) => {
                self.transport.handle_frame(data);
            }
            Some(&ty) => {
                error!(ty, "unknown application data type");
            }
            None => {}
        }
    }

    /// Take the next outbound datagram
    ///
    /// Until an inbound datagram confirms the active endpoint, each channel
    /// datagram is expanded into one transmit per fan-out candidate.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.pending_transmits.pop_front() {
            return Some(transmit);
        }
        let contents = self.channel.poll_transmit()?;
        if let Some(destination) = self.fanout.active() {
            return Some(Transmit {
                destination,
                contents,
            });
        }
        let (&first, rest) = self.fanout.candidates().split_first()?;
        for &destination in rest {
            self.pending_transmits.push_back(Transmit {
                destination,
                contents: contents.clone(),
            });
        }
        Some(Transmit {
            destination: first,
            contents,
        })
    }

    /// Add a server connect token and schedule its upload
    ///
    /// Uploads happen while attached; tokens added earlier are pushed during
    /// the attach sub-protocol.
    pub fn add_server_connect_token(&mut self, token: &str) {
        let span = self.span.clone();
        let _guard = span.enter();
        self.tokens.version += 1;
        self.tokens.tokens.insert(token.to_owned());
        if self.state == AttachState::Attached {
            if let UploadStart::Failed = self.begin_token_upload() {
                debug!("token upload could not be started; will retry on next change");
            }
        }
    }

    /// Whether the basestation has acknowledged the current token set
    ///
    /// Trivially true while not attached.
    pub fn is_tokens_synchronized(&self) -> bool {
        if self.state == AttachState::Attached {
            self.tokens.synchronized_version == self.tokens.version
        } else {
            true
        }
    }

    /// Current protocol state
    pub fn state(&self) -> AttachState {
        self.state
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// The confirmed basestation endpoint, if any
    pub fn active_endpoint(&self) -> Option<SocketAddr> {
        self.fanout.active()
    }

    fn enter_state(&mut self, now: Instant, state: AttachState) {
        trace!(state = ?state, "entering state");
        self.state = state;
        match state {
            AttachState::Dns => {
                self.resolver.start_resolve(&self.current_host);
            }
            AttachState::Connecting => {
                self.channel.set_sni(&self.current_host);
                self.channel.connect();
            }
            AttachState::Attached => {
                self.timers
                    .set(Timer::KeepAlive, now + self.keep_alive.next_wait());
            }
            AttachState::RetryWait => {
                self.timers
                    .set(Timer::RetryWait, now + self.config.retry_wait);
            }
            AttachState::AccessDeniedWait => {
                self.timers
                    .set(Timer::AccessDeniedWait, now + self.config.access_denied_wait);
            }
            AttachState::Redirect => {}
            AttachState::Closed => {
                self.finish_close();
            }
        }
        if let Some(listener) = self.state_listener.as_mut() {
            listener(state);
        }
    }

    fn do_close(&mut self, now: Instant) {
        if self.lifecycle == Lifecycle::Setup {
            self.lifecycle = Lifecycle::Closed;
            self.state = AttachState::Closed;
            self.finish_close();
            return;
        }
        self.lifecycle = Lifecycle::Closed;
        match self.state {
            AttachState::RetryWait | AttachState::AccessDeniedWait => {
                self.timers.stop(Timer::RetryWait);
                self.timers.stop(Timer::AccessDeniedWait);
                self.enter_state(now, AttachState::Closed);
            }
            AttachState::Closed => {
                self.finish_close();
            }
            AttachState::Connecting | AttachState::Attached => {
                self.channel.close();
            }
            // The close completes when the pending resolution or channel
            // shutdown reports back and observes the closed lifecycle.
            AttachState::Dns | AttachState::Redirect => {}
        }
    }

    fn finish_close(&mut self) {
        self.timers.reset();
        if let Some(callback) = self.close_callback.take() {
            callback();
        }
    }

    fn on_resolve_result(&mut self, now: Instant, result: Result<Vec<IpAddr>, ResolveError>) {
        if self.state != AttachState::Dns {
            debug!("stale resolve result ignored");
            return;
        }
        if self.lifecycle == Lifecycle::Closed {
            self.enter_state(now, AttachState::Closed);
            return;
        }
        match result {
            Err(e) => {
                error!("failed to resolve {}: {e}", self.current_host);
                self.enter_state(now, AttachState::RetryWait);
            }
            Ok(addrs) if addrs.is_empty() => {
                error!("{} resolved to no addresses", self.current_host);
                self.enter_state(now, AttachState::RetryWait);
            }
            Ok(addrs) => {
                self.fanout
                    .reset(&addrs, self.current_port, self.config.max_endpoints);
                self.enter_state(now, AttachState::Connecting);
            }
        }
    }

    fn on_channel_event(&mut self, now: Instant, event: ChannelEvent) {
        if self.lifecycle == Lifecycle::Closed {
            match event {
                ChannelEvent::HandshakeComplete => self.channel.close(),
                ChannelEvent::Closed | ChannelEvent::AccessDenied => {
                    self.enter_state(now, AttachState::Closed);
                }
            }
            return;
        }
        match event {
            ChannelEvent::HandshakeComplete => {
                if self.state != AttachState::Connecting {
                    debug!("handshake completion outside connecting ignored");
                    return;
                }
                if self.channel.alpn_protocol().is_none() {
                    error!("basestation did not negotiate the application protocol");
                    self.channel.close();
                    return;
                }
                self.send_attach_start();
            }
            ChannelEvent::Closed => {
                self.keep_alive.reset();
                self.timers.stop(Timer::KeepAlive);
                self.on_channel_closed(now);
            }
            ChannelEvent::AccessDenied => {
                self.keep_alive.reset();
                self.timers.stop(Timer::KeepAlive);
                self.on_access_denied(now);
            }
        }
    }

    fn on_channel_closed(&mut self, now: Instant) {
        self.transport.discard_pending();
        if self.channel.reset().is_err() {
            error!("tried to reset a channel that was not closed");
        }
        match self.state {
            AttachState::Connecting => {
                self.enter_state(now, AttachState::RetryWait);
            }
            AttachState::Attached => {
                debug!("attachment lost");
                self.emit(SessionEvent::Detached);
                self.enter_state(now, AttachState::RetryWait);
            }
            AttachState::Redirect => {
                if self.redirect_attempts >= self.config.max_redirects {
                    warn!(
                        attempts = self.redirect_attempts,
                        "too many redirects, backing off"
                    );
                    self.enter_state(now, AttachState::RetryWait);
                } else {
                    self.enter_state(now, AttachState::Dns);
                }
            }
            // The long timer is already running.
            AttachState::AccessDeniedWait => {}
            state => {
                error!(state = ?state, "channel closed in an unexpected state");
                self.enter_state(now, AttachState::RetryWait);
            }
        }
    }

    fn on_access_denied(&mut self, now: Instant) {
        if self.state == AttachState::AccessDeniedWait {
            debug!("access denied while already backing off");
            return;
        }
        debug!("basestation denied access");
        self.transport.discard_pending();
        if self.channel.reset().is_err() {
            error!("tried to reset a channel that was not closed");
        }
        if self.state == AttachState::Attached {
            self.emit(SessionEvent::Detached);
        }
        self.enter_state(now, AttachState::AccessDeniedWait);
    }

    fn send_attach_start(&mut self) {
        let request = match packet::attach_start_request(&self.identity) {
            Ok(request) => request,
            Err(e) => {
                warn!("attach request does not fit a packet: {e}");
                self.attach_failed();
                return;
            }
        };
        if let Err(e) = self.transport.attach_start(request) {
            debug!("failed to send attach request: {e}");
            self.attach_failed();
        }
    }

    fn on_start_response(&mut self, now: Instant, result: Result<Bytes, RequestError>) {
        if self.lifecycle == Lifecycle::Closed || self.state != AttachState::Connecting {
            return;
        }
        let response = match result {
            Ok(bytes) => match AttachResponse::decode(bytes) {
                Ok(response) => response,
                Err(e) => {
                    warn!("invalid attach response: {e}");
                    self.attach_failed();
                    return;
                }
            },
            Err(e) => {
                debug!("attach request failed: {e}");
                self.attach_failed();
                return;
            }
        };
        match response.status {
            AttachStatus::Attached => match self.begin_token_upload() {
                UploadStart::Started => {}
                UploadStart::NothingToDo => self.send_attach_end(),
                UploadStart::Failed => self.attach_failed(),
            },
            AttachStatus::Redirect => {
                let Some(redirect) = response.redirect else {
                    warn!("redirect without a target");
                    self.attach_failed();
                    return;
                };
                debug!(host = %redirect.host, port = redirect.port, "redirected");
                self.current_host = redirect.host;
                self.current_port = redirect.port;
                self.redirect_attempts += 1;
                self.enter_state(now, AttachState::Redirect);
                self.channel.close();
            }
            AttachStatus::Other(code) => {
                debug!(code, "attach rejected");
                self.attach_failed();
            }
        }
    }

    fn begin_token_upload(&mut self) -> UploadStart {
        if self.tokens.synchronized_version == self.tokens.version {
            return UploadStart::NothingToDo;
        }
        if self.tokens.upload_in_flight {
            // The in-flight round trip observes the version gap when it
            // completes and starts another.
            return UploadStart::Started;
        }
        let request =
            match packet::token_upload_request(self.tokens.tokens.iter().map(|t| t.as_str())) {
                Ok(request) => request,
                Err(e) => {
                    warn!("token set does not fit a packet: {e}");
                    return UploadStart::Failed;
                }
            };
        self.tokens.uploading_version = self.tokens.version;
        match self.transport.upload_tokens(request) {
            Ok(()) => {
                self.tokens.upload_in_flight = true;
                UploadStart::Started
            }
            Err(e) => {
                debug!("failed to send token upload: {e}");
                UploadStart::Failed
            }
        }
    }

    fn on_token_upload_response(&mut self, result: Result<(), RequestError>) {
        self.tokens.upload_in_flight = false;
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        match self.state {
            AttachState::Connecting => match result {
                Ok(()) => {
                    self.tokens.synchronized_version = self.tokens.uploading_version;
                    self.send_attach_end();
                }
                Err(e) => {
                    debug!("token upload failed: {e}");
                    self.attach_failed();
                }
            },
            AttachState::Attached => match result {
                Ok(()) => {
                    self.tokens.synchronized_version = self.tokens.uploading_version;
                    if self.tokens.synchronized_version != self.tokens.version {
                        if let UploadStart::Failed = self.begin_token_upload() {
                            debug!("follow-up token upload could not be started");
                        }
                    }
                }
                Err(e) => {
                    debug!("token upload failed: {e}");
                }
            },
            _ => {
                debug!("token upload completed outside an attachment");
            }
        }
    }

    fn send_attach_end(&mut self) {
        if let Err(e) = self.transport.attach_end(packet::attach_end_request()) {
            debug!("failed to send attach confirmation: {e}");
            self.attach_failed();
        }
    }

    fn on_end_response(&mut self, now: Instant, result: Result<(), RequestError>) {
        if self.lifecycle == Lifecycle::Closed || self.state != AttachState::Connecting {
            return;
        }
        if let Err(e) = result {
            debug!("attach confirmation failed: {e}");
            self.attach_failed();
            return;
        }
        self.enter_state(now, AttachState::Attached);
        self.emit(SessionEvent::Attached);
        // Tokens added mid-handshake are pushed now.
        if let UploadStart::Failed = self.begin_token_upload() {
            debug!("token upload could not be started; will retry on next change");
        }
    }

    /// Funnel an attach sub-protocol failure into the close path; the
    /// resulting closed event drives the retry wait.
    fn attach_failed(&mut self) {
        self.channel.close();
    }

    fn reattach(&mut self, now: Instant) {
        if self.lifecycle == Lifecycle::Closed {
            self.enter_state(now, AttachState::Closed);
            return;
        }
        self.current_host = self.configured_host.clone();
        self.current_port = self.default_port;
        self.redirect_attempts = 0;
        self.enter_state(now, AttachState::Dns);
    }

    fn keep_alive_wake(&mut self, now: Instant) {
        if self.state != AttachState::Attached {
            return;
        }
        match self.keep_alive.classify(self.channel.packet_counts()) {
            KeepAliveAction::Nothing => {
                self.timers
                    .set(Timer::KeepAlive, now + self.keep_alive.next_wait());
            }
            KeepAliveAction::SendProbe => {
                let probe = self.keep_alive.probe_request();
                if let Err(e) = self.channel.send_data(&probe) {
                    debug!("failed to send keep-alive probe: {e}");
                }
                self.timers
                    .set(Timer::KeepAlive, now + self.keep_alive.next_wait());
            }
            KeepAliveAction::Timeout => {
                debug!("keep-alive timed out");
                self.channel.close();
            }
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        if let Some(listener) = self.event_listener.as_mut() {
            listener(event);
        }
    }
}
