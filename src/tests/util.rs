use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::IpAddr;
use std::rc::Rc;
use std::str;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::packet::{ApplicationType, ExtensionType, PacketBuilder};
use crate::*;

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace")),
        )
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

pub(super) const PORT: u16 = 4441;

pub(super) fn addr(last: u8) -> IpAddr {
    IpAddr::from([192, 0, 2, last])
}

/// Everything the mock collaborators observed or were told to do
#[derive(Default)]
pub(super) struct CallLog {
    pub(super) resolve_requests: Vec<String>,
    pub(super) sni: Option<String>,
    pub(super) connect_count: usize,
    pub(super) close_count: usize,
    pub(super) reset_count: usize,
    pub(super) alpn: Option<Vec<u8>>,
    pub(super) packet_counts: PacketCounts,
    pub(super) accept_datagrams: bool,
    pub(super) sent_frames: Vec<Vec<u8>>,
    pub(super) channel_out: VecDeque<Vec<u8>>,
    pub(super) start_requests: Vec<Bytes>,
    pub(super) upload_requests: Vec<Bytes>,
    pub(super) end_requests: Vec<Bytes>,
    pub(super) delivered_frames: Vec<Vec<u8>>,
    pub(super) discard_count: usize,
    pub(super) fail_attach_start: bool,
}

pub(super) struct MockChannel {
    calls: Rc<RefCell<CallLog>>,
}

impl SecureChannel for MockChannel {
    fn set_sni(&mut self, hostname: &str) {
        self.calls.borrow_mut().sni = Some(hostname.to_owned());
    }
    fn set_keys(&mut self, _public_key: &[u8], _private_key: &[u8]) -> Result<(), ChannelError> {
        Ok(())
    }
    fn set_handshake_timeout(&mut self, _min: Duration, _max: Duration) {}
    fn connect(&mut self) {
        self.calls.borrow_mut().connect_count += 1;
    }
    fn close(&mut self) {
        self.calls.borrow_mut().close_count += 1;
    }
    fn reset(&mut self) -> Result<(), ChannelError> {
        self.calls.borrow_mut().reset_count += 1;
        Ok(())
    }
    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.calls.borrow().alpn.clone()
    }
    fn packet_counts(&self) -> PacketCounts {
        self.calls.borrow().packet_counts
    }
    fn send_data(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.calls.borrow_mut().sent_frames.push(data.to_vec());
        Ok(())
    }
    fn handle_packet(&mut self, _datagram: &[u8]) -> Result<(), ChannelError> {
        if self.calls.borrow().accept_datagrams {
            Ok(())
        } else {
            Err(ChannelError::Rejected)
        }
    }
    fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.calls.borrow_mut().channel_out.pop_front()
    }
}

pub(super) struct MockResolver {
    calls: Rc<RefCell<CallLog>>,
}

impl DnsResolver for MockResolver {
    fn start_resolve(&mut self, hostname: &str) {
        self.calls
            .borrow_mut()
            .resolve_requests
            .push(hostname.to_owned());
    }
}

pub(super) struct MockTransport {
    calls: Rc<RefCell<CallLog>>,
}

impl AttachTransport for MockTransport {
    fn attach_start(&mut self, request: Bytes) -> Result<(), RequestError> {
        let mut calls = self.calls.borrow_mut();
        if calls.fail_attach_start {
            return Err(RequestError::SendFailed);
        }
        calls.start_requests.push(request);
        Ok(())
    }
    fn upload_tokens(&mut self, request: Bytes) -> Result<(), RequestError> {
        self.calls.borrow_mut().upload_requests.push(request);
        Ok(())
    }
    fn attach_end(&mut self, request: Bytes) -> Result<(), RequestError> {
        self.calls.borrow_mut().end_requests.push(request);
        Ok(())
    }
    fn handle_frame(&mut self, frame: &[u8]) {
        self.calls.borrow_mut().delivered_frames.push(frame.to_vec());
    }
    fn discard_pending(&mut self) {
        self.calls.borrow_mut().discard_count += 1;
    }
}

/// A session wired to recording mocks, plus a manually advanced clock
pub(super) struct TestHarness {
    pub(super) session: AttachSession<MockChannel, MockResolver, MockTransport>,
    pub(super) calls: Rc<RefCell<CallLog>>,
    pub(super) states: Rc<RefCell<Vec<AttachState>>>,
    pub(super) events: Rc<RefCell<Vec<SessionEvent>>>,
    pub(super) now: Instant,
}

impl TestHarness {
    pub(super) fn new() -> Self {
        Self::with_config(AttachConfig::default())
    }

    pub(super) fn with_config(config: AttachConfig) -> Self {
        let calls = Rc::new(RefCell::new(CallLog {
            alpn: Some(b"n5".to_vec()),
            accept_datagrams: true,
            ..CallLog::default()
        }));
        let mut session = AttachSession::new(
            config,
            MockChannel {
                calls: calls.clone(),
            },
            MockResolver {
                calls: calls.clone(),
            },
            MockTransport {
                calls: calls.clone(),
            },
        );
        let states = Rc::new(RefCell::new(Vec::new()));
        let recorded = states.clone();
        session.set_state_listener(move |state| recorded.borrow_mut().push(state));
        let events = Rc::new(RefCell::new(Vec::new()));
        let recorded = events.clone();
        session.set_event_listener(move |event| recorded.borrow_mut().push(event));
        Self {
            session,
            calls,
            states,
            events,
            now: Instant::now(),
        }
    }

    pub(super) fn start(&mut self, hostname: &str) {
        self.session.start(self.now, hostname, PORT).unwrap();
    }

    pub(super) fn resolve_ok(&mut self, addrs: &[IpAddr]) {
        self.session
            .handle_event(self.now, Event::ResolveResult(Ok(addrs.to_vec())));
    }

    pub(super) fn channel_event(&mut self, event: ChannelEvent) {
        self.session.handle_event(self.now, Event::Channel(event));
    }

    pub(super) fn start_response(&mut self, response: Bytes) {
        self.session
            .handle_event(self.now, Event::StartResponse(Ok(response)));
    }

    pub(super) fn upload_ok(&mut self) {
        self.session
            .handle_event(self.now, Event::TokenUploadResponse(Ok(())));
    }

    pub(super) fn end_ok(&mut self) {
        self.session.handle_event(self.now, Event::EndResponse(Ok(())));
    }

    /// Finish an attach from the point where the channel handshake starts
    pub(super) fn complete_attach(&mut self) {
        self.channel_event(ChannelEvent::HandshakeComplete);
        self.start_response(attached_response());
        self.end_ok();
    }

    /// Drive a freshly constructed session all the way to `Attached`
    pub(super) fn attach(&mut self, hostname: &str) {
        self.start(hostname);
        self.resolve_ok(&[addr(1)]);
        self.complete_attach();
    }

    /// Advance the clock and fire whatever expired
    pub(super) fn step_time(&mut self, duration: Duration) {
        self.now += duration;
        self.session.handle_timeout(self.now);
    }

    /// Drain every pending transmit
    pub(super) fn transmits(&mut self) -> Vec<Transmit> {
        let mut out = Vec::new();
        while let Some(transmit) = self.session.poll_transmit() {
            out.push(transmit);
        }
        out
    }
}

pub(super) fn attached_response() -> Bytes {
    let mut builder = PacketBuilder::new(ApplicationType::AttachStart);
    builder.payload(&[0]).unwrap();
    builder.finish()
}

pub(super) fn redirect_response(host: &str, port: u16) -> Bytes {
    let mut builder = PacketBuilder::new(ApplicationType::AttachStart);
    builder.payload(&[1]).unwrap();
    builder
        .extension(ExtensionType::RedirectHost, host.as_bytes())
        .unwrap();
    builder
        .extension(ExtensionType::RedirectPort, &port.to_be_bytes())
        .unwrap();
    builder.finish()
}
