use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use parking_lot::{Mutex, ReentrantMutex};
use tokio_util::codec::Decoder;

use mqlink_codec::{encode_variable_length, encoded_variable_length_size, FrameCodec};

use crate::error::TransportError;
use crate::settings::{ConnectionSettings, TransportProtocol};
use crate::sink::{dispatch, Event, EventSink};
use crate::transport::{resolve, TcpTransport, Transport};
#[cfg(any(feature = "tls", feature = "ws"))]
use crate::transport::HandshakeStatus;

/// Externally visible connection lifecycle state.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    TlsHandshaking = 2,
    Connected = 3,
    Disconnecting = 4,
}

impl ConnectionState {
    #[inline]
    fn from_tag(tag: u8) -> ConnectionState {
        match tag {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::TlsHandshaking,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

enum AttemptPhase {
    /// TCP connect in flight
    Opening(TcpTransport),
    /// Socket up, websocket upgrade in flight
    #[cfg(feature = "ws")]
    WsHandshake(crate::ws::WsTransport),
}

struct ConnectAttempt {
    deadline: Instant,
    phase: AttemptPhase,
}

impl ConnectAttempt {
    fn into_transport(self) -> Option<Transport> {
        match self.phase {
            AttemptPhase::Opening(tcp) => Some(Transport::Tcp(tcp)),
            #[cfg(feature = "ws")]
            AttemptPhase::WsHandshake(ws) => Some(Transport::Ws(ws)),
        }
    }
}

#[cfg(feature = "tls")]
struct TlsAttempt {
    tls: crate::tls::TlsTransport,
    /// Same deadline as the connect phase; the handshake does not get
    /// extra time.
    deadline: Instant,
}

struct Session {
    transport: Transport,
    /// Unparsed inbound bytes, shared between polls
    acc: BytesMut,
    codec: FrameCodec,
    scratch: Vec<u8>,
}

struct Teardown {
    transport: Option<Transport>,
}

enum State {
    Disconnected,
    Connecting(ConnectAttempt),
    #[cfg(feature = "tls")]
    TlsHandshaking(TlsAttempt),
    Connected(Session),
    Disconnecting(Teardown),
}

fn tag_of(state: &State) -> ConnectionState {
    match state {
        State::Disconnected => ConnectionState::Disconnected,
        State::Connecting(_) => ConnectionState::Connecting,
        #[cfg(feature = "tls")]
        State::TlsHandshaking(_) => ConnectionState::TlsHandshaking,
        State::Connected(_) => ConnectionState::Connected,
        State::Disconnecting(_) => ConnectionState::Disconnecting,
    }
}

fn take_transport(state: &mut State) -> Option<Transport> {
    match std::mem::replace(state, State::Disconnected) {
        State::Disconnected => None,
        State::Connecting(attempt) => attempt.into_transport(),
        #[cfg(feature = "tls")]
        State::TlsHandshaking(attempt) => Some(Transport::Tls(attempt.tls)),
        State::Connected(session) => Some(session.transport),
        State::Disconnecting(teardown) => teardown.transport,
    }
}

/// One MQTT client connection, advanced exclusively by [`poll`] calls.
///
/// Thread-safe: every entry point serializes on an internal lock, and sink
/// notifications are delivered outside that lock (in transition order) so a
/// callback may call back into the connection.
///
/// [`poll`]: Connection::poll
pub struct Connection {
    settings: Arc<ConnectionSettings>,
    sink: Arc<dyn EventSink>,
    tag: AtomicU8,
    state: Mutex<State>,
    dispatch_lock: ReentrantMutex<()>,
}

impl Connection {
    pub fn new(settings: ConnectionSettings, sink: Arc<dyn EventSink>) -> Connection {
        Connection {
            settings: Arc::new(settings),
            sink,
            tag: AtomicU8::new(ConnectionState::Disconnected as u8),
            state: Mutex::new(State::Disconnected),
            dispatch_lock: ReentrantMutex::new(()),
        }
    }

    #[inline]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Lifecycle state as of the last completed transition.
    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_tag(self.tag.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Starts a connect attempt. A no-op while an attempt is already in
    /// flight or the connection is established; a connect issued while a
    /// teardown is pending finishes the teardown and starts over.
    ///
    /// The attempt itself completes asynchronously: the outcome arrives via
    /// [`EventSink::on_connect`] as later polls drive it forward. An error
    /// here means the attempt could not even be started.
    pub fn connect(&self) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Connecting
            | ConnectionState::TlsHandshaking
            | ConnectionState::Connected => {
                log::warn!("Connect ignored, connection to {} already active", self.settings.host);
                return Ok(());
            }
            _ => {}
        }
        self.with_state(|state, events| match state {
            State::Disconnected => match self.start_attempt() {
                Ok(next) => {
                    *state = next;
                    Ok(())
                }
                Err(e) => {
                    events.push(Event::Connect(false));
                    Err(e)
                }
            },
            State::Disconnecting(teardown) => {
                if let Some(mut transport) = teardown.transport.take() {
                    transport.close();
                }
                events.push(Event::Disconnect);
                match self.start_attempt() {
                    Ok(next) => {
                        *state = next;
                        Ok(())
                    }
                    Err(e) => {
                        *state = State::Disconnected;
                        events.push(Event::Connect(false));
                        Err(e)
                    }
                }
            }
            _ => Ok(()),
        })
    }

    /// Requests a teardown. The transport is closed and
    /// [`EventSink::on_disconnect`] fired on the next poll. Idempotent.
    pub fn disconnect(&self) {
        self.with_state(|state, _events| match state {
            State::Disconnected | State::Disconnecting(_) => {}
            _ => {
                let transport = take_transport(state);
                *state = State::Disconnecting(Teardown { transport });
            }
        });
    }

    /// Writes one already framed control packet. The whole packet is
    /// flushed within the call; a failure tears the session down.
    pub fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        self.with_state(|state, _events| match state {
            State::Connected(session) => match session.transport.send_all(packet) {
                Ok(()) => Ok(()),
                Err(e) => {
                    log::warn!("Send to {} failed, {e:?}", self.settings.host);
                    let transport = take_transport(state);
                    *state = State::Disconnecting(Teardown { transport });
                    Err(e)
                }
            },
            _ => {
                log::warn!("Send ignored, not connected to {}", self.settings.host);
                Err(TransportError::NotConnected)
            }
        })
    }

    /// Frames and writes one control packet: `first_byte`, the encoded
    /// remaining length, then the payload.
    pub fn send_packet(&self, first_byte: u8, payload: &[u8]) -> Result<(), TransportError> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "packet too large",
            ))
        })?;
        let mut buf = BytesMut::with_capacity(1 + encoded_variable_length_size(len) + payload.len());
        buf.put_u8(first_byte);
        encode_variable_length(len, &mut buf).map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        buf.extend_from_slice(payload);
        self.send(&buf)
    }

    /// Advances the connection by one step: connect completion, handshake
    /// progress, inbound data, or teardown. Never blocks; call regularly.
    pub fn poll(&self) {
        self.with_state(|state, events| self.tick(state, events));
    }

    /// Runs `f` under the state lock, then delivers the events it queued
    /// with the state lock released. The reentrant dispatch lock is held for
    /// the whole call and is always taken first, so every thread acquires
    /// the two locks in the same order: notifications stay in transition
    /// order, and a sink callback re-entering the connection only re-locks
    /// what its own thread already holds.
    fn with_state<R>(&self, f: impl FnOnce(&mut State, &mut Vec<Event>) -> R) -> R {
        let _dispatch = self.dispatch_lock.lock();
        let mut events = Vec::new();
        let mut guard = self.state.lock();
        let out = f(&mut guard, &mut events);
        self.tag.store(tag_of(&guard) as u8, Ordering::Release);
        drop(guard);
        if !events.is_empty() {
            dispatch(self.sink.as_ref(), events);
        }
        out
    }

    fn start_attempt(&self) -> Result<State, TransportError> {
        let addr = resolve(&self.settings.host, self.settings.port)?;
        let tcp = TcpTransport::open(addr, &self.settings).map_err(TransportError::Io)?;
        log::debug!("Connecting to {} ({addr})", self.settings.host);
        Ok(State::Connecting(ConnectAttempt {
            deadline: Instant::now() + self.settings.connect_timeout,
            phase: AttemptPhase::Opening(tcp),
        }))
    }

    fn tick(&self, state: &mut State, events: &mut Vec<Event>) {
        match state {
            State::Disconnected => {}
            State::Connecting(attempt) => {
                if Instant::now() >= attempt.deadline {
                    return self.fail_attempt(state, events, TransportError::ConnectTimeout);
                }
                let failed = match &mut attempt.phase {
                    AttemptPhase::Opening(tcp) => match tcp.poll_connected() {
                        Ok(false) => return,
                        Ok(true) => None,
                        Err(e) => Some(TransportError::Io(e)),
                    },
                    #[cfg(feature = "ws")]
                    AttemptPhase::WsHandshake(ws) => match ws.poll_handshake() {
                        HandshakeStatus::InProgress => return,
                        HandshakeStatus::Complete => None,
                        HandshakeStatus::Failed(e) => Some(e),
                    },
                };
                match failed {
                    Some(e) => self.fail_attempt(state, events, e),
                    None => self.advance_attempt(state, events),
                }
            }
            #[cfg(feature = "tls")]
            State::TlsHandshaking(attempt) => {
                if Instant::now() >= attempt.deadline {
                    return self.fail_attempt(state, events, TransportError::ConnectTimeout);
                }
                match attempt.tls.drive_handshake() {
                    HandshakeStatus::InProgress => {}
                    HandshakeStatus::Complete => {
                        if let State::TlsHandshaking(attempt) =
                            std::mem::replace(state, State::Disconnected)
                        {
                            self.enter_connected(state, events, Transport::Tls(attempt.tls));
                        }
                    }
                    HandshakeStatus::Failed(e) => self.fail_attempt(state, events, e),
                }
            }
            State::Connected(session) => {
                if !session.transport.is_connected() {
                    return self.drop_session(state, &TransportError::PeerClosed);
                }
                match session.transport.read_pending(&mut session.acc, &mut session.scratch) {
                    Ok(0) => {}
                    Ok(_) => {
                        if self.settings.max_buffer_size > 0
                            && session.acc.len() > self.settings.max_buffer_size
                        {
                            return self.drop_session(state, &TransportError::ReceiveBufferFull);
                        }
                        loop {
                            match session.codec.decode(&mut session.acc) {
                                Ok(Some(frame)) => events.push(Event::Packet(frame)),
                                Ok(None) => break,
                                Err(e) => {
                                    return self.drop_session(state, &TransportError::Decode(e))
                                }
                            }
                        }
                    }
                    Err(e) => self.drop_session(state, &e),
                }
            }
            State::Disconnecting(teardown) => {
                if let Some(mut transport) = teardown.transport.take() {
                    transport.close();
                }
                *state = State::Disconnected;
                events.push(Event::Disconnect);
                log::debug!("Disconnected from {}", self.settings.host);
            }
        }
    }

    /// The current connect phase finished; hand the socket to the next
    /// layer or enter the connected state.
    fn advance_attempt(&self, state: &mut State, events: &mut Vec<Event>) {
        let State::Connecting(attempt) = std::mem::replace(state, State::Disconnected) else {
            return;
        };
        let deadline = attempt.deadline;
        match attempt.phase {
            AttemptPhase::Opening(tcp) => match self.settings.protocol {
                TransportProtocol::Tcp => self.enter_connected(state, events, Transport::Tcp(tcp)),
                #[cfg(feature = "tls")]
                TransportProtocol::Tls => {
                    match crate::tls::TlsTransport::new(tcp, &self.settings) {
                        Ok(tls) => {
                            log::debug!("Starting tls handshake with {}", self.settings.host);
                            *state = State::TlsHandshaking(TlsAttempt { tls, deadline });
                        }
                        Err(e) => self.fail_attempt(state, events, e),
                    }
                }
                #[cfg(feature = "ws")]
                TransportProtocol::Ws | TransportProtocol::Wss => {
                    match crate::ws::WsTransport::new(tcp, &self.settings) {
                        Ok(ws) => {
                            *state = State::Connecting(ConnectAttempt {
                                deadline,
                                phase: AttemptPhase::WsHandshake(ws),
                            })
                        }
                        Err(e) => self.fail_attempt(state, events, e),
                    }
                }
                #[allow(unreachable_patterns)]
                _ => self.fail_attempt(
                    state,
                    events,
                    TransportError::Handshake("transport disabled at build time".into()),
                ),
            },
            #[cfg(feature = "ws")]
            AttemptPhase::WsHandshake(ws) => {
                self.enter_connected(state, events, Transport::Ws(ws))
            }
        }
    }

    fn enter_connected(&self, state: &mut State, events: &mut Vec<Event>, transport: Transport) {
        log::info!(
            "Connected to {}:{}, client_id: {:?}",
            self.settings.host,
            self.settings.port,
            self.settings.client_id
        );
        *state = State::Connected(Session {
            transport,
            acc: BytesMut::with_capacity(self.settings.read_chunk_size),
            codec: FrameCodec::new(self.settings.max_packet_size),
            scratch: vec![0u8; self.settings.read_chunk_size],
        });
        events.push(Event::Connect(true));
    }

    fn fail_attempt(&self, state: &mut State, events: &mut Vec<Event>, e: TransportError) {
        log::warn!("Connect attempt to {} failed, {e:?}", self.settings.host);
        events.push(Event::Connect(false));
        let transport = take_transport(state);
        *state = State::Disconnecting(Teardown { transport });
    }

    fn drop_session(&self, state: &mut State, e: &TransportError) {
        log::warn!("Connection to {} lost, {e:?}", self.settings.host);
        let transport = take_transport(state);
        *state = State::Disconnecting(Teardown { transport });
    }
}
