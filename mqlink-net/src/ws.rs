use std::io::{self, Read, Write};
use std::net::TcpStream;

use bytes::BytesMut;
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::ClientHandshake;
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tungstenite::http::HeaderValue;
use tungstenite::{Message, WebSocket};

use crate::error::TransportError;
use crate::settings::ConnectionSettings;
use crate::transport::{map_read_err, HandshakeStatus, TcpTransport};

/// Stream under the websocket framing: the plain socket, or the TLS engine
/// wrapped around it for `wss`. Both stay non-blocking, so reads and writes
/// surface `WouldBlock` and the websocket handshake yields `Interrupted`.
pub(crate) enum WsInner {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl WsInner {
    fn socket(&self) -> &TcpStream {
        match self {
            WsInner::Plain(s) => s,
            #[cfg(feature = "tls")]
            WsInner::Tls(s) => &s.sock,
        }
    }
}

impl Read for WsInner {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WsInner::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            WsInner::Tls(s) => s.read(buf),
        }
    }
}

impl Write for WsInner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WsInner::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            WsInner::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WsInner::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            WsInner::Tls(s) => s.flush(),
        }
    }
}

enum WsState {
    Handshaking(Box<MidHandshake<ClientHandshake<WsInner>>>),
    Active(Box<WebSocket<WsInner>>),
    Closed,
}

/// MQTT over websocket. Each control packet travels as one binary message;
/// inbound messages are appended to the caller's receive buffer so the
/// framer sees the same contiguous byte stream as over raw TCP.
pub(crate) struct WsTransport {
    state: WsState,
}

impl WsTransport {
    /// Takes an already connected socket and starts the websocket (and, for
    /// `wss`, TLS) handshake. Progress continues in [`poll_handshake`].
    ///
    /// [`poll_handshake`]: WsTransport::poll_handshake
    pub(crate) fn new(tcp: TcpTransport, settings: &ConnectionSettings) -> Result<WsTransport, TransportError> {
        let stream = tcp.into_stream();
        let inner = Self::wrap_stream(stream, settings)?;

        let scheme = if settings.protocol.is_tls() { "wss" } else { "ws" };
        let url = format!("{}://{}:{}{}", scheme, settings.host, settings.port, settings.ws_path);
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Ws(e.to_string()))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("mqtt"));

        let state = match tungstenite::client(request, inner) {
            Ok((ws, _response)) => WsState::Active(Box::new(ws)),
            Err(HandshakeError::Interrupted(mid)) => WsState::Handshaking(Box::new(mid)),
            Err(HandshakeError::Failure(e)) => return Err(map_ws_err(e)),
        };
        Ok(WsTransport { state })
    }

    #[cfg(feature = "tls")]
    fn wrap_stream(stream: TcpStream, settings: &ConnectionSettings) -> Result<WsInner, TransportError> {
        if !settings.protocol.is_tls() {
            return Ok(WsInner::Plain(stream));
        }
        let config = crate::tls::client_config(settings)?;
        let name = rustls::pki_types::ServerName::try_from(settings.host.clone())
            .map_err(|e| TransportError::Handshake(format!("invalid server name, {e:?}")))?;
        let conn = rustls::ClientConnection::new(std::sync::Arc::new(config), name)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(WsInner::Tls(Box::new(rustls::StreamOwned::new(conn, stream))))
    }

    #[cfg(not(feature = "tls"))]
    fn wrap_stream(stream: TcpStream, _settings: &ConnectionSettings) -> Result<WsInner, TransportError> {
        Ok(WsInner::Plain(stream))
    }

    /// Advances the handshake as far as the socket currently allows.
    pub(crate) fn poll_handshake(&mut self) -> HandshakeStatus {
        match std::mem::replace(&mut self.state, WsState::Closed) {
            WsState::Handshaking(mid) => match mid.handshake() {
                Ok((ws, _response)) => {
                    self.state = WsState::Active(Box::new(ws));
                    HandshakeStatus::Complete
                }
                Err(HandshakeError::Interrupted(mid)) => {
                    self.state = WsState::Handshaking(Box::new(mid));
                    HandshakeStatus::InProgress
                }
                Err(HandshakeError::Failure(e)) => HandshakeStatus::Failed(map_ws_err(e)),
            },
            WsState::Active(ws) => {
                self.state = WsState::Active(ws);
                HandshakeStatus::Complete
            }
            WsState::Closed => HandshakeStatus::Failed(TransportError::NotConnected),
        }
    }

    pub(crate) fn send_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let WsState::Active(ws) = &mut self.state else {
            return Err(TransportError::NotConnected);
        };
        // the message is queued even when the socket is busy; only the flush
        // needs retrying
        match ws.write(Message::binary(buf.to_vec())) {
            Ok(()) => {}
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(map_ws_err(e)),
        }
        loop {
            match ws.flush() {
                Ok(()) => return Ok(()),
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::yield_now()
                }
                Err(e) => return Err(map_ws_err(e)),
            }
        }
    }

    /// Appends the payload of every queued binary message to `acc`.
    /// Control frames are handled by the websocket layer and skipped here.
    pub(crate) fn read_pending(&mut self, acc: &mut BytesMut) -> Result<usize, TransportError> {
        let WsState::Active(ws) = &mut self.state else {
            return Err(TransportError::NotConnected);
        };
        let mut appended = 0;
        loop {
            match ws.read() {
                Ok(Message::Binary(data)) => {
                    acc.extend_from_slice(&data);
                    appended += data.len();
                }
                Ok(Message::Close(_)) => {
                    if appended == 0 {
                        return Err(TransportError::PeerClosed);
                    }
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let e = map_ws_err(e);
                    if appended == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(appended)
    }

    pub(crate) fn is_connected(&self) -> bool {
        let WsState::Active(ws) = &self.state else {
            return false;
        };
        let mut probe = [0u8; 1];
        match ws.get_ref().socket().peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    pub(crate) fn close(&mut self) {
        if let WsState::Active(ws) = &mut self.state {
            let _ = ws.close(None);
            let _ = ws.flush();
            let _ = ws.get_ref().socket().shutdown(std::net::Shutdown::Both);
        }
        // dropping a mid-handshake stream closes the socket
        self.state = WsState::Closed;
    }
}

fn map_ws_err(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Io(e) => map_read_err(e),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::PeerClosed
        }
        e => TransportError::Ws(e.to_string()),
    }
}
