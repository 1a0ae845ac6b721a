use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use bytes::BytesMut;
use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::TransportError;
use crate::settings::ConnectionSettings;

/// Non-blocking byte pipe as seen by the send loop and the TLS engine bridge.
///
/// `try_read` returning `Ok(0)` means "nothing available right now"; an
/// orderly close by the peer is an error, never a zero read. `try_write` may
/// accept a prefix of `buf` and reports would-block via `io::ErrorKind`.
pub(crate) trait TransportIo {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Resolves `host:port` and picks the first usable address.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let mut addrs = (host, port).to_socket_addrs().map_err(|e| {
        log::error!("Failed to resolve {host}:{port}, {e:?}");
        TransportError::Resolve(host.into())
    })?;
    addrs.next().ok_or_else(|| {
        log::error!("No addresses resolved for {host}:{port}");
        TransportError::Resolve(host.into())
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const EINPROGRESS: i32 = 115;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const EINPROGRESS: i32 = 36;

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

/// Plain non-blocking TCP transport.
pub(crate) struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Creates the socket, applies the socket options and starts a
    /// non-blocking connect. Completion is observed via [`poll_connected`].
    ///
    /// [`poll_connected`]: TcpTransport::poll_connected
    pub(crate) fn open(addr: SocketAddr, settings: &ConnectionSettings) -> io::Result<TcpTransport> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        socket.set_linger(None)?;
        socket.set_recv_buffer_size(settings.socket_buffer_size)?;
        socket.set_send_buffer_size(settings.socket_buffer_size)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            // a non-blocking connect reports EINPROGRESS and resolves later
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(e),
        }

        Ok(TcpTransport { stream: socket.into() })
    }

    /// Checks whether the in-flight connect has resolved.
    ///
    /// `Ok(false)` means still in progress; a refused or unreachable target
    /// surfaces as the error the OS queued on the socket.
    pub(crate) fn poll_connected(&self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Liveness check: OS connection state plus a non-consuming peek, which
    /// detects a half-closed peer without eating data.
    pub(crate) fn is_connected(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Idempotent close, safe on an already dead socket.
    pub(crate) fn close(&self) {
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            log::debug!("Socket shutdown, {e:?}");
        }
    }

    #[cfg(feature = "ws")]
    pub(crate) fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl TransportIo for TcpTransport {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // With a non-blocking socket the primitive distinguishes the cases:
        // would-block is "no data yet", a successful zero read is the peer's
        // orderly shutdown.
        match (&self.stream).read(buf) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "peer closed")),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Writes the whole buffer through a non-blocking pipe.
///
/// MQTT frames must not be split across reconnects, so a partial write is
/// retried within the call until everything is flushed or the write fails.
pub(crate) fn send_all<T: TransportIo>(io: &mut T, mut buf: &[u8]) -> Result<(), TransportError> {
    while !buf.is_empty() {
        match io.try_write(buf) {
            Ok(0) => return Err(TransportError::Io(io::ErrorKind::WriteZero.into())),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Outcome of one attempt to advance a TLS or websocket handshake.
#[cfg(any(feature = "tls", feature = "ws"))]
pub(crate) enum HandshakeStatus {
    InProgress,
    Complete,
    Failed(TransportError),
}

/// Live transport variants, dispatched by the connection state machine.
pub(crate) enum Transport {
    Tcp(TcpTransport),
    #[cfg(feature = "tls")]
    Tls(crate::tls::TlsTransport),
    #[cfg(feature = "ws")]
    Ws(crate::ws::WsTransport),
}

impl Transport {
    pub(crate) fn send_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        match self {
            Transport::Tcp(t) => send_all(t, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.send_all(buf),
            #[cfg(feature = "ws")]
            Transport::Ws(t) => t.send_all(buf),
        }
    }

    /// Appends whatever is currently available to `acc`, reading at most one
    /// `scratch`-sized chunk from the socket. Returns the bytes appended.
    pub(crate) fn read_pending(
        &mut self,
        acc: &mut BytesMut,
        scratch: &mut [u8],
    ) -> Result<usize, TransportError> {
        match self {
            Transport::Tcp(t) => {
                let n = t.try_read(scratch).map_err(map_read_err)?;
                acc.extend_from_slice(&scratch[..n]);
                Ok(n)
            }
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.read_pending(acc, scratch),
            #[cfg(feature = "ws")]
            Transport::Ws(t) => t.read_pending(acc),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        match self {
            Transport::Tcp(t) => t.is_connected(),
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.is_connected(),
            #[cfg(feature = "ws")]
            Transport::Ws(t) => t.is_connected(),
        }
    }

    pub(crate) fn close(&mut self) {
        match self {
            Transport::Tcp(t) => t.close(),
            #[cfg(feature = "tls")]
            Transport::Tls(t) => t.close(),
            #[cfg(feature = "ws")]
            Transport::Ws(t) => t.close(),
        }
    }
}

pub(crate) fn map_read_err(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::UnexpectedEof => TransportError::PeerClosed,
        _ => TransportError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most one byte per call, would-blocks every other call.
    struct TrickleIo {
        written: Vec<u8>,
        stall: bool,
    }

    impl TransportIo for TrickleIo {
        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.stall {
                self.stall = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.stall = true;
            self.written.push(buf[0]);
            Ok(1)
        }

        fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_send_all_retries_partial_writes() {
        let mut io = TrickleIo { written: Vec::new(), stall: false };
        send_all(&mut io, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(io.written, vec![1, 2, 3, 4, 5]);
    }

    struct BrokenIo;

    impl TransportIo for BrokenIo {
        fn try_write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_send_all_surfaces_hard_errors() {
        let mut io = BrokenIo;
        assert!(send_all(&mut io, &[1]).is_err());
    }

    #[test]
    fn test_resolve_loopback() {
        let addr = resolve("127.0.0.1", 1883).unwrap();
        assert_eq!(addr.port(), 1883);
        assert!(addr.ip().is_loopback());
    }
}
