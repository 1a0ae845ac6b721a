use std::io;

use mqlink_codec::error::DecodeError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Hostname resolution returned no usable address
    #[error("address resolution failed for {0}")]
    Resolve(String),
    /// The attempt did not reach `Connected` within the configured timeout
    #[error("connect timeout")]
    ConnectTimeout,
    /// TLS handshake failure other than the two distinguished cases below
    #[error("tls handshake failed, {0}")]
    Handshake(String),
    /// The peer accepted none of the offered cipher suites
    #[error("no shared cipher suite with peer")]
    NoSharedCipher,
    #[error("certificate verification failed, {0}")]
    CertificateVerification(String),
    /// Orderly or abrupt close by the peer
    #[error("peer closed the connection")]
    PeerClosed,
    /// Operation requires an established connection
    #[error("not connected")]
    NotConnected,
    /// Accumulated inbound data exceeded the configured buffer cap
    #[error("receive buffer limit exceeded")]
    ReceiveBufferFull,
    #[error("framing error, {0}")]
    Decode(#[from] DecodeError),
    #[cfg(feature = "ws")]
    #[error("websocket error, {0}")]
    Ws(String),
    #[error("io error, {:?}", _0)]
    Io(#[from] io::Error),
}
