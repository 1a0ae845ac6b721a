use std::time::Duration;

use serde::Deserialize;

/// Transport variant used for the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// Plain TCP
    Tcp,
    /// TLS over TCP
    Tls,
    /// WebSocket over TCP
    Ws,
    /// WebSocket over TLS
    Wss,
}

impl TransportProtocol {
    #[inline]
    pub fn is_tls(&self) -> bool {
        matches!(self, TransportProtocol::Tls | TransportProtocol::Wss)
    }

    #[inline]
    pub fn is_websocket(&self) -> bool {
        matches!(self, TransportProtocol::Ws | TransportProtocol::Wss)
    }
}

/// Settings for one connection attempt.
///
/// Immutable once handed to a [`crate::Connection`]; reconnecting with
/// different parameters means building a new settings value.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    ///Broker host name or IP address.
    pub host: String,
    ///Broker port, default: 1883
    pub port: u16,
    ///Transport variant, default: tcp
    pub protocol: TransportProtocol,
    ///Client identifier, used for diagnostics only at this layer
    pub client_id: String,
    ///Deadline for one connect attempt, covers the TLS handshake. Default: 30s
    pub connect_timeout: Duration,
    ///Whether the server certificate chain and host name are verified.
    ///Disabling this makes every handshake succeed; default: true
    pub verify_certificate: bool,
    ///OS-level send/receive buffer size, default: 1M
    pub socket_buffer_size: usize,
    ///Upper bound on bytes read per poll, keeps single-poll latency bounded.
    ///Default: 64K
    pub read_chunk_size: usize,
    ///Maximum allowed mqtt message length. 0 means unlimited, default: 1M
    pub max_packet_size: u32,
    ///Cap on accumulated unparsed inbound data, default: 64M
    pub max_buffer_size: usize,
    ///Request path for the WebSocket handshake, default: "/mqtt"
    pub ws_path: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSettings {
    pub fn new() -> ConnectionSettings {
        ConnectionSettings {
            host: "localhost".into(),
            port: 1883,
            protocol: TransportProtocol::Tcp,
            client_id: Default::default(),
            connect_timeout: Duration::from_secs(30),
            verify_certificate: true,
            socket_buffer_size: 1024 * 1024, //"1M"
            read_chunk_size: 64 * 1024,
            max_packet_size: 1024 * 1024, //"1M"
            max_buffer_size: 64 * 1024 * 1024,
            ws_path: "/mqtt".into(),
        }
    }

    pub fn host<N: Into<String>>(mut self, host: N) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn client_id<N: Into<String>>(mut self, client_id: N) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn verify_certificate(mut self, verify: bool) -> Self {
        self.verify_certificate = verify;
        self
    }

    pub fn socket_buffer_size(mut self, socket_buffer_size: usize) -> Self {
        self.socket_buffer_size = socket_buffer_size;
        self
    }

    pub fn read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    pub fn ws_path<N: Into<String>>(mut self, ws_path: N) -> Self {
        self.ws_path = ws_path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let settings = ConnectionSettings::new();
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.protocol, TransportProtocol::Tcp);
        assert!(settings.verify_certificate);
        assert_eq!(settings.socket_buffer_size, 1024 * 1024);
    }

    #[test]
    fn test_protocol_predicates() {
        assert!(TransportProtocol::Tls.is_tls());
        assert!(TransportProtocol::Wss.is_tls());
        assert!(!TransportProtocol::Ws.is_tls());
        assert!(TransportProtocol::Ws.is_websocket());
        assert!(!TransportProtocol::Tcp.is_websocket());
    }
}
