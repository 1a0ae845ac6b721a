use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::BytesMut;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    AlertDescription, CipherSuite, ClientConfig, ClientConnection, DigitallySignedStruct,
    NamedGroup, RootCertStore, SignatureScheme,
};

use crate::error::TransportError;
use crate::settings::ConnectionSettings;
use crate::transport::{map_read_err, HandshakeStatus, TcpTransport, TransportIo};

#[cfg(not(windows))]
use rustls::crypto::aws_lc_rs as crypto_backend;
#[cfg(windows)]
use rustls::crypto::ring as crypto_backend;

/// Suites offered to the peer: the TLS 1.3 set plus forward-secret ECDHE
/// suites for TLS 1.2. Everything else the backend ships is dropped.
const ALLOWED_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

fn restricted_provider() -> CryptoProvider {
    let mut provider = crypto_backend::default_provider();
    provider.cipher_suites.retain(|s| ALLOWED_SUITES.contains(&s.suite()));
    provider
        .kx_groups
        .retain(|g| matches!(g.name(), NamedGroup::secp384r1 | NamedGroup::secp256r1));
    provider
}

/// Certificate verifier used when verification is disabled in the settings.
/// Accepts any chain; signature checks are skipped as well.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub(crate) fn client_config(settings: &ConnectionSettings) -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(restricted_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let config = if settings.verify_certificate {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        log::warn!("Certificate verification disabled for {}", settings.host);
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Adapts [`TransportIo`] to the blocking-flavoured `io::Read`/`io::Write`
/// the TLS engine drives. "Nothing available" becomes `WouldBlock` so the
/// engine stops pulling instead of treating it as end of stream.
struct RetryIo<'a, T: TransportIo>(&'a mut T);

impl<T: TransportIo> Read for RetryIo<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.try_read(buf)? {
            0 => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }
}

impl<T: TransportIo> Write for RetryIo<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// TLS session over a non-blocking TCP socket. The engine buffers both
/// directions, so every poll moves as much ciphertext as the socket allows
/// and no call ever blocks.
pub(crate) struct TlsTransport {
    tcp: TcpTransport,
    conn: ClientConnection,
}

impl TlsTransport {
    /// Wraps an already connected socket; the handshake itself is advanced
    /// by [`drive_handshake`] calls.
    ///
    /// [`drive_handshake`]: TlsTransport::drive_handshake
    pub(crate) fn new(tcp: TcpTransport, settings: &ConnectionSettings) -> Result<TlsTransport, TransportError> {
        let config = client_config(settings)?;
        let name = ServerName::try_from(settings.host.clone())
            .map_err(|e| TransportError::Handshake(format!("invalid server name, {e:?}")))?;
        let conn = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(TlsTransport { tcp, conn })
    }

    /// Advances the handshake as far as the socket currently allows.
    pub(crate) fn drive_handshake(&mut self) -> HandshakeStatus {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut RetryIo(&mut self.tcp)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeStatus::InProgress
                    }
                    Err(e) => return HandshakeStatus::Failed(map_read_err(e)),
                }
                continue;
            }
            match self.conn.read_tls(&mut RetryIo(&mut self.tcp)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::InProgress
                }
                Err(e) => return HandshakeStatus::Failed(map_read_err(e)),
            }
            if let Err(e) = self.conn.process_new_packets() {
                // flush the alert owed to the peer before reporting
                let _ = self.conn.write_tls(&mut RetryIo(&mut self.tcp));
                return HandshakeStatus::Failed(map_tls_err(e));
            }
        }
        HandshakeStatus::Complete
    }

    pub(crate) fn send_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.conn.writer().write_all(buf).map_err(TransportError::Io)?;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut RetryIo(&mut self.tcp)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => return Err(map_read_err(e)),
            }
        }
        Ok(())
    }

    /// Drains queued ciphertext from the socket, decrypts and appends the
    /// resulting plaintext to `acc`. Returns the bytes appended.
    pub(crate) fn read_pending(
        &mut self,
        acc: &mut BytesMut,
        scratch: &mut [u8],
    ) -> Result<usize, TransportError> {
        loop {
            if !self.conn.wants_read() {
                break;
            }
            match self.conn.read_tls(&mut RetryIo(&mut self.tcp)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(map_read_err(e)),
            }
            let state = self.conn.process_new_packets().map_err(map_tls_err)?;
            if state.peer_has_closed() || state.plaintext_bytes_to_read() >= scratch.len() {
                break;
            }
        }

        let mut appended = 0;
        loop {
            match self.conn.reader().read(scratch) {
                // close_notify; report once the already decrypted data is out
                Ok(0) => {
                    if appended == 0 {
                        return Err(TransportError::PeerClosed);
                    }
                    break;
                }
                Ok(n) => {
                    acc.extend_from_slice(&scratch[..n]);
                    appended += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(appended)
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.tcp.is_connected()
    }

    pub(crate) fn close(&mut self) {
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(&mut RetryIo(&mut self.tcp));
        self.tcp.close();
    }
}

fn map_tls_err(e: rustls::Error) -> TransportError {
    match e {
        rustls::Error::AlertReceived(AlertDescription::HandshakeFailure) => {
            TransportError::NoSharedCipher
        }
        rustls::Error::InvalidCertificate(err) => {
            TransportError::CertificateVerification(format!("{err:?}"))
        }
        e => TransportError::Handshake(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_provider_suites() {
        let provider = restricted_provider();
        assert!(!provider.cipher_suites.is_empty());
        for suite in &provider.cipher_suites {
            assert!(ALLOWED_SUITES.contains(&suite.suite()));
        }
        assert_eq!(provider.kx_groups.len(), 2);
    }

    #[test]
    fn test_client_config_builds() {
        let settings = ConnectionSettings::new();
        client_config(&settings).unwrap();
        client_config(&settings.verify_certificate(false)).unwrap();
    }

    #[test]
    fn test_no_verification_schemes() {
        let verifier = NoVerification(Arc::new(restricted_provider()));
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    struct EmptyIo;

    impl TransportIo for EmptyIo {
        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_retry_io_maps_empty_to_would_block() {
        let mut io = EmptyIo;
        let mut buf = [0u8; 8];
        let err = RetryIo(&mut io).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
