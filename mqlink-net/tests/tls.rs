#![cfg(feature = "tls")]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::PrivateKeyDer;

use mqlink_net::{
    Connection, ConnectionSettings, ConnectionState, EventSink, TransportProtocol,
};

#[derive(Debug, Clone, PartialEq)]
enum TestEvent {
    Connect(bool),
    Disconnect,
    Packet(Vec<u8>),
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<TestEvent>>,
}

impl RecordingSink {
    fn snapshot(&self) -> Vec<TestEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn on_connect(&self, success: bool) {
        self.events.lock().push(TestEvent::Connect(success));
    }

    fn on_disconnect(&self) {
        self.events.lock().push(TestEvent::Disconnect);
    }

    fn on_packet(&self, packet: bytes::Bytes) {
        self.events.lock().push(TestEvent::Packet(packet.to_vec()));
    }
}

fn server_config() -> Arc<rustls::ServerConfig> {
    let issued = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let certs = vec![issued.cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(issued.key_pair.serialize_der().into());
    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap(),
    )
}

/// Echo server behind a self-signed certificate. A failed handshake just
/// ends the session, so the same fixture serves the rejection test.
fn spawn_tls_echo_server() -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = server_config();
    let handle = thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut conn = rustls::ServerConnection::new(config).unwrap();
            let mut tls = rustls::Stream::new(&mut conn, &mut stream);
            let mut buf = [0u8; 1024];
            loop {
                match tls.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tls.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    (port, handle)
}

fn settings(port: u16) -> ConnectionSettings {
    ConnectionSettings::new()
        .host("127.0.0.1")
        .port(port)
        .protocol(TransportProtocol::Tls)
        .client_id("tls-test")
        .connect_timeout(Duration::from_secs(5))
}

fn poll_until(conn: &Connection, mut pred: impl FnMut() -> bool) -> bool {
    for _ in 0..5000 {
        conn.poll();
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn tls_echo_round_trip_without_verification() {
    let (port, server) = spawn_tls_echo_server();
    let sink = Arc::new(RecordingSink::default());
    let conn = Connection::new(settings(port).verify_certificate(false), sink.clone());

    conn.connect().unwrap();
    assert!(poll_until(&conn, || conn.is_connected()));
    assert_eq!(sink.snapshot(), vec![TestEvent::Connect(true)]);

    conn.send(&[0x10, 0x00]).unwrap();
    assert!(poll_until(&conn, || sink.snapshot().len() > 1));
    assert_eq!(sink.snapshot()[1], TestEvent::Packet(vec![0x10, 0x00]));

    conn.disconnect();
    assert!(poll_until(&conn, || conn.state() == ConnectionState::Disconnected));
    assert_eq!(sink.snapshot().last(), Some(&TestEvent::Disconnect));
    server.join().unwrap();
}

#[test]
fn invalid_certificate_fails_the_attempt() {
    let (port, server) = spawn_tls_echo_server();
    let sink = Arc::new(RecordingSink::default());
    // verification stays enabled, the self-signed chain must be rejected
    let conn = Connection::new(settings(port), sink.clone());

    conn.connect().unwrap();
    assert!(poll_until(&conn, || conn.state() == ConnectionState::Disconnected));
    assert_eq!(
        sink.snapshot(),
        vec![TestEvent::Connect(false), TestEvent::Disconnect]
    );
    server.join().unwrap();
}

#[test]
fn tls_frame_split_across_records_arrives_whole() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = server_config();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut conn = rustls::ServerConnection::new(config).unwrap();
        let mut tls = rustls::Stream::new(&mut conn, &mut stream);
        tls.write_all(&[0x30, 0x02]).unwrap();
        tls.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        tls.write_all(&[0xaa, 0xbb]).unwrap();
        tls.flush().unwrap();
        thread::sleep(Duration::from_millis(500));
    });

    let sink = Arc::new(RecordingSink::default());
    let conn = Connection::new(settings(port).verify_certificate(false), sink.clone());
    conn.connect().unwrap();
    assert!(poll_until(&conn, || sink.snapshot().len() > 1));
    assert_eq!(
        sink.snapshot()[1],
        TestEvent::Packet(vec![0x30, 0x02, 0xaa, 0xbb])
    );

    conn.disconnect();
    assert!(poll_until(&conn, || conn.state() == ConnectionState::Disconnected));
    server.join().unwrap();
}
