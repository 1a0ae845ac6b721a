use std::sync::Arc;
use std::thread;
use std::time::Duration;

use simple_logger::SimpleLogger;

use mqlink_net::{Connection, ConnectionSettings, EventSink, Result};

struct PrintSink;

impl EventSink for PrintSink {
    fn on_connect(&self, success: bool) {
        log::info!("connect: {success}");
    }

    fn on_disconnect(&self) {
        log::info!("disconnected");
    }

    fn on_packet(&self, packet: bytes::Bytes) {
        log::info!("packet: {packet:?}");
    }
}

fn main() -> Result<()> {
    SimpleLogger::new().with_level(log::LevelFilter::Info).init()?;

    let settings = ConnectionSettings::new()
        .host("test.mosquitto.org")
        .port(1883)
        .client_id("mqlink-example")
        .connect_timeout(Duration::from_secs(10));
    let conn = Connection::new(settings, Arc::new(PrintSink));

    conn.connect()?;
    while !conn.is_connected() {
        conn.poll();
        if conn.state() == mqlink_net::ConnectionState::Disconnected {
            log::error!("connect attempt failed");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(1));
    }

    // MQTT v3.1.1 CONNECT with client id "mqlink-example"
    let mut payload = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3c];
    payload.extend_from_slice(&(b"mqlink-example".len() as u16).to_be_bytes());
    payload.extend_from_slice(b"mqlink-example");
    conn.send_packet(0x10, &payload)?;

    for _ in 0..3000 {
        conn.poll();
        thread::sleep(Duration::from_millis(1));
    }

    conn.disconnect();
    while conn.state() != mqlink_net::ConnectionState::Disconnected {
        conn.poll();
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}
