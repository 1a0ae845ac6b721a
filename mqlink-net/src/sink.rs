use bytes::Bytes;

/// Receives lifecycle and packet notifications from a [`crate::Connection`].
///
/// Notifications are edge-triggered and delivered in the order the underlying
/// transitions occur, never concurrently for the same connection. Callbacks
/// may call back into the connection (e.g. send a reply from `on_packet`).
pub trait EventSink: Send + Sync {
    /// Fired once per connect attempt: `true` on entering the connected
    /// state, `false` when the attempt failed.
    fn on_connect(&self, success: bool);

    /// Fired once when an established or failed connection is torn down.
    fn on_disconnect(&self);

    /// One complete control packet, fixed header included, payload opaque.
    fn on_packet(&self, packet: Bytes);
}

/// Internal event record, dispatched after the state lock is released.
#[derive(Debug)]
pub(crate) enum Event {
    Connect(bool),
    Disconnect,
    Packet(Bytes),
}

pub(crate) fn dispatch(sink: &dyn EventSink, events: Vec<Event>) {
    for event in events {
        match event {
            Event::Connect(success) => sink.on_connect(success),
            Event::Disconnect => sink.on_disconnect(),
            Event::Packet(packet) => sink.on_packet(packet),
        }
    }
}
