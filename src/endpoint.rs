//! The prelude and pipeline wiring: the public surface a transport owner
//! and application code actually use, built by wrapping the Connection
//! Multiplexer in a single-task-shared handle.
//!
//! Nothing here drives I/O itself; `Endpoint::feed`/`poll_outbound` are the
//! only place bytes cross into or out of the pipeline, matching the
//! cooperative, non-blocking model the rest of the crate follows.

use crate::connection::{Connection, ConnectionEvent};
use crate::error::Http2Error;
use crate::stream::StreamNotification;
use crate::types::{ErrorCode, Headers, Role, Settings, StreamId};
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};

/// A duplex handle onto one HTTP/2 connection. Cheap to clone: clones
/// share the same underlying `Connection`, matching the single-task
/// cooperative model where every component runs on one logical task.
#[derive(Clone)]
pub struct Endpoint {
    inner: Rc<RefCell<Connection>>,
    events: Rc<RefCell<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl Endpoint {
    /// Build a fresh endpoint for `role`, advertising `settings` to the peer.
    #[must_use]
    pub fn new(role: Role, settings: Settings) -> Self {
        let (connection, events) = Connection::new(role, settings);
        Self { inner: Rc::new(RefCell::new(connection)), events: Rc::new(RefCell::new(events)) }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.borrow().role()
    }

    #[must_use]
    pub fn local_settings(&self) -> Settings {
        self.inner.borrow().local_settings()
    }

    #[must_use]
    pub fn peer_settings(&self) -> Settings {
        self.inner.borrow().peer_settings()
    }

    /// Feed bytes just read off the transport into the pipeline.
    pub fn feed(&self, bytes: &[u8]) -> Result<(), Http2Error> {
        self.inner.borrow_mut().feed(bytes)
    }

    /// Pull the next chunk of bytes to write to the transport, or `None` if
    /// nothing is presently forwardable. The caller should treat `None` as a
    /// suspension point per the cooperative model: wait for local writes, an
    /// inbound frame, or a timer, then poll again.
    #[must_use]
    pub fn poll_outbound(&self) -> Option<Bytes> {
        self.inner.borrow_mut().poll_outbound()
    }

    /// Drain pending connection-scope events (new incoming streams, the
    /// peer going away). Non-blocking: returns immediately once empty.
    pub fn poll_event(&self) -> Option<ConnectionEvent> {
        self.events.borrow_mut().try_recv().ok()
    }

    /// Open a locally-initiated stream, or `None` if the peer's
    /// `MAX_CONCURRENT_STREAMS` or an already-sent GOAWAY forbids it.
    pub fn create_stream(&self, priority: Option<u32>) -> Option<StreamHandle> {
        let (id, notifications) = self.inner.borrow_mut().create_stream(priority)?;
        Some(StreamHandle { id, connection: Rc::clone(&self.inner), notifications })
    }

    /// Claim the handle for a remotely-initiated stream surfaced via
    /// `ConnectionEvent::IncomingStream`. Returns `None` if the ID is
    /// unknown or its notification receiver was already claimed.
    pub fn accept_stream(&self, id: StreamId) -> Option<StreamHandle> {
        let notifications = self.inner.borrow_mut().take_stream_notifications(id)?;
        Some(StreamHandle { id, connection: Rc::clone(&self.inner), notifications })
    }

    /// Grant the peer more flow-control budget on the connection as a
    /// whole, after the embedder has consumed previously-delivered DATA.
    pub fn grant_connection_window(&self, increment: u32) {
        self.inner.borrow_mut().grant_window(0, increment);
    }

    /// Enqueue a PING and return a future that resolves once the matching
    /// PONG arrives.
    pub fn ping(&self, data: [u8; 8]) -> oneshot::Receiver<()> {
        self.inner.borrow_mut().ping(data)
    }

    /// Send GOAWAY and stop creating new local streams.
    pub fn goaway(&self, last_stream: StreamId, error: ErrorCode) {
        self.inner.borrow_mut().goaway(last_stream, error);
    }
}

/// A non-owning handle to one stream. Becomes inert once the stream
/// reaches `CLOSED`: calls after that point are silently ignored, mirroring
/// the Connection's own behavior for an unknown stream ID.
pub struct StreamHandle {
    id: StreamId,
    connection: Rc<RefCell<Connection>>,
    notifications: mpsc::UnboundedReceiver<StreamNotification>,
}

impl StreamHandle {
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> Option<crate::stream::StreamState> {
        self.connection.borrow().stream_state(self.id)
    }

    /// Send HEADERS on this stream.
    pub fn headers(&self, headers: Headers, priority: Option<u32>, end_stream: bool) {
        self.connection.borrow_mut().send_headers(self.id, headers, priority, end_stream);
    }

    /// Push a promise for a fresh server-initiated stream carried by this one.
    pub fn promise(&self, headers: Headers) -> Option<StreamHandle> {
        let (id, notifications) = self.connection.borrow_mut().promise(self.id, headers)?;
        Some(StreamHandle { id, connection: Rc::clone(&self.connection), notifications })
    }

    /// Reset this stream from the local side.
    pub fn reset(&self, error: ErrorCode) {
        self.connection.borrow_mut().reset_stream(self.id, error);
    }

    /// Queue outbound DATA.
    pub fn write(&self, data: Bytes) {
        self.connection.borrow_mut().send_data(self.id, data);
    }

    /// Mark the outbound side finished.
    pub fn end(&self) {
        self.connection.borrow_mut().end_stream(self.id);
    }

    /// Grant the peer more flow-control budget on this stream, after the
    /// embedder has consumed previously-delivered DATA.
    pub fn grant_window(&self, increment: u32) {
        self.connection.borrow_mut().grant_window(self.id, increment);
    }

    /// Receive the next queued notification (headers, data, a nested
    /// promise, end-of-stream, an error, or a state change), or `None` if
    /// none is presently available.
    pub fn poll_notification(&mut self) -> Option<StreamNotification> {
        self.notifications.try_recv().ok()
    }

    /// Await the next notification, suspending until one arrives or the
    /// stream is fully drained and dropped by the Connection.
    pub async fn recv_notification(&mut self) -> Option<StreamNotification> {
        self.notifications.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(client: &Endpoint, server: &Endpoint) {
        server.feed(crate::types::CLIENT_PREFACE).unwrap();
        while let Some(bytes) = client.poll_outbound() {
            server.feed(&bytes).unwrap();
        }
        while let Some(bytes) = server.poll_outbound() {
            client.feed(&bytes).unwrap();
        }
    }

    #[test]
    fn request_response_round_trip_through_handles() {
        let client = Endpoint::new(Role::Client, Settings::default());
        let server = Endpoint::new(Role::Server, Settings::default());
        handshake(&client, &server);

        let mut request = client.create_stream(None).unwrap();
        request.headers(vec![(":method".into(), "get".into())], None, true);
        while let Some(bytes) = client.poll_outbound() {
            server.feed(&bytes).unwrap();
        }

        let incoming = server.poll_event().expect("server should see the new stream");
        let ConnectionEvent::IncomingStream(id) = incoming else { panic!("wrong event") };
        let response = server.accept_stream(id).unwrap();
        response.headers(vec![(":status".into(), "200".into())], None, false);
        response.write(Bytes::from_static(b"ok"));
        response.end();

        while let Some(bytes) = server.poll_outbound() {
            client.feed(&bytes).unwrap();
        }

        let mut body = Vec::new();
        while let Some(notification) = request.poll_notification() {
            if let StreamNotification::Data(bytes) = notification {
                body.extend_from_slice(&bytes);
            }
        }
        assert_eq!(body, b"ok");
        // Fully drained and CLOSED on both sides by now, so the Connection
        // has already reaped it from the registry.
        assert_eq!(response.state(), None);
    }

    #[test]
    fn second_handle_to_same_stream_shares_state() {
        let client = Endpoint::new(Role::Client, Settings::default());
        let server = Endpoint::new(Role::Server, Settings::default());
        handshake(&client, &server);

        let request = client.create_stream(None).unwrap();
        assert_eq!(client.create_stream(None).unwrap().id(), request.id() + 2);
    }
}
