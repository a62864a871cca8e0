//! The Connection Multiplexer: owns the stream registry, the two
//! direction-scoped header tables, the connection-level flow window and
//! the SETTINGS/PING/GOAWAY control-frame handling, and drives the
//! outbound pump that turns per-stream queues into a single ordered
//! sequence of wire-ready bytes.

use crate::compressor::{Compressor, Decompressor};
use crate::error::Http2Error;
use crate::flow::{self, Window};
use crate::frame::{Deserializer, Frame, PingFlags, WindowUpdateFlags};
use crate::hpack::HeaderTable;
use crate::stream::{Direction, Stream, StreamNotification};
use crate::types::{ErrorCode, Headers, Role, Settings, SettingsParameter, StreamId, DEFAULT_PRIORITY};
use bytes::Bytes;
use log::{debug, error, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot};

/// Connection-scope events with no single stream to deliver them to.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A new stream was registered because an inbound frame named an ID the
    /// registry had not seen before, or a PUSH_PROMISE reserved one.
    IncomingStream(StreamId),
    /// The peer sent GOAWAY; no further local streams should be created and
    /// only streams at or below `last_stream` will keep being serviced.
    PeerGoingAway { last_stream: StreamId, error: ErrorCode },
}

/// A frame handed to the outbound pump together with the stream it came
/// from, so a connection-window split can be requeued at the right place.
struct Ready {
    stream: StreamId,
    frame: Frame,
}

/// The Connection Multiplexer.
pub struct Connection {
    role: Role,
    next_outbound_stream_id: StreamId,
    streams: BTreeMap<StreamId, Stream>,
    local_settings: Settings,
    peer_settings: Settings,
    connection_window: Window,
    deserializer: Deserializer,
    decompressor: Decompressor,
    compressor: Compressor,
    /// Connection-scope frames (our own SETTINGS, PING replies, GOAWAY,
    /// connection-level WINDOW_UPDATE) queued ahead of any stream's data;
    /// these always bypass the flow-control gate.
    control_queue: VecDeque<Frame>,
    /// Frames already run through the compressor, waiting to be
    /// serialized. A single logical HEADERS/PUSH_PROMISE can expand into
    /// several of these.
    outbound_ready: VecDeque<Frame>,
    pending_pings: HashMap<[u8; 8], oneshot::Sender<()>>,
    /// Notification receivers for remotely-initiated streams, collected
    /// here until the embedder claims them after an `IncomingStream` event.
    incoming_receivers: HashMap<StreamId, mpsc::UnboundedReceiver<StreamNotification>>,
    first_frame_seen: bool,
    awaiting_preface: bool,
    /// Bytes of the client preface seen so far, when it arrives split
    /// across more than one `feed` call.
    preface_buf: Vec<u8>,
    sent_goaway: bool,
    peer_going_away: bool,
    last_processed_stream: StreamId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    /// Construct a fresh connection for `role`, advertising `local_settings`.
    /// Returns the connection plus the receiver for connection-scope events
    /// (new incoming streams, GOAWAY notice).
    #[must_use]
    pub fn new(role: Role, local_settings: Settings) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (request_table, response_table) = (HeaderTable::request(4096), HeaderTable::response(4096));
        let (decompress_table, compress_table) = match role {
            // A server receives requests and sends responses.
            Role::Server => (request_table, response_table),
            // A client receives responses and sends requests.
            Role::Client => (response_table, request_table),
        };

        let mut control_queue = VecDeque::new();
        control_queue.push_back(Frame::Settings { values: local_settings.to_wire_map() });

        let connection = Self {
            role,
            next_outbound_stream_id: role.first_outbound_stream_id(),
            streams: BTreeMap::new(),
            local_settings,
            peer_settings: Settings::default(),
            connection_window: Window::Finite(i64::from(local_settings.initial_window_size)),
            deserializer: Deserializer::new(),
            decompressor: Decompressor::new(decompress_table),
            compressor: Compressor::new(compress_table),
            control_queue,
            outbound_ready: VecDeque::new(),
            pending_pings: HashMap::new(),
            incoming_receivers: HashMap::new(),
            first_frame_seen: false,
            awaiting_preface: role == Role::Server,
            preface_buf: Vec::new(),
            sent_goaway: false,
            peer_going_away: false,
            last_processed_stream: 0,
            events,
        };
        (connection, events_rx)
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn local_settings(&self) -> Settings {
        self.local_settings
    }

    #[must_use]
    pub fn peer_settings(&self) -> Settings {
        self.peer_settings
    }

    /// Allocate and register a new locally-initiated stream, unless the
    /// peer's advertised `MAX_CONCURRENT_STREAMS` or an already-sent GOAWAY
    /// forbids it.
    pub fn create_stream(&mut self, priority: Option<u32>) -> Option<(StreamId, mpsc::UnboundedReceiver<StreamNotification>)> {
        if self.sent_goaway {
            return None;
        }
        if let Some(max) = self.peer_settings.max_concurrent_streams {
            let open_local = self
                .streams
                .keys()
                .filter(|id| self.role.owns_parity(**id))
                .count() as u32;
            if open_local >= max {
                return None;
            }
        }
        let id = self.next_outbound_stream_id;
        self.next_outbound_stream_id += 2;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = Stream::new(id, priority.unwrap_or(DEFAULT_PRIORITY), self.local_settings.initial_window_size, tx);
        if self.peer_settings.flow_control_disabled_for_new_streams {
            let _ = stream.flow.apply_window_update(0, true);
        }
        self.streams.insert(id, stream);
        Some((id, rx))
    }

    fn register_remote_stream(&mut self, id: StreamId) -> &mut Stream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = Stream::new(id, DEFAULT_PRIORITY, self.local_settings.initial_window_size, tx);
        if self.peer_settings.flow_control_disabled_for_new_streams {
            let _ = stream.flow.apply_window_update(0, true);
        }
        self.incoming_receivers.insert(id, rx);
        self.streams.entry(id).or_insert(stream)
    }

    /// Claim the notification receiver for a remotely-initiated stream
    /// surfaced via `ConnectionEvent::IncomingStream`. Returns `None` if the
    /// ID is unknown or was already claimed.
    pub fn take_stream_notifications(&mut self, id: StreamId) -> Option<mpsc::UnboundedReceiver<StreamNotification>> {
        self.incoming_receivers.remove(&id)
    }

    /// Send HEADERS on `stream`, handing the decoded map to the compressor
    /// later in the outbound pump. No-op if the stream is unknown.
    pub fn send_headers(&mut self, stream: StreamId, headers: Headers, priority: Option<u32>, end_stream: bool) {
        if let Some(s) = self.streams.get_mut(&stream) {
            s.headers(headers, priority, end_stream);
        }
    }

    /// Queue outbound DATA on `stream`.
    pub fn send_data(&mut self, stream: StreamId, data: Bytes) {
        if let Some(s) = self.streams.get_mut(&stream) {
            s.write(data);
        }
    }

    /// Mark `stream`'s outbound side finished.
    pub fn end_stream(&mut self, stream: StreamId) {
        if let Some(s) = self.streams.get_mut(&stream) {
            s.end();
        }
    }

    /// Reset `stream` from the local side: enqueue RST_STREAM, drop queued
    /// frames, and transition it to CLOSED.
    pub fn reset_stream(&mut self, stream: StreamId, error: ErrorCode) {
        if let Some(s) = self.streams.get_mut(&stream) {
            s.reset(error);
        }
    }

    /// Push a promise from `originating` stream for a fresh server-initiated
    /// stream, returning the promised stream's ID and notification channel.
    pub fn promise(&mut self, originating: StreamId, headers: Headers) -> Option<(StreamId, mpsc::UnboundedReceiver<StreamNotification>)> {
        if !self.streams.contains_key(&originating) || self.sent_goaway {
            return None;
        }
        let promised_id = self.next_outbound_stream_id;
        self.next_outbound_stream_id += 2;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut promised = Stream::new(promised_id, DEFAULT_PRIORITY, self.local_settings.initial_window_size, tx);
        promised.reserve_promised(Direction::Sent).ok()?;
        self.streams.insert(promised_id, promised);

        let carrier = self.streams.get_mut(&originating)?;
        carrier.flow.enqueue(Frame::PushPromise {
            stream: originating,
            flags: crate::frame::PushPromiseFlags::empty(),
            promised_stream: promised_id,
            block: crate::frame::HeaderBlock::Decoded(headers),
        });
        Some((promised_id, rx))
    }

    /// Enqueue a PING and return a future that resolves once the matching
    /// PONG arrives.
    pub fn ping(&mut self, data: [u8; 8]) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_pings.insert(data, tx);
        self.control_queue.push_back(Frame::Ping { flags: PingFlags::empty(), data });
        rx
    }

    /// Send GOAWAY and stop creating new local streams. Existing streams at
    /// or below `last_stream` continue being serviced.
    pub fn goaway(&mut self, last_stream: StreamId, error: ErrorCode) {
        self.sent_goaway = true;
        self.control_queue.push_back(Frame::GoAway { last_stream, error });
    }

    /// A connection-fatal error sends GOAWAY with the failing code and the
    /// last stream this side had processed, then is returned unchanged so
    /// the caller knows to tear the pipeline down. Stream-scoped errors
    /// pass through untouched; the Stream State Machine already reset the
    /// individual stream they came from.
    fn fail_connection(&mut self, err: Http2Error) -> Http2Error {
        if err.is_connection_fatal() {
            error!("connection failing with {:?}, sending GOAWAY", err.code());
            self.goaway(self.last_processed_stream, err.code());
        }
        err
    }

    /// Grant the peer more flow-control budget: `stream == 0` replenishes
    /// the connection-level window, any other value the named stream's.
    /// Enqueued as a control frame so it always overtakes queued DATA.
    pub fn grant_window(&mut self, stream: StreamId, increment: u32) {
        self.control_queue.push_back(Frame::WindowUpdate {
            stream,
            flags: WindowUpdateFlags::empty(),
            increment,
        });
    }

    #[must_use]
    pub fn stream_state(&self, id: StreamId) -> Option<crate::stream::StreamState> {
        self.streams.get(&id).map(Stream::state)
    }

    /// Feed newly-arrived transport bytes. On plain TCP a server must see
    /// the client preface before anything else; a mismatch is fatal and no
    /// frame is delivered to any stream.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), Http2Error> {
        let mut bytes = bytes;
        if self.awaiting_preface {
            let preface_len = crate::types::CLIENT_PREFACE.len();
            // Carry over bytes seen on earlier `feed` calls: the preface may
            // arrive split across any number of writes.
            let needed = preface_len - self.preface_buf.len();
            let take = bytes.len().min(needed);
            self.preface_buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.preface_buf.len() < preface_len {
                if crate::types::CLIENT_PREFACE.starts_with(self.preface_buf.as_slice()) {
                    return Ok(());
                }
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            if self.preface_buf.as_slice() != crate::types::CLIENT_PREFACE {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            self.awaiting_preface = false;
            self.preface_buf.clear();
        }

        self.deserializer.feed(bytes);
        loop {
            let frame = match self.deserializer.poll() {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail_connection(err)),
            };
            let Some(frame) = frame else { break };
            if let Err(err) = self.dispatch(frame) {
                return Err(self.fail_connection(err));
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), Http2Error> {
        if !self.first_frame_seen {
            self.first_frame_seen = true;
            if !matches!(frame, Frame::Settings { .. }) {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
        }

        let Some(decoded) = self.decompressor.process(frame)? else {
            return Ok(());
        };

        if decoded.stream_id() == 0 {
            return self.dispatch_control(decoded);
        }
        self.dispatch_stream(decoded)
    }

    fn dispatch_control(&mut self, frame: Frame) -> Result<(), Http2Error> {
        match frame {
            Frame::Settings { values } => {
                for (parameter, value) in values {
                    let delta = self.peer_settings.apply(parameter, value);
                    if parameter == SettingsParameter::InitialWindowSize && delta != 0 {
                        for stream in self.streams.values_mut() {
                            stream.flow.retroactive_adjust(delta)?;
                        }
                    }
                    debug!("applied peer SETTINGS {:?} = {}", parameter, value);
                }
            }
            Frame::Ping { flags, data } => {
                if flags.contains(PingFlags::PONG) {
                    if let Some(tx) = self.pending_pings.remove(&data) {
                        let _ = tx.send(());
                    } else {
                        warn!("unsolicited PONG, discarding");
                    }
                } else {
                    self.control_queue.push_back(Frame::Ping { flags: PingFlags::PONG, data });
                }
            }
            Frame::GoAway { last_stream, error } => {
                self.peer_going_away = true;
                let _ = self.events.send(ConnectionEvent::PeerGoingAway { last_stream, error });
            }
            Frame::WindowUpdate { increment, flags, .. } => {
                flow::apply_window_update(&mut self.connection_window, increment, flags.contains(WindowUpdateFlags::END_FLOW_CONTROL))?;
            }
            other => unreachable!("non connection-scope frame routed to dispatch_control: {other:?}"),
        }
        Ok(())
    }

    fn dispatch_stream(&mut self, frame: Frame) -> Result<(), Http2Error> {
        let id = frame.stream_id();
        self.last_processed_stream = self.last_processed_stream.max(id);

        if let Frame::PushPromise { stream: carrier, promised_stream, block, .. } = &frame {
            let headers = block.as_decoded().expect("decompressor always yields Decoded").clone();
            if self.streams.get(promised_stream).is_some_and(|s| s.state() != crate::stream::StreamState::Idle) {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            let promised = self.register_remote_stream(*promised_stream);
            promised.reserve_promised(Direction::Received).map_err(|_| Http2Error::connection(ErrorCode::ProtocolError))?;
            let _ = self.events.send(ConnectionEvent::IncomingStream(*promised_stream));
            if let Some(carrier_stream) = self.streams.get(carrier) {
                carrier_stream.notify_promise(*promised_stream, headers);
            }
            return Ok(());
        }

        if !self.streams.contains_key(&id) {
            if self.role.peer().owns_parity(id) {
                self.register_remote_stream(id);
                let _ = self.events.send(ConnectionEvent::IncomingStream(id));
            } else {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
        }

        let stream = self.streams.get_mut(&id).expect("just inserted or already present");
        if let Err(err) = stream.receive(frame) {
            warn!("stream {id} reset after a receive-side protocol violation");
            stream.reset(err.code());
        }
        self.reap_drained_streams();
        Ok(())
    }

    fn reap_drained_streams(&mut self) {
        self.streams.retain(|_, s| !s.is_drained());
    }

    /// Pull the next wire-ready chunk of outbound bytes, or `None` if
    /// nothing can be sent right now. The caller should treat `None` as a
    /// suspension point: wait for new stream output, a WINDOW_UPDATE, or
    /// more local writes before polling again.
    pub fn poll_outbound(&mut self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.outbound_ready.pop_front() {
                if self.outbound_ready.is_empty() {
                    self.reap_drained_streams();
                }
                return Some(frame.serialize().expect("internally constructed frame always serializes"));
            }
            let ready = self.next_ready_frame()?;
            for compressed in self.compressor.compress(ready.frame) {
                self.outbound_ready.push_back(compressed);
            }
        }
    }

    /// Find the next frame the outbound scan would forward: connection-scope
    /// control frames first, then streams in ID order, gated by both the
    /// per-stream and the connection-level flow-control windows.
    fn next_ready_frame(&mut self) -> Option<Ready> {
        if let Some(frame) = self.control_queue.pop_front() {
            return Some(Ready { stream: 0, frame });
        }
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            let stream = self.streams.get_mut(&id).expect("id came from this map's own keys");
            let Some(candidate) = stream.flow.poll_forwardable() else { continue };
            if !matches!(candidate, Frame::Data { .. }) {
                return Some(Ready { stream: id, frame: candidate });
            }
            match gate_connection_window(candidate, &mut self.connection_window) {
                (Some(forwardable), remainder) => {
                    if let Some(remainder) = remainder {
                        self.streams.get_mut(&id).unwrap().flow.push_front(remainder);
                    }
                    return Some(Ready { stream: id, frame: forwardable });
                }
                (None, Some(blocked)) => {
                    self.streams.get_mut(&id).unwrap().flow.push_front(blocked);
                    continue;
                }
                (None, None) => unreachable!("gate_connection_window always returns one of the two frames"),
            }
        }
        None
    }
}

/// Split a DATA frame already approved by its stream's own window against
/// the connection-level window, mirroring the per-stream split rule.
/// Returns `(forwardable, remainder-to-requeue)`.
fn gate_connection_window(frame: Frame, window: &mut Window) -> (Option<Frame>, Option<Frame>) {
    let Frame::Data { stream, flags, mut data } = frame else {
        return (Some(frame), None);
    };
    let len = data.len() as i64;
    match *window {
        Window::Infinite => (Some(Frame::Data { stream, flags, data }), None),
        Window::Finite(available) if available >= len => {
            *window = Window::Finite(available - len);
            (Some(Frame::Data { stream, flags, data }), None)
        }
        Window::Finite(available) if available > 0 => {
            let prefix = data.split_to(available as usize);
            *window = Window::Finite(0);
            (
                Some(Frame::Data { stream, flags: flags & crate::frame::DataFlags::RESERVED, data: prefix }),
                Some(Frame::Data { stream, flags, data }),
            )
        }
        Window::Finite(_) => (None, Some(Frame::Data { stream, flags, data })),
    }
}
