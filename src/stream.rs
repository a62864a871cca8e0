//! The Stream State Machine and the per-stream upstream/user-side
//! duplex buffer.

use crate::error::Http2Error;
use crate::flow::FlowController;
use crate::frame::{DataFlags, Frame, HeaderBlock, HeadersFlags};
use crate::types::{ErrorCode, Headers, StreamId};
use bytes::Bytes;
use log::trace;
use tokio::sync::mpsc;

/// draft-04's state set; `CLOSED` streams are destroyed once their
/// queue drains rather than lingering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Which side originated the frame driving a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// The event a frame represents for the purposes of the transition table.
/// Distinct from `FrameType` because HEADERS/DATA carry an `end_stream` bit
/// that participates in the table and PUSH_PROMISE needs to be told apart
/// from an ordinary frame on its own stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Headers { end_stream: bool },
    Data { end_stream: bool },
    Priority,
    ResetStream,
    PushPromise,
    WindowUpdate,
}

/// A transition-table violation. The caller decides whether this panics
/// (sent side, a local programming error) or becomes a stream-scoped
/// `Http2Error` (received side, a peer violation) — see the transition
/// table's last clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolViolation;

/// Events delivered to the stream's non-owning user-side handle.
#[derive(Debug, Clone)]
pub enum StreamNotification {
    Headers(Headers),
    Promise(StreamId, Headers),
    Data(Bytes),
    End,
    Error(ErrorCode),
    State(StreamState),
}

/// A stream, exclusively owned by the `Connection`. Holds its own
/// upstream flow queue; the non-owning user handle communicates across the
/// `notify` channel, the synchronization boundary between the two.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    state: StreamState,
    priority: u32,
    pub flow: FlowController,
    notify: mpsc::UnboundedSender<StreamNotification>,
}

impl Stream {
    #[must_use]
    pub fn new(id: StreamId, priority: u32, initial_window: u32, notify: mpsc::UnboundedSender<StreamNotification>) -> Self {
        Self { id, state: StreamState::Idle, priority, flow: FlowController::new(initial_window), notify }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Whether this stream has reached `CLOSED` and drained its queue, i.e.
    /// is ready for the Connection to drop it.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.state == StreamState::Closed && self.flow.is_empty()
    }

    fn notify(&self, notification: StreamNotification) {
        // A dropped receiver just means the user handle stopped listening.
        let _ = self.notify.send(notification);
    }

    /// Apply the transition table for a frame travelling in the given
    /// direction. `Err` means the event is illegal in the current state.
    fn transition(&mut self, dir: Direction, event: StreamEvent) -> Result<(), ProtocolViolation> {
        use Direction::{Received, Sent};
        use StreamEvent::{Data, Headers, Priority, PushPromise, ResetStream, WindowUpdate};
        use StreamState::{Closed, HalfClosedLocal, HalfClosedRemote, Idle, Open, ReservedLocal, ReservedRemote};

        let before = self.state;
        let next = match (self.state, dir, event) {
            (Idle, Sent, Headers { end_stream }) => if end_stream { HalfClosedLocal } else { Open },
            (Idle, Received, Headers { end_stream }) => if end_stream { HalfClosedRemote } else { Open },
            (Idle, _, _) => return Err(ProtocolViolation),

            (ReservedLocal, Sent, Headers { .. }) => HalfClosedRemote,
            (ReservedLocal, Sent, ResetStream) => Closed,
            (ReservedLocal, Received, Priority) => ReservedLocal,
            (ReservedLocal, _, _) => return Err(ProtocolViolation),

            (ReservedRemote, Received, Headers { .. }) => HalfClosedLocal,
            (ReservedRemote, Sent | Received, ResetStream) => Closed,
            (ReservedRemote, Sent, Priority) => ReservedRemote,
            (ReservedRemote, _, _) => return Err(ProtocolViolation),

            (Open, Sent, ResetStream) | (Open, Received, ResetStream) => Closed,
            (Open, Sent, Headers { end_stream: true } | Data { end_stream: true }) => HalfClosedLocal,
            (Open, Received, Headers { end_stream: true } | Data { end_stream: true }) => HalfClosedRemote,
            (Open, _, _) => Open,

            (HalfClosedLocal, Received, Headers { end_stream: true } | Data { end_stream: true }) => Closed,
            (HalfClosedLocal, Received, ResetStream) => Closed,
            (HalfClosedLocal, Sent, Priority | WindowUpdate) => HalfClosedLocal,
            (HalfClosedLocal, Sent, _) => return Err(ProtocolViolation),
            (HalfClosedLocal, Received, _) => HalfClosedLocal,

            (HalfClosedRemote, Sent, Headers { end_stream: true } | Data { end_stream: true }) => Closed,
            (HalfClosedRemote, Sent, ResetStream) => Closed,
            (HalfClosedRemote, Received, Priority | WindowUpdate) => HalfClosedRemote,
            (HalfClosedRemote, Received, _) => return Err(ProtocolViolation),
            (HalfClosedRemote, Sent, _) => HalfClosedRemote,

            (Closed, Received, PushPromise | WindowUpdate | Priority) => Closed,
            (Closed, Sent, ResetStream) => Closed,
            (Closed, _, _) => return Err(ProtocolViolation),
        };

        self.state = next;
        if next != before {
            trace!("stream {} {:?} -> {:?} ({:?} {:?})", self.id, before, next, dir, event);
            self.notify(StreamNotification::State(next));
        }
        Ok(())
    }

    /// Transition this stream's state because a *promised* stream is being
    /// reserved on it via PUSH_PROMISE. Only
    /// legal from `IDLE`.
    pub fn reserve_promised(&mut self, dir: Direction) -> Result<(), ProtocolViolation> {
        if self.state != StreamState::Idle {
            return Err(ProtocolViolation);
        }
        self.state = match dir {
            Direction::Sent => StreamState::ReservedLocal,
            Direction::Received => StreamState::ReservedRemote,
        };
        self.notify(StreamNotification::State(self.state));
        Ok(())
    }

    /// Apply the send-side transition for `frame` and enqueue it. Violating
    /// the transition table on the sending side is a local programming
    /// error: it panics rather than returning a `Result`.
    pub fn send(&mut self, frame: Frame) {
        let event = stream_event_for(&frame);
        self.transition(Direction::Sent, event).expect("illegal frame for current stream state");
        self.flow.enqueue(frame);
    }

    /// Apply the receive-side transition for `frame` and, if legal, surface
    /// it to the user handle. A receive-side violation resets the stream
    /// and surfaces a stream-scoped error.
    pub fn receive(&mut self, frame: Frame) -> Result<(), Http2Error> {
        let event = stream_event_for(&frame);
        if self.transition(Direction::Received, event).is_err() {
            return Err(Http2Error::stream(self.id, ErrorCode::ProtocolError));
        }
        match frame {
            Frame::Data { data, flags, .. } => {
                self.notify(StreamNotification::Data(data));
                if flags.contains(DataFlags::END_STREAM) {
                    self.notify(StreamNotification::End);
                }
            }
            Frame::Headers { flags, block, .. } => {
                let headers = block.as_decoded().expect("HEADERS reached the stream uncompressed").clone();
                self.notify(StreamNotification::Headers(headers));
                if flags.contains(HeadersFlags::END_STREAM) {
                    self.notify(StreamNotification::End);
                }
            }
            Frame::ResetStream { error, .. } => {
                self.notify(StreamNotification::Error(error));
            }
            Frame::Priority { priority, .. } => {
                self.priority = priority;
            }
            Frame::WindowUpdate { increment, flags, .. } => {
                let end_flow_control = flags.contains(crate::frame::WindowUpdateFlags::END_FLOW_CONTROL);
                self.flow.apply_window_update(increment, end_flow_control)?;
            }
            Frame::PushPromise { .. } => {
                // The promised stream's own reservation is applied by the
                // Connection, which owns the registry this stream doesn't.
            }
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => {
                unreachable!("connection-scope frames are never routed to a stream")
            }
        }
        Ok(())
    }

    /// The PUSH_PROMISE variant of `receive`: deliver the promise to the
    /// user handle without running it through the generic transition path
    /// (the originating stream's own state is unaffected by a promise it
    /// carries; only the promised stream reserves).
    pub fn notify_promise(&self, promised: StreamId, headers: Headers) {
        self.notify(StreamNotification::Promise(promised, headers));
    }

    /// Reset this stream: drop every queued frame except the
    /// RST_STREAM itself, transition to `CLOSED`, and surface the error.
    pub fn reset(&mut self, error: ErrorCode) {
        self.flow.clear();
        self.state = StreamState::Closed;
        self.flow.enqueue(Frame::ResetStream { stream: self.id, error });
        self.notify(StreamNotification::Error(error));
        self.notify(StreamNotification::State(StreamState::Closed));
    }

    /// Send `HEADERS` built from a decoded header map.
    pub fn headers(&mut self, headers: Headers, priority: Option<u32>, end_stream: bool) {
        let mut flags = HeadersFlags::empty();
        if end_stream {
            flags |= HeadersFlags::END_STREAM;
        }
        if priority.is_some() {
            flags |= HeadersFlags::PRIORITY;
        }
        self.send(Frame::Headers { stream: self.id, flags, priority, block: HeaderBlock::Decoded(headers) });
    }

    /// Queue outbound `data` as one or more DATA frames' worth of payload.
    /// Splitting to the flow-control window happens later, in the Flow
    /// Controller; here the whole chunk is enqueued as a single frame.
    pub fn write(&mut self, data: Bytes) {
        self.send(Frame::Data { stream: self.id, flags: DataFlags::empty(), data });
    }

    /// Mark the stream's outbound side finished: flip `END_STREAM` on the last queued DATA/HEADERS frame in
    /// place, or enqueue an empty DATA frame carrying it.
    pub fn end(&mut self) {
        let set_in_place = match self.flow.back_mut() {
            Some(Frame::Data { flags, .. }) => {
                *flags |= DataFlags::END_STREAM;
                true
            }
            Some(Frame::Headers { flags, .. }) => {
                *flags |= HeadersFlags::END_STREAM;
                true
            }
            _ => false,
        };
        if set_in_place {
            self.transition(Direction::Sent, StreamEvent::Data { end_stream: true })
                .expect("illegal end() for current stream state");
        } else {
            self.send(Frame::Data { stream: self.id, flags: DataFlags::END_STREAM, data: Bytes::new() });
        }
    }
}

fn stream_event_for(frame: &Frame) -> StreamEvent {
    match frame {
        Frame::Data { flags, .. } => StreamEvent::Data { end_stream: flags.contains(DataFlags::END_STREAM) },
        Frame::Headers { flags, .. } => StreamEvent::Headers { end_stream: flags.contains(HeadersFlags::END_STREAM) },
        Frame::Priority { .. } => StreamEvent::Priority,
        Frame::ResetStream { .. } => StreamEvent::ResetStream,
        Frame::PushPromise { .. } => StreamEvent::PushPromise,
        Frame::WindowUpdate { .. } => StreamEvent::WindowUpdate,
        Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => {
            unreachable!("connection-scope frames never reach a stream's transition table")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (Stream, mpsc::UnboundedReceiver<StreamNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Stream::new(1, crate::types::DEFAULT_PRIORITY, 65_535, tx), rx)
    }

    #[test]
    fn client_get_trajectory() {
        let (mut s, _rx) = stream();
        s.headers(vec![(":method".into(), "get".into())], None, true);
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        let response = Frame::Headers {
            stream: 1,
            flags: HeadersFlags::END_HEADERS,
            priority: None,
            block: HeaderBlock::Decoded(vec![(":status".into(), "200".into())]),
        };
        s.receive(response).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        let data = Frame::Data { stream: 1, flags: DataFlags::END_STREAM, data: Bytes::from_static(b"12345678") };
        s.receive(data).unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn push_promise_reserves_idle_stream() {
        let (mut promised, _rx) = stream();
        promised.reserve_promised(Direction::Received).unwrap();
        assert_eq!(promised.state(), StreamState::ReservedRemote);
    }

    #[test]
    fn double_reservation_is_a_violation() {
        let (mut promised, _rx) = stream();
        promised.reserve_promised(Direction::Received).unwrap();
        assert!(promised.reserve_promised(Direction::Received).is_err());
    }

    #[test]
    #[should_panic(expected = "illegal frame for current stream state")]
    fn sending_on_idle_after_close_panics() {
        let (mut s, _rx) = stream();
        s.headers(Vec::new(), None, true);
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        s.headers(Vec::new(), None, true);
    }

    #[test]
    fn half_closed_remote_rejects_unexpected_receive() {
        let (mut s, _rx) = stream();
        s.headers(Vec::new(), None, false);
        assert_eq!(s.state(), StreamState::Open);
        s.send(Frame::Data { stream: 1, flags: DataFlags::END_STREAM, data: Bytes::new() });
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
        let err = s.receive(Frame::Headers {
            stream: 1,
            flags: HeadersFlags::empty(),
            priority: None,
            block: HeaderBlock::Decoded(Vec::new()),
        });
        assert!(err.is_err());
    }

    #[test]
    fn end_sets_flag_on_last_queued_frame_in_place() {
        let (mut s, _rx) = stream();
        s.headers(Vec::new(), None, false);
        s.write(Bytes::from_static(b"abc"));
        s.end();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        match s.flow.back_mut() {
            Some(Frame::Data { flags, data, .. }) => {
                assert!(flags.contains(DataFlags::END_STREAM));
                assert_eq!(&data[..], b"abc");
            }
            other => panic!("expected the DATA frame to carry END_STREAM in place, got {other:?}"),
        }
    }

    #[test]
    fn end_enqueues_empty_data_when_nothing_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut s = Stream::new(3, crate::types::DEFAULT_PRIORITY, 65_535, tx);
        s.headers(Vec::new(), None, false);
        let _ = s.flow.drain_forwardable();
        s.end();
        match s.flow.back_mut() {
            Some(Frame::Data { flags, .. }) => assert!(flags.contains(DataFlags::END_STREAM)),
            other => panic!("expected an empty END_STREAM DATA frame, got {other:?}"),
        }
    }

    #[test]
    fn reset_drops_queue_except_the_reset_itself() {
        let (mut s, _rx) = stream();
        s.headers(Vec::new(), None, false);
        s.write(Bytes::from_static(b"queued"));
        s.reset(ErrorCode::Cancel);
        assert_eq!(s.state(), StreamState::Closed);
        assert_eq!(s.flow.len(), 1);
        assert!(matches!(s.flow.poll_forwardable(), Some(Frame::ResetStream { .. })));
    }
}
