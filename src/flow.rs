//! The Flow Controller: per-instance (connection or stream) window
//! accounting, the pending-frame FIFO, and the split-on-partial-window rule.

use crate::error::FlowError;
use crate::frame::{DataFlags, Frame};
use crate::types::MAX_WINDOW_SIZE;
use std::collections::VecDeque;

/// A flow-control window: either a finite byte budget or permanently
/// unbounded, once a peer sends `WINDOW_UPDATE` with `END_FLOW_CONTROL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Finite(i64),
    Infinite,
}

impl Window {
    #[must_use]
    pub fn available(self) -> Option<i64> {
        match self {
            Window::Finite(w) => Some(w),
            Window::Infinite => None,
        }
    }
}

/// Apply a `WINDOW_UPDATE` to a standalone window value: either an
/// increment, or (with `END_FLOW_CONTROL`) a permanent switch to an
/// unbounded window. Shared by [`FlowController::apply_window_update`] and
/// the connection-level window, which has no frame queue of its own.
pub fn apply_window_update(window: &mut Window, increment: u32, end_flow_control: bool) -> Result<(), FlowError> {
    if end_flow_control {
        if *window == Window::Infinite {
            return Err(FlowError::WindowAlreadyInfinite);
        }
        *window = Window::Infinite;
        return Ok(());
    }
    match *window {
        Window::Infinite => Err(FlowError::WindowAlreadyInfinite),
        Window::Finite(w) => {
            let new_window = w + i64::from(increment);
            if new_window > MAX_WINDOW_SIZE {
                return Err(FlowError::WindowOverflow);
            }
            *window = Window::Finite(new_window);
            Ok(())
        }
    }
}

/// Window accounting plus the FIFO of frames waiting to be forwarded. Used
/// identically for a connection's overall window and for each stream's own
/// window over its own upstream queue.
#[derive(Debug)]
pub struct FlowController {
    window: Window,
    queue: VecDeque<Frame>,
}

impl FlowController {
    #[must_use]
    pub fn new(initial_window: u32) -> Self {
        Self { window: Window::Finite(i64::from(initial_window)), queue: VecDeque::new() }
    }

    #[must_use]
    pub fn window(&self) -> Window {
        self.window
    }

    pub fn enqueue(&mut self, frame: Frame) {
        self.queue.push_back(frame);
    }

    /// Put a frame back at the head of the queue. Used by the connection's
    /// outbound pump when a frame this controller already approved is then
    /// blocked by the connection-level window and must wait its turn again.
    pub fn push_front(&mut self, frame: Frame) {
        self.queue.push_front(frame);
    }

    /// The most recently enqueued frame, for the "set `END_STREAM` on the
    /// last queued frame in place" rule.
    pub fn back_mut(&mut self) -> Option<&mut Frame> {
        self.queue.back_mut()
    }

    /// Drop every pending frame, e.g. when a stream resets. The window
    /// itself is untouched.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Apply a `WINDOW_UPDATE`: either an increment, or (with
    /// `END_FLOW_CONTROL`) a permanent switch to an unbounded window.
    pub fn apply_window_update(&mut self, increment: u32, end_flow_control: bool) -> Result<(), FlowError> {
        apply_window_update(&mut self.window, increment, end_flow_control)
    }

    /// Retroactively shift an existing window by `delta` when
    /// `SETTINGS_INITIAL_WINDOW_SIZE` changes. A no-op once the
    /// window has gone unbounded.
    pub fn retroactive_adjust(&mut self, delta: i64) -> Result<(), FlowError> {
        if let Window::Finite(w) = self.window {
            let new_window = w + delta;
            if new_window > MAX_WINDOW_SIZE {
                return Err(FlowError::WindowOverflow);
            }
            self.window = Window::Finite(new_window);
        }
        Ok(())
    }

    /// Pop the next forwardable frame from the front of the queue. Non-DATA
    /// frames always bypass the window. A DATA frame whose payload exceeds
    /// the current window but fits partially is split in place: the
    /// forwardable prefix is returned and the remainder stays at the head of
    /// the queue with the window draining to zero.
    pub fn poll_forwardable(&mut self) -> Option<Frame> {
        match self.queue.front()? {
            Frame::Data { data, .. } => {
                let len = data.len() as i64;
                let available = match self.window {
                    Window::Infinite => return self.queue.pop_front(),
                    Window::Finite(w) => w,
                };
                if available >= len {
                    self.window = Window::Finite(available - len);
                    self.queue.pop_front()
                } else if available > 0 {
                    let take = available as usize;
                    let Some(Frame::Data { stream, flags, data }) = self.queue.front_mut() else {
                        unreachable!("front is still the DATA frame just matched")
                    };
                    let prefix = data.split_to(take);
                    let forwarded = Frame::Data { stream: *stream, flags: *flags & DataFlags::RESERVED, data: prefix };
                    self.window = Window::Finite(0);
                    Some(forwarded)
                } else {
                    None
                }
            }
            _ => self.queue.pop_front(),
        }
    }

    /// Drain everything currently forwardable, in order, stopping at the
    /// first frame the window blocks.
    pub fn drain_forwardable(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = self.poll_forwardable() {
            out.push(frame);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data(stream: u32, payload: &[u8]) -> Frame {
        Frame::Data { stream, flags: DataFlags::empty(), data: Bytes::copy_from_slice(payload) }
    }

    #[test]
    fn forwards_when_window_covers_whole_frame() {
        let mut fc = FlowController::new(65_535);
        fc.enqueue(data(1, b"hello"));
        let forwarded = fc.poll_forwardable().unwrap();
        assert!(matches!(forwarded, Frame::Data { .. }));
        assert_eq!(fc.window().available(), Some(65_535 - 5));
    }

    #[test]
    fn scenario_five_flow_control_split() {
        // window=5, DATA(10 bytes) splits into a 5-byte
        // forwarded prefix and a 5-byte retained tail, released by a
        // subsequent WINDOW_UPDATE(+5).
        let mut fc = FlowController::new(5);
        fc.enqueue(data(3, &[0u8; 10]));
        let first = fc.poll_forwardable();
        match first {
            Some(Frame::Data { data, .. }) => assert_eq!(data.len(), 5),
            _ => panic!("expected a split DATA frame"),
        }
        assert!(fc.poll_forwardable().is_none());
        fc.apply_window_update(5, false).unwrap();
        let second = fc.poll_forwardable().unwrap();
        match second {
            Frame::Data { data, .. } => assert_eq!(data.len(), 5),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn zero_length_data_is_forwardable_on_zero_window() {
        let mut fc = FlowController::new(0);
        fc.enqueue(data(1, b""));
        assert!(fc.poll_forwardable().is_some());
    }

    #[test]
    fn non_data_bypasses_window() {
        let mut fc = FlowController::new(0);
        fc.enqueue(Frame::GoAway { last_stream: 0, error: crate::types::ErrorCode::NoError });
        assert!(fc.poll_forwardable().is_some());
    }

    #[test]
    fn end_flow_control_makes_window_permanently_infinite() {
        let mut fc = FlowController::new(100);
        fc.apply_window_update(0, true).unwrap();
        assert_eq!(fc.window(), Window::Infinite);
        assert!(fc.apply_window_update(10, false).is_err());
    }

    #[test]
    fn window_overflow_is_rejected() {
        let mut fc = FlowController::new(MAX_WINDOW_SIZE as u32);
        assert!(fc.apply_window_update(1, false).is_err());
    }

    #[test]
    fn queue_preserves_order_behind_a_blocked_frame() {
        let mut fc = FlowController::new(0);
        fc.enqueue(data(1, b"x"));
        fc.enqueue(Frame::GoAway { last_stream: 0, error: crate::types::ErrorCode::NoError });
        // The blocked DATA frame at the head prevents the GOAWAY behind it
        // from being reordered ahead of it.
        assert!(fc.poll_forwardable().is_none());
    }
}
