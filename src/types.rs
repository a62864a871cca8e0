//! Shared value types used across every layer of the pipeline.
//!
//! Frame type codes use the draft-04 numbering, not the later RFC 7540 numbering.

use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

/// Largest legal stream ID: a 31-bit unsigned integer.
pub const U31_MAX: u32 = u32::MAX >> 1;

/// Mask applied to the wire's 32-bit stream-ID field; the top bit is reserved.
pub const STREAM_ID_MASK: u32 = U31_MAX;

/// A stream identifier. `0` is reserved for connection-scope frames.
pub type StreamId = u32;

/// A stream identifier known not to be the connection-scope ID.
pub type NonZeroStreamId = NonZeroU32;

/// Default stream priority (`Stream.priority`).
pub const DEFAULT_PRIORITY: u32 = 1 << 30;

/// Default `SETTINGS_INITIAL_WINDOW_SIZE`.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Largest legal flow-control window.
pub const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

/// Largest legal frame payload.
pub const MAX_FRAME_PAYLOAD: usize = 65_535;

/// Largest header-block chunk per wire frame.
pub const MAX_HEADER_CHUNK: usize = 16_383;

/// The client connection preface.
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Which side of the connection this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The first outbound stream ID this role allocates.
    #[must_use]
    pub fn first_outbound_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` has the parity this role is allowed to allocate.
    #[must_use]
    pub fn owns_parity(self, id: StreamId) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }

    /// The role on the other end of the wire.
    #[must_use]
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Frame type codes. `0x8` is intentionally unassigned in this draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x9,
}

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0,
    ProtocolError = 1,
    InternalError = 2,
    FlowControlError = 3,
    StreamClosed = 5,
    FrameTooLarge = 6,
    RefusedStream = 7,
    Cancel = 8,
    CompressionError = 9,
}

/// SETTINGS identifiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive, enum_map::Enum,
)]
#[repr(u16)]
pub enum SettingsParameter {
    MaxConcurrentStreams = 4,
    InitialWindowSize = 7,
    FlowControlOptions = 10,
}

/// `SETTINGS_FLOW_CONTROL_OPTIONS`'s only defined bit: disable flow
/// control for streams created *after* this SETTINGS frame is applied.
pub const FLOW_CONTROL_OPTIONS_DISABLE: u32 = 0x1;

/// A header name/value pair as carried in HEADERS/PUSH_PROMISE frame records.
pub type HeaderName = String;
pub type HeaderValue = String;

/// An ordered header list: duplicate names represent a multi-valued header.
/// Compared across a compress/decompress round trip as a bag of pairs,
/// not by sequence, since the reference-set dance may reorder entries.
pub type Headers = Vec<(HeaderName, HeaderValue)>;

/// The SETTINGS parameter table an endpoint advertises about itself, and the
/// view it keeps of what its peer has advertised. Draft-04 has no
/// persistence of SETTINGS across connections, so this is constructed fresh
/// for every `Endpoint::new` and never read from or written to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// `SETTINGS_MAX_CONCURRENT_STREAMS`. `None` means no cap advertised.
    pub max_concurrent_streams: Option<u32>,
    /// `SETTINGS_INITIAL_WINDOW_SIZE`.
    pub initial_window_size: u32,
    /// Whether `SETTINGS_FLOW_CONTROL_OPTIONS`'s disable bit is set: new
    /// streams created after this value is observed start with an
    /// unbounded window. Existing streams are unaffected.
    pub flow_control_disabled_for_new_streams: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            flow_control_disabled_for_new_streams: false,
        }
    }
}

impl Settings {
    /// Apply one received SETTINGS value to this view of the peer's table.
    /// Returns the delta to apply to every existing stream's flow-control
    /// window when `InitialWindowSize` changes (`0` otherwise).
    pub fn apply(&mut self, parameter: SettingsParameter, value: u32) -> i64 {
        match parameter {
            SettingsParameter::MaxConcurrentStreams => {
                self.max_concurrent_streams = Some(value);
                0
            }
            SettingsParameter::InitialWindowSize => {
                let delta = i64::from(value) - i64::from(self.initial_window_size);
                self.initial_window_size = value;
                delta
            }
            SettingsParameter::FlowControlOptions => {
                self.flow_control_disabled_for_new_streams = value & FLOW_CONTROL_OPTIONS_DISABLE != 0;
                0
            }
        }
    }

    /// Render as the wire-ready map a SETTINGS frame carries.
    #[must_use]
    pub fn to_wire_map(self) -> std::collections::BTreeMap<SettingsParameter, u32> {
        let mut map = std::collections::BTreeMap::new();
        if let Some(max) = self.max_concurrent_streams {
            map.insert(SettingsParameter::MaxConcurrentStreams, max);
        }
        map.insert(SettingsParameter::InitialWindowSize, self.initial_window_size);
        if self.flow_control_disabled_for_new_streams {
            map.insert(SettingsParameter::FlowControlOptions, FLOW_CONTROL_OPTIONS_DISABLE);
        }
        map
    }
}
