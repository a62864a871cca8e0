//! The Framer: bidirectional, stateless-per-frame mapping between a
//! `Frame` record and its wire form, plus the stateful `Deserializer` that
//! turns an arbitrary stream of incoming byte chunks into a sequence of
//! frames without losing partial reads across `feed()` calls.

use crate::error::{FrameError, Http2Error};
use crate::types::{ErrorCode, FrameType, SettingsParameter, StreamId, MAX_FRAME_PAYLOAD, STREAM_ID_MASK};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use std::collections::BTreeMap;

bitflags! {
    /// DATA carries no PADDED bit in this draft.
    pub struct DataFlags: u8 {
        const END_STREAM = 0x1;
        const RESERVED = 0x2;
    }

    pub struct HeadersFlags: u8 {
        const END_STREAM = 0x1;
        const RESERVED = 0x2;
        const END_HEADERS = 0x4;
        const PRIORITY = 0x8;
    }

    pub struct PushPromiseFlags: u8 {
        const END_PUSH_PROMISE = 0x4;
    }

    pub struct PingFlags: u8 {
        const PONG = 0x2;
    }

    pub struct WindowUpdateFlags: u8 {
        const END_FLOW_CONTROL = 0x1;
    }
}

/// The payload of a HEADERS or PUSH_PROMISE frame, before or after the
/// Header Compressor has run. The Framer only ever produces/consumes
/// `Fragment`; the Compressor swaps it for `Decoded` on the way in
/// and back to `Fragment` on the way out. Every other frame type passes
/// through the Compressor unchanged.
#[derive(Debug, Clone)]
pub enum HeaderBlock {
    /// Opaque, HPACK-00-compressed bytes, as seen on the wire.
    Fragment(Bytes),
    /// The decoded header list; equality across a block series is by
    /// bag-of-pairs.
    Decoded(crate::types::Headers),
}

impl HeaderBlock {
    #[must_use]
    pub fn as_fragment(&self) -> Option<&Bytes> {
        match self {
            HeaderBlock::Fragment(b) => Some(b),
            HeaderBlock::Decoded(_) => None,
        }
    }

    #[must_use]
    pub fn as_decoded(&self) -> Option<&crate::types::Headers> {
        match self {
            HeaderBlock::Decoded(h) => Some(h),
            HeaderBlock::Fragment(_) => None,
        }
    }
}

/// A single HTTP/2 frame record. Tagged sum type; each variant carries
/// exactly the fields listed for that frame type.
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream: StreamId,
        flags: DataFlags,
        data: Bytes,
    },
    Headers {
        stream: StreamId,
        flags: HeadersFlags,
        /// Present only when `flags.contains(PRIORITY)`.
        priority: Option<u32>,
        block: HeaderBlock,
    },
    Priority {
        stream: StreamId,
        priority: u32,
    },
    ResetStream {
        stream: StreamId,
        error: ErrorCode,
    },
    /// draft-04 SETTINGS carries no ACK flag: an endpoint
    /// acknowledges by sending its own SETTINGS back.
    Settings {
        values: BTreeMap<SettingsParameter, u32>,
    },
    PushPromise {
        stream: StreamId,
        flags: PushPromiseFlags,
        promised_stream: StreamId,
        block: HeaderBlock,
    },
    Ping {
        flags: PingFlags,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorCode,
    },
    WindowUpdate {
        stream: StreamId,
        flags: WindowUpdateFlags,
        increment: u32,
    },
}

impl Frame {
    /// The stream this frame belongs to; `0` for connection-scope frames.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream, .. }
            | Frame::Headers { stream, .. }
            | Frame::Priority { stream, .. }
            | Frame::ResetStream { stream, .. }
            | Frame::PushPromise { stream, .. }
            | Frame::WindowUpdate { stream, .. } => *stream,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data { .. } => FrameType::Data,
            Frame::Headers { .. } => FrameType::Headers,
            Frame::Priority { .. } => FrameType::Priority,
            Frame::ResetStream { .. } => FrameType::ResetStream,
            Frame::Settings { .. } => FrameType::Settings,
            Frame::PushPromise { .. } => FrameType::PushPromise,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::GoAway { .. } => FrameType::GoAway,
            Frame::WindowUpdate { .. } => FrameType::WindowUpdate,
        }
    }

    /// Whether this frame carries `END_STREAM`.
    #[must_use]
    pub fn end_stream(&self) -> bool {
        match self {
            Frame::Data { flags, .. } => flags.contains(DataFlags::END_STREAM),
            Frame::Headers { flags, .. } => flags.contains(HeadersFlags::END_STREAM),
            _ => false,
        }
    }

    /// Serialize into the 8-byte-header wire form. Panics if a
    /// HEADERS/PUSH_PROMISE block is still `Decoded` — that is a
    /// programming error, the Compressor must run first.
    pub fn serialize(&self) -> Result<Bytes, Http2Error> {
        let mut payload = BytesMut::new();
        let (frame_type, flags_byte, stream) = match self {
            Frame::Data { stream, flags, data } => {
                payload.extend_from_slice(data);
                (FrameType::Data, flags.bits(), *stream)
            }
            Frame::Headers { stream, flags, priority, block } => {
                if flags.contains(HeadersFlags::PRIORITY) {
                    let p = priority.expect("PRIORITY flag set without a priority value");
                    payload.put_u32(p & STREAM_ID_MASK);
                }
                let fragment = block
                    .as_fragment()
                    .expect("HEADERS frame serialized before the header block was compressed");
                payload.extend_from_slice(fragment);
                (FrameType::Headers, flags.bits(), *stream)
            }
            Frame::Priority { stream, priority } => {
                payload.put_u32(*priority & STREAM_ID_MASK);
                (FrameType::Priority, 0, *stream)
            }
            Frame::ResetStream { stream, error } => {
                payload.put_u32(error.to_u32().expect("ErrorCode fits in u32"));
                (FrameType::ResetStream, 0, *stream)
            }
            Frame::Settings { values } => {
                for (id, value) in values {
                    payload.put_u32(u32::from(id.to_u16().expect("SettingsParameter fits in u16")));
                    payload.put_u32(*value);
                }
                (FrameType::Settings, 0, 0)
            }
            Frame::PushPromise { stream, flags, promised_stream, block } => {
                payload.put_u32(*promised_stream & STREAM_ID_MASK);
                let fragment = block
                    .as_fragment()
                    .expect("PUSH_PROMISE frame serialized before the header block was compressed");
                payload.extend_from_slice(fragment);
                (FrameType::PushPromise, flags.bits(), *stream)
            }
            Frame::Ping { flags, data } => {
                payload.extend_from_slice(data);
                (FrameType::Ping, flags.bits(), 0)
            }
            Frame::GoAway { last_stream, error } => {
                payload.put_u32(*last_stream & STREAM_ID_MASK);
                payload.put_u32(error.to_u32().expect("ErrorCode fits in u32"));
                (FrameType::GoAway, 0, 0)
            }
            Frame::WindowUpdate { stream, flags, increment } => {
                payload.put_u32(*increment & STREAM_ID_MASK);
                (FrameType::WindowUpdate, flags.bits(), *stream)
            }
        };

        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge(payload.len()).into());
        }

        let mut out = BytesMut::with_capacity(8 + payload.len());
        out.put_u16(payload.len() as u16);
        out.put_u8(frame_type.to_u8().expect("FrameType fits in u8"));
        out.put_u8(flags_byte);
        out.put_u32(stream & STREAM_ID_MASK);
        out.extend_from_slice(&payload);
        Ok(out.freeze())
    }
}

/// The parsed fixed 8-byte common header, before the type-specific payload
/// rules are applied.
#[derive(Debug, Clone, Copy)]
struct RawHeader {
    header_length: u16,
    frame_type: u8,
    flags: u8,
    stream: StreamId,
}

fn decode_payload(header: RawHeader, payload: Bytes) -> Result<Option<Frame>, Http2Error> {
    let Some(frame_type) = FrameType::from_u8(header.frame_type) else {
        // Unknown type codes are silently ignored; the bytes were already consumed.
        return Ok(None);
    };

    let frame = match frame_type {
        FrameType::Data => Frame::Data {
            stream: header.stream,
            flags: DataFlags::from_bits_truncate(header.flags),
            data: payload,
        },
        FrameType::Headers => {
            let flags = HeadersFlags::from_bits_truncate(header.flags);
            let mut cursor = payload;
            let priority = if flags.contains(HeadersFlags::PRIORITY) {
                if cursor.len() < 4 {
                    return Err(Http2Error::connection(ErrorCode::ProtocolError));
                }
                Some(cursor.get_u32() & STREAM_ID_MASK)
            } else {
                None
            };
            Frame::Headers {
                stream: header.stream,
                flags,
                priority,
                block: HeaderBlock::Fragment(cursor),
            }
        }
        FrameType::Priority => {
            if payload.len() != 4 {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            let mut cursor = payload;
            Frame::Priority {
                stream: header.stream,
                priority: cursor.get_u32() & STREAM_ID_MASK,
            }
        }
        FrameType::ResetStream => {
            if payload.len() != 4 {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            let mut cursor = payload;
            let raw = cursor.get_u32();
            let error = ErrorCode::from_u32(raw).ok_or_else(|| Http2Error::connection(ErrorCode::ProtocolError))?;
            Frame::ResetStream { stream: header.stream, error }
        }
        FrameType::Settings => {
            if payload.len() % 8 != 0 {
                return Err(FrameError::MalformedSettings(payload.len()).into());
            }
            let mut values = BTreeMap::new();
            let mut cursor = payload;
            while cursor.has_remaining() {
                let id = cursor.get_u32();
                let value = cursor.get_u32();
                if let Some(param) = SettingsParameter::from_u32(id) {
                    // First value for a duplicated ID wins.
                    values.entry(param).or_insert(value);
                }
            }
            Frame::Settings { values }
        }
        FrameType::PushPromise => {
            if payload.len() < 4 {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            let mut cursor = payload;
            let promised_stream = cursor.get_u32() & STREAM_ID_MASK;
            Frame::PushPromise {
                stream: header.stream,
                flags: PushPromiseFlags::from_bits_truncate(header.flags),
                promised_stream,
                block: HeaderBlock::Fragment(cursor),
            }
        }
        FrameType::Ping => {
            if payload.len() != 8 {
                return Err(FrameError::BadPingLength(payload.len()).into());
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            Frame::Ping {
                flags: PingFlags::from_bits_truncate(header.flags),
                data,
            }
        }
        FrameType::GoAway => {
            if payload.len() != 8 {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            let mut cursor = payload;
            let last_stream = cursor.get_u32() & STREAM_ID_MASK;
            let raw = cursor.get_u32();
            let error = ErrorCode::from_u32(raw).ok_or_else(|| Http2Error::connection(ErrorCode::ProtocolError))?;
            Frame::GoAway { last_stream, error }
        }
        FrameType::WindowUpdate => {
            if payload.len() != 4 {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            let mut cursor = payload;
            let increment = cursor.get_u32() & STREAM_ID_MASK;
            Frame::WindowUpdate {
                stream: header.stream,
                flags: WindowUpdateFlags::from_bits_truncate(header.flags),
                increment,
            }
        }
    };
    let _ = header.header_length;
    Ok(Some(frame))
}

/// The two phases a stateful frame deserializer alternates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Header,
    Payload { header_length: u16, frame_type: u8, flags: u8, stream: StreamId },
}

/// Turns an arbitrary sequence of incoming byte chunks into a sequence of
/// `Frame`s, preserving partial reads across calls to `feed`. Once
/// `poll` has returned an `Err` the deserializer is poisoned: every
/// subsequent call returns the same error without touching the buffer, since
/// recovery from a malformed payload is only possible via connection
/// teardown.
#[derive(Debug)]
pub struct Deserializer {
    buf: BytesMut,
    phase: ReadPhase,
    poisoned: Option<ErrorCode>,
}

impl Default for Deserializer {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            phase: ReadPhase::Header,
            poisoned: None,
        }
    }
}

impl Deserializer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly-arrived transport bytes, of any size, to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode and return the next complete frame, or `None` if more bytes are
    /// needed. Unknown frame types are consumed and skipped without being
    /// returned; callers should loop until `None` to drain everything
    /// currently decodable.
    pub fn poll(&mut self) -> Result<Option<Frame>, Http2Error> {
        if let Some(code) = self.poisoned {
            return Err(Http2Error::connection(code));
        }
        loop {
            match self.phase {
                ReadPhase::Header => {
                    if self.buf.len() < 8 {
                        return Ok(None);
                    }
                    let mut header = self.buf.split_to(8);
                    let header_length = header.get_u16();
                    let frame_type = header.get_u8();
                    let flags = header.get_u8();
                    let stream = header.get_u32() & STREAM_ID_MASK;
                    self.phase = ReadPhase::Payload { header_length, frame_type, flags, stream };
                }
                ReadPhase::Payload { header_length, frame_type, flags, stream } => {
                    let length = header_length as usize;
                    if self.buf.len() < length {
                        return Ok(None);
                    }
                    let payload = self.buf.split_to(length).freeze();
                    self.phase = ReadPhase::Header;
                    let raw = RawHeader { header_length, frame_type, flags, stream };
                    return match decode_payload(raw, payload) {
                        Ok(maybe_frame) => Ok(maybe_frame),
                        Err(err) => {
                            self.poisoned = Some(err.code());
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Decode every frame currently available in the buffer.
    pub fn drain(&mut self) -> Result<Vec<Frame>, Http2Error> {
        let mut frames = Vec::new();
        while let Some(frame) = self.poll()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_round_trip() {
        let frame = Frame::Data {
            stream: 3,
            flags: DataFlags::END_STREAM,
            data: Bytes::from_static(b"12345678"),
        };
        let wire = frame.serialize().unwrap();
        let mut de = Deserializer::new();
        de.feed(&wire);
        let decoded = de.poll().unwrap().unwrap();
        match decoded {
            Frame::Data { stream, flags, data } => {
                assert_eq!(stream, 3);
                assert!(flags.contains(DataFlags::END_STREAM));
                assert_eq!(&data[..], b"12345678");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn feed_arbitrary_chunk_boundaries() {
        let frame = Frame::Ping { flags: PingFlags::empty(), data: *b"abcdefgh" };
        let wire = frame.serialize().unwrap();
        let mut de = Deserializer::new();
        for b in wire.iter() {
            de.feed(&[*b]);
        }
        let decoded = de.poll().unwrap().unwrap();
        assert!(matches!(decoded, Frame::Ping { .. }));
    }

    #[test]
    fn settings_duplicate_id_first_wins() {
        use crate::types::SettingsParameter::InitialWindowSize;
        let mut payload = BytesMut::new();
        payload.put_u32(InitialWindowSize as u32);
        payload.put_u32(111);
        payload.put_u32(InitialWindowSize as u32);
        payload.put_u32(222);
        let mut wire = BytesMut::new();
        wire.put_u16(payload.len() as u16);
        wire.put_u8(FrameType::Settings.to_u8().unwrap());
        wire.put_u8(0);
        wire.put_u32(0);
        wire.extend_from_slice(&payload);

        let mut de = Deserializer::new();
        de.feed(&wire);
        let frame = de.poll().unwrap().unwrap();
        match frame {
            Frame::Settings { values } => assert_eq!(values[&InitialWindowSize], 111),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn settings_unknown_id_ignored() {
        let mut payload = BytesMut::new();
        payload.put_u32(0xFFFF);
        payload.put_u32(42);
        let mut wire = BytesMut::new();
        wire.put_u16(payload.len() as u16);
        wire.put_u8(FrameType::Settings.to_u8().unwrap());
        wire.put_u8(0);
        wire.put_u32(0);
        wire.extend_from_slice(&payload);

        let mut de = Deserializer::new();
        de.feed(&wire);
        let frame = de.poll().unwrap().unwrap();
        match frame {
            Frame::Settings { values } => assert!(values.is_empty()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ping_wrong_length_is_protocol_error() {
        let mut wire = BytesMut::new();
        wire.put_u16(4);
        wire.put_u8(FrameType::Ping.to_u8().unwrap());
        wire.put_u8(0);
        wire.put_u32(0);
        wire.extend_from_slice(&[1, 2, 3, 4]);

        let mut de = Deserializer::new();
        de.feed(&wire);
        let err = de.poll().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
        assert!(de.poll().is_err());
    }

    #[test]
    fn unknown_frame_type_is_silently_skipped_but_consumed() {
        let mut wire = BytesMut::new();
        wire.put_u16(3);
        wire.put_u8(0xEE);
        wire.put_u8(0);
        wire.put_u32(0);
        wire.extend_from_slice(b"xyz");
        wire.extend_from_slice(&Frame::Ping { flags: PingFlags::PONG, data: *b"12345678" }.serialize().unwrap());

        let mut de = Deserializer::new();
        de.feed(&wire);
        let first = de.poll().unwrap();
        assert!(matches!(first, Some(Frame::Ping { .. })));
    }

    #[test]
    fn frame_too_large_is_rejected() {
        let frame = Frame::Data {
            stream: 1,
            flags: DataFlags::empty(),
            data: Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]),
        };
        assert!(frame.serialize().is_err());
    }

    #[test]
    fn headers_with_priority_round_trip() {
        let block = HeaderBlock::Fragment(Bytes::from_static(b"\x82"));
        let frame = Frame::Headers {
            stream: 1,
            flags: HeadersFlags::END_HEADERS | HeadersFlags::PRIORITY,
            priority: Some(42),
            block,
        };
        let wire = frame.serialize().unwrap();
        let mut de = Deserializer::new();
        de.feed(&wire);
        match de.poll().unwrap().unwrap() {
            Frame::Headers { priority, block, .. } => {
                assert_eq!(priority, Some(42));
                assert_eq!(block.as_fragment().unwrap().as_ref(), b"\x82");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn window_update_allows_stream_zero() {
        let frame = Frame::WindowUpdate { stream: 0, flags: WindowUpdateFlags::empty(), increment: 5 };
        let wire = frame.serialize().unwrap();
        let mut de = Deserializer::new();
        de.feed(&wire);
        match de.poll().unwrap().unwrap() {
            Frame::WindowUpdate { stream, increment, .. } => {
                assert_eq!(stream, 0);
                assert_eq!(increment, 5);
            }
            _ => panic!("wrong variant"),
        }
    }
}
