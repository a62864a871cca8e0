//! The library's error types.
//!
//! Three shapes: connection-fatal (GOAWAY + teardown), stream-scoped
//! (RST_STREAM + drop that stream, others unaffected), and local
//! programming errors, which are not represented here at all — they
//! `panic!` at the call site because no frame is ever emitted for them.

use crate::types::{ErrorCode, StreamId};
use thiserror::Error;

/// Failures raised while turning bytes into frames or frames into bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds the 65535-byte limit")]
    TooLarge(usize),
    #[error("SETTINGS payload length {0} is not a multiple of 8")]
    MalformedSettings(usize),
    #[error("PING payload must be exactly 8 bytes, got {0}")]
    BadPingLength(usize),
    #[error("unknown error code {0}")]
    UnknownErrorCode(u32),
}

/// Failures raised while encoding or decoding a header block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("indexed representation referenced out-of-range index {0}")]
    IndexOutOfRange(usize),
    #[error("a HEADERS/PUSH_PROMISE series was interleaved with frame type {0:?} on stream {1}")]
    InterleavedSeries(crate::types::FrameType, StreamId),
    #[error("a HEADERS/PUSH_PROMISE series was interleaved with a frame for stream {0}, expected stream {1}")]
    InterleavedStream(StreamId, StreamId),
    #[error("malformed integer or string encoding in header block")]
    MalformedEncoding,
}

/// Failures raised by the flow controller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow-control window would exceed 2^31-1")]
    WindowOverflow,
    #[error("flow-control window was already unbounded and cannot become finite again")]
    WindowAlreadyInfinite,
}

/// The library's unified error type.
#[derive(Debug, Error)]
pub enum Http2Error {
    /// The connection as a whole must send GOAWAY with this code and tear down.
    #[error("connection error: {0:?}")]
    Connection(ErrorCode),

    /// Only the named stream is affected; RST_STREAM is sent and the stream dropped.
    #[error("stream {stream} error: {code:?}")]
    Stream { stream: StreamId, code: ErrorCode },
}

impl Http2Error {
    /// The connection-fatal constructor.
    #[must_use]
    pub fn connection(code: ErrorCode) -> Self {
        Http2Error::Connection(code)
    }

    /// The stream-scoped constructor.
    #[must_use]
    pub fn stream(stream: StreamId, code: ErrorCode) -> Self {
        Http2Error::Stream { stream, code }
    }

    /// The wire error code this failure carries.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Http2Error::Connection(code) => *code,
            Http2Error::Stream { code, .. } => *code,
        }
    }

    /// Whether this error tears down the whole connection (vs. just one stream).
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Http2Error::Connection(_))
    }
}

impl From<FrameError> for Http2Error {
    fn from(err: FrameError) -> Self {
        let code = match err {
            FrameError::TooLarge(_) => ErrorCode::FrameTooLarge,
            FrameError::MalformedSettings(_) | FrameError::BadPingLength(_) => ErrorCode::ProtocolError,
            FrameError::UnknownErrorCode(_) => ErrorCode::ProtocolError,
        };
        Http2Error::Connection(code)
    }
}

impl From<CompressionError> for Http2Error {
    fn from(_: CompressionError) -> Self {
        Http2Error::Connection(ErrorCode::CompressionError)
    }
}

impl From<FlowError> for Http2Error {
    fn from(_: FlowError) -> Self {
        Http2Error::Connection(ErrorCode::FlowControlError)
    }
}

pub type Result<T> = std::result::Result<T, Http2Error>;
