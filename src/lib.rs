#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::too_many_lines,
)]

mod compressor;
mod connection;
mod endpoint;
mod error;
mod flow;
mod frame;
mod hpack;
pub mod logging;
mod stream;
mod types;

pub use bytes::Bytes;
pub use connection::ConnectionEvent;
pub use endpoint::{Endpoint, StreamHandle};
pub use error::Http2Error;
pub use frame::HeaderBlock;
pub use stream::{StreamEvent, StreamNotification, StreamState};
pub use types::{
    ErrorCode, FrameType, HeaderName, HeaderValue, Headers, Role, Settings, SettingsParameter, StreamId,
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_PRIORITY,
};
