//! Server-Sent-Events reader for the chat, ask and transformation endpoints.
//!
//! Only `data: ` lines carry content; everything else on the wire is skipped.

mod frame;
mod reader;

pub use frame::{DATA_PREFIX, DONE_SENTINEL, StreamFrame, parse_line};
pub use reader::{
    DEFAULT_STREAM_BUFFER, FrameStream, LineDecoder, LineTooLong, MAX_LINE_LENGTH,
};
