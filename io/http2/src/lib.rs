//! http2 - callback-driven HTTP/2 client protocol engine.
//!
//! This crate provides the protocol half of an HTTP/2 client connection,
//! designed for evented, non-async I/O: the caller feeds raw bytes in with
//! [`session::ClientSession::recv`], drains outgoing frames with
//! [`session::ClientSession::send`], and observes protocol events through the
//! [`session::SessionHandler`] callbacks. Socket ownership, timers, and TLS
//! stay with the caller.
//!
//! Modules:
//!
//! - `frame`: frame types, encoding, and incremental decoding
//! - `hpack`: HPACK header compression (RFC 7541)
//! - `session`: the client session state machine and callback surface

pub mod frame;
pub mod hpack;
pub mod session;

pub use frame::{
    CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, ErrorCode,
    FRAME_HEADER_SIZE, Frame, FrameDecoder, FrameEncoder, FrameError, Priority, Setting, SettingId,
};

pub use hpack::{HeaderField, HpackDecoder, HpackEncoder, HpackError};

pub use session::{
    BodyChunk, BodyProvider, CallbackError, CallbackResult, ClientSession, FrameEvent,
    HeadersCategory, SessionCore, SessionError, SessionHandler, SessionOptions, SubmitError,
};
