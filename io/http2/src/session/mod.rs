//! Client-mode HTTP/2 session engine.
//!
//! The session is sans-I/O: [`ClientSession::recv`] consumes raw bytes from
//! the transport and fires [`SessionHandler`] callbacks; [`ClientSession::send`]
//! yields the next encoded frame for the transport to write. Every callback
//! receives a [`SessionCore`] so it can submit RST_STREAM, WINDOW_UPDATE, or
//! other frames while the session is mid-parse.
//!
//! Flow control is manual on the receive side: the handler (or the caller)
//! must return credit with [`SessionCore::consume`] after application data
//! has been dealt with; the engine never refunds windows on its own except
//! for padding and data on dead streams.

mod core;
mod stream;

pub use self::core::SessionCore;

use crate::frame::{
    DataFrame, ErrorCode, Frame, FrameDecoder, FrameError, MAX_WINDOW_SIZE, PingFrame, Priority,
    Setting, SettingId, SettingsFrame,
};
use crate::hpack::{HeaderField, HpackDecoder, HpackError};

use bytes::{Bytes, BytesMut};
use std::fmt;

/// Where a HEADERS block sits in the request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersCategory {
    /// Request headers we send.
    Request,
    /// First response block on a stream.
    Response,
    /// A subsequent block: trailers, or the final response after a 1xx.
    Trailers,
    /// Headers on a pushed stream (never delivered; push is refused).
    PushResponse,
}

/// A protocol event, delivered on receive and on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    Data {
        stream_id: u32,
        end_stream: bool,
    },
    Headers {
        stream_id: u32,
        category: HeadersCategory,
        end_stream: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
    },
    Ping {
        ack: bool,
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
}

/// How a callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackError {
    /// Abandon delivery for this stream; the session continues.
    Temporal,
    /// The session is unusable; `recv`/`send` return an error.
    Fatal,
}

pub type CallbackResult = Result<(), CallbackError>;

/// The callback surface driven by the engine.
///
/// All methods default to "ignore"; implementations override what they
/// observe. Callbacks must tolerate ids for unknown or closed streams.
pub trait SessionHandler {
    fn on_begin_headers(
        &mut self,
        _stream_id: u32,
        _category: HeadersCategory,
        _core: &mut SessionCore,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_header(
        &mut self,
        _stream_id: u32,
        _category: HeadersCategory,
        _field: &HeaderField,
        _core: &mut SessionCore,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_frame_recv(&mut self, _event: &FrameEvent, _core: &mut SessionCore) -> CallbackResult {
        Ok(())
    }

    fn on_data_chunk(
        &mut self,
        _stream_id: u32,
        _data: &[u8],
        _end_stream: bool,
        _core: &mut SessionCore,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_frame_send(&mut self, _event: &FrameEvent, _core: &mut SessionCore) -> CallbackResult {
        Ok(())
    }

    /// A queued frame was dropped instead of sent (e.g. a request HEADERS
    /// refused by a received GOAWAY).
    fn on_frame_not_send(&mut self, _event: &FrameEvent, _core: &mut SessionCore) -> CallbackResult {
        Ok(())
    }

    fn on_stream_close(
        &mut self,
        _stream_id: u32,
        _error_code: ErrorCode,
        _core: &mut SessionCore,
    ) -> CallbackResult {
        Ok(())
    }
}

/// One read from a request body provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyChunk {
    /// `len` bytes were written into the buffer; `end` closes the stream.
    Data { len: usize, end: bool },
    /// Nothing to send until `resume_data` is called.
    Deferred,
}

/// Supplies the request body for a stream, pulled by the send path as
/// flow control allows.
pub trait BodyProvider {
    fn read(&mut self, buf: &mut [u8]) -> BodyChunk;
}

/// Session-fatal errors.
#[derive(Debug)]
pub enum SessionError {
    Frame(FrameError),
    Hpack(HpackError),
    /// A callback reported a fatal failure.
    Callback,
    Protocol(&'static str),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Frame(e) => write!(f, "framing error: {e}"),
            SessionError::Hpack(e) => write!(f, "header compression error: {e}"),
            SessionError::Callback => write!(f, "fatal callback failure"),
            SessionError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        SessionError::Frame(e)
    }
}

impl From<HpackError> for SessionError {
    fn from(e: HpackError) -> Self {
        SessionError::Hpack(e)
    }
}

/// Errors from submission entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// GOAWAY sent or received; no new streams.
    SessionClosing,
    /// Client stream ids exhausted.
    StreamsExhausted,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::SessionClosing => write!(f, "session is closing"),
            SubmitError::StreamsExhausted => write!(f, "stream ids exhausted"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Construction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Pad outgoing DATA frames to a 16-byte boundary.
    pub padding: bool,
}

/// A header block being assembled across HEADERS/CONTINUATION frames.
struct PendingBlock {
    stream_id: u32,
    /// Set when the block arrived in a PUSH_PROMISE.
    promised: Option<u32>,
    end_stream: bool,
    fragment: BytesMut,
}

/// The client session engine.
pub struct ClientSession {
    decoder: FrameDecoder,
    hpack_dec: HpackDecoder,
    buf: BytesMut,
    block: Option<PendingBlock>,
    core: SessionCore,
}

impl ClientSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            hpack_dec: HpackDecoder::new(),
            buf: BytesMut::with_capacity(16 * 1024),
            block: None,
            core: SessionCore::new(options.padding),
        }
    }

    // -- submission surface (mirrors SessionCore for use outside callbacks) --

    pub fn submit_request(
        &mut self,
        priority: Option<Priority>,
        headers: &[HeaderField],
        body: Option<Box<dyn BodyProvider>>,
    ) -> Result<u32, SubmitError> {
        self.core.submit_request(priority, headers, body)
    }

    pub fn submit_rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) {
        self.core.submit_rst_stream(stream_id, error_code);
    }

    pub fn submit_priority(&mut self, stream_id: u32, priority: Priority) {
        self.core.submit_priority(stream_id, priority);
    }

    /// Queue SETTINGS and apply the receive-side values locally
    /// (decoder frame size, HPACK table bound, window bookkeeping).
    pub fn submit_settings(&mut self, settings: &[Setting]) {
        for setting in settings {
            match setting.id {
                SettingId::HeaderTableSize => {
                    self.hpack_dec.set_max_table_size(setting.value as usize);
                }
                SettingId::MaxFrameSize => {
                    self.decoder.set_max_frame_size(setting.value);
                }
                _ => {}
            }
        }
        self.core.submit_settings(settings);
    }

    pub fn submit_ping(&mut self) {
        self.core.submit_ping();
    }

    pub fn submit_window_update(&mut self, stream_id: u32, increment: u32) {
        self.core.submit_window_update(stream_id, increment);
    }

    pub fn terminate(&mut self, error_code: ErrorCode) {
        self.core.terminate(error_code);
    }

    pub fn resume_data(&mut self, stream_id: u32) {
        self.core.resume_data(stream_id);
    }

    pub fn consume(&mut self, stream_id: u32, len: usize) {
        self.core.consume(stream_id, len);
    }

    pub fn open_streams(&self) -> usize {
        self.core.open_streams()
    }

    /// False once the session is finished receiving: terminated, or a
    /// GOAWAY arrived and every stream has drained.
    pub fn want_read(&self) -> bool {
        if self.core.term {
            return false;
        }
        !(self.core.goaway_recv.is_some() && self.core.streams.is_empty())
    }

    /// True while queued frames or ready body data remain.
    pub fn want_write(&self) -> bool {
        !self.core.outbox.is_empty() || (!self.core.term && self.core.has_pending_data())
    }

    // -- receive path --

    /// Feed transport bytes; fires callbacks for every completed frame.
    /// Returns the number of bytes accepted (always the full input).
    pub fn recv(
        &mut self,
        data: &[u8],
        handler: &mut impl SessionHandler,
    ) -> Result<usize, SessionError> {
        self.buf.extend_from_slice(data);
        loop {
            match self.decoder.decode(&mut self.buf)? {
                Some(frame) => self.handle_frame(frame, handler)?,
                None => break,
            }
        }
        Ok(data.len())
    }

    /// Pop the next encoded frame to transmit, generating DATA from body
    /// providers as flow control allows. `None` when idle.
    pub fn send(
        &mut self,
        handler: &mut impl SessionHandler,
    ) -> Result<Option<Bytes>, SessionError> {
        loop {
            let out = match self.core.outbox.pop_front() {
                Some(out) => out,
                None if self.core.term => return Ok(None),
                None => match self.core.pop_data_frame() {
                    Some(out) => out,
                    None => return Ok(None),
                },
            };

            if let FrameEvent::Headers {
                stream_id,
                category: HeadersCategory::Request,
                ..
            } = out.event
            {
                let refused = self.core.term
                    || self
                        .core
                        .goaway_recv
                        .is_some_and(|last| stream_id > last);
                if refused {
                    if handler.on_frame_not_send(&out.event, &mut self.core)
                        == Err(CallbackError::Fatal)
                    {
                        return Err(SessionError::Callback);
                    }
                    // The handler has dropped its per-stream state in
                    // on_frame_not_send; no close callback follows.
                    self.core.streams.remove(&stream_id);
                    continue;
                }
            }

            if handler.on_frame_send(&out.event, &mut self.core) == Err(CallbackError::Fatal) {
                return Err(SessionError::Callback);
            }

            match out.event {
                FrameEvent::RstStream {
                    stream_id,
                    error_code,
                } => {
                    self.close_stream(stream_id, error_code, handler)?;
                }
                FrameEvent::Data {
                    stream_id,
                    end_stream: true,
                } => {
                    let done = self
                        .core
                        .streams
                        .get(&stream_id)
                        .is_some_and(|rec| rec.remote_closed);
                    if done {
                        self.close_stream(stream_id, ErrorCode::NoError, handler)?;
                    }
                }
                _ => {}
            }

            return Ok(Some(out.bytes));
        }
    }

    // -- frame dispatch --

    fn handle_frame(
        &mut self,
        frame: Frame,
        handler: &mut impl SessionHandler,
    ) -> Result<(), SessionError> {
        if self.block.is_some() {
            let Frame::Continuation(c) = frame else {
                return Err(SessionError::Protocol("frame interleaved in header block"));
            };
            let finished = match self.block.as_mut() {
                Some(block) if block.stream_id == c.stream_id => {
                    block.fragment.extend_from_slice(&c.fragment);
                    c.end_headers
                }
                _ => return Err(SessionError::Protocol("CONTINUATION on the wrong stream")),
            };
            if finished {
                if let Some(block) = self.block.take() {
                    self.finish_header_block(block, handler)?;
                }
            }
            return Ok(());
        }

        match frame {
            Frame::Data(f) => self.handle_data(f, handler),
            Frame::Headers(f) => {
                let pending = PendingBlock {
                    stream_id: f.stream_id,
                    promised: None,
                    end_stream: f.end_stream,
                    fragment: BytesMut::from(&f.fragment[..]),
                };
                if f.end_headers {
                    self.finish_header_block(pending, handler)
                } else {
                    self.block = Some(pending);
                    Ok(())
                }
            }
            Frame::PushPromise(f) => {
                let pending = PendingBlock {
                    stream_id: f.stream_id,
                    promised: Some(f.promised_stream_id),
                    end_stream: false,
                    fragment: BytesMut::from(&f.fragment[..]),
                };
                if f.end_headers {
                    self.finish_header_block(pending, handler)
                } else {
                    self.block = Some(pending);
                    Ok(())
                }
            }
            Frame::Continuation(_) => {
                Err(SessionError::Protocol("CONTINUATION without open header block"))
            }
            Frame::Priority(f) => self.deliver(
                FrameEvent::Priority {
                    stream_id: f.stream_id,
                },
                handler,
            ),
            Frame::RstStream(f) => {
                self.deliver(
                    FrameEvent::RstStream {
                        stream_id: f.stream_id,
                        error_code: f.error_code,
                    },
                    handler,
                )?;
                self.close_stream(f.stream_id, f.error_code, handler)
            }
            Frame::Settings(f) => self.handle_settings(f, handler),
            Frame::Ping(f) => {
                if !f.ack {
                    self.core.push_frame(
                        FrameEvent::Ping { ack: true },
                        &Frame::Ping(PingFrame {
                            ack: true,
                            opaque: f.opaque,
                        }),
                    );
                }
                self.deliver(FrameEvent::Ping { ack: f.ack }, handler)
            }
            Frame::GoAway(f) => {
                self.core.goaway_recv = Some(f.last_stream_id);
                self.deliver(
                    FrameEvent::GoAway {
                        last_stream_id: f.last_stream_id,
                        error_code: f.error_code,
                    },
                    handler,
                )
            }
            Frame::WindowUpdate(f) => {
                if f.stream_id == 0 {
                    let grown = self.core.send_window as i64 + f.increment as i64;
                    if grown > MAX_WINDOW_SIZE as i64 {
                        return Err(SessionError::Protocol("connection window overflow"));
                    }
                    self.core.send_window = grown as i32;
                } else {
                    let overflow = match self.core.streams.get_mut(&f.stream_id) {
                        Some(rec) => {
                            let grown = rec.send_window as i64 + f.increment as i64;
                            if grown > MAX_WINDOW_SIZE as i64 {
                                true
                            } else {
                                rec.send_window = grown as i32;
                                false
                            }
                        }
                        None => false,
                    };
                    if overflow {
                        self.core
                            .submit_rst_stream(f.stream_id, ErrorCode::FlowControlError);
                    }
                }
                self.deliver(
                    FrameEvent::WindowUpdate {
                        stream_id: f.stream_id,
                        increment: f.increment,
                    },
                    handler,
                )
            }
            Frame::Unknown { .. } => Ok(()),
        }
    }

    fn handle_data(
        &mut self,
        f: DataFrame,
        handler: &mut impl SessionHandler,
    ) -> Result<(), SessionError> {
        let sid = f.stream_id;

        // Padding never reaches the application; refund it right away.
        let padding = f.flow_len as usize - f.data.len();
        if padding > 0 {
            self.core.consume(sid, padding);
        }

        let deliverable = match self.core.streams.get(&sid) {
            Some(rec) => !rec.ignore,
            None => {
                if sid >= self.core.next_stream_id || sid.is_multiple_of(2) {
                    return Err(SessionError::Protocol("DATA on a stream we never opened"));
                }
                false
            }
        };

        if deliverable {
            if !f.data.is_empty() {
                match handler.on_data_chunk(sid, &f.data, f.end_stream, &mut self.core) {
                    Ok(()) => {}
                    Err(CallbackError::Temporal) => self.core.set_ignore(sid),
                    Err(CallbackError::Fatal) => return Err(SessionError::Callback),
                }
            }
            if !self.core.is_ignored(sid) {
                self.deliver(
                    FrameEvent::Data {
                        stream_id: sid,
                        end_stream: f.end_stream,
                    },
                    handler,
                )?;
            }
        } else {
            // Dead stream: hand the credit straight back.
            self.core.consume(sid, f.data.len());
        }

        if f.end_stream {
            self.mark_remote_closed(sid, handler)?;
        }
        Ok(())
    }

    fn handle_settings(
        &mut self,
        f: SettingsFrame,
        handler: &mut impl SessionHandler,
    ) -> Result<(), SessionError> {
        if f.ack {
            return self.deliver(FrameEvent::Settings { ack: true }, handler);
        }

        for setting in &f.settings {
            match setting.id {
                SettingId::HeaderTableSize => {
                    self.core.hpack_enc.set_table_size(setting.value as usize);
                }
                SettingId::InitialWindowSize => {
                    let delta = setting.value as i64 - self.core.remote_initial_window as i64;
                    for rec in self.core.streams.values_mut() {
                        rec.send_window = (rec.send_window as i64 + delta) as i32;
                    }
                    self.core.remote_initial_window = setting.value;
                }
                SettingId::MaxFrameSize => {
                    self.core.encoder.set_max_frame_size(setting.value);
                }
                SettingId::MaxConcurrentStreams => {
                    self.core.remote_max_streams = setting.value;
                }
                _ => {}
            }
        }

        self.core.push_frame(
            FrameEvent::Settings { ack: true },
            &Frame::Settings(SettingsFrame {
                ack: true,
                settings: Vec::new(),
            }),
        );
        self.deliver(FrameEvent::Settings { ack: false }, handler)
    }

    fn finish_header_block(
        &mut self,
        block: PendingBlock,
        handler: &mut impl SessionHandler,
    ) -> Result<(), SessionError> {
        // The block must always run through the HPACK decoder to keep the
        // dynamic table in sync, even when nothing gets delivered.
        let fields = self.hpack_dec.decode(&block.fragment)?;

        if let Some(promised_stream_id) = block.promised {
            return self.deliver(
                FrameEvent::PushPromise {
                    stream_id: block.stream_id,
                    promised_stream_id,
                },
                handler,
            );
        }

        let sid = block.stream_id;
        let category = match self.core.streams.get_mut(&sid) {
            Some(rec) => {
                let category = if rec.got_headers {
                    HeadersCategory::Trailers
                } else {
                    HeadersCategory::Response
                };
                rec.got_headers = true;
                category
            }
            None => {
                if sid >= self.core.next_stream_id || sid.is_multiple_of(2) {
                    return Err(SessionError::Protocol("HEADERS on a stream we never opened"));
                }
                // Closed stream; block decoded above, nothing to deliver.
                return Ok(());
            }
        };

        if !self.core.is_ignored(sid) {
            match handler.on_begin_headers(sid, category, &mut self.core) {
                Ok(()) => {}
                Err(CallbackError::Temporal) => self.core.set_ignore(sid),
                Err(CallbackError::Fatal) => return Err(SessionError::Callback),
            }
        }

        for field in &fields {
            if self.core.is_ignored(sid) {
                break;
            }
            match handler.on_header(sid, category, field, &mut self.core) {
                Ok(()) => {}
                Err(CallbackError::Temporal) => self.core.set_ignore(sid),
                Err(CallbackError::Fatal) => return Err(SessionError::Callback),
            }
        }

        if !self.core.is_ignored(sid) {
            self.deliver(
                FrameEvent::Headers {
                    stream_id: sid,
                    category,
                    end_stream: block.end_stream,
                },
                handler,
            )?;
        }

        if block.end_stream {
            self.mark_remote_closed(sid, handler)?;
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        event: FrameEvent,
        handler: &mut impl SessionHandler,
    ) -> Result<(), SessionError> {
        match handler.on_frame_recv(&event, &mut self.core) {
            Ok(()) | Err(CallbackError::Temporal) => Ok(()),
            Err(CallbackError::Fatal) => Err(SessionError::Callback),
        }
    }

    fn mark_remote_closed(
        &mut self,
        stream_id: u32,
        handler: &mut impl SessionHandler,
    ) -> Result<(), SessionError> {
        let fully_closed = match self.core.streams.get_mut(&stream_id) {
            Some(rec) => {
                rec.remote_closed = true;
                rec.local_closed
            }
            None => false,
        };
        if fully_closed {
            self.close_stream(stream_id, ErrorCode::NoError, handler)?;
        }
        Ok(())
    }

    fn close_stream(
        &mut self,
        stream_id: u32,
        error_code: ErrorCode,
        handler: &mut impl SessionHandler,
    ) -> Result<(), SessionError> {
        if self.core.streams.remove(&stream_id).is_some()
            && handler.on_stream_close(stream_id, error_code, &mut self.core)
                == Err(CallbackError::Fatal)
        {
            return Err(SessionError::Callback);
        }
        Ok(())
    }
}
