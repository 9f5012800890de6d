//! Submission side of the client session.
//!
//! `SessionCore` owns the streams, flow-control accounting, and the frame
//! outbox. It is handed to every [`super::SessionHandler`] callback so the
//! handler can submit frames re-entrantly while the session is mid-parse.

use super::stream::StreamRec;
use super::{BodyProvider, FrameEvent, HeadersCategory, SubmitError};
use crate::frame::{
    DEFAULT_INITIAL_WINDOW_SIZE, ErrorCode, Frame, FrameEncoder, GoAwayFrame, HeadersFrame,
    MAX_WINDOW_SIZE, PingFrame, Priority, PriorityFrame, RstStreamFrame, Setting, SettingId,
    SettingsFrame, WindowUpdateFrame,
};
use crate::hpack::{HeaderField, HpackEncoder};

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

/// A frame queued for transmission, with the event describing it.
pub(crate) struct Outgoing {
    pub(crate) event: FrameEvent,
    pub(crate) bytes: Bytes,
}

pub struct SessionCore {
    pub(crate) encoder: FrameEncoder,
    pub(crate) hpack_enc: HpackEncoder,
    pub(crate) streams: HashMap<u32, StreamRec>,
    pub(crate) next_stream_id: u32,
    pub(crate) outbox: VecDeque<Outgoing>,

    /// Connection-level send credit granted by the peer.
    pub(crate) send_window: i32,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE for new streams.
    pub(crate) remote_initial_window: u32,
    pub(crate) remote_max_streams: u32,

    /// Stream receive window we advertise; refund threshold base.
    pub(crate) local_initial_window: u32,
    /// Connection receive window we advertise.
    pub(crate) conn_recv_window: u32,
    /// Consumed connection-level bytes not yet refunded.
    pub(crate) conn_consumed: u32,

    /// Last stream id from a received GOAWAY.
    pub(crate) goaway_recv: Option<u32>,
    /// `terminate` was called; GOAWAY is queued or sent.
    pub(crate) term: bool,

    /// Pad outgoing DATA frames (traffic-analysis mitigation).
    pub(crate) padding: bool,
}

impl SessionCore {
    pub(crate) fn new(padding: bool) -> Self {
        Self {
            encoder: FrameEncoder::new(),
            hpack_enc: HpackEncoder::new(),
            streams: HashMap::new(),
            next_stream_id: 1,
            outbox: VecDeque::new(),
            send_window: DEFAULT_INITIAL_WINDOW_SIZE as i32,
            remote_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            remote_max_streams: u32::MAX,
            local_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            conn_recv_window: DEFAULT_INITIAL_WINDOW_SIZE,
            conn_consumed: 0,
            goaway_recv: None,
            term: false,
            padding,
        }
    }

    /// Open a new stream carrying a request.
    ///
    /// The stream carries END_STREAM on its HEADERS when no body provider
    /// is given. Returns the new stream id.
    pub fn submit_request(
        &mut self,
        priority: Option<Priority>,
        headers: &[HeaderField],
        body: Option<Box<dyn BodyProvider>>,
    ) -> Result<u32, SubmitError> {
        if self.term || self.goaway_recv.is_some() {
            return Err(SubmitError::SessionClosing);
        }
        if self.next_stream_id > MAX_WINDOW_SIZE {
            return Err(SubmitError::StreamsExhausted);
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let mut block = Vec::new();
        self.hpack_enc.encode(headers, &mut block);

        let end_stream = body.is_none();
        let mut bytes = BytesMut::new();
        self.encoder.encode(
            &Frame::Headers(HeadersFrame {
                stream_id,
                end_stream,
                end_headers: true,
                priority,
                fragment: Bytes::from(block),
            }),
            &mut bytes,
        );

        self.streams.insert(
            stream_id,
            StreamRec::new(self.remote_initial_window as i32, body),
        );
        self.outbox.push_back(Outgoing {
            event: FrameEvent::Headers {
                stream_id,
                category: HeadersCategory::Request,
                end_stream,
            },
            bytes: bytes.freeze(),
        });

        Ok(stream_id)
    }

    /// Queue RST_STREAM. Permitted for ids we never opened (e.g. refusing
    /// a promised stream). Local delivery for the stream stops immediately.
    pub fn submit_rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) {
        if let Some(rec) = self.streams.get_mut(&stream_id) {
            rec.ignore = true;
            rec.provider = None;
        }
        self.push_frame(
            FrameEvent::RstStream {
                stream_id,
                error_code,
            },
            &Frame::RstStream(RstStreamFrame {
                stream_id,
                error_code,
            }),
        );
    }

    /// Queue a PRIORITY frame for a stream.
    pub fn submit_priority(&mut self, stream_id: u32, priority: Priority) {
        self.push_frame(
            FrameEvent::Priority { stream_id },
            &Frame::Priority(PriorityFrame {
                stream_id,
                priority,
            }),
        );
    }

    /// Queue a SETTINGS frame and apply our own receive-side values.
    pub fn submit_settings(&mut self, settings: &[Setting]) {
        for setting in settings {
            if setting.id == SettingId::InitialWindowSize {
                self.local_initial_window = setting.value;
            }
        }
        self.push_frame(
            FrameEvent::Settings { ack: false },
            &Frame::Settings(SettingsFrame {
                ack: false,
                settings: settings.to_vec(),
            }),
        );
    }

    /// Queue a PING probe.
    pub fn submit_ping(&mut self) {
        self.push_frame(
            FrameEvent::Ping { ack: false },
            &Frame::Ping(PingFrame {
                ack: false,
                opaque: [0; 8],
            }),
        );
    }

    /// Queue a WINDOW_UPDATE. Stream id 0 grows the connection window.
    pub fn submit_window_update(&mut self, stream_id: u32, increment: u32) {
        if stream_id == 0 {
            self.conn_recv_window = self.conn_recv_window.saturating_add(increment);
        }
        self.push_frame(
            FrameEvent::WindowUpdate {
                stream_id,
                increment,
            },
            &Frame::WindowUpdate(WindowUpdateFrame {
                stream_id,
                increment,
            }),
        );
    }

    /// Queue GOAWAY and refuse all further submissions. Once the GOAWAY
    /// and any already-queued frames drain, the session wants neither
    /// reads nor writes.
    pub fn terminate(&mut self, error_code: ErrorCode) {
        if self.term {
            return;
        }
        self.term = true;
        self.push_frame(
            FrameEvent::GoAway {
                last_stream_id: 0,
                error_code,
            },
            &Frame::GoAway(GoAwayFrame {
                last_stream_id: 0,
                error_code,
                debug_data: Bytes::new(),
            }),
        );
    }

    /// Clear a body provider's deferred state. Unknown streams are a
    /// no-op success, mirroring resume-after-close races.
    pub fn resume_data(&mut self, stream_id: u32) {
        if let Some(rec) = self.streams.get_mut(&stream_id) {
            rec.deferred = false;
        }
    }

    /// Return `len` bytes of receive flow-control credit for `stream_id`.
    ///
    /// Credit is accumulated and refunded with WINDOW_UPDATE frames once
    /// half the respective window is outstanding. Closed streams refund
    /// the connection window only.
    pub fn consume(&mut self, stream_id: u32, len: usize) {
        let len = len as u32;
        self.conn_consumed = self.conn_consumed.saturating_add(len);
        if self.conn_consumed >= self.conn_recv_window / 2 {
            let increment = self.conn_consumed;
            self.conn_consumed = 0;
            self.push_frame(
                FrameEvent::WindowUpdate {
                    stream_id: 0,
                    increment,
                },
                &Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: 0,
                    increment,
                }),
            );
        }

        let threshold = self.local_initial_window / 2;
        let mut refund = None;
        if let Some(rec) = self.streams.get_mut(&stream_id) {
            rec.consumed = rec.consumed.saturating_add(len);
            if rec.consumed >= threshold && !rec.remote_closed {
                refund = Some(rec.consumed);
                rec.consumed = 0;
            }
        }
        if let Some(increment) = refund {
            self.push_frame(
                FrameEvent::WindowUpdate {
                    stream_id,
                    increment,
                },
                &Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id,
                    increment,
                }),
            );
        }
    }

    /// Number of open streams.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// The peer's SETTINGS_MAX_CONCURRENT_STREAMS. Callers that care
    /// about the limit check it before submitting; the engine itself
    /// does not queue excess requests.
    pub fn remote_max_streams(&self) -> u32 {
        self.remote_max_streams
    }

    pub(crate) fn push_frame(&mut self, event: FrameEvent, frame: &Frame) {
        let mut bytes = BytesMut::new();
        self.encoder.encode(frame, &mut bytes);
        self.outbox.push_back(Outgoing {
            event,
            bytes: bytes.freeze(),
        });
    }

    pub(crate) fn set_ignore(&mut self, stream_id: u32) {
        if let Some(rec) = self.streams.get_mut(&stream_id) {
            rec.ignore = true;
            rec.provider = None;
        }
    }

    pub(crate) fn is_ignored(&self, stream_id: u32) -> bool {
        self.streams
            .get(&stream_id)
            .map(|rec| rec.ignore)
            .unwrap_or(true)
    }

    /// Produce one DATA frame from a ready body provider, if any.
    pub(crate) fn pop_data_frame(&mut self) -> Option<Outgoing> {
        if self.send_window <= 0 {
            return None;
        }

        let stream_id = *self
            .streams
            .iter()
            .find(|(_, rec)| rec.sendable())?
            .0;

        let max_len = {
            let rec = &self.streams[&stream_id];
            (rec.send_window.min(self.send_window) as usize)
                .min(self.encoder.max_frame_size() as usize)
        };

        let mut buf = vec![0u8; max_len];
        let rec = self.streams.get_mut(&stream_id)?;
        let provider = rec.provider.as_mut()?;
        let (len, end) = match provider.read(&mut buf) {
            super::BodyChunk::Data { len, end } => (len.min(max_len), end),
            super::BodyChunk::Deferred => {
                rec.deferred = true;
                return None;
            }
        };
        if len == 0 && !end {
            // Nothing available; wait for an explicit resume.
            rec.deferred = true;
            return None;
        }

        rec.send_window -= len as i32;
        self.send_window -= len as i32;
        if end {
            rec.local_closed = true;
            rec.provider = None;
        }

        buf.truncate(len);
        let pad = if self.padding && len > 0 {
            // Round the payload up to a 16-byte boundary.
            (16 - (len % 16)) as u8 % 16
        } else {
            0
        };

        let mut bytes = BytesMut::new();
        let frame = crate::frame::DataFrame::new(stream_id, Bytes::from(buf), end);
        self.encoder.encode_data(&frame, pad, &mut bytes);

        Some(Outgoing {
            event: FrameEvent::Data {
                stream_id,
                end_stream: end,
            },
            bytes: bytes.freeze(),
        })
    }

    /// True when any stream could produce DATA right now.
    pub(crate) fn has_pending_data(&self) -> bool {
        self.send_window > 0 && self.streams.values().any(|rec| rec.sendable())
    }
}
