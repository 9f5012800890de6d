//! Frame encoder.

use super::{
    DataFrame, FRAME_HEADER_SIZE, Frame, HeadersFrame, MAX_MAX_FRAME_SIZE, Priority, flags,
    frame_type,
};

use bytes::{BufMut, BytesMut};

/// Encodes frames onto the wire, splitting header blocks that exceed the
/// peer's SETTINGS_MAX_FRAME_SIZE into CONTINUATION frames.
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Apply the peer's SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size.clamp(super::DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE);
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn encode(&self, frame: &Frame, out: &mut BytesMut) {
        match frame {
            Frame::Data(f) => self.encode_data(f, 0, out),
            Frame::Headers(f) => self.encode_headers(f, out),
            Frame::Priority(f) => {
                put_header(out, 5, frame_type::PRIORITY, 0, f.stream_id);
                put_priority(out, &f.priority);
            }
            Frame::RstStream(f) => {
                put_header(out, 4, frame_type::RST_STREAM, 0, f.stream_id);
                out.put_u32(f.error_code.to_wire());
            }
            Frame::Settings(f) => {
                let fl = if f.ack { flags::ACK } else { 0 };
                put_header(out, (f.settings.len() * 6) as u32, frame_type::SETTINGS, fl, 0);
                for setting in &f.settings {
                    out.put_u16(setting.id.to_wire());
                    out.put_u32(setting.value);
                }
            }
            Frame::PushPromise(f) => {
                let fl = if f.end_headers { flags::END_HEADERS } else { 0 };
                put_header(
                    out,
                    4 + f.fragment.len() as u32,
                    frame_type::PUSH_PROMISE,
                    fl,
                    f.stream_id,
                );
                out.put_u32(f.promised_stream_id);
                out.put_slice(&f.fragment);
            }
            Frame::Ping(f) => {
                let fl = if f.ack { flags::ACK } else { 0 };
                put_header(out, 8, frame_type::PING, fl, 0);
                out.put_slice(&f.opaque);
            }
            Frame::GoAway(f) => {
                put_header(
                    out,
                    8 + f.debug_data.len() as u32,
                    frame_type::GOAWAY,
                    0,
                    0,
                );
                out.put_u32(f.last_stream_id);
                out.put_u32(f.error_code.to_wire());
                out.put_slice(&f.debug_data);
            }
            Frame::WindowUpdate(f) => {
                put_header(out, 4, frame_type::WINDOW_UPDATE, 0, f.stream_id);
                out.put_u32(f.increment);
            }
            Frame::Continuation(f) => {
                let fl = if f.end_headers { flags::END_HEADERS } else { 0 };
                put_header(
                    out,
                    f.fragment.len() as u32,
                    frame_type::CONTINUATION,
                    fl,
                    f.stream_id,
                );
                out.put_slice(&f.fragment);
            }
            Frame::Unknown { .. } => {}
        }
    }

    /// Encode a DATA frame with `pad_len` trailing padding bytes.
    pub fn encode_data(&self, frame: &DataFrame, pad_len: u8, out: &mut BytesMut) {
        debug_assert!(frame.data.len() as u32 <= self.max_frame_size);
        let mut fl = 0;
        if frame.end_stream {
            fl |= flags::END_STREAM;
        }
        let mut length = frame.data.len() as u32;
        if pad_len > 0 {
            fl |= flags::PADDED;
            length += 1 + pad_len as u32;
        }
        put_header(out, length, frame_type::DATA, fl, frame.stream_id);
        if pad_len > 0 {
            out.put_u8(pad_len);
        }
        out.put_slice(&frame.data);
        out.put_bytes(0, pad_len as usize);
    }

    fn encode_headers(&self, frame: &HeadersFrame, out: &mut BytesMut) {
        let prio_len = if frame.priority.is_some() { 5 } else { 0 };
        let max = self.max_frame_size as usize - prio_len;

        let (first, mut rest) = if frame.fragment.len() > max {
            frame.fragment.split_at(max)
        } else {
            (&frame.fragment[..], &[][..])
        };

        let mut fl = 0;
        if frame.end_stream {
            fl |= flags::END_STREAM;
        }
        if frame.priority.is_some() {
            fl |= flags::PRIORITY;
        }
        if rest.is_empty() && frame.end_headers {
            fl |= flags::END_HEADERS;
        }

        put_header(
            out,
            (first.len() + prio_len) as u32,
            frame_type::HEADERS,
            fl,
            frame.stream_id,
        );
        if let Some(priority) = &frame.priority {
            put_priority(out, priority);
        }
        out.put_slice(first);

        while !rest.is_empty() {
            let take = rest.len().min(self.max_frame_size as usize);
            let (chunk, tail) = rest.split_at(take);
            rest = tail;
            let fl = if rest.is_empty() && frame.end_headers {
                flags::END_HEADERS
            } else {
                0
            };
            put_header(
                out,
                chunk.len() as u32,
                frame_type::CONTINUATION,
                fl,
                frame.stream_id,
            );
            out.put_slice(chunk);
        }
    }
}

fn put_header(out: &mut BytesMut, length: u32, typ: u8, frame_flags: u8, stream_id: u32) {
    out.reserve(FRAME_HEADER_SIZE + length as usize);
    out.put_slice(&length.to_be_bytes()[1..]);
    out.put_u8(typ);
    out.put_u8(frame_flags);
    out.put_u32(stream_id & 0x7fff_ffff);
}

fn put_priority(out: &mut BytesMut, priority: &Priority) {
    let mut dep = priority.dependency & 0x7fff_ffff;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    out.put_u32(dep);
    out.put_u8(priority.weight);
}
