//! Incremental frame decoder.

use super::{
    ContinuationFrame, DataFrame, ErrorCode, FRAME_HEADER_SIZE, Frame, FrameError, GoAwayFrame,
    HeadersFrame, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE, PingFrame, Priority, PriorityFrame,
    PushPromiseFrame, RstStreamFrame, Setting, SettingId, SettingsFrame, WindowUpdateFrame,
    flags, frame_type,
};

use bytes::{Buf, Bytes, BytesMut};

/// Decodes frames from a byte stream, one complete frame at a time.
///
/// `decode` returns `Ok(None)` until a full frame is buffered; callers keep
/// appending socket bytes to the same `BytesMut` and calling again.
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Raise the accepted frame size after advertising SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size.clamp(super::DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE);
    }

    /// Try to decode the next frame out of `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let typ = buf[3];
        let frame_flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;

        if length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }

        if buf.len() < FRAME_HEADER_SIZE + length as usize {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(length as usize).freeze();

        let frame = match typ {
            frame_type::DATA => self.decode_data(stream_id, frame_flags, payload)?,
            frame_type::HEADERS => self.decode_headers(stream_id, frame_flags, payload)?,
            frame_type::PRIORITY => decode_priority(stream_id, payload)?,
            frame_type::RST_STREAM => decode_rst_stream(stream_id, payload)?,
            frame_type::SETTINGS => decode_settings(stream_id, frame_flags, payload)?,
            frame_type::PUSH_PROMISE => decode_push_promise(stream_id, frame_flags, payload)?,
            frame_type::PING => decode_ping(stream_id, frame_flags, payload)?,
            frame_type::GOAWAY => decode_goaway(stream_id, payload)?,
            frame_type::WINDOW_UPDATE => decode_window_update(stream_id, payload)?,
            frame_type::CONTINUATION => decode_continuation(stream_id, frame_flags, payload)?,
            other => Frame::Unknown {
                frame_type: other,
                stream_id,
            },
        };

        Ok(Some(frame))
    }

    fn decode_data(
        &self,
        stream_id: u32,
        frame_flags: u8,
        payload: Bytes,
    ) -> Result<Frame, FrameError> {
        if stream_id == 0 {
            return Err(FrameError::StreamIdRequired {
                frame_type: frame_type::DATA,
            });
        }
        let flow_len = payload.len() as u32;
        let data = strip_padding(frame_flags, payload, frame_type::DATA)?;
        Ok(Frame::Data(DataFrame {
            stream_id,
            end_stream: frame_flags & flags::END_STREAM != 0,
            data,
            flow_len,
        }))
    }

    fn decode_headers(
        &self,
        stream_id: u32,
        frame_flags: u8,
        payload: Bytes,
    ) -> Result<Frame, FrameError> {
        if stream_id == 0 {
            return Err(FrameError::StreamIdRequired {
                frame_type: frame_type::HEADERS,
            });
        }
        let mut rest = strip_padding(frame_flags, payload, frame_type::HEADERS)?;

        let priority = if frame_flags & flags::PRIORITY != 0 {
            if rest.len() < 5 {
                return Err(FrameError::BadLength {
                    frame_type: frame_type::HEADERS,
                    length: rest.len() as u32,
                });
            }
            let dep = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            let weight = rest[4];
            rest.advance(5);
            Some(Priority {
                exclusive: dep & 0x8000_0000 != 0,
                dependency: dep & 0x7fff_ffff,
                weight,
            })
        } else {
            None
        };

        Ok(Frame::Headers(HeadersFrame {
            stream_id,
            end_stream: frame_flags & flags::END_STREAM != 0,
            end_headers: frame_flags & flags::END_HEADERS != 0,
            priority,
            fragment: rest,
        }))
    }
}

fn strip_padding(frame_flags: u8, mut payload: Bytes, typ: u8) -> Result<Bytes, FrameError> {
    if frame_flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(FrameError::BadLength {
            frame_type: typ,
            length: 0,
        });
    }
    let pad_len = payload[0] as usize;
    payload.advance(1);
    if pad_len > payload.len() {
        return Err(FrameError::BadPadding);
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

fn decode_priority(stream_id: u32, payload: Bytes) -> Result<Frame, FrameError> {
    if stream_id == 0 {
        return Err(FrameError::StreamIdRequired {
            frame_type: frame_type::PRIORITY,
        });
    }
    if payload.len() != 5 {
        return Err(FrameError::BadLength {
            frame_type: frame_type::PRIORITY,
            length: payload.len() as u32,
        });
    }
    let dep = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok(Frame::Priority(PriorityFrame {
        stream_id,
        priority: Priority {
            exclusive: dep & 0x8000_0000 != 0,
            dependency: dep & 0x7fff_ffff,
            weight: payload[4],
        },
    }))
}

fn decode_rst_stream(stream_id: u32, payload: Bytes) -> Result<Frame, FrameError> {
    if stream_id == 0 {
        return Err(FrameError::StreamIdRequired {
            frame_type: frame_type::RST_STREAM,
        });
    }
    if payload.len() != 4 {
        return Err(FrameError::BadLength {
            frame_type: frame_type::RST_STREAM,
            length: payload.len() as u32,
        });
    }
    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok(Frame::RstStream(RstStreamFrame {
        stream_id,
        error_code: ErrorCode::from_wire(code),
    }))
}

fn decode_settings(stream_id: u32, frame_flags: u8, payload: Bytes) -> Result<Frame, FrameError> {
    if stream_id != 0 {
        return Err(FrameError::NonZeroStreamId {
            frame_type: frame_type::SETTINGS,
        });
    }
    let ack = frame_flags & flags::ACK != 0;
    if ack && !payload.is_empty() {
        return Err(FrameError::BadLength {
            frame_type: frame_type::SETTINGS,
            length: payload.len() as u32,
        });
    }
    if payload.len() % 6 != 0 {
        return Err(FrameError::BadLength {
            frame_type: frame_type::SETTINGS,
            length: payload.len() as u32,
        });
    }

    let mut settings = Vec::with_capacity(payload.len() / 6);
    for entry in payload.chunks_exact(6) {
        let id = u16::from_be_bytes([entry[0], entry[1]]);
        let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
        let setting_id = SettingId::from_wire(id);
        match setting_id {
            SettingId::EnablePush if value > 1 => {
                return Err(FrameError::BadSettingValue { id, value });
            }
            SettingId::InitialWindowSize if value > MAX_WINDOW_SIZE => {
                return Err(FrameError::BadSettingValue { id, value });
            }
            SettingId::MaxFrameSize
                if !(super::DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) =>
            {
                return Err(FrameError::BadSettingValue { id, value });
            }
            _ => {}
        }
        settings.push(Setting {
            id: setting_id,
            value,
        });
    }

    Ok(Frame::Settings(SettingsFrame { ack, settings }))
}

fn decode_push_promise(
    stream_id: u32,
    frame_flags: u8,
    payload: Bytes,
) -> Result<Frame, FrameError> {
    if stream_id == 0 {
        return Err(FrameError::StreamIdRequired {
            frame_type: frame_type::PUSH_PROMISE,
        });
    }
    let mut rest = strip_padding(frame_flags, payload, frame_type::PUSH_PROMISE)?;
    if rest.len() < 4 {
        return Err(FrameError::BadLength {
            frame_type: frame_type::PUSH_PROMISE,
            length: rest.len() as u32,
        });
    }
    let promised = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) & 0x7fff_ffff;
    rest.advance(4);
    Ok(Frame::PushPromise(PushPromiseFrame {
        stream_id,
        promised_stream_id: promised,
        end_headers: frame_flags & flags::END_HEADERS != 0,
        fragment: rest,
    }))
}

fn decode_ping(stream_id: u32, frame_flags: u8, payload: Bytes) -> Result<Frame, FrameError> {
    if stream_id != 0 {
        return Err(FrameError::NonZeroStreamId {
            frame_type: frame_type::PING,
        });
    }
    if payload.len() != 8 {
        return Err(FrameError::BadLength {
            frame_type: frame_type::PING,
            length: payload.len() as u32,
        });
    }
    let mut opaque = [0u8; 8];
    opaque.copy_from_slice(&payload);
    Ok(Frame::Ping(PingFrame {
        ack: frame_flags & flags::ACK != 0,
        opaque,
    }))
}

fn decode_goaway(stream_id: u32, mut payload: Bytes) -> Result<Frame, FrameError> {
    if stream_id != 0 {
        return Err(FrameError::NonZeroStreamId {
            frame_type: frame_type::GOAWAY,
        });
    }
    if payload.len() < 8 {
        return Err(FrameError::BadLength {
            frame_type: frame_type::GOAWAY,
            length: payload.len() as u32,
        });
    }
    let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
    let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    payload.advance(8);
    Ok(Frame::GoAway(GoAwayFrame {
        last_stream_id: last,
        error_code: ErrorCode::from_wire(code),
        debug_data: payload,
    }))
}

fn decode_window_update(stream_id: u32, payload: Bytes) -> Result<Frame, FrameError> {
    if payload.len() != 4 {
        return Err(FrameError::BadLength {
            frame_type: frame_type::WINDOW_UPDATE,
            length: payload.len() as u32,
        });
    }
    let increment =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
    if increment == 0 {
        return Err(FrameError::ZeroWindowIncrement);
    }
    Ok(Frame::WindowUpdate(WindowUpdateFrame {
        stream_id,
        increment,
    }))
}

fn decode_continuation(
    stream_id: u32,
    frame_flags: u8,
    payload: Bytes,
) -> Result<Frame, FrameError> {
    if stream_id == 0 {
        return Err(FrameError::StreamIdRequired {
            frame_type: frame_type::CONTINUATION,
        });
    }
    Ok(Frame::Continuation(ContinuationFrame {
        stream_id,
        end_headers: frame_flags & flags::END_HEADERS != 0,
        fragment: payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::FrameEncoder;
    use super::*;

    fn decode_one(bytes: &[u8]) -> Frame {
        let mut buf = BytesMut::from(bytes);
        FrameDecoder::new().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn short_input_needs_more_data() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&[0u8, 0, 8, 0x6, 0][..]);
        assert!(matches!(decoder.decode(&mut buf), Ok(None)));
        // Header present but payload incomplete.
        let mut buf = BytesMut::from(&[0u8, 0, 8, 0x6, 0, 0, 0, 0, 0, 1, 2][..]);
        assert!(matches!(decoder.decode(&mut buf), Ok(None)));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0x0, 0, 0, 0, 0, 1][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn ping_on_stream_rejected() {
        let mut bytes = vec![0, 0, 8, 0x6, 0, 0, 0, 0, 1];
        bytes.extend_from_slice(&[0; 8]);
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(FrameError::NonZeroStreamId { .. })
        ));
    }

    #[test]
    fn data_padding_counts_toward_flow_len() {
        // PADDED data frame: pad_len=3, data="hi", 3 pad bytes.
        let bytes = [
            0, 0, 6, 0x0, 0x8, 0, 0, 0, 1, // header
            3, b'h', b'i', 0, 0, 0, // payload
        ];
        match decode_one(&bytes) {
            Frame::Data(f) => {
                assert_eq!(&f.data[..], b"hi");
                assert_eq!(f.flow_len, 6);
                assert!(!f.end_stream);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn padding_covering_payload_rejected() {
        let bytes = [0, 0, 3, 0x0, 0x8, 0, 0, 0, 1, 5, b'h', b'i'];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(FrameError::BadPadding)
        ));
    }

    #[test]
    fn settings_entries_parsed() {
        let mut encoder_out = BytesMut::new();
        FrameEncoder::new().encode(
            &Frame::Settings(SettingsFrame {
                ack: false,
                settings: vec![
                    Setting {
                        id: SettingId::EnablePush,
                        value: 0,
                    },
                    Setting {
                        id: SettingId::InitialWindowSize,
                        value: 1 << 20,
                    },
                ],
            }),
            &mut encoder_out,
        );
        match decode_one(&encoder_out) {
            Frame::Settings(f) => {
                assert!(!f.ack);
                assert_eq!(f.settings.len(), 2);
                assert_eq!(f.settings[1].value, 1 << 20);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn settings_invalid_enable_push_rejected() {
        let bytes = [0, 0, 6, 0x4, 0, 0, 0, 0, 0, 0, 0x2, 0, 0, 0, 2];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(FrameError::BadSettingValue { .. })
        ));
    }

    #[test]
    fn zero_window_increment_rejected() {
        let bytes = [0, 0, 4, 0x8, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(FrameError::ZeroWindowIncrement)
        ));
    }

    #[test]
    fn unknown_frame_type_passes_through() {
        let bytes = [0, 0, 2, 0x42, 0, 0, 0, 0, 5, 1, 2];
        match decode_one(&bytes) {
            Frame::Unknown {
                frame_type,
                stream_id,
            } => {
                assert_eq!(frame_type, 0x42);
                assert_eq!(stream_id, 5);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn goaway_with_debug_data() {
        let mut bytes = vec![0, 0, 11, 0x7, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0, 0, 0, 9]); // last stream id
        bytes.extend_from_slice(&[0, 0, 0, 2]); // INTERNAL_ERROR
        bytes.extend_from_slice(b"oom");
        match decode_one(&bytes) {
            Frame::GoAway(f) => {
                assert_eq!(f.last_stream_id, 9);
                assert_eq!(f.error_code, ErrorCode::InternalError);
                assert_eq!(&f.debug_data[..], b"oom");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
