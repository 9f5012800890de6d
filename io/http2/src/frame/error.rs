//! Error codes and framing errors.

use std::fmt;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    /// Unknown code; carried through verbatim.
    Other(u32),
}

impl ErrorCode {
    pub fn from_wire(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Other(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Other(other) => other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
            ErrorCode::Other(code) => return write!(f, "UNKNOWN({code:#x})"),
        };
        f.write_str(name)
    }
}

/// Errors raised while decoding frames off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Frame length exceeds the negotiated maximum.
    FrameTooLarge { length: u32, max: u32 },
    /// A stream-scoped frame arrived on stream 0.
    StreamIdRequired { frame_type: u8 },
    /// A connection-scoped frame arrived on a non-zero stream.
    NonZeroStreamId { frame_type: u8 },
    /// Frame payload length does not match the frame type's layout.
    BadLength { frame_type: u8, length: u32 },
    /// Pad length covers the whole payload.
    BadPadding,
    /// Setting value outside its permitted range.
    BadSettingValue { id: u16, value: u32 },
    /// WINDOW_UPDATE with a zero increment.
    ZeroWindowIncrement,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::FrameTooLarge { length, max } => {
                write!(f, "frame length {length} exceeds maximum {max}")
            }
            FrameError::StreamIdRequired { frame_type } => {
                write!(f, "frame type {frame_type:#x} requires a stream id")
            }
            FrameError::NonZeroStreamId { frame_type } => {
                write!(f, "frame type {frame_type:#x} must use stream 0")
            }
            FrameError::BadLength { frame_type, length } => {
                write!(f, "invalid length {length} for frame type {frame_type:#x}")
            }
            FrameError::BadPadding => write!(f, "padding exceeds frame payload"),
            FrameError::BadSettingValue { id, value } => {
                write!(f, "invalid value {value} for setting {id:#x}")
            }
            FrameError::ZeroWindowIncrement => write!(f, "WINDOW_UPDATE increment of zero"),
        }
    }
}

impl std::error::Error for FrameError {}

impl FrameError {
    /// The connection error code this framing violation maps to.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FrameError::FrameTooLarge { .. } | FrameError::BadLength { .. } => {
                ErrorCode::FrameSizeError
            }
            _ => ErrorCode::ProtocolError,
        }
    }
}
