//! HPACK header compression (RFC 7541).

mod decode;
mod encode;
mod huffman;
mod table;

pub use decode::HpackDecoder;
pub use encode::HpackEncoder;
pub use table::HeaderField;

use std::fmt;

/// Default SETTINGS_HEADER_TABLE_SIZE.
pub const DEFAULT_TABLE_SIZE: usize = 4_096;

/// HPACK decoding errors. All of them are connection-fatal
/// (COMPRESSION_ERROR) for the session driving the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpackError {
    /// Input ended inside an integer, string, or instruction.
    Truncated,
    /// Integer representation exceeds the supported range.
    IntegerOverflow,
    /// Index points outside the static and dynamic tables.
    InvalidIndex(usize),
    /// Malformed Huffman-coded string.
    Huffman,
    /// Dynamic table size update above the negotiated maximum, or in an
    /// invalid position.
    TableSizeUpdate,
}

impl fmt::Display for HpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HpackError::Truncated => write!(f, "truncated header block"),
            HpackError::IntegerOverflow => write!(f, "integer representation overflow"),
            HpackError::InvalidIndex(index) => write!(f, "invalid table index {index}"),
            HpackError::Huffman => write!(f, "malformed Huffman string"),
            HpackError::TableSizeUpdate => write!(f, "invalid dynamic table size update"),
        }
    }
}

impl std::error::Error for HpackError {}
