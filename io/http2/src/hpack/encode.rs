//! HPACK header block encoding.

use super::huffman;
use super::table::{self, DynamicTable, HeaderField, Match};
use super::DEFAULT_TABLE_SIZE;

/// Encoder state for one connection's send direction.
pub struct HpackEncoder {
    table: DynamicTable,
    use_huffman: bool,
    /// Size update to announce at the start of the next block.
    pending_resize: Option<usize>,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self {
            table: DynamicTable::new(DEFAULT_TABLE_SIZE),
            use_huffman: true,
            pending_resize: None,
        }
    }

    pub fn set_huffman(&mut self, use_huffman: bool) {
        self.use_huffman = use_huffman;
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. The matching dynamic
    /// table size update instruction is emitted with the next block.
    pub fn set_table_size(&mut self, size: usize) {
        self.table.set_max_size(size);
        self.pending_resize = Some(size);
    }

    /// Encode a header list into one header block.
    pub fn encode(&mut self, fields: &[HeaderField], out: &mut Vec<u8>) {
        if let Some(size) = self.pending_resize.take() {
            encode_integer(size, 5, 0x20, out);
        }
        for field in fields {
            self.encode_field(field, out);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, out: &mut Vec<u8>) {
        match table::lookup(&self.table, &field.name, &field.value) {
            Match::Full(index) => {
                encode_integer(index, 7, 0x80, out);
            }
            Match::Name(index) => {
                encode_integer(index, 6, 0x40, out);
                self.encode_string(&field.value, out);
                self.table.insert(field.clone());
            }
            Match::None => {
                out.push(0x40);
                self.encode_string(&field.name, out);
                self.encode_string(&field.value, out);
                self.table.insert(field.clone());
            }
        }
    }

    fn encode_string(&self, data: &[u8], out: &mut Vec<u8>) {
        if self.use_huffman {
            let coded_len = huffman::encoded_len(data);
            if coded_len < data.len() {
                encode_integer(coded_len, 7, 0x80, out);
                huffman::encode(data, out);
                return;
            }
        }
        encode_integer(data.len(), 7, 0x00, out);
        out.extend_from_slice(data);
    }
}

/// Encode an integer with an N-bit prefix (RFC 7541 Section 5.1).
fn encode_integer(mut value: usize, prefix_bits: u8, pattern: u8, out: &mut Vec<u8>) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.push(pattern | value as u8);
        return;
    }
    out.push(pattern | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}
