//! The table half of the Header Compressor: integer and string
//! coding primitives, `HeaderTableEntry` with its three reference-set bits,
//! the two static tables, and `HeaderTable` insertion/eviction.
//!
//! The frame-level chunking and the reference-set encode/decode algorithms
//! that drive this table live in [`crate::compressor`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// A `(name, value)` pair plus the three bits draft HPACK-00's reference-set
/// dance needs. Losing any of these silently breaks compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderTableEntry {
    pub name: String,
    pub value: String,
    /// Member of the current reference set.
    pub reference: bool,
    /// Already delivered for the block being decoded.
    pub emitted: bool,
    /// Marked to survive the encoder's end-of-block flush.
    pub keep: bool,
}

impl HeaderTableEntry {
    fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), reference: false, emitted: false, keep: false }
    }

    /// Size attribute: UTF-8 byte length of both strings plus 32.
    #[must_use]
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// Result of looking an outbound `(name, value)` pair up against a table:
/// the encoder's step 1 needs both a full match and a name-only match as
/// distinct queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLookup {
    /// Both name and value matched, at this 1-based index.
    Full(usize),
    /// Only the name matched, at this 1-based index.
    NameOnly(usize),
    NoMatch,
}

/// An ordered sequence of entries, pre-populated with a static table and
/// growing/evicting exactly like a single unified table (draft HPACK-00 has
/// no separate static/dynamic index space): insertion appends at the back,
/// eviction removes from the front, including static entries once the
/// table is full enough.
#[derive(Debug, Clone)]
pub struct HeaderTable {
    entries: VecDeque<HeaderTableEntry>,
    limit: usize,
    size: usize,
}

/// Default table size limit, in the same units as [`HeaderTableEntry::size`].
pub const DEFAULT_TABLE_LIMIT: usize = 4096;

impl HeaderTable {
    fn with_static(static_entries: &[(&str, &str)], limit: usize) -> Self {
        let mut table = Self { entries: VecDeque::with_capacity(static_entries.len()), limit, size: 0 };
        for (name, value) in static_entries {
            table.push_back_raw(HeaderTableEntry::new(*name, *value));
        }
        table
    }

    /// A table pre-populated with the request static table.
    #[must_use]
    pub fn request(limit: usize) -> Self {
        Self::with_static(&REQUEST_STATIC_TABLE, limit)
    }

    /// A table pre-populated with the response static table.
    #[must_use]
    pub fn response(limit: usize) -> Self {
        Self::with_static(&RESPONSE_STATIC_TABLE, limit)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 1-based lookup, matching the wire index space.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&HeaderTableEntry> {
        index.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut HeaderTableEntry> {
        index.checked_sub(1).and_then(|i| self.entries.get_mut(i))
    }

    /// Full-match-first, then name-only lookup, in one pass.
    #[must_use]
    pub fn lookup(&self, name: &str, value: &str) -> TableLookup {
        let mut name_only = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name == name {
                if entry.value == value {
                    return TableLookup::Full(i + 1);
                }
                if name_only.is_none() {
                    name_only = Some(i + 1);
                }
            }
        }
        match name_only {
            Some(i) => TableLookup::NameOnly(i),
            None => TableLookup::NoMatch,
        }
    }

    fn push_back_raw(&mut self, entry: HeaderTableEntry) {
        self.size += entry.size();
        self.entries.push_back(entry);
        self.evict_to_fit();
    }

    fn evict_to_fit(&mut self) {
        while self.size > self.limit {
            let Some(popped) = self.entries.pop_front() else { break };
            self.size -= popped.size();
        }
    }

    /// Append at the end ("at infinity") with the bits the decoder sets on a
    /// freshly-indexed entry. If the new entry alone exceeds the limit, even
    /// an empty table can't hold it and it is silently dropped.
    pub fn insert_incremental(&mut self, name: String, value: String) -> Option<usize> {
        let entry = HeaderTableEntry { reference: true, emitted: true, keep: false, ..HeaderTableEntry::new(name, value) };
        if entry.size() > self.limit {
            return None;
        }
        self.push_back_raw(entry);
        Some(self.entries.len())
    }

    /// Replace the entry at `index` in place, keeping its position. Returns `None` if the index is out of range
    /// or the replacement alone cannot fit.
    pub fn insert_substitution(&mut self, index: usize, name: String, value: String) -> Option<usize> {
        let entry = HeaderTableEntry { reference: true, emitted: true, keep: false, ..HeaderTableEntry::new(name, value) };
        if entry.size() > self.limit {
            return None;
        }
        let i = index.checked_sub(1)?;
        let old_size = self.entries.get(i)?.size();
        self.size = self.size - old_size + entry.size();
        self.entries[i] = entry;
        self.evict_to_fit();
        // The replaced slot may itself have been evicted if earlier entries
        // were large enough to push the running size over the limit first.
        if i < self.entries.len() { Some(i + 1) } else { None }
    }

    /// Iterate all entries with their 1-based index, for the flush-emit pass.
    pub fn iter_indexed(&self) -> impl Iterator<Item = (usize, &HeaderTableEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i + 1, e))
    }

    pub fn iter_indexed_mut(&mut self) -> impl Iterator<Item = (usize, &mut HeaderTableEntry)> {
        self.entries.iter_mut().enumerate().map(|(i, e)| (i + 1, e))
    }
}

/// Request static table, in wire order (lowest index first).
pub static REQUEST_STATIC_TABLE: [(&str, &str); 30] = [
    (":scheme", "http"),
    (":scheme", "https"),
    (":host", ""),
    (":path", "/"),
    (":method", "get"),
    ("accept", ""),
    ("accept-charset", ""),
    ("accept-encoding", ""),
    ("accept-language", ""),
    ("cookie", ""),
    ("if-modified-since", ""),
    ("user-agent", ""),
    ("referer", ""),
    ("authorization", ""),
    ("allow", ""),
    ("cache-control", ""),
    ("connection", ""),
    ("content-length", ""),
    ("content-type", ""),
    ("date", ""),
    ("expect", ""),
    ("from", ""),
    ("if-match", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("max-forwards", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("via", ""),
];

/// Response static table, in wire order.
pub static RESPONSE_STATIC_TABLE: [(&str, &str); 30] = [
    (":status", "200"),
    ("age", ""),
    ("cache-control", ""),
    ("content-length", ""),
    ("content-type", ""),
    ("date", ""),
    ("etag", ""),
    ("expires", ""),
    ("last-modified", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("vary", ""),
    ("via", ""),
    ("access-control-allow-origin", ""),
    ("accept-ranges", ""),
    ("allow", ""),
    ("connection", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("link", ""),
    ("location", ""),
    ("proxy-authenticate", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("www-authenticate", ""),
];

/// Encode `value` as an N-bit-prefix integer, OR-ing `tag_bits` into
/// the unused high bits of the first byte.
#[must_use]
pub fn encode_integer(prefix_bits: u32, tag_bits: u8, value: usize) -> Bytes {
    let max_prefix = (1usize << prefix_bits) - 1;
    let mut out = BytesMut::new();
    if value < max_prefix {
        out.put_u8(tag_bits | value as u8);
        return out.freeze();
    }
    out.put_u8(tag_bits | max_prefix as u8);
    let mut remaining = value - max_prefix;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
            out.put_u8(byte);
        } else {
            out.put_u8(byte);
            break;
        }
    }
    out.freeze()
}

/// Decode an N-bit-prefix integer starting at `buf`'s current position. The
/// first byte (already masked to its prefix bits) is passed in separately
/// since callers typically peel the representation tag off it first.
pub fn decode_integer(prefix_bits: u32, first_byte_prefix_value: u8, buf: &mut Bytes) -> Result<usize, crate::error::CompressionError> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = first_byte_prefix_value as usize;
    if value < max_prefix {
        return Ok(value);
    }
    let mut m = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(crate::error::CompressionError::MalformedEncoding);
        }
        let byte = buf.get_u8();
        value += ((byte & 0x7F) as usize) << (7 * m);
        if byte & 0x80 == 0 {
            break;
        }
        m += 1;
    }
    Ok(value)
}

/// Encode a string as a 0-prefix length integer followed by its UTF-8 bytes.
#[must_use]
pub fn encode_string(s: &str) -> Bytes {
    let mut out = BytesMut::new();
    out.extend_from_slice(&encode_integer(0, 0, s.len()));
    out.extend_from_slice(s.as_bytes());
    out.freeze()
}

/// Decode a length-prefixed UTF-8 string.
pub fn decode_string(buf: &mut Bytes) -> Result<String, crate::error::CompressionError> {
    if !buf.has_remaining() {
        return Err(crate::error::CompressionError::MalformedEncoding);
    }
    let first = buf.get_u8();
    let len = decode_integer(0, first, buf)?;
    if buf.len() < len {
        return Err(crate::error::CompressionError::MalformedEncoding);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| crate::error::CompressionError::MalformedEncoding)
}
