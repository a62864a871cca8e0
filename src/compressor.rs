//! The frame half of the Header Compressor: converts between
//! `{type=HEADERS|PUSH_PROMISE, headers: map}` frames and one or more wire
//! frames whose `data` holds an opaque header block, driving the HPACK-00
//! reference-set encode/decode algorithms over [`crate::hpack::HeaderTable`].
//! Frames of other types pass through unchanged.

use crate::error::{CompressionError, Http2Error};
use crate::frame::{Frame, HeaderBlock, HeadersFlags, PushPromiseFlags};
use crate::hpack::{self, HeaderTable, TableLookup};
use crate::types::{FrameType, Headers, StreamId, MAX_HEADER_CHUNK};
use bytes::{Buf, Bytes, BytesMut};

fn emit_indexed(out: &mut BytesMut, index: usize) {
    out.extend_from_slice(&hpack::encode_integer(7, 0x80, index));
}

fn emit_literal_incremental(out: &mut BytesMut, name: &str, value: &str) {
    out.extend_from_slice(&hpack::encode_integer(5, 0x40, 0));
    out.extend_from_slice(&hpack::encode_string(name));
    out.extend_from_slice(&hpack::encode_string(value));
}

fn emit_literal_substitution(out: &mut BytesMut, name_index: usize, substitution_index: usize, value: &str) {
    out.extend_from_slice(&hpack::encode_integer(6, 0x00, name_index));
    out.extend_from_slice(&hpack::encode_integer(0, 0, substitution_index));
    out.extend_from_slice(&hpack::encode_string(value));
}

/// Encoder algorithm: the caller's headers, lower-cased name first,
/// against `table`'s reference-set state.
fn encode_block(headers: &Headers, table: &mut HeaderTable) -> Bytes {
    let mut out = BytesMut::new();
    for (raw_name, value) in headers {
        let name = raw_name.to_lowercase();
        match table.lookup(&name, value) {
            TableLookup::Full(i) => {
                let (reference, keep, emitted) = {
                    let e = table.get(i).expect("lookup returned a valid index");
                    (e.reference, e.keep, e.emitted)
                };
                if !reference {
                    emit_indexed(&mut out, i);
                    let e = table.get_mut(i).unwrap();
                    e.reference = true;
                    e.emitted = true;
                } else if keep {
                    for _ in 0..4 {
                        emit_indexed(&mut out, i);
                    }
                    let e = table.get_mut(i).unwrap();
                    e.keep = false;
                    e.emitted = true;
                } else if emitted {
                    emit_indexed(&mut out, i);
                    emit_indexed(&mut out, i);
                } else {
                    table.get_mut(i).unwrap().keep = true;
                }
            }
            TableLookup::NameOnly(n) => {
                emit_literal_substitution(&mut out, n, n, value);
                table.insert_substitution(n, name, value.clone());
            }
            TableLookup::NoMatch => {
                emit_literal_incremental(&mut out, &name, value);
                table.insert_incremental(name, value.clone());
            }
        }
    }

    let to_clear: Vec<usize> =
        table.iter_indexed().filter(|(_, e)| e.reference && !e.keep).map(|(i, _)| i).collect();
    for i in to_clear {
        emit_indexed(&mut out, i);
        table.get_mut(i).unwrap().reference = false;
    }
    for (_, e) in table.iter_indexed_mut() {
        e.keep = false;
        e.emitted = false;
    }
    out.freeze()
}

/// Decoder algorithm, for one fully-reassembled block.
fn decode_block(data: &[u8], table: &mut HeaderTable) -> Result<Headers, CompressionError> {
    let mut buf = Bytes::copy_from_slice(data);
    let mut headers = Headers::new();

    while buf.has_remaining() {
        let first = buf.get_u8();
        if first & 0x80 != 0 {
            let index = hpack::decode_integer(7, first & 0x7F, &mut buf)?;
            let reference = table.get(index).ok_or(CompressionError::IndexOutOfRange(index))?.reference;
            if reference {
                table.get_mut(index).unwrap().reference = false;
            } else {
                let (name, value) = {
                    let e = table.get(index).unwrap();
                    (e.name.clone(), e.value.clone())
                };
                headers.push((name, value));
                let e = table.get_mut(index).unwrap();
                e.reference = true;
                e.emitted = true;
            }
        } else if first & 0xE0 == 0x60 {
            // Literal without indexing.
            let name_index = hpack::decode_integer(5, first & 0x1F, &mut buf)?;
            let name = decode_name(name_index, table, &mut buf)?;
            let value = hpack::decode_string(&mut buf)?;
            headers.push((name, value));
        } else if first & 0xE0 == 0x40 {
            // Literal with incremental indexing.
            let name_index = hpack::decode_integer(5, first & 0x1F, &mut buf)?;
            let name = decode_name(name_index, table, &mut buf)?;
            let value = hpack::decode_string(&mut buf)?;
            headers.push((name.clone(), value.clone()));
            table.insert_incremental(name, value);
        } else {
            // Literal with substitution indexing: 00 prefix, 6-bit name index.
            let name_index = hpack::decode_integer(6, first & 0x3F, &mut buf)?;
            let name = decode_name(name_index, table, &mut buf)?;
            if !buf.has_remaining() {
                return Err(CompressionError::MalformedEncoding);
            }
            let sub_first = buf.get_u8();
            let sub_index = hpack::decode_integer(0, sub_first, &mut buf)?;
            let value = hpack::decode_string(&mut buf)?;
            headers.push((name.clone(), value.clone()));
            table.insert_substitution(sub_index, name, value);
        }
    }

    let flushed: Vec<(String, String)> = table
        .iter_indexed()
        .filter(|(_, e)| e.reference && !e.emitted)
        .map(|(_, e)| (e.name.clone(), e.value.clone()))
        .collect();
    headers.extend(flushed);
    for (_, e) in table.iter_indexed_mut() {
        e.emitted = false;
    }
    Ok(headers)
}

fn decode_name(name_index: usize, table: &HeaderTable, buf: &mut Bytes) -> Result<String, CompressionError> {
    if name_index == 0 {
        hpack::decode_string(buf)
    } else {
        table.get(name_index).map(|e| e.name.clone()).ok_or(CompressionError::IndexOutOfRange(name_index))
    }
}

fn chunk_bytes(data: &Bytes) -> Vec<Bytes> {
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    let mut out = Vec::new();
    let mut rest = data.clone();
    while !rest.is_empty() {
        let take = rest.len().min(MAX_HEADER_CHUNK);
        out.push(rest.split_to(take));
    }
    out
}

/// Encodes logical HEADERS/PUSH_PROMISE frames into one or more wire frames,
/// chunked at [`MAX_HEADER_CHUNK`] bytes, against one direction's table.
#[derive(Debug)]
pub struct Compressor {
    table: HeaderTable,
}

impl Compressor {
    #[must_use]
    pub fn new(table: HeaderTable) -> Self {
        Self { table }
    }

    /// Converts a single logical frame into its wire-ready form(s). Frames
    /// other than HEADERS/PUSH_PROMISE pass through untouched.
    pub fn compress(&mut self, frame: Frame) -> Vec<Frame> {
        match frame {
            Frame::Headers { stream, flags, priority, block } => {
                let headers = block.as_decoded().expect("compressor received an already-compressed frame").clone();
                let encoded = encode_block(&headers, &mut self.table);
                let chunks = chunk_bytes(&encoded);
                let last = chunks.len() - 1;
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| {
                        let mut chunk_flags = flags & HeadersFlags::RESERVED;
                        if i == last && flags.contains(HeadersFlags::END_STREAM) {
                            chunk_flags |= HeadersFlags::END_STREAM;
                        }
                        if i == last {
                            chunk_flags |= HeadersFlags::END_HEADERS;
                        }
                        let chunk_priority = if i == 0 {
                            if priority.is_some() {
                                chunk_flags |= HeadersFlags::PRIORITY;
                            }
                            priority
                        } else {
                            None
                        };
                        Frame::Headers { stream, flags: chunk_flags, priority: chunk_priority, block: HeaderBlock::Fragment(chunk) }
                    })
                    .collect()
            }
            Frame::PushPromise { stream, promised_stream, block, .. } => {
                let headers = block.as_decoded().expect("compressor received an already-compressed frame").clone();
                let encoded = encode_block(&headers, &mut self.table);
                let chunks = chunk_bytes(&encoded);
                let last = chunks.len() - 1;
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| {
                        let mut chunk_flags = PushPromiseFlags::empty();
                        if i == last {
                            chunk_flags |= PushPromiseFlags::END_PUSH_PROMISE;
                        }
                        Frame::PushPromise { stream, flags: chunk_flags, promised_stream, block: HeaderBlock::Fragment(chunk) }
                    })
                    .collect()
            }
            other => vec![other],
        }
    }
}

#[derive(Debug)]
struct PendingSeries {
    stream: StreamId,
    frame_type: FrameType,
    buf: BytesMut,
    flags_end_stream: bool,
    priority: Option<u32>,
    promised_stream: Option<StreamId>,
}

/// Decodes wire HEADERS/PUSH_PROMISE frame series back into logical frames,
/// buffering a partial series until its end flag arrives and rejecting any
/// frame that interleaves with an in-progress one.
#[derive(Debug)]
pub struct Decompressor {
    table: HeaderTable,
    pending: Option<PendingSeries>,
}

impl Decompressor {
    #[must_use]
    pub fn new(table: HeaderTable) -> Self {
        Self { table, pending: None }
    }

    /// Process one wire frame. Returns `Some(frame)` with a `Decoded` header
    /// block once a series completes (or immediately for a single-frame
    /// block); `None` while a series is still being assembled; frames of
    /// other types pass straight through as `Some`.
    pub fn process(&mut self, frame: Frame) -> Result<Option<Frame>, Http2Error> {
        match frame {
            Frame::Headers { stream, flags, priority, block } => {
                self.accept_chunk(stream, FrameType::Headers, flags.contains(HeadersFlags::END_HEADERS), flags.contains(HeadersFlags::END_STREAM), priority, None, block)
            }
            Frame::PushPromise { stream, flags, promised_stream, block } => {
                self.accept_chunk(stream, FrameType::PushPromise, flags.contains(PushPromiseFlags::END_PUSH_PROMISE), false, None, Some(promised_stream), block)
            }
            other => {
                if let Some(pending) = &self.pending {
                    return Err(CompressionError::InterleavedSeries(other.frame_type(), pending.stream).into());
                }
                Ok(Some(other))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_chunk(
        &mut self,
        stream: StreamId,
        frame_type: FrameType,
        end: bool,
        end_stream: bool,
        priority: Option<u32>,
        promised_stream: Option<StreamId>,
        block: HeaderBlock,
    ) -> Result<Option<Frame>, Http2Error> {
        let fragment = block.as_fragment().expect("decompressor received an already-decoded frame").clone();

        if let Some(pending) = &mut self.pending {
            if pending.stream != stream {
                return Err(CompressionError::InterleavedStream(stream, pending.stream).into());
            }
            if pending.frame_type != frame_type {
                return Err(CompressionError::InterleavedSeries(frame_type, pending.stream).into());
            }
            pending.buf.extend_from_slice(&fragment);
            pending.flags_end_stream |= end_stream;
            if priority.is_some() {
                pending.priority = priority;
            }
            if !end {
                return Ok(None);
            }
            let pending = self.pending.take().unwrap();
            self.finish(pending)
        } else if end {
            let headers = decode_block(&fragment, &mut self.table)?;
            Ok(Some(self.assemble(frame_type, stream, end_stream, priority, promised_stream, headers)))
        } else {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&fragment);
            self.pending = Some(PendingSeries { stream, frame_type, buf, flags_end_stream: end_stream, priority, promised_stream });
            Ok(None)
        }
    }

    fn finish(&mut self, pending: PendingSeries) -> Result<Option<Frame>, Http2Error> {
        let headers = decode_block(&pending.buf, &mut self.table)?;
        Ok(Some(self.assemble(pending.frame_type, pending.stream, pending.flags_end_stream, pending.priority, pending.promised_stream, headers)))
    }

    fn assemble(
        &self,
        frame_type: FrameType,
        stream: StreamId,
        end_stream: bool,
        priority: Option<u32>,
        promised_stream: Option<StreamId>,
        headers: Headers,
    ) -> Frame {
        match frame_type {
            FrameType::Headers => {
                let mut flags = HeadersFlags::END_HEADERS;
                if end_stream {
                    flags |= HeadersFlags::END_STREAM;
                }
                if priority.is_some() {
                    flags |= HeadersFlags::PRIORITY;
                }
                Frame::Headers { stream, flags, priority, block: HeaderBlock::Decoded(headers) }
            }
            FrameType::PushPromise => Frame::PushPromise {
                stream,
                flags: PushPromiseFlags::END_PUSH_PROMISE,
                promised_stream: promised_stream.expect("PUSH_PROMISE series always carries a promised stream"),
                block: HeaderBlock::Decoded(headers),
            },
            _ => unreachable!("only HEADERS/PUSH_PROMISE series are buffered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn bag_eq(a: &Headers, b: &Headers) -> bool {
        let mut a = a.clone();
        let mut b = b.clone();
        a.sort();
        b.sort();
        a == b
    }

    #[test]
    fn single_block_round_trip() {
        let mut compressor = Compressor::new(HeaderTable::request(4096));
        let mut decompressor = Decompressor::new(HeaderTable::request(4096));

        let original = headers(&[(":method", "get"), (":path", "/"), ("x-custom", "value")]);
        let frame = Frame::Headers { stream: 1, flags: HeadersFlags::END_STREAM, priority: None, block: HeaderBlock::Decoded(original.clone()) };
        let wire = compressor.compress(frame);
        assert_eq!(wire.len(), 1);

        let mut decoded = None;
        for f in wire {
            if let Some(out) = decompressor.process(f).unwrap() {
                decoded = Some(out);
            }
        }
        let decoded = decoded.unwrap();
        match decoded {
            Frame::Headers { flags, block, .. } => {
                assert!(flags.contains(HeadersFlags::END_STREAM));
                assert!(bag_eq(block.as_decoded().unwrap(), &original));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn reference_set_reuses_entries_across_blocks_on_same_table() {
        let mut table_enc = HeaderTable::request(4096);
        let mut table_dec = HeaderTable::request(4096);

        let first = headers(&[(":method", "get"), (":path", "/a")]);
        let second = headers(&[(":method", "get"), (":path", "/b")]);

        let encoded1 = encode_block(&first, &mut table_enc);
        let decoded1 = decode_block(&encoded1, &mut table_dec).unwrap();
        assert!(bag_eq(&decoded1, &first));

        let encoded2 = encode_block(&second, &mut table_enc);
        let decoded2 = decode_block(&encoded2, &mut table_dec).unwrap();
        // :method=get is still referenced from block 1; :path changes.
        assert!(decoded2.iter().any(|(n, v)| n == ":method" && v == "get"));
        assert!(decoded2.iter().any(|(n, v)| n == ":path" && v == "/b"));
    }

    #[test]
    fn headers_series_split_across_three_frames() {
        let big_value = "x".repeat(MAX_HEADER_CHUNK * 2 + 10);
        let original = headers(&[(":method", "post"), ("x-big", &big_value)]);

        let mut compressor = Compressor::new(HeaderTable::request(4096));
        let frame = Frame::Headers { stream: 1, flags: HeadersFlags::empty(), priority: None, block: HeaderBlock::Decoded(original.clone()) };
        let wire = compressor.compress(frame);
        assert!(wire.len() >= 3, "expected the oversized block to span at least 3 frames, got {}", wire.len());
        for (i, f) in wire.iter().enumerate() {
            if let Frame::Headers { flags, .. } = f {
                assert_eq!(flags.contains(HeadersFlags::END_HEADERS), i == wire.len() - 1);
            }
        }

        let mut decompressor = Decompressor::new(HeaderTable::request(4096));
        let mut decoded = None;
        for f in wire {
            if let Some(out) = decompressor.process(f).unwrap() {
                decoded = Some(out);
            }
        }
        let decoded = decoded.unwrap();
        match decoded {
            Frame::Headers { block, .. } => assert!(bag_eq(block.as_decoded().unwrap(), &original)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn interleaved_frame_is_rejected() {
        let mut compressor = Compressor::new(HeaderTable::request(4096));
        let big_value = "x".repeat(MAX_HEADER_CHUNK * 2);
        let original = headers(&[("x-big", &big_value)]);
        let frame = Frame::Headers { stream: 1, flags: HeadersFlags::empty(), priority: None, block: HeaderBlock::Decoded(original) };
        let mut wire = compressor.compress(frame);
        assert!(wire.len() >= 2);

        let mut decompressor = Decompressor::new(HeaderTable::request(4096));
        decompressor.process(wire.remove(0)).unwrap();
        let interloper = Frame::Ping { flags: crate::frame::PingFlags::empty(), data: [0; 8] };
        let err = decompressor.process(interloper).unwrap_err();
        assert_eq!(err.code(), crate::types::ErrorCode::CompressionError);
    }

    #[test]
    fn index_out_of_range_is_compression_error() {
        let mut table = HeaderTable::request(4096);
        // Indexed representation pointing far past the table's size.
        let malformed = hpack::encode_integer(7, 0x80, 9_999);
        let err = decode_block(&malformed, &mut table).unwrap_err();
        assert_eq!(err, CompressionError::IndexOutOfRange(9_999));
    }

    #[test]
    fn name_only_match_uses_substitution_indexing_round_trip() {
        // ":host" is a name-only match against the static request table
        // (static value ""); the value-only substitution form must carry
        // both the name index and the index being replaced, or the decoder
        // misreads the value's length byte as a bogus substitution index.
        let mut compressor = Compressor::new(HeaderTable::request(4096));
        let mut decompressor = Decompressor::new(HeaderTable::request(4096));

        let original = headers(&[(":host", "h")]);
        let frame = Frame::Headers { stream: 1, flags: HeadersFlags::END_STREAM, priority: None, block: HeaderBlock::Decoded(original.clone()) };
        let wire = compressor.compress(frame);

        let mut decoded = None;
        for f in wire {
            if let Some(out) = decompressor.process(f).unwrap() {
                decoded = Some(out);
            }
        }
        let decoded = decoded.unwrap();
        match decoded {
            Frame::Headers { block, .. } => assert!(bag_eq(block.as_decoded().unwrap(), &original)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn push_promise_round_trip() {
        let mut compressor = Compressor::new(HeaderTable::response(4096));
        let mut decompressor = Decompressor::new(HeaderTable::response(4096));
        let original = headers(&[(":path", "/y")]);
        let frame = Frame::PushPromise { stream: 1, flags: PushPromiseFlags::empty(), promised_stream: 2, block: HeaderBlock::Decoded(original.clone()) };
        let wire = compressor.compress(frame);
        let mut decoded = None;
        for f in wire {
            if let Some(out) = decompressor.process(f).unwrap() {
                decoded = Some(out);
            }
        }
        match decoded.unwrap() {
            Frame::PushPromise { promised_stream, block, .. } => {
                assert_eq!(promised_stream, 2);
                assert!(bag_eq(block.as_decoded().unwrap(), &original));
            }
            _ => panic!("wrong variant"),
        }
    }
}
