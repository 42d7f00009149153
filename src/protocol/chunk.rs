//! RTMP chunk stream codec
//!
//! Every message on the wire is cut into chunks of at most the negotiated
//! chunk size. Each chunk starts with a header whose size depends on its
//! format:
//!
//! ```text
//! +--------------+----------------+--------------------+------------+
//! | Basic Header | Message Header | Extended Timestamp | Chunk Data |
//! |  1-3 bytes   | 0, 3, 7, 11 B  |   0 or 4 bytes     |            |
//! +--------------+----------------+--------------------+------------+
//!
//! fmt 0: timestamp(3) length(3) type(1) stream id(4, little endian)
//! fmt 1: timestamp delta(3) length(3) type(1)
//! fmt 2: timestamp delta(3)
//! fmt 3: nothing, every field comes from the previous chunk
//! ```
//!
//! Omitted fields are inherited from the last header seen on the same chunk
//! stream, so the decoder keeps one [`ChannelState`] per chunk stream ID.
//!
//! The decoder is sans-IO. It looks at a `BytesMut` and consumes nothing
//! until a whole physical chunk is buffered, which makes it safe to call
//! after every socket read no matter where the read boundary fell.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::{
    DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP_MARKER, MAX_CHUNK_SIZE, MAX_CHUNK_STREAM_ID,
    MAX_MESSAGE_SIZE, MIN_CHUNK_STREAM_ID,
};
use super::pool::{BufferPool, PooledBuf};
use crate::error::ProtocolError;

/// A fully reassembled RTMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    /// Format of the chunk that started the message
    pub format: u8,
    /// Chunk stream the message arrived on (or is written to)
    pub csid: u32,
    /// Absolute timestamp in milliseconds
    pub timestamp: u32,
    /// Message type ID
    pub type_id: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message body
    pub payload: Bytes,
}

impl ChunkMessage {
    /// Create a message to be written
    pub fn new(csid: u32, type_id: u8, stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Self {
            format: 0,
            csid,
            timestamp,
            type_id,
            stream_id,
            payload,
        }
    }

    /// Payload length as carried in the message header
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }
}

/// Header fields remembered per chunk stream
#[derive(Debug, Default, Clone, Copy)]
struct HeaderState {
    timestamp: u32,
    delta: u32,
    length: u32,
    type_id: u8,
    stream_id: u32,
    /// Last fmt 0/1/2 header carried an extended timestamp
    extended: bool,
    /// Value of that extended field (absolute for fmt 0, delta otherwise)
    extended_value: u32,
    /// Format of the last fmt 0/1/2 header
    last_format: u8,
}

/// Message being reassembled on one chunk stream
#[derive(Debug)]
struct Partial {
    buf: PooledBuf,
    remain: u32,
    format: u8,
}

#[derive(Debug, Default)]
struct ChannelState {
    header: HeaderState,
    partial: Option<Partial>,
}

enum Progress {
    NeedMore,
    Chunk,
    Message(ChunkMessage),
}

/// Decodes chunk streams into messages
#[derive(Debug)]
pub struct ChunkDecoder {
    channels: HashMap<u32, ChannelState>,
    chunk_size: u32,
    max_message_size: u32,
    pool: Arc<BufferPool>,
}

impl ChunkDecoder {
    /// Create a decoder starting at the default chunk size of 128
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            channels: HashMap::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            pool,
        }
    }

    /// Current inbound chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Lower the largest message length accepted from the peer
    pub fn set_max_message_size(&mut self, size: u32) {
        self.max_message_size = size.min(MAX_MESSAGE_SIZE);
    }

    /// Apply a SetChunkSize from the peer; affects the next chunk parsed
    pub fn set_chunk_size(&mut self, size: u32) -> Result<(), ProtocolError> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size));
        }
        tracing::trace!(chunk_size = size, "Inbound chunk size updated");
        self.chunk_size = size;
        Ok(())
    }

    /// Drop the partially received message on `csid` (Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(channel) = self.channels.get_mut(&csid) {
            if channel.partial.take().is_some() {
                tracing::debug!(csid = csid, "Partial message aborted");
            }
        }
    }

    /// Decode at most one message from `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed chunks are
    /// removed from `buf`; an incomplete trailing chunk is left in place.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ChunkMessage>, ProtocolError> {
        loop {
            match self.decode_chunk(buf)? {
                Progress::NeedMore => return Ok(None),
                Progress::Chunk => continue,
                Progress::Message(msg) => return Ok(Some(msg)),
            }
        }
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<Progress, ProtocolError> {
        let data = &buf[..];
        let Some((format, csid, mut pos)) = parse_basic_header(data) else {
            return Ok(Progress::NeedMore);
        };

        let channel = self.channels.get(&csid);
        let in_progress = channel.map_or(false, |c| c.partial.is_some());
        let prev = match channel {
            Some(c) => c.header,
            None if format == 0 || format == 1 => HeaderState::default(),
            None => return Err(ProtocolError::UnknownChunkStream { csid, format }),
        };
        if channel.is_none() && format == 1 {
            tracing::warn!(csid = csid, "First chunk on stream is format 1");
        }

        let mut header = prev;
        let mut new_message = true;

        match format {
            0 => {
                if data.len() < pos + 11 {
                    return Ok(Progress::NeedMore);
                }
                let timestamp = read_u24(&data[pos..]);
                header.length = read_u24(&data[pos + 3..]);
                header.type_id = data[pos + 6];
                header.stream_id = u32::from_le_bytes([
                    data[pos + 7],
                    data[pos + 8],
                    data[pos + 9],
                    data[pos + 10],
                ]);
                header.extended = timestamp == EXTENDED_TIMESTAMP_MARKER;
                header.timestamp = timestamp;
                header.delta = 0;
                pos += 11;
            }
            1 => {
                if data.len() < pos + 7 {
                    return Ok(Progress::NeedMore);
                }
                header.delta = read_u24(&data[pos..]);
                header.length = read_u24(&data[pos + 3..]);
                header.type_id = data[pos + 6];
                header.extended = header.delta == EXTENDED_TIMESTAMP_MARKER;
                pos += 7;
            }
            2 => {
                if data.len() < pos + 3 {
                    return Ok(Progress::NeedMore);
                }
                header.delta = read_u24(&data[pos..]);
                header.extended = header.delta == EXTENDED_TIMESTAMP_MARKER;
                pos += 3;
            }
            _ => new_message = !in_progress,
        }

        if format < 3 {
            if header.extended {
                if data.len() < pos + 4 {
                    return Ok(Progress::NeedMore);
                }
                header.extended_value = read_u32(&data[pos..]);
                pos += 4;
                if format == 0 {
                    header.timestamp = header.extended_value;
                } else {
                    header.delta = header.extended_value;
                }
            }
            if format != 0 {
                header.timestamp = prev.timestamp.wrapping_add(header.delta);
            }
            header.last_format = format;
        } else if header.extended {
            if data.len() < pos + 4 {
                return Ok(Progress::NeedMore);
            }
            let value = read_u32(&data[pos..]);
            if new_message {
                pos += 4;
                header.extended_value = value;
                if header.last_format == 0 {
                    header.timestamp = value;
                } else {
                    header.delta = value;
                    header.timestamp = prev.timestamp.wrapping_add(value);
                }
            } else if value == header.extended_value {
                // Some peers repeat the extended timestamp on continuation
                // chunks and some don't; only consume it when it matches.
                pos += 4;
            }
        } else if new_message && header.last_format != 0 {
            header.timestamp = prev.timestamp.wrapping_add(header.delta);
        }

        if new_message && header.length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge(
                header.length,
                self.max_message_size,
            ));
        }

        let remain = if new_message {
            header.length
        } else {
            channel
                .and_then(|c| c.partial.as_ref())
                .map_or(0, |p| p.remain)
        };
        let take = remain.min(self.chunk_size) as usize;
        if data.len() < pos + take {
            return Ok(Progress::NeedMore);
        }

        // Whole chunk is buffered: commit.
        buf.advance(pos);
        let body = buf.split_to(take);

        let channel = self.channels.entry(csid).or_default();
        channel.header = header;

        let mut partial = if new_message {
            if let Some(stale) = channel.partial.take() {
                tracing::warn!(
                    csid = csid,
                    remain = stale.remain,
                    "New message header before previous message completed, discarding"
                );
            }
            Partial {
                buf: self.pool.acquire(header.length as usize),
                remain: header.length,
                format,
            }
        } else {
            match channel.partial.take() {
                Some(partial) => partial,
                None => return Ok(Progress::Chunk),
            }
        };

        partial.buf.extend_from_slice(&body);
        partial.remain -= take as u32;

        tracing::trace!(
            csid = csid,
            format = format,
            type_id = header.type_id,
            chunk = take,
            remain = partial.remain,
            "Chunk read"
        );

        if partial.remain > 0 {
            channel.partial = Some(partial);
            return Ok(Progress::Chunk);
        }

        let payload = partial.buf.take_bytes();
        Ok(Progress::Message(ChunkMessage {
            format: partial.format,
            csid,
            timestamp: header.timestamp,
            type_id: header.type_id,
            stream_id: header.stream_id,
            payload,
        }))
    }
}

/// Header fields remembered per outgoing chunk stream
#[derive(Debug, Clone, Copy)]
struct WriteState {
    timestamp: u32,
    length: u32,
    type_id: u8,
    stream_id: u32,
}

/// Encodes messages into chunks
#[derive(Debug)]
pub struct ChunkEncoder {
    channels: HashMap<u32, WriteState>,
    chunk_size: u32,
}

impl ChunkEncoder {
    /// Create an encoder starting at the default chunk size of 128
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Current outbound chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Change the outbound chunk size
    ///
    /// Only call this after the SetChunkSize message announcing it has been
    /// encoded, or the peer will mis-split the following chunks.
    pub fn set_chunk_size(&mut self, size: u32) -> Result<(), ProtocolError> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size));
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Append the chunked form of `msg` to `out`
    ///
    /// The header format is picked from what was last written on the same
    /// chunk stream: fmt 0 for a new stream, a new message stream ID or a
    /// timestamp going backwards, otherwise fmt 1, or fmt 2 when length and
    /// type repeat.
    pub fn encode(&mut self, msg: &ChunkMessage, out: &mut BytesMut) -> Result<(), ProtocolError> {
        if !(MIN_CHUNK_STREAM_ID..=MAX_CHUNK_STREAM_ID).contains(&msg.csid) {
            return Err(ProtocolError::InvalidChunkStreamId(msg.csid));
        }
        let length = msg.length();
        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(length, MAX_MESSAGE_SIZE));
        }

        let format = match self.channels.get(&msg.csid) {
            Some(prev) if prev.stream_id == msg.stream_id && msg.timestamp >= prev.timestamp => {
                if prev.length == length && prev.type_id == msg.type_id {
                    2
                } else {
                    1
                }
            }
            _ => 0,
        };

        let time_field = match self.channels.get(&msg.csid) {
            Some(prev) if format != 0 => msg.timestamp - prev.timestamp,
            _ => msg.timestamp,
        };
        let extended = time_field >= EXTENDED_TIMESTAMP_MARKER;
        let short_time = time_field.min(EXTENDED_TIMESTAMP_MARKER);

        let chunk_size = self.chunk_size as usize;
        let fragments = (msg.payload.len().max(1) + chunk_size - 1) / chunk_size;
        out.reserve(16 + msg.payload.len() + fragments * 8);

        write_basic_header(out, format, msg.csid);
        match format {
            0 => {
                put_u24(out, short_time);
                put_u24(out, length);
                out.put_u8(msg.type_id);
                out.put_u32_le(msg.stream_id);
            }
            1 => {
                put_u24(out, short_time);
                put_u24(out, length);
                out.put_u8(msg.type_id);
            }
            _ => put_u24(out, short_time),
        }
        if extended {
            out.put_u32(time_field);
        }

        for (i, fragment) in msg.payload.chunks(chunk_size).enumerate() {
            if i > 0 {
                write_basic_header(out, 3, msg.csid);
                if extended {
                    out.put_u32(time_field);
                }
            }
            out.put_slice(fragment);
        }

        self.channels.insert(
            msg.csid,
            WriteState {
                timestamp: msg.timestamp,
                length,
                type_id: msg.type_id,
                stream_id: msg.stream_id,
            },
        );

        Ok(())
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the 1-3 byte basic header: `(format, csid, header length)`
fn parse_basic_header(data: &[u8]) -> Option<(u8, u32, usize)> {
    let first = *data.first()?;
    let format = first >> 6;
    match first & 0x3F {
        0 => {
            let b1 = *data.get(1)?;
            Some((format, 64 + u32::from(b1), 2))
        }
        1 => {
            let b1 = *data.get(1)?;
            let b2 = *data.get(2)?;
            Some((format, 64 + u32::from(b1) + u32::from(b2) * 256, 3))
        }
        csid => Some((format, u32::from(csid), 1)),
    }
}

/// `csid` must already be within 2..=65599; 0 and 1 are the escape codes
fn write_basic_header(out: &mut BytesMut, format: u8, csid: u32) {
    debug_assert!((MIN_CHUNK_STREAM_ID..=MAX_CHUNK_STREAM_ID).contains(&csid));
    let fmt_bits = format << 6;
    match csid {
        2..=63 => out.put_u8(fmt_bits | csid as u8),
        64..=319 => {
            out.put_u8(fmt_bits);
            out.put_u8((csid - 64) as u8);
        }
        _ => {
            let id = csid - 64;
            out.put_u8(fmt_bits | 1);
            out.put_u8((id & 0xFF) as u8);
            out.put_u8((id >> 8) as u8);
        }
    }
}

fn read_u24(data: &[u8]) -> u32 {
    u32::from(data[0]) << 16 | u32::from(data[1]) << 8 | u32::from(data[2])
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_u8((value >> 16) as u8);
    out.put_u8((value >> 8) as u8);
    out.put_u8(value as u8);
}
