//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a
//! header that identifies the chunk stream and message being sent.
//!
//! ```text
//! Chunk Format:
//! +-------------+-----------------+-------------------+
//! | Basic Header| Message Header  | Chunk Data        |
//! | (1-3 bytes) | (0,3,7,11 bytes)| (variable)        |
//! +-------------+-----------------+-------------------+
//!
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)        for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)   for csid 64-65598
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4, LE)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  (use previous chunk's values)
//!
//! An extended timestamp (4 bytes) follows the message header when the
//! 24-bit field would overflow; it never appears on type 3 chunks.
//! ```
//!
//! The transmit side keeps one bounded FIFO per chunk stream and resumes a
//! partially written chunk before anything else, so chunks from different
//! streams never interleave mid-chunk.
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::IoSlice;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message (reassembled from chunks)
#[derive(Debug, Clone)]
pub struct Message {
    /// Chunk stream ID the message arrived on
    pub csid: u32,
    /// Message type ID
    pub mtid: u8,
    /// Message stream ID
    pub msid: u32,
    /// Absolute timestamp (milliseconds)
    pub timestamp: u32,
    /// Message payload
    pub payload: Bytes,
}

/// An outbound message waiting in a channel queue
#[derive(Debug)]
pub struct OutgoingMessage {
    /// Small framer-owned prefix (AMF `@setDataFrame`, media tag bytes);
    /// empty when absent. Counted in the wire-visible message length.
    pub data_header: Bytes,
    /// Message payload
    pub payload: Bytes,
    /// Opaque caller token returned with the release notification
    pub token: u64,
    /// Message type ID
    pub mtid: u8,
    /// Message stream ID
    pub msid: u32,
    /// Absolute timestamp (milliseconds)
    pub timestamp: u32,
    /// Internally generated payloads are dropped silently instead of being
    /// reported back to the caller
    pub internal: bool,
    /// New transmit chunk size to latch once this message is fully flushed
    pub next_chunk_size: Option<u32>,
}

/// A caller-owned payload the framer has finished with
#[derive(Debug)]
pub struct ReleasedFrame {
    pub data: Bytes,
    pub token: u64,
}

/// Per-chunk-stream transmit state
#[derive(Debug)]
struct TxChannel {
    csid: u32,
    queue: VecDeque<OutgoingMessage>,

    prev_mtid: u8,
    prev_msid: u32,
    prev_len: usize,
    prev_delta: u32,
    prev_timestamp: u32,
    first: bool,

    /// Progress within the front message
    dh_pos: usize,
    data_pos: usize,

    /// Geometry of the chunk currently on the wire
    header: Vec<u8>,
    chunk_dh_len: usize,
    chunk_data_len: usize,
    chunk_partial: usize,
    chunk_built: bool,
}

impl TxChannel {
    fn new(csid: u32) -> Self {
        Self {
            csid,
            queue: VecDeque::with_capacity(MAX_QUEUE),
            prev_mtid: 0,
            prev_msid: 0,
            prev_len: 0,
            prev_delta: 0,
            prev_timestamp: 0,
            first: true,
            dh_pos: 0,
            data_pos: 0,
            header: Vec::with_capacity(CHUNK_HEADER_MAX_LEN),
            chunk_dh_len: 0,
            chunk_data_len: 0,
            chunk_partial: 0,
            chunk_built: false,
        }
    }

    fn mid_message(&self) -> bool {
        self.dh_pos > 0 || self.data_pos > 0 || self.chunk_built
    }
}

/// Chunk stream encoder with per-channel queueing
///
/// Channels are visited in creation order; within one channel, enqueue order
/// is wire order.
pub struct ChunkWriter {
    channels: Vec<TxChannel>,
    chunk_size: u32,
    /// csid of the channel holding a partially written chunk, if any
    in_progress: Option<u32>,
}

impl ChunkWriter {
    /// Create a writer with the protocol-default chunk size
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            in_progress: None,
        }
    }

    /// Current transmit chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Queue a message on its channel
    ///
    /// Returns the number of messages already waiting ahead of this one, or
    /// `QueueFull` when the channel ring is saturated.
    pub fn enqueue(&mut self, csid: u32, msg: OutgoingMessage) -> Result<usize> {
        if !(2..=65598).contains(&csid) {
            return Err(ProtocolError::InvalidChunkStreamId(csid).into());
        }
        let total = msg.data_header.len() + msg.payload.len();
        if total > MAX_MESSAGE_SIZE as usize {
            return Err(ProtocolError::MessageTooLarge(total as u32).into());
        }

        let chan = self.channel_mut(csid);
        if chan.queue.len() >= MAX_QUEUE {
            return Err(Error::QueueFull);
        }
        chan.queue.push_back(msg);
        Ok(chan.queue.len() - 1)
    }

    /// Whether any channel still has queued or partially sent data
    pub fn has_pending(&self) -> bool {
        self.channels.iter().any(|c| !c.queue.is_empty())
    }

    /// Drain every queue to the socket
    ///
    /// The channel holding a partially written chunk resumes first; then
    /// channels are visited round-robin in creation order, one message per
    /// visit. Progress survives cancellation at any await point, so the
    /// caller may race this future against reads.
    pub async fn write_pending<W: AsyncWrite + Unpin>(
        &mut self,
        io: &mut W,
        released: &mut Vec<ReleasedFrame>,
    ) -> Result<()> {
        if let Some(csid) = self.in_progress {
            if let Some(idx) = self.channels.iter().position(|c| c.csid == csid) {
                self.send_front(idx, io, released).await?;
            } else {
                warn!(csid, "partial chunk recorded on an unknown channel");
                self.in_progress = None;
            }
        }

        loop {
            let mut sent_any = false;
            for idx in 0..self.channels.len() {
                if self.channels[idx].queue.is_empty() {
                    continue;
                }
                self.send_front(idx, io, released).await?;
                sent_any = true;
            }
            if !sent_any {
                return Ok(());
            }
        }
    }

    /// Drop queued caller messages that have not started transmission
    ///
    /// Internal protocol messages and any message already on the wire stay
    /// queued. Dropped payloads are handed back through `released`.
    pub fn discard_queued(&mut self, released: &mut Vec<ReleasedFrame>) {
        for chan in &mut self.channels {
            let protect_front = chan.mid_message();
            let mut idx = 0;
            chan.queue.retain(|msg| {
                let keep = msg.internal || (idx == 0 && protect_front);
                if !keep {
                    released.push(ReleasedFrame {
                        data: msg.payload.clone(),
                        token: msg.token,
                    });
                }
                idx += 1;
                keep
            });
        }
    }

    /// Release every queued caller payload (teardown path)
    pub fn release_all(&mut self, released: &mut Vec<ReleasedFrame>) {
        for chan in &mut self.channels {
            for msg in chan.queue.drain(..) {
                if !msg.internal {
                    released.push(ReleasedFrame {
                        data: msg.payload,
                        token: msg.token,
                    });
                }
            }
        }
        self.in_progress = None;
    }

    /// Send the front message of one channel, all chunks, resuming partials
    async fn send_front<W: AsyncWrite + Unpin>(
        &mut self,
        idx: usize,
        io: &mut W,
        released: &mut Vec<ReleasedFrame>,
    ) -> Result<()> {
        let csid = self.channels[idx].csid;

        loop {
            let chunk_size = self.chunk_size as usize;
            let (dh, payload, mtid, msid, timestamp) = {
                let chan = &self.channels[idx];
                match chan.queue.front() {
                    Some(front) => (
                        front.data_header.clone(),
                        front.payload.clone(),
                        front.mtid,
                        front.msid,
                        front.timestamp,
                    ),
                    None => {
                        self.in_progress = None;
                        return Ok(());
                    }
                }
            };

            self.in_progress = Some(csid);
            let chan = &mut self.channels[idx];

            let total_rem = (dh.len() - chan.dh_pos) + (payload.len() - chan.data_pos);
            if total_rem == 0 {
                break;
            }

            if !chan.chunk_built {
                chan.header.clear();
                if chan.dh_pos == 0 && chan.data_pos == 0 {
                    let msg_len = dh.len() + payload.len();
                    fill_header(chan, mtid, msid, msg_len, timestamp);
                } else {
                    // Continuation chunks repeat the basic header only
                    write_basic_header(csid, 3, &mut chan.header);
                }
                let body = total_rem.min(chunk_size);
                chan.chunk_dh_len = (dh.len() - chan.dh_pos).min(body);
                chan.chunk_data_len = body - chan.chunk_dh_len;
                chan.chunk_partial = 0;
                chan.chunk_built = true;
            }

            let seg_dh = &dh[chan.dh_pos..chan.dh_pos + chan.chunk_dh_len];
            let seg_data = &payload[chan.data_pos..chan.data_pos + chan.chunk_data_len];
            let chunk_total = chan.header.len() + seg_dh.len() + seg_data.len();

            let mut skip = chan.chunk_partial;
            let mut bufs = [IoSlice::new(&[]); 3];
            let mut cnt = 0;
            for seg in [&chan.header[..], seg_dh, seg_data] {
                if skip >= seg.len() {
                    skip -= seg.len();
                    continue;
                }
                bufs[cnt] = IoSlice::new(&seg[skip..]);
                skip = 0;
                cnt += 1;
            }

            let n = io.write_vectored(&bufs[..cnt]).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }

            chan.chunk_partial += n;
            if chan.chunk_partial == chunk_total {
                chan.dh_pos += chan.chunk_dh_len;
                chan.data_pos += chan.chunk_data_len;
                chan.chunk_partial = 0;
                chan.chunk_built = false;
            }
        }

        self.complete_front(idx, released);
        Ok(())
    }

    fn complete_front(&mut self, idx: usize, released: &mut Vec<ReleasedFrame>) {
        let chan = &mut self.channels[idx];
        let msg = match chan.queue.pop_front() {
            Some(msg) => msg,
            None => return,
        };
        chan.dh_pos = 0;
        chan.data_pos = 0;
        chan.chunk_partial = 0;
        chan.chunk_built = false;
        self.in_progress = None;

        // The defining SetChunkSize applies from the next message on
        if let Some(size) = msg.next_chunk_size {
            self.chunk_size = size;
        }
        if !msg.internal {
            released.push(ReleasedFrame {
                data: msg.payload,
                token: msg.token,
            });
        }
    }

    fn channel_mut(&mut self, csid: u32) -> &mut TxChannel {
        if let Some(idx) = self.channels.iter().position(|c| c.csid == csid) {
            return &mut self.channels[idx];
        }
        self.channels.push(TxChannel::new(csid));
        let last = self.channels.len() - 1;
        &mut self.channels[last]
    }
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Choose the smallest legal header for this message and write it
///
/// - Type 0 on the first message, when the timestamp goes backward, or when
///   the message stream id changed.
/// - Type 3 when type id, stream id, length and timestamp delta all match
///   the previous message.
/// - Type 2 when only the delta differs.
/// - Type 1 when only the stream id matches.
///
/// Type 0 embeds the absolute timestamp and resets the stored delta; the
/// others embed the delta. Values above 0xFFFFFF move to the extended field
/// after the message header.
fn fill_header(chan: &mut TxChannel, mtid: u8, msid: u32, len: usize, timestamp: u32) {
    let delta = timestamp as i64 - chan.prev_timestamp as i64;

    let header_type = if chan.first || delta < 0 {
        0
    } else if chan.prev_mtid == mtid
        && chan.prev_msid == msid
        && chan.prev_len == len
        && chan.prev_delta == delta as u32
    {
        3
    } else if chan.prev_mtid == mtid && chan.prev_msid == msid && chan.prev_len == len {
        2
    } else if chan.prev_msid == msid {
        1
    } else {
        0
    };

    write_basic_header(chan.csid, header_type, &mut chan.header);

    let embedded = if header_type == 0 { timestamp } else { delta as u32 };
    let stored_delta = if header_type == 0 { 0 } else { delta as u32 };
    let extended = embedded > EXTENDED_TIMESTAMP_THRESHOLD;

    if header_type < 3 {
        if extended {
            chan.header.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        } else {
            write_u24(embedded, &mut chan.header);
        }
    }
    if header_type < 2 {
        write_u24(len as u32, &mut chan.header);
        chan.header.push(mtid);
    }
    if header_type == 0 {
        // Stream ID is little-endian
        chan.header.extend_from_slice(&msid.to_le_bytes());
    }
    if extended && header_type != 3 {
        chan.header.extend_from_slice(&embedded.to_be_bytes());
    }

    chan.prev_mtid = mtid;
    chan.prev_msid = msid;
    chan.prev_len = len;
    chan.prev_timestamp = timestamp;
    chan.prev_delta = stored_delta;
    chan.first = false;
}

/// Write a basic header
fn write_basic_header(csid: u32, fmt: u8, buf: &mut Vec<u8>) {
    if csid < 64 {
        buf.push((fmt << 6) | csid as u8);
    } else if csid < 320 {
        buf.push(fmt << 6);
        buf.push((csid - 64) as u8);
    } else {
        let offset = csid - 64;
        buf.push((fmt << 6) | 1);
        buf.push((offset & 0xFF) as u8);
        buf.push((offset >> 8) as u8);
    }
}

/// Write a 24-bit big-endian value
fn write_u24(value: u32, buf: &mut Vec<u8>) {
    buf.push(((value >> 16) & 0xFF) as u8);
    buf.push(((value >> 8) & 0xFF) as u8);
    buf.push((value & 0xFF) as u8);
}

/// Per-chunk-stream receive state
#[derive(Debug)]
struct RxChannel {
    csid: u32,
    mtid: u8,
    msid: u32,
    len: usize,
    timestamp: u32,
    delta: u32,
    /// Partial-message accumulator
    msg: BytesMut,
}

impl RxChannel {
    fn new(csid: u32) -> Self {
        Self {
            csid,
            mtid: 0,
            msid: 0,
            len: 0,
            timestamp: 0,
            delta: 0,
            msg: BytesMut::new(),
        }
    }
}

/// Chunk stream decoder
///
/// Reassembles messages chunk by chunk. One call consumes at most one chunk;
/// when the input does not hold a complete parse step, nothing is consumed.
pub struct ChunkReader {
    channels: Vec<RxChannel>,
    chunk_size: u32,
}

impl ChunkReader {
    /// Create a reader with the protocol-default chunk size
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Current receive chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Set the receive chunk size (on an inbound SetChunkSize)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size;
    }

    /// Drop the in-progress message on `target` (on an inbound Abort)
    ///
    /// An abort naming its own carrier channel is ignored.
    pub fn abort(&mut self, target: u32, origin: u32) {
        for chan in &mut self.channels {
            if chan.csid != target || chan.msg.is_empty() {
                continue;
            }
            if chan.csid == origin {
                warn!(csid = target, "abort names its own chunk stream");
                continue;
            }
            chan.msg.clear();
        }
    }

    /// Consume one chunk from `data`
    ///
    /// Returns the number of bytes consumed (0 = more input needed) and the
    /// completed message, if this chunk finished one.
    pub fn consume(&mut self, data: &[u8]) -> Result<(usize, Option<Message>)> {
        const HEADER_LEN: [usize; 4] = [11, 7, 3, 0];

        let mut pos = 0usize;
        if data.is_empty() {
            return Ok((0, None));
        }

        let d = data[pos];
        pos += 1;
        let header_type = (d >> 6) as usize;
        let mut csid = (d & 0x3F) as u32;
        if csid == 0 {
            // basic header on 2 bytes
            if data.len() < pos + 1 {
                return Ok((0, None));
            }
            csid = data[pos] as u32 + 64;
            pos += 1;
        } else if csid == 1 {
            // basic header on 3 bytes
            if data.len() < pos + 2 {
                return Ok((0, None));
            }
            csid = data[pos] as u32 + 64 + 256 * data[pos + 1] as u32;
            pos += 2;
        }

        let header_len = HEADER_LEN[header_type];
        if data.len() < pos + header_len {
            return Ok((0, None));
        }

        let idx = self.channel_idx(csid);
        let chan = &self.channels[idx];
        let is_delta = header_type != 0;

        // Timestamp present in headers 0, 1 and 2
        let (mut timestamp, has_extended) = if header_type < 3 {
            let ts = read_u24(&data[pos..]);
            pos += 3;
            (ts, ts == EXTENDED_TIMESTAMP_THRESHOLD)
        } else {
            (chan.delta, false)
        };
        // Length and type id present in headers 0 and 1
        let (msg_len, mtid) = if header_type < 2 {
            let len = read_u24(&data[pos..]);
            pos += 3;
            let mtid = data[pos];
            pos += 1;
            (len as usize, mtid)
        } else {
            (chan.len, chan.mtid)
        };
        // Stream id only present in header 0
        let msid = if header_type == 0 {
            let msid = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            pos += 4;
            msid
        } else {
            chan.msid
        };

        if has_extended {
            if data.len() < pos + 4 {
                return Ok((0, None));
            }
            timestamp = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            pos += 4;
        }

        let ts_ok = if is_delta {
            timestamp == chan.delta
        } else {
            timestamp == chan.timestamp
        };

        // A changed header field mid-reassembly means the peer abandoned the
        // in-progress message; start over with the new one
        let stale = !chan.msg.is_empty()
            && (chan.len != msg_len || chan.msid != msid || chan.mtid != mtid || !ts_ok);

        let accumulated = if stale { 0 } else { self.channels[idx].msg.len() };
        let missing = msg_len.saturating_sub(accumulated);
        let chunk_len = missing.min(self.chunk_size as usize);
        if data.len() < pos + chunk_len {
            return Ok((0, None));
        }

        let chan = &mut self.channels[idx];
        if stale {
            warn!(csid, "unexpected new message while reassembling");
            chan.msg.clear();
        }

        chan.mtid = mtid;
        chan.msid = msid;
        chan.len = msg_len;
        if is_delta {
            chan.delta = timestamp;
            // The delta advances the clock only when a new message begins
            if chan.msg.is_empty() {
                chan.timestamp = chan.timestamp.wrapping_add(timestamp);
            }
        } else {
            chan.timestamp = timestamp;
            chan.delta = 0;
        }

        chan.msg.extend_from_slice(&data[pos..pos + chunk_len]);
        pos += chunk_len;

        if chan.msg.len() == chan.len {
            let payload = chan.msg.split().freeze();
            let message = Message {
                csid,
                mtid: chan.mtid,
                msid: chan.msid,
                timestamp: chan.timestamp,
                payload,
            };
            Ok((pos, Some(message)))
        } else {
            Ok((pos, None))
        }
    }

    fn channel_idx(&mut self, csid: u32) -> usize {
        if let Some(idx) = self.channels.iter().position(|c| c.csid == csid) {
            return idx;
        }
        self.channels.push(RxChannel::new(csid));
        self.channels.len() - 1
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a 24-bit big-endian value
fn read_u24(data: &[u8]) -> u32 {
    ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32
}
