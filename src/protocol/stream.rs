//! Chunk-stream session
//!
//! Owns one [`ChunkReader`] and one [`ChunkWriter`] plus the connection-wide
//! accounting that sits between them: received-byte totals and the
//! acknowledgement window, the peer bandwidth lattice, and the message
//! stream id assigned by `createStream`.
//!
//! Inbound control messages are handled here; AMF0 commands are surfaced to
//! the connection state machine as [`StreamEvent`]s.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::amf::Amf0Encoder;
use crate::error::{ProtocolError, Result};
use crate::media::flv;
use crate::protocol::chunk::{ChunkReader, ChunkWriter, Message, OutgoingMessage, ReleasedFrame};
use crate::protocol::constants::*;
use crate::protocol::control::{ControlMessage, PeerBandwidth, UserControlEvent};

/// Event surfaced to the connection state machine
#[derive(Debug)]
pub enum StreamEvent {
    /// A complete AMF0 command message
    Command(Bytes),
    /// The peer bandwidth in effect changed (or was restated)
    PeerBandwidthChanged(u32),
}

/// Bidirectional chunk-stream session over one socket
pub struct ChunkStream {
    reader: ChunkReader,
    writer: ChunkWriter,

    window_ack_size: u32,
    total_bytes: u32,
    rcv_bytes_since_last_ack: u32,

    bandwidth: PeerBandwidth,

    /// Message stream id stamped on outgoing media, 0 until `createStream`
    msid: u32,
}

impl ChunkStream {
    pub fn new() -> Self {
        Self {
            reader: ChunkReader::new(),
            writer: ChunkWriter::new(),
            window_ack_size: 0,
            total_bytes: 0,
            rcv_bytes_since_last_ack: 0,
            bandwidth: PeerBandwidth::new(),
            msid: 0,
        }
    }

    /// Record the message stream id returned by `createStream`
    pub fn store_message_stream_id(&mut self, msid: u32) {
        self.msid = msid;
    }

    /// Peer bandwidth currently in effect
    pub fn peer_bandwidth(&self) -> u32 {
        self.bandwidth.value()
    }

    /// Whether any outbound data is queued or partially written
    pub fn has_pending(&self) -> bool {
        self.writer.has_pending()
    }

    /// Ingest received bytes
    ///
    /// `newly_read` is the size of the read that extended `buf`; it feeds the
    /// acknowledgement counters. Complete chunks are consumed from `buf`
    /// (any remainder stays for the next read) and fully reassembled
    /// messages are dispatched.
    pub fn handle_input(
        &mut self,
        buf: &mut BytesMut,
        newly_read: usize,
    ) -> Result<Vec<StreamEvent>> {
        self.total_bytes = self.total_bytes.wrapping_add(newly_read as u32);
        self.rcv_bytes_since_last_ack += newly_read as u32;
        self.send_ack_if_needed()?;

        let mut events = Vec::new();
        loop {
            let (consumed, message) = self.reader.consume(&buf[..])?;
            if consumed == 0 {
                break;
            }
            buf.advance(consumed);
            if let Some(message) = message {
                self.dispatch(message, &mut events)?;
            }
        }
        Ok(events)
    }

    fn dispatch(&mut self, message: Message, events: &mut Vec<StreamEvent>) -> Result<()> {
        if message.mtid == MSG_COMMAND_AMF0 {
            events.push(StreamEvent::Command(message.payload));
            return Ok(());
        }
        if !ControlMessage::is_control(message.mtid) {
            warn!(mtid = message.mtid, csid = message.csid, "unexpected message type");
            return Ok(());
        }

        match ControlMessage::parse(message.mtid, message.payload)? {
            ControlMessage::SetChunkSize(size) => {
                if size != self.reader.chunk_size() {
                    info!(size, "rx chunk size updated");
                    self.reader.set_chunk_size(size);
                }
            }
            ControlMessage::Abort { csid } => {
                self.reader.abort(csid, message.csid);
            }
            ControlMessage::Acknowledgement { sequence } => {
                debug!(sequence, "peer acknowledged");
            }
            ControlMessage::WindowAckSize(window) => {
                info!(window, "window ack size updated");
                self.window_ack_size = window;
                self.send_ack_if_needed()?;
            }
            ControlMessage::SetPeerBandwidth { value, limit_type } => {
                let effective = self.bandwidth.apply(limit_type, value)?;
                events.push(StreamEvent::PeerBandwidthChanged(effective));
            }
            ControlMessage::UserControl(event) => self.handle_user_control(event)?,
        }
        Ok(())
    }

    fn handle_user_control(&mut self, event: UserControlEvent) -> Result<()> {
        match event {
            UserControlEvent::PingRequest(echo) => {
                debug!(echo, "ping request");
                let mut payload = BytesMut::with_capacity(6);
                payload.extend_from_slice(&UC_PING_RESPONSE.to_be_bytes());
                payload.extend_from_slice(&echo.to_be_bytes());
                self.enqueue_control(MSG_USER_CONTROL, payload.freeze(), None)?;
            }
            other => debug!(event = ?other, "user control"),
        }
        Ok(())
    }

    /// Queue an Ack when at least half the window has arrived unacknowledged
    fn send_ack_if_needed(&mut self) -> Result<()> {
        if self.window_ack_size == 0
            || self.rcv_bytes_since_last_ack < self.window_ack_size / 2
        {
            return Ok(());
        }
        let sequence = self.total_bytes;
        self.enqueue_control(
            MSG_ACKNOWLEDGEMENT,
            Bytes::copy_from_slice(&sequence.to_be_bytes()),
            None,
        )?;
        self.rcv_bytes_since_last_ack = 0;
        Ok(())
    }

    /// Announce and latch a new transmit chunk size
    ///
    /// The new size takes effect once the announcement itself has been
    /// flushed, never mid-chunk.
    pub fn set_chunk_size(&mut self, size: u32) -> Result<usize> {
        if size == 0 {
            return Err(ProtocolError::MalformedControl {
                mtid: MSG_SET_CHUNK_SIZE,
                size: 0,
            }
            .into());
        }
        self.enqueue_control(
            MSG_SET_CHUNK_SIZE,
            Bytes::copy_from_slice(&size.to_be_bytes()),
            Some(size),
        )
    }

    /// Ask the peer to drop a partially received message
    pub fn send_abort(&mut self, csid: u32) -> Result<usize> {
        self.enqueue_control(MSG_ABORT, Bytes::copy_from_slice(&csid.to_be_bytes()), None)
    }

    /// Announce this side's acknowledgement window
    pub fn send_window_ack_size(&mut self, window: u32) -> Result<usize> {
        self.enqueue_control(
            MSG_WINDOW_ACK_SIZE,
            Bytes::copy_from_slice(&window.to_be_bytes()),
            None,
        )
    }

    fn enqueue_control(
        &mut self,
        mtid: u8,
        payload: Bytes,
        next_chunk_size: Option<u32>,
    ) -> Result<usize> {
        self.writer.enqueue(
            CSID_PROTOCOL_CONTROL,
            OutgoingMessage {
                data_header: Bytes::new(),
                payload,
                token: 0,
                mtid,
                msid: 0,
                timestamp: 0,
                internal: true,
                next_chunk_size,
            },
        )
    }

    /// Queue an AMF0 command on the given chunk stream
    pub fn send_command(&mut self, csid: u32, payload: Bytes) -> Result<usize> {
        self.writer.enqueue(
            csid,
            OutgoingMessage {
                data_header: Bytes::new(),
                payload,
                token: 0,
                mtid: MSG_COMMAND_AMF0,
                msid: 0,
                timestamp: 0,
                internal: true,
                next_chunk_size: None,
            },
        )
    }

    /// Queue a metadata payload, prefixed with the `@setDataFrame` string
    pub fn send_metadata(
        &mut self,
        payload: Bytes,
        timestamp: u32,
        internal: bool,
        token: u64,
    ) -> Result<usize> {
        let mut enc = Amf0Encoder::new();
        enc.string(CMD_SET_DATA_FRAME)?;
        let data_header = enc.finish()?;
        self.writer.enqueue(
            CSID_MEDIA,
            OutgoingMessage {
                data_header,
                payload,
                token,
                mtid: MSG_DATA_AMF0,
                msid: self.msid,
                timestamp,
                internal,
                next_chunk_size: None,
            },
        )
    }

    /// Queue a video payload behind its 5-byte FLV tag header
    pub fn send_video(
        &mut self,
        payload: Bytes,
        timestamp: u32,
        is_config: bool,
        is_key: bool,
        token: u64,
    ) -> Result<usize> {
        let data_header = Bytes::copy_from_slice(&flv::video_tag_header(is_key, is_config));
        self.writer.enqueue(
            CSID_MEDIA,
            OutgoingMessage {
                data_header,
                payload,
                token,
                mtid: MSG_VIDEO,
                msid: self.msid,
                timestamp,
                internal: false,
                next_chunk_size: None,
            },
        )
    }

    /// Queue an audio payload behind its 2-byte FLV tag header
    pub fn send_audio(
        &mut self,
        payload: Bytes,
        timestamp: u32,
        is_config: bool,
        setting: u8,
        token: u64,
    ) -> Result<usize> {
        let data_header = Bytes::copy_from_slice(&flv::audio_tag_header(setting, is_config));
        self.writer.enqueue(
            CSID_AUDIO,
            OutgoingMessage {
                data_header,
                payload,
                token,
                mtid: MSG_AUDIO,
                msid: self.msid,
                timestamp,
                internal: false,
                next_chunk_size: None,
            },
        )
    }

    /// Drain outbound queues to the socket
    pub async fn write_pending<W: AsyncWrite + Unpin>(
        &mut self,
        io: &mut W,
        released: &mut Vec<ReleasedFrame>,
    ) -> Result<()> {
        self.writer.write_pending(io, released).await
    }

    /// Drop queued caller frames that have not started transmission
    pub fn discard_queued(&mut self, released: &mut Vec<ReleasedFrame>) {
        self.writer.discard_queued(released);
    }

    /// Release every queued caller payload (teardown)
    pub fn release_all(&mut self, released: &mut Vec<ReleasedFrame>) {
        self.writer.release_all(released);
    }
}

impl Default for ChunkStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build server-side wire bytes from a list of (mtid, payload)
    async fn server_bytes(messages: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut writer = ChunkWriter::new();
        for (mtid, payload) in messages {
            writer
                .enqueue(
                    CSID_PROTOCOL_CONTROL,
                    OutgoingMessage {
                        data_header: Bytes::new(),
                        payload: Bytes::copy_from_slice(payload),
                        token: 0,
                        mtid: *mtid,
                        msid: 0,
                        timestamp: 0,
                        internal: true,
                        next_chunk_size: None,
                    },
                )
                .unwrap();
        }
        let mut out = Vec::new();
        let mut released = Vec::new();
        writer.write_pending(&mut out, &mut released).await.unwrap();
        out
    }

    /// Drain the stream's writer and parse what it sent
    async fn sent_messages(stream: &mut ChunkStream) -> Vec<Message> {
        let mut out = Vec::new();
        let mut released = Vec::new();
        stream.write_pending(&mut out, &mut released).await.unwrap();

        let mut reader = ChunkReader::new();
        let mut messages = Vec::new();
        let mut data: &[u8] = &out;
        while !data.is_empty() {
            let (consumed, complete) = reader.consume(data).unwrap();
            assert!(consumed > 0);
            if let Some(m) = complete {
                messages.push(m);
            }
            data = &data[consumed..];
        }
        messages
    }

    #[tokio::test]
    async fn test_ack_cadence() {
        let mut stream = ChunkStream::new();

        // Window announcement: 16 bytes on the wire
        let window = server_bytes(&[(MSG_WINDOW_ACK_SIZE, 1000u32.to_be_bytes().to_vec())]).await;
        assert_eq!(window.len(), 16);
        let mut buf = BytesMut::from(&window[..]);
        stream.handle_input(&mut buf, window.len()).unwrap();

        // A 5000-byte message fed in 100-byte reads
        let bulk = server_bytes(&[(MSG_AUDIO, vec![0x5A; 5000])]).await;
        let mut fed = 0;
        let mut buf = BytesMut::new();
        while fed < bulk.len() {
            let n = 100.min(bulk.len() - fed);
            buf.extend_from_slice(&bulk[fed..fed + n]);
            fed += n;
            stream.handle_input(&mut buf, n).unwrap();
        }

        let total = window.len() + bulk.len();
        let expected = 2 * total / 1000;
        let acks: Vec<_> = sent_messages(&mut stream)
            .await
            .into_iter()
            .filter(|m| m.mtid == MSG_ACKNOWLEDGEMENT)
            .collect();
        assert_eq!(acks.len(), expected);
        // Each ack carries the cumulative byte count at the time it fired
        let first = u32::from_be_bytes([acks[0].payload[0], acks[0].payload[1], acks[0].payload[2], acks[0].payload[3]]);
        assert!(first >= 500);
        assert!(first < 500 + 100 + window.len() as u32);
    }

    #[tokio::test]
    async fn test_ping_request_answered() {
        let mut stream = ChunkStream::new();

        let mut ping = vec![0, 6];
        ping.extend_from_slice(&0x01020304u32.to_be_bytes());
        let wire = server_bytes(&[(MSG_USER_CONTROL, ping)]).await;

        let mut buf = BytesMut::from(&wire[..]);
        let events = stream.handle_input(&mut buf, wire.len()).unwrap();
        assert!(events.is_empty());

        let sent = sent_messages(&mut stream).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mtid, MSG_USER_CONTROL);
        assert_eq!(sent[0].csid, CSID_PROTOCOL_CONTROL);
        assert_eq!(&sent[0].payload[..], &[0, 7, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_bandwidth_events() {
        let mut stream = ChunkStream::new();

        let mut messages = Vec::new();
        for (value, limit) in [(1000u32, 0u8), (800, 1), (1500, 2), (500, 0)] {
            let mut payload = value.to_be_bytes().to_vec();
            payload.push(limit);
            messages.push((MSG_SET_PEER_BANDWIDTH, payload));
        }
        let wire = server_bytes(&messages).await;

        let mut buf = BytesMut::from(&wire[..]);
        let events = stream.handle_input(&mut buf, wire.len()).unwrap();

        let values: Vec<u32> = events
            .iter()
            .map(|e| match e {
                StreamEvent::PeerBandwidthChanged(v) => *v,
                other => panic!("unexpected event: {:?}", other),
            })
            .collect();
        assert_eq!(values, vec![1000, 800, 800, 500]);
        assert_eq!(stream.peer_bandwidth(), 500);
    }

    #[tokio::test]
    async fn test_malformed_control_rejected() {
        let mut stream = ChunkStream::new();
        let wire = server_bytes(&[(MSG_WINDOW_ACK_SIZE, vec![0, 0, 1])]).await;
        let mut buf = BytesMut::from(&wire[..]);
        assert!(stream.handle_input(&mut buf, wire.len()).is_err());
    }

    #[tokio::test]
    async fn test_commands_surface_to_caller() {
        let mut stream = ChunkStream::new();

        let mut enc = Amf0Encoder::new();
        enc.string("onStatus").unwrap().number(0.0).unwrap();
        let payload = enc.finish().unwrap();

        let mut writer = ChunkWriter::new();
        writer
            .enqueue(
                CSID_COMMAND,
                OutgoingMessage {
                    data_header: Bytes::new(),
                    payload: payload.clone(),
                    token: 0,
                    mtid: MSG_COMMAND_AMF0,
                    msid: 0,
                    timestamp: 0,
                    internal: true,
                    next_chunk_size: None,
                },
            )
            .unwrap();
        let mut wire = Vec::new();
        let mut released = Vec::new();
        writer.write_pending(&mut wire, &mut released).await.unwrap();

        let mut buf = BytesMut::from(&wire[..]);
        let events = stream.handle_input(&mut buf, wire.len()).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Command(data) => assert_eq!(&data[..], &payload[..]),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_chunk_size_applies_after_announcement() {
        let mut stream = ChunkStream::new();
        stream.set_chunk_size(256).unwrap();
        stream
            .send_command(CSID_COMMAND, Bytes::from(vec![0u8; 300]))
            .unwrap();

        let sent = sent_messages(&mut stream).await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].mtid, MSG_SET_CHUNK_SIZE);
        assert_eq!(sent[1].payload.len(), 300);
    }

    #[tokio::test]
    async fn test_media_send_uses_stored_msid() {
        let mut stream = ChunkStream::new();
        stream.store_message_stream_id(7);

        stream
            .send_video(Bytes::from(vec![0u8; 32]), 40, false, true, 1)
            .unwrap();
        stream
            .send_audio(Bytes::from(vec![0u8; 16]), 40, false, 0xAF, 2)
            .unwrap();
        stream
            .send_metadata(Bytes::from(vec![0u8; 8]), 0, false, 3)
            .unwrap();

        let sent = sent_messages(&mut stream).await;
        assert_eq!(sent.len(), 3);
        for m in &sent {
            assert_eq!(m.msid, 7);
        }
        // Video and metadata on csid 4, audio on csid 3
        assert_eq!(sent[0].csid, CSID_MEDIA);
        assert_eq!(sent[0].payload[0], 0x17);
        assert_eq!(sent[0].payload[1], 0x01);
        assert_eq!(sent[1].csid, CSID_AUDIO);
        assert_eq!(&sent[1].payload[..2], &[0xAF, 0x01]);
        assert_eq!(sent[2].csid, CSID_MEDIA);
        // Metadata payload starts with the AMF string "@setDataFrame"
        assert_eq!(sent[2].payload[0], 0x02);
        assert_eq!(&sent[2].payload[3..16], b"@setDataFrame");
    }
}
