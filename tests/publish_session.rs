//! End-to-end publishing scenarios against a mocked RTMP server
//!
//! The server side runs over an in-memory duplex pipe and reuses the
//! crate's chunk codec to frame its half of the dialogue.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use rtmp_push::amf::{Amf0Decoder, Amf0Encoder};
use rtmp_push::error::Error;
use rtmp_push::protocol::chunk::{ChunkReader, ChunkWriter, Message, OutgoingMessage};
use rtmp_push::protocol::constants::*;
use rtmp_push::{
    ClientConfig, ConnectionState, DisconnectionReason, MetadataParams, PublisherEvent,
    RtmpPublisher,
};

const TEST_URL: &str = "rtmp://127.0.0.1:1935/app/key";

struct MockServer {
    io: DuplexStream,
    rcvbuf: BytesMut,
    reader: ChunkReader,
    writer: ChunkWriter,
}

impl MockServer {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            rcvbuf: BytesMut::with_capacity(8192),
            reader: ChunkReader::new(),
            writer: ChunkWriter::new(),
        }
    }

    /// Serve the handshake; checks that C2 echoes S1 byte for byte
    async fn handshake(&mut self) {
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        self.io.read_exact(&mut c0c1).await.unwrap();
        assert_eq!(c0c1[0], RTMP_VERSION);
        // C1 starts with 8 zero bytes
        assert_eq!(&c0c1[1..9], &[0u8; 8]);

        let s1: Vec<u8> = (0..HANDSHAKE_SIZE).map(|i| (i * 3 + 1) as u8).collect();
        self.io.write_all(&[RTMP_VERSION]).await.unwrap();
        self.io.write_all(&s1).await.unwrap();
        // S2 echoes C1
        self.io.write_all(&c0c1[1..]).await.unwrap();

        let mut c2 = vec![0u8; HANDSHAKE_SIZE];
        self.io.read_exact(&mut c2).await.unwrap();
        assert_eq!(c2, s1, "C2 must echo S1");
    }

    /// Read one reassembled message from the wire
    async fn recv_message(&mut self) -> Message {
        loop {
            loop {
                let (consumed, message) = self.reader.consume(&self.rcvbuf).unwrap();
                if consumed == 0 {
                    break;
                }
                self.rcvbuf.advance(consumed);
                if let Some(message) = message {
                    return message;
                }
            }
            let n = self.io.read_buf(&mut self.rcvbuf).await.unwrap();
            assert!(n > 0, "client closed the connection mid-test");
        }
    }

    /// Next non-control message, applying SetChunkSize on the way
    async fn next_message(&mut self) -> Message {
        loop {
            let message = self.recv_message().await;
            match message.mtid {
                MSG_SET_CHUNK_SIZE => {
                    let size = u32::from_be_bytes(message.payload[..4].try_into().unwrap());
                    self.reader.set_chunk_size(size);
                }
                MSG_ACKNOWLEDGEMENT => {}
                _ => return message,
            }
        }
    }

    /// Next AMF0 command as (name, transaction id, raw message)
    async fn next_command(&mut self) -> (String, f64, Message) {
        loop {
            let message = self.next_message().await;
            if message.mtid != MSG_COMMAND_AMF0 {
                continue;
            }
            let mut dec = Amf0Decoder::new(message.payload.clone());
            let (name, id) = dec.command_name().unwrap();
            return (name, id, message);
        }
    }

    async fn send(&mut self, csid: u32, mtid: u8, payload: Bytes) {
        self.writer
            .enqueue(
                csid,
                OutgoingMessage {
                    data_header: Bytes::new(),
                    payload,
                    token: 0,
                    mtid,
                    msid: 0,
                    timestamp: 0,
                    internal: true,
                    next_chunk_size: None,
                },
            )
            .unwrap();
        let mut released = Vec::new();
        self.writer
            .write_pending(&mut self.io, &mut released)
            .await
            .unwrap();
    }

    async fn send_command(&mut self, payload: Bytes) {
        self.send(CSID_COMMAND, MSG_COMMAND_AMF0, payload).await;
    }

    async fn send_result(&mut self, id: f64) {
        let mut enc = Amf0Encoder::new();
        enc.string("_result").unwrap().number(id).unwrap();
        enc.null().unwrap().null().unwrap();
        self.send_command(enc.finish().unwrap()).await;
    }

    async fn send_create_stream_result(&mut self, id: f64, stream_id: f64) {
        let mut enc = Amf0Encoder::new();
        enc.string("_result").unwrap().number(id).unwrap();
        enc.null().unwrap().number(stream_id).unwrap();
        self.send_command(enc.finish().unwrap()).await;
    }

    async fn send_status(&mut self, level: &str, code: &str, description: &str) {
        let mut enc = Amf0Encoder::new();
        enc.string("onStatus").unwrap().number(0.0).unwrap();
        enc.null().unwrap();
        enc.begin_object().unwrap();
        enc.property("level").unwrap().string(level).unwrap();
        enc.property("code").unwrap().string(code).unwrap();
        enc.property("description").unwrap().string(description).unwrap();
        enc.end_object().unwrap();
        self.send_command(enc.finish().unwrap()).await;
    }

    /// Drive the dialogue from `connect` up to (not including) the final
    /// onStatus; returns the createStream transaction id
    async fn dialogue_until_publish(&mut self) -> f64 {
        // connect, with the expected command object
        let (name, id, message) = self.next_command().await;
        assert_eq!(name, "connect");
        assert_eq!(id, 1.0);
        let mut dec = Amf0Decoder::new(message.payload.clone());
        dec.command_name().unwrap();
        let object = parse_string_properties(&mut dec);
        assert_eq!(object.get("app").map(String::as_str), Some("app"));
        assert_eq!(object.get("type").map(String::as_str), Some("nonprivate"));
        assert_eq!(
            object.get("flashVer").map(String::as_str),
            Some("FMLE/3.0 (compatible; librtmp)")
        );
        assert_eq!(
            object.get("tcUrl").map(String::as_str),
            Some("rtmp://127.0.0.1:1935/app")
        );

        self.send_result(1.0).await;

        // onBWDone makes the client answer _checkbw
        let mut enc = Amf0Encoder::new();
        enc.string("onBWDone").unwrap().number(0.0).unwrap().null().unwrap();
        self.send_command(enc.finish().unwrap()).await;

        let (name, release_id, _) = self.next_command().await;
        assert_eq!(name, "releaseStream");
        let (name, fc_id, _) = self.next_command().await;
        assert_eq!(name, "FCPublish");
        let (name, create_id, _) = self.next_command().await;
        assert_eq!(name, "createStream");
        let (name, _, _) = self.next_command().await;
        assert_eq!(name, "_checkbw");

        // Results for the tracked and untracked calls
        self.send_result(release_id).await;
        self.send_result(fc_id).await;
        self.send_create_stream_result(create_id, 1.0).await;

        // publish goes out on the media chunk stream
        let (name, _, message) = self.next_command().await;
        assert_eq!(name, "publish");
        assert_eq!(message.csid, CSID_MEDIA);
        let mut dec = Amf0Decoder::new(message.payload.clone());
        dec.command_name().unwrap();
        dec.null().unwrap();
        assert_eq!(dec.string().unwrap(), "key");
        assert_eq!(dec.string().unwrap(), "live");

        create_id
    }
}

/// Collect string-valued properties of the next object
fn parse_string_properties(dec: &mut Amf0Decoder) -> HashMap<String, String> {
    let mut out = HashMap::new();
    dec.object_start().unwrap();
    loop {
        let key = dec.property_key().unwrap();
        if key.is_empty() {
            break;
        }
        match dec.string() {
            Ok(value) => {
                out.insert(key, value);
            }
            Err(_) => dec.skip_value().unwrap(),
        }
    }
    out
}

async fn wait_for_state(
    events: &mut mpsc::Receiver<PublisherEvent>,
    want: ConnectionState,
) -> Option<DisconnectionReason> {
    loop {
        match events.recv().await {
            Some(PublisherEvent::StateChanged { state, reason }) if state == want => {
                return reason;
            }
            Some(_) => {}
            None => panic!("event channel closed before reaching {:?}", want),
        }
    }
}

/// Bring up a fully connected session and hand back the server
async fn connected_session() -> (
    RtmpPublisher,
    mpsc::Receiver<PublisherEvent>,
    MockServer,
) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let config = ClientConfig::new(TEST_URL);
    let (publisher, mut events) = RtmpPublisher::connect_with_transport(config, client_io)
        .await
        .unwrap();

    let server = tokio::spawn(async move {
        let mut server = MockServer::new(server_io);
        server.handshake().await;
        server.dialogue_until_publish().await;
        server
            .send_status("status", "NetStream.Publish.Start", "Publishing stream")
            .await;
        server
    });

    assert_eq!(wait_for_state(&mut events, ConnectionState::Connecting).await, None);
    assert_eq!(wait_for_state(&mut events, ConnectionState::Connected).await, None);
    let server = server.await.unwrap();
    (publisher, events, server)
}

/// AVCC unit: 4-byte length prefix + one NAL
fn nalu(nal_type: u8, len: usize) -> Vec<u8> {
    let mut out = ((len + 1) as u32).to_be_bytes().to_vec();
    out.push(nal_type & 0x1F);
    out.extend(std::iter::repeat(0xD0).take(len));
    out
}

#[tokio::test]
async fn test_dialogue_to_connected_and_clean_disconnect() {
    timeout(Duration::from_secs(10), async {
        let (publisher, mut events, mut server) = connected_session().await;

        publisher.disconnect().await.unwrap();
        assert_eq!(
            wait_for_state(&mut events, ConnectionState::Disconnected).await,
            Some(DisconnectionReason::ClientRequest)
        );

        // deleteStream for the published stream id goes out first
        let (name, _, message) = server.next_command().await;
        assert_eq!(name, "deleteStream");
        let mut dec = Amf0Decoder::new(message.payload.clone());
        dec.command_name().unwrap();
        dec.null().unwrap();
        assert_eq!(dec.number().unwrap(), 1.0);

        // Further sends report the closed connection
        let err = publisher
            .send_video_frame(Bytes::from_static(&[0, 0, 0, 1, 0x41]), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_video_stream_framing() {
    timeout(Duration::from_secs(10), async {
        let (publisher, mut events, mut server) = connected_session().await;

        let avcc = Bytes::from(vec![
            0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x02, 0x67, 0x64, 0x01,
        ]);
        let waiting = publisher.send_video_avcc(avcc.clone(), 1).await.unwrap();
        assert_eq!(waiting, 0);

        for i in 0..10u32 {
            let mut frame = nalu(1, 40);
            if i == 5 {
                frame.extend(nalu(5, 60));
            }
            publisher
                .send_video_frame(Bytes::from(frame), i * 33, 100 + i as u64)
                .await
                .unwrap();
        }

        // Sequence header first
        let message = server.next_message().await;
        assert_eq!(message.mtid, MSG_VIDEO);
        assert_eq!(message.csid, CSID_MEDIA);
        assert_eq!(message.msid, 1);
        assert_eq!(message.timestamp, 0);
        assert_eq!(&message.payload[..2], &[0x17, 0x00]);
        assert_eq!(&message.payload[5..], &avcc[..]);

        // Then the frames, keyframe bit only on the IDR
        for i in 0..10u32 {
            let message = server.next_message().await;
            assert_eq!(message.mtid, MSG_VIDEO);
            assert_eq!(message.csid, CSID_MEDIA);
            assert_eq!(message.timestamp, i * 33);
            let expected = if i == 5 { 0x17 } else { 0x27 };
            assert_eq!(message.payload[0], expected, "frame {}", i);
            assert_eq!(message.payload[1], 0x01);
        }

        // Every caller payload is handed back exactly once, in wire order
        let mut tokens = Vec::new();
        while tokens.len() < 11 {
            match events.recv().await.unwrap() {
                PublisherEvent::FrameReleased { token, .. } => tokens.push(token),
                _ => {}
            }
        }
        assert_eq!(tokens[0], 1);
        assert_eq!(&tokens[1..], &(100..110).collect::<Vec<u64>>()[..]);

        drop(publisher);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_metadata_and_audio_framing() {
    timeout(Duration::from_secs(10), async {
        let (publisher, mut events, mut server) = connected_session().await;

        publisher
            .send_metadata(MetadataParams {
                width: 1280,
                height: 720,
                framerate: 30.0,
                audio_sample_rate: 44100,
                audio_sample_size: 16,
                ..Default::default()
            })
            .await
            .unwrap();

        // AAC-LC 44100 stereo config, then one raw frame
        let asc = Bytes::from_static(&[0x12, 0x10]);
        publisher.send_audio_specific_config(asc.clone(), 7).await.unwrap();
        publisher
            .send_audio_data(Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]), 23, 8)
            .await
            .unwrap();

        let message = server.next_message().await;
        assert_eq!(message.mtid, MSG_DATA_AMF0);
        assert_eq!(message.csid, CSID_MEDIA);
        // @setDataFrame prefix, then the onMetaData array
        let mut dec = Amf0Decoder::new(message.payload.clone());
        assert_eq!(dec.string().unwrap(), "@setDataFrame");
        assert_eq!(dec.string().unwrap(), "onMetaData");

        let message = server.next_message().await;
        assert_eq!(message.mtid, MSG_AUDIO);
        assert_eq!(message.csid, CSID_AUDIO);
        assert_eq!(&message.payload[..2], &[0xAF, 0x00]);
        assert_eq!(&message.payload[2..], &asc[..]);

        let message = server.next_message().await;
        assert_eq!(message.mtid, MSG_AUDIO);
        assert_eq!(message.timestamp, 23);
        // The cached setting byte is reused for data packets
        assert_eq!(&message.payload[..2], &[0xAF, 0x01]);

        // Only the caller-owned payloads come back
        let mut tokens = Vec::new();
        while tokens.len() < 2 {
            match events.recv().await.unwrap() {
                PublisherEvent::FrameReleased { token, .. } => tokens.push(token),
                _ => {}
            }
        }
        assert_eq!(tokens, vec![7, 8]);

        drop(publisher);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_publish_denied_maps_to_already_in_use() {
    timeout(Duration::from_secs(10), async {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let config = ClientConfig::new(TEST_URL);
        let (_publisher, mut events) = RtmpPublisher::connect_with_transport(config, client_io)
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            let mut server = MockServer::new(server_io);
            server.handshake().await;
            server.dialogue_until_publish().await;
            server
                .send_status(
                    "error",
                    "NetStream.Publish.Denied",
                    "Stream name is already in use",
                )
                .await;
            server
        });

        assert_eq!(
            wait_for_state(&mut events, ConnectionState::Disconnected).await,
            Some(DisconnectionReason::AlreadyInUse)
        );
        let _server = server.await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_server_chunk_size_renegotiation() {
    timeout(Duration::from_secs(10), async {
        let (publisher, mut events, mut server) = connected_session().await;

        // The server grows its chunk size, then sends a 10000-byte message
        // (3 chunks at 4096); the client has to reassemble it and keep going
        server
            .writer
            .enqueue(
                CSID_PROTOCOL_CONTROL,
                OutgoingMessage {
                    data_header: Bytes::new(),
                    payload: Bytes::copy_from_slice(&4096u32.to_be_bytes()),
                    token: 0,
                    mtid: MSG_SET_CHUNK_SIZE,
                    msid: 0,
                    timestamp: 0,
                    internal: true,
                    next_chunk_size: Some(4096),
                },
            )
            .unwrap();
        let mut released = Vec::new();
        server
            .writer
            .write_pending(&mut server.io, &mut released)
            .await
            .unwrap();

        server
            .send(CSID_COMMAND, MSG_AUDIO, Bytes::from(vec![0x11; 10000]))
            .await;

        // A ping through the same pipe proves the client parsed past it
        let mut ping = vec![0u8, 6];
        ping.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        server
            .send(CSID_PROTOCOL_CONTROL, MSG_USER_CONTROL, Bytes::from(ping))
            .await;

        let message = server.next_message().await;
        assert_eq!(message.mtid, MSG_USER_CONTROL);
        assert_eq!(&message.payload[..2], &[0, 7]);
        assert_eq!(&message.payload[2..6], &0xCAFEBABEu32.to_be_bytes());

        drop(publisher);
        let _ = events.recv().await;
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_fires_on_silent_socket() {
    let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);
    let config = ClientConfig::new(TEST_URL);
    let (_publisher, mut events) = RtmpPublisher::connect_with_transport(config, client_io)
        .await
        .unwrap();

    // Swallow C0C1 and answer with S0 only, then go silent
    let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
    server_io.read_exact(&mut c0c1).await.unwrap();
    server_io.write_all(&[RTMP_VERSION]).await.unwrap();

    assert_eq!(
        wait_for_state(&mut events, ConnectionState::Connecting).await,
        None
    );
    assert_eq!(
        wait_for_state(&mut events, ConnectionState::Disconnected).await,
        Some(DisconnectionReason::Timeout)
    );
}

#[tokio::test]
async fn test_queue_full_backpressure() {
    timeout(Duration::from_secs(10), async {
        // A small pipe the server never drains: writes stall quickly
        let (client_io, server_io) = tokio::io::duplex(512);

        let config = ClientConfig::new(TEST_URL);
        let (publisher, mut events) = RtmpPublisher::connect_with_transport(config, client_io)
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            let mut server = MockServer::new(server_io);
            server.handshake().await;
            server.dialogue_until_publish().await;
            server
                .send_status("status", "NetStream.Publish.Start", "go")
                .await;
            server
        });
        wait_for_state(&mut events, ConnectionState::Connected).await;
        let _server = server.await.unwrap();

        // 4 KiB frames cannot complete through a 512-byte pipe
        let frame = Bytes::from(nalu(1, 4096));
        let mut results = Vec::new();
        for i in 0..MAX_QUEUE as u32 {
            results.push(
                publisher
                    .send_video_frame(frame.clone(), i * 33, i as u64)
                    .await
                    .unwrap(),
            );
        }
        // The first frame went mid-flight; everything else queued behind it
        assert_eq!(results[0], 0);
        assert_eq!(*results.last().unwrap(), MAX_QUEUE - 1);

        let err = publisher
            .send_video_frame(frame.clone(), 999, 99)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));

        drop(publisher);
    })
    .await
    .unwrap();
}
