//! RTMP publisher
//!
//! High-level client driving the full publishing flow: TCP (or a supplied
//! transport), the handshake, the AMF0 dialogue up to
//! `onStatus(NetStream.Publish.Start)`, and media transmission with
//! per-channel back pressure.
//!
//! All connection state lives on one spawned task; the [`RtmpPublisher`]
//! handle talks to it over a command channel and the caller observes
//! [`PublisherEvent`]s on the receiver returned by the connect functions.

use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::amf::{Amf0Decoder, Amf0Encoder};
use crate::error::{ConnectionState, DisconnectionReason, Error, Result};
use crate::media::flv::MetadataParams;
use crate::media::{aac, flv, h264};
use crate::protocol::constants::*;
use crate::protocol::handshake::{ClientHandshake, HandshakePhase};
use crate::protocol::stream::{ChunkStream, StreamEvent};

use super::config::{ClientConfig, RtmpUri};

/// Command channel depth between the handle and the driver task
const CMD_CHANNEL_CAPACITY: usize = 32;

/// Grace period for flushing `deleteStream` during teardown
const TEARDOWN_FLUSH_MS: u64 = 500;

/// Audio setting byte used when audio data arrives before any config
const DEFAULT_AUDIO_SETTING: u8 = 0xAF;

/// Event delivered to the caller
#[derive(Debug)]
pub enum PublisherEvent {
    /// The TCP socket is connected (not emitted for supplied transports)
    SocketConnected { local: SocketAddr, peer: SocketAddr },

    /// The public connection state changed; `reason` accompanies
    /// transitions to `Disconnected`
    StateChanged {
        state: ConnectionState,
        reason: Option<DisconnectionReason>,
    },

    /// The server restated its bandwidth limit
    PeerBandwidthChanged(u32),

    /// A caller-owned payload is no longer needed by the client
    ///
    /// Emitted exactly once for every payload accepted by a send call.
    FrameReleased { data: Bytes, token: u64 },
}

enum Command {
    Metadata {
        params: MetadataParams,
        reply: oneshot::Sender<Result<usize>>,
    },
    PackedMetadata {
        data: Bytes,
        timestamp: u32,
        token: u64,
        reply: oneshot::Sender<Result<usize>>,
    },
    VideoConfig {
        data: Bytes,
        token: u64,
        reply: oneshot::Sender<Result<usize>>,
    },
    VideoFrame {
        data: Bytes,
        timestamp: u32,
        token: u64,
        reply: oneshot::Sender<Result<usize>>,
    },
    AudioConfig {
        data: Bytes,
        token: u64,
        reply: oneshot::Sender<Result<usize>>,
    },
    AudioFrame {
        data: Bytes,
        timestamp: u32,
        token: u64,
        reply: oneshot::Sender<Result<usize>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a publishing connection
///
/// Media send calls return the number of frames already waiting on the same
/// channel (0 = the frame goes out on the next write), or `QueueFull` when
/// the caller is far ahead of the network. Dropping the handle disconnects.
pub struct RtmpPublisher {
    cmd_tx: mpsc::Sender<Command>,
}

impl RtmpPublisher {
    /// Connect to the RTMP URL in `config` over TCP
    ///
    /// Returns immediately after URI validation; connection progress is
    /// reported through the event receiver (`Connecting`, then `Connected`
    /// once the server accepts the publish).
    pub async fn connect(config: ClientConfig) -> Result<(Self, mpsc::Receiver<PublisherEvent>)> {
        let uri = config.uri()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

        tokio::spawn(async move {
            let _ = event_tx
                .send(PublisherEvent::StateChanged {
                    state: ConnectionState::Connecting,
                    reason: None,
                })
                .await;

            match tcp_connect(&config, &uri, &event_tx).await {
                Ok(socket) => {
                    let driver =
                        Driver::new(config, uri, socket, cmd_rx, event_tx, ConnectionState::Connecting);
                    driver.run().await;
                }
                Err(reason) => {
                    let _ = event_tx
                        .send(PublisherEvent::StateChanged {
                            state: ConnectionState::Disconnected,
                            reason: Some(reason),
                        })
                        .await;
                }
            }
        });

        Ok((Self { cmd_tx }, event_rx))
    }

    /// Publish over an already-established byte stream
    ///
    /// The transport only has to honour the usual read/write contract, which
    /// is how a TLS wrapper (or an in-memory pipe in tests) plugs in.
    pub async fn connect_with_transport<S>(
        config: ClientConfig,
        transport: S,
    ) -> Result<(Self, mpsc::Receiver<PublisherEvent>)>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let uri = config.uri()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

        let driver = Driver::new(
            config,
            uri,
            transport,
            cmd_rx,
            event_tx,
            ConnectionState::Disconnected,
        );
        tokio::spawn(driver.run());

        Ok((Self { cmd_tx }, event_rx))
    }

    /// Send an `onMetaData` packet built from the given stream properties
    pub async fn send_metadata(&self, params: MetadataParams) -> Result<usize> {
        self.call(|reply| Command::Metadata { params, reply }).await
    }

    /// Send a caller-encoded AMF0 metadata payload
    pub async fn send_packed_metadata(
        &self,
        data: Bytes,
        timestamp: u32,
        token: u64,
    ) -> Result<usize> {
        self.call(|reply| Command::PackedMetadata { data, timestamp, token, reply })
            .await
    }

    /// Send the avcC decoder configuration (video sequence header)
    pub async fn send_video_avcc(&self, data: Bytes, token: u64) -> Result<usize> {
        self.call(|reply| Command::VideoConfig { data, token, reply }).await
    }

    /// Send one AVCC video frame; the keyframe flag is derived from its NALs
    pub async fn send_video_frame(&self, data: Bytes, timestamp: u32, token: u64) -> Result<usize> {
        self.call(|reply| Command::VideoFrame { data, timestamp, token, reply })
            .await
    }

    /// Send the AAC AudioSpecificConfig (audio sequence header)
    pub async fn send_audio_specific_config(&self, data: Bytes, token: u64) -> Result<usize> {
        self.call(|reply| Command::AudioConfig { data, token, reply }).await
    }

    /// Send one raw AAC frame
    pub async fn send_audio_data(&self, data: Bytes, timestamp: u32, token: u64) -> Result<usize> {
        self.call(|reply| Command::AudioFrame { data, timestamp, token, reply })
            .await
    }

    /// Drop queued frames that have not started transmission
    pub async fn flush(&self) -> Result<()> {
        self.call(|reply| Command::Flush { reply }).await
    }

    /// Disconnect, sending `deleteStream` when the publish was running
    ///
    /// Resolves once the `Disconnected` state change has been emitted.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect { reply }).await.is_err() {
            // Driver already gone: the connection is down
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn call<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}

/// Internal connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    WaitDns,
    WaitTcp,
    WaitS0,
    WaitS1,
    WaitS2,
    WaitFms,
    Ready,
}

impl Phase {
    fn public(self) -> ConnectionState {
        match self {
            Phase::Idle => ConnectionState::Disconnected,
            Phase::Ready => ConnectionState::Connected,
            _ => ConnectionState::Connecting,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::WaitDns => "WAIT_DNS",
            Phase::WaitTcp => "WAIT_TCP",
            Phase::WaitS0 => "WAIT_S0",
            Phase::WaitS1 => "WAIT_S1",
            Phase::WaitS2 => "WAIT_S2",
            Phase::WaitFms => "WAIT_FMS",
            Phase::Ready => "READY",
        }
    }
}

/// Resolve and connect the TCP socket (the WaitDns / WaitTcp phases)
async fn tcp_connect(
    config: &ClientConfig,
    uri: &RtmpUri,
    events: &mpsc::Sender<PublisherEvent>,
) -> std::result::Result<TcpStream, DisconnectionReason> {
    info!(phase = Phase::WaitDns.as_str(), uri = %uri.anonymized(), "connecting");

    let target = (uri.host.clone(), uri.port_or_default());
    let mut addrs = timeout(config.connect_timeout, tokio::net::lookup_host(target))
        .await
        .map_err(|_| {
            warn!(host = %uri.host, "name resolution timed out");
            DisconnectionReason::Timeout
        })?
        .map_err(|e| {
            warn!(host = %uri.host, error = %e, "name resolution failed");
            DisconnectionReason::NetworkError
        })?;
    let addr = addrs.next().ok_or(DisconnectionReason::NetworkError)?;

    info!(phase = Phase::WaitTcp.as_str(), %addr, "address resolved");
    let socket = timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| DisconnectionReason::Timeout)?
        .map_err(|e| io_reason(&e))?;

    if config.tcp_nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }
    }

    if let (Ok(local), Ok(peer)) = (socket.local_addr(), socket.peer_addr()) {
        let _ = events
            .send(PublisherEvent::SocketConnected { local, peer })
            .await;
    }

    Ok(socket)
}

/// Connection driver: owns the socket, the chunk stream and the dialogue
struct Driver<S> {
    config: ClientConfig,
    uri: RtmpUri,

    rd: ReadHalf<S>,
    wr: WriteHalf<S>,
    rcvbuf: BytesMut,

    stream: ChunkStream,
    released: Vec<crate::protocol::chunk::ReleasedFrame>,

    cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<PublisherEvent>,

    phase: Phase,
    public_state: ConnectionState,

    amf_seq: u32,
    connect_id: f64,
    create_stream_id: f64,
    published_stream_id: f64,
    audio_setting: Option<u8>,

    pending_disconnect: Option<DisconnectionReason>,
    disconnect_reply: Option<oneshot::Sender<()>>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> Driver<S> {
    fn new(
        config: ClientConfig,
        uri: RtmpUri,
        transport: S,
        cmd_rx: mpsc::Receiver<Command>,
        events: mpsc::Sender<PublisherEvent>,
        public_state: ConnectionState,
    ) -> Self {
        let (rd, wr) = tokio::io::split(transport);
        Self {
            config,
            uri,
            rd,
            wr,
            rcvbuf: BytesMut::with_capacity(4096),
            stream: ChunkStream::new(),
            released: Vec::new(),
            cmd_rx,
            events,
            phase: Phase::Idle,
            public_state,
            amf_seq: 0,
            connect_id: 0.0,
            create_stream_id: 0.0,
            published_stream_id: 0.0,
            audio_setting: None,
            pending_disconnect: None,
            disconnect_reply: None,
        }
    }

    async fn run(mut self) {
        match self.establish().await {
            Ok(()) => {
                let reason = self.drive().await;
                self.teardown(reason).await;
            }
            Err(reason) => {
                self.set_phase(Phase::Idle, Some(reason)).await;
            }
        }
    }

    /// Handshake and the opening of the dialogue (WaitS0 through WaitFms)
    async fn establish(&mut self) -> std::result::Result<(), DisconnectionReason> {
        let mut handshake = ClientHandshake::new();
        let c0c1 = handshake
            .c0c1()
            .map_err(|_| DisconnectionReason::InternalError)?;
        self.wr
            .write_all(&c0c1)
            .await
            .map_err(|e| io_reason(&e))?;
        self.set_phase(Phase::WaitS0, None).await;

        while !handshake.is_done() {
            let n = timeout(
                self.config.watchdog_timeout,
                self.rd.read_buf(&mut self.rcvbuf),
            )
            .await
            .map_err(|_| DisconnectionReason::Timeout)?
            .map_err(|e| io_reason(&e))?;
            if n == 0 {
                return Err(DisconnectionReason::NetworkError);
            }

            match handshake.process(&mut self.rcvbuf) {
                Ok(Some(c2)) => {
                    self.wr.write_all(&c2).await.map_err(|e| io_reason(&e))?;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "handshake failed");
                    return Err(DisconnectionReason::NetworkError);
                }
            }

            let phase = match handshake.waiting_for() {
                HandshakePhase::S0 => Phase::WaitS0,
                HandshakePhase::S1 => Phase::WaitS1,
                HandshakePhase::S2 | HandshakePhase::Done => Phase::WaitS2,
                HandshakePhase::Send => Phase::WaitS0,
            };
            self.set_phase(phase, None).await;
        }

        // The handshake is done: open the dialogue
        self.connect_id = self.next_amf_id();
        let connect = self
            .build_connect()
            .map_err(|_| DisconnectionReason::InternalError)?;
        self.stream
            .send_command(CSID_COMMAND, connect)
            .map_err(|_| DisconnectionReason::InternalError)?;
        self.stream
            .set_chunk_size(self.config.chunk_size)
            .map_err(|_| DisconnectionReason::InternalError)?;
        self.set_phase(Phase::WaitFms, None).await;

        // The server may have sent chunk data right behind S2
        if !self.rcvbuf.is_empty() {
            let n = self.rcvbuf.len();
            self.process_input(n).await;
        }
        Ok(())
    }

    /// Main loop: runs until something decides to disconnect
    async fn drive(&mut self) -> DisconnectionReason {
        enum Tick {
            Read(io::Result<usize>),
            Wrote(Result<()>),
            Cmd(Option<Command>),
            Expired,
        }

        loop {
            if let Some(reason) = self.pending_disconnect.take() {
                return reason;
            }

            let deadline = Instant::now() + self.config.watchdog_timeout;
            let has_pending = self.stream.has_pending();

            // Socket work first: queued output drains before new commands
            // are admitted
            let tick = tokio::select! {
                biased;
                r = self.rd.read_buf(&mut self.rcvbuf) => Tick::Read(r),
                r = self.stream.write_pending(&mut self.wr, &mut self.released),
                    if has_pending => Tick::Wrote(r),
                c = self.cmd_rx.recv() => Tick::Cmd(c),
                _ = sleep_until(deadline) => Tick::Expired,
            };

            self.flush_released().await;

            match tick {
                Tick::Read(Ok(0)) => {
                    info!("connection closed by peer");
                    return DisconnectionReason::NetworkError;
                }
                Tick::Read(Ok(n)) => {
                    self.process_input(n).await;
                }
                Tick::Read(Err(e)) => {
                    warn!(error = %e, "socket read failed");
                    return io_reason(&e);
                }
                Tick::Wrote(Ok(())) => {}
                Tick::Wrote(Err(e)) => {
                    warn!(error = %e, "socket write failed");
                    return error_reason(&e);
                }
                Tick::Cmd(Some(cmd)) => {
                    if let Some(reason) = self.handle_command(cmd) {
                        return reason;
                    }
                }
                Tick::Cmd(None) => {
                    // Handle dropped without an explicit disconnect
                    return DisconnectionReason::ClientRequest;
                }
                Tick::Expired => {
                    warn!(
                        timeout_ms = self.config.watchdog_timeout.as_millis() as u64,
                        "socket watchdog expired"
                    );
                    return DisconnectionReason::Timeout;
                }
            }
        }
    }

    async fn teardown(&mut self, reason: DisconnectionReason) {
        if self.phase == Phase::Ready {
            let id = self.next_amf_id();
            match self.build_delete_stream(id) {
                Ok(payload) => {
                    if self.stream.send_command(CSID_COMMAND, payload).is_err() {
                        warn!("failed to queue deleteStream");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode deleteStream"),
            }
        }

        if self.stream.has_pending() {
            let flush = self
                .stream
                .write_pending(&mut self.wr, &mut self.released);
            let _ = timeout(Duration::from_millis(TEARDOWN_FLUSH_MS), flush).await;
        }

        let mut released = std::mem::take(&mut self.released);
        self.stream.release_all(&mut released);
        self.released = released;
        self.flush_released().await;

        let _ = self.wr.shutdown().await;
        self.set_phase(Phase::Idle, Some(reason)).await;

        if let Some(reply) = self.disconnect_reply.take() {
            let _ = reply.send(());
        }
    }

    /// Feed freshly read bytes to the chunk stream and act on what comes out
    async fn process_input(&mut self, newly_read: usize) {
        let events = match self.stream.handle_input(&mut self.rcvbuf, newly_read) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "receive processing failed");
                self.defer_disconnect(error_reason(&e));
                return;
            }
        };

        for event in events {
            match event {
                StreamEvent::PeerBandwidthChanged(bandwidth) => {
                    info!(bandwidth, "peer bandwidth changed");
                    self.emit(PublisherEvent::PeerBandwidthChanged(bandwidth)).await;
                }
                StreamEvent::Command(payload) => {
                    self.handle_amf_command(payload).await;
                }
            }
        }
    }

    /// Dispatch one inbound AMF0 command
    async fn handle_amf_command(&mut self, payload: Bytes) {
        let mut dec = Amf0Decoder::new(payload);
        let (name, id) = match dec.command_name() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "unparseable command message");
                self.defer_disconnect(DisconnectionReason::InternalError);
                return;
            }
        };
        debug!(command = %name, id, "server command");

        match name.as_str() {
            CMD_RESULT if id == self.connect_id => self.on_connect_result(),
            CMD_RESULT if id == self.create_stream_id => self.on_create_stream_result(dec),
            CMD_RESULT => debug!(id, "result for an unfollowed call"),
            CMD_ERROR => self.on_server_error(dec),
            CMD_ON_STATUS => self.on_status(dec).await,
            CMD_ON_BW_DONE => self.on_bw_done(),
            CMD_CLOSE => self.defer_disconnect(DisconnectionReason::ServerRequest),
            other => warn!(command = %other, "unexpected command"),
        }
    }

    /// `_result` of `connect`: release the stream name and create the stream
    fn on_connect_result(&mut self) {
        info!("connect accepted");
        let result = (|| -> Result<()> {
            let id = self.next_amf_id();
            let payload = build_key_command(CMD_RELEASE_STREAM, id, &self.uri.key)?;
            self.stream.send_command(CSID_COMMAND, payload)?;

            let id = self.next_amf_id();
            let payload = build_key_command(CMD_FC_PUBLISH, id, &self.uri.key)?;
            self.stream.send_command(CSID_COMMAND, payload)?;

            self.create_stream_id = self.next_amf_id();
            let payload = build_key_command(CMD_CREATE_STREAM, self.create_stream_id, &self.uri.key)?;
            self.stream.send_command(CSID_COMMAND, payload)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "failed to continue dialogue");
            self.defer_disconnect(DisconnectionReason::NetworkError);
        }
    }

    /// `_result` of `createStream`: store the stream id and publish
    fn on_create_stream_result(&mut self, mut dec: Amf0Decoder) {
        info!("createStream accepted");
        let result = (|| -> Result<()> {
            dec.null()?;
            self.published_stream_id = dec.number()?;
            self.stream
                .store_message_stream_id(self.published_stream_id as u32);

            let id = self.next_amf_id();
            let mut enc = Amf0Encoder::new();
            enc.string(CMD_PUBLISH)?
                .number(id)?
                .null()?
                .string(&self.uri.key)?
                .string(PUBLISH_TYPE_LIVE)?;
            self.stream.send_command(CSID_MEDIA, enc.finish()?)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "failed to publish");
            self.defer_disconnect(DisconnectionReason::NetworkError);
        }
    }

    /// `onStatus`: either the publish started or the server balked
    async fn on_status(&mut self, dec: Amf0Decoder) {
        let info = match parse_info_object(dec) {
            Some(info) => info,
            None => {
                self.defer_disconnect(DisconnectionReason::Unknown);
                return;
            }
        };

        if info.is_error {
            warn!(
                code = info.code.as_deref().unwrap_or("Unknown"),
                description = info.description.as_deref().unwrap_or("Unknown"),
                "server error status"
            );
            self.defer_disconnect(reason_from_server_error(
                info.code.as_deref(),
                info.description.as_deref(),
            ));
            return;
        }

        match info.code.as_deref() {
            None => {
                warn!("onStatus without a code property");
                self.defer_disconnect(DisconnectionReason::InternalError);
            }
            Some(NS_PUBLISH_START) => {
                self.set_phase(Phase::Ready, None).await;
            }
            Some(code) => {
                warn!(code, expected = NS_PUBLISH_START, "unexpected status code");
                self.defer_disconnect(DisconnectionReason::InternalError);
            }
        }
    }

    /// `_error`: the dialogue is over, map the reason
    fn on_server_error(&mut self, dec: Amf0Decoder) {
        let reason = match parse_info_object(dec) {
            Some(info) => {
                warn!(
                    code = info.code.as_deref().unwrap_or("Unknown"),
                    description = info.description.as_deref().unwrap_or("Unknown"),
                    "server error"
                );
                reason_from_server_error(info.code.as_deref(), info.description.as_deref())
            }
            None => DisconnectionReason::Unknown,
        };
        self.defer_disconnect(reason);
    }

    /// `onBWDone`: acknowledge with `_checkbw`
    fn on_bw_done(&mut self) {
        debug!("onBWDone");
        let result = (|| -> Result<()> {
            let id = self.next_amf_id();
            let mut enc = Amf0Encoder::new();
            enc.string(CMD_CHECK_BW)?.number(id)?.null()?;
            self.stream.send_command(CSID_COMMAND, enc.finish()?)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "failed to answer onBWDone");
            self.defer_disconnect(DisconnectionReason::NetworkError);
        }
    }

    /// Handle one caller command; `Some(reason)` ends the loop
    fn handle_command(&mut self, cmd: Command) -> Option<DisconnectionReason> {
        match cmd {
            Command::Metadata { params, reply } => {
                let result = self.ready().and_then(|_| {
                    let payload = flv::metadata_payload(&params)?;
                    self.stream.send_metadata(payload, 0, true, 0)
                });
                let _ = reply.send(result);
            }
            Command::PackedMetadata { data, timestamp, token, reply } => {
                let result = self
                    .ready()
                    .and_then(|_| self.stream.send_metadata(data, timestamp, false, token));
                let _ = reply.send(result);
            }
            Command::VideoConfig { data, token, reply } => {
                let result = self
                    .ready()
                    .and_then(|_| self.stream.send_video(data, 0, true, true, token));
                let _ = reply.send(result);
            }
            Command::VideoFrame { data, timestamp, token, reply } => {
                let result = self.ready().and_then(|_| {
                    let is_key = h264::contains_idr(&data);
                    self.stream.send_video(data, timestamp, false, is_key, token)
                });
                let _ = reply.send(result);
            }
            Command::AudioConfig { data, token, reply } => {
                let result = self.ready().and_then(|_| {
                    let setting = aac::audio_setting(&data)?;
                    self.audio_setting = Some(setting);
                    self.stream.send_audio(data, 0, true, setting, token)
                });
                let _ = reply.send(result);
            }
            Command::AudioFrame { data, timestamp, token, reply } => {
                let result = self.ready().and_then(|_| {
                    let setting = self.audio_setting.unwrap_or(DEFAULT_AUDIO_SETTING);
                    self.stream.send_audio(data, timestamp, false, setting, token)
                });
                let _ = reply.send(result);
            }
            Command::Flush { reply } => {
                self.stream.discard_queued(&mut self.released);
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect { reply } => {
                self.disconnect_reply = Some(reply);
                return Some(DisconnectionReason::ClientRequest);
            }
        }
        None
    }

    fn ready(&self) -> Result<()> {
        if self.phase != Phase::Ready {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn build_connect(&self) -> Result<Bytes> {
        let mut enc = Amf0Encoder::new();
        enc.string(CMD_CONNECT)?.number(self.connect_id)?;
        enc.begin_object()?;
        enc.property("app")?.string(&self.uri.app)?;
        enc.property("type")?.string("nonprivate")?;
        enc.property("flashVer")?.string(&self.config.flash_ver)?;
        enc.property("tcUrl")?.string(&self.uri.tc_url())?;
        enc.end_object()?;
        Ok(enc.finish()?)
    }

    fn build_delete_stream(&self, id: f64) -> Result<Bytes> {
        let mut enc = Amf0Encoder::new();
        enc.string(CMD_DELETE_STREAM)?
            .number(id)?
            .null()?
            .number(self.published_stream_id)?;
        Ok(enc.finish()?)
    }

    fn next_amf_id(&mut self) -> f64 {
        self.amf_seq += 1;
        self.amf_seq as f64
    }

    /// Disconnects decided while processing received data are applied after
    /// the receive loop unwinds
    fn defer_disconnect(&mut self, reason: DisconnectionReason) {
        if self.pending_disconnect.is_none() {
            self.pending_disconnect = Some(reason);
        }
    }

    async fn flush_released(&mut self) {
        for frame in std::mem::take(&mut self.released) {
            self.emit(PublisherEvent::FrameReleased {
                data: frame.data,
                token: frame.token,
            })
            .await;
        }
    }

    async fn emit(&self, event: PublisherEvent) {
        let _ = self.events.send(event).await;
    }

    async fn set_phase(&mut self, phase: Phase, reason: Option<DisconnectionReason>) {
        let public = phase.public();
        if self.phase == phase && public == self.public_state {
            return;
        }
        match reason {
            Some(reason) => {
                info!(state = %public, phase = phase.as_str(), %reason, "state change")
            }
            None => info!(state = %public, phase = phase.as_str(), "state change"),
        }
        self.phase = phase;
        if public != self.public_state {
            self.public_state = public;
            self.emit(PublisherEvent::StateChanged { state: public, reason })
                .await;
        }
    }
}

/// The parsed Info object of an `onStatus` or `_error`
struct StatusInfo {
    is_error: bool,
    code: Option<String>,
    description: Option<String>,
}

/// Parse `null` + Info object, collecting level/code/description
///
/// Non-string property values are skipped; composite values the skipper
/// cannot handle end the walk early with whatever was collected.
fn parse_info_object(mut dec: Amf0Decoder) -> Option<StatusInfo> {
    dec.null().ok()?;
    dec.object_start().ok()?;

    let mut info = StatusInfo {
        is_error: false,
        code: None,
        description: None,
    };
    loop {
        let key = match dec.property_key() {
            Ok(key) => key,
            Err(_) => break,
        };
        if key.is_empty() {
            break;
        }
        let value = match dec.string() {
            Ok(value) => value,
            Err(_) => {
                if dec.skip_value().is_err() {
                    break;
                }
                continue;
            }
        };

        match key.as_str() {
            "level" => info.is_error = value == "error",
            "code" => info.code = Some(value),
            "description" => info.description = Some(value),
            _ => {}
        }
    }
    Some(info)
}

/// Map a server-reported (code, description) pair to a disconnection reason
///
/// The description is matched first, then the code, both as
/// case-insensitive prefixes.
fn reason_from_server_error(code: Option<&str>, description: Option<&str>) -> DisconnectionReason {
    const PATTERNS: [(&str, Option<&str>, DisconnectionReason); 2] = [
        (NC_CONNECT_REJECTED, None, DisconnectionReason::Refused),
        (
            "NetStream.Publish.Denied",
            Some(DESC_NAME_IN_USE),
            DisconnectionReason::AlreadyInUse,
        ),
    ];

    fn prefix_matches(value: &str, pattern: &str) -> bool {
        value.len() >= pattern.len() && value[..pattern.len()].eq_ignore_ascii_case(pattern)
    }

    if let Some(description) = description {
        for &(_, pattern, reason) in PATTERNS.iter() {
            if let Some(pattern) = pattern {
                if prefix_matches(description, pattern) {
                    return reason;
                }
            }
        }
    }
    if let Some(code) = code {
        for &(pattern, _, reason) in PATTERNS.iter() {
            if prefix_matches(code, pattern) {
                return reason;
            }
        }
    }
    DisconnectionReason::Unknown
}

/// Encode `name, id, null, key` - the shape shared by releaseStream,
/// FCPublish and createStream
fn build_key_command(name: &str, id: f64, key: &str) -> Result<Bytes> {
    let mut enc = Amf0Encoder::new();
    enc.string(name)?.number(id)?.null()?.string(key)?;
    Ok(enc.finish()?)
}

fn io_reason(e: &io::Error) -> DisconnectionReason {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => DisconnectionReason::Refused,
        _ => DisconnectionReason::NetworkError,
    }
}

fn error_reason(e: &Error) -> DisconnectionReason {
    match e {
        Error::Io(io_err) => io_reason(io_err),
        Error::Timeout => DisconnectionReason::Timeout,
        _ => DisconnectionReason::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_projection() {
        assert_eq!(Phase::Idle.public(), ConnectionState::Disconnected);
        assert_eq!(Phase::WaitDns.public(), ConnectionState::Connecting);
        assert_eq!(Phase::WaitS1.public(), ConnectionState::Connecting);
        assert_eq!(Phase::WaitFms.public(), ConnectionState::Connecting);
        assert_eq!(Phase::Ready.public(), ConnectionState::Connected);
    }

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            reason_from_server_error(Some("NetConnection.Connect.Rejected"), None),
            DisconnectionReason::Refused
        );
        // The code carries extra detail after the known prefix
        assert_eq!(
            reason_from_server_error(
                Some("NetConnection.Connect.Rejected: bad auth"),
                Some("Authentication failed")
            ),
            DisconnectionReason::Refused
        );
        // The description wins over the code
        assert_eq!(
            reason_from_server_error(
                Some("NetStream.Publish.Denied"),
                Some("Stream name is already in use elsewhere")
            ),
            DisconnectionReason::AlreadyInUse
        );
        assert_eq!(
            reason_from_server_error(Some("NetStream.Something.Else"), Some("mystery")),
            DisconnectionReason::Unknown
        );
        assert_eq!(
            reason_from_server_error(None, None),
            DisconnectionReason::Unknown
        );
    }

    #[test]
    fn test_parse_info_object() {
        let mut enc = Amf0Encoder::new();
        enc.null().unwrap();
        enc.begin_object().unwrap();
        enc.property("level").unwrap().string("error").unwrap();
        enc.property("code").unwrap().string("NetStream.Publish.Denied").unwrap();
        enc.property("clientid").unwrap().number(1.0).unwrap();
        enc.property("description")
            .unwrap()
            .string("Stream name is already in use")
            .unwrap();
        enc.end_object().unwrap();
        let payload = enc.finish().unwrap();

        let info = parse_info_object(Amf0Decoder::new(payload)).unwrap();
        assert!(info.is_error);
        assert_eq!(info.code.as_deref(), Some("NetStream.Publish.Denied"));
        assert_eq!(info.description.as_deref(), Some("Stream name is already in use"));
    }

    #[test]
    fn test_build_key_command_shape() {
        let payload = build_key_command("releaseStream", 2.0, "secret").unwrap();
        let mut dec = Amf0Decoder::new(payload);
        let (name, id) = dec.command_name().unwrap();
        assert_eq!(name, "releaseStream");
        assert_eq!(id, 2.0);
        dec.null().unwrap();
        assert_eq!(dec.string().unwrap(), "secret");
        assert!(!dec.has_remaining());
    }
}
