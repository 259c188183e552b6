//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)
//! Reference: RFC 7425 - Adobe's RTMP (Informational)

/// RTMP version number (always 3 for standard RTMP)
pub const RTMP_VERSION: u8 = 3;

/// Default RTMP port
pub const RTMP_PORT: u16 = 1935;

/// Handshake packet size (C1/S1/C2/S2)
pub const HANDSHAKE_SIZE: usize = 1536;

/// Default chunk size in both directions until renegotiated (per RTMP spec)
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Chunk size announced by this client right after `connect`
pub const PUBLISH_CHUNK_SIZE: u32 = 256;

/// Maximum message length encodable in the 24-bit header field
pub const MAX_MESSAGE_SIZE: u32 = 0x00FF_FFFF;

/// Timestamps above this value require the extended timestamp field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0xFF_FFFF;

/// Largest possible chunk header: 3 (basic) + 11 (type 0) + 4 (extended ts)
pub const CHUNK_HEADER_MAX_LEN: usize = 18;

/// Capacity of each per-channel transmit queue
pub const MAX_QUEUE: usize = 10;

/// Watchdog duration for DNS resolution and socket inactivity
pub const WATCHDOG_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// Chunk Stream IDs (CSID)
// RTMP spec section 5.3.1.1
// ============================================================================

/// Protocol control messages (Set Chunk Size, Abort, Ack, ...)
pub const CSID_PROTOCOL_CONTROL: u32 = 2;

/// AMF0 command messages (connect, createStream, publish, ...) and audio data
pub const CSID_COMMAND: u32 = 3;

/// Metadata (`@setDataFrame`) and video frames
pub const CSID_MEDIA: u32 = 4;

/// Audio data shares the command channel
pub const CSID_AUDIO: u32 = CSID_COMMAND;

// ============================================================================
// Message Type IDs
// RTMP spec section 5.4
// ============================================================================

/// Set Chunk Size (1) - protocol control
pub const MSG_SET_CHUNK_SIZE: u8 = 1;

/// Abort Message (2) - protocol control
pub const MSG_ABORT: u8 = 2;

/// Acknowledgement (3) - protocol control
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;

/// User Control Message (4) - protocol control
pub const MSG_USER_CONTROL: u8 = 4;

/// Window Acknowledgement Size (5) - protocol control
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;

/// Set Peer Bandwidth (6) - protocol control
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;

/// Audio Message (8)
pub const MSG_AUDIO: u8 = 8;

/// Video Message (9)
pub const MSG_VIDEO: u8 = 9;

/// AMF0 Data Message (18) - @setDataFrame, onMetaData
pub const MSG_DATA_AMF0: u8 = 18;

/// AMF0 Command Message (20) - connect, publish, etc.
pub const MSG_COMMAND_AMF0: u8 = 20;

// ============================================================================
// User Control Event Types
// RTMP spec section 5.4.1
// ============================================================================

/// Stream Begin - server sends when stream becomes functional
pub const UC_STREAM_BEGIN: u16 = 0;

/// Stream EOF
pub const UC_STREAM_EOF: u16 = 1;

/// Stream Dry - no more data available
pub const UC_STREAM_DRY: u16 = 2;

/// Stream Is Recorded
pub const UC_STREAM_IS_RECORDED: u16 = 4;

/// Ping Request - server pings client
pub const UC_PING_REQUEST: u16 = 6;

/// Ping Response - client responds to ping
pub const UC_PING_RESPONSE: u16 = 7;

// ============================================================================
// Peer Bandwidth Limit Types
// RTMP spec section 5.4.5
// ============================================================================

/// Hard limit - peer should limit output to this bandwidth
pub const BANDWIDTH_LIMIT_HARD: u8 = 0;

/// Soft limit - peer can exceed if it has excess bandwidth
pub const BANDWIDTH_LIMIT_SOFT: u8 = 1;

/// Dynamic - can be hard or soft depending on prior state
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

// ============================================================================
// Command Names
// ============================================================================

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CLOSE: &str = "close";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_CHECK_BW: &str = "_checkbw";
pub const CMD_ON_BW_DONE: &str = "onBWDone";

/// Server response commands
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";

/// Status notification
pub const CMD_ON_STATUS: &str = "onStatus";

/// Data-message handler name prefixed to metadata payloads
pub const CMD_SET_DATA_FRAME: &str = "@setDataFrame";

/// Metadata array name
pub const CMD_ON_METADATA: &str = "onMetaData";

/// Publish type argument sent with the `publish` command
pub const PUBLISH_TYPE_LIVE: &str = "live";

/// flashVer value sent in the connect object
pub const FLASH_VER: &str = "FMLE/3.0 (compatible; librtmp)";

// ============================================================================
// Status Codes
// ============================================================================

pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NC_CONNECT_REJECTED: &str = "NetConnection.Connect.Rejected";
pub const DESC_NAME_IN_USE: &str = "Stream name is already in use";
