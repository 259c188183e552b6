//! Unified error types for rtmp-push

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all RTMP publishing operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// RTMP protocol violation
    Protocol(ProtocolError),
    /// AMF encoding/decoding error
    Amf(AmfError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// Media payload error
    Media(MediaError),
    /// Operation timed out (DNS, connect or socket watchdog)
    Timeout,
    /// Connection was closed
    ConnectionClosed,
    /// Per-channel transmit queue is at capacity
    QueueFull,
    /// Send attempted before the publish dialogue completed
    NotConnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Media(e) => write!(f, "Media error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::QueueFull => write!(f, "Transmit queue full"),
            Error::NotConnected => write!(f, "Client is not connected"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        Error::Media(err)
    }
}

/// Protocol-level errors
#[derive(Debug)]
pub enum ProtocolError {
    /// URI is not of the form rtmp[s]://host[:port]/app/key
    InvalidUri(String),
    InvalidChunkHeader,
    InvalidChunkStreamId(u32),
    /// Declared message length exceeds the 24-bit wire limit
    MessageTooLarge(u32),
    /// A control message with an inconsistent payload size
    MalformedControl { mtid: u8, size: usize },
    /// Set Peer Bandwidth carried an unknown limit type
    InvalidBandwidthType(u8),
    UnexpectedMessage(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidUri(uri) => write!(f, "Invalid RTMP URI: {}", uri),
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::InvalidChunkStreamId(id) => write!(f, "Invalid chunk stream ID: {}", id),
            ProtocolError::MessageTooLarge(size) => {
                write!(f, "Message too large: {} bytes", size)
            }
            ProtocolError::MalformedControl { mtid, size } => {
                write!(f, "Malformed control message 0x{:02x} ({} bytes)", mtid, size)
            }
            ProtocolError::InvalidBandwidthType(t) => {
                write!(f, "Unknown peer bandwidth limit type: {}", t)
            }
            ProtocolError::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF encoding/decoding errors
#[derive(Debug)]
pub enum AmfError {
    UnexpectedEof,
    /// The next tag does not match the requested read
    TypeMismatch { expected: u8, found: u8 },
    InvalidUtf8,
    /// skip_value cannot consume this tag without a full parse
    UnsupportedValue(u8),
    /// A bare property key is required at this position
    KeyExpected,
    /// A value (not a property key) is required at this position
    ValueExpected,
    /// begin/end calls are unbalanced
    UnbalancedObject,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::TypeMismatch { expected, found } => {
                write!(f, "AMF type mismatch: expected 0x{:02x}, found 0x{:02x}", expected, found)
            }
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::UnsupportedValue(tag) => write!(f, "Cannot skip AMF value 0x{:02x}", tag),
            AmfError::KeyExpected => write!(f, "Property key expected"),
            AmfError::ValueExpected => write!(f, "Value expected, not a property key"),
            AmfError::UnbalancedObject => write!(f, "Unbalanced object or array"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug)]
pub enum HandshakeError {
    InvalidVersion(u8),
    InvalidState,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::InvalidState => write!(f, "Invalid handshake state"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Media payload errors
#[derive(Debug)]
pub enum MediaError {
    InvalidAvcPayload,
    InvalidAudioSpecificConfig,
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::InvalidAvcPayload => write!(f, "Invalid AVCC video payload"),
            MediaError::InvalidAudioSpecificConfig => {
                write!(f, "Invalid AudioSpecificConfig")
            }
        }
    }
}

impl std::error::Error for MediaError {}

/// Reason reported alongside a transition to `Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectionReason {
    /// The caller asked for the disconnection
    ClientRequest,
    /// The server sent a `close` command
    ServerRequest,
    /// Socket read/write failure
    NetworkError,
    /// The server rejected the connection or the publish
    Refused,
    /// The stream name is already being published
    AlreadyInUse,
    /// DNS or socket watchdog expiry
    Timeout,
    /// The dialogue reached a state the client cannot handle
    InternalError,
    Unknown,
}

impl fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectionReason::ClientRequest => "client request",
            DisconnectionReason::ServerRequest => "server request",
            DisconnectionReason::NetworkError => "network error",
            DisconnectionReason::Refused => "refused",
            DisconnectionReason::AlreadyInUse => "already in use",
            DisconnectionReason::Timeout => "timeout",
            DisconnectionReason::InternalError => "internal error",
            DisconnectionReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Public connection state, as surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}
