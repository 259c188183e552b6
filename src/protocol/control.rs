//! Protocol control messages
//!
//! Messages carried on chunk stream 2 with message stream id 0: chunk-size
//! negotiation, flow control and user-control pings. Payload sizes are fixed
//! per type; a mismatch is a malformed message.
//!
//! Reference: RTMP Specification Sections 5.4.1 - 5.4.5 and 6.2

use bytes::{Buf, Bytes};

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// Parsed protocol control message
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),
    /// Abort Message (type 2)
    Abort { csid: u32 },
    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },
    /// User Control Message (type 4)
    UserControl(UserControlEvent),
    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),
    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { value: u32, limit_type: u8 },
}

/// User Control event
#[derive(Debug, Clone)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

impl ControlMessage {
    /// Check whether a message type id is a protocol control message
    pub fn is_control(mtid: u8) -> bool {
        (MSG_SET_CHUNK_SIZE..=MSG_SET_PEER_BANDWIDTH).contains(&mtid)
    }

    /// Parse a control message payload
    pub fn parse(mtid: u8, mut payload: Bytes) -> Result<Self> {
        let malformed = |size: usize| ProtocolError::MalformedControl { mtid, size };

        match mtid {
            MSG_SET_CHUNK_SIZE => {
                if payload.len() != 4 {
                    return Err(malformed(payload.len()).into());
                }
                Ok(ControlMessage::SetChunkSize(payload.get_u32()))
            }

            MSG_ABORT => {
                if payload.len() != 4 {
                    return Err(malformed(payload.len()).into());
                }
                Ok(ControlMessage::Abort { csid: payload.get_u32() })
            }

            MSG_ACKNOWLEDGEMENT => {
                if payload.len() != 4 {
                    return Err(malformed(payload.len()).into());
                }
                Ok(ControlMessage::Acknowledgement { sequence: payload.get_u32() })
            }

            MSG_USER_CONTROL => {
                if payload.len() < 2 {
                    return Err(malformed(payload.len()).into());
                }
                let event_type = payload.get_u16();
                let event = match event_type {
                    UC_STREAM_BEGIN | UC_STREAM_EOF | UC_STREAM_DRY | UC_STREAM_IS_RECORDED
                    | UC_PING_REQUEST | UC_PING_RESPONSE => {
                        if payload.len() < 4 {
                            return Err(malformed(payload.len() + 2).into());
                        }
                        let arg = payload.get_u32();
                        match event_type {
                            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(arg),
                            UC_STREAM_EOF => UserControlEvent::StreamEof(arg),
                            UC_STREAM_DRY => UserControlEvent::StreamDry(arg),
                            UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(arg),
                            UC_PING_REQUEST => UserControlEvent::PingRequest(arg),
                            _ => UserControlEvent::PingResponse(arg),
                        }
                    }
                    _ => UserControlEvent::Unknown { event_type, data: payload },
                };
                Ok(ControlMessage::UserControl(event))
            }

            MSG_WINDOW_ACK_SIZE => {
                if payload.len() != 4 {
                    return Err(malformed(payload.len()).into());
                }
                Ok(ControlMessage::WindowAckSize(payload.get_u32()))
            }

            MSG_SET_PEER_BANDWIDTH => {
                if payload.len() != 5 {
                    return Err(malformed(payload.len()).into());
                }
                let value = payload.get_u32();
                let limit_type = payload.get_u8();
                Ok(ControlMessage::SetPeerBandwidth { value, limit_type })
            }

            _ => Err(ProtocolError::UnexpectedMessage(format!("mtid 0x{:02x}", mtid)).into()),
        }
    }
}

/// Stored bandwidth limit kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredLimit {
    Unknown,
    Hard,
    Soft,
}

/// Peer bandwidth state
///
/// The server may mix Hard, Soft and Dynamic limit messages. The retained
/// value follows this lattice:
/// - any message is stored as a Hard limit while nothing is known yet, as is
///   every Hard message, and a Dynamic message on top of a Hard limit;
/// - a Soft message is stored only when it lowers the current value;
/// - a higher Soft offer, or a Dynamic message without a Hard base, is
///   silently ignored;
/// - anything else carries an unknown limit type and is malformed.
#[derive(Debug, Clone, Copy)]
pub struct PeerBandwidth {
    value: u32,
    limit: StoredLimit,
}

impl PeerBandwidth {
    pub fn new() -> Self {
        Self {
            value: 0,
            limit: StoredLimit::Unknown,
        }
    }

    /// Bandwidth currently in effect (0 until the first message)
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Kind of the stored limit
    pub fn limit(&self) -> StoredLimit {
        self.limit
    }

    /// Fold one Set Peer Bandwidth message into the state
    ///
    /// Returns the bandwidth in effect afterwards.
    pub fn apply(&mut self, limit_type: u8, value: u32) -> Result<u32> {
        if self.limit == StoredLimit::Unknown
            || limit_type == BANDWIDTH_LIMIT_HARD
            || (limit_type == BANDWIDTH_LIMIT_DYNAMIC && self.limit == StoredLimit::Hard)
        {
            self.limit = StoredLimit::Hard;
            self.value = value;
        } else if limit_type == BANDWIDTH_LIMIT_SOFT && value < self.value {
            self.limit = StoredLimit::Soft;
            self.value = value;
        } else if limit_type == BANDWIDTH_LIMIT_SOFT || limit_type == BANDWIDTH_LIMIT_DYNAMIC {
            // A higher soft offer, or dynamic without a hard base
        } else {
            return Err(ProtocolError::InvalidBandwidthType(limit_type).into());
        }
        Ok(self.value)
    }
}

impl Default for PeerBandwidth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_parse_set_chunk_size() {
        let msg = ControlMessage::parse(1, Bytes::from_static(&[0, 0, 16, 0])).unwrap();
        assert!(matches!(msg, ControlMessage::SetChunkSize(4096)));

        let err = ControlMessage::parse(1, Bytes::from_static(&[0, 0, 16])).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MalformedControl { mtid: 1, size: 3 })
        ));
    }

    #[test]
    fn test_parse_window_and_bandwidth() {
        let msg = ControlMessage::parse(5, Bytes::from_static(&[0, 38, 37, 160])).unwrap();
        assert!(matches!(msg, ControlMessage::WindowAckSize(2_500_000)));

        let msg = ControlMessage::parse(6, Bytes::from_static(&[0, 38, 37, 160, 2])).unwrap();
        assert!(matches!(
            msg,
            ControlMessage::SetPeerBandwidth { value: 2_500_000, limit_type: 2 }
        ));

        assert!(ControlMessage::parse(6, Bytes::from_static(&[0, 0, 0, 1])).is_err());
    }

    #[test]
    fn test_parse_user_control() {
        let msg = ControlMessage::parse(4, Bytes::from_static(&[0, 6, 0, 0, 0, 9])).unwrap();
        match msg {
            ControlMessage::UserControl(UserControlEvent::PingRequest(9)) => {}
            other => panic!("unexpected: {:?}", other),
        }

        let msg = ControlMessage::parse(4, Bytes::from_static(&[0, 3, 0, 0, 0, 1, 0, 0, 3, 232]))
            .unwrap();
        match msg {
            ControlMessage::UserControl(UserControlEvent::Unknown { event_type: 3, data }) => {
                assert_eq!(data.len(), 8);
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(ControlMessage::parse(4, Bytes::from_static(&[0])).is_err());
        assert!(ControlMessage::parse(4, Bytes::from_static(&[0, 6, 0, 0])).is_err());
    }

    #[test]
    fn test_is_control() {
        assert!(ControlMessage::is_control(1));
        assert!(ControlMessage::is_control(6));
        assert!(!ControlMessage::is_control(8));
        assert!(!ControlMessage::is_control(20));
    }

    #[test]
    fn test_bandwidth_lattice_sequence() {
        let mut bw = PeerBandwidth::new();
        assert_eq!(bw.limit(), StoredLimit::Unknown);

        assert_eq!(bw.apply(BANDWIDTH_LIMIT_HARD, 1000).unwrap(), 1000);
        assert_eq!(bw.limit(), StoredLimit::Hard);

        // Lower soft offer is taken
        assert_eq!(bw.apply(BANDWIDTH_LIMIT_SOFT, 800).unwrap(), 800);
        assert_eq!(bw.limit(), StoredLimit::Soft);

        // Dynamic without a hard base is ignored
        assert_eq!(bw.apply(BANDWIDTH_LIMIT_DYNAMIC, 1500).unwrap(), 800);
        assert_eq!(bw.limit(), StoredLimit::Soft);

        assert_eq!(bw.apply(BANDWIDTH_LIMIT_HARD, 500).unwrap(), 500);
        assert_eq!(bw.limit(), StoredLimit::Hard);
    }

    #[test]
    fn test_bandwidth_first_message_always_hard() {
        // Even a soft or dynamic first message is stored as a hard limit
        let mut bw = PeerBandwidth::new();
        bw.apply(BANDWIDTH_LIMIT_SOFT, 900).unwrap();
        assert_eq!(bw.limit(), StoredLimit::Hard);
        assert_eq!(bw.value(), 900);

        let mut bw = PeerBandwidth::new();
        bw.apply(BANDWIDTH_LIMIT_DYNAMIC, 700).unwrap();
        assert_eq!(bw.limit(), StoredLimit::Hard);
        assert_eq!(bw.value(), 700);
    }

    #[test]
    fn test_bandwidth_higher_soft_ignored() {
        let mut bw = PeerBandwidth::new();
        bw.apply(BANDWIDTH_LIMIT_HARD, 1000).unwrap();
        assert_eq!(bw.apply(BANDWIDTH_LIMIT_SOFT, 2000).unwrap(), 1000);
        assert_eq!(bw.limit(), StoredLimit::Hard);

        // Dynamic on top of hard re-applies as hard
        assert_eq!(bw.apply(BANDWIDTH_LIMIT_DYNAMIC, 1200).unwrap(), 1200);
        assert_eq!(bw.limit(), StoredLimit::Hard);
    }

    #[test]
    fn test_bandwidth_unknown_type() {
        let mut bw = PeerBandwidth::new();
        bw.apply(BANDWIDTH_LIMIT_HARD, 1000).unwrap();
        assert!(bw.apply(7, 500).is_err());
        // The stored value is untouched
        assert_eq!(bw.value(), 1000);
    }
}
