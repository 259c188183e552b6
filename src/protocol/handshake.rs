//! RTMP client handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version 3) ------->|
//!   |------- C1 (1536 bytes) -------------->|
//!   |<------ S0 (1 byte: version 3) --------|
//!   |<------ S1 (1536 bytes) ---------------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |          [Handshake Complete]         |
//! ```
//!
//! C1 is 8 zero bytes followed by 1528 bytes of random filler; S2 is consumed
//! without validation. This is the "simple" handshake (no HMAC digest), which
//! every publishing endpoint accepts.
//!
//! Reference: RTMP Specification Section 5.2

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Client handshake state machine
///
/// Sans-IO: the caller writes what `c0c1()` returns, then feeds received
/// bytes to `process()` until `is_done()`. Insufficient input consumes
/// nothing; surplus bytes (the start of the chunk stream) are left in the
/// buffer.
#[derive(Debug)]
pub struct ClientHandshake {
    state: HandshakeState,
}

/// Externally visible handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Send,
    S0,
    S1,
    S2,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Initial state - C0C1 not generated yet
    Initial,
    /// Waiting for the one-byte server version
    WaitS0,
    /// Accumulating the 1536-byte S1
    WaitS1,
    /// Accumulating the 1536-byte S2
    WaitS2,
    /// Handshake complete
    Done,
}

impl ClientHandshake {
    /// Create a new handshake state machine
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Initial,
        }
    }

    /// Check if the handshake is complete
    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// What the handshake is currently waiting for
    pub fn waiting_for(&self) -> HandshakePhase {
        match self.state {
            HandshakeState::Initial => HandshakePhase::Send,
            HandshakeState::WaitS0 => HandshakePhase::S0,
            HandshakeState::WaitS1 => HandshakePhase::S1,
            HandshakeState::WaitS2 => HandshakePhase::S2,
            HandshakeState::Done => HandshakePhase::Done,
        }
    }

    /// Generate the C0+C1 packet (1 + 1536 bytes)
    ///
    /// Returns an error if called twice.
    pub fn c0c1(&mut self) -> Result<Bytes> {
        if self.state != HandshakeState::Initial {
            return Err(HandshakeError::InvalidState.into());
        }

        let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        buf.put_u8(RTMP_VERSION);
        buf.put_slice(&generate_c1());

        self.state = HandshakeState::WaitS0;
        Ok(buf.freeze())
    }

    /// Process received bytes; returns C2 once S1 is complete
    ///
    /// Consumed bytes are removed from `buf`. Call repeatedly as data
    /// arrives; `Ok(None)` means either more input is needed or nothing was
    /// due to be written.
    pub fn process(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                HandshakeState::Initial | HandshakeState::Done => return Ok(None),
                HandshakeState::WaitS0 => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let s0 = buf.get_u8();
                    if s0 != RTMP_VERSION {
                        return Err(HandshakeError::InvalidVersion(s0).into());
                    }
                    self.state = HandshakeState::WaitS1;
                }
                HandshakeState::WaitS1 => {
                    if buf.len() < HANDSHAKE_SIZE {
                        return Ok(None);
                    }
                    // C2 is S1 echoed back unchanged
                    let c2 = buf.split_to(HANDSHAKE_SIZE).freeze();
                    self.state = HandshakeState::WaitS2;
                    return Ok(Some(c2));
                }
                HandshakeState::WaitS2 => {
                    if buf.len() < HANDSHAKE_SIZE {
                        return Ok(None);
                    }
                    // S2 is not validated, some servers echo incorrectly
                    buf.advance(HANDSHAKE_SIZE);
                    self.state = HandshakeState::Done;
                    return Ok(None);
                }
            }
        }
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate the C1 packet: 8 zero bytes + 1528 bytes of filler
///
/// The filler uses a simple PRNG seeded with the wall clock. It is not
/// cryptographically secure; the simple RTMP handshake does not require it.
fn generate_c1() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5DEECE66D);

    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }

    packet
}
