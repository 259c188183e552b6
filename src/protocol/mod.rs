//! RTMP protocol implementation
//!
//! - `constants`: wire constants from the RTMP specification
//! - `handshake`: the C0/C1/C2 - S0/S1/S2 exchange (client side)
//! - `chunk`: chunk framing and reassembly
//! - `control`: protocol control messages and the peer bandwidth lattice
//! - `stream`: the bidirectional session tying the above together

pub mod chunk;
pub mod constants;
pub mod control;
pub mod handshake;
pub mod stream;
