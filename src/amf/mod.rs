//! AMF (Action Message Format) implementation
//!
//! AMF0 is Adobe's binary serialization format used in RTMP for encoding
//! command parameters and metadata. The publishing dialogue only ever
//! exchanges AMF0; AMF3 does not appear on this path.

pub mod amf0;

pub use amf0::{Amf0Decoder, Amf0Encoder};
