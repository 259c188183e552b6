//! Media payload framing
//!
//! The helpers the publisher needs to wrap caller media into RTMP messages:
//! keyframe detection over AVCC video, the audio setting byte derived from
//! the AAC AudioSpecificConfig, and FLV tag/metadata construction.

pub mod aac;
pub mod flv;
pub mod h264;

pub use flv::MetadataParams;
