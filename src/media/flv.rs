//! FLV tag framing for RTMP media messages
//!
//! RTMP media payloads travel behind the same tag bytes FLV uses: a video
//! tag carrying the frame/codec nibbles and AVC packet fields, an audio tag
//! carrying the sound setting byte, and the `onMetaData` ECMA array for
//! stream metadata.

use bytes::Bytes;

use crate::amf::Amf0Encoder;
use crate::error::AmfError;
use crate::protocol::constants::CMD_ON_METADATA;

/// videocodecid for H.264
const VIDEO_CODEC_AVC: f64 = 7.0;
/// audiocodecid for AAC
const AUDIO_CODEC_AAC: f64 = 10.0;
/// Framerate announced when the caller leaves it at zero
const DEFAULT_FRAMERATE: f64 = 29.97;

/// Build the 5-byte video tag header
///
/// Frame/codec nibbles (0x17 key, 0x27 inter), the AVC packet type (0 for
/// the avcC sequence header, 1 for NAL data), and a zero composition time.
pub fn video_tag_header(is_key: bool, is_config: bool) -> [u8; 5] {
    [
        if is_key { 0x17 } else { 0x27 },
        if is_config { 0x00 } else { 0x01 },
        0,
        0,
        0,
    ]
}

/// Build the 2-byte audio tag header
///
/// The setting byte comes from the AudioSpecificConfig (see
/// [`crate::media::aac::audio_setting`]); the second byte distinguishes the
/// config packet (0) from raw frames (1).
pub fn audio_tag_header(setting: u8, is_config: bool) -> [u8; 2] {
    [setting, if is_config { 0x00 } else { 0x01 }]
}

/// Stream properties announced in `onMetaData`
#[derive(Debug, Clone)]
pub struct MetadataParams {
    /// Media duration in seconds (0 for unbounded live streams)
    pub duration: f64,
    /// Video width in pixels
    pub width: u32,
    /// Video height in pixels
    pub height: u32,
    /// Nominal framerate; 0 announces 29.97
    pub framerate: f64,
    /// Audio sample rate in Hz
    pub audio_sample_rate: u32,
    /// Audio sample size in bits
    pub audio_sample_size: u32,
    /// Pixel aspect ratio numerator
    pub aspect_ratio_x: f64,
    /// Pixel aspect ratio denominator
    pub aspect_ratio_y: f64,
}

impl Default for MetadataParams {
    fn default() -> Self {
        Self {
            duration: 0.0,
            width: 0,
            height: 0,
            framerate: 0.0,
            audio_sample_rate: 0,
            audio_sample_size: 0,
            aspect_ratio_x: 1.0,
            aspect_ratio_y: 1.0,
        }
    }
}

/// Encode the `onMetaData` payload: the name string followed by an ECMA
/// array of eleven stream properties
pub fn metadata_payload(params: &MetadataParams) -> Result<Bytes, AmfError> {
    let framerate = if params.framerate == 0.0 {
        DEFAULT_FRAMERATE
    } else {
        params.framerate
    };

    let mut enc = Amf0Encoder::new();
    enc.string(CMD_ON_METADATA)?;
    enc.begin_ecma_array(11)?;
    enc.property("duration")?.number(params.duration)?;
    enc.property("width")?.number(params.width as f64)?;
    enc.property("height")?.number(params.height as f64)?;
    enc.property("framerate")?.number(framerate)?;
    enc.property("videocodecid")?.number(VIDEO_CODEC_AVC)?;
    enc.property("audiosamplerate")?.number(params.audio_sample_rate as f64)?;
    enc.property("audiosamplesize")?.number(params.audio_sample_size as f64)?;
    enc.property("stereo")?.boolean(true)?;
    enc.property("audiocodecid")?.number(AUDIO_CODEC_AAC)?;
    enc.property("AspectRatioX")?.number(params.aspect_ratio_x)?;
    enc.property("AspectRatioY")?.number(params.aspect_ratio_y)?;
    enc.end_array()?;
    enc.finish()
}
