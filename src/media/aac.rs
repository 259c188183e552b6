//! AAC AudioSpecificConfig parsing
//!
//! The RTMP audio tag byte encodes format, sample rate, sample size and
//! channel layout. Those fields come out of the AAC AudioSpecificConfig
//! (ISO/IEC 14496-3 1.6.2) that the caller submits before any audio data:
//!
//! ```text
//! audioObjectType:         5 bits
//! samplingFrequencyIndex:  4 bits
//! if (index == 0xF) samplingFrequency: 24 bits
//! channelConfiguration:    4 bits
//! ```

use crate::error::{MediaError, Result};

/// Parsed AudioSpecificConfig
#[derive(Debug, Clone)]
pub struct AudioSpecificConfig {
    /// Audio object type (profile)
    pub audio_object_type: u8,
    /// Sampling frequency index
    pub sampling_frequency_index: u8,
    /// Sampling frequency in Hz
    pub sampling_frequency: u32,
    /// Channel configuration (1=mono, 2=stereo, ...)
    pub channel_configuration: u8,
}

impl AudioSpecificConfig {
    /// Standard sampling frequencies by index
    const SAMPLING_FREQUENCIES: [u32; 13] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
    ];

    /// Parse the leading fields of an AudioSpecificConfig
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAudioSpecificConfig.into());
        }

        let b0 = data[0];
        let b1 = data[1];

        let audio_object_type = (b0 >> 3) & 0x1F;
        let sampling_frequency_index = ((b0 & 0x07) << 1) | ((b1 >> 7) & 0x01);

        let (sampling_frequency, channel_configuration) = if sampling_frequency_index == 0x0F {
            // Explicit frequency in the next 24 bits
            if data.len() < 5 {
                return Err(MediaError::InvalidAudioSpecificConfig.into());
            }
            let f0 = (data[1] & 0x7F) as u32;
            let f1 = data[2] as u32;
            let f2 = data[3] as u32;
            let f3 = (data[4] >> 7) as u32;
            let freq = (f0 << 17) | (f1 << 9) | (f2 << 1) | f3;
            let channels = (data[4] >> 3) & 0x0F;
            (freq, channels)
        } else if (sampling_frequency_index as usize) < Self::SAMPLING_FREQUENCIES.len() {
            let freq = Self::SAMPLING_FREQUENCIES[sampling_frequency_index as usize];
            let channels = (b1 >> 3) & 0x0F;
            (freq, channels)
        } else {
            return Err(MediaError::InvalidAudioSpecificConfig.into());
        };

        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_configuration,
        })
    }
}

/// Derive the FLV audio setting byte from an AudioSpecificConfig
///
/// Layout: SoundFormat(4) | SoundRate(2) | SoundSize(1) | SoundType(1).
/// AAC format and 16-bit samples are fixed; rate and channel bits follow
/// the config.
pub fn audio_setting(asc: &[u8]) -> Result<u8> {
    let config = AudioSpecificConfig::parse(asc)?;

    let rate_bits = if config.sampling_frequency >= 44100 {
        3u8
    } else if config.sampling_frequency >= 22050 {
        2
    } else if config.sampling_frequency >= 11025 {
        1
    } else {
        0
    };
    let stereo_bit = (config.channel_configuration >= 2) as u8;

    Ok(0xA0 | (rate_bits << 2) | 0x02 | stereo_bit)
}
