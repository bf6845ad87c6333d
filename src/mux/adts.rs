//! ADTS header synthesis for raw AAC access units
//!
//! The receiver expects every audio payload to be prefixed with a 7-byte
//! ADTS header (no CRC). Layout, MSB first:
//!
//! | byte | content |
//! |---|---|
//! | 0 | `0xFF` sync |
//! | 1 | `0xF9` sync, MPEG-2, layer 0, protection absent |
//! | 2 | profile-1 (2) · sampling index (4) · private (1) · channel cfg bit 2 (1) |
//! | 3 | channel cfg bits 1..0 (2) · flags (4) · frame length bits 12..11 (2) |
//! | 4 | frame length bits 10..3 |
//! | 5 | frame length bits 2..0 (3) · buffer fullness high bits `11111` |
//! | 6 | `0xFC` buffer fullness low bits, zero raw data blocks |

use crate::errors::RelayError;

pub const ADTS_HEADER_LEN: usize = 7;

/// Largest frame length representable in the 13-bit field.
pub const MAX_ADTS_FRAME_LEN: usize = 0x1FFF;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

/// AAC parameters fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// Audio object type (1 = Main, 2 = LC, 3 = SSR, 4 = LTP)
    pub profile: u8,
    pub sampling_index: u8,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn new(profile: u8, sample_rate: u32, channels: u8) -> Result<Self, RelayError> {
        if !(1..=4).contains(&profile) {
            return Err(RelayError::Config(format!("Unsupported AAC profile {}", profile)));
        }
        if !(1..=7).contains(&channels) {
            return Err(RelayError::Config(format!(
                "Unsupported channel configuration {}",
                channels
            )));
        }
        let sampling_index = sampling_index_for(sample_rate).ok_or_else(|| {
            RelayError::Config(format!("Unsupported AAC sample rate {}", sample_rate))
        })?;

        Ok(Self {
            profile,
            sampling_index,
            channel_config: channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLING_FREQUENCIES[self.sampling_index as usize]
    }

    /// Build the header for a raw payload of `payload_len` bytes
    pub fn header(&self, payload_len: usize) -> Result<[u8; ADTS_HEADER_LEN], RelayError> {
        let frame_len = payload_len + ADTS_HEADER_LEN;
        if frame_len > MAX_ADTS_FRAME_LEN {
            return Err(RelayError::InvalidPayload(format!(
                "AAC frame of {} bytes exceeds ADTS limit",
                payload_len
            )));
        }

        let profile = self.profile;
        let freq = self.sampling_index;
        let chan = self.channel_config;
        let len = frame_len as u16;

        Ok([
            0xFF,
            0xF9,
            ((profile - 1) << 6) | (freq << 2) | (chan >> 2),
            ((chan & 3) << 6) | (len >> 11) as u8,
            ((len & 0x7FF) >> 3) as u8,
            (((len & 7) << 5) as u8) | 0x1F,
            0xFC,
        ])
    }
}

impl Default for AudioSpecificConfig {
    /// AAC-LC, 44.1 kHz, mono
    fn default() -> Self {
        Self {
            profile: 2,
            sampling_index: 4,
            channel_config: 1,
        }
    }
}

fn sampling_index_for(sample_rate: u32) -> Option<u8> {
    SAMPLING_FREQUENCIES
        .iter()
        .position(|&rate| rate == sample_rate)
        .map(|idx| idx as u8)
}

/// Read back the 13-bit frame length field of an ADTS header
pub fn frame_length(header: &[u8]) -> Option<usize> {
    if header.len() < ADTS_HEADER_LEN {
        return None;
    }
    let len = ((header[3] as usize & 0x03) << 11)
        | ((header[4] as usize) << 3)
        | ((header[5] as usize) >> 5);
    Some(len)
}
