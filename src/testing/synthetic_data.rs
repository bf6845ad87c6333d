//! Synthetic frames and bitstreams
//!
//! Shaped like the output of a 720p30 hardware H.264 encoder so the pipeline
//! can run end to end without a camera or codec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{AccessUnitKind, Frame, TextureId, IDENTITY_TRANSFORM};

pub const SYNTHETIC_TEXTURE: TextureId = 1;

/// Baseline SPS/PPS for 1280x720, Annex B framed
pub const SYNTHETIC_PARAMETER_SETS: [u8; 20] = [
    0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x01, 0x40, 0x16, 0xE8, //
    0, 0, 0, 1, 0x68, 0xCE, 0x3C,
];

/// Producer frame `index` at `fps`. Timestamps start one frame interval in,
/// so they are never zero.
pub fn synthetic_frame(index: u64, fps: u32) -> Frame {
    let interval_ns = 1_000_000_000 / i64::from(fps.max(1));
    Frame::new(
        SYNTHETIC_TEXTURE,
        (index as i64 + 1) * interval_ns,
        IDENTITY_TRANSFORM,
    )
}

/// Annex B picture of roughly `size` bytes. Keyframes are IDR slices, delta
/// frames non-IDR slices; the body varies with `seed`.
pub fn synthetic_picture(kind: AccessUnitKind, size: usize, seed: u64) -> Bytes {
    let header = match kind {
        AccessUnitKind::Keyframe => 0x65,
        _ => 0x41,
    };
    let body_len = size.saturating_sub(5).max(1);

    let mut buf = BytesMut::with_capacity(body_len + 5);
    buf.put_slice(&[0, 0, 0, 1, header]);
    let base = (seed % 251) as u8;
    for i in 0..body_len {
        // Avoid emulating a start code inside the slice body
        buf.put_u8(base.wrapping_add(i as u8) | 0x10);
    }
    buf.freeze()
}

/// Raw AAC frame payload (no ADTS header)
pub fn synthetic_aac_frame(size: usize, seed: u64) -> Bytes {
    let base = (seed % 256) as u8;
    (0..size)
        .map(|i| base.wrapping_add(i as u8))
        .collect::<Vec<u8>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::annexb::classify_access_unit;

    #[test]
    fn test_frames_never_have_zero_timestamp() {
        assert!(synthetic_frame(0, 30).is_valid());
        assert_eq!(synthetic_frame(1, 30).timestamp_ns, 66_666_666);
    }

    #[test]
    fn test_pictures_classify() {
        let key = synthetic_picture(AccessUnitKind::Keyframe, 2_000, 3);
        let units = classify_access_unit(&key, 0);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].kind, AccessUnitKind::Keyframe);
        assert_eq!(units[0].size(), 2_000);

        let params = classify_access_unit(&SYNTHETIC_PARAMETER_SETS, 0);
        assert_eq!(params[0].kind, AccessUnitKind::ParameterSet);
    }
}
