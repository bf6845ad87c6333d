//! Annex B bitstream splitting
//!
//! Some encoders hand back a raw H.264 byte stream per frame with no buffer
//! flags. These helpers split it on start codes and classify the result so it
//! can be muxed like flagged output: SPS/PPS become a parameter-set unit ahead
//! of the picture they arrived with.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{AccessUnit, AccessUnitKind};

const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Split an Annex B buffer into NAL unit bodies (start codes removed)
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let mut start = match find_start_code(data, 0) {
        Some((pos, len)) => pos + len,
        None => return nal_units,
    };

    loop {
        match find_start_code(data, start) {
            Some((pos, len)) => {
                if pos > start {
                    nal_units.push(&data[start..pos]);
                }
                start = pos + len;
            }
            None => {
                if start < data.len() {
                    nal_units.push(&data[start..]);
                }
                break;
            }
        }
    }

    nal_units
}

/// Position and length of the next 3- or 4-byte start code at or after `from`
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|header| header & 0x1F)
}

/// Classify one encoded picture into at most two access units: a
/// parameter-set unit (if SPS/PPS are present) followed by the picture.
pub fn classify_access_unit(data: &[u8], pts_us: i64) -> Vec<AccessUnit> {
    let mut parameter_sets = BytesMut::new();
    let mut picture = BytesMut::new();
    let mut kind = None;

    for nal in split_nal_units(data) {
        match nal_type(nal) {
            Some(NAL_SPS) | Some(NAL_PPS) => append_nal(&mut parameter_sets, nal),
            Some(NAL_IDR) => {
                kind = Some(AccessUnitKind::Keyframe);
                append_nal(&mut picture, nal);
            }
            Some(NAL_SLICE) => {
                kind.get_or_insert(AccessUnitKind::DeltaFrame);
                append_nal(&mut picture, nal);
            }
            // SEI, AUD and friends travel with the picture
            Some(_) => append_nal(&mut picture, nal),
            None => {}
        }
    }

    let mut units = Vec::with_capacity(2);
    if !parameter_sets.is_empty() {
        units.push(AccessUnit::new(
            parameter_sets.freeze(),
            AccessUnitKind::ParameterSet,
            pts_us,
        ));
    }
    if let Some(kind) = kind {
        units.push(AccessUnit::new(picture.freeze(), kind, pts_us));
    }
    units
}

fn append_nal(buf: &mut BytesMut, nal: &[u8]) {
    buf.put_slice(&START_CODE);
    buf.put_slice(nal);
}

/// Re-frame NAL bodies with 4-byte start codes
pub fn join_nal_units<'a>(nals: impl IntoIterator<Item = &'a [u8]>) -> Bytes {
    let mut buf = BytesMut::new();
    for nal in nals {
        append_nal(&mut buf, nal);
    }
    buf.freeze()
}
