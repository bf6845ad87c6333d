//! Value types shared by the pipeline stages

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// GPU texture name the producer renders camera frames into.
pub type TextureId = u32;

/// Column-major 4x4 texture-coordinate transform supplied with each frame.
pub type TransformMatrix = [f32; 16];

pub const IDENTITY_TRANSFORM: TransformMatrix = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Opaque handle to the producer's GPU context; the encoder worker creates
/// its own context sharing textures with this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuContextHandle(pub u64);

/// Opaque handle to the input surface a hardware video encoder consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncoderSurface(pub u64);

/// One frame announced by the producer thread.
///
/// The texture itself is not carried: the worker samples it through the
/// shared context before the producer writes the next frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub texture_id: TextureId,
    /// Monotonic capture time. Zero marks an invalid frame (seen after
    /// device sleep/wake) and is always discarded.
    pub timestamp_ns: i64,
    pub transform: TransformMatrix,
}

impl Frame {
    pub fn new(texture_id: TextureId, timestamp_ns: i64, transform: TransformMatrix) -> Self {
        Self {
            texture_id,
            timestamp_ns,
            transform,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.timestamp_ns != 0
    }
}

/// Immutable description of one recording session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Dotted IPv4 address of the receiver.
    pub destination: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub shared_context: GpuContextHandle,
}

impl EncoderConfig {
    pub fn new(
        destination: impl Into<String>,
        width: u32,
        height: u32,
        bitrate_bps: u32,
        shared_context: GpuContextHandle,
    ) -> Self {
        Self {
            destination: destination.into(),
            width,
            height,
            bitrate_bps,
            shared_context,
        }
    }
}

impl std::fmt::Display for EncoderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} @{}bps to '{}' ctx={:?}",
            self.width, self.height, self.bitrate_bps, self.destination, self.shared_context
        )
    }
}

/// Kind of compressed chunk produced by an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessUnitKind {
    /// Out-of-band codec configuration (SPS/PPS).
    ParameterSet,
    Keyframe,
    DeltaFrame,
    AudioFrame,
}

impl AccessUnitKind {
    const FLAG_KEY_FRAME: u32 = 1;
    const FLAG_CODEC_CONFIG: u32 = 2;
    const FLAG_PARTIAL_FRAME: u32 = 8;

    /// Map a hardware encoder's per-buffer flag word onto a video unit kind.
    ///
    /// Only the exact combinations below are forwarded; end-of-stream and
    /// anything else yields `None`.
    pub fn from_codec_flags(flags: u32) -> Option<Self> {
        match flags {
            Self::FLAG_CODEC_CONFIG => Some(AccessUnitKind::ParameterSet),
            f if f == Self::FLAG_KEY_FRAME || f == Self::FLAG_KEY_FRAME | Self::FLAG_PARTIAL_FRAME => {
                Some(AccessUnitKind::Keyframe)
            }
            0 | Self::FLAG_PARTIAL_FRAME => Some(AccessUnitKind::DeltaFrame),
            _ => None,
        }
    }
}

/// One compressed output chunk. Forwarded immediately, never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub data: Bytes,
    pub kind: AccessUnitKind,
    pub pts_us: i64,
}

impl AccessUnit {
    pub fn new(data: impl Into<Bytes>, kind: AccessUnitKind, pts_us: i64) -> Self {
        Self {
            data: data.into(),
            kind,
            pts_us,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Logical channel inside the muxer. The numbering is fixed by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Derive the track from a MIME string such as `video/avc` or
    /// `audio/mp4a-latm`.
    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.contains("video") {
            Some(TrackKind::Video)
        } else if mime.contains("audio") {
            Some(TrackKind::Audio)
        } else {
            None
        }
    }

    pub fn track_id(&self) -> u8 {
        self.stream_id().as_u8()
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            TrackKind::Video => StreamId::Video,
            TrackKind::Audio => StreamId::Audio,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Logical stream id tagged on every transport send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StreamId {
    Video = 1,
    Audio = 2,
}

impl StreamId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Which physical camera feeds the producer; front cameras are mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

/// Quad orientation used when sampling the camera texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub facing: CameraFacing,
    /// Producer-defined display mode (rotation preset).
    pub mode: u32,
}

impl Orientation {
    pub fn mirrored(&self) -> bool {
        self.facing == CameraFacing::Front
    }
}
