//! Hardware encoder boundary
//!
//! The platform encoder is a black box: it is prepared with an
//! `EncoderConfig`, exposes an input surface (video) that the worker renders
//! into, and hands back compressed output in one of three shapes. The
//! `EncoderAdapter` normalizes that output into `AccessUnit`s for the muxer.

pub mod adapter;
pub mod annexb;

pub use adapter::{AdapterState, EncoderAdapter};

use bytes::Bytes;

use crate::errors::Result;
use crate::types::{AccessUnit, EncoderConfig, EncoderSurface, TrackKind};

/// One item drained from a hardware encoder
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderOutput {
    /// The encoder settled on its output format, e.g. `video/avc`
    FormatChanged { mime: String },
    /// Already classified unit
    Unit(AccessUnit),
    /// Raw output buffer tagged with the codec's flag word
    Buffer { data: Bytes, flags: u32, pts_us: i64 },
    /// Unflagged Annex B byte stream for one picture
    Bitstream { data: Bytes, pts_us: i64 },
    EndOfStream,
}

pub trait HardwareEncoder: Send {
    /// MIME type of the output, used to pick the track
    fn mime(&self) -> &str;

    fn prepare(&mut self) -> Result<()>;

    /// Surface the worker renders frames into. `None` for buffer-fed encoders.
    fn input_surface(&self) -> Option<EncoderSurface>;

    fn start(&mut self) -> Result<()>;

    /// A new frame has been submitted to the input surface
    fn frame_available_soon(&mut self) -> Result<()>;

    /// Non-blocking; `Ok(None)` when no output is pending
    fn poll_output(&mut self) -> Result<Option<EncoderOutput>>;

    fn signal_end_of_stream(&mut self) -> Result<()>;

    /// Free codec resources. Called at most once per encoder.
    fn release(&mut self);
}

/// Builds the encoders for one session
pub trait EncoderFactory: Send + Sync {
    fn create_video_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn HardwareEncoder>>;

    /// Optional audio encoder; sessions are video-only when this is `None`
    fn create_audio_encoder(
        &self,
        _config: &EncoderConfig,
    ) -> Result<Option<Box<dyn HardwareEncoder>>> {
        Ok(None)
    }
}

/// Lifecycle callbacks from an adapter to its owner
pub trait EncoderListener {
    fn on_prepared(&mut self, track: TrackKind, input_surface: Option<EncoderSurface>) -> Result<()>;

    fn on_stopped(&mut self, _track: TrackKind) {}
}
