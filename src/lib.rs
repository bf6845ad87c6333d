//! camrelay: live camera frames → hardware encoder → stream muxer → network
//!
//! The crate coordinates a producer thread that keeps rendering camera frames
//! with a dedicated encoder worker that owns the GPU context, the hardware
//! encoders and the muxer. Encoded video and audio are framed for the
//! receiver (parameter sets ahead of every keyframe, ADTS headers on AAC) and
//! handed to a transport session.
//!
//! # Features
//! - Non-blocking lifecycle: `start`, `stop`, `on_frame_ready` never wait on
//!   encoder or GPU work
//! - Mid-session GPU context rebinding
//! - Exactly-once teardown on stop or encoder fault
//! - RTP/UDP transport with H.264 FU-A packetization (`rtp` feature)
//!
//! # Usage
//! ```rust,ignore
//! use std::sync::Arc;
//! use camrelay::{PipelineCoordinator, RelayConfig, RtpTransport};
//!
//! let config = RelayConfig::load_or_default();
//! let transport = Arc::new(RtpTransport::new(config.transport.clone()));
//! let coordinator = PipelineCoordinator::new(config, gpu, encoders, transport)?;
//! coordinator.start(encoder_config)?;
//! // on the render thread, per frame:
//! coordinator.on_frame_ready(&frame);
//! ```
pub mod config;
pub mod encoder;
pub mod errors;
pub mod gpu;
pub mod mux;
pub mod pipeline;
pub mod timing;
pub mod transport;
pub mod types;

// Testing utilities - doubles and synthetic data for offline runs
pub mod testing;

pub use config::RelayConfig;
pub use encoder::{EncoderAdapter, EncoderFactory, EncoderListener, EncoderOutput, HardwareEncoder};
pub use errors::RelayError;
pub use gpu::{GpuBackend, RenderTarget};
pub use mux::StreamMuxer;
pub use pipeline::{PipelineCoordinator, PipelineEvent, SessionState, SessionStats};
pub use transport::{Transport, TransportSession};
pub use types::{
    AccessUnit, AccessUnitKind, CameraFacing, EncoderConfig, Frame, GpuContextHandle, StreamId,
    TrackKind,
};

#[cfg(feature = "rtp")]
pub use transport::RtpTransport;

/// Initialize logging for binaries and tests. Library code never calls this.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "camrelay=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        rtp: cfg!(feature = "rtp"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Whether the RTP transport is compiled in
    pub rtp: bool,
}
