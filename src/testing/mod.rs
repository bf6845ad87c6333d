//! Test doubles and synthetic data for camrelay
//!
//! Used by the unit and integration tests and by the demo binary, which runs
//! the real RTP transport against scripted encoders.

pub mod doubles;
pub mod synthetic_data;

pub use doubles::{
    EncoderProbe, GpuCall, GpuProbe, MockGpu, RecordingTransport, ScriptedEncoder,
    ScriptedEncoderFactory, TransportLog,
};
pub use synthetic_data::{
    synthetic_aac_frame, synthetic_frame, synthetic_picture, SYNTHETIC_PARAMETER_SETS,
    SYNTHETIC_TEXTURE,
};
