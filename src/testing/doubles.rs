//! In-process stand-ins for the GPU, the hardware encoders and the transport
//!
//! Each double hands out a probe (`Arc<Mutex<..>>`) so tests can inspect what
//! the pipeline did after the double has moved onto the worker thread.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::encoder::{EncoderFactory, EncoderOutput, HardwareEncoder};
use crate::errors::{RelayError, Result};
use crate::gpu::{ContextId, GpuBackend, SurfaceId};
use crate::transport::{Transport, TransportSession};
use crate::types::{
    AccessUnit, AccessUnitKind, EncoderConfig, EncoderSurface, GpuContextHandle, Orientation,
    StreamId, TextureId, TransformMatrix,
};

use super::synthetic_data::{synthetic_aac_frame, synthetic_picture, SYNTHETIC_PARAMETER_SETS};

// ---------------------------------------------------------------------------
// GPU
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum GpuCall {
    CreateContext(GpuContextHandle),
    CreateSurface(EncoderSurface),
    MakeCurrent,
    Clear,
    Viewport { width: u32, height: u32 },
    Draw { texture: TextureId, mirrored: bool },
    PresentationTime { surface: SurfaceId, timestamp_ns: i64 },
    Swap { surface: SurfaceId },
    ReleaseSurface(SurfaceId),
    ReleaseContext(ContextId),
}

#[derive(Debug, Default)]
pub struct GpuProbe {
    pub calls: Vec<GpuCall>,
    pub contexts_created: u32,
    pub contexts_released: u32,
    pub surfaces_created: u32,
    pub surfaces_released: u32,
    /// Releases of handles that were not live
    pub double_releases: u32,
    pub fail_surface_creation: bool,
    /// Make `release_context` take this long
    pub release_delay: Option<Duration>,
}

impl GpuProbe {
    pub fn live_contexts(&self) -> u32 {
        self.contexts_created - self.contexts_released
    }

    pub fn presented_timestamps(&self) -> Vec<i64> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                GpuCall::PresentationTime { timestamp_ns, .. } => Some(*timestamp_ns),
                _ => None,
            })
            .collect()
    }

    pub fn drawn_textures(&self) -> Vec<TextureId> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                GpuCall::Draw { texture, .. } => Some(*texture),
                _ => None,
            })
            .collect()
    }
}

pub struct MockGpu {
    probe: Arc<Mutex<GpuProbe>>,
    next_id: u64,
    live_contexts: HashSet<u64>,
    live_surfaces: HashSet<u64>,
}

impl MockGpu {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(Mutex::new(GpuProbe::default())),
            next_id: 1,
            live_contexts: HashSet::new(),
            live_surfaces: HashSet::new(),
        }
    }

    pub fn probe(&self) -> Arc<Mutex<GpuProbe>> {
        self.probe.clone()
    }

    fn record(&self, call: GpuCall) {
        self.probe.lock().expect("lock poisoned").calls.push(call);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Default for MockGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for MockGpu {
    fn create_context(&mut self, shared: GpuContextHandle) -> Result<ContextId> {
        let id = self.next_id();
        self.live_contexts.insert(id);
        self.record(GpuCall::CreateContext(shared));
        self.probe.lock().expect("lock poisoned").contexts_created += 1;
        Ok(ContextId(id))
    }

    fn create_window_surface(
        &mut self,
        _context: ContextId,
        target: EncoderSurface,
    ) -> Result<SurfaceId> {
        if self.probe.lock().expect("lock poisoned").fail_surface_creation {
            return Err(RelayError::Gpu("window surface creation failed".to_string()));
        }
        let id = self.next_id();
        self.live_surfaces.insert(id);
        self.record(GpuCall::CreateSurface(target));
        self.probe.lock().expect("lock poisoned").surfaces_created += 1;
        Ok(SurfaceId(id))
    }

    fn make_current(&mut self, _context: ContextId, _surface: SurfaceId) -> Result<()> {
        self.record(GpuCall::MakeCurrent);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.record(GpuCall::Clear);
        Ok(())
    }

    fn set_viewport(&mut self, width: u32, height: u32) -> Result<()> {
        self.record(GpuCall::Viewport { width, height });
        Ok(())
    }

    fn draw_texture(
        &mut self,
        texture: TextureId,
        _transform: &TransformMatrix,
        orientation: Orientation,
    ) -> Result<()> {
        self.record(GpuCall::Draw {
            texture,
            mirrored: orientation.mirrored(),
        });
        Ok(())
    }

    fn set_presentation_time(&mut self, surface: SurfaceId, timestamp_ns: i64) -> Result<()> {
        self.record(GpuCall::PresentationTime {
            surface,
            timestamp_ns,
        });
        Ok(())
    }

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<()> {
        self.record(GpuCall::Swap { surface });
        Ok(())
    }

    fn release_surface(&mut self, surface: SurfaceId) {
        let live = self.live_surfaces.remove(&surface.0);
        self.record(GpuCall::ReleaseSurface(surface));
        let mut probe = self.probe.lock().expect("lock poisoned");
        if live {
            probe.surfaces_released += 1;
        } else {
            probe.double_releases += 1;
        }
    }

    fn release_context(&mut self, context: ContextId) {
        let delay = self.probe.lock().expect("lock poisoned").release_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let live = self.live_contexts.remove(&context.0);
        self.record(GpuCall::ReleaseContext(context));
        let mut probe = self.probe.lock().expect("lock poisoned");
        if live {
            probe.contexts_released += 1;
        } else {
            probe.double_releases += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TransportLog {
    pub sessions_created: u32,
    /// Every `destroy` call, including repeated ones
    pub sessions_destroyed: u32,
    pub destinations: Vec<String>,
    pub sends: Vec<(StreamId, Vec<u8>)>,
    /// Streams whose sends fail with a transport error
    pub failing: HashSet<StreamId>,
}

/// Transport that records every send in memory
#[derive(Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<TransportLog>> {
        self.log.clone()
    }

    pub fn sends(&self) -> Vec<(StreamId, Vec<u8>)> {
        self.log.lock().expect("lock poisoned").sends.clone()
    }

    pub fn sends_on(&self, stream: StreamId) -> Vec<Vec<u8>> {
        self.sends()
            .into_iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, payload)| payload)
            .collect()
    }

    /// Make every subsequent send fail with a transport error
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends_on(StreamId::Video, fail);
        self.fail_sends_on(StreamId::Audio, fail);
    }

    /// Make subsequent sends on `stream` fail with a transport error
    pub fn fail_sends_on(&self, stream: StreamId, fail: bool) {
        let mut log = self.log.lock().expect("lock poisoned");
        if fail {
            log.failing.insert(stream);
        } else {
            log.failing.remove(&stream);
        }
    }
}

impl Transport for RecordingTransport {
    fn create_session(&self, destination: &str) -> Result<Box<dyn TransportSession>> {
        let mut log = self.log.lock().expect("lock poisoned");
        log.sessions_created += 1;
        log.destinations.push(destination.to_string());
        Ok(Box::new(RecordingSession {
            log: self.log.clone(),
        }))
    }
}

struct RecordingSession {
    log: Arc<Mutex<TransportLog>>,
}

impl TransportSession for RecordingSession {
    fn send(&mut self, payload: &[u8], stream: StreamId) -> Result<()> {
        let mut log = self.log.lock().expect("lock poisoned");
        if log.failing.contains(&stream) {
            return Err(RelayError::Transport(format!("{:?} send refused", stream)));
        }
        log.sends.push((stream, payload.to_vec()));
        Ok(())
    }

    fn destroy(&mut self) {
        self.log.lock().expect("lock poisoned").sessions_destroyed += 1;
    }
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct EncoderProbe {
    pub mime: String,
    pub prepared: u32,
    pub started: u32,
    pub frames: u64,
    pub end_of_stream: bool,
    pub releases: u32,
}

const FRAME_INTERVAL_US: i64 = 33_333;
const AAC_FRAME_INTERVAL_US: i64 = 23_219;

enum Script {
    /// One picture per submitted frame
    Video { gop: u64, picture_size: usize },
    /// One AAC frame every other poll
    Audio { emit_next: bool },
    /// Fixed list of outputs
    Fixed,
}

/// Encoder that produces a deterministic H.264 or AAC output pattern
pub struct ScriptedEncoder {
    mime: String,
    surface: Option<EncoderSurface>,
    script: Script,
    pending: VecDeque<EncoderOutput>,
    started: bool,
    format_announced: bool,
    fail_after: Option<u64>,
    sequence: u64,
    probe: Arc<Mutex<EncoderProbe>>,
}

impl ScriptedEncoder {
    fn build(mime: &str, surface: Option<EncoderSurface>, script: Script) -> Self {
        let probe = EncoderProbe {
            mime: mime.to_string(),
            ..EncoderProbe::default()
        };
        Self {
            mime: mime.to_string(),
            surface,
            script,
            pending: VecDeque::new(),
            started: false,
            format_announced: false,
            fail_after: None,
            sequence: 0,
            probe: Arc::new(Mutex::new(probe)),
        }
    }

    /// H.264 encoder: parameter sets and an IDR first, then a keyframe every
    /// `gop` frames (0 = only the first).
    pub fn video(surface: EncoderSurface, gop: u64) -> Self {
        Self::build(
            "video/avc",
            Some(surface),
            Script::Video {
                gop,
                picture_size: 1_500,
            },
        )
    }

    pub fn audio() -> Self {
        Self::build("audio/mp4a-latm", None, Script::Audio { emit_next: true })
    }

    /// Encoder that replays `outputs` once started
    pub fn with_outputs(mime: &str, outputs: Vec<EncoderOutput>) -> Self {
        let mut encoder = Self::build(mime, None, Script::Fixed);
        encoder.pending = outputs.into();
        encoder.format_announced = true;
        encoder
    }

    /// Fault on the frame after the first `frames` frames
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn with_picture_size(mut self, size: usize) -> Self {
        if let Script::Video { picture_size, .. } = &mut self.script {
            *picture_size = size;
        }
        self
    }

    pub fn probe(&self) -> Arc<Mutex<EncoderProbe>> {
        self.probe.clone()
    }

    fn announce_format(&mut self) {
        if !self.format_announced {
            self.pending.push_back(EncoderOutput::FormatChanged {
                mime: self.mime.clone(),
            });
            self.format_announced = true;
        }
    }
}

impl HardwareEncoder for ScriptedEncoder {
    fn mime(&self) -> &str {
        &self.mime
    }

    fn prepare(&mut self) -> Result<()> {
        self.probe.lock().expect("lock poisoned").prepared += 1;
        Ok(())
    }

    fn input_surface(&self) -> Option<EncoderSurface> {
        self.surface
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        self.probe.lock().expect("lock poisoned").started += 1;
        Ok(())
    }

    fn frame_available_soon(&mut self) -> Result<()> {
        let frames = {
            let mut probe = self.probe.lock().expect("lock poisoned");
            probe.frames += 1;
            probe.frames
        };
        if let Some(limit) = self.fail_after {
            if frames > limit {
                return Err(RelayError::Encoder(format!(
                    "scripted fault on frame {}",
                    frames
                )));
            }
        }

        if let Script::Video { gop, picture_size } = self.script {
            let index = self.sequence;
            self.sequence += 1;
            let pts_us = index as i64 * FRAME_INTERVAL_US;

            if !self.format_announced {
                self.announce_format();
                self.pending.push_back(EncoderOutput::Unit(AccessUnit::new(
                    Bytes::from_static(&SYNTHETIC_PARAMETER_SETS),
                    AccessUnitKind::ParameterSet,
                    pts_us,
                )));
            }
            let keyframe = index == 0 || (gop > 0 && index % gop == 0);
            let kind = if keyframe {
                AccessUnitKind::Keyframe
            } else {
                AccessUnitKind::DeltaFrame
            };
            self.pending.push_back(EncoderOutput::Unit(AccessUnit::new(
                synthetic_picture(kind, picture_size, index),
                kind,
                pts_us,
            )));
        }
        Ok(())
    }

    fn poll_output(&mut self) -> Result<Option<EncoderOutput>> {
        if !self.started {
            return Ok(None);
        }
        if let Some(output) = self.pending.pop_front() {
            return Ok(Some(output));
        }

        let end_of_stream = self.probe.lock().expect("lock poisoned").end_of_stream;
        if let Script::Audio { emit_next } = &mut self.script {
            if end_of_stream {
                return Ok(None);
            }
            if !self.format_announced {
                self.announce_format();
                return Ok(self.pending.pop_front());
            }
            let emit = *emit_next;
            *emit_next = !emit;
            if emit {
                let index = self.sequence;
                self.sequence += 1;
                return Ok(Some(EncoderOutput::Unit(AccessUnit::new(
                    synthetic_aac_frame(200, index),
                    AccessUnitKind::AudioFrame,
                    index as i64 * AAC_FRAME_INTERVAL_US,
                ))));
            }
        }
        Ok(None)
    }

    fn signal_end_of_stream(&mut self) -> Result<()> {
        self.probe.lock().expect("lock poisoned").end_of_stream = true;
        self.pending.push_back(EncoderOutput::EndOfStream);
        Ok(())
    }

    fn release(&mut self) {
        self.probe.lock().expect("lock poisoned").releases += 1;
    }
}

/// Factory handing out scripted encoders and keeping their probes
pub struct ScriptedEncoderFactory {
    gop: u64,
    audio: bool,
    fail_after: Option<u64>,
    fail_creation: bool,
    picture_size: usize,
    next_surface: Mutex<u64>,
    probes: Mutex<Vec<Arc<Mutex<EncoderProbe>>>>,
}

impl ScriptedEncoderFactory {
    pub fn new() -> Self {
        Self {
            gop: 30,
            audio: false,
            fail_after: None,
            fail_creation: false,
            picture_size: 1_500,
            next_surface: Mutex::new(100),
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_gop(mut self, gop: u64) -> Self {
        self.gop = gop;
        self
    }

    pub fn with_audio(mut self) -> Self {
        self.audio = true;
        self
    }

    pub fn with_picture_size(mut self, size: usize) -> Self {
        self.picture_size = size;
        self
    }

    /// Video encoders fault after `frames` frames
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Video encoder construction fails
    pub fn fail_creation(mut self) -> Self {
        self.fail_creation = true;
        self
    }

    /// Probes of every encoder created so far, in creation order
    pub fn probes(&self) -> Vec<Arc<Mutex<EncoderProbe>>> {
        self.probes.lock().expect("lock poisoned").clone()
    }

    fn keep(&self, encoder: &ScriptedEncoder) {
        self.probes.lock().expect("lock poisoned").push(encoder.probe());
    }
}

impl Default for ScriptedEncoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderFactory for ScriptedEncoderFactory {
    fn create_video_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn HardwareEncoder>> {
        if self.fail_creation {
            return Err(RelayError::Setup(format!("no encoder for {}", config)));
        }
        let surface = {
            let mut next = self.next_surface.lock().expect("lock poisoned");
            *next += 1;
            EncoderSurface(*next)
        };
        let mut encoder =
            ScriptedEncoder::video(surface, self.gop).with_picture_size(self.picture_size);
        if let Some(frames) = self.fail_after {
            encoder = encoder.fail_after(frames);
        }
        self.keep(&encoder);
        Ok(Box::new(encoder))
    }

    fn create_audio_encoder(
        &self,
        _config: &EncoderConfig,
    ) -> Result<Option<Box<dyn HardwareEncoder>>> {
        if !self.audio {
            return Ok(None);
        }
        let encoder = ScriptedEncoder::audio();
        self.keep(&encoder);
        Ok(Some(Box::new(encoder)))
    }
}
