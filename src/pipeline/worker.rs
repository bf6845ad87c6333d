//! Encoder worker thread
//!
//! All GPU and encoder state lives here. The worker only holds a weak handle
//! to the coordinator's shared state; once the coordinator is gone, queued
//! tasks are skipped and the session is torn down on the way out.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use uuid::Uuid;

use super::coordinator::Shared;
use super::queue::TaskQueue;
use super::state::{PipelineEvent, SessionState};
use crate::config::RelayConfig;
use crate::encoder::{EncoderAdapter, EncoderFactory, EncoderListener};
use crate::errors::{RelayError, Result};
use crate::gpu::{GpuBackend, RenderTarget};
use crate::mux::StreamMuxer;
use crate::timing::ns_to_us;
use crate::transport::{SessionGuard, Transport};
use crate::types::{
    EncoderConfig, EncoderSurface, GpuContextHandle, Orientation, TextureId, TrackKind,
    TransformMatrix,
};

pub(crate) type SharedGpu = Arc<Mutex<Box<dyn GpuBackend>>>;

#[derive(Debug)]
pub(crate) enum Task {
    BeginSession { session_id: Uuid, config: EncoderConfig },
    EndSession,
    FrameAvailable { transform: TransformMatrix, timestamp_ns: i64 },
    SetTexture(TextureId),
    UpdateSharedContext(GpuContextHandle),
    /// Fault reported from outside the worker, e.g. an encoder callback
    Fault(RelayError),
    Terminate,
}

impl Task {
    pub(crate) fn is_frame(&self) -> bool {
        matches!(self, Task::FrameAvailable { .. })
    }
}

/// Everything owned by one recording
struct Session {
    id: Uuid,
    muxer: StreamMuxer,
    video: EncoderAdapter,
    audio: Option<EncoderAdapter>,
    render_target: Option<RenderTarget>,
}

impl Session {
    /// Drain every track, even when an earlier one fails, and report the
    /// first error.
    fn drain(&mut self, limit: usize) -> Result<usize> {
        let video = self.video.drain(&mut self.muxer, limit);
        let audio = match self.audio.as_mut() {
            Some(audio) => audio.drain(&mut self.muxer, limit),
            None => Ok(0),
        };
        Ok(video? + audio?)
    }

    /// Stop the encoders, then release the render target, the codecs and the
    /// transport session. Consumes the session so it can only run once.
    fn teardown(mut self, gpu: &SharedGpu, drain_limit: usize) -> StreamMuxer {
        let mut listener = StopLogger;
        if let Err(e) = self.video.stop(&mut self.muxer, &mut listener, drain_limit) {
            log::warn!("Video encoder did not stop cleanly: {}", e);
        }
        if let Some(audio) = self.audio.as_mut() {
            if let Err(e) = audio.stop(&mut self.muxer, &mut listener, drain_limit) {
                log::warn!("Audio encoder did not stop cleanly: {}", e);
            }
        }

        if let Some(mut target) = self.render_target.take() {
            let mut gpu = gpu.lock().expect("lock poisoned");
            target.release(&mut **gpu);
        }

        self.video.release();
        if let Some(audio) = self.audio.as_mut() {
            audio.release();
        }
        self.muxer.close();
        self.muxer
    }
}

struct StopLogger;

impl EncoderListener for StopLogger {
    fn on_prepared(&mut self, _track: TrackKind, _surface: Option<EncoderSurface>) -> Result<()> {
        Ok(())
    }

    fn on_stopped(&mut self, track: TrackKind) {
        log::debug!("{} encoder stopped", track);
    }
}

/// Creates the render target once the video encoder exposes its input surface
struct SurfaceBinder<'a> {
    gpu: &'a SharedGpu,
    config: &'a EncoderConfig,
    orientation: Orientation,
    render_target: Option<RenderTarget>,
}

impl EncoderListener for SurfaceBinder<'_> {
    fn on_prepared(&mut self, track: TrackKind, surface: Option<EncoderSurface>) -> Result<()> {
        if track != TrackKind::Video {
            return Ok(());
        }
        let surface = surface.ok_or_else(|| {
            RelayError::Setup("video encoder exposed no input surface".to_string())
        })?;

        let mut gpu = self.gpu.lock().expect("lock poisoned");
        let mut target = RenderTarget::create(
            &mut **gpu,
            self.config.shared_context,
            surface,
            self.config.width,
            self.config.height,
        )?;
        target.set_orientation(self.orientation);
        self.render_target = Some(target);
        Ok(())
    }
}

pub(crate) struct Worker {
    shared: Weak<Shared>,
    queue: Arc<TaskQueue<Task>>,
    gpu: SharedGpu,
    encoders: Arc<dyn EncoderFactory>,
    transport: Arc<dyn Transport>,
    config: RelayConfig,
    session: Option<Session>,
    texture_id: TextureId,
}

impl Worker {
    pub(crate) fn new(
        shared: Weak<Shared>,
        queue: Arc<TaskQueue<Task>>,
        gpu: SharedGpu,
        encoders: Arc<dyn EncoderFactory>,
        transport: Arc<dyn Transport>,
        config: RelayConfig,
    ) -> Self {
        Self {
            shared,
            queue,
            gpu,
            encoders,
            transport,
            config,
            session: None,
            texture_id: 0,
        }
    }

    pub(crate) fn run(mut self) {
        log::debug!("Encoder worker running");
        let idle = Duration::from_millis(self.config.pipeline.drain_interval_ms.max(1));

        loop {
            match self.queue.pop_timeout(idle) {
                Ok(Some(task)) => {
                    if self.shared.upgrade().is_none() {
                        log::debug!("Coordinator dropped; skipping {:?}", task);
                        break;
                    }
                    if !self.handle(task) {
                        break;
                    }
                }
                Ok(None) => {
                    let result = self.drain();
                    if !self.check(result) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        self.shutdown();
    }

    /// Returns `false` when the worker should exit
    fn handle(&mut self, task: Task) -> bool {
        let result = match task {
            Task::BeginSession { session_id, config } => self.begin_session(session_id, config),
            Task::EndSession => {
                self.end_session();
                Ok(())
            }
            Task::FrameAvailable {
                transform,
                timestamp_ns,
            } => self.render_frame(&transform, timestamp_ns),
            Task::SetTexture(id) => {
                log::debug!("Encoder texture set to {}", id);
                self.texture_id = id;
                Ok(())
            }
            Task::UpdateSharedContext(context) => self.rebind(context),
            Task::Fault(err) => Err(err),
            Task::Terminate => return false,
        };
        self.check(result)
    }

    /// Route a task result: transport failures are reported and the session
    /// continues, anything else ends it.
    fn check(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if !e.is_fatal() => {
                log::warn!("Transport send failed: {}", e);
                self.with_shared(|shared| {
                    shared.update_stats(|stats| stats.transport_errors += 1);
                    shared.emit(PipelineEvent::TransportError(e));
                });
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn begin_session(&mut self, session_id: Uuid, config: EncoderConfig) -> Result<()> {
        if self.session.is_some() {
            log::warn!("Session already running; ignoring begin for {}", config);
            return Ok(());
        }
        if config.width == 0 || config.height == 0 {
            return Err(RelayError::Setup(format!("invalid dimensions in {}", config)));
        }
        log::info!("Preparing session {}: {}", session_id, config);

        let session = self.open_session(session_id, &config)?;
        self.session = Some(session);

        self.with_shared(|shared| {
            shared.set_state(SessionState::Active);
            shared.emit(PipelineEvent::SessionActive { session_id });
        });
        log::info!("Session {} active", session_id);
        Ok(())
    }

    fn open_session(&self, session_id: Uuid, config: &EncoderConfig) -> Result<Session> {
        let setup = |e: RelayError| match e {
            RelayError::Setup(_) => e,
            other => RelayError::Setup(other.to_string()),
        };

        let transport_session = self.transport.create_session(&config.destination).map_err(setup)?;
        let audio_config = self.config.audio.specific_config().map_err(setup)?;
        let mut muxer = StreamMuxer::new(SessionGuard::new(transport_session), audio_config);

        let video_encoder = self.encoders.create_video_encoder(config).map_err(setup)?;
        let video = EncoderAdapter::new(video_encoder, &mut muxer).map_err(setup)?;

        let audio = if self.config.audio.enabled {
            match self.encoders.create_audio_encoder(config).map_err(setup)? {
                Some(encoder) => Some(EncoderAdapter::new(encoder, &mut muxer).map_err(setup)?),
                None => {
                    log::debug!("No audio encoder available; session is video-only");
                    None
                }
            }
        } else {
            None
        };

        let mut session = Session {
            id: session_id,
            muxer,
            video,
            audio,
            render_target: None,
        };

        if let Err(e) = self.prepare(&mut session, config) {
            session.teardown(&self.gpu, 0);
            return Err(setup(e));
        }
        Ok(session)
    }

    fn prepare(&self, session: &mut Session, config: &EncoderConfig) -> Result<()> {
        let mut binder = SurfaceBinder {
            gpu: &self.gpu,
            config,
            orientation: self.orientation(),
            render_target: None,
        };

        let result = session.video.prepare(&mut binder).and_then(|_| match session.audio.as_mut() {
            Some(audio) => audio.prepare(&mut binder),
            None => Ok(()),
        });
        session.render_target = binder.render_target.take();
        result?;

        session.video.start_recording()?;
        if let Some(audio) = session.audio.as_mut() {
            audio.start_recording()?;
        }
        Ok(())
    }

    fn render_frame(&mut self, transform: &TransformMatrix, timestamp_ns: i64) -> Result<()> {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(()),
        };

        if let Some(target) = session.render_target.as_mut() {
            let mut gpu = self.gpu.lock().expect("lock poisoned");
            target.render(&mut **gpu, self.texture_id, transform, timestamp_ns)?;
        }
        session.video.frame_available_soon()?;

        self.with_shared(|shared| {
            shared.update_stats(|stats| {
                stats.frames_rendered += 1;
                stats.last_frame_pts_us = Some(ns_to_us(timestamp_ns));
            })
        });
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        let limit = self.config.pipeline.drain_limit;
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(()),
        };

        let result = session.drain(limit).map(|_| ());
        let muxer_stats = session.muxer.stats();
        self.with_shared(|shared| {
            shared.update_stats(|stats| {
                stats.video_units = muxer_stats.video_units;
                stats.audio_units = muxer_stats.audio_units;
                stats.parameter_set_resends = muxer_stats.parameter_set_resends;
                stats.bytes_sent = muxer_stats.bytes_sent;
            })
        });
        result
    }

    fn rebind(&mut self, context: GpuContextHandle) -> Result<()> {
        let orientation = self.orientation();
        let target = match self.session.as_mut().and_then(|s| s.render_target.as_mut()) {
            Some(target) => target,
            None => {
                log::debug!("No render target to rebind to {:?}", context);
                return Ok(());
            }
        };

        log::info!("Rebinding encoder surface to shared context {:?}", context);
        target.set_orientation(orientation);
        let mut gpu = self.gpu.lock().expect("lock poisoned");
        target.rebind(&mut **gpu, context)
    }

    /// Tear down the session if there is one. Runs at most once per session.
    fn end_session(&mut self) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        let session_id = session.id;
        self.with_shared(|shared| shared.set_state(SessionState::Stopping));

        let muxer = session.teardown(&self.gpu, self.config.pipeline.drain_limit);
        let muxer_stats = muxer.stats();
        drop(muxer);

        self.with_shared(|shared| {
            shared.update_stats(|stats| {
                stats.video_units = muxer_stats.video_units;
                stats.audio_units = muxer_stats.audio_units;
                stats.parameter_set_resends = muxer_stats.parameter_set_resends;
                stats.bytes_sent = muxer_stats.bytes_sent;
            });
            shared.set_state(SessionState::Idle);
            shared.emit(PipelineEvent::SessionStopped { session_id });
        });
        log::info!(
            "Session {} closed: {} video / {} audio units, {} bytes",
            session_id,
            muxer_stats.video_units,
            muxer_stats.audio_units,
            muxer_stats.bytes_sent
        );
    }

    fn fail(&mut self, err: RelayError) {
        log::error!("Fatal pipeline error: {}", err);
        self.with_shared(|shared| {
            shared.set_state(SessionState::Stopping);
            shared.close_fence();
            shared.emit(PipelineEvent::Fatal(err.clone()));
        });

        let purged = self.queue.purge(Task::is_frame);
        if purged > 0 {
            self.with_shared(|shared| shared.update_stats(|stats| stats.frames_dropped += purged as u64));
        }
        self.end_session();
    }

    fn shutdown(&mut self) {
        self.end_session();
        self.queue.close();
        self.with_shared(|shared| {
            shared.close_fence();
            shared.set_state(SessionState::Idle);
            shared.mark_stopped();
        });
        log::debug!("Encoder worker exited");
    }

    fn orientation(&self) -> Orientation {
        self.shared
            .upgrade()
            .map(|shared| shared.orientation())
            .unwrap_or_default()
    }

    fn with_shared<F: FnOnce(&Shared)>(&self, f: F) {
        if let Some(shared) = self.shared.upgrade() {
            f(&shared);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.end_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::AudioSpecificConfig;
    use crate::testing::{MockGpu, RecordingTransport, ScriptedEncoder};
    use crate::types::StreamId;

    fn session(transport: &RecordingTransport) -> Session {
        let mut muxer = StreamMuxer::new(
            SessionGuard::new(transport.create_session("10.0.0.9").unwrap()),
            AudioSpecificConfig::default(),
        );
        let mut video = EncoderAdapter::new(
            Box::new(ScriptedEncoder::video(EncoderSurface(3), 30)),
            &mut muxer,
        )
        .unwrap();
        let mut audio = EncoderAdapter::new(Box::new(ScriptedEncoder::audio()), &mut muxer).unwrap();
        for adapter in [&mut video, &mut audio] {
            adapter.prepare(&mut StopLogger).unwrap();
            adapter.start_recording().unwrap();
        }
        Session {
            id: Uuid::new_v4(),
            muxer,
            video,
            audio: Some(audio),
            render_target: None,
        }
    }

    #[test]
    fn test_video_send_failure_still_drains_audio() {
        let transport = RecordingTransport::new();
        let mut session = session(&transport);

        // audio announces its format, video has not seen a frame yet
        session.drain(64).unwrap();
        assert!(!session.muxer.is_started());

        transport.fail_sends_on(StreamId::Video, true);
        session.video.frame_available_soon().unwrap();
        assert!(matches!(session.drain(64), Err(RelayError::Transport(_))));

        assert!(transport.sends_on(StreamId::Video).is_empty());
        assert_eq!(transport.sends_on(StreamId::Audio).len(), 1);
        assert_eq!(session.muxer.stats().audio_units, 1);

        let backend: Box<dyn GpuBackend> = Box::new(MockGpu::new());
        let gpu: SharedGpu = Arc::new(Mutex::new(backend));
        session.teardown(&gpu, 64);
        assert_eq!(transport.log().lock().unwrap().sessions_destroyed, 1);
    }
}
