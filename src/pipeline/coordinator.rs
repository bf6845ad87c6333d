//! Pipeline coordinator: the producer-facing half of the encoder pipeline
//!
//! Every call here is cheap and non-blocking apart from the bounded wait in
//! `start` for the worker's task queue to come up. Heavy work (encoder
//! construction, GPU surface creation, teardown) runs on the worker.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use uuid::Uuid;

use super::queue::TaskQueue;
use super::state::{PipelineEvent, SessionState, SessionStats};
use super::worker::{SharedGpu, Task, Worker};
use crate::config::RelayConfig;
use crate::encoder::EncoderFactory;
use crate::errors::{RelayError, Result};
use crate::gpu::GpuBackend;
use crate::transport::Transport;
use crate::types::{
    CameraFacing, EncoderConfig, Frame, GpuContextHandle, Orientation, TextureId,
};

const EVENT_CAPACITY: usize = 64;

/// Guarded flags shared with the worker. Never held across I/O or GPU calls.
#[derive(Default)]
struct Fence {
    /// Worker thread exists and has not exited
    running: bool,
    /// Worker queue is live and accepting frames
    ready: bool,
    queue: Option<Arc<TaskQueue<Task>>>,
}

/// State reachable from the worker through a weak handle
pub(crate) struct Shared {
    fence: Mutex<Fence>,
    state: Mutex<SessionState>,
    stats: Mutex<SessionStats>,
    orientation: Mutex<Orientation>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Shared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            fence: Mutex::new(Fence::default()),
            state: Mutex::new(SessionState::Idle),
            stats: Mutex::new(SessionStats::default()),
            orientation: Mutex::new(Orientation::default()),
            events,
        }
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock().expect("lock poisoned");
        if *current != state {
            log::debug!("Pipeline state {} -> {}", *current, state);
            *current = state;
        }
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn update_stats<F: FnOnce(&mut SessionStats)>(&self, f: F) {
        f(&mut self.stats.lock().expect("lock poisoned"));
    }

    pub(crate) fn orientation(&self) -> Orientation {
        *self.orientation.lock().expect("lock poisoned")
    }

    /// Stop accepting tasks from the producer side
    pub(crate) fn close_fence(&self) -> Option<Arc<TaskQueue<Task>>> {
        let mut fence = self.fence.lock().expect("lock poisoned");
        fence.ready = false;
        fence.queue.take()
    }

    pub(crate) fn mark_stopped(&self) {
        let mut fence = self.fence.lock().expect("lock poisoned");
        fence.running = false;
        fence.ready = false;
        fence.queue = None;
    }

    /// Queue of a ready worker, if any
    fn ready_queue(&self) -> Option<Arc<TaskQueue<Task>>> {
        let fence = self.fence.lock().expect("lock poisoned");
        if fence.ready {
            fence.queue.clone()
        } else {
            None
        }
    }
}

pub struct PipelineCoordinator {
    shared: Arc<Shared>,
    config: RelayConfig,
    gpu: SharedGpu,
    encoders: Arc<dyn EncoderFactory>,
    transport: Arc<dyn Transport>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineCoordinator {
    pub fn new(
        config: RelayConfig,
        gpu: Box<dyn GpuBackend>,
        encoders: Arc<dyn EncoderFactory>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new()),
            config,
            gpu: Arc::new(Mutex::new(gpu)),
            encoders,
            transport,
            worker: Mutex::new(None),
        })
    }

    /// Start a recording session.
    ///
    /// Blocks only until the worker's task queue is live; encoder and GPU
    /// setup continue asynchronously and are reported on `subscribe()`.
    /// Returns `AlreadyActive` if a worker is still running.
    pub fn start(&self, config: EncoderConfig) -> Result<()> {
        {
            let mut fence = self.shared.fence.lock().expect("lock poisoned");
            if fence.running {
                log::warn!("start ignored: a session is already active");
                return Err(RelayError::AlreadyActive);
            }
            fence.running = true;
        }

        // A previous worker clears `running` as its last step
        if let Some(previous) = self.worker.lock().expect("lock poisoned").take() {
            let _ = previous.join();
        }

        let session_id = Uuid::new_v4();
        *self.shared.stats.lock().expect("lock poisoned") = SessionStats::begin(session_id);

        let queue = Arc::new(TaskQueue::new());
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker = Worker::new(
            Arc::downgrade(&self.shared),
            queue.clone(),
            self.gpu.clone(),
            self.encoders.clone(),
            self.transport.clone(),
            self.config.clone(),
        );

        let spawned = std::thread::Builder::new()
            .name("camrelay-encoder".to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                worker.run();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.mark_stopped();
                return Err(RelayError::WorkerUnavailable(format!("spawn failed: {e}")));
            }
        };
        *self.worker.lock().expect("lock poisoned") = Some(handle);

        let timeout = Duration::from_millis(self.config.pipeline.ready_timeout_ms);
        if ready_rx.recv_timeout(timeout).is_err() {
            queue.close();
            return Err(RelayError::WorkerUnavailable(format!(
                "worker not ready after {:?}",
                timeout
            )));
        }

        {
            let mut fence = self.shared.fence.lock().expect("lock poisoned");
            fence.ready = true;
            fence.queue = Some(queue.clone());
        }
        self.shared.set_state(SessionState::Preparing);
        self.shared.emit(PipelineEvent::SessionStarting { session_id });
        log::info!("Starting session {}: {}", session_id, config);

        queue.push(Task::BeginSession { session_id, config });
        Ok(())
    }

    /// Request teardown and return immediately. Pending frame tasks are
    /// purged first so the worker does not work through a stale backlog.
    pub fn stop(&self) {
        let queue = match self.shared.close_fence() {
            Some(queue) => queue,
            None => {
                log::debug!("stop: no running session");
                return;
            }
        };

        let purged = queue.purge(Task::is_frame);
        if purged > 0 {
            self.shared.update_stats(|stats| stats.frames_dropped += purged as u64);
            log::debug!("Purged {} pending frames", purged);
        }
        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if matches!(*state, SessionState::Preparing | SessionState::Active) {
                *state = SessionState::Stopping;
            }
        }
        queue.push(Task::EndSession);
        queue.push(Task::Terminate);
        log::info!("Session stop requested");
    }

    /// Whether a worker is running (from `start` until teardown completes)
    pub fn is_active(&self) -> bool {
        self.shared.fence.lock().expect("lock poisoned").running
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().expect("lock poisoned")
    }

    /// Announce a new producer frame. Cheap no-op when no session is ready;
    /// zero-timestamp frames are discarded.
    pub fn on_frame_ready(&self, frame: &Frame) {
        if !frame.is_valid() {
            self.shared.update_stats(|stats| stats.frames_dropped += 1);
            log::trace!("Discarding frame with zero timestamp");
            return;
        }

        if let Some(queue) = self.shared.ready_queue() {
            let queued = queue.push(Task::FrameAvailable {
                transform: frame.transform,
                timestamp_ns: frame.timestamp_ns,
            });
            if queued {
                self.shared.update_stats(|stats| stats.frames_submitted += 1);
            }
        }
    }

    pub fn set_encoder_texture_id(&self, texture_id: TextureId) {
        if let Some(queue) = self.shared.ready_queue() {
            queue.push(Task::SetTexture(texture_id));
        }
    }

    /// Rebind the worker's GPU surface to a recreated producer context
    /// without restarting the session.
    pub fn update_shared_context(&self, context: GpuContextHandle) {
        if let Some(queue) = self.shared.ready_queue() {
            queue.push(Task::UpdateSharedContext(context));
        }
    }

    /// Record the camera facing and display mode; applied when the render
    /// target is next created or rebound.
    pub fn switch_camera(&self, facing: CameraFacing, mode: u32) {
        *self.shared.orientation.lock().expect("lock poisoned") = Orientation { facing, mode };
        log::debug!("Camera switched to {:?} (mode {})", facing, mode);
    }

    /// Report a fault from an encoder callback running off the worker thread.
    /// The session is torn down on the worker.
    pub fn report_encoder_fault(&self, err: RelayError) {
        let queue = self.shared.fence.lock().expect("lock poisoned").queue.clone();
        match queue {
            Some(queue) => {
                queue.push(Task::Fault(err));
            }
            None => log::debug!("Encoder fault after shutdown ignored: {}", err),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.lock().expect("lock poisoned").clone()
    }

    /// Number of tasks waiting for the worker
    pub fn pending_tasks(&self) -> usize {
        self.shared
            .fence
            .lock()
            .expect("lock poisoned")
            .queue
            .as_ref()
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Wait for the worker thread to exit after `stop`.
    pub fn await_shutdown(&self, timeout: Duration) -> Result<()> {
        let mut handle = self.worker.lock().expect("lock poisoned").take();
        let start = Instant::now();
        loop {
            let finished = handle.as_ref().map_or(true, |h| h.is_finished());
            if finished {
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
                return Ok(());
            }
            if start.elapsed() >= timeout {
                *self.worker.lock().expect("lock poisoned") = handle.take();
                return Err(RelayError::WorkerUnavailable(format!(
                    "worker still running after {:?}",
                    timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockGpu, RecordingTransport, ScriptedEncoderFactory};
    use crate::types::IDENTITY_TRANSFORM;

    fn coordinator() -> PipelineCoordinator {
        PipelineCoordinator::new(
            RelayConfig::default(),
            Box::new(MockGpu::new()),
            Arc::new(ScriptedEncoderFactory::new()),
            Arc::new(RecordingTransport::new()),
        )
        .unwrap()
    }

    fn encoder_config() -> EncoderConfig {
        EncoderConfig::new("127.0.0.1", 320, 240, 500_000, GpuContextHandle(1))
    }

    #[test]
    fn test_calls_before_start_are_noops() {
        let coordinator = coordinator();
        coordinator.on_frame_ready(&Frame::new(1, 10, IDENTITY_TRANSFORM));
        coordinator.set_encoder_texture_id(3);
        coordinator.update_shared_context(GpuContextHandle(2));
        coordinator.stop();

        assert!(!coordinator.is_active());
        assert_eq!(coordinator.state(), SessionState::Idle);
        assert_eq!(coordinator.stats().frames_submitted, 0);
        assert_eq!(coordinator.pending_tasks(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RelayConfig::default();
        config.transport.audio_port = config.transport.video_port;
        let result = PipelineCoordinator::new(
            config,
            Box::new(MockGpu::new()),
            Arc::new(ScriptedEncoderFactory::new()),
            Arc::new(RecordingTransport::new()),
        );
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_start_stop_cycle() {
        let coordinator = coordinator();
        let mut events = coordinator.subscribe();

        coordinator.start(encoder_config()).unwrap();
        assert!(coordinator.is_active());

        coordinator.stop();
        coordinator.await_shutdown(Duration::from_secs(5)).unwrap();
        assert!(!coordinator.is_active());
        assert_eq!(coordinator.state(), SessionState::Idle);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(PipelineEvent::SessionStarting { .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, PipelineEvent::SessionStopped { .. })));

        // A fresh session may start once teardown has completed
        coordinator.start(encoder_config()).unwrap();
        coordinator.stop();
        coordinator.await_shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_switch_camera_recorded() {
        let coordinator = coordinator();
        coordinator.switch_camera(CameraFacing::Front, 2);
        assert_eq!(
            coordinator.shared.orientation(),
            Orientation {
                facing: CameraFacing::Front,
                mode: 2
            }
        );
    }
}
