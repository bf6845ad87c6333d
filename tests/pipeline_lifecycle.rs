//! End-to-end lifecycle tests for the pipeline coordinator, run against the
//! in-process GPU, encoder and transport doubles.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camrelay::mux::adts::frame_length;
use camrelay::testing::{
    synthetic_frame, GpuCall, GpuProbe, MockGpu, RecordingTransport, ScriptedEncoderFactory,
    SYNTHETIC_PARAMETER_SETS,
};
use camrelay::types::IDENTITY_TRANSFORM;
use camrelay::{
    EncoderConfig, Frame, GpuContextHandle, PipelineCoordinator, PipelineEvent, RelayConfig,
    RelayError, SessionState, StreamId,
};
use tokio::sync::broadcast::Receiver;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    coordinator: PipelineCoordinator,
    gpu: Arc<Mutex<GpuProbe>>,
    encoders: Arc<ScriptedEncoderFactory>,
    transport: RecordingTransport,
}

fn harness_with(config: RelayConfig, encoders: ScriptedEncoderFactory) -> Harness {
    let gpu = MockGpu::new();
    let gpu_probe = gpu.probe();
    let encoders = Arc::new(encoders);
    let transport = RecordingTransport::new();
    let coordinator = PipelineCoordinator::new(
        config,
        Box::new(gpu),
        encoders.clone(),
        Arc::new(transport.clone()),
    )
    .unwrap();
    Harness {
        coordinator,
        gpu: gpu_probe,
        encoders,
        transport,
    }
}

fn harness() -> Harness {
    harness_with(RelayConfig::default(), ScriptedEncoderFactory::new())
}

fn encoder_config() -> EncoderConfig {
    EncoderConfig::new("192.0.2.10", 640, 360, 1_000_000, GpuContextHandle(1))
}

fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn wait_for_event<F: Fn(&PipelineEvent) -> bool>(
    events: &mut Receiver<PipelineEvent>,
    pred: F,
) -> Option<PipelineEvent> {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        match events.try_recv() {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    None
}

fn start_active(h: &Harness) {
    h.coordinator.start(encoder_config()).unwrap();
    assert!(wait_until(|| h.coordinator.state() == SessionState::Active));
}

fn shutdown(h: &Harness) {
    h.coordinator.stop();
    h.coordinator.await_shutdown(TIMEOUT).unwrap();
}

#[test]
fn zero_timestamp_frames_are_discarded() {
    let h = harness();
    start_active(&h);

    for _ in 0..10 {
        h.coordinator
            .on_frame_ready(&Frame::new(1, 0, IDENTITY_TRANSFORM));
    }
    assert_eq!(h.coordinator.pending_tasks(), 0);
    std::thread::sleep(Duration::from_millis(50));

    let stats = h.coordinator.stats();
    assert_eq!(stats.frames_submitted, 0);
    assert_eq!(stats.frames_dropped, 10);
    assert_eq!(stats.frames_rendered, 0);
    assert!(h.transport.sends().is_empty());
    assert!(h.gpu.lock().unwrap().presented_timestamps().is_empty());

    shutdown(&h);
}

#[test]
fn second_start_is_rejected() {
    let h = harness();
    start_active(&h);

    assert_eq!(
        h.coordinator.start(encoder_config()),
        Err(RelayError::AlreadyActive)
    );
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(h.encoders.probes().len(), 1);
    assert_eq!(h.transport.log().lock().unwrap().sessions_created, 1);
    assert_eq!(h.gpu.lock().unwrap().contexts_created, 1);
    assert_eq!(h.coordinator.state(), SessionState::Active);

    shutdown(&h);
}

#[test]
fn frames_flow_to_transport() {
    let h = harness();
    h.coordinator.start(encoder_config()).unwrap();
    h.coordinator.set_encoder_texture_id(7);

    let frames: Vec<Frame> = (0..5).map(|i| synthetic_frame(i, 30)).collect();
    for frame in &frames {
        h.coordinator.on_frame_ready(frame);
    }

    // parameter sets + keyframe + four deltas
    assert!(wait_until(|| h.transport.sends_on(StreamId::Video).len() >= 6));
    let video = h.transport.sends_on(StreamId::Video);
    assert_eq!(video[0], SYNTHETIC_PARAMETER_SETS.to_vec());
    assert_eq!(&video[1][..5], &[0, 0, 0, 1, 0x65]);
    assert!(video[2..].iter().all(|p| p[4] == 0x41));

    {
        let gpu = h.gpu.lock().unwrap();
        assert!(gpu.drawn_textures().iter().all(|&t| t == 7));
        let expected: Vec<i64> = frames.iter().map(|f| f.timestamp_ns).collect();
        assert_eq!(gpu.presented_timestamps(), expected);
    }

    let stats = h.coordinator.stats();
    assert_eq!(stats.frames_submitted, 5);
    assert_eq!(stats.frames_rendered, 5);
    assert_eq!(stats.video_units, 5);
    assert_eq!(stats.parameter_set_resends, 1);
    assert_eq!(stats.last_frame_pts_us, Some(frames[4].timestamp_ns / 1_000));

    shutdown(&h);
    let log = h.transport.log();
    let log = log.lock().unwrap();
    assert_eq!(log.sessions_destroyed, 1);
    assert_eq!(log.destinations, vec!["192.0.2.10".to_string()]);
}

#[test]
fn parameter_sets_repeat_every_gop() {
    let h = harness_with(RelayConfig::default(), ScriptedEncoderFactory::new().with_gop(3));
    start_active(&h);

    for i in 0..7 {
        h.coordinator.on_frame_ready(&synthetic_frame(i, 30));
    }
    // keyframes at 0, 3 and 6, each preceded by the parameter sets
    assert!(wait_until(|| h.transport.sends_on(StreamId::Video).len() >= 10));

    let video = h.transport.sends_on(StreamId::Video);
    let ps = SYNTHETIC_PARAMETER_SETS.to_vec();
    for (i, payload) in video.iter().enumerate() {
        if payload.len() > 4 && payload[4] == 0x65 {
            assert_eq!(video[i - 1], ps);
        }
    }
    assert_eq!(video.iter().filter(|p| **p == ps).count(), 3);

    shutdown(&h);
}

#[test]
fn stop_returns_before_teardown_completes() {
    let h = harness();
    h.gpu.lock().unwrap().release_delay = Some(Duration::from_millis(300));
    start_active(&h);
    for i in 0..3 {
        h.coordinator.on_frame_ready(&synthetic_frame(i, 30));
    }

    let begin = Instant::now();
    h.coordinator.stop();
    let stop_elapsed = begin.elapsed();

    assert!(stop_elapsed < Duration::from_millis(150), "stop took {:?}", stop_elapsed);
    assert_eq!(h.gpu.lock().unwrap().contexts_released, 0);

    h.coordinator.await_shutdown(TIMEOUT).unwrap();
    assert!(begin.elapsed() >= Duration::from_millis(300));
    assert_eq!(h.gpu.lock().unwrap().contexts_released, 1);
    assert!(!h.coordinator.is_active());
}

#[test]
fn stop_purges_frame_backlog() {
    let h = harness();
    h.gpu.lock().unwrap().release_delay = Some(Duration::from_millis(50));
    start_active(&h);

    for i in 0..500 {
        h.coordinator.on_frame_ready(&synthetic_frame(i, 30));
    }
    h.coordinator.stop();
    assert_eq!(h.coordinator.pending_tasks(), 0);
    h.coordinator.await_shutdown(TIMEOUT).unwrap();

    let stats = h.coordinator.stats();
    assert_eq!(stats.frames_rendered + stats.frames_dropped, 500);
}

#[test]
fn concurrent_stop_and_fault_release_once() {
    let h = harness_with(RelayConfig::default(), ScriptedEncoderFactory::new().fail_after(3));
    start_active(&h);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..20 {
                h.coordinator.on_frame_ready(&synthetic_frame(i, 30));
            }
        });
        scope.spawn(|| {
            h.coordinator
                .report_encoder_fault(RelayError::Encoder("codec reset".to_string()));
        });
        scope.spawn(|| h.coordinator.stop());
    });
    h.coordinator.await_shutdown(TIMEOUT).unwrap();

    let gpu = h.gpu.lock().unwrap();
    assert_eq!(gpu.contexts_created, 1);
    assert_eq!(gpu.contexts_released, 1);
    assert_eq!(gpu.surfaces_released, 1);
    assert_eq!(gpu.double_releases, 0);

    let probes = h.encoders.probes();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].lock().unwrap().releases, 1);
    assert_eq!(h.transport.log().lock().unwrap().sessions_destroyed, 1);
    assert!(!h.coordinator.is_active());
    assert_eq!(h.coordinator.state(), SessionState::Idle);
}

#[test]
fn encoder_fault_tears_down_session() {
    let h = harness_with(RelayConfig::default(), ScriptedEncoderFactory::new().fail_after(2));
    let mut events = h.coordinator.subscribe();
    start_active(&h);

    for i in 0..5 {
        h.coordinator.on_frame_ready(&synthetic_frame(i, 30));
    }

    let fatal = wait_for_event(&mut events, |e| matches!(e, PipelineEvent::Fatal(_)));
    assert!(matches!(fatal, Some(PipelineEvent::Fatal(RelayError::Encoder(_)))));

    h.coordinator.await_shutdown(TIMEOUT).unwrap();
    assert!(!h.coordinator.is_active());
    assert_eq!(h.gpu.lock().unwrap().live_contexts(), 0);
    assert_eq!(h.encoders.probes()[0].lock().unwrap().releases, 1);

    // Frames after the fault go nowhere
    h.coordinator.on_frame_ready(&synthetic_frame(9, 30));
    assert_eq!(h.coordinator.pending_tasks(), 0);

    // A fresh start is allowed
    start_active(&h);
    shutdown(&h);
}

#[test]
fn setup_failure_is_fatal() {
    let h = harness_with(RelayConfig::default(), ScriptedEncoderFactory::new().fail_creation());
    let mut events = h.coordinator.subscribe();

    h.coordinator.start(encoder_config()).unwrap();
    let fatal = wait_for_event(&mut events, |e| matches!(e, PipelineEvent::Fatal(_)));
    assert!(matches!(fatal, Some(PipelineEvent::Fatal(RelayError::Setup(_)))));

    h.coordinator.await_shutdown(TIMEOUT).unwrap();
    assert!(!h.coordinator.is_active());
    assert_eq!(h.coordinator.state(), SessionState::Idle);

    let log = h.transport.log();
    let log = log.lock().unwrap();
    assert_eq!(log.sessions_created, 1);
    assert_eq!(log.sessions_destroyed, 1);
    assert_eq!(h.gpu.lock().unwrap().contexts_created, 0);
}

#[test]
fn transport_errors_keep_session_running() {
    let h = harness();
    let mut events = h.coordinator.subscribe();
    start_active(&h);

    h.transport.fail_sends(true);
    h.coordinator.on_frame_ready(&synthetic_frame(0, 30));
    assert!(wait_for_event(&mut events, |e| matches!(e, PipelineEvent::TransportError(_))).is_some());
    assert_eq!(h.coordinator.state(), SessionState::Active);

    h.transport.fail_sends(false);
    h.coordinator.on_frame_ready(&synthetic_frame(1, 30));
    assert!(wait_until(|| !h.transport.sends().is_empty()));
    assert!(h.coordinator.stats().transport_errors >= 1);

    shutdown(&h);
}

#[test]
fn shared_context_update_rebinds_surface() {
    let h = harness();
    start_active(&h);

    h.coordinator.on_frame_ready(&synthetic_frame(0, 30));
    h.coordinator.update_shared_context(GpuContextHandle(2));
    h.coordinator.on_frame_ready(&synthetic_frame(1, 30));
    assert!(wait_until(|| h.coordinator.stats().frames_rendered == 2));

    {
        let gpu = h.gpu.lock().unwrap();
        assert_eq!(gpu.contexts_created, 2);
        assert_eq!(gpu.contexts_released, 1);
        assert_eq!(gpu.live_contexts(), 1);

        let released = gpu
            .calls
            .iter()
            .position(|c| matches!(c, GpuCall::ReleaseContext(_)))
            .unwrap();
        let recreated = gpu
            .calls
            .iter()
            .position(|c| matches!(c, GpuCall::CreateContext(GpuContextHandle(2))))
            .unwrap();
        let second_frame = gpu
            .calls
            .iter()
            .rposition(|c| matches!(c, GpuCall::Swap { .. }))
            .unwrap();
        assert!(released < recreated);
        assert!(recreated < second_frame);
    }

    shutdown(&h);
    assert_eq!(h.gpu.lock().unwrap().live_contexts(), 0);
}

#[test]
fn front_camera_is_mirrored_after_switch() {
    let h = harness();
    h.coordinator
        .switch_camera(camrelay::CameraFacing::Front, 0);
    start_active(&h);

    h.coordinator.on_frame_ready(&synthetic_frame(0, 30));
    assert!(wait_until(|| h.coordinator.stats().frames_rendered == 1));
    assert!(h
        .gpu
        .lock()
        .unwrap()
        .calls
        .iter()
        .any(|c| matches!(c, GpuCall::Draw { mirrored: true, .. })));

    shutdown(&h);
}

fn is_keyframe(payload: &[u8]) -> bool {
    payload.len() > 4 && payload[4] == 0x65
}

fn audio_video_harness() -> Harness {
    let mut config = RelayConfig::default();
    config.audio.enabled = true;
    harness_with(config, ScriptedEncoderFactory::new().with_audio().with_gop(5))
}

#[test]
fn audio_track_gets_adts_frames() {
    let h = audio_video_harness();
    start_active(&h);

    for i in 0..12 {
        h.coordinator.on_frame_ready(&synthetic_frame(i, 30));
    }
    assert!(wait_until(|| !h.transport.sends_on(StreamId::Audio).is_empty()));
    // keyframes at 5 and 10 go out after both tracks are ready
    assert!(wait_until(|| {
        h.transport
            .sends_on(StreamId::Video)
            .iter()
            .filter(|p| is_keyframe(p))
            .count()
            >= 2
    }));

    for packet in h.transport.sends_on(StreamId::Audio) {
        assert_eq!(&packet[..2], &[0xFF, 0xF9]);
        assert_eq!(frame_length(&packet), Some(packet.len()));
    }

    // The parameter sets arrive while the audio track is still warming up
    // and must still precede every keyframe.
    let video = h.transport.sends_on(StreamId::Video);
    let ps = SYNTHETIC_PARAMETER_SETS.to_vec();
    for (i, payload) in video.iter().enumerate() {
        if is_keyframe(payload) {
            assert!(i > 0, "keyframe sent first");
            assert_eq!(video[i - 1], ps);
        }
    }
    assert!(h.coordinator.stats().parameter_set_resends >= 2);

    shutdown(&h);
    let probes = h.encoders.probes();
    assert_eq!(probes.len(), 2);
    assert!(probes.iter().all(|p| p.lock().unwrap().releases == 1));
}

#[test]
fn failing_video_stream_does_not_starve_audio() {
    let h = audio_video_harness();
    let mut events = h.coordinator.subscribe();
    start_active(&h);
    h.transport.fail_sends_on(StreamId::Video, true);

    for i in 0..30 {
        h.coordinator.on_frame_ready(&synthetic_frame(i, 30));
    }
    assert!(wait_for_event(&mut events, |e| matches!(e, PipelineEvent::TransportError(_))).is_some());
    assert!(wait_until(|| h.transport.sends_on(StreamId::Audio).len() >= 3));
    assert!(wait_until(|| h.coordinator.stats().frames_rendered == 30));

    assert!(h.transport.sends_on(StreamId::Video).is_empty());
    assert_eq!(h.coordinator.state(), SessionState::Active);

    shutdown(&h);
}

#[test]
fn dropping_coordinator_releases_resources() {
    let h = harness();
    start_active(&h);
    h.coordinator.on_frame_ready(&synthetic_frame(0, 30));

    let Harness {
        coordinator,
        gpu,
        encoders,
        transport,
    } = h;
    drop(coordinator);

    assert!(wait_until(|| gpu.lock().unwrap().live_contexts() == 0));
    assert!(wait_until(|| transport.log().lock().unwrap().sessions_destroyed == 1));
    assert!(wait_until(|| encoders.probes()[0].lock().unwrap().releases == 1));
}
