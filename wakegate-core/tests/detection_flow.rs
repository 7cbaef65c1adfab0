use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use wakegate_core::audio::DeviceId;
use wakegate_core::dispatch::DetectionPayloadWriter;
use wakegate_core::session::SecondStageThreshold;
use wakegate_core::sim::{JsonModelLib, LoopbackBackend, LoopbackCapture};
use wakegate_core::verifier::energy::EnergyModel;
use wakegate_core::verifier::EnergyVerifierFactory;
use wakegate_core::{
    ModelLibHandle, ModuleType, Platform, PlatformConfig, RecognitionConfig, RecognitionEvent,
    RecognitionStatus, SessionState, SessionStatusEvent, SoundModel, SoundTriggerSession,
    VerifierKind,
};

/// One second of 16 kHz mono PCM.
const FTRT_BYTES: usize = 32_000;

fn recv_event_with_timeout(
    rx: &mut broadcast::Receiver<RecognitionEvent>,
    timeout: Duration,
) -> RecognitionEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for recognition event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("recognition channel closed unexpectedly"),
        }
    }
}

fn assert_no_event_for(rx: &mut broadcast::Receiver<RecognitionEvent>, window: Duration) {
    let start = Instant::now();
    while start.elapsed() < window {
        match rx.try_recv() {
            Ok(ev) => panic!("unexpected recognition event: {ev:?}"),
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("recognition channel failed: {e}"),
        }
    }
}

fn wait_for_transition(
    rx: &mut broadcast::Receiver<SessionStatusEvent>,
    from: SessionState,
    to: SessionState,
) {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) if ev.from == from && ev.to == to => return,
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= Duration::from_secs(3) {
                    panic!("no {from:?} -> {to:?} transition");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Closed) => panic!("status channel closed unexpectedly"),
        }
    }
}

fn wait_for_state(session: &SoundTriggerSession, state: SessionState) {
    let start = Instant::now();
    while session.state() != state {
        if start.elapsed() >= Duration::from_secs(3) {
            panic!("session stuck in {:?}, expected {:?}", session.state(), state);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn platform(notify_second_stage_failure: bool) -> (Platform, Arc<LoopbackBackend>) {
    let backend = Arc::new(LoopbackBackend::new());
    let config = PlatformConfig {
        notify_second_stage_failure,
        deferred_stop_delay_ms: 100,
        ..PlatformConfig::default()
    };
    let platform = Platform::new(
        config,
        backend.clone(),
        ModelLibHandle::new(JsonModelLib),
        Arc::new(EnergyVerifierFactory),
    );
    (platform, backend)
}

fn keyword_model(keyphrase: &str) -> SoundModel {
    SoundModel::new(ModuleType::Gmm, JsonModelLib::encode(&[keyphrase], &[], &[]))
}

fn start_session(
    platform: &Platform,
    model: SoundModel,
    config: RecognitionConfig,
) -> SoundTriggerSession {
    let session = platform.open_session().expect("open session");
    session.load_sound_model(model).expect("load model");
    session.send_recognition_config(config).expect("send config");
    session.start_recognition().expect("start recognition");
    assert_eq!(session.state(), SessionState::Active);
    session
}

/// Keyword at 1.0-1.3 s, notified at 1.5 s with 1 s of FTRT audio: the
/// keyword sits at 0.5-0.8 s into the buffered data.
fn detection(levels: &[u32]) -> Vec<u8> {
    DetectionPayloadWriter::new()
        .confidence_levels(levels)
        .keyword_position(1_000_000, 1_300_000)
        .timestamp(1_500_000)
        .ftrt(1_000_000)
        .build(0)
}

fn gmm_capture(backend: &LoopbackBackend) -> Arc<LoopbackCapture> {
    backend.capture(ModuleType::Gmm).expect("gmm capture session")
}

fn tone(bytes: usize) -> Vec<u8> {
    (0..bytes / 2)
        .flat_map(|i| {
            let t = i as f32 / 16_000.0;
            (((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16).to_le_bytes()
        })
        .collect()
}

#[test]
fn captured_keyword_is_readable_with_its_window() {
    let (platform, backend) = platform(false);
    let session = start_session(
        &platform,
        keyword_model("hey"),
        RecognitionConfig {
            capture_requested: true,
            ..RecognitionConfig::with_conf_levels(&[60])
        },
    );
    let mut rx = session.subscribe_recognition();

    let audio: Vec<u8> = (0..FTRT_BYTES).map(|i| (i % 251) as u8).collect();
    let capture = gmm_capture(&backend);
    capture.push_audio(&audio);
    capture.inject_detection(&detection(&[80]));

    let event = recv_event_with_timeout(&mut rx, Duration::from_secs(2));
    assert_eq!(event.status, RecognitionStatus::Success);
    assert!(event.capture_available);
    assert_eq!((event.kw_start_index, event.kw_end_index), (16_000, 25_600));
    assert_eq!(event.confidence_levels, vec![80]);
    assert_eq!(event.timestamp_us, 1_500_000);
    assert_eq!(session.state(), SessionState::Buffering);

    let mut buf = vec![0u8; FTRT_BYTES];
    let n = session.read(&mut buf).expect("read buffered audio");
    assert_eq!(n, FTRT_BYTES);
    assert_eq!(buf, audio);

    session.stop_buffering().expect("stop buffering");
    wait_for_state(&session, SessionState::Loaded);
    assert!(!backend.device(DeviceId(1)).expect("device").is_open());
}

#[test]
fn merged_detection_reaches_only_the_owning_session() {
    let (platform, backend) = platform(false);
    let alpha = start_session(
        &platform,
        keyword_model("alpha"),
        RecognitionConfig::with_conf_levels(&[60]),
    );
    let bravo = start_session(
        &platform,
        keyword_model("bravo"),
        RecognitionConfig::with_conf_levels(&[70]),
    );
    assert_eq!(backend.sessions_created(), 1);
    let engine = platform.registry().get(ModuleType::Gmm).expect("shared engine");
    assert_eq!(engine.composite_conf_levels(), vec![60, 70]);

    let mut alpha_rx = alpha.subscribe_recognition();
    let mut bravo_rx = bravo.subscribe_recognition();
    gmm_capture(&backend).inject_detection(&detection(&[0, 85]));

    let event = recv_event_with_timeout(&mut bravo_rx, Duration::from_secs(2));
    assert_eq!(event.session, bravo.id());
    assert_eq!(event.confidence_levels, vec![85]);
    assert_no_event_for(&mut alpha_rx, Duration::from_millis(100));
    assert_eq!(alpha.state(), SessionState::Active);

    // Stopping one session disables its slots and leaves the other running.
    bravo.start_recognition().expect("restart bravo");
    alpha.stop_recognition().expect("stop alpha");
    assert_eq!(engine.composite_conf_levels(), vec![100, 70]);
    assert_eq!(bravo.state(), SessionState::Active);
    assert!(gmm_capture(&backend).is_started());
}

#[test]
fn detection_for_a_stopped_session_is_not_routed() {
    let (platform, backend) = platform(false);
    let alpha = start_session(
        &platform,
        keyword_model("alpha"),
        RecognitionConfig::with_conf_levels(&[60]),
    );
    let bravo = start_session(
        &platform,
        keyword_model("bravo"),
        RecognitionConfig::with_conf_levels(&[70]),
    );
    let mut alpha_rx = alpha.subscribe_recognition();
    let mut bravo_rx = bravo.subscribe_recognition();
    alpha.stop_recognition().expect("stop alpha");

    let engine = platform.registry().get(ModuleType::Gmm).expect("shared engine");
    let ignored_before = engine.diagnostics_snapshot().ignored_callbacks;
    gmm_capture(&backend).inject_detection(&detection(&[85, 0]));

    assert_no_event_for(&mut alpha_rx, Duration::from_millis(100));
    assert_no_event_for(&mut bravo_rx, Duration::from_millis(20));
    assert_eq!(engine.diagnostics_snapshot().ignored_callbacks, ignored_before + 1);
    assert_eq!(alpha.state(), SessionState::Loaded);
}

#[test]
fn stop_racing_a_detection_always_lands_in_loaded() {
    let (platform, backend) = platform(false);
    let session = platform.open_session().expect("open session");
    session.load_sound_model(keyword_model("hey")).expect("load");
    session
        .send_recognition_config(RecognitionConfig {
            capture_requested: true,
            ..RecognitionConfig::with_conf_levels(&[60])
        })
        .expect("config");

    let mut rx = session.subscribe_recognition();
    for _ in 0..20 {
        session.start_recognition().expect("start");
        gmm_capture(&backend).inject_detection(&detection(&[80]));
        session.stop_recognition().expect("stop");
        assert_eq!(session.state(), SessionState::Loaded);
        // Events are published under the session lock, so anything sent
        // before the stop returned is already queued.
        while rx.try_recv().is_ok() {}
        assert_no_event_for(&mut rx, Duration::from_millis(30));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(session.state(), SessionState::Loaded);
    assert!(!gmm_capture(&backend).is_started());
}

#[test]
fn recognition_resumes_after_subsystem_restart() {
    let (platform, backend) = platform(false);
    let session = start_session(
        &platform,
        keyword_model("hey"),
        RecognitionConfig::with_conf_levels(&[60]),
    );
    let mut rx = session.subscribe_recognition();
    let before = gmm_capture(&backend);

    backend.set_offline(true);
    platform.ssr_offline();
    assert_eq!(session.state(), SessionState::Ssr);
    assert!(platform.registry().is_empty());

    backend.set_offline(false);
    platform.ssr_online();
    assert_eq!(session.state(), SessionState::Active);
    let after = gmm_capture(&backend);
    assert!(!Arc::ptr_eq(&before, &after));

    after.inject_detection(&detection(&[80]));
    let event = recv_event_with_timeout(&mut rx, Duration::from_secs(2));
    assert_eq!(event.status, RecognitionStatus::Success);
}

#[test]
fn detection_without_follow_up_is_stopped_after_the_delay() {
    let (platform, backend) = platform(false);
    let session = start_session(
        &platform,
        keyword_model("hey"),
        RecognitionConfig::with_conf_levels(&[60]),
    );
    let mut rx = session.subscribe_recognition();
    gmm_capture(&backend).inject_detection(&detection(&[80]));

    let event = recv_event_with_timeout(&mut rx, Duration::from_secs(2));
    assert!(!event.capture_available);
    wait_for_state(&session, SessionState::Loaded);
    assert!(!gmm_capture(&backend).is_started());

    // The client can start again from Loaded.
    session.start_recognition().expect("start again");
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn keyword_verifier_confirms_before_the_client_hears() {
    let (platform, backend) = platform(false);
    let model = keyword_model("hey").with_verifier(VerifierKind::Keyword, EnergyModel::default().encode());
    let session = start_session(
        &platform,
        model,
        RecognitionConfig {
            second_stage_thresholds: vec![SecondStageThreshold {
                kind: VerifierKind::Keyword,
                threshold: 50,
            }],
            ..RecognitionConfig::with_conf_levels(&[60])
        },
    );
    let mut rx = session.subscribe_recognition();

    let capture = gmm_capture(&backend);
    capture.push_audio(&tone(FTRT_BYTES));
    capture.inject_detection(&detection(&[80]));

    let event = recv_event_with_timeout(&mut rx, Duration::from_secs(3));
    assert_eq!(event.status, RecognitionStatus::Success);
    assert!(!event.capture_available);
    assert_eq!(event.second_stage.len(), 1);
    assert_eq!(event.second_stage[0].kind, VerifierKind::Keyword);
    assert!(event.second_stage[0].detected);
    assert!(event.second_stage[0].confidence >= 50);
    assert!(matches!(
        session.state(),
        SessionState::Detected | SessionState::Loaded
    ));
}

#[test]
fn verifier_rejection_is_delivered_when_configured() {
    let (platform, backend) = platform(true);
    let model = keyword_model("hey").with_verifier(VerifierKind::Keyword, EnergyModel::default().encode());
    let session = start_session(&platform, model, RecognitionConfig::with_conf_levels(&[60]));
    let mut rx = session.subscribe_recognition();

    // Nothing queued: the buffered keyword is silence.
    gmm_capture(&backend).inject_detection(&detection(&[80]));

    let event = recv_event_with_timeout(&mut rx, Duration::from_secs(4));
    assert_eq!(event.status, RecognitionStatus::Failure);
    assert!(!event.capture_available);
    assert!(!event.second_stage[0].detected);
    assert!(matches!(
        session.state(),
        SessionState::Detected | SessionState::Loaded
    ));
}

#[test]
fn verifier_rejection_silently_restarts_recognition() {
    let (platform, backend) = platform(false);
    let model = keyword_model("hey").with_verifier(VerifierKind::Keyword, EnergyModel::default().encode());
    let session = start_session(&platform, model, RecognitionConfig::with_conf_levels(&[60]));
    let mut rx = session.subscribe_recognition();
    let mut status = session.subscribe_status();

    gmm_capture(&backend).inject_detection(&detection(&[80]));

    wait_for_transition(&mut status, SessionState::Active, SessionState::Buffering);
    wait_for_transition(&mut status, SessionState::Buffering, SessionState::Active);
    assert_no_event_for(&mut rx, Duration::from_millis(100));
    let diagnostics = session.first_stage_diagnostics().expect("attached engine");
    assert!(diagnostics.restarts >= 1);
}
