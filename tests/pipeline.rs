// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use rtsp_cascade::capability::FaceAnalysis;
use rtsp_cascade::config::CascadeConfig;
use rtsp_cascade::{ErrorKind, ModelTag, Pipeline, StatsScope};

fn kind<T>(result: rtsp_cascade::Result<T>) -> ErrorKind {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(e) => e.kind(),
    }
}

#[test]
fn frames_flow_from_decoder_to_surface() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    let (cam, decoder) = h.running_stream("cam", 1);
    let renderer = Arc::new(RecordingRenderer::default());
    h.pipeline.bind_render_surface(cam, renderer.clone()).unwrap();
    assert_eq!(decoder.url.lock().unwrap().as_deref(), Some("rtsp://10.0.0.1/cam"));

    for tag in 1..=5 {
        assert!(decoder.push(marker_raw(64, 64, 0, 0, tag)));
    }
    assert!(h.wait_delivered(cam, 5));

    let ids: Vec<u64> = renderer.keys().iter().map(|k| k.frame_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(h.pipeline.sink_counters(cam).unwrap().presented, 5);

    let admission = h.pipeline.admission_counters(cam).unwrap().unwrap();
    assert_eq!((admission.decoded, admission.submitted), (5, 5));
    let stats = h.pipeline.stats_snapshot(StatsScope::Stream(cam)).unwrap();
    assert_eq!(stats.frame_count, 5);
    let metrics = h.pipeline.dispatcher_metrics(&ModelTag::new("tiny")).unwrap();
    assert_eq!((metrics.completed, metrics.consumed), (5, 5));
    assert!(h.pipeline.stats_report(cam).unwrap().contains("cam"));
}

#[test]
fn busy_surface_skips_frames_without_stalling() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    let (cam, decoder) = h.running_stream("cam", 1);
    let renderer = Arc::new(RecordingRenderer::default());
    renderer.busy.store(true, Ordering::SeqCst);
    h.pipeline.bind_render_surface(cam, renderer.clone()).unwrap();

    for tag in 1..=3 {
        decoder.push(marker_raw(64, 64, 0, 0, tag));
    }
    assert!(h.wait_delivered(cam, 3));
    assert_eq!(h.pipeline.sink_counters(cam).unwrap().surface_unavailable, 3);
    assert!(renderer.keys().is_empty());

    renderer.busy.store(false, Ordering::SeqCst);
    h.pipeline.present_last_good(cam).unwrap();
    assert_eq!(renderer.keys()[0].frame_id, 3);

    h.pipeline.unbind_render_surface(cam).unwrap();
    decoder.push(marker_raw(64, 64, 0, 0, 4));
    assert!(h.wait_delivered(cam, 4));
    assert_eq!(h.pipeline.sink_counters(cam).unwrap().no_surface, 1);
}

#[test]
fn restart_continues_frame_numbering() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    let (cam, decoder) = h.running_stream("cam", 1);
    let renderer = Arc::new(RecordingRenderer::default());
    h.pipeline.bind_render_surface(cam, renderer.clone()).unwrap();

    decoder.push(marker_raw(64, 64, 0, 0, 1));
    decoder.push(marker_raw(64, 64, 0, 0, 2));
    assert!(h.wait_delivered(cam, 2));

    h.pipeline.stop(cam).unwrap();
    assert!(!h.pipeline.is_running(cam).unwrap());
    assert!(h.pipeline.admission_counters(cam).unwrap().is_none());
    assert_eq!(decoder.closes.load(Ordering::SeqCst), 1);
    assert!(!decoder.push(marker_raw(64, 64, 0, 0, 3)));
    // 重复停止无副作用
    h.pipeline.stop(cam).unwrap();

    h.pipeline.start(cam).unwrap();
    assert_eq!(decoder.opens.load(Ordering::SeqCst), 2);
    decoder.push(marker_raw(64, 64, 0, 0, 4));
    assert!(h.wait_delivered(cam, 3));
    assert_eq!(renderer.keys().last().map(|k| k.frame_id), Some(3));
}

#[test]
fn reset_starts_a_fresh_window() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    let (a, da) = h.running_stream("a", 1);
    let (b, db) = h.running_stream("b", 1);
    for tag in 1..=3 {
        da.push(marker_raw(64, 64, 0, 0, tag));
        db.push(marker_raw(64, 64, 0, 0, tag));
    }
    assert!(h.wait_delivered(a, 3) && h.wait_delivered(b, 3));

    let before = h.pipeline.stats_snapshot(StatsScope::Global).unwrap();
    assert_eq!(before.frame_count, 6);

    h.pipeline.reset_stats(StatsScope::Stream(a)).unwrap();
    assert!(h.pipeline.stats_snapshot(StatsScope::Stream(a)).unwrap().is_zero());
    assert_eq!(h.pipeline.stats_snapshot(StatsScope::Global).unwrap().frame_count, 3);

    h.pipeline.reset_stats(StatsScope::Global).unwrap();
    let after = h.pipeline.stats_snapshot(StatsScope::Global).unwrap();
    assert!(after.is_zero());
    assert!(after.started_at > before.started_at);
    assert!(after.started_at > before.updated_at);
}

#[test]
fn in_flight_budget_follows_running_streams() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    let (a, _) = h.running_stream("a", 3);
    assert_eq!(h.pipeline.max_inflight(a).unwrap(), 8);

    let (b, _) = h.running_stream("b", 1);
    assert_eq!(h.pipeline.max_inflight(a).unwrap(), 6);
    assert_eq!(h.pipeline.max_inflight(b).unwrap(), 2);

    h.pipeline.stop(b).unwrap();
    assert_eq!(h.pipeline.max_inflight(a).unwrap(), 8);

    h.pipeline.remove_stream(b).unwrap();
    assert_eq!(h.pipeline.stream_ids().len(), 1);
    let err = h.pipeline.start(b).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn switching_models_moves_the_stream() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    let mut spec = tiny_spec();
    spec.tag = "tiny-b".into();
    let factory = scripted_factory(&spec, Vec::new(), Arc::new(Script::default()));
    h.pipeline.register_model(spec, MODEL_BYTES, factory).unwrap();
    let (first, second) = (ModelTag::new("tiny"), ModelTag::new("tiny-b"));

    let (cam, decoder) = h.running_stream("cam", 1);
    assert_eq!(h.pipeline.stream_model(cam).unwrap(), first);
    decoder.push(marker_raw(64, 64, 0, 0, 1));
    assert!(h.wait_delivered(cam, 1));

    h.pipeline.select_model(cam, &second).unwrap();
    assert_eq!(h.pipeline.stream_model(cam).unwrap(), second);
    assert!(h.pipeline.is_running(cam).unwrap());

    decoder.push(marker_raw(64, 64, 0, 0, 2));
    assert!(h.wait_delivered(cam, 2));
    assert_eq!(h.pipeline.dispatcher_metrics(&second).unwrap().completed, 1);
    assert_eq!(h.pipeline.dispatcher_metrics(&first).unwrap().completed, 1);

    let err = h
        .pipeline
        .select_model(cam, &ModelTag::new("missing"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn decoder_open_failure_leaves_stream_stopped() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    let cam = h.pipeline.add_stream("cam", "rtsp://10.0.0.1/cam", 1).unwrap();
    let decoder = h.decoders.state("cam");
    decoder.fail_open.store(true, Ordering::SeqCst);

    let err = h.pipeline.start(cam).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotInitialized);
    assert!(!h.pipeline.is_running(cam).unwrap());

    decoder.fail_open.store(false, Ordering::SeqCst);
    h.pipeline.start(cam).unwrap();
    assert!(decoder.is_open());
}

#[test]
fn invalid_requests_are_rejected() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    assert_eq!(kind(h.pipeline.add_stream("cam", "not a url", 1)), ErrorKind::InvalidArgument);
    assert_eq!(kind(h.pipeline.add_stream("", "rtsp://h/x", 1)), ErrorKind::InvalidArgument);
    h.pipeline.add_stream("cam", "rtsp://h/x", 1).unwrap();
    assert_eq!(kind(h.pipeline.add_stream("cam", "rtsp://h/y", 1)), ErrorKind::InvalidArgument);

    let factory = scripted_factory(&tiny_spec(), Vec::new(), Arc::new(Script::default()));
    assert_eq!(
        kind(h.pipeline.register_model(tiny_spec(), MODEL_BYTES, factory)),
        ErrorKind::InvalidArgument
    );

    let faces_on = CascadeConfig {
        enable_face_analysis: true,
        ..Default::default()
    };
    assert_eq!(
        kind(h.pipeline.set_cascade_config(faces_on)),
        ErrorKind::CapabilityUnavailable
    );
    let bad_threshold = CascadeConfig {
        person_conf_threshold: 1.5,
        ..Default::default()
    };
    assert_eq!(kind(h.pipeline.set_cascade_config(bad_threshold)), ErrorKind::InvalidArgument);
    assert!(!h.pipeline.cascade_config().enable_face_analysis);
}

#[test]
fn construction_checks_capabilities_and_models() {
    let mut config = pipeline_config();
    config.cascade.enable_face_analysis = true;
    let decoders = Arc::new(ManualDecoderFactory::default());
    assert_eq!(
        kind(Pipeline::new(config.clone(), decoders, None, system_clock())),
        ErrorKind::CapabilityUnavailable
    );

    let face: Arc<dyn FaceAnalysis> = Arc::new(FlakyFaceAnalysis::new(0));
    let pipeline =
        Pipeline::new(config, Arc::new(ManualDecoderFactory::default()), Some(face), system_clock()).unwrap();
    let err = pipeline.add_stream("cam", "rtsp://h/x", 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotInitialized);
    assert!(!pipeline.model_available(&ModelTag::new("tiny")));
}

#[test]
fn shutdown_stops_everything_once() {
    let h = Harness::new(pipeline_config(), system_clock(), None);
    let (cam, decoder) = h.running_stream("cam", 1);

    h.pipeline.shutdown();
    assert!(!h.pipeline.is_running(cam).unwrap());
    assert_eq!(decoder.closes.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.pipeline.add_stream("late", "rtsp://h/late", 1).unwrap_err().kind(),
        ErrorKind::Shutdown
    );
    assert_eq!(h.pipeline.start(cam).unwrap_err().kind(), ErrorKind::Shutdown);

    h.pipeline.shutdown();
    assert_eq!(decoder.closes.load(Ordering::SeqCst), 1);
    assert!(!decoder.is_open());
}
