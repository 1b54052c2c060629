//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::fs::{self, File};
use std::path::PathBuf;

use storyflow_core::{
    geometry::Rect,
    hashing::sequence_digest,
    instruction::parse_sequence,
    BackendCall, DryRunBackend, EngineError, EngineSettings, InstructionKind, MacroTable, MacroTables,
    PipelineError, PipelineRun, Program, Recovery, RunError, RunOutcome, RunReport, StoryflowPipeline,
};

fn settings() -> EngineSettings {
    EngineSettings {
        wildcard_seed: Some(7),
        ..EngineSettings::default()
    }
}

fn pipeline() -> StoryflowPipeline {
    StoryflowPipeline::new(MacroTables::default(), settings())
}

fn run(text: &str, backend: &mut DryRunBackend) -> RunReport {
    pipeline().run(text, backend).unwrap()
}

fn saved_paths(backend: &DryRunBackend) -> Vec<PathBuf> {
    backend
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::SaveImage { path, .. } => Some(path.clone()),
            _ => None,
        })
        .collect()
}

fn loaded_paths(backend: &DryRunBackend) -> Vec<PathBuf> {
    backend
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::LoadImage { path } => Some(path.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn invariant_run_refuses_invalid_sequence() {
    // Nothing reaches the backend when preflight fails
    let mut backend = DryRunBackend::new("/pics");
    let result = pipeline().run(r#"[{"prompt": 5}, {"canvasSave": "out.jpg"}]"#, &mut backend);

    match result {
        Err(PipelineError::ValidationFailed(message)) => {
            assert!(message.contains("Item 0"));
            assert!(message.contains("Item 1"));
        }
        other => panic!("expected ValidationFailed, got {:?}", other),
    }
    assert!(backend.calls().is_empty());
}

#[test]
fn invariant_broken_json_is_refused() {
    let mut backend = DryRunBackend::new("/pics");
    let result = pipeline().run(r#"[{"prompt": "a"}"#, &mut backend);
    assert!(matches!(result, Err(PipelineError::ValidationFailed(_))));
    assert!(backend.calls().is_empty());
}

#[cfg(feature = "test-hooks")]
#[test]
fn invariant_run_calls_preflight() {
    use storyflow_core::pipeline::{get_preflight_call_count, reset_preflight_call_count};

    reset_preflight_call_count();
    let mut backend = DryRunBackend::new("/pics");
    run(r#"[{"note": "x"}]"#, &mut backend);
    assert!(get_preflight_call_count() >= 1);
}

#[test]
fn invariant_loop_runs_body_count_times() {
    let mut backend = DryRunBackend::new("/pics");
    let report = run(
        r#"[{"loop": {"loop": 3}}, {"prompt": "frame"}, {"loopEnd": true}, {"prompt": "after"}]"#,
        &mut backend,
    );

    assert_eq!(report.summary.renders, 4);
    assert_eq!(backend.renders().len(), 4);
    assert_eq!(report.summary.outcome, RunOutcome::Completed);
    // frame is gone once the loop finishes
    assert_eq!(report.summary.state.loop_frame, None);
}

#[test]
fn invariant_zero_count_loop_runs_once() {
    let mut backend = DryRunBackend::new("/pics");
    let report = run(r#"[{"loop": {"loop": 0}}, {"prompt": "once"}, {"loopEnd": true}]"#, &mut backend);
    assert_eq!(report.summary.renders, 1);
}

#[test]
fn invariant_nested_loop_is_ignored() {
    let mut backend = DryRunBackend::new("/pics");
    let report = run(
        r#"[{"loop": {"loop": 2}}, {"loop": {"loop": 5}}, {"prompt": "a"}, {"loopEnd": true}]"#,
        &mut backend,
    );
    assert_eq!(report.summary.renders, 2);
}

#[test]
fn invariant_loop_save_numbers_outputs() {
    let mut backend = DryRunBackend::new("/pics");
    run(
        r#"[{"loop": {"loop": 3, "start": 1}}, {"loopSave": "out/shot.png"}, {"loopEnd": true}]"#,
        &mut backend,
    );

    assert_eq!(
        saved_paths(&backend),
        vec![
            PathBuf::from("/pics/out/shot_001.png"),
            PathBuf::from("/pics/out/shot_002.png"),
            PathBuf::from("/pics/out/shot_003.png"),
        ]
    );
}

#[test]
fn invariant_loop_ops_outside_loop_use_zero() {
    let mut backend = DryRunBackend::new("/pics").with_directory("batch", ["b.png", "a.png"]);
    run(r#"[{"loopSave": "out/x.png"}, {"loopLoad": "batch/"}]"#, &mut backend);

    assert_eq!(saved_paths(&backend), vec![PathBuf::from("/pics/out/x_000.png")]);
    assert_eq!(loaded_paths(&backend), vec![PathBuf::from("/pics/batch/a.png")]);
}

#[test]
fn invariant_loop_load_cycles_directory() {
    let mut backend = DryRunBackend::new("/pics").with_directory("batch", ["c.png", "A.png", "b.png"]);
    run(
        r#"[{"loop": {"loop": 4}}, {"loopLoad": "batch"}, {"prompt": "x"}, {"loopEnd": true}]"#,
        &mut backend,
    );

    let names: Vec<_> = loaded_paths(&backend)
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["A.png", "b.png", "c.png", "A.png"]);
}

#[test]
fn invariant_loop_add_reads_real_directory() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir(root.path().join("refs")).unwrap();
    File::create(root.path().join("refs/one.png")).unwrap();
    File::create(root.path().join("refs/two.png")).unwrap();

    let mut backend = DryRunBackend::new(root.path());
    run(
        r#"[{"loop": {"loop": 2}}, {"loopAddMB": "refs"}, {"loopEnd": true}]"#,
        &mut backend,
    );

    let added: Vec<_> = backend
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::AddToMoodboard { sources } => Some(sources[0].0.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(added.len(), 2);
    assert!(added[0].starts_with("file://") && added[0].ends_with("one.png"));
    assert!(added[1].ends_with("two.png"));
}

#[test]
fn invariant_empty_directory_is_fatal() {
    let root = tempfile::tempdir().unwrap();
    let mut backend = DryRunBackend::new(root.path());
    let result = pipeline().run(r#"[{"prompt": "a"}, {"loopLoad": "missing/"}, {"prompt": "b"}]"#, &mut backend);

    match result {
        Err(PipelineError::Run(RunError { index, kind, source })) => {
            assert_eq!(index, 1);
            assert_eq!(kind, InstructionKind::LoopLoad);
            assert!(matches!(source, EngineError::EmptyDirectory(_)));
        }
        other => panic!("expected run error, got {:?}", other),
    }
    assert_eq!(backend.renders().len(), 1);
}

#[test]
fn invariant_end_stops_execution() {
    let mut backend = DryRunBackend::new("/pics");
    let report = run(r#"[{"prompt": "a"}, {"end": true}, {"prompt": "b"}]"#, &mut backend);

    assert_eq!(report.summary.outcome, RunOutcome::Ended { index: 1 });
    assert_eq!(report.summary.renders, 1);
    assert_eq!(report.summary.instructions_executed, 2);
}

#[test]
fn invariant_mask_travels_with_render() {
    let mut backend = DryRunBackend::new("/pics");
    run(
        r#"[{"maskBkgd": true}, {"prompt": "a"}, {"maskClear": true}, {"prompt": "b"}]"#,
        &mut backend,
    );

    let renders = backend.renders();
    assert!(renders[0].mask.is_some());
    assert!(renders[1].mask.is_none());
}

#[test]
fn invariant_mask_ask_failure_yields_empty_mask() {
    let mut backend = DryRunBackend::new("/pics").with_answer("I cannot see a hat");
    let report = run(r#"[{"maskAsk": "the hat"}, {"prompt": "a"}]"#, &mut backend);

    assert_eq!(report.summary.recoveries.len(), 1);
    assert_eq!(report.summary.recoveries[0].recovery, Recovery::EmptyMask);
    assert_eq!(report.summary.recoveries[0].index, 0);
    assert!(backend.renders()[0].mask.is_some());

    let calls = backend.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        BackendCall::CreateMask { width, height, value, .. } if *width == 1024.0 && *height == 1024.0 && *value == 0.0
    )));
    assert!(!calls.iter().any(|c| matches!(c, BackendCall::FillMaskRectangle { .. })));
    assert!(calls.iter().any(|c| matches!(
        c,
        BackendCall::Answer { question, .. } if question == "get rectangle around the hat"
    )));
}

#[test]
fn invariant_mask_ask_fills_answered_rectangle() {
    let mut backend = DryRunBackend::new("/pics").with_answer("Sure: [0.25, 0.125, 0.75, 0.625]");
    let report = run(r#"[{"maskAsk": "the hat"}]"#, &mut backend);

    assert!(report.summary.recoveries.is_empty());
    let filled: Vec<_> = backend
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::FillMaskRectangle { rect, value, .. } => Some((*rect, *value)),
            _ => None,
        })
        .collect();
    assert_eq!(filled, vec![(Rect::new(256.0, 128.0, 512.0, 512.0), 1.0)]);
}

#[test]
fn invariant_face_detection_failure_resets_zoom() {
    let mut backend = DryRunBackend::new("/pics").with_face_error("face model missing");
    let report = run(r#"[{"faceZoom": true}, {"prompt": "a"}]"#, &mut backend);

    assert_eq!(report.summary.recoveries.len(), 1);
    assert_eq!(report.summary.recoveries[0].recovery, Recovery::ResetZoom);
    assert_eq!(report.summary.renders, 1);

    let view: Vec<_> = backend
        .calls()
        .iter()
        .filter(|c| matches!(c, BackendCall::SetCanvasZoom { .. } | BackendCall::MoveCanvas { .. }))
        .cloned()
        .collect();
    let pan = 1024.0 * 0.06;
    assert_eq!(
        view,
        vec![
            BackendCall::SetCanvasZoom { zoom: 1.2 },
            BackendCall::MoveCanvas { x: pan, y: pan },
        ]
    );
}

#[test]
fn invariant_face_zoom_centers_on_first_face() {
    let mut backend = DryRunBackend::new("/pics").with_faces(vec![
        Rect::new(400.0, 300.0, 100.0, 100.0),
        Rect::new(10.0, 10.0, 50.0, 50.0),
    ]);
    let report = run(r#"[{"faceZoom": true}]"#, &mut backend);

    assert!(report.summary.recoveries.is_empty());
    let zooms: Vec<_> = backend
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::SetCanvasZoom { zoom } => Some(*zoom),
            _ => None,
        })
        .collect();
    assert_eq!(zooms, vec![1.5]);
}

#[test]
fn invariant_ask_zoom_without_rectangle_resets_zoom() {
    let mut backend = DryRunBackend::new("/pics").with_answer("[0.1, 0.2]");
    let report = run(r#"[{"askZoom": "the door"}]"#, &mut backend);
    assert_eq!(report.summary.recoveries[0].recovery, Recovery::ResetZoom);
    assert_eq!(report.summary.recoveries[0].kind, InstructionKind::AskZoom);
}

#[test]
fn invariant_adapt_size_zero_box_is_fatal() {
    let mut backend = DryRunBackend::new("/pics").with_bounding_box(Rect::new(0.0, 0.0, 0.0, 0.0));
    let result = pipeline().run(
        r#"[{"adaptSize": {"maxWidth": 1664, "maxHeight": 1664}}, {"prompt": "a"}]"#,
        &mut backend,
    );

    assert!(matches!(
        result,
        Err(PipelineError::Run(RunError {
            index: 0,
            source: EngineError::EmptyBoundingBox,
            ..
        }))
    ));
    assert!(backend.renders().is_empty());
}

#[test]
fn invariant_adapt_size_clamps_to_limits() {
    let mut backend = DryRunBackend::new("/pics").with_bounding_box(Rect::new(0.0, 0.0, 2000.0, 900.0));
    let report = run(r#"[{"adaptSize": {"maxWidth": 1664, "maxHeight": 1664}}]"#, &mut backend);

    let configuration = &report.summary.state.configuration;
    assert_eq!(configuration.get("width"), Some(&json!(1664)));
    assert_eq!(configuration.get("height"), Some(&json!(900)));
    assert!(backend
        .calls()
        .contains(&BackendCall::UpdateCanvasSize { width: 1664.0, height: 900.0 }));
}

#[test]
fn invariant_backend_failure_is_fatal() {
    let mut backend = DryRunBackend::new("/pics").failing("clear_canvas");
    let result = pipeline().run(r#"[{"canvasClear": true}, {"prompt": "x"}]"#, &mut backend);

    match result {
        Err(PipelineError::Run(err)) => {
            assert_eq!(err.index, 0);
            assert_eq!(err.kind, InstructionKind::CanvasClear);
            assert!(matches!(err.source, EngineError::Backend(_)));
        }
        other => panic!("expected run error, got {:?}", other),
    }
    assert!(backend.renders().is_empty());
}

#[test]
fn invariant_unknown_kind_skipped_at_execution() {
    // Program built without preflight still runs; unknown entries are skipped in place
    let entries = parse_sequence(r#"[{"prompt": "a"}, {"sparkle": true}, {"prompt": "b"}]"#).unwrap();
    let program = Program::decode(&entries).unwrap();

    let tables = MacroTables::default();
    let settings = settings();
    let mut rng = StdRng::seed_from_u64(1);
    let mut backend = DryRunBackend::new("/pics");

    let summary = PipelineRun::new(&mut backend, &tables, &settings, &mut rng)
        .unwrap()
        .execute(&program)
        .unwrap();

    assert_eq!(summary.renders, 2);
    assert_eq!(summary.instructions_executed, 2);
}

#[test]
fn invariant_prompt_macros_resolved_per_render() {
    let tables = MacroTables {
        prompt_triggers: MacroTable::from_iter([("@keeper", "an old keeper")]),
        wildcard_shortcuts: MacroTable::from_iter([("$sky", "dawn | dusk")]),
        ..MacroTables::default()
    };
    let pipeline = StoryflowPipeline::new(tables, settings());
    let mut backend = DryRunBackend::new("/pics").with_negative_prompt("blurry");

    pipeline
        .run(
            r#"[{"prompt": "@keeper at $sky[2]"}, {"negPrompt": "@keeper twice"}, {"prompt": "plain"}]"#,
            &mut backend,
        )
        .unwrap();

    let renders = backend.renders();
    assert_eq!(renders[0].prompt, "an old keeper at dusk");
    assert_eq!(renders[0].negative_prompt, "blurry");
    assert_eq!(renders[1].negative_prompt, "an old keeper twice");
}

#[test]
fn invariant_config_shortcuts_resolved_before_merge() {
    let tables = MacroTables {
        config_shortcuts: MacroTable::from_iter([("#wan", "wan_2.1.ckpt")]),
        ..MacroTables::default()
    };
    let pipeline = StoryflowPipeline::new(tables, settings());
    let mut backend = DryRunBackend::new("/pics");

    pipeline
        .run(
            r##"[{"config": {"model": "#wan"}}, {"inpaintTools": {"refinerModel": "#wan"}}, {"prompt": "x"}]"##,
            &mut backend,
        )
        .unwrap();

    let configuration = &backend.renders()[0].configuration;
    assert_eq!(configuration.get("model"), Some(&json!("wan_2.1.ckpt")));
    assert_eq!(configuration.get("refinerModel"), Some(&json!("wan_2.1.ckpt")));
}

#[test]
fn invariant_pose_shortcuts_resolved_before_load() {
    let tables = MacroTables {
        pose_shortcuts: MacroTable::from_iter([("#armsup", "raised")]),
        ..MacroTables::default()
    };
    let pipeline = StoryflowPipeline::new(tables, settings());
    let mut backend = DryRunBackend::new("/pics");

    pipeline
        .run(r##"[{"poseJSON": {"pose": "#armsup"}}]"##, &mut backend)
        .unwrap();

    let poses: Vec<_> = backend
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::LoadPoseJson { pose } => Some(pose.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(poses, vec![json!({"pose": "raised"})]);
}

#[test]
fn invariant_preflight_catches_unusable_payloads() {
    // whatever run would refuse, preflight reports first
    let text = r#"[{"moveScale": {"position_X": 1}}, {"adaptSize": {"maxWidth": 800}}, {"moodboardRemove": -1}]"#;
    let report = pipeline().preflight(text);
    assert!(!report.valid);
    assert_eq!(report.violations.len(), 3);
    assert!(report.warnings[0].starts_with("Item 0: \"moveScale\""));

    let mut backend = DryRunBackend::new("/pics");
    let result = pipeline().run(text, &mut backend);
    assert!(matches!(result, Err(PipelineError::ValidationFailed(_))));
    assert!(backend.calls().is_empty());
}

#[test]
fn invariant_integral_float_slot_runs() {
    let text = r#"[{"moodboardRemove": 1.0}]"#;
    assert!(pipeline().preflight(text).valid);

    let mut backend = DryRunBackend::new("/pics");
    run(text, &mut backend);
    assert!(backend
        .calls()
        .iter()
        .any(|c| matches!(c, BackendCall::RemoveFromMoodboard { index: 1 })));
}

#[test]
fn invariant_fractional_loop_count_rounds_up() {
    let mut backend = DryRunBackend::new("/pics");
    let report = run(r#"[{"loop": {"loop": 2.5}}, {"prompt": "x"}, {"loopEnd": true}]"#, &mut backend);
    assert_eq!(report.summary.renders, 3);
}

#[test]
fn invariant_configuration_flows_into_render() {
    let mut backend = DryRunBackend::new("/pics");
    run(
        r#"[
            {"config": {"steps": 20, "model": "flux.ckpt"}},
            {"config": {"steps": 30}},
            {"xlMagic": {"original": 3, "target": 4, "negative": 7}},
            {"frames": 33},
            {"prompt": "x"}
        ]"#,
        &mut backend,
    );

    let configuration = &backend.renders()[0].configuration;
    assert_eq!(configuration.get("steps"), Some(&json!(30)));
    assert_eq!(configuration.get("model"), Some(&json!("flux.ckpt")));
    assert_eq!(configuration.get("targetImageWidth"), Some(&json!(1024)));
    assert_eq!(configuration.get("negativeOriginalImageHeight"), Some(&json!(1344)));
    assert_eq!(configuration.get("numFrames"), Some(&json!(33)));
}

#[test]
fn invariant_report_identifies_the_run() {
    let text = r#"[{"prompt": "a"}]"#;
    let mut backend = DryRunBackend::new("/pics");
    let first = run(text, &mut backend);
    let second = run(text, &mut backend);

    let entries = parse_sequence(text).unwrap();
    assert_eq!(first.sequence_digest, sequence_digest(&entries).unwrap());
    assert_eq!(first.sequence_digest, second.sequence_digest);
    assert_ne!(first.run_id, second.run_id);
    assert!(uuid::Uuid::parse_str(&first.run_id).is_ok());
    assert!(first.finished_at >= first.started_at);
}
