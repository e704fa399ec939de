use std::path::PathBuf;
use std::rc::Rc;

use approx::assert_relative_eq;
use gpu_interop::{DepthRange, HostDevice, SharedDevice};
use nnao_core::{CapturePhase, CapturedSurfaces, NnaoConfig, RecordingSink, SurfaceDesc, SurfaceFormat};
use nnao_engine::{GraphDef, GraphEncoding, NodeDef, ReferenceEngine};
use nnao_session::{
    InferenceSession, NnaoPlugin, SessionError, SessionParams, SessionState, StepOutcome,
};

struct Rig {
    host: Rc<HostDevice>,
    device: SharedDevice,
    surfaces: CapturedSurfaces,
    width: usize,
    height: usize,
    dir: tempfile::TempDir,
}

impl Rig {
    fn new(width: u32, height: u32) -> Self {
        let host = Rc::new(HostDevice::new());
        let pixels = (width * height) as usize;

        let normals: Vec<u8> = (0..pixels)
            .flat_map(|i| [(i * 10) as u8, 128, 255, 0])
            .collect();
        let depth: Vec<u8> = (0..pixels)
            .flat_map(|i| (1.0 + i as f32 * 0.25).to_le_bytes())
            .collect();

        let surfaces = CapturedSurfaces {
            normals: host.create_surface(
                SurfaceDesc::new(width, height, SurfaceFormat::Rgba8Unorm),
                normals,
            ),
            depth: host.create_surface(
                SurfaceDesc::new(width, height, SurfaceFormat::R32Float),
                depth,
            ),
            output: host.create_surface(
                SurfaceDesc::new(width, height, SurfaceFormat::Rgba8Unorm),
                Vec::new(),
            ),
        };
        let device: SharedDevice = host.clone();
        Self {
            host,
            device,
            surfaces,
            width: width as usize,
            height: height as usize,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write_graph(&self, name: &str, graph: &GraphDef, encoding: GraphEncoding) -> PathBuf {
        let path = self.dir.path().join(name);
        graph.write(&path, encoding).unwrap();
        path
    }

    fn ao_graph(&self) -> PathBuf {
        self.write_graph("ao.json", &ao_graph(), GraphEncoding::Text)
    }

    fn output_floats(&self) -> Vec<f32> {
        self.host
            .read_surface(self.surfaces.output)
            .unwrap()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn assert_released(&self) {
        assert_eq!(self.host.live_registrations(), 0, "registrations");
        assert_eq!(self.host.mapped_resources(), 0, "mappings");
        assert_eq!(self.host.live_allocations(), 0, "allocations");
        assert_eq!(self.host.live_textures(), 0, "textures");
    }

    fn deliver_frame(&self, plugin: &mut NnaoPlugin) {
        plugin.render(self.surfaces.normals);
        plugin.render(self.surfaces.depth);
        plugin.render(self.surfaces.output);
        plugin.end_frame();
    }
}

fn ao_graph() -> GraphDef {
    GraphDef::new(vec![
        NodeDef::new("input", "Placeholder"),
        NodeDef::new("normals", "InteractiveNormalsInput").input("input"),
        NodeDef::new("ao", "InteractiveOutput").input("normals"),
    ])
}

fn plugin(rig: &Rig, sink: &Rc<RecordingSink>) -> NnaoPlugin {
    NnaoPlugin::new(
        rig.device.clone(),
        Box::new(ReferenceEngine::new()),
        NnaoConfig::default(),
        sink.clone(),
    )
    .unwrap()
}

#[test]
fn three_iterations_then_automatic_teardown() {
    let rig = Rig::new(4, 4);
    let params = SessionParams::new(rig.ao_graph(), "ao", 3);
    let mut session =
        InferenceSession::start(rig.device.clone(), &rig.surfaces, &params, &ReferenceEngine::new())
            .unwrap();

    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.pitch(), 512);
    assert_eq!(rig.host.live_registrations(), 3);
    assert_eq!(rig.host.mapped_resources(), 3);
    assert_eq!(rig.host.live_textures(), 3);
    assert_eq!(rig.host.live_allocations(), 3);

    assert_eq!(session.step(&rig.surfaces).unwrap(), StepOutcome::Continue { done: 1 });
    assert_eq!(session.step(&rig.surfaces).unwrap(), StepOutcome::Continue { done: 2 });
    assert_eq!(session.step(&rig.surfaces).unwrap(), StepOutcome::Completed);

    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(session.iterations_done(), 3);
    rig.assert_released();
    assert!(matches!(session.step(&rig.surfaces), Err(SessionError::NotRunning)));

    let out = rig.output_floats();
    assert_eq!(out.len(), rig.width * rig.height);
    for (i, v) in out.iter().enumerate() {
        assert_relative_eq!(*v, (i * 10) as f32 / 255.0);
    }
}

#[test]
fn inference_failure_on_second_of_five_iterations() {
    let rig = Rig::new(4, 4);
    let params = SessionParams::new(rig.ao_graph(), "ao", 5);
    let mut session =
        InferenceSession::start(rig.device.clone(), &rig.surfaces, &params, &ReferenceEngine::new())
            .unwrap();

    // Two launches per iteration: the third is the first of iteration two.
    rig.host.fail_call("launch", 2);
    assert_eq!(session.step(&rig.surfaces).unwrap(), StepOutcome::Continue { done: 1 });
    let err = session.step(&rig.surfaces).unwrap_err();

    assert!(matches!(err, SessionError::InferenceFailed(_)), "{err}");
    assert!(err.to_string().starts_with("Internal: launch failed at "));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.iterations_done(), 1);
    rig.assert_released();
}

#[test]
fn pitch_mismatch_fails_start_and_leaks_nothing() {
    let rig = Rig::new(4, 4);
    rig.host.override_pitch(1, 1024);
    let params = SessionParams::new(rig.ao_graph(), "ao", 3);
    let err =
        InferenceSession::start(rig.device.clone(), &rig.surfaces, &params, &ReferenceEngine::new())
            .unwrap_err();

    match err {
        SessionError::LayoutMismatch {
            buffer,
            expected,
            actual,
        } => {
            assert_eq!(buffer, "depth");
            assert_eq!((expected, actual), (512, 1024));
        }
        other => panic!("unexpected {other:?}"),
    }
    rig.assert_released();
}

#[test]
fn teardown_twice_is_a_no_op() {
    let rig = Rig::new(4, 4);
    let params = SessionParams::new(rig.ao_graph(), "ao", 3);
    let mut session =
        InferenceSession::start(rig.device.clone(), &rig.surfaces, &params, &ReferenceEngine::new())
            .unwrap();

    session.teardown().unwrap();
    session.teardown().unwrap();
    assert_eq!(session.state(), SessionState::TornDown);
    rig.assert_released();

    let stats = rig.host.stats();
    assert_eq!(stats.allocs, stats.frees);
    assert_eq!(stats.registers, stats.unregisters);
    assert_eq!(stats.maps, stats.unmaps);
    assert_eq!(stats.textures_created, stats.textures_released);
}

#[test]
fn missing_graph_surfaces_engine_text() {
    let rig = Rig::new(4, 4);
    let params = SessionParams::new(rig.dir.path().join("absent.json"), "ao", 1);
    let err =
        InferenceSession::start(rig.device.clone(), &rig.surfaces, &params, &ReferenceEngine::new())
            .unwrap_err();
    match &err {
        SessionError::GraphLoadFailed(status) => assert_eq!(err.to_string(), status.to_string()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.to_string().starts_with("Not found: "));
    rig.assert_released();
}

#[test]
fn graph_with_unknown_op_fails_create() {
    let rig = Rig::new(4, 4);
    let graph = GraphDef::new(vec![
        NodeDef::new("input", "Placeholder"),
        NodeDef::new("ao", "Conv9D").input("input"),
    ]);
    let path = rig.write_graph("bad.json", &graph, GraphEncoding::Text);
    let err = InferenceSession::start(
        rig.device.clone(),
        &rig.surfaces,
        &SessionParams::new(path, "ao", 1),
        &ReferenceEngine::new(),
    )
    .unwrap_err();
    assert!(matches!(err, SessionError::GraphCreateFailed(_)));
    assert_eq!(err.error_code(), 301);
    rig.assert_released();
}

#[test]
fn device_failure_during_start_unwinds_registrations() {
    let rig = Rig::new(4, 4);
    rig.host.fail_call("map", 2);
    let err = InferenceSession::start(
        rig.device.clone(),
        &rig.surfaces,
        &SessionParams::new(rig.ao_graph(), "ao", 1),
        &ReferenceEngine::new(),
    )
    .unwrap_err();
    assert!(matches!(err, SessionError::Device(_)));
    rig.assert_released();
}

#[test]
fn zero_iterations_complete_at_start() {
    let rig = Rig::new(2, 2);
    let session = InferenceSession::start(
        rig.device.clone(),
        &rig.surfaces,
        &SessionParams::new(rig.ao_graph(), "ao", 0),
        &ReferenceEngine::new(),
    )
    .unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(rig.host.stats().launches, 0);
    rig.assert_released();
}

#[test]
fn depth_round_trips_through_the_graph() {
    let rig = Rig::new(3, 2);
    let graph = GraphDef::new(vec![
        NodeDef::new("input", "Placeholder"),
        NodeDef::new("depth", "InteractiveDepthInput").input("input"),
        NodeDef::new("out", "InteractiveDepthOutput").input("depth"),
    ]);
    let path = rig.write_graph("depth.bin", &graph, GraphEncoding::Binary);
    let params = SessionParams {
        encoding: GraphEncoding::Binary,
        depth_range: DepthRange::new(0.5, 4.0).unwrap(),
        ..SessionParams::new(path, "out", 1)
    };
    let mut session =
        InferenceSession::start(rig.device.clone(), &rig.surfaces, &params, &ReferenceEngine::new())
            .unwrap();
    assert_eq!(session.step(&rig.surfaces).unwrap(), StepOutcome::Completed);

    for (i, v) in rig.output_floats().iter().enumerate() {
        assert_relative_eq!(*v, 1.0 + i as f32 * 0.25, epsilon = 1e-5);
    }
}

#[test]
fn packed_depth_is_not_what_depth_output_reads() {
    // Packing puts depth in channel 3. The depth output rescales channel 1,
    // which carries the green normal, so every pixel comes back as the same
    // value whatever its depth.
    let rig = Rig::new(3, 2);
    let graph = GraphDef::new(vec![
        NodeDef::new("input", "Placeholder"),
        NodeDef::new("packed", "InteractiveInput").input("input"),
        NodeDef::new("out", "InteractiveDepthOutput").input("packed"),
    ]);
    let params = SessionParams {
        depth_range: DepthRange::new(0.5, 4.0).unwrap(),
        ..SessionParams::new(rig.write_graph("packed.json", &graph, GraphEncoding::Text), "out", 1)
    };
    let mut session =
        InferenceSession::start(rig.device.clone(), &rig.surfaces, &params, &ReferenceEngine::new())
            .unwrap();
    assert_eq!(session.step(&rig.surfaces).unwrap(), StepOutcome::Completed);

    let expected = 128.0 / 255.0 * 3.5 + 0.5;
    let out = rig.output_floats();
    assert_eq!(out.len(), 6);
    for v in &out {
        assert_relative_eq!(*v, expected, epsilon = 1e-5);
    }
    rig.assert_released();
}

#[test]
fn plugin_steps_once_per_completed_frame() {
    let rig = Rig::new(4, 4);
    let sink = Rc::new(RecordingSink::new());
    let mut plugin = plugin(&rig, &sink);

    rig.deliver_frame(&mut plugin);
    plugin.render(rig.surfaces.normals);
    plugin.render(rig.surfaces.depth);
    plugin.render(rig.surfaces.output);
    plugin.run("nnao", &rig.ao_graph(), "ao", 3).unwrap();
    assert_eq!(plugin.session().map(|s| s.iterations_done()), Some(0));
    plugin.end_frame();

    rig.deliver_frame(&mut plugin);
    rig.deliver_frame(&mut plugin);
    assert_eq!(plugin.session().map(|s| s.iterations_done()), Some(2));

    // Deliveries past the third in one frame do not step again.
    plugin.render(rig.surfaces.normals);
    plugin.render(rig.surfaces.depth);
    plugin.render(rig.surfaces.output);
    plugin.render(rig.surfaces.output);
    plugin.end_frame();

    assert!(plugin.session().is_none());
    assert!(sink.errors().is_empty());
    assert!(sink
        .entries()
        .iter()
        .any(|(_, message)| message == "Finished 3 iterations"));
    rig.assert_released();
}

#[test]
fn plugin_reports_failed_step_and_drops_session() {
    let rig = Rig::new(4, 4);
    let sink = Rc::new(RecordingSink::new());
    let mut plugin = plugin(&rig, &sink);

    rig.deliver_frame(&mut plugin);
    plugin.render(rig.surfaces.normals);
    plugin.render(rig.surfaces.depth);
    plugin.render(rig.surfaces.output);
    plugin.run("nnao", &rig.ao_graph(), "ao", 5).unwrap();
    plugin.end_frame();

    rig.host.fail_call("copy_pitched_to_array", 1);
    rig.deliver_frame(&mut plugin);
    rig.deliver_frame(&mut plugin);

    assert!(plugin.session().is_none());
    assert_eq!(sink.errors().len(), 1);
    assert!(sink.errors()[0].contains("copy_pitched_to_array"));
    rig.assert_released();
}

#[test]
fn run_before_capture_completes_is_not_ready() {
    let rig = Rig::new(4, 4);
    let sink = Rc::new(RecordingSink::new());
    let mut plugin = plugin(&rig, &sink);

    plugin.render(rig.surfaces.normals);
    plugin.render(rig.surfaces.depth);
    let err = plugin.run("nnao", &rig.ao_graph(), "ao", 3).unwrap_err();

    assert!(matches!(
        err,
        SessionError::SurfacesNotReady {
            phase: CapturePhase::AwaitingOutputTarget
        }
    ));
    assert_eq!(rig.host.stats().allocs, 0);
    assert_eq!(rig.host.stats().textures_created, 0);
    assert_eq!(sink.errors().len(), 1);
}

#[test]
fn second_run_replaces_the_first() {
    let rig = Rig::new(4, 4);
    let sink = Rc::new(RecordingSink::new());
    let mut plugin = plugin(&rig, &sink);
    let graph = rig.ao_graph();

    plugin.render(rig.surfaces.normals);
    plugin.render(rig.surfaces.depth);
    plugin.render(rig.surfaces.output);
    plugin.run("first", &graph, "ao", 10).unwrap();
    plugin.run("second", &graph, "ao", 10).unwrap();

    assert_eq!(rig.host.live_registrations(), 3);
    assert_eq!(rig.host.live_textures(), 3);

    plugin.stop();
    plugin.stop();
    assert!(plugin.session().is_none());
    rig.assert_released();
}

#[test]
fn binary_mode_from_config() {
    let rig = Rig::new(4, 4);
    let sink = Rc::new(RecordingSink::new());
    let config = NnaoConfig {
        graph_mode: 0,
        ..NnaoConfig::default()
    };
    let mut plugin = NnaoPlugin::new(
        rig.device.clone(),
        Box::new(ReferenceEngine::new()),
        config,
        sink.clone(),
    )
    .unwrap();
    let path = rig.write_graph("ao.bin", &ao_graph(), GraphEncoding::Binary);

    rig.deliver_frame(&mut plugin);
    plugin.render(rig.surfaces.normals);
    plugin.render(rig.surfaces.depth);
    plugin.render(rig.surfaces.output);
    plugin.run("nnao", &path, "ao", 1).unwrap();
    plugin.end_frame();
    rig.deliver_frame(&mut plugin);

    assert!(plugin.session().is_none());
    assert!(sink.errors().is_empty());

    // The text encoding of the same graph is rejected in binary mode.
    let text = rig.ao_graph();
    plugin.render(rig.surfaces.normals);
    plugin.render(rig.surfaces.depth);
    plugin.render(rig.surfaces.output);
    let err = plugin.run("nnao", &text, "ao", 1).unwrap_err();
    assert!(err.to_string().starts_with("Data loss: "));
    rig.assert_released();
}

#[test]
fn engine_without_device_kernels_is_unavailable() {
    let rig = Rig::new(1, 1);
    let sink = Rc::new(RecordingSink::new());
    let err = NnaoPlugin::new(
        rig.device.clone(),
        Box::new(ReferenceEngine::cpu_only()),
        NnaoConfig::default(),
        sink.clone(),
    )
    .unwrap_err();
    assert!(matches!(err, SessionError::EngineUnavailable { .. }));
    assert_eq!(sink.errors().len(), 1);
}
