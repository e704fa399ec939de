//! Host-facing controller.
//!
//! The host calls [`NnaoPlugin::render`] once per surface and
//! [`NnaoPlugin::end_frame`] at every frame boundary. A scripting caller
//! starts and stops runs with [`NnaoPlugin::run`] and [`NnaoPlugin::stop`].

use std::path::Path;
use std::rc::Rc;

use gpu_interop::SharedDevice;
use nnao_core::{Delivery, DiagnosticSink, FrameCapture, NnaoConfig, SurfaceHandle, PLUGIN_NAME};
use nnao_engine::GraphEngine;

use crate::error::{Result, SessionError};
use crate::session::{InferenceSession, SessionParams, StepOutcome};

pub struct NnaoPlugin {
    device: SharedDevice,
    engine: Box<dyn GraphEngine>,
    config: NnaoConfig,
    sink: Rc<dyn DiagnosticSink>,
    capture: FrameCapture,
    session: Option<InferenceSession>,
}

impl NnaoPlugin {
    /// Set the plugin up on `device`. Fails when the engine cannot run the
    /// interactive operators on the device.
    pub fn new(
        device: SharedDevice,
        engine: Box<dyn GraphEngine>,
        config: NnaoConfig,
        sink: Rc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        if !engine.supports_device_kernels() {
            sink.error(
                PLUGIN_NAME,
                "Could not initiate inference plugin, no GPU support found.",
            );
            return Err(SessionError::EngineUnavailable {
                engine: engine.name().to_string(),
            });
        }
        tracing::debug!(device = device.name(), engine = engine.name(), "plugin set up");
        Ok(Self {
            device,
            engine,
            config,
            sink,
            capture: FrameCapture::new(),
            session: None,
        })
    }

    /// One host render call. The delivery that completes the capture also
    /// steps the running session.
    pub fn render(&mut self, surface: SurfaceHandle) -> Delivery {
        let delivery = self.capture.deliver(surface);
        if let Delivery::Completed(surfaces) = delivery {
            if let Some(session) = self.session.as_mut().filter(|s| s.is_running()) {
                match session.step(&surfaces) {
                    Ok(StepOutcome::Continue { done }) => {
                        tracing::trace!(done, "session stepped");
                    }
                    Ok(StepOutcome::Completed) => {
                        self.sink.info(
                            PLUGIN_NAME,
                            &format!("Finished {} iterations", session.iterations_done()),
                        );
                        self.session = None;
                    }
                    Err(err) => {
                        self.sink.error(PLUGIN_NAME, &err.to_string());
                        self.session = None;
                    }
                }
            }
        }
        delivery
    }

    /// Frame boundary.
    pub fn end_frame(&mut self) {
        self.capture.end_frame();
    }

    /// Start a run over the surfaces captured this frame.
    ///
    /// Any session still active is stopped first.
    pub fn run(
        &mut self,
        surface_set: &str,
        graph_path: &Path,
        output_node: &str,
        iterations: u32,
    ) -> Result<()> {
        let Some(surfaces) = self.capture.surfaces() else {
            let err = SessionError::SurfacesNotReady {
                phase: self.capture.phase(),
            };
            self.sink.error(PLUGIN_NAME, &err.to_string());
            return Err(err);
        };
        tracing::info!(surface_set, graph = %graph_path.display(), output_node, iterations, "run requested");
        self.stop();

        let started = SessionParams::from_config(&self.config, graph_path, output_node, iterations)
            .and_then(|params| {
                InferenceSession::start(self.device.clone(), &surfaces, &params, self.engine.as_ref())
            });
        match started {
            Ok(session) => {
                if session.is_running() {
                    self.session = Some(session);
                }
                Ok(())
            }
            Err(err) => {
                self.sink.error(PLUGIN_NAME, &err.to_string());
                Err(err)
            }
        }
    }

    /// Force teardown of the active session, if any.
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.teardown() {
                self.sink.error(PLUGIN_NAME, &err.to_string());
            }
        }
    }

    /// Host is unloading the plugin.
    pub fn shutdown(&mut self) {
        self.stop();
        self.capture.end_frame();
        tracing::debug!("plugin shut down");
    }

    pub fn session(&self) -> Option<&InferenceSession> {
        self.session.as_ref()
    }

    pub fn capture(&self) -> &FrameCapture {
        &self.capture
    }

    pub fn config(&self) -> &NnaoConfig {
        &self.config
    }
}

impl std::fmt::Debug for NnaoPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NnaoPlugin")
            .field("device", &self.device.name())
            .field("engine", &self.engine.name())
            .field("capture", &self.capture.phase())
            .field("session", &self.session)
            .finish()
    }
}

impl Drop for NnaoPlugin {
    fn drop(&mut self) {
        self.stop();
    }
}
