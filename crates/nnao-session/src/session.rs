//! One inference session: resources, graph and the bounded step loop.

use std::path::PathBuf;
use std::time::Instant;

use gpu_interop::{BlockSize, DepthRange, ImageDims, InteropError, InteropResource, PitchedSet, SharedDevice};
use nnao_core::{CapturedSurfaces, NnaoConfig};
use nnao_engine::{GraphDef, GraphEncoding, GraphEngine, GraphSession, OpContext, SessionOptions, Tensor};

use crate::error::{Result, SessionError};
use crate::textures::CaptureTextures;

/// Everything `start` needs besides the device, surfaces and engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub graph_path: PathBuf,
    pub encoding: GraphEncoding,
    pub input_node: String,
    pub output_node: String,
    pub iterations: u32,
    pub depth_range: DepthRange,
    pub block: BlockSize,
    pub options: SessionOptions,
    pub measure_time: bool,
}

impl SessionParams {
    pub fn new(graph_path: impl Into<PathBuf>, output_node: impl Into<String>, iterations: u32) -> Self {
        Self {
            graph_path: graph_path.into(),
            encoding: GraphEncoding::Text,
            input_node: "input".to_string(),
            output_node: output_node.into(),
            iterations,
            depth_range: DepthRange::default(),
            block: BlockSize::default(),
            options: SessionOptions::default(),
            measure_time: true,
        }
    }

    /// Parameters for one run under `config`.
    pub fn from_config(
        config: &NnaoConfig,
        graph_path: impl Into<PathBuf>,
        output_node: impl Into<String>,
        iterations: u32,
    ) -> Result<Self> {
        let encoding = GraphEncoding::from_mode(config.graph_mode)
            .ok_or(SessionError::UnsupportedGraphMode(config.graph_mode))?;
        let depth_range = DepthRange::new(config.depth_min, config.depth_max)?;
        let [bx, by] = config.block_size;
        let block = BlockSize::new(bx as usize, by as usize)?;
        Ok(Self {
            encoding,
            input_node: config.input_node.clone(),
            depth_range,
            block,
            options: SessionOptions::from(&config.gpu),
            measure_time: config.measure_time,
            ..Self::new(graph_path, output_node, iterations)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Running,
    /// Reached the iteration limit. Resources are released.
    Completed,
    /// A step failed. Resources are released.
    Failed,
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue { done: u32 },
    Completed,
}

/// Resources held while running. Fields drop in release order.
struct Live {
    normals: InteropResource,
    depth: InteropResource,
    ao: InteropResource,
    buffers: PitchedSet,
    textures: CaptureTextures,
    graph: Box<dyn GraphSession>,
    placeholder: Tensor,
    ctx: OpContext,
}

pub struct InferenceSession {
    device: SharedDevice,
    dims: ImageDims,
    pitch: usize,
    iterations_done: u32,
    iterations_max: u32,
    input_node: String,
    output_node: String,
    measure_time: bool,
    state: SessionState,
    live: Option<Live>,
}

impl InferenceSession {
    /// Acquire every resource for a run over `surfaces` and load the graph.
    ///
    /// On failure everything acquired so far is released before returning.
    pub fn start(
        device: SharedDevice,
        surfaces: &CapturedSurfaces,
        params: &SessionParams,
        engine: &dyn GraphEngine,
    ) -> Result<Self> {
        tracing::debug!(state = ?SessionState::Initializing, ?surfaces, "starting session");
        let desc = device.surface_desc(surfaces.normals)?;
        let depth_desc = device.surface_desc(surfaces.depth)?;
        if (depth_desc.width, depth_desc.height) != (desc.width, desc.height) {
            return Err(InteropError::call(
                "surface_desc",
                format!(
                    "depth surface is {}x{}, normals are {}x{}",
                    depth_desc.width, depth_desc.height, desc.width, desc.height
                ),
            )
            .into());
        }
        let dims = ImageDims::new(desc.width as usize, desc.height as usize);

        let textures = CaptureTextures::create(&device, desc.width, desc.height)?;
        let normals = InteropResource::acquire(device.clone(), textures.normals())?;
        let depth = InteropResource::acquire(device.clone(), textures.depth())?;
        let ao = InteropResource::acquire(device.clone(), textures.ao())?;

        let buffers = PitchedSet::allocate(&device, dims.width, dims.height)?;
        buffers.zero()?;
        let pitch = buffers.pitch();

        let placeholder = Tensor::image(dims.width, dims.height);

        let graph_def = GraphDef::read(&params.graph_path, params.encoding)
            .map_err(SessionError::GraphLoadFailed)?;
        let mut graph = engine
            .new_session(&params.options)
            .map_err(SessionError::GraphCreateFailed)?;
        graph
            .create(&graph_def)
            .map_err(SessionError::GraphCreateFailed)?;

        let ctx = OpContext::new(
            device.clone(),
            buffers.input.view(),
            buffers.depth.view(),
            buffers.output.view(),
            dims,
        )
        .with_depth_range(params.depth_range)
        .with_block(params.block);

        tracing::info!(
            width = dims.width,
            height = dims.height,
            pitch,
            iterations = params.iterations,
            graph = %params.graph_path.display(),
            output_node = %params.output_node,
            engine = engine.name(),
            "inference session running"
        );

        let mut session = Self {
            device,
            dims,
            pitch,
            iterations_done: 0,
            iterations_max: params.iterations,
            input_node: params.input_node.clone(),
            output_node: params.output_node.clone(),
            measure_time: params.measure_time,
            state: SessionState::Running,
            live: Some(Live {
                normals,
                depth,
                ao,
                buffers,
                textures,
                graph,
                placeholder,
                ctx,
            }),
        };
        if session.iterations_max == 0 {
            session.finish(SessionState::Completed)?;
        }
        Ok(session)
    }

    /// Run one iteration. Any failure tears the session down before it is
    /// returned.
    pub fn step(&mut self, surfaces: &CapturedSurfaces) -> Result<StepOutcome> {
        if self.state != SessionState::Running {
            return Err(SessionError::NotRunning);
        }
        match self.run_iteration(surfaces) {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(done = self.iterations_done, %err, "step failed, tearing down");
                if let Err(teardown) = self.finish(SessionState::Failed) {
                    tracing::error!(%teardown, "teardown after failed step reported an error");
                }
                return Err(err);
            }
        }

        self.iterations_done += 1;
        if self.iterations_done >= self.iterations_max {
            self.finish(SessionState::Completed)?;
            tracing::info!(iterations = self.iterations_done, "inference session completed");
            return Ok(StepOutcome::Completed);
        }
        Ok(StepOutcome::Continue {
            done: self.iterations_done,
        })
    }

    fn run_iteration(&mut self, surfaces: &CapturedSurfaces) -> Result<()> {
        let live = self.live.as_mut().ok_or(SessionError::NotRunning)?;
        let device = &self.device;
        let row_bytes = self.dims.width * 4;
        let rows = self.dims.height;

        device.copy_surface(live.textures.normals(), surfaces.normals)?;
        device.copy_surface(live.textures.depth(), surfaces.depth)?;
        device.flush()?;

        device.copy_array_to_pitched(&live.buffers.input.view(), live.normals.array(), row_bytes, rows)?;
        device.copy_array_to_pitched(&live.buffers.depth.view(), live.depth.array(), row_bytes, rows)?;
        device.synchronize()?;

        let started = Instant::now();
        let result = live.graph.run(
            &[(self.input_node.as_str(), &live.placeholder)],
            &[self.output_node.as_str()],
            &live.ctx,
        );
        if self.measure_time {
            tracing::debug!(
                iteration = self.iterations_done + 1,
                elapsed_us = started.elapsed().as_micros() as u64,
                "graph run"
            );
        }
        result.map_err(SessionError::InferenceFailed)?;
        device.synchronize()?;

        device.copy_pitched_to_array(live.ao.array(), &live.buffers.output.view(), row_bytes, rows)?;
        device.synchronize()?;

        device.copy_surface(surfaces.output, live.textures.ao())?;
        device.flush()?;
        Ok(())
    }

    /// Release everything the session holds. Calling it again, or after the
    /// session completed or failed, does nothing.
    pub fn teardown(&mut self) -> Result<()> {
        let released = self.release();
        self.state = SessionState::TornDown;
        released
    }

    fn finish(&mut self, state: SessionState) -> Result<()> {
        self.state = state;
        self.release()
    }

    /// Unmap and unregister, free the buffers, release the textures, close
    /// the graph. Every step is attempted; the first failure is returned.
    fn release(&mut self) -> Result<()> {
        let Some(live) = self.live.take() else {
            return Ok(());
        };
        let Live {
            normals,
            depth,
            ao,
            buffers,
            textures,
            mut graph,
            ..
        } = live;

        let mut first: Option<SessionError> = None;
        for resource in [normals, depth, ao] {
            keep_first(&mut first, resource.release().map_err(SessionError::from));
        }
        drop(buffers);
        keep_first(&mut first, textures.release().map_err(SessionError::from));
        if let Err(status) = graph.close() {
            tracing::warn!(%status, "engine session did not close cleanly");
        }
        tracing::debug!(state = ?self.state, done = self.iterations_done, "session resources released");
        first.map_or(Ok(()), Err)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn iterations_done(&self) -> u32 {
        self.iterations_done
    }

    pub fn iterations_max(&self) -> u32 {
        self.iterations_max
    }

    pub fn dimensions(&self) -> ImageDims {
        self.dims
    }

    pub fn output_node(&self) -> &str {
        &self.output_node
    }

    /// Row pitch shared by the session's pitched buffers.
    pub fn pitch(&self) -> usize {
        self.pitch
    }
}

fn keep_first(first: &mut Option<SessionError>, result: Result<()>) {
    if let Err(err) = result {
        tracing::error!(%err, "session teardown step failed");
        first.get_or_insert(err);
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::error!(%err, "failed to release inference session");
        }
    }
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("dims", &self.dims)
            .field("pitch", &self.pitch)
            .field("iterations_done", &self.iterations_done)
            .field("iterations_max", &self.iterations_max)
            .field("output_node", &self.output_node)
            .field("state", &self.state)
            .field("graph", &self.live.as_ref().map(|live| &live.graph))
            .finish()
    }
}
