//! Run a full inference session on the software device.
//!
//! Synthetic normals and depth surfaces stand in for a renderer. Frames are
//! driven through the plugin exactly as a host would drive them.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context as _};
use clap::{Parser, ValueEnum};
use gpu_interop::{HostDevice, SharedDevice};
use nnao_core::{CapturedSurfaces, NnaoConfig, SurfaceDesc, SurfaceFormat, TracingSink};
use nnao_engine::{GraphDef, GraphEncoding, NodeDef, ReferenceEngine};
use nnao_session::NnaoPlugin;

#[derive(Parser, Debug)]
#[command(name = "nnao-headless", version)]
struct Cli {
    #[arg(long, default_value_t = 64)]
    width: u32,

    #[arg(long, default_value_t = 64)]
    height: u32,

    /// Iterations to run before the session tears itself down.
    #[arg(long, default_value_t = 3)]
    iterations: u32,

    /// Graph file. The built-in demo graph is used when omitted.
    #[arg(long)]
    graph: Option<PathBuf>,

    #[arg(long, default_value = "ao")]
    output_node: String,

    /// Encoding of the graph file. Overrides the configured `graph_mode`.
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the built-in demo graph to this path and exit.
    #[arg(long)]
    write_graph: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Text,
    Binary,
}

impl Mode {
    fn encoding(self) -> GraphEncoding {
        match self {
            Mode::Text => GraphEncoding::Text,
            Mode::Binary => GraphEncoding::Binary,
        }
    }
}

/// Encoding for this run. `--mode`, when given, replaces the configured one.
fn apply_mode(config: &mut NnaoConfig, mode: Option<Mode>) -> anyhow::Result<GraphEncoding> {
    if let Some(mode) = mode {
        config.graph_mode = mode.encoding() as u32;
    }
    GraphEncoding::from_mode(config.graph_mode)
        .with_context(|| format!("unsupported graph mode {}", config.graph_mode))
}

/// Packed normals and depth, inverted, written to the output.
fn demo_graph(output_node: &str) -> GraphDef {
    GraphDef::new(vec![
        NodeDef::new("input", "Placeholder"),
        NodeDef::new("packed", "InteractiveInput").input("input"),
        NodeDef::new("occlusion", "Scale")
            .input("packed")
            .attr("scale", -1.0)
            .attr("bias", 1.0),
        NodeDef::new(output_node, "InteractiveOutput").input("occlusion"),
    ])
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NnaoConfig::load(path)?,
        None => NnaoConfig::default(),
    };
    config.apply_env_overrides()?;
    let encoding = apply_mode(&mut config, cli.mode)?;
    nnao_core::diagnostics::init_logging(&config.log_filter);

    let graph = demo_graph(&cli.output_node);
    if let Some(path) = &cli.write_graph {
        graph
            .write(path, encoding)
            .with_context(|| format!("write graph '{}'", path.display()))?;
        eprintln!("wrote {}", path.display());
        return Ok(());
    }
    if cli.width == 0 || cli.height == 0 {
        bail!("surface size {}x{} is empty", cli.width, cli.height);
    }

    let scratch = tempfile::tempdir().context("create scratch dir")?;
    let graph_path = match &cli.graph {
        Some(path) => path.clone(),
        None => {
            let path = scratch.path().join("demo.graph");
            graph
                .write(&path, encoding)
                .context("write demo graph")?;
            path
        }
    };

    let host = Rc::new(HostDevice::new());
    let surfaces = synthetic_surfaces(&host, cli.width, cli.height, &config);
    let device: SharedDevice = host.clone();
    let mut plugin = NnaoPlugin::new(
        device,
        Box::new(ReferenceEngine::new()),
        config,
        Rc::new(TracingSink),
    )?;

    run_frames(&mut plugin, &surfaces, &graph_path, &cli)?;

    let stats = host.stats();
    let ao = read_floats(&host.read_surface(surfaces.output)?);
    let (min, max, sum) = ao
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY, 0.0f64), |(lo, hi, sum), &v| {
            (lo.min(v), hi.max(v), sum + f64::from(v))
        });
    tracing::info!(
        pixels = ao.len(),
        min,
        max,
        mean = sum / ao.len() as f64,
        launches = stats.launches,
        syncs = stats.syncs,
        "AO output"
    );
    if host.live_registrations() != 0 || host.live_allocations() != 0 {
        bail!(
            "session leaked {} registrations and {} allocations",
            host.live_registrations(),
            host.live_allocations()
        );
    }
    Ok(())
}

fn run_frames(
    plugin: &mut NnaoPlugin,
    surfaces: &CapturedSurfaces,
    graph: &Path,
    cli: &Cli,
) -> anyhow::Result<()> {
    let deliver = |plugin: &mut NnaoPlugin| {
        plugin.render(surfaces.normals);
        plugin.render(surfaces.depth);
        plugin.render(surfaces.output);
    };

    deliver(plugin);
    plugin.run("headless", graph, &cli.output_node, cli.iterations)?;
    plugin.end_frame();

    let mut frames = 0u32;
    while plugin.session().is_some() {
        if frames > cli.iterations {
            plugin.stop();
            bail!("session still running after {frames} frames");
        }
        deliver(plugin);
        plugin.end_frame();
        frames += 1;
    }
    tracing::info!(frames, "session finished");
    Ok(())
}

/// A hemisphere of normals over a depth ramp inside the configured range.
fn synthetic_surfaces(host: &HostDevice, width: u32, height: u32, config: &NnaoConfig) -> CapturedSurfaces {
    let (w, h) = (width as f32, height as f32);
    let mut normals = Vec::with_capacity((width * height * 4) as usize);
    let mut depth = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let nx = (x as f32 + 0.5) / w * 2.0 - 1.0;
            let ny = (y as f32 + 0.5) / h * 2.0 - 1.0;
            let nz = (1.0 - nx * nx - ny * ny).max(0.0).sqrt();
            let encode = |v: f32| ((v * 0.5 + 0.5) * 255.0).round() as u8;
            normals.extend_from_slice(&[encode(nx), encode(ny), encode(nz), 255]);

            let t = (x + y) as f32 / (width + height) as f32;
            let d = config.depth_min + t * (config.depth_max - config.depth_min);
            depth.extend_from_slice(&d.to_le_bytes());
        }
    }

    CapturedSurfaces {
        normals: host.create_surface(
            SurfaceDesc::new(width, height, SurfaceFormat::Rgba8Unorm),
            normals,
        ),
        depth: host.create_surface(SurfaceDesc::new(width, height, SurfaceFormat::R32Float), depth),
        output: host.create_surface(
            SurfaceDesc::new(width, height, SurfaceFormat::Rgba8Unorm),
            Vec::new(),
        ),
    }
}

fn read_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_config() -> NnaoConfig {
        NnaoConfig {
            graph_mode: 0,
            ..NnaoConfig::default()
        }
    }

    #[test]
    fn configured_mode_survives_without_flag() {
        let cli = Cli::try_parse_from(["nnao-headless"]).unwrap();
        assert_eq!(cli.mode, None);

        let mut config = binary_config();
        assert_eq!(apply_mode(&mut config, cli.mode).unwrap(), GraphEncoding::Binary);
        assert_eq!(config.graph_mode, 0);
    }

    #[test]
    fn mode_flag_overrides_config() {
        let cli = Cli::try_parse_from(["nnao-headless", "--mode", "text"]).unwrap();
        let mut config = binary_config();
        assert_eq!(apply_mode(&mut config, cli.mode).unwrap(), GraphEncoding::Text);
        assert_eq!(config.graph_mode, 1);
    }

    #[test]
    fn unknown_configured_mode_is_an_error() {
        let mut config = NnaoConfig {
            graph_mode: 9,
            ..NnaoConfig::default()
        };
        let err = apply_mode(&mut config, None).unwrap_err();
        assert!(err.to_string().contains("unsupported graph mode 9"), "{err}");
    }
}
