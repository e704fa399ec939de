//! Plugin configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is
//! a valid configuration. Environment variables prefixed `NNAO_` override
//! individual fields after loading.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Options forwarded to the inference engine when a session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuOptions {
    /// Let the engine grow its device allocation on demand.
    pub allow_growth: bool,
    /// Upper bound on the fraction of device memory the engine may claim.
    pub memory_fraction: f64,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            allow_growth: true,
            memory_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NnaoConfig {
    /// Graph file encoding: 0 = binary, 1 = text.
    pub graph_mode: u32,
    /// Graph node the placeholder tensor is fed under.
    pub input_node: String,
    /// Lower bound of the depth rescale range.
    pub depth_min: f32,
    /// Upper bound of the depth rescale range.
    pub depth_max: f32,
    /// Kernel workgroup size `[x, y]`.
    pub block_size: [u32; 2],
    pub gpu: GpuOptions,
    /// Log the duration of every graph run.
    pub measure_time: bool,
    /// `tracing-subscriber` filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for NnaoConfig {
    fn default() -> Self {
        Self {
            graph_mode: 1,
            input_node: "input".to_string(),
            depth_min: 0.0,
            depth_max: 1.0,
            block_size: [16, 16],
            gpu: GpuOptions::default(),
            measure_time: true,
            log_filter: "info".to_string(),
        }
    }
}

impl NnaoConfig {
    /// Read a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NNAO_*` environment overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("NNAO_GRAPH_MODE") {
            self.graph_mode = v
                .parse()
                .with_context(|| format!("NNAO_GRAPH_MODE={v:?} is not an integer"))?;
        }
        if let Some(v) = lookup("NNAO_INPUT_NODE") {
            self.input_node = v;
        }
        if let Some(v) = lookup("NNAO_DEPTH_MIN") {
            self.depth_min = v
                .parse()
                .with_context(|| format!("NNAO_DEPTH_MIN={v:?} is not a number"))?;
        }
        if let Some(v) = lookup("NNAO_DEPTH_MAX") {
            self.depth_max = v
                .parse()
                .with_context(|| format!("NNAO_DEPTH_MAX={v:?} is not a number"))?;
        }
        if let Some(v) = lookup("NNAO_LOG") {
            self.log_filter = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_node.is_empty() {
            bail!("input_node must not be empty");
        }
        if self.block_size.contains(&0) {
            bail!("block_size {:?} has a zero dimension", self.block_size);
        }
        if !(self.gpu.memory_fraction > 0.0 && self.gpu.memory_fraction <= 1.0) {
            bail!(
                "gpu.memory_fraction {} must lie in (0, 1]",
                self.gpu.memory_fraction
            );
        }
        if !self.depth_min.is_finite()
            || !self.depth_max.is_finite()
            || self.depth_max <= self.depth_min
        {
            bail!(
                "depth range [{}, {}] is empty or not finite",
                self.depth_min,
                self.depth_max
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_object_yields_defaults() {
        let config = NnaoConfig::from_json_str("{}").unwrap();
        assert_eq!(config, NnaoConfig::default());
        assert_eq!(config.graph_mode, 1);
        assert_eq!(config.block_size, [16, 16]);
    }

    #[test]
    fn partial_file_overrides_selected_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nnao.json");
        std::fs::write(
            &path,
            r#"{ "graph_mode": 0, "depth_max": 250.0, "gpu": { "memory_fraction": 0.25 } }"#,
        )
        .unwrap();

        let config = NnaoConfig::load(&path).unwrap();
        assert_eq!(config.graph_mode, 0);
        assert_eq!(config.depth_max, 250.0);
        assert_eq!(config.gpu.memory_fraction, 0.25);
        assert!(config.gpu.allow_growth);
        assert_eq!(config.input_node, "input");
    }

    #[test]
    fn rejects_collapsed_depth_range() {
        let err = NnaoConfig::from_json_str(r#"{ "depth_min": 2.0, "depth_max": 2.0 }"#)
            .unwrap_err();
        assert!(err.to_string().contains("depth range"));
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let env: HashMap<&str, &str> = [("NNAO_GRAPH_MODE", "0"), ("NNAO_INPUT_NODE", "feed")]
            .into_iter()
            .collect();
        let mut config = NnaoConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.graph_mode, 0);
        assert_eq!(config.input_node, "feed");

        let mut bad = NnaoConfig::default();
        assert!(bad
            .apply_overrides(|k| (k == "NNAO_DEPTH_MIN").then(|| "5".to_string()))
            .is_err());
    }
}
