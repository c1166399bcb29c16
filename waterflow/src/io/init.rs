//! Canonical paths and first-run scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{WaterflowConfig, write_config};

/// All canonical paths the controller reads and writes.
#[derive(Debug, Clone)]
pub struct WaterflowPaths {
    pub config_path: PathBuf,
    /// Directory holding the markers (`lock`, `force`, `stop`, `token`, `lastprogram.json`).
    pub state_dir: PathBuf,
    pub oplog_path: PathBuf,
    pub metrics_path: PathBuf,
}

impl WaterflowPaths {
    pub fn new(config_path: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            config_path: config_path.into(),
            oplog_path: state_dir.join("loop.log"),
            metrics_path: state_dir.join("metrics.jsonl"),
            state_dir,
        }
    }

    /// `~/.config/waterflow/config.toml` and `~/var/waterflow`.
    pub fn default_locations() -> Result<Self> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("cannot determine config directory"))?;
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self::new(
            config_dir.join("waterflow").join("config.toml"),
            home.join("var").join("waterflow"),
        ))
    }
}

/// Options for `init_waterflow`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Create the state directory and write the default config.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_waterflow(paths: &WaterflowPaths, options: &InitOptions) -> Result<()> {
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "waterflow init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "waterflow init: {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    create_dir(&paths.state_dir)?;
    write_config(&paths.config_path, &WaterflowConfig::default())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}
