//! Command-line argument parsing for the `glint` tool.

use std::path::PathBuf;

use clap::Parser;

use crate::{BackendKind, Config};

/// Apply screen-space bloom to an image.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "glint", about = "Screen-space bloom for images")]
pub struct CliArgs {
    /// Image to read.
    pub input: PathBuf,

    /// Where to write the result (format from the extension).
    pub output: PathBuf,

    /// Bloom strength (0.0 - 1.0).
    #[arg(long)]
    pub intensity: Option<f32>,

    /// Lens-dirt strength (0.0 - 1.0).
    #[arg(long)]
    pub dirt_intensity: Option<f32>,

    /// Lens-dirt image.
    #[arg(long)]
    pub dirt_texture: Option<PathBuf>,

    /// Luminance threshold (0.0 - 1.0).
    #[arg(long)]
    pub min_luminance: Option<f32>,

    /// Soft knee around the threshold (0.0 - 4.0).
    #[arg(long)]
    pub knee_strength: Option<f32>,

    /// Write the bloom buffer instead of the composited image.
    #[arg(long)]
    pub debug_view: Option<bool>,

    /// Render backend.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Half-float pyramid levels.
    #[arg(long)]
    pub hdr_scratch: Option<bool>,

    /// Scratch memory budget in MiB.
    #[arg(long)]
    pub memory_budget_mb: Option<u64>,

    /// Number of frames to render.
    #[arg(long)]
    pub frames: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// `--config` if given, else the platform config directory.
    pub fn config_dir(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_dir)
    }
}

/// `<platform config dir>/glint`, or `./glint` where the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("glint")
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(v) = args.intensity {
            self.bloom.intensity = v;
        }
        if let Some(v) = args.dirt_intensity {
            self.bloom.dirt_intensity = v;
        }
        if let Some(ref path) = args.dirt_texture {
            self.bloom.dirt_texture = Some(path.clone());
        }
        if let Some(v) = args.min_luminance {
            self.bloom.min_luminance = v;
        }
        if let Some(v) = args.knee_strength {
            self.bloom.knee_strength = v;
        }
        if let Some(v) = args.debug_view {
            self.bloom.debug_on = v;
        }
        if let Some(backend) = args.backend {
            self.render.backend = backend;
        }
        if let Some(v) = args.hdr_scratch {
            self.render.hdr_scratch = v;
        }
        if let Some(mb) = args.memory_budget_mb {
            self.render.memory_budget_mb = Some(mb);
        }
        if let Some(frames) = args.frames {
            self.render.frames = frames;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
