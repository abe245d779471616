//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Bloom effect parameters.
    pub bloom: BloomConfig,
    /// Backend and frame settings.
    pub render: RenderConfig,
    pub debug: DebugConfig,
}

/// Bloom effect parameters. Out-of-range values are clamped when applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BloomConfig {
    /// Overall bloom strength (0.0 - 1.0).
    pub intensity: f32,
    /// Lens-dirt strength (0.0 - 1.0). Ignored without `dirt_texture`.
    pub dirt_intensity: f32,
    /// Image file multiplied into the bloom as lens dirt.
    pub dirt_texture: Option<PathBuf>,
    /// Luminance threshold (0.0 - 1.0).
    pub min_luminance: f32,
    /// Soft knee around the threshold (0.0 - 4.0).
    pub knee_strength: f32,
    /// Output the bloom buffer instead of the composited image.
    pub debug_on: bool,
}

/// Which render backend runs the passes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Reference implementation on the CPU.
    Cpu,
    /// GPU through wgpu, falling back to the CPU when no adapter is found.
    #[default]
    Wgpu,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub backend: BackendKind,
    /// Keep pyramid levels in half-float so highlights above 1.0 survive.
    pub hdr_scratch: bool,
    /// Cap on pooled scratch memory in MiB (`None` = unlimited).
    pub memory_budget_mb: Option<u64>,
    /// Frames to render; later frames reuse pooled scratch buffers.
    pub frames: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            intensity: 0.25,
            dirt_intensity: 0.5,
            dirt_texture: None,
            min_luminance: 0.5,
            knee_strength: 1.0,
            debug_on: false,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            hdr_scratch: true,
            memory_budget_mb: None,
            frames: 1,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl RenderConfig {
    /// Memory budget in bytes.
    pub fn memory_budget_bytes(&self) -> Option<u64> {
        self.memory_budget_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::WriteError {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::WriteError {
            path: config_path,
            source,
        })
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}
