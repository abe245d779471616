//! Configuration for the glint bloom tools.
//!
//! Settings persist to disk as a RON file and can be overridden from the
//! command line. Unknown or missing fields fall back to defaults, so config
//! files survive upgrades in both directions.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, default_config_dir};
pub use config::{BackendKind, BloomConfig, Config, DebugConfig, RenderConfig};
pub use error::ConfigError;
