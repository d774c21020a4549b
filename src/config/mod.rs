//! Configuration module
//!
//! A node is described by one TOML file: node settings, optional router
//! settings and the module declarations.

mod settings;

pub use settings::{
    CommandConfig, ConfigError, ModuleConfig, NodeConfig, NodeSection, ParameterConfig, RouterSection,
};

use directories::ProjectDirs;
use std::path::PathBuf;

/// File name of the node configuration
pub const CONFIG_FILE: &str = "secnode.toml";

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "secop", "secnode").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default location of the node configuration
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE))
}
