// Configuration management module
// TOML settings for the index backend, remote service, embeddings and chunking

pub mod interactive;
pub mod settings;

pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    BackendKind, Config, ConfigError, IndexConfig, OllamaConfig, RemoteConfig, validate_namespace,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
