#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use std::path::Path;

use super::settings::validate_namespace;
use super::{BackendKind, Config, IndexConfig, OllamaConfig, RemoteConfig};

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 Knowledge Base Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir);

    eprintln!("{}", style("Vector Index").bold().yellow());
    configure_index(&mut config.index)?;

    if config.index.backend == BackendKind::Remote {
        eprintln!();
        eprintln!("{}", style("Remote Vector Service").bold().yellow());
        eprintln!("The local index is used automatically if the service is unreachable.");
        configure_remote(&mut config.remote)?;
    }

    eprintln!();
    eprintln!("{}", style("Ollama Embeddings").bold().yellow());
    configure_ollama(&mut config.ollama)?;

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    if test_ollama_connection(&config.ollama) {
        eprintln!("{}", style("✓ Ollama connection successful!").green());
    } else {
        eprintln!(
            "{}",
            style("⚠ Warning: Could not connect to Ollama").yellow()
        );
        eprintln!("You can continue, but make sure Ollama is running before ingesting.");
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config: &Config) {
    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Vector Index:").bold().yellow());
    eprintln!("  Backend: {}", style(config.index.backend).cyan());
    eprintln!("  Namespace: {}", style(&config.index.namespace).cyan());
    eprintln!("  Dimensions: {}", style(config.index.dimensions).cyan());
    eprintln!(
        "  Location: {}",
        style(config.vector_database_path().display()).cyan()
    );
    eprintln!("  Top K: {}", style(config.index.top_k).cyan());
    eprintln!(
        "  Score Threshold: {}",
        style(config.index.score_threshold).cyan()
    );

    if config.index.backend == BackendKind::Remote {
        eprintln!();
        eprintln!("{}", style("Remote Vector Service:").bold().yellow());
        eprintln!(
            "  Endpoint: {}",
            style(config.remote.endpoint.as_deref().unwrap_or("<unset>")).cyan()
        );
        eprintln!(
            "  API Key: {}",
            style(if config.remote.api_key.is_some() {
                "<set>"
            } else {
                "<unset>"
            })
            .cyan()
        );
        eprintln!("  Batch Size: {}", style(config.remote.batch_size).cyan());
    }

    eprintln!();
    eprintln!("{}", style("Ollama Settings:").bold().yellow());
    eprintln!("  Model: {}", style(&config.ollama.model).cyan());
    eprintln!("  Batch Size: {}", style(config.ollama.batch_size).cyan());
    match config.ollama_url() {
        Ok(url) => eprintln!("  Ollama URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  Ollama URL: {} ({})", style("Invalid").red(), e),
    }

    eprintln!();
    eprintln!("{}", style("Chunking:").bold().yellow());
    eprintln!("  Max Tokens: {}", style(config.chunking.max_tokens).cyan());

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
}

fn load_existing_config(config_dir: &Path) -> Config {
    Config::load(config_dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No usable configuration found. Using defaults.").yellow()
            );
            Config {
                base_dir: config_dir.to_path_buf(),
                ..Config::default()
            }
        },
        |config| config,
    )
}

fn configure_index(index: &mut IndexConfig) -> Result<()> {
    let backends = &["local", "remote"];
    let default_index = usize::from(index.backend == BackendKind::Remote);

    let backend_index = Select::new()
        .with_prompt("Vector backend")
        .default(default_index)
        .items(backends)
        .interact()?;

    let namespace: String = Input::new()
        .with_prompt("Default namespace")
        .default(index.namespace.clone())
        .validate_with(|input: &String| validate_namespace(input))
        .interact_text()?;

    let dimensions: usize = Input::new()
        .with_prompt("Embedding dimensions")
        .default(index.dimensions)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if (1..=8192).contains(input) {
                Ok(())
            } else {
                Err("Dimensions must be between 1 and 8192")
            }
        })
        .interact_text()?;

    index.backend = if backend_index == 1 {
        BackendKind::Remote
    } else {
        BackendKind::Local
    };
    index.namespace = namespace;
    index.dimensions = dimensions;

    Ok(())
}

fn configure_remote(remote: &mut RemoteConfig) -> Result<()> {
    let endpoint: String = Input::new()
        .with_prompt("Remote endpoint URL")
        .default(remote.endpoint.clone().unwrap_or_default())
        .validate_with(|input: &String| -> Result<(), String> {
            RemoteConfig {
                endpoint: Some(input.clone()),
                ..RemoteConfig::default()
            }
            .validate()
            .map_err(|e| e.to_string())
        })
        .interact_text()?;

    let api_key: String = Input::new()
        .with_prompt("API key (leave empty for none)")
        .allow_empty(true)
        .interact_text()?;

    remote.endpoint = Some(endpoint);
    if !api_key.trim().is_empty() {
        remote.api_key = Some(api_key);
    }

    Ok(())
}

fn configure_ollama(ollama: &mut OllamaConfig) -> Result<()> {
    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == ollama.protocol)
        .unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt("Ollama protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let host: String = Input::new()
        .with_prompt("Ollama host")
        .default(ollama.host.clone())
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Ollama port")
        .default(ollama.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let model: String = Input::new()
        .with_prompt("Embedding model")
        .default(ollama.model.clone())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Model name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let candidate = OllamaConfig {
        protocol: protocols[protocol_index].to_string(),
        host,
        port,
        model,
        batch_size: ollama.batch_size,
    };
    candidate.validate()?;
    *ollama = candidate;

    Ok(())
}

fn test_ollama_connection(ollama: &OllamaConfig) -> bool {
    let url = format!(
        "{}://{}:{}/api/version",
        ollama.protocol, ollama.host, ollama.port
    );

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(&url).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) => (400..500).contains(&code),
        Err(_) => false,
    }
}
