use clap::{Parser, Subcommand};
use kb_retrieval::Result;
use kb_retrieval::commands::{
    clear_namespace, configure, ingest_file, list_namespaces, parse_key_value, resolve_config_dir,
    run_query, show_stats, show_status,
};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kb-retrieval")]
#[command(about = "Chunk, embed and retrieve documents from a private knowledge base")]
#[command(version)]
struct Cli {
    /// Base directory holding config.toml, metadata.db and the local index
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the vector backend, remote service and Ollama
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Chunk, embed and index a text document
    Ingest {
        /// Path of the UTF-8 document to ingest
        file: PathBuf,
        /// Target namespace; the configured default when omitted
        #[arg(long)]
        namespace: Option<String>,
        /// Stable document id; the file stem when omitted
        #[arg(long)]
        source_id: Option<String>,
        /// Tag copied onto every chunk, e.g. --tag lang=en
        #[arg(long = "tag", value_parser = parse_key_value)]
        tags: Vec<(String, Value)>,
    },
    /// Retrieve context relevant to a question
    Query {
        /// Question text
        text: String,
        #[arg(long)]
        namespace: Option<String>,
        /// Maximum number of results
        #[arg(long)]
        top_k: Option<usize>,
        /// Minimum similarity score in [0, 1]
        #[arg(long)]
        threshold: Option<f32>,
        /// Exact metadata match, e.g. --filter lang=en
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, Value)>,
    },
    /// Show statistics for a namespace
    Stats {
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Delete every vector and record in a namespace
    Clear {
        #[arg(long)]
        namespace: Option<String>,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// List namespaces with their vector counts
    Namespaces,
    /// Check Ollama, the vector backend and the metadata store
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = resolve_config_dir(cli.config_dir)?;

    match cli.command {
        Commands::Config { show } => {
            configure(&config_dir, show)?;
        }
        Commands::Ingest {
            file,
            namespace,
            source_id,
            tags,
        } => {
            ingest_file(&config_dir, &file, namespace, source_id, tags).await?;
        }
        Commands::Query {
            text,
            namespace,
            top_k,
            threshold,
            filters,
        } => {
            run_query(&config_dir, text, namespace, top_k, threshold, filters).await?;
        }
        Commands::Stats { namespace } => {
            show_stats(&config_dir, namespace).await?;
        }
        Commands::Clear { namespace, yes } => {
            clear_namespace(&config_dir, namespace, yes).await?;
        }
        Commands::Namespaces => {
            list_namespaces(&config_dir).await?;
        }
        Commands::Status => {
            show_status(&config_dir).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn namespaces_command() {
        let cli = Cli::try_parse_from(["kb-retrieval", "namespaces"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Namespaces));
            assert!(parsed.config_dir.is_none());
        }
    }

    #[test]
    fn ingest_with_tags() {
        let cli = Cli::try_parse_from([
            "kb-retrieval",
            "ingest",
            "notes.md",
            "--namespace",
            "ns1",
            "--tag",
            "lang=en",
            "--tag",
            "page=3",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ingest {
                file,
                namespace,
                source_id,
                tags,
            } = parsed.command
            {
                assert_eq!(file, PathBuf::from("notes.md"));
                assert_eq!(namespace, Some("ns1".to_string()));
                assert_eq!(source_id, None);
                assert_eq!(
                    tags,
                    vec![
                        ("lang".to_string(), json!("en")),
                        ("page".to_string(), json!(3))
                    ]
                );
            } else {
                panic!("expected ingest command");
            }
        }
    }

    #[test]
    fn query_with_options() {
        let cli = Cli::try_parse_from([
            "kb-retrieval",
            "query",
            "what is ownership?",
            "--top-k",
            "3",
            "--threshold",
            "0.4",
            "--filter",
            "lang=en",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Query {
                text,
                top_k,
                threshold,
                filters,
                ..
            } = parsed.command
            {
                assert_eq!(text, "what is ownership?");
                assert_eq!(top_k, Some(3));
                assert_eq!(threshold, Some(0.4));
                assert_eq!(filters.len(), 1);
            } else {
                panic!("expected query command");
            }
        }
    }

    #[test]
    fn malformed_tag_is_rejected() {
        let cli = Cli::try_parse_from(["kb-retrieval", "ingest", "notes.md", "--tag", "oops"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn global_config_dir() {
        let cli = Cli::try_parse_from(["kb-retrieval", "stats", "--config-dir", "/tmp/kb"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert_eq!(parsed.config_dir, Some(PathBuf::from("/tmp/kb")));
        }
    }

    #[test]
    fn clear_with_yes() {
        let cli = Cli::try_parse_from(["kb-retrieval", "clear", "--namespace", "ns1", "-y"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Clear { namespace, yes } = parsed.command {
                assert_eq!(namespace, Some("ns1".to_string()));
                assert!(yes);
            }
        }
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["kb-retrieval", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["kb-retrieval", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["kb-retrieval", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
