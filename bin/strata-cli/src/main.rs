//! Strata CLI - Operator command line interface
//!
//! This binary opens a Strata data directory to run recovery, inspect the
//! journal, print statistics or exercise the engine with sample data.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use strata_common::{EngineConfig, StoreBackend};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Strata storage engine CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "strata.toml")]
    config: String,

    /// Data directory (page store and journal)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Page store backend: memory, mmap or redb
    #[arg(short, long)]
    backend: Option<String>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the data directory, replay the journal and print what was recovered
    Recover,
    /// Print journal records and unfinished groups without opening the engine
    InspectJournal {
        /// Include page images as hex
        #[arg(long)]
        dump: bool,
    },
    /// Print engine statistics
    Stats,
    /// Print every row of a table
    Scan {
        /// Table name
        table: String,
    },
    /// Create a sample table, insert rows, look them up and run a transaction
    Demo {
        /// Rows to insert through the journaled pipeline
        #[arg(long, default_value_t = 8)]
        rows: usize,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Read `path` if it exists; a file that does not parse falls back to defaults
    fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let config_str = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Self::default()
        }))
    }

    /// Engine config with command line overrides applied (CLI takes precedence)
    fn merge(self, args: &Args) -> Result<(EngineConfig, String)> {
        let mut engine = self.engine;
        if let Some(dir) = &args.data_dir {
            engine.storage.data_dir = dir.clone();
        }
        if let Some(backend) = &args.backend {
            engine.storage.backend = backend.parse::<StoreBackend>()?;
        }
        let log_level = if args.log_level != "warn" {
            args.log_level.clone()
        } else {
            self.logging.level
        };
        Ok((engine, log_level))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (engine_config, log_level) = Config::load(&args.config)?.merge(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    engine_config.validate()?;
    info!("Config file: {}", args.config);
    info!(
        "Data directory: {} ({:?})",
        engine_config.storage.data_dir.display(),
        engine_config.storage.backend
    );

    match args.command {
        Commands::Recover => commands::recover(engine_config).await,
        Commands::InspectJournal { dump } => commands::inspect_journal(&engine_config, dump),
        Commands::Stats => commands::stats(engine_config).await,
        Commands::Scan { table } => commands::scan(engine_config, &table).await,
        Commands::Demo { rows } => commands::demo(engine_config, rows).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["strata"];
        argv.extend_from_slice(extra);
        argv.push("stats");
        Args::parse_from(argv)
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = Config::load("/nonexistent/strata.toml").unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.engine.storage.backend, StoreBackend::Mmap);
    }

    #[test]
    fn test_file_values_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            r#"
[engine.storage]
data_dir = "/var/lib/strata"
backend = "redb"

[engine.btree]
order = 16

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        let (engine, level) = config.merge(&args(&[])).unwrap();
        assert_eq!(engine.storage.data_dir, PathBuf::from("/var/lib/strata"));
        assert_eq!(engine.storage.backend, StoreBackend::Redb);
        assert_eq!(engine.btree.order, 16);
        assert_eq!(engine.journal.file_name, "journal.log");
        assert_eq!(level, "debug");
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            "[engine.storage]\ndata_dir = \"/var/lib/strata\"\nbackend = \"redb\"\n",
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        let (engine, level) = config
            .merge(&args(&["--data-dir", "/tmp/s", "--backend", "memory", "--log-level", "trace"]))
            .unwrap();
        assert_eq!(engine.storage.data_dir, PathBuf::from("/tmp/s"));
        assert_eq!(engine.storage.backend, StoreBackend::Memory);
        assert_eq!(level, "trace");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Config::default().merge(&args(&["--backend", "tape"])).is_err());
    }

    #[test]
    fn test_unparsable_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "engine = [not toml").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.engine.btree.order, 64);
    }
}
