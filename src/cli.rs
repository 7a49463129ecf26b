use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use flexi_logger::{Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::{error, info};
use serde::Serialize;
use tokio::signal;

use crate::config::{Config, CONFIG};
use crate::db::Database;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::recommendations::NewRecommendation;
use crate::validate::LiveFindings;

#[derive(Parser)]
#[command(
    name = "recunlock",
    version,
    about = "recunlock: progressive unlock engine for site recommendations"
)]
pub struct Cli {
    /// Directory holding config.toml, the database and logs
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the periodic replacement sweep until interrupted (default if no command specified)
    Serve,

    /// Run one replacement sweep and exit
    Sweep {
        /// Unix timestamp to treat as "now" (defaults to the current time)
        #[arg(long)]
        now: Option<i64>,
    },

    /// Store a scan's generated recommendations from a JSON file
    Import {
        #[arg(long = "scan-id")]
        scan_id: i64,
        #[arg(long = "user-id")]
        user_id: i64,
        /// JSON array of recommendations
        #[arg(long)]
        file: PathBuf,
    },

    /// Queue replacement content for a scan from a JSON file
    Candidates {
        #[arg(long = "scan-id")]
        scan_id: i64,
        #[arg(long)]
        file: PathBuf,
    },

    /// List every recommendation of a scan with its progress
    List {
        #[arg(long = "scan-id")]
        scan_id: i64,
    },

    /// List the recommendations currently open for work
    Active {
        #[arg(long = "scan-id")]
        scan_id: i64,
    },

    /// Show a scan's progress row
    Progress {
        #[arg(long = "scan-id")]
        scan_id: i64,
    },

    /// Show progress across all of a user's scans
    Rollup {
        #[arg(long = "user-id")]
        user_id: i64,
    },

    /// Mark a recommendation complete
    Complete {
        #[arg(long)]
        id: i64,
    },

    /// Opt out of a recommendation
    Skip {
        #[arg(long)]
        id: i64,
    },

    /// Record progress on a recommendation
    #[command(name = "set-progress")]
    SetProgress {
        #[arg(long)]
        id: i64,
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=100))]
        percent: i64,
    },

    /// Try to unlock the next batch of a scan
    Unlock {
        #[arg(long = "scan-id")]
        scan_id: i64,
    },

    /// Validate a recommendation against elements observed on the live page
    Validate {
        #[arg(long)]
        id: i64,
        /// An observed element (repeatable)
        #[arg(long = "found", conflicts_with = "findings_file")]
        found: Vec<String>,
        /// JSON array of observed elements
        #[arg(long = "findings-file")]
        findings_file: Option<PathBuf>,
    },

    /// Show the validation history of a recommendation
    History {
        #[arg(long)]
        id: i64,
    },

    /// Show the replacement lineage of a recommendation, newest first
    Chain {
        #[arg(long)]
        id: i64,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), EngineError> {
        let args = Cli::parse();

        let data_dir = match args.data_dir {
            Some(dir) => dir,
            None => Self::default_data_dir()?,
        };

        let config = Config::load_config(&data_dir);
        let _logger = Self::setup_logging(&data_dir, &config)?;
        let config = CONFIG.get_or_init(|| config);

        let db = Database::open(&config.database.db_path(&data_dir), &config.database)?;
        let engine = Engine::new(db, config);

        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::serve(engine, config),
            Command::Sweep { now } => print_json(&engine.run_replacement_sweep(now.unwrap_or_else(Engine::now))?),
            Command::Import { scan_id, user_id, file } => {
                let recs = read_recommendations(&file)?;
                print_json(&engine.ingest(scan_id, user_id, &recs)?)
            }
            Command::Candidates { scan_id, file } => {
                let recs = read_recommendations(&file)?;
                let added = engine.add_replacement_candidates(scan_id, &recs)?;
                print_json(&serde_json::json!({ "scan_id": scan_id, "added": added }))
            }
            Command::List { scan_id } => print_json(&engine.list_recommendations(scan_id)?),
            Command::Active { scan_id } => print_json(&engine.list_active(scan_id)?),
            Command::Progress { scan_id } => print_json(&engine.progress(scan_id)?),
            Command::Rollup { user_id } => print_json(&engine.user_rollup(user_id)?),
            Command::Complete { id } => print_json(&engine.mark_complete(id)?),
            Command::Skip { id } => print_json(&engine.skip(id)?),
            Command::SetProgress { id, percent } => print_json(&engine.set_progress(id, percent)?),
            Command::Unlock { scan_id } => print_json(&engine.unlock_next(scan_id)?),
            Command::Validate { id, found, findings_file } => {
                let findings = match findings_file {
                    Some(path) => LiveFindings::from_json(&fs::read_to_string(path)?),
                    None => LiveFindings::new(&found),
                };
                print_json(&engine.validate_recommendation(id, &findings)?)
            }
            Command::History { id } => print_json(&engine.validation_history(id)?),
            Command::Chain { id } => print_json(&engine.replacement_chain(id)?),
        }
    }

    fn default_data_dir() -> Result<PathBuf, EngineError> {
        let project_dirs = ProjectDirs::from("", "", "recunlock").ok_or_else(|| {
            EngineError::Error("Could not determine the data directory".to_string())
        })?;
        Ok(project_dirs.data_local_dir().to_path_buf())
    }

    fn setup_logging(data_dir: &Path, config: &Config) -> Result<LoggerHandle, EngineError> {
        let log_dir = data_dir.join("logs");

        Logger::try_with_str(config.logging.log_spec())
            .and_then(|logger| {
                logger
                    .log_to_file(FileSpec::default().directory(log_dir).basename("recunlock"))
                    .rotate(
                        Criterion::Age(Age::Day),
                        Naming::Timestamps,
                        Cleanup::KeepLogFiles(7),
                    )
                    .duplicate_to_stderr(Duplicate::Warn)
                    .write_mode(WriteMode::BufferAndFlush)
                    .start()
            })
            .map_err(|e| EngineError::Error(format!("Failed to start logging: {}", e)))
    }

    fn serve(engine: Engine, config: &Config) -> Result<(), EngineError> {
        let period = Duration::from_secs(config.replacement.sweep_interval_secs);
        info!("Starting replacement sweep every {}s", period.as_secs());

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| EngineError::Error(format!("Failed to create runtime: {}", e)))?;

        let engine = Arc::new(engine);

        rt.block_on(async move {
            println!("recunlock sweeping every {} seconds (Ctrl+C to stop)", period.as_secs());
            let mut interval = tokio::time::interval(period);
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let engine = Arc::clone(&engine);
                        let sweep = tokio::task::spawn_blocking(move || {
                            engine.run_replacement_sweep(Engine::now())
                        })
                        .await;

                        match sweep {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!("Replacement sweep error: {}", e),
                            Err(e) => error!("Replacement sweep task failed: {}", e),
                        }
                    }
                    _ = &mut shutdown => {
                        info!("Replacement sweeper shutting down");
                        println!("recunlock stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn read_recommendations(path: &Path) -> Result<Vec<NewRecommendation>, EngineError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| {
        EngineError::Error(format!(
            "Failed to parse recommendations from {}: {}",
            path.display(),
            e
        ))
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), EngineError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::Error(format!("Failed to serialize output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommendations::Scope;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_no_command_defaults_to_serve() {
        let cli = Cli::try_parse_from(["recunlock"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or(Command::Serve), Command::Serve));
    }

    #[test]
    fn test_global_data_dir() {
        let cli = Cli::try_parse_from(["recunlock", "unlock", "--scan-id", "4", "--data-dir", "/tmp/x"]).unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(cli.command, Some(Command::Unlock { scan_id: 4 })));
    }

    #[test]
    fn test_validate_arguments() {
        let cli = Cli::try_parse_from(["recunlock", "validate", "--id", "3", "--found", "h1", "--found", "title"])
            .unwrap();
        match cli.command {
            Some(Command::Validate { id, found, findings_file }) => {
                assert_eq!(id, 3);
                assert_eq!(found, vec!["h1".to_string(), "title".to_string()]);
                assert!(findings_file.is_none());
            }
            _ => panic!("expected validate"),
        }

        let both = Cli::try_parse_from([
            "recunlock", "validate", "--id", "3", "--found", "h1", "--findings-file", "f.json",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn test_set_progress_range() {
        assert!(Cli::try_parse_from(["recunlock", "set-progress", "--id", "1", "--percent", "100"]).is_ok());
        assert!(Cli::try_parse_from(["recunlock", "set-progress", "--id", "1", "--percent", "101"]).is_err());
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(Cli::try_parse_from(["recunlock", "nonexistent-command"]).is_err());
        assert!(Cli::try_parse_from(["recunlock", "complete"]).is_err());
    }

    #[test]
    fn test_read_recommendations_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"category": "seo", "recommendation_text": "Add a meta description", "scope": "site_wide"}},
                {{"category": "a11y", "recommendation_text": "Add alt text", "scope": "page_specific",
                  "page_url": "/team", "required_elements": ["img alt"], "batch_number": 2}}
            ]"#
        )
        .unwrap();

        let recs = read_recommendations(file.path()).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].batch_number, 1);
        assert!(recs[0].required_elements.is_empty());
        assert_eq!(recs[1].scope, Scope::PageSpecific);
        assert_eq!(recs[1].page_url.as_deref(), Some("/team"));
    }
}
