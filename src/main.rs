// SPDX-License-Identifier: MIT

//! Bugwatch CLI
//!
//! `run` drives the detection loop, `web` serves the dashboard; the rest is
//! maintenance tooling around the config file and the detection log.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use bugwatch::area::ImageArea;
use bugwatch::capture::StillCommand;
use bugwatch::classifier::RoboflowClient;
use bugwatch::config::AppConfig;
use bugwatch::db::Database;
use bugwatch::notifier::{Notify, TelegramNotifier};
use bugwatch::orchestrator::Orchestrator;
use bugwatch::{BugwatchError, Result};

/// Bugwatch - field insect detection pipeline
#[derive(Parser, Debug)]
#[command(name = "bugwatch")]
#[command(version = "1.2.0")]
#[command(about = "Field insect-detection camera pipeline", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the capture-classify-notify-persist loop
    Run {
        /// Override the capture interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Run a single cycle and exit (for cron-style deployments)
        #[arg(long)]
        once: bool,
    },

    /// Serve the web dashboard
    Web {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Detection log operations
    Db {
        #[command(subcommand)]
        action: DbCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Initialize directories and a default configuration file
    Init {
        /// Directory to initialize (default: current)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Show detection log statistics
    Stats,

    /// Export the detection log to JSON
    Export {
        /// Output file
        output: PathBuf,
    },

    /// Vacuum the database (reclaim space)
    Vacuum,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show effective configuration (file plus environment overrides)
    Show,

    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Some(Commands::Run { interval, once }) => run_loop(config, interval, once).await,
        Some(Commands::Web { host, port }) => run_web(config, host, port).await,
        Some(Commands::Db { action }) => run_db_command(config, action),
        Some(Commands::Config { action }) => run_config_command(config, action, &cli.config),
        Some(Commands::Init { dir, force }) => run_init(dir, force),
        None => run_loop(config, None, false).await,
    }
}

/// Run the detection loop until interrupted
async fn run_loop(mut config: AppConfig, interval: Option<u64>, once: bool) -> Result<()> {
    if let Some(secs) = interval {
        config.interval_secs = secs;
    }
    config.validate()?;

    info!("Bugwatch starting, camera '{}'", config.camera.name);

    let area = ImageArea::from_config(&config.area);
    area.ensure_dirs()?;

    let db = Database::open(&config.database.path)?;
    info!("Detection log: {}", config.database.path);

    let classifier = RoboflowClient::new(&config.classifier)?;
    let notifier = TelegramNotifier::from_config(&config.notifier)?
        .map(|n| Box::new(n) as Box<dyn Notify>);
    if notifier.is_none() {
        warn!("Telegram not configured, notifications disabled");
    }
    let capture = StillCommand::new(&config.camera);

    let orchestrator = Orchestrator::new(
        config,
        area,
        db,
        Box::new(capture),
        Box::new(classifier),
        notifier,
    );

    if once {
        orchestrator.run_cycle().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(shutdown_rx).await
}

/// Block until Ctrl+C or SIGTERM
async fn wait_for_stop_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

/// Run the dashboard server
async fn run_web(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.web.host = host;
    }
    if let Some(port) = port {
        config.web.port = port;
    }

    let db = Database::open(&config.database.path)?;
    let area = ImageArea::from_config(&config.area);

    bugwatch::web::start_server(config, db, area).await
}

/// Detection log maintenance
fn run_db_command(config: AppConfig, action: DbCommands) -> Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        DbCommands::Stats => {
            let stats = db.stats()?;
            println!("Detection log statistics:");
            println!("  Records: {}", stats.total);
            println!("  With detection: {}", stats.detected);
            println!("  Notified: {}", stats.notified);
            for (label, count) in db.label_counts()? {
                println!("    {}: {}", label, count);
            }
        }
        DbCommands::Export { output } => {
            let records = db.export_all()?;
            let json = serde_json::to_string_pretty(&records)?;
            std::fs::write(&output, json)?;
            println!("Exported {} records to {:?}", records.len(), output);
        }
        DbCommands::Vacuum => {
            db.vacuum()?;
            println!("Database vacuumed successfully");
        }
    }

    Ok(())
}

/// Configuration tooling
fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &PathBuf) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        ConfigCommands::Generate { output } => {
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            config.validate()?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Camera: {}", config.camera.name);
            println!("  Inbox: {}", config.area.inbox);
            println!("  Interval: {}s", config.interval_secs);
            println!("  Database: {}", config.database.path);
        }
    }

    Ok(())
}

/// Scaffold directories plus a default config.json
fn run_init(dir: Option<PathBuf>, force: bool) -> Result<()> {
    let target = dir.unwrap_or_else(|| PathBuf::from("."));
    let config_path = target.join("config.json");

    if config_path.exists() && !force {
        return Err(BugwatchError::Config(
            "config.json already exists. Use --force to overwrite".to_string(),
        ));
    }

    std::fs::create_dir_all(&target)?;

    let mut config = AppConfig::default();
    config.area.inbox = target.join("fotos_cam/inbox").to_string_lossy().to_string();
    config.area.detected = target.join("fotos_cam/detected").to_string_lossy().to_string();
    config.area.undetected = target.join("fotos_cam/undetected").to_string_lossy().to_string();
    config.database.path = target.join("app.db").to_string_lossy().to_string();

    ImageArea::from_config(&config.area).ensure_dirs()?;
    config.save(&config_path)?;

    println!("Bugwatch initialized in {:?}", target);
    println!("\nCreated:");
    println!("  - config.json");
    println!("  - fotos_cam/inbox, fotos_cam/detected, fotos_cam/undetected");
    println!("\nNext steps:");
    println!("  1. Export CLASSIFIER_API_KEY (and TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID)");
    println!("  2. Start the loop: bugwatch run");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_without_subcommand() {
        let cli = Cli::try_parse_from(["bugwatch"]).unwrap();
        assert!(!cli.verbose);
        assert!(cli.command.is_none());
    }

    #[test]
    fn cli_run_command() {
        let cli = Cli::try_parse_from(["bugwatch", "run", "--interval", "10", "--once"]).unwrap();
        match cli.command {
            Some(Commands::Run { interval, once }) => {
                assert_eq!(interval, Some(10));
                assert!(once);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn cli_web_command() {
        let cli = Cli::try_parse_from(["bugwatch", "web", "--port", "9000"]).unwrap();
        match cli.command {
            Some(Commands::Web { port, .. }) => assert_eq!(port, Some(9000)),
            _ => panic!("Expected Web command"),
        }
    }
}
