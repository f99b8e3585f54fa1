//! Emberlink Daemon
//!
//! Device-facing service for cloud-to-device messaging and OTA updates.

use std::path::PathBuf;

use clap::Parser;
use daemon::config::Config;
use daemon::server::DeviceServer;

/// Emberlink Daemon - device-facing messaging and firmware updates.
#[derive(Parser, Debug)]
#[command(name = "emberlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides configuration)
    #[arg(short, long, value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Data directory for key material (overrides configuration)
    #[arg(short, long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Append logs to a file instead of stderr
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(data_dir) = cli.data_dir {
        config.daemon.data_dir = data_dir;
    }
    config.validate()?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    // The non-blocking writer guard must outlive the runtime.
    let _log_guard = match cli.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let file = path.file_name().unwrap_or(std::ffi::OsStr::new("emberlink.log"));
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    tracing::info!("emberlink daemon starting");

    let server = DeviceServer::from_config(&config)?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    server.run(&config.server.listen_addr).await?;
    tracing::info!("emberlink daemon stopped");
    Ok(())
}
