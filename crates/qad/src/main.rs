//! qad - QA dashboard daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use qa_core::Config;
use qad::Daemon;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "qad", about = "QA dashboard daemon", version)]
struct Cli {
    /// Config file (key=value), applied over `<data_dir>/config`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind_addr: Option<IpAddr>,

    /// Directory for the database and implicit config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Working directory of test processes
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Test file tree (relative paths resolve against the workspace root)
    #[arg(long)]
    tests_dir: Option<PathBuf>,

    /// Bearer token required by the API
    #[arg(long, env = "QAD_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

impl Cli {
    /// Effective config: defaults < `<data_dir>/config` < `--config` < flags.
    fn load_config(&self) -> Result<Config, qa_core::config::ConfigError> {
        let mut config = Config::load(self.data_dir.as_deref(), self.config.as_deref())?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = self.bind_addr {
            config.bind_addr = addr;
        }
        if let Some(root) = &self.workspace_root {
            config.workspace_root.clone_from(root);
        }
        if let Some(dir) = &self.tests_dir {
            config.tests_dir.clone_from(dir);
        }
        if let Some(token) = &self.auth_token {
            config.auth_token = Some(token.clone());
        }
        config.resolve_paths();
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Run the async main.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let result = runtime.block_on(async {
        let daemon = Daemon::new(config).await?;
        let run = daemon.run();
        tokio::pin!(run);

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

            tokio::select! {
                result = &mut run => return result,
                _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = &mut run => return result,
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, initiating graceful shutdown");
                }
            }
        }

        daemon.shutdown();
        run.await
    });

    if let Err(e) = result {
        error!("daemon error: {}", e);
        std::process::exit(1);
    }
}

