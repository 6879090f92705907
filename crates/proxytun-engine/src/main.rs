// ============================================
// File: crates/proxytun-engine/src/main.rs
// ============================================
//! # proxytun Entry Point
//!
//! ## Creation Reason
//! Command line front end for the tunnel engine: loads the TOML config,
//! creates the TUN device, and runs the engine until Ctrl+C or a fatal
//! device error.
//!
//! ## Usage
//! ```bash
//! proxytun start --config /etc/proxytun/config.toml
//! proxytun validate --config ./config.toml
//! proxytun show-config --config ./config.toml   # password redacted
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `start` needs root or `CAP_NET_ADMIN`
//! - Log level comes from `[logging] level`; `RUST_LOG` overrides it
//! - Exit code is 1 on any error, including a fatal engine stop
//!
//! ## Last Modified
//! v0.1.0 - Initial CLI implementation

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use proxytun_engine::{EngineConfig, TunnelEngine};

const DEFAULT_CONFIG_PATH: &str = "/etc/proxytun/config.toml";

// ============================================
// CLI Definition
// ============================================

/// Transparent proxy tunnel
///
/// Routes all IP traffic through one HTTP CONNECT or SOCKS5 proxy.
#[derive(Parser, Debug)]
#[command(name = "proxytun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the tunnel
    Start {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Print the effective configuration (credentials redacted)
    ShowConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

// ============================================
// Main
// ============================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start { config } => cmd_start(&config).await,
        Commands::Validate { config } => {
            init_logging("info");
            cmd_validate(&config).await
        }
        Commands::ShowConfig { config } => {
            init_logging("warn");
            cmd_show_config(&config).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

// ============================================
// Commands
// ============================================

/// Runs the engine until Ctrl+C or a fatal stop.
async fn cmd_start(config_path: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(config_path).await.map_err(|e| {
        anyhow::anyhow!("failed to read {}: {e}", config_path.display())
    })?;
    let config = EngineConfig::from_str(&content)?;

    init_logging(&config.logging.level);
    info!(path = %config_path.display(), proxy = %config.proxy, "Starting proxytun");

    if config.proxy.socket_mark.is_none() {
        warn!("proxy.socket_mark is not set; proxy traffic may route back into the tunnel");
    }

    let device = create_device(&config).await?;
    let engine = TunnelEngine::new();
    engine.start(config, device).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, shutting down"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
            }
        }
        () = engine.wait_stopped() => {}
    }

    engine.stop().await?;

    if let Some(fatal) = engine.fatal_error() {
        return Err(fatal.into());
    }

    info!("proxytun shutdown complete");
    Ok(())
}

#[cfg(target_os = "linux")]
async fn create_device(config: &EngineConfig) -> anyhow::Result<std::sync::Arc<dyn proxytun_transport::TunDevice>> {
    let tun = proxytun_transport::LinuxTun::create(config.tun.to_tun_config()).await?;
    Ok(std::sync::Arc::new(tun))
}

#[cfg(not(target_os = "linux"))]
async fn create_device(_config: &EngineConfig) -> anyhow::Result<std::sync::Arc<dyn proxytun_transport::TunDevice>> {
    anyhow::bail!("TUN devices are only supported on Linux")
}

/// Validates the configuration file and prints a summary.
async fn cmd_validate(config_path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path).await?;

    println!("✅ Configuration is valid");
    println!();
    println!("Proxy:");
    println!("   Upstream:   {}", config.proxy);
    println!("   Auth:       {}", if config.proxy.credentials().is_some() { "username/password" } else { "none" });
    println!("   Timeout:    {}s", config.proxy.connect_timeout_secs);
    println!();
    println!("TUN:");
    println!("   Device:     {}", config.tun.device_name);
    println!("   Address:    {}/{}", config.tun.address, config.tun.prefix_len);
    println!("   MTU:        {}", config.tun.mtu);
    println!();
    println!("Limits:");
    println!("   Max Flows:        {}", config.limits.max_flows);
    println!("   TCP Idle Timeout: {}s", config.limits.tcp_idle_timeout_secs);
    println!("   UDP Idle Timeout: {}s", config.limits.udp_idle_timeout_secs);
    println!();

    Ok(())
}

/// Prints the effective configuration as TOML.
async fn cmd_show_config(config_path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path).await?;
    print!("{}", config.to_toml());
    Ok(())
}

// ============================================
// Helpers
// ============================================

/// Initializes logging; `RUST_LOG` takes precedence over `level`.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}
