// ============================================
// File: crates/vpngate-server/src/main.rs
// ============================================
//! # vpngate Entry Point
//!
//! ## Creation Reason
//! Main entry point for the `vpngate` binary. One binary serves every
//! worker role; the process supervisor starts one process per role and
//! instance.
//!
//! ## Main Functionality
//! - CLI argument parsing with clap
//! - Logging initialization with tracing
//! - Configuration loading
//! - Worker execution
//!
//! ## Usage
//! ```bash
//! # One gateway per OpenVPN instance
//! vpngate gateway --instance 1 --service-id 42
//!
//! # Tunnel proxy
//! vpngate proxy --instance 1 --service-id 42
//!
//! # Other commands
//! vpngate register            # Register a service instance, print its id
//! vpngate validate            # Validate config file
//! vpngate subnets             # Show the per-instance address plan
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Gateways need root (tun devices, OpenVPN)
//! - Exit code 1 means the supervisor must restart the worker
//!
//! ## Last Modified
//! v0.3.0 - Gateway, proxy and address plan commands

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vpngate_common::{InstanceId, ServiceId};
use vpngate_server::{ControlPlaneClient, GatewayConfig, GatewayWorker, ProxyWorker};

// ============================================
// CLI Definition
// ============================================

/// Multi-instance OpenVPN gateway
#[derive(Parser, Debug)]
#[command(name = "vpngate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "/etc/vpngate/vpngate.toml")]
    config: PathBuf,

    /// Log level, overrides the configuration file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one OpenVPN instance
    Gateway {
        /// Instance id, 1-based
        #[arg(short, long)]
        instance: InstanceId,

        /// Service instance id; registers a new one if omitted
        #[arg(short, long)]
        service_id: Option<ServiceId>,
    },

    /// Run the tunnel proxy
    Proxy {
        /// Worker id, 1-based
        #[arg(short, long)]
        instance: InstanceId,

        /// Service instance id; registers a new one if omitted
        #[arg(short, long)]
        service_id: Option<ServiceId>,
    },

    /// Register a service instance and print its id
    Register,

    /// Validate configuration file
    Validate,

    /// Show the subnet and ports of every instance
    Subnets,
}

// ============================================
// Main
// ============================================

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    let (config, found) = match load_or_default_config(&cli.config).await {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));
    if !found {
        warn!("Config file {} not found, using defaults", cli.config.display());
    }

    // Execute command
    let result = match cli.command {
        Commands::Gateway { instance, service_id } => {
            cmd_gateway(config, instance, service_id).await
        }
        Commands::Proxy { instance, service_id } => cmd_proxy(config, instance, service_id).await,
        Commands::Register => cmd_register(config).await,
        Commands::Validate => cmd_validate(&config, &cli.config, found),
        Commands::Subnets => cmd_subnets(&config),
    };

    // Handle errors
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

// ============================================
// Commands
// ============================================

/// Runs a gateway worker until drained.
async fn cmd_gateway(
    config: GatewayConfig,
    instance: InstanceId,
    service_id: Option<ServiceId>,
) -> anyhow::Result<()> {
    GatewayWorker::new(config, instance, service_id).run().await?;
    Ok(())
}

/// Runs a proxy worker until signalled.
async fn cmd_proxy(
    config: GatewayConfig,
    instance: InstanceId,
    service_id: Option<ServiceId>,
) -> anyhow::Result<()> {
    ProxyWorker::new(config, instance, service_id).run().await?;
    Ok(())
}

/// Registers a service instance with the control plane.
async fn cmd_register(config: GatewayConfig) -> anyhow::Result<()> {
    let client = ControlPlaneClient::new(config.control_plane)?;
    let service_id = client.register_service().await?;
    println!("{service_id}");
    Ok(())
}

/// Validates configuration file.
fn cmd_validate(config: &GatewayConfig, path: &Path, found: bool) -> anyhow::Result<()> {
    if !found {
        println!("⚠️  Config file not found: {}", path.display());
        println!("   Workers will use default values.");
        return Ok(());
    }

    println!("✅ Configuration is valid");
    println!();
    println!("VPN:");
    println!("   Base subnet:   {}", config.vpn.base_subnet);
    println!("   Instances:     {}", config.vpn.instance_count);
    println!("   Subnet mask:   /{}", config.vpn.subnet_mask());
    println!("   Client auth:   {:?}", config.vpn.client_auth);
    println!();
    println!("Proxy:");
    println!("   Connect port:  {}", config.proxy.connect_port);
    println!("   Forward port:  {}", config.proxy.forward_port);
    println!();
    println!("Drain:");
    println!("   Budget:        {}ms", config.drain.sigterm_timeout_ms);
    println!("   Max delay:     {}ms", config.drain.max_drain_delay_ms);
    println!();
    println!("Control plane:");
    println!("   API:           {}", config.control_plane.base_url());
    println!();

    Ok(())
}

/// Prints the per-instance address plan.
fn cmd_subnets(config: &GatewayConfig) -> anyhow::Result<()> {
    println!(
        "{:<9} {:<18} {:<15} {:<33} {:<6} {:<6}",
        "instance", "subnet", "gateway", "pool", "port", "mgmt"
    );
    for id in 1..=config.vpn.instance_count {
        let instance = InstanceId::new(id)?;
        let subnet = config.vpn.instance_subnet(instance)?;
        let pool = format!("{} - {}", subnet.third(), subnet.last());
        println!(
            "{:<9} {:<18} {:<15} {:<33} {:<6} {:<6}",
            instance,
            subnet.as_net().to_string(),
            config.vpn.gateway.unwrap_or_else(|| subnet.first()).to_string(),
            pool,
            config.vpn.vpn_port(instance)?,
            config.vpn.management_port(instance)?,
        );
    }
    Ok(())
}

// ============================================
// Helper Functions
// ============================================

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}

/// Loads config, or the defaults when the file does not exist.
async fn load_or_default_config(path: &Path) -> vpngate_server::Result<(GatewayConfig, bool)> {
    if path.exists() {
        Ok((GatewayConfig::load(path).await?, true))
    } else {
        Ok((GatewayConfig::default(), false))
    }
}
