//! RustCM demo driver.
//!
//! Runs a complete loopback handshake on one device: a listener accepts a
//! connection request, both sides establish, then tear down through
//! TimeWait back to Idle. Every event on the way is logged.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustcm::protocol::{Gid, Lid, PathRecord, ReplyParams, RequestParams, ServiceId};
use rustcm::{CmDevice, CmError, CmEventKind, config::ConfigManager};

/// CLI arguments for RustCM
#[derive(Parser, Debug)]
#[command(name = "rustcm")]
#[command(about = "RustCM - connection manager handshake demo")]
#[command(version)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Service identifier the listener registers and the active side dials
    #[arg(long, default_value_t = 0x0000_000f_f000_0000, help = "Service identifier")]
    pub service_id: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting RustCM v{}", env!("CARGO_PKG_VERSION"));

    let config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Max connection ids: {}", config.cm.max_connection_ids);
        info!("  Event pool size: {}", config.cm.event_pool_size);
        info!("  Default backlog: {}", config.cm.default_backlog);
        info!("  TimeWait period: {:?}", config.timers.timewait_period);
        info!(
            "  Default response timeout: {:?}",
            config.timers.default_response_timeout
        );
        return Ok(());
    }

    let service_id = ServiceId(args.service_id);
    let device = CmDevice::new(config);

    // Passive side: register the service.
    let listener = device.create_id()?;
    device.listen(listener, service_id, 0)?;

    // Active side: dial it over a fixed sample path.
    let path = PathRecord::new(
        Gid::new(0xfe80_0000_0000_0000, 0x0005_ad00_0000_296c),
        Gid::new(0xfe80_0000_0000_0000, 0x0002_c902_0000_2179),
        Lid(0x3e1),
        Lid(0x1f9),
    );
    let active = device.create_id()?;
    let request = RequestParams {
        qp_number: 0xff00,
        starting_psn: 0x7000,
        ..RequestParams::default()
    };
    device.connect(active, &path, service_id, request)?;

    // One event loop drives both sides, the way a single-process CM
    // consumer does. The handshake completes when both identifiers have
    // come back to Idle through TimeWait.
    let mut idle_remaining = 2;
    let mut passive = None;
    let mut failure: Option<CmError> = None;
    while idle_remaining > 0 {
        let event = device.poll_event().await?;
        info!(id = %event.id, state = %event.state, "event: {}", event.kind.name());

        match &event.kind {
            CmEventKind::ReqReceived {
                remote_qpn,
                starting_psn,
                ..
            } => {
                // One connection is all the demo wants; drop the listener
                // and answer on the minted identifier, echoing the
                // initiator's queue pair parameters back.
                device.destroy(listener)?;
                passive = Some(event.id);
                let reply = ReplyParams {
                    qp_number: *remote_qpn,
                    starting_psn: *starting_psn,
                    ..ReplyParams::default()
                };
                device.accept(event.id, reply)?;
            }
            CmEventKind::RepReceived { .. } => {
                device.acknowledge(event.id)?;
            }
            CmEventKind::Established => {
                device.disconnect(event.id, Default::default())?;
            }
            CmEventKind::DreqReceived { .. } => {
                device.disconnect_ack(event.id)?;
            }
            CmEventKind::DrepReceived | CmEventKind::TimeWait => {}
            CmEventKind::Idle => {
                idle_remaining -= 1;
            }
            CmEventKind::RejectReceived { .. } => {
                warn!(id = %event.id, "connection rejected, giving up");
                failure = Some(CmError::PeerRejected);
            }
            CmEventKind::ReqTimeout => {
                warn!(id = %event.id, "connection request timed out, giving up");
                failure = Some(CmError::Timeout);
            }
            CmEventKind::Unhandled { description } => {
                warn!(id = %event.id, "unhandled: {description}");
            }
        }
        device.release_event(event);
        if failure.is_some() {
            break;
        }
    }

    for id in passive.into_iter().chain([active]) {
        if let Err(e) = device.destroy(id) {
            warn!(%id, "cleanup failed: {e}");
        }
    }

    if let Some(e) = failure {
        return Err(e.into());
    }

    info!(
        outstanding_events = device.outstanding_events(),
        "handshake demo complete"
    );
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
