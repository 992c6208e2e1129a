//! rlproxy: a rate-limited TCP relay
//!
//! Every client connecting to one of the bind addresses is relayed to a
//! single upstream. Features:
//! - Token bucket limit on client-to-upstream traffic, shared or per client
//! - splice(2) zero-copy forwarding on Linux, buffered copy elsewhere
//! - Half-close aware relaying
//! - Graceful shutdown on SIGINT/SIGTERM that lets in-flight sessions finish,
//!   bounded by a drain timeout; a second signal stops waiting
//! - Configuration via CLI arguments or TOML file

mod config;
mod limiter;
mod server;
mod session;
mod shutdown;
mod telemetry;
mod transfer;

use config::{Config, LogFormat};
use server::Server;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    setup_tracing(&config);

    info!(
        instance = config.name.as_deref().unwrap_or(""),
        addrs = ?config.addrs,
        upstream = %config.upstream,
        rate = config.rate,
        burst = config.burst,
        per_client = config.per_client,
        splice = config.splice,
        buf_size = ?config.buf_size,
        "Starting rlproxy"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let span = match config.name.as_deref() {
        Some(name) => info_span!("rlproxy", instance = name),
        None => info_span!("rlproxy"),
    };
    runtime.block_on(run(config).instrument(span))?;
    Ok(())
}

fn setup_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let console: Option<Box<dyn Layer<Registry> + Send + Sync>> = config.log_console.then(|| {
        let writer = if config.log_stderr {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            BoxMakeWriter::new(std::io::stdout)
        };
        let layer = fmt::layer().with_target(false).with_writer(writer);
        match config.log_format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Full => layer.boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
        }
    });

    tracing_subscriber::registry().with(console).with(filter).init();
}

async fn run(config: Config) -> std::io::Result<()> {
    let server = Server::bind(&config).await?;
    let coordinator = server.coordinator();

    if let Some(interval) = config.telemetry_interval {
        tokio::spawn(
            telemetry::report_task(server.counter(), interval, coordinator.subscribe())
                .in_current_span(),
        );
    }

    tokio::spawn(shutdown::handle_signals(Arc::clone(&coordinator)).in_current_span());

    // Accept until the signal; a fatal accept error ends the process here.
    server.serve().await?;
    coordinator.finish();

    if config.wait_for_sessions {
        coordinator.drain_sessions(config.drain_timeout).await;
    } else {
        let active = coordinator.sessions().active();
        if active > 0 {
            info!(active, "Exiting without waiting for sessions");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
