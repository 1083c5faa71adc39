use std::ops::Range;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use libairpnp::{BridgeServer, BridgeServerOptions, resolve_interface};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(version, author, about = "AirPlay to UPnP MediaRenderer bridge")]
struct Opts {
    /// The console loglevel
    #[arg(value_enum, short = 'v', env = "AIRPNP_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Network interface to bind discovery and the AirPlay listeners to.
    /// Defaults to the first non-loopback interface with an IPv4 address.
    #[arg(long = "interface", env = "AIRPNP_INTERFACE")]
    interface: Option<String>,

    /// First TCP port used for per-renderer AirPlay listeners.
    #[arg(
        long = "port-range-start",
        default_value = "22555",
        env = "AIRPNP_PORT_RANGE_START"
    )]
    port_range_start: u16,

    /// How many listener ports to reserve; bounds the number of renderers
    /// bridged at once.
    #[arg(
        long = "port-range-size",
        default_value = "16",
        env = "AIRPNP_PORT_RANGE_SIZE"
    )]
    port_range_size: u16,

    /// Use tokio's single threaded runtime.
    #[arg(short, long, env = "AIRPNP_SINGLE_THREAD_RUNTIME")]
    single_thread_runtime: bool,
}

fn init_logging(opts: &Opts) {
    let default_level = opts.log_level.map(LogLevel::as_str).unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(&opts);

    let mut builder = if opts.single_thread_runtime {
        tokio::runtime::Builder::new_current_thread()
    } else {
        tokio::runtime::Builder::new_multi_thread()
    };
    let rt = builder
        .enable_all()
        .build()
        .context("error building tokio runtime")?;
    rt.block_on(async_main(opts))
}

async fn async_main(opts: Opts) -> anyhow::Result<()> {
    let config = resolve_interface(opts.interface.as_deref())?;
    info!(
        interface = %config.interface_name,
        ip = %config.interface_ip,
        "using interface"
    );

    let port_range: Range<u16> = opts.port_range_start
        ..opts
            .port_range_start
            .saturating_add(opts.port_range_size);
    let bridge = BridgeServer::new(BridgeServerOptions { config, port_range })?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("error waiting for Ctrl-C: {e:#}");
            }
            info!("shutting down");
            shutdown.cancel();
        }
    });

    bridge.run_forever(shutdown).await
}
