//! Periscope CLI
//!
//! Runs a transparent HTTP reverse proxy in front of a backend and streams
//! every proxied exchange to monitor clients over WebSocket.

use clap::Parser;
use periscope_core::config::defaults;
use periscope_core::{AppConfig, AppError, TrafficBus};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod console;
mod http_proxy;
mod monitor;

use console::PrintFormat;
use http_proxy::HttpProxyState;
use monitor::MonitorState;

/// Periscope - watch live HTTP traffic between clients and a backend
///
/// Point clients at the proxy port and open the monitor port in a browser.
#[derive(Parser, Debug)]
#[command(name = "periscope")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port for the monitor UI and event stream
    #[arg(short, long, env = "PERISCOPE_MONITOR_PORT", default_value_t = defaults::DEFAULT_MONITOR_PORT)]
    monitor_port: u16,

    /// Port clients send proxied traffic to
    #[arg(short, long, env = "PERISCOPE_PROXY_PORT", default_value_t = defaults::DEFAULT_PROXY_PORT)]
    proxy_port: u16,

    /// Backend base URL
    #[arg(short, long, env = "PERISCOPE_TARGET", default_value = defaults::DEFAULT_TARGET)]
    target: String,

    /// Directory holding the monitor UI
    #[arg(long, env = "PERISCOPE_STATIC_DIR", default_value = defaults::DEFAULT_STATIC_DIR)]
    static_dir: PathBuf,

    /// Interface both listeners bind to
    #[arg(long, env = "PERISCOPE_BIND", default_value = defaults::DEFAULT_BIND_ADDR)]
    bind: String,

    /// Give up on a backend exchange after this many seconds
    #[arg(long, env = "PERISCOPE_UPSTREAM_TIMEOUT_SECS", default_value_t = defaults::DEFAULT_UPSTREAM_TIMEOUT_SECS)]
    upstream_timeout_secs: u64,

    /// Bytes of each body kept for monitoring
    #[arg(long, env = "PERISCOPE_MAX_BODY_BYTES", default_value_t = defaults::DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Events queued per monitor client before the oldest are dropped
    #[arg(long, env = "PERISCOPE_SUBSCRIBER_BUFFER", default_value_t = defaults::DEFAULT_SUBSCRIBER_BUFFER)]
    subscriber_buffer: usize,

    /// Origin allowed to connect to the monitor (repeatable; default allows any)
    #[arg(long = "allowed-origin", env = "PERISCOPE_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Also print traffic to stdout
    #[arg(long, env = "PERISCOPE_PRINT", value_enum, default_value = "none")]
    print: PrintFormat,
}

impl Args {
    fn into_config(self) -> (AppConfig, PrintFormat) {
        let config = AppConfig {
            monitor_port: self.monitor_port,
            proxy_port: self.proxy_port,
            target: self.target,
            bind_addr: self.bind,
            static_dir: self.static_dir,
            upstream_timeout_secs: self.upstream_timeout_secs,
            max_body_bytes: self.max_body_bytes,
            subscriber_buffer: self.subscriber_buffer,
            allowed_origins: self.allowed_origins,
        };
        (config, self.print)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let (config, print) = Args::parse().into_config();

    match run(config, print).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn bind(addr: String) -> periscope_core::Result<TcpListener> {
    TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::BindFailed {
            addr,
            reason: e.to_string(),
        })
}

async fn run(config: AppConfig, print: PrintFormat) -> periscope_core::Result<()> {
    config.validate()?;

    let bus = Arc::new(TrafficBus::new(config.subscriber_buffer));
    let proxy_state = HttpProxyState::new(&config, bus.clone())?;
    let monitor_state = MonitorState::new(&config, bus.clone());

    let proxy_listener = bind(config.proxy_addr()).await?;
    let monitor_listener = bind(config.monitor_addr()).await?;

    tracing::info!(
        "Forwarding {} -> {}, monitor on {}",
        config.proxy_addr(),
        config.target_base(),
        config.monitor_addr()
    );

    if print != PrintFormat::None {
        let subscription = bus.subscribe().await;
        tokio::spawn(console::print_events(subscription, print));
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown = |tx: &broadcast::Sender<()>| {
        let mut rx = tx.subscribe();
        async move {
            let _ = rx.recv().await;
        }
    };

    let mut proxy = tokio::spawn(http_proxy::run_http_proxy(
        proxy_listener,
        proxy_state,
        shutdown(&shutdown_tx),
    ));
    let mut monitor = tokio::spawn(monitor::run_monitor(
        monitor_listener,
        monitor_state,
        shutdown(&shutdown_tx),
    ));

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutting down");
            None
        }
        result = &mut proxy => Some(("proxy", result)),
        result = &mut monitor => Some(("monitor", result)),
    };

    let _ = shutdown_tx.send(());
    // Releases subscribers so their connections can drain and close
    bus.close().await;

    if let Some((name, result)) = early_exit {
        return match result {
            Ok(Ok(())) => Err(AppError::ServerError(format!("{name} server stopped"))),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(AppError::ServerError(format!("{name} task failed: {e}"))),
        };
    }

    for (name, handle) in [("proxy", proxy), ("monitor", monitor)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("{} server ended with error: {}", name, e),
            Err(e) => tracing::warn!("{} task failed: {}", name, e),
        }
    }
    Ok(())
}
