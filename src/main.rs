//! cdbdns server
//!
//! Serves the compiled zone database over UDP and TCP on every configured
//! address, reloading it whenever a new generation is published.

use std::io;
use std::sync::Arc;

use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{signal, task, task::JoinSet};

use cdbdns::{
    config::ServerConfig,
    db::Database,
    errors::DnsError,
    handlers::{run_tcp_server, run_udp_server},
};

#[tokio::main]
async fn main() -> Result<(), DnsError> {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    // Load configuration from environment variables
    let config = Arc::new(ServerConfig::from_env()?);

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| DnsError::Config(format!("Failed to start metrics exporter: {}", e)))?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    let db = Arc::new(Database::open(&config.data_path));

    // Pick up new database generations
    let refresh = task::spawn({
        let db = db.clone();
        let every = config.refresh_interval;
        async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = db.reload() {
                    warn!("Reload of {} failed: {}", db.path().display(), e);
                }
            }
        }
    });

    // Set up shutdown signal handler
    let shutdown_signal = async {
        signal::ctrl_c().await.expect("Failed to listen for shutdown signal");
        info!("Shutdown signal received");
    };

    // Start UDP and TCP servers on every address
    let mut servers = JoinSet::new();
    for &addr in &config.bind_addrs {
        servers.spawn(run_udp_server(addr, db.clone(), config.clone()));
        servers.spawn(run_tcp_server(addr, db.clone(), config.clone()));
    }

    // Wait for either a shutdown signal or server error
    let result = tokio::select! {
        _ = shutdown_signal => {
            info!("Initiating graceful shutdown...");
            Ok(())
        },
        Some(res) = servers.join_next() => match res {
            Ok(res) => res,
            Err(e) => Err(DnsError::Io(io::Error::new(io::ErrorKind::Other, e))),
        },
    };

    refresh.abort();
    servers.abort_all();
    result
}
