//! tally — live billing view of cluster training jobs.
//!
//! Wires the pod/job watchers into the aggregation cache and serves
//! the read side over HTTP. State is purely in-memory; each start
//! rebuilds the view from a full relist.

#![forbid(unsafe_code)]

mod routes;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use kube::Client;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tally_cache::{spawn_ingest, AggregationCache};
use tally_kubehub::BillingEvent;

#[derive(Parser, Debug, PartialEq)]
#[command(name = "tally", version, about = "Live billing view of cluster training jobs")]
struct Args {
    /// Address the HTTP read side listens on.
    #[arg(long = "listen", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Limit the watch to one namespace (default: all namespaces).
    #[arg(long = "ns")]
    namespace: Option<String>,

    /// Seconds between published snapshots.
    #[arg(long = "snapshot-period", default_value_t = 5)]
    snapshot_period: u64,

    /// Event channel capacity between the watchers and the cache.
    #[arg(long = "channel-capacity", default_value_t = 1024)]
    channel_capacity: usize,
}

fn init_tracing() {
    let env = std::env::var("TALLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TALLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TALLY_METRICS_ADDR; expected host:port");
        }
    }
}

fn spawn_pod_watcher(client: Client, namespace: Option<String>, tx: mpsc::Sender<BillingEvent>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) =
                tally_kubehub::watch_pods(client.clone(), namespace.as_deref(), tx.clone()).await
            {
                warn!(error = ?e, "pod watcher failed; restarting");
            }
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}

fn spawn_job_watcher(client: Client, namespace: Option<String>, tx: mpsc::Sender<BillingEvent>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) =
                tally_kubehub::watch_jobs(client.clone(), namespace.as_deref(), tx.clone()).await
            {
                warn!(error = ?e, "job watcher failed; restarting");
            }
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let args = Args::parse();

    let cache = Arc::new(AggregationCache::new());
    let tx = spawn_ingest(
        Arc::clone(&cache),
        Duration::from_secs(args.snapshot_period.max(1)),
        args.channel_capacity,
    );

    let client = tally_kubehub::client().await?;
    spawn_pod_watcher(client.clone(), args.namespace.clone(), tx.clone());
    spawn_job_watcher(client, args.namespace.clone(), tx.clone());
    drop(tx);

    let app = routes::router(Arc::clone(&cache));
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(addr = %args.listen, "read side listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::try_parse_from(["tally"]).expect("defaults are valid");
        assert_eq!(
            args,
            Args {
                listen: "0.0.0.0:8000".parse().expect("valid addr"),
                namespace: None,
                snapshot_period: 5,
                channel_capacity: 1024,
            }
        );
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "tally",
            "--listen",
            "127.0.0.1:9000",
            "--ns",
            "ml",
            "--snapshot-period",
            "30",
        ])
        .expect("valid flags");
        assert_eq!(args.listen, "127.0.0.1:9000".parse().expect("valid addr"));
        assert_eq!(args.namespace.as_deref(), Some("ml"));
        assert_eq!(args.snapshot_period, 30);
    }
}
