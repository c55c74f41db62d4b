use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ksync_api::Manager;
use ksync_core::WatchOptions;
use ksync_informer::{InformerPool, PoolConfig};
use ksync_kubehub::{ConfigLoader, KubeWatchProvider, KubeconfigLoader};
use ksync_push::{DeltaPusher, PusherOptions};
use ksync_store::CalculatorOptions;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod sink;

use sink::StdoutSink;

#[derive(Parser, Debug)]
#[command(name = "ksync", version, about = "Keep a live, batched view of Kubernetes resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig path (default: $KUBECONFIG or ~/.kube/config)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List kubeconfig contexts
    Contexts,
    /// Check that a context's API server answers
    Validate {
        context: String,
    },
    /// Watch resource types and print delta batches as JSON lines until Ctrl-C
    Watch {
        /// Context to watch (default: current context)
        #[arg(long = "context")]
        context: Option<String>,
        /// Comma separated resource types, e.g. "Pod,Node,deployments"
        #[arg(long = "types", value_delimiter = ',', default_value = "Pod")]
        types: Vec<String>,
        /// Namespace (default: all namespaces)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Label selector
        #[arg(short = 'l', long = "selector")]
        label_selector: Option<String>,
        /// Field selector
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
        /// Reconnect and relist after this many seconds
        #[arg(long = "resync-secs")]
        resync_secs: Option<u64>,
        /// Throttle window in ms (overrides KSYNC_THROTTLE_MS)
        #[arg(long = "throttle-ms")]
        throttle_ms: Option<u64>,
        /// Max deltas per batch (overrides KSYNC_MAX_BATCH)
        #[arg(long = "max-batch")]
        max_batch: Option<usize>,
    },
}

/// Logs go to stderr; stdout carries batches.
fn init_tracing() {
    let filter = std::env::var("KSYNC_LOG")
        .ok()
        .and_then(|v| EnvFilter::from_str(&v).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Prometheus endpoint, only when KSYNC_METRICS_ADDR is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("KSYNC_METRICS_ADDR") else {
        return;
    };
    let sock: SocketAddr = match addr.parse() {
        Ok(s) => s,
        Err(e) => {
            warn!(addr = %addr, error = %e, "metrics: KSYNC_METRICS_ADDR is not host:port");
            return;
        }
    };
    match PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "metrics: exporter listening"),
        Err(e) => warn!(addr = %sock, error = %e, "metrics: exporter not installed"),
    }
}

fn loader(path: Option<PathBuf>) -> Arc<KubeconfigLoader> {
    Arc::new(match path {
        Some(p) => KubeconfigLoader::from_path(p),
        None => KubeconfigLoader::new(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let loader = loader(cli.kubeconfig.clone());
    let provider = Arc::new(KubeWatchProvider::new(loader.clone() as Arc<dyn ConfigLoader>));
    let pool = Arc::new(InformerPool::new(provider, PoolConfig::from_env()));
    let manager = Manager::new(loader, pool.clone());

    match cli.command {
        Commands::Contexts => {
            let contexts = manager.initialize()?;
            match cli.output {
                Output::Human => {
                    println!("CURRENT   NAME                           CLUSTER                        NAMESPACE");
                    for c in contexts {
                        let mark = if c.is_current { "*" } else { "" };
                        let ns = c.namespace.unwrap_or_default();
                        println!("{:<9} {:<30} {:<30} {}", mark, c.name, c.cluster, ns);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&contexts)?),
            }
        }
        Commands::Validate { context } => {
            manager.initialize()?;
            let ok = manager.validate_context(&context).await;
            match cli.output {
                Output::Human => println!("{}: {}", context, if ok { "reachable" } else { "unreachable" }),
                Output::Json => println!("{}", serde_json::json!({ "context": context, "valid": ok })),
            }
            if !ok {
                std::process::exit(2);
            }
        }
        Commands::Watch {
            context,
            types,
            namespace,
            label_selector,
            field_selector,
            resync_secs,
            throttle_ms,
            max_batch,
        } => {
            manager.initialize()?;
            let context = context
                .or_else(|| manager.get_current_context())
                .ok_or_else(|| anyhow!("no --context given and kubeconfig has no current context"))?;

            let mut options = PusherOptions::from_env();
            options.calculator = CalculatorOptions::new(
                throttle_ms.map(Duration::from_millis).unwrap_or(options.calculator.throttle_window),
                max_batch.unwrap_or(options.calculator.max_batch_size),
            );
            let pusher = DeltaPusher::new(pool.clone(), options);
            pusher.set_main_window(Some(Arc::new(StdoutSink::new())));

            let watch = WatchOptions {
                context_name: context.clone(),
                namespace,
                label_selector,
                field_selector,
                resync_period_secs: resync_secs,
            };
            let report = manager.start_watching(&context, &types, Some(watch)).await;
            for (t, err) in &report.failed {
                eprintln!("{}: {}", t, err);
            }
            if report.started.is_empty() {
                pusher.destroy();
                manager.cleanup();
                return Err(anyhow!("no resource type could be watched in {}", context));
            }
            info!(context = %context, types = ?report.started, "watching; Ctrl-C to stop");

            signal::ctrl_c().await?;
            info!("shutting down");
            pusher.flush_all();
            match cli.output {
                Output::Human => {
                    let s = manager.get_informer_statistics();
                    eprintln!(
                        "informers: {} ({} running) • resources: {} • errors: {}",
                        s.total_informers, s.running_informers, s.total_resources, s.total_errors
                    );
                    for (key, c) in pusher.get_statistics().calculators {
                        eprintln!(
                            "{}: cached={} changes={} pending={}",
                            key, c.cached_resources, c.total_changes_processed, c.pending_deltas
                        );
                    }
                }
                Output::Json => {
                    let stats = serde_json::json!({
                        "informers": manager.get_informer_statistics(),
                        "pusher": pusher.get_statistics(),
                    });
                    eprintln!("{}", serde_json::to_string_pretty(&stats)?)
                }
            }
            pusher.destroy();
            manager.cleanup();
        }
    }
    Ok(())
}
