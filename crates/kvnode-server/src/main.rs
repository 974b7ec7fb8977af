mod bootstrap;
mod config;
mod mutation_log;

use clap::Parser;
use config::ServerConfig;
use kvnode_ingress::Listener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// kvnode - multi-tenant key-value storage node
#[derive(Parser)]
#[command(name = "kvnode-server")]
#[command(about = "Key-value storage node speaking the memcached binary protocol", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, value_name = "FILE", env = "KVNODE_CONFIG")]
    config: Option<String>,

    /// Listen address, e.g. `:11211` or `127.0.0.1:11211`
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Data directory holding the bucket directories
    #[arg(long, value_name = "DIR")]
    data: Option<String>,

    /// Bucket selected for new connections (empty for none)
    #[arg(long, value_name = "NAME")]
    default_bucket_name: Option<String>,

    /// Partition count for newly created buckets
    #[arg(long, value_name = "N")]
    default_num_partitions: Option<u32>,

    /// Flush interval in seconds
    #[arg(long, value_name = "SECS")]
    flush_interval: Option<u64>,

    /// Sleep interval in seconds for newly created buckets
    #[arg(long, value_name = "SECS")]
    sleep_interval: Option<u64>,

    /// Compaction interval in seconds
    #[arg(long, value_name = "SECS")]
    compact_interval: Option<u64>,

    /// Purge timeout in seconds for newly created buckets
    #[arg(long, value_name = "SECS")]
    purge_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Apply CLI overrides (highest precedence)
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(data) = &self.data {
            config.data = data.clone();
        }
        if let Some(name) = &self.default_bucket_name {
            config.default_bucket_name = name.clone();
        }
        if let Some(n) = self.default_num_partitions {
            config.default_num_partitions = n;
        }
        if let Some(secs) = self.flush_interval {
            config.flush_interval_secs = secs;
        }
        if let Some(secs) = self.sleep_interval {
            config.sleep_interval_secs = secs;
        }
        if let Some(secs) = self.compact_interval {
            config.compact_interval_secs = secs;
        }
        if let Some(secs) = self.purge_timeout {
            config.purge_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.merge_env();
    cli.apply(&mut config);
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("🚀 Starting kvnode {}", env!("CARGO_PKG_VERSION"));
    match &cli.config {
        Some(path) => info!("📁 Loaded configuration from: {}", path),
        None => info!("📁 Using default configuration"),
    }
    info!(
        "   flush={}s sleep={}s compact={}s purge={}s",
        config.flush_interval_secs,
        config.sleep_interval_secs,
        config.compact_interval_secs,
        config.purge_timeout_secs
    );

    let (mutation_sink, mutation_logger) = mutation_log::spawn_mutation_logger();
    let buckets = bootstrap::bootstrap(&config, Some(mutation_sink)).await?;

    let listener = Listener::bind(
        config.bind_addr(),
        buckets.clone(),
        config.default_bucket().map(str::to_string),
    )
    .await?;
    info!("✅ kvnode listening on {}", listener.local_addr()?);
    info!("   Data directory: {}", config.data_dir().display());
    info!("   Buckets: {:?}", buckets.names().await);

    listener.serve(shutdown_signal()).await?;

    drop(buckets);
    mutation_logger.abort();
    info!("Server stopped");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
