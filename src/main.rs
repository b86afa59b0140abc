// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:    Configuration structs loaded from JSON
// - error:     Typed errors at module seams
// - schema:    Source payloads, combined record, delivery envelope
// - util:      Time and hex decoding helpers
// - http:      Shared bounded HTTP pool
// - sources:   Upstream API clients and source registry
// - sink:      Envelope building and downstream producers
// - collector: Orchestrator and the collection loop
// - quality:   In-process data quality checks
// - metrics:   Process-wide counters
//
mod config;
mod error;
mod schema;
mod util;
mod http;
mod sources;
mod sink;
mod collector;
mod quality;
mod metrics;
// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use rustls::crypto::{CryptoProvider, ring};

use collector::orchestrator::Orchestrator;
use collector::runner::{CollectionLoop, LoopTiming, TickOutcome};
use config::{Config, RunMode};
use http::HttpPool;
use metrics::METRICS;
use quality::QualityMonitor;
use sink::envelope::EnvelopeBuilder;
use sink::DeliveryAdapter;

use std::process::ExitCode;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_CONFIG_PATH: &str = "config.json";
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging and the cryptography backend (rustls)
// - Load and validate configuration (the only fatal stage)
// - Acquire the HTTP pool and the sink producer
// - Run the collection loop (continuous) or a single cycle (once)
// - Release the producer on shutdown
//
#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation before the first TLS connection (reqwest,
    // tokio-tungstenite).
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    // --------------------------------------------------------
    // Load configuration
    //
    // Path: first CLI argument, else $ETH_COLLECTOR_CONFIG,
    // else ./config.json. API keys may come from the
    // environment instead of the file.
    // --------------------------------------------------------
    let path = config_path();
    let config = Config::load(&path)?;
    log::info!(
        "Loaded {} ({} sources, sink={}, interval={}s)",
        path,
        config.collection.sources.len(),
        config.sink.kind.name(),
        config.collection.interval_seconds
    );

    // --------------------------------------------------------
    // Process-scoped resources
    // --------------------------------------------------------
    let http = HttpPool::new(&config.http)?;
    let sources = sources::build_sources(&config)?;
    let producer = sink::build_producer(
        &config.sink,
        Duration::from_secs(config.http.timeout_seconds),
    )?;

    let orchestrator = Orchestrator::new(sources, http);
    let adapter = DeliveryAdapter::new(
        producer.clone(),
        EnvelopeBuilder::new(config.sink.envelope_mode, config.sink.partitions),
        config.log_payloads(),
    );

    let timing = LoopTiming {
        interval: Duration::from_secs(config.collection.interval_seconds),
        backoff: Duration::from_secs(config.collection.backoff_seconds),
    };
    let mut collection = CollectionLoop::new(orchestrator, adapter, timing);
    if config.quality.every_cycles > 0 {
        collection = collection.with_quality(QualityMonitor::new(config.quality.clone()));
    }

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    tokio::spawn(async {
        loop {
            sleep(METRICS_INTERVAL).await;
            log::info!("[METRICS] {}", METRICS.summary());
        }
    });

    let code = match config.collection.mode {
        RunMode::Once => match collection.tick().await {
            TickOutcome::Delivered { .. } => ExitCode::SUCCESS,
            TickOutcome::Failed { stage, error } => {
                log::error!("Single cycle failed during {}: {}", stage, error);
                ExitCode::FAILURE
            }
        },
        RunMode::Continuous => {
            tokio::select! {
                _ = collection.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutdown requested");
                }
            }
            ExitCode::SUCCESS
        }
    };

    if let Err(e) = producer.close().await {
        log::warn!("Failed to close {} producer: {:#}", producer.name(), e);
    }
    log::info!("[METRICS] {}", METRICS.summary());

    Ok(code)
}

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ETH_COLLECTOR_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}
