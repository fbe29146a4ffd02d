use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use device_engine::EngineConfig;
use knee_ingest::{
    load_config, open_store, AnalyticsSink, HttpAnalytics, IngestConfig, LiveEvent, MetricsHub,
    Pipeline, PipelineDeps,
};
use link_transport::{
    FilePortRegistry, LinkDriver, MemoryPortRegistry, MockDriver, PortRegistry, SerialDriver,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Serial,
}

#[derive(Parser, Debug)]
#[command(name = "ingest-daemon")]
#[command(about = "KneeTrack ingestion daemon: sensor link to live events, storage and analytics")]
struct Args {
    /// YAML configuration file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to open; the first listed port is used when omitted
    #[arg(long)]
    port: Option<String>,

    #[arg(long, value_enum, default_value_t = Backend::Serial)]
    backend: Backend,

    /// Overrides the configured baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Start a session with this id once connected
    #[arg(long)]
    session: Option<String>,

    /// Exercise mode for --session
    #[arg(long, default_value_t = 0u8)]
    mode: u8,

    /// Tick period of the simulated sensor (mock backend only)
    #[arg(long, default_value_t = 50u64)]
    sim_tick_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => IngestConfig::default(),
    };
    if let Some(baud) = args.baud {
        config.link.baud_rate = baud;
    }
    info!(backend = ?args.backend, "KneeTrack ingest-daemon starting");

    let driver: Arc<dyn LinkDriver> = match args.backend {
        Backend::Mock => Arc::new(MockDriver::default().with_engine_config(EngineConfig {
            tick_ms: args.sim_tick_ms,
            ..EngineConfig::default()
        })),
        Backend::Serial => Arc::new(SerialDriver::new()),
    };
    let registry: Arc<dyn PortRegistry> = match &config.link.registry_path {
        Some(path) => Arc::new(
            FilePortRegistry::open(path)
                .with_context(|| format!("opening port registry {}", path.display()))?,
        ),
        None => Arc::new(MemoryPortRegistry::new()),
    };
    let store = open_store(&config.store)
        .await
        .context("opening reading store")?;
    let analytics: Option<Arc<dyn AnalyticsSink>> = match &config.analytics.endpoint {
        Some(endpoint) => Some(Arc::new(
            HttpAnalytics::new(
                endpoint,
                Duration::from_millis(config.analytics.timeout_ms),
            )
            .context("building analytics client")?,
        )),
        None => {
            info!("analytics endpoint not configured; forwarding disabled");
            None
        }
    };
    let metrics = MetricsHub::new().context("registering metrics")?;

    let pipeline = Pipeline::launch(
        &config,
        PipelineDeps {
            driver,
            registry,
            store,
            analytics,
            metrics,
        },
    );

    // Log every live event; this stands in for a websocket front end.
    let mut sub = pipeline.subscribe();
    let logger = tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            match &event {
                LiveEvent::KneeData(_) => debug!(event = %to_json(&event), "live"),
                LiveEvent::Error(_) => warn!(event = %to_json(&event), "live"),
                _ => info!(event = %to_json(&event), "live"),
            }
        }
        if sub.skipped() > 0 {
            warn!(skipped = sub.skipped(), "event logger fell behind");
        }
    });

    if config.analytics.endpoint.is_some() && config.analytics.health_interval_s > 0 {
        let p = pipeline.clone();
        let every = Duration::from_secs(config.analytics.health_interval_s);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let ok = p.check_analytics().await;
                debug!(reachable = ok, "analytics health check");
            }
        });
    }

    let port = match args.port {
        Some(p) => p,
        None => {
            let ports = pipeline.list_ports().await;
            match ports.first() {
                Some(p) => p.path.clone(),
                None => anyhow::bail!("no sensor ports found; pass --port"),
            }
        }
    };
    pipeline
        .connect(&port, args.baud)
        .await
        .with_context(|| format!("connecting to {port}"))?;

    if let Some(id) = &args.session {
        match pipeline.start_session(id, args.mode, false).await {
            Ok(state) => info!(session = %state.session_id, "session started"),
            Err(e) => error!(error = %e, "failed to start session"),
        }
    }

    info!("running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down...");

    pipeline.shutdown(Duration::from_secs(2)).await;
    logger.abort();
    println!("{}", pipeline.metrics().encode_text());
    Ok(())
}

fn to_json(event: &LiveEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| format!("<unencodable {}: {e}>", event.kind()))
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
