use std::io;

use jemallocator::Jemalloc;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use tokio::{runtime::Builder, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use urd::{
    backend::{self, CloudWatch},
    catalog::{Catalog, LATENCY_BUCKETS},
    config::{self, Config},
    cycle::Collector,
    discovery::{self, Kubernetes},
    registry::Registry,
    scheduler::{self, Scheduler},
};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Failed to load urd config: {0}")]
    Config(#[from] config::Error),
    #[error("Failed to build Prometheus exporter: {0}")]
    Prometheus(#[from] BuildError),
    #[error("Failed to set up service discovery: {0}")]
    Discovery(#[from] discovery::Error),
    #[error("Failed to set up metrics backend: {0}")]
    Backend(#[from] backend::Error),
    #[error("Collection stopped: {0}")]
    Scheduler(#[from] scheduler::Error),
}

async fn inner_main(config: Config) -> Result<(), Error> {
    let catalog = Catalog::elb();

    // The scrape endpoint reads the same storage the collector writes into
    // and never waits on a cycle in flight.
    let mut builder = PrometheusBuilder::new().with_http_listener(config.prometheus_addr);
    for (k, v) in &config.global_labels {
        builder = builder.add_global_label(k, v);
    }
    for family in catalog.histogram_families() {
        builder =
            builder.set_buckets_for_metric(Matcher::Full(family.to_string()), LATENCY_BUCKETS)?;
    }
    let (recorder, exporter) = builder.build()?;
    tokio::spawn(async move {
        if let Err(err) = exporter.await {
            error!("Prometheus exporter shut down unexpectedly: {err:?}");
        }
    });
    info!("Serving metrics on {}", config.prometheus_addr);
    let registry = Registry::new(recorder);

    let discover = Kubernetes::from_kubeconfig(&config.kubeconfig_path).await?;
    let fetch = CloudWatch::from_env(
        config.backend_namespace.clone(),
        config.dimension_name.clone(),
        config.window(),
    )
    .await?;
    let collector = Collector::new(
        discover,
        fetch,
        catalog,
        registry,
        config.max_concurrent_fetches,
        config.fetch_timeout(),
    );
    let scheduler = Scheduler::new(config.period());

    tokio::select! {
        res = scheduler.run(|| collector.collect()) => {
            if let Err(err) = &res {
                error!("Collection stopped: {err}");
            }
            Ok(res?)
        },
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
            Ok(())
        },
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting urd {version}.");

    let config = Config::load()?;
    info!(
        "Collecting {} every {}s over a {}s window",
        config.backend_namespace, config.period_seconds, config.window_seconds
    );

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    info!("Bye. :)");
    res
}
