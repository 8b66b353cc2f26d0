//! The collection cycle
//!
//! One cycle discovers the load-balanced services, resolves the ELB behind
//! each and fans out one fetch per (service, catalog entry) pair. The cycle is
//! done only once every fetch has finished and its sample is written to the
//! [`Registry`].
//!
//! Only discovery failures end a cycle early. A service whose load balancer is
//! still provisioning, or whose hostname is not recognized, is skipped. A
//! fetch that fails or exceeds its timeout leaves that one sample missing for
//! the cycle; the next cycle is its retry.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Semaphore, task::JoinSet, time};
use tracing::{debug, error, info, trace, warn};

use crate::{
    backend::Fetch,
    catalog::{Catalog, MetricDefinition},
    discovery::{self, Discover, ServiceRef},
    registry::Registry,
    resolve,
};

/// Errors produced by [`Collector`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Service discovery failed, no samples were fetched.
    #[error("Service discovery failed: {0}")]
    Discovery(#[from] discovery::Error),
}

/// Tally of one collection cycle.
///
/// `tasks` is the number of resolvable services times the catalog length and
/// every task ends up in exactly one of `recorded`, `failed` or `invalid`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Load-balanced services discovered.
    pub services: usize,
    /// Services skipped because their load balancer has no hostname yet.
    pub pending: usize,
    /// Services skipped because their hostname was not recognized.
    pub unresolved: usize,
    /// Fetch tasks spawned.
    pub tasks: usize,
    /// Samples written to the registry.
    pub recorded: usize,
    /// Samples lost to a backend error, timeout or task panic.
    pub failed: usize,
    /// Samples fetched but refused by the registry.
    pub invalid: usize,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Recorded,
    Failed,
    Invalid,
}

/// A service together with the ELB name resolved from its hostname.
#[derive(Debug)]
struct Target {
    resource_id: String,
    service: ServiceRef,
}

/// Runs collection cycles of `catalog` against the services found by `D`
/// with statistics fetched through `F`.
#[derive(Debug)]
pub struct Collector<D, F> {
    discover: D,
    fetch: Arc<F>,
    catalog: Arc<Catalog>,
    registry: Registry,
    limit: Arc<Semaphore>,
    fetch_timeout: Duration,
}

impl<D, F> Collector<D, F>
where
    D: Discover,
    F: Fetch + 'static,
{
    /// Create a new [`Collector`] instance
    ///
    /// At most `max_concurrent_fetches` fetches, capped at
    /// [`Semaphore::MAX_PERMITS`], are in flight at once and
    /// each may take up to `fetch_timeout`. The catalog's HELP text is
    /// published to `registry` here.
    #[must_use]
    pub fn new(
        discover: D,
        fetch: F,
        catalog: Catalog,
        registry: Registry,
        max_concurrent_fetches: usize,
        fetch_timeout: Duration,
    ) -> Self {
        catalog.describe(&registry);
        Self {
            discover,
            fetch: Arc::new(fetch),
            catalog: Arc::new(catalog),
            registry,
            limit: Arc::new(Semaphore::new(
                max_concurrent_fetches.min(Semaphore::MAX_PERMITS),
            )),
            fetch_timeout,
        }
    }

    /// Run one collection cycle to completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if services could not be listed. Per
    /// sample failures are not errors, they are counted in the [`Report`].
    pub async fn collect(&self) -> Result<Report, Error> {
        let services = self.discover.services().await?;
        let mut report = Report {
            services: services.len(),
            ..Report::default()
        };

        let mut targets = Vec::with_capacity(services.len());
        for service in services {
            let Some(hostname) = service.public_hostname.as_deref() else {
                info!(
                    "{}/{}: load balancer pending provisioning, skipping",
                    service.namespace, service.name
                );
                report.pending += 1;
                continue;
            };
            match resolve::resource_id(hostname) {
                Ok(resource_id) => targets.push(Arc::new(Target {
                    resource_id,
                    service,
                })),
                Err(err) => {
                    warn!("{}/{}: {err}, skipping", service.namespace, service.name);
                    report.unresolved += 1;
                }
            }
        }

        let mut tasks = JoinSet::new();
        for target in &targets {
            for definition in self.catalog.iter() {
                tasks.spawn(sample(
                    Arc::clone(&self.fetch),
                    self.registry.clone(),
                    Arc::clone(&self.limit),
                    Arc::clone(target),
                    *definition,
                    self.fetch_timeout,
                ));
            }
        }
        report.tasks = tasks.len();
        debug!(
            "{} fetches spawned for {} load balancers",
            report.tasks,
            targets.len()
        );

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Recorded) => report.recorded += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Invalid) => report.invalid += 1,
                Err(err) => {
                    error!("Could not join the spawned fetch task: {err}");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

async fn sample<F>(
    fetch: Arc<F>,
    registry: Registry,
    limit: Arc<Semaphore>,
    target: Arc<Target>,
    definition: MetricDefinition,
    fetch_timeout: Duration,
) -> Outcome
where
    F: Fetch + ?Sized,
{
    let Target {
        resource_id,
        service,
    } = target.as_ref();
    let metric = definition.backend_metric;

    let Ok(permit) = limit.acquire_owned().await else {
        error!("fetch limiter closed, {resource_id} {metric} not fetched");
        return Outcome::Failed;
    };
    let fetched = time::timeout(
        fetch_timeout,
        fetch.fetch(resource_id, metric, definition.statistic),
    )
    .await;
    drop(permit);

    let value = match fetched {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            warn!(
                "{}/{}: fetching {metric} for {resource_id} failed: {err}",
                service.namespace, service.name
            );
            return Outcome::Failed;
        }
        Err(_) => {
            warn!(
                "{}/{}: fetching {metric} for {resource_id} timed out after {fetch_timeout:?}",
                service.namespace, service.name
            );
            return Outcome::Failed;
        }
    };

    match definition
        .sink
        .record(&registry, resource_id, &service.name, &service.namespace, value)
    {
        Ok(()) => {
            trace!("{resource_id} {metric} = {value}");
            Outcome::Recorded
        }
        Err(err) => {
            warn!(
                "{}/{}: {metric} for {resource_id} not recorded: {err}",
                service.namespace, service.name
            );
            Outcome::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use aws_sdk_cloudwatch::{Error as CloudWatchError, types::error::InternalServiceFault};
    use metrics::{Key, Label};
    use metrics_util::{
        CompositeKey, MetricKind,
        debugging::{DebugValue, DebuggingRecorder, Snapshotter},
    };
    use rustc_hash::{FxHashMap, FxHashSet};

    use crate::{backend, catalog::Statistic};

    const HOSTNAME_A: &str = "internal-abc123def456abc123def456abc123de-999999.us-east-1.elb.amazonaws.com";
    const ELB_A: &str = "abc123def456abc123def456abc123de";
    const HOSTNAME_B: &str = "0123456789abcdef0123456789abcdef-152337689.us-east-1.elb.amazonaws.com";
    const ELB_B: &str = "0123456789abcdef0123456789abcdef";

    struct FakeDiscover {
        services: Option<Vec<ServiceRef>>,
    }

    #[async_trait]
    impl Discover for FakeDiscover {
        async fn services(&self) -> Result<Vec<ServiceRef>, discovery::Error> {
            self.services
                .clone()
                .ok_or(discovery::Error::UnnamedNamespace)
        }
    }

    enum Reply {
        Value(f64),
        Fail,
        Hang,
    }

    fn key(resource_id: &str, metric: &str) -> (String, String) {
        (resource_id.to_string(), metric.to_string())
    }

    #[derive(Default)]
    struct FakeFetch {
        replies: Mutex<FxHashMap<(String, String), f64>>,
        failing: Mutex<FxHashSet<(String, String)>>,
        hanging: Mutex<FxHashSet<(String, String)>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeFetch {
        fn reply(&self, resource_id: &str, metric: &str, value: f64) {
            self.replies
                .lock()
                .expect("lock")
                .insert(key(resource_id, metric), value);
        }

        fn fail(&self, resource_id: &str, metric: &str) {
            self.failing
                .lock()
                .expect("lock")
                .insert(key(resource_id, metric));
        }

        fn hang(&self, resource_id: &str, metric: &str) {
            self.hanging
                .lock()
                .expect("lock")
                .insert(key(resource_id, metric));
        }

        fn lookup(&self, resource_id: &str, metric: &str) -> Reply {
            let key = key(resource_id, metric);
            if self.failing.lock().expect("lock").contains(&key) {
                Reply::Fail
            } else if self.hanging.lock().expect("lock").contains(&key) {
                Reply::Hang
            } else {
                let value = self.replies.lock().expect("lock").get(&key).copied();
                Reply::Value(value.unwrap_or(0.0))
            }
        }
    }

    #[async_trait]
    impl Fetch for Arc<FakeFetch> {
        async fn fetch(
            &self,
            resource_id: &str,
            metric: &str,
            _statistic: Statistic,
        ) -> Result<f64, backend::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            let reply = self.lookup(resource_id, metric);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match reply {
                Reply::Value(value) => Ok(value),
                Reply::Fail => {
                    let fault = InternalServiceFault::builder().message("boom").build();
                    Err(backend::Error::CloudWatch(Box::new(
                        CloudWatchError::InternalServiceFault(fault),
                    )))
                }
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    fn service(namespace: &str, name: &str, hostname: Option<&str>) -> ServiceRef {
        ServiceRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            public_hostname: hostname.map(str::to_string),
        }
    }

    fn collector(
        services: Option<Vec<ServiceRef>>,
        fetch: &Arc<FakeFetch>,
        max_concurrent_fetches: usize,
    ) -> (Collector<FakeDiscover, Arc<FakeFetch>>, Snapshotter) {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let collector = Collector::new(
            FakeDiscover { services },
            Arc::clone(fetch),
            Catalog::elb(),
            Registry::new(recorder),
            max_concurrent_fetches,
            Duration::from_secs(5),
        );
        (collector, snapshotter)
    }

    fn series_labels(prefix: &[(&str, &str)], elb: &str, svc: &str, ns: &str) -> Vec<Label> {
        let mut labels: Vec<Label> = prefix
            .iter()
            .map(|(k, v)| Label::new((*k).to_string(), (*v).to_string()))
            .collect();
        labels.push(Label::new("elb_name", elb.to_string()));
        labels.push(Label::new("svc_name", svc.to_string()));
        labels.push(Label::new("namespace", ns.to_string()));
        labels
    }

    fn lookup(
        snapshotter: &Snapshotter,
        kind: MetricKind,
        name: &'static str,
        labels: Vec<Label>,
    ) -> Option<DebugValue> {
        snapshotter
            .snapshot()
            .into_hashmap()
            .remove(&CompositeKey::new(kind, Key::from_parts(name, labels)))
            .map(|(_, _, value)| value)
    }

    fn requests_2xx(snapshotter: &Snapshotter, elb: &str) -> Option<DebugValue> {
        lookup(
            snapshotter,
            MetricKind::Counter,
            "urd_http_requests_total",
            series_labels(&[("status", "2XX")], elb, "web", "prod"),
        )
    }

    fn healthy_hosts(snapshotter: &Snapshotter, elb: &str) -> Option<f64> {
        match lookup(
            snapshotter,
            MetricKind::Gauge,
            "urd_healthy_hosts_count",
            series_labels(&[], elb, "web", "prod"),
        ) {
            Some(DebugValue::Gauge(value)) => Some(value.into_inner()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn one_service_end_to_end() {
        let fetch = Arc::new(FakeFetch::default());
        fetch.reply(ELB_A, "HTTPCode_Backend_2XX", 42.0);
        fetch.reply(ELB_A, "HealthyHostCount", 3.0);
        let (collector, snapshotter) =
            collector(Some(vec![service("prod", "web", Some(HOSTNAME_A))]), &fetch, 100);

        let report = collector.collect().await.expect("cycle completes");

        assert_eq!(
            report,
            Report {
                services: 1,
                tasks: 13,
                recorded: 13,
                ..Report::default()
            }
        );
        assert_eq!(requests_2xx(&snapshotter, ELB_A), Some(DebugValue::Counter(42)));
        assert_eq!(healthy_hosts(&snapshotter, ELB_A), Some(3.0));
        // Zero-datapoint metrics are still exported, as zero.
        assert_eq!(
            lookup(
                &snapshotter,
                MetricKind::Counter,
                "urd_http_requests_total",
                series_labels(&[("status", "5XX")], ELB_A, "web", "prod"),
            ),
            Some(DebugValue::Counter(0))
        );
    }

    #[tokio::test]
    async fn counters_accumulate_and_gauges_overwrite_across_cycles() {
        let fetch = Arc::new(FakeFetch::default());
        fetch.reply(ELB_A, "HTTPCode_Backend_2XX", 42.0);
        fetch.reply(ELB_A, "HealthyHostCount", 3.0);
        let (collector, snapshotter) =
            collector(Some(vec![service("prod", "web", Some(HOSTNAME_A))]), &fetch, 100);

        collector.collect().await.expect("first cycle");
        fetch.reply(ELB_A, "HTTPCode_Backend_2XX", 8.0);
        fetch.reply(ELB_A, "HealthyHostCount", 1.0);
        collector.collect().await.expect("second cycle");

        assert_eq!(requests_2xx(&snapshotter, ELB_A), Some(DebugValue::Counter(50)));
        assert_eq!(healthy_hosts(&snapshotter, ELB_A), Some(1.0));
    }

    #[tokio::test]
    async fn fans_out_services_times_catalog() {
        let fetch = Arc::new(FakeFetch::default());
        let services = vec![
            service("prod", "web", Some(HOSTNAME_A)),
            service("prod", "api", Some(HOSTNAME_B)),
            service("staging", "web", Some(HOSTNAME_A)),
        ];
        let (collector, _snapshotter) = collector(Some(services), &fetch, 100);

        let report = collector.collect().await.expect("cycle completes");

        let expected = 3 * Catalog::elb().len();
        assert_eq!(report.tasks, expected);
        assert_eq!(report.recorded, expected);
        assert_eq!(fetch.calls.load(Ordering::SeqCst), expected);
        assert_eq!(fetch.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_fetch_only_loses_its_sample() {
        let fetch = Arc::new(FakeFetch::default());
        fetch.reply(ELB_A, "HTTPCode_Backend_2XX", 5.0);
        fetch.reply(ELB_A, "HealthyHostCount", 2.0);
        fetch.reply(ELB_B, "HTTPCode_Backend_2XX", 7.0);
        fetch.fail(ELB_A, "HTTPCode_Backend_2XX");
        let services = vec![
            service("prod", "web", Some(HOSTNAME_A)),
            service("prod", "web", Some(HOSTNAME_B)),
        ];
        let (collector, snapshotter) = collector(Some(services), &fetch, 100);

        let report = collector.collect().await.expect("cycle completes");

        assert_eq!(report.tasks, 26);
        assert_eq!(report.failed, 1);
        assert_eq!(report.recorded, 25);
        assert_eq!(requests_2xx(&snapshotter, ELB_A), None);
        assert_eq!(healthy_hosts(&snapshotter, ELB_A), Some(2.0));
        assert_eq!(requests_2xx(&snapshotter, ELB_B), Some(DebugValue::Counter(7)));
    }

    #[tokio::test]
    async fn skips_pending_and_unrecognized_hostnames() {
        let fetch = Arc::new(FakeFetch::default());
        let services = vec![
            service("prod", "provisioning", None),
            service("prod", "odd", Some("my-service.example.com")),
            service("prod", "web", Some(HOSTNAME_A)),
        ];
        let (collector, _snapshotter) = collector(Some(services), &fetch, 100);

        let report = collector.collect().await.expect("cycle completes");

        assert_eq!(report.services, 3);
        assert_eq!(report.pending, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.tasks, Catalog::elb().len());
        assert_eq!(fetch.calls.load(Ordering::SeqCst), Catalog::elb().len());
    }

    #[tokio::test]
    async fn discovery_failure_aborts_cycle() {
        let fetch = Arc::new(FakeFetch::default());
        let (collector, _snapshotter) = collector(None, &fetch, 100);

        let err = collector.collect().await.expect_err("discovery fails");
        assert!(matches!(err, Error::Discovery(_)));
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_services_is_an_empty_cycle() {
        let fetch = Arc::new(FakeFetch::default());
        let (collector, _snapshotter) = collector(Some(vec![]), &fetch, 100);

        let report = collector.collect().await.expect("cycle completes");
        assert_eq!(report, Report::default());
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_are_bounded_and_joined() {
        let fetch = Arc::new(FakeFetch {
            delay: Duration::from_millis(10),
            ..FakeFetch::default()
        });
        let services = vec![
            service("prod", "web", Some(HOSTNAME_A)),
            service("prod", "api", Some(HOSTNAME_B)),
        ];
        let (collector, _snapshotter) = collector(Some(services), &fetch, 3);

        let report = collector.collect().await.expect("cycle completes");

        assert_eq!(report.recorded, 26);
        assert!(fetch.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(fetch.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_times_out() {
        let fetch = Arc::new(FakeFetch::default());
        fetch.hang(ELB_A, "Latency");
        let (collector, _snapshotter) =
            collector(Some(vec![service("prod", "web", Some(HOSTNAME_A))]), &fetch, 100);

        let report = collector.collect().await.expect("cycle completes");

        assert_eq!(report.failed, 1);
        assert_eq!(report.recorded, 12);
    }

    #[tokio::test]
    async fn invalid_counter_sample_is_counted() {
        let fetch = Arc::new(FakeFetch::default());
        fetch.reply(ELB_A, "RequestCount", -3.0);
        let (collector, _snapshotter) =
            collector(Some(vec![service("prod", "web", Some(HOSTNAME_A))]), &fetch, 100);

        let report = collector.collect().await.expect("cycle completes");

        assert_eq!(report.invalid, 1);
        assert_eq!(report.recorded + report.failed + report.invalid, report.tasks);
    }

    #[tokio::test]
    async fn oversized_fetch_limit_is_capped() {
        let fetch = Arc::new(FakeFetch::default());
        let (collector, _snapshotter) = collector(
            Some(vec![service("prod", "web", Some(HOSTNAME_A))]),
            &fetch,
            usize::MAX,
        );

        let report = collector.collect().await.expect("cycle completes");
        assert_eq!(report.recorded, Catalog::elb().len());
    }
}
