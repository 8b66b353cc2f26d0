//! The metric catalog
//!
//! A [`Catalog`] is the ordered list of CloudWatch metrics urd fetches for
//! every load balancer together with the [`Sink`] that says where each sample
//! lands in the exported metric set. Adding a metric means appending a
//! [`MetricDefinition`]; the fetch logic does not change.
//!
//! ## Metrics
//!
//! `urd_http_requests_total`: HTTP responses by `status`, CloudWatch `Sum`
//! `backend_connection_errors_total`: Failed backend connections, `Sum`
//! `urd_healthy_hosts_count`: Healthy registered instances, `Average`
//! `urd_average_elb_latency`: Backend latency in seconds, `Average`
//! `urd_request_count`: Requests in the last window, `Sum`
//! `urd_spillovercount_total`: Requests rejected by a full surge queue, `Sum`
//! `urd_surge_queue_length`: Requests pending routing, `Maximum`
//! `urd_unhealthy_hosts_count`: Unhealthy registered instances, `Average`
//!
//! Every series is labeled `elb_name`, `svc_name` and `namespace`.

use std::fmt;

use metrics::Label;
use rustc_hash::FxHashSet;

use crate::registry::{self, Family, Kind, Registry};

/// Histogram buckets, in seconds, for the latency family.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const HTTP_REQUESTS: Family = Family {
    name: "urd_http_requests_total",
    help: "Total of HTTP Requests",
};
const BACKEND_CONNECTION_ERRORS: Family = Family {
    name: "backend_connection_errors_total",
    help: "Total of Backend connection errors",
};
const HEALTHY_HOSTS: Family = Family {
    name: "urd_healthy_hosts_count",
    help: "The number of healthy instances registered with load balance",
};
const LATENCY: Family = Family {
    name: "urd_average_elb_latency",
    help: "Average latency in seconds from ELB sent the request to a instance until instance starts to respond",
};
const REQUEST_COUNT: Family = Family {
    name: "urd_request_count",
    help: "Total of requests in the last interval (60 seconds by default)",
};
const SPILLOVER_COUNT: Family = Family {
    name: "urd_spillovercount_total",
    help: "The total number of requests that were rejected because the surge queue is full.",
};
const SURGE_QUEUE_LENGTH: Family = Family {
    name: "urd_surge_queue_length",
    help: "The total number of requests that are pending routing",
};
const UNHEALTHY_HOSTS: Family = Family {
    name: "urd_unhealthy_hosts_count",
    help: "The number of unhealthy instances registered with load balancer",
};

/// The CloudWatch aggregation requested for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    /// Sum of all samples in the window.
    Sum,
    /// Mean of all samples in the window.
    Average,
    /// Largest sample in the window.
    Maximum,
    /// Smallest sample in the window.
    Minimum,
}

impl Statistic {
    /// The name CloudWatch uses for this statistic.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Statistic::Sum => "Sum",
            Statistic::Average => "Average",
            Statistic::Maximum => "Maximum",
            Statistic::Minimum => "Minimum",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exported series template: the family plus labels fixed by the catalog
/// entry. The per-service labels are appended when a sample is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Series {
    /// Family the sample lands in.
    pub family: Family,
    /// Labels that precede `elb_name`, `svc_name` and `namespace`.
    pub static_labels: &'static [(&'static str, &'static str)],
}

impl Series {
    /// A series of `family` with no fixed labels.
    #[must_use]
    pub const fn of(family: Family) -> Self {
        Self {
            family,
            static_labels: &[],
        }
    }

    fn labels(&self, resource_id: &str, service: &str, namespace: &str) -> Vec<Label> {
        let mut labels = Vec::with_capacity(self.static_labels.len() + 3);
        for (key, value) in self.static_labels {
            labels.push(Label::new(*key, *value));
        }
        labels.push(Label::new("elb_name", resource_id.to_string()));
        labels.push(Label::new("svc_name", service.to_string()));
        labels.push(Label::new("namespace", namespace.to_string()));
        labels
    }
}

/// How a fetched sample is written into the exported metric set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Add the sample to a counter.
    CounterAdd(Series),
    /// Overwrite a gauge with the sample.
    GaugeSet(Series),
    /// Observe the sample in a histogram.
    HistogramObserve(Series),
}

impl Sink {
    /// The kind of metric this sink writes.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Sink::CounterAdd(_) => Kind::Counter,
            Sink::GaugeSet(_) => Kind::Gauge,
            Sink::HistogramObserve(_) => Kind::Histogram,
        }
    }

    /// The series template this sink writes into.
    #[must_use]
    pub fn series(&self) -> &Series {
        match self {
            Sink::CounterAdd(series) | Sink::GaugeSet(series) | Sink::HistogramObserve(series) => {
                series
            }
        }
    }

    /// Record `value` for the load balancer `resource_id` fronting the
    /// service `service` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry refuses the sample, see
    /// [`registry::Error`].
    pub fn record(
        &self,
        registry: &Registry,
        resource_id: &str,
        service: &str,
        namespace: &str,
        value: f64,
    ) -> Result<(), registry::Error> {
        let series = self.series();
        let labels = series.labels(resource_id, service, namespace);
        match self {
            Sink::CounterAdd(_) => registry.add_to_counter(series.family.name, labels, value),
            Sink::GaugeSet(_) => registry.set_gauge(series.family.name, labels, value),
            Sink::HistogramObserve(_) => {
                registry.observe_histogram(series.family.name, labels, value)
            }
        }
    }
}

/// One CloudWatch metric to fetch and where to put it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDefinition {
    /// CloudWatch metric name, for example `HTTPCode_Backend_2XX`.
    pub backend_metric: &'static str,
    /// Statistic to request over the window.
    pub statistic: Statistic,
    /// Destination of the fetched sample.
    pub sink: Sink,
}

impl MetricDefinition {
    /// Create a new [`MetricDefinition`].
    #[must_use]
    pub const fn new(backend_metric: &'static str, statistic: Statistic, sink: Sink) -> Self {
        Self {
            backend_metric,
            statistic,
            sink,
        }
    }
}

const fn http_status(static_labels: &'static [(&'static str, &'static str)]) -> Sink {
    Sink::CounterAdd(Series {
        family: HTTP_REQUESTS,
        static_labels,
    })
}

const ELB_DEFINITIONS: &[MetricDefinition] = &[
    MetricDefinition::new(
        "HTTPCode_Backend_2XX",
        Statistic::Sum,
        http_status(&[("status", "2XX")]),
    ),
    MetricDefinition::new(
        "HTTPCode_Backend_3XX",
        Statistic::Sum,
        http_status(&[("status", "3XX")]),
    ),
    MetricDefinition::new(
        "HTTPCode_Backend_4XX",
        Statistic::Sum,
        http_status(&[("status", "4XX")]),
    ),
    MetricDefinition::new(
        "HTTPCode_Backend_5XX",
        Statistic::Sum,
        http_status(&[("status", "5XX")]),
    ),
    MetricDefinition::new(
        "HTTPCode_ELB_4XX",
        Statistic::Sum,
        http_status(&[("status", "ELB_4XX")]),
    ),
    MetricDefinition::new(
        "HTTPCode_ELB_5XX",
        Statistic::Sum,
        http_status(&[("status", "ELB_5XX")]),
    ),
    MetricDefinition::new(
        "BackendConnectionErrors",
        Statistic::Sum,
        Sink::CounterAdd(Series::of(BACKEND_CONNECTION_ERRORS)),
    ),
    MetricDefinition::new(
        "HealthyHostCount",
        Statistic::Average,
        Sink::GaugeSet(Series::of(HEALTHY_HOSTS)),
    ),
    MetricDefinition::new(
        "Latency",
        Statistic::Average,
        Sink::HistogramObserve(Series::of(LATENCY)),
    ),
    MetricDefinition::new(
        "RequestCount",
        Statistic::Sum,
        Sink::CounterAdd(Series::of(REQUEST_COUNT)),
    ),
    MetricDefinition::new(
        "SpilloverCount",
        Statistic::Sum,
        Sink::CounterAdd(Series::of(SPILLOVER_COUNT)),
    ),
    MetricDefinition::new(
        "SurgeQueueLength",
        Statistic::Maximum,
        Sink::CounterAdd(Series::of(SURGE_QUEUE_LENGTH)),
    ),
    MetricDefinition::new(
        "UnHealthyHostCount",
        Statistic::Average,
        Sink::GaugeSet(Series::of(UNHEALTHY_HOSTS)),
    ),
];

/// An immutable, ordered list of [`MetricDefinition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    definitions: Vec<MetricDefinition>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::elb()
    }
}

impl Catalog {
    /// Create a catalog from arbitrary definitions.
    #[must_use]
    pub fn new(definitions: Vec<MetricDefinition>) -> Self {
        Self { definitions }
    }

    /// The catalog of classic ELB metrics.
    #[must_use]
    pub fn elb() -> Self {
        Self::new(ELB_DEFINITIONS.to_vec())
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the catalog holds no definitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Iterate the definitions in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.definitions.iter()
    }

    /// Names of the histogram families the catalog writes into.
    pub fn histogram_families(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.definitions
            .iter()
            .filter(|def| def.sink.kind() == Kind::Histogram)
            .map(|def| def.sink.series().family.name)
    }

    /// Publish HELP text for every family in the catalog, once per family.
    pub fn describe(&self, registry: &Registry) {
        let mut seen = FxHashSet::default();
        for def in &self.definitions {
            let family = def.sink.series().family;
            if seen.insert(family.name) {
                registry.describe(def.sink.kind(), family);
            }
        }
    }
}
