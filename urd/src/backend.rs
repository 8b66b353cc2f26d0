//! The metrics backend
//!
//! Fetches a single statistic of a single load balancer metric over the
//! trailing window. A window with no datapoints is not an error: CloudWatch
//! omits datapoints for metrics that saw no activity, `HTTPCode_Backend_5XX`
//! on a healthy service for instance, and these read as `0.0`.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cloudwatch::{
    self as cloudwatch, Client,
    primitives::DateTime,
    types::{Datapoint, Dimension, Statistic as CloudWatchStatistic},
};
use tracing::{debug, trace};

use crate::catalog::Statistic;

/// Errors produced by [`Fetch`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The CloudWatch request failed.
    #[error("CloudWatch request failed: {0}")]
    CloudWatch(#[from] Box<cloudwatch::Error>),
    /// The window cannot be expressed as a CloudWatch period.
    #[error("window of {0:?} is not a valid CloudWatch period")]
    Window(Duration),
}

#[async_trait]
/// A source of load balancer statistics.
pub trait Fetch: Send + Sync {
    /// Fetch `statistic` of `metric` for the load balancer `resource_id` over
    /// the trailing window ending now.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be queried. An empty window
    /// is not an error and yields `0.0`.
    async fn fetch(
        &self,
        resource_id: &str,
        metric: &str,
        statistic: Statistic,
    ) -> Result<f64, Error>;
}

impl From<Statistic> for CloudWatchStatistic {
    fn from(statistic: Statistic) -> Self {
        match statistic {
            Statistic::Sum => CloudWatchStatistic::Sum,
            Statistic::Average => CloudWatchStatistic::Average,
            Statistic::Maximum => CloudWatchStatistic::Maximum,
            Statistic::Minimum => CloudWatchStatistic::Minimum,
        }
    }
}

/// Convert `window` into a CloudWatch period, in seconds.
///
/// # Errors
///
/// Returns [`Error::Window`] if the window is empty, not a whole number of
/// minutes or too long.
pub fn period(window: Duration) -> Result<i32, Error> {
    let secs = window.as_secs();
    if secs == 0 || secs % 60 != 0 || window.subsec_nanos() != 0 {
        return Err(Error::Window(window));
    }
    i32::try_from(secs).map_err(|_| Error::Window(window))
}

/// Pick `statistic` out of the most recent datapoint.
///
/// No datapoints, or a datapoint lacking the statistic, yields `0.0`.
#[must_use]
pub fn select(datapoints: &[Datapoint], statistic: Statistic) -> f64 {
    let latest = datapoints.iter().max_by_key(|point| {
        point
            .timestamp()
            .map(|ts| (ts.secs(), ts.subsec_nanos()))
    });
    let Some(point) = latest else {
        return 0.0;
    };
    let value = match statistic {
        Statistic::Sum => point.sum(),
        Statistic::Average => point.average(),
        Statistic::Maximum => point.maximum(),
        Statistic::Minimum => point.minimum(),
    };
    value.unwrap_or_else(|| {
        debug!("datapoint carries no {statistic}, reading as zero");
        0.0
    })
}

/// Statistics fetched from Amazon CloudWatch `GetMetricStatistics`.
#[derive(Clone)]
pub struct CloudWatch {
    client: Client,
    namespace: String,
    dimension: String,
    window: Duration,
    period: i32,
}

impl fmt::Debug for CloudWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudWatch")
            .field("namespace", &self.namespace)
            .field("dimension", &self.dimension)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl CloudWatch {
    /// Create a new [`CloudWatch`] over an existing `client`.
    ///
    /// Metrics are looked up in `namespace`, the load balancer is matched on
    /// the `dimension` dimension and statistics cover the trailing `window`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Window`] if `window` is not a valid CloudWatch period.
    pub fn new(
        client: Client,
        namespace: String,
        dimension: String,
        window: Duration,
    ) -> Result<Self, Error> {
        let period = period(window)?;
        Ok(Self {
            client,
            namespace,
            dimension,
            window,
            period,
        })
    }

    /// Create a new [`CloudWatch`] using credentials and region from the
    /// environment.
    ///
    /// # Errors
    ///
    /// See [`CloudWatch::new`].
    pub async fn from_env(
        namespace: String,
        dimension: String,
        window: Duration,
    ) -> Result<Self, Error> {
        let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        debug!(
            "CloudWatch client configured for region {:?}",
            sdk_config.region()
        );
        Self::new(Client::new(&sdk_config), namespace, dimension, window)
    }
}

#[async_trait]
impl Fetch for CloudWatch {
    async fn fetch(
        &self,
        resource_id: &str,
        metric: &str,
        statistic: Statistic,
    ) -> Result<f64, Error> {
        let end = SystemTime::now();
        let start = end - self.window;

        let output = self
            .client
            .get_metric_statistics()
            .namespace(&self.namespace)
            .metric_name(metric)
            .dimensions(
                Dimension::builder()
                    .name(&self.dimension)
                    .value(resource_id)
                    .build(),
            )
            .start_time(DateTime::from(start))
            .end_time(DateTime::from(end))
            .period(self.period)
            .statistics(statistic.into())
            .send()
            .await
            .map_err(|err| Box::new(cloudwatch::Error::from(err)))?;

        let datapoints = output.datapoints();
        let value = select(datapoints, statistic);
        trace!(
            "{resource_id} {metric} {statistic}: {value} from {} datapoints",
            datapoints.len()
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_cloudwatch::{
        operation::get_metric_statistics::{GetMetricStatisticsError, GetMetricStatisticsOutput},
        types::error::InvalidParameterValueException,
    };
    use aws_smithy_mocks::{mock, mock_client};

    fn point(secs: i64, value: f64) -> Datapoint {
        Datapoint::builder()
            .timestamp(DateTime::from_secs(secs))
            .sum(value)
            .average(value / 2.0)
            .build()
    }

    #[test]
    fn empty_window_reads_as_zero() {
        for statistic in [
            Statistic::Sum,
            Statistic::Average,
            Statistic::Maximum,
            Statistic::Minimum,
        ] {
            assert_eq!(select(&[], statistic), 0.0);
        }
    }

    #[test]
    fn selects_requested_statistic() {
        let points = [point(60, 42.0)];
        assert_eq!(select(&points, Statistic::Sum), 42.0);
        assert_eq!(select(&points, Statistic::Average), 21.0);
    }

    #[test]
    fn missing_statistic_reads_as_zero() {
        let points = [point(60, 42.0)];
        assert_eq!(select(&points, Statistic::Maximum), 0.0);
    }

    #[test]
    fn most_recent_datapoint_wins() {
        let points = [point(120, 7.0), point(180, 9.0), point(60, 3.0)];
        assert_eq!(select(&points, Statistic::Sum), 9.0);
    }

    #[test]
    fn period_must_be_whole_minutes() {
        assert_eq!(period(Duration::from_secs(60)).ok(), Some(60));
        assert_eq!(period(Duration::from_secs(300)).ok(), Some(300));
        for window in [
            Duration::ZERO,
            Duration::from_secs(30),
            Duration::from_secs(90),
            Duration::from_millis(60_500),
            Duration::from_secs(u64::from(u32::MAX) * 60),
        ] {
            assert!(period(window).is_err(), "{window:?}");
        }
    }

    #[test]
    fn statistic_names_match_cloudwatch() {
        for statistic in [
            Statistic::Sum,
            Statistic::Average,
            Statistic::Maximum,
            Statistic::Minimum,
        ] {
            assert_eq!(
                CloudWatchStatistic::from(statistic).as_str(),
                statistic.as_str()
            );
        }
    }

    fn elb(client: Client) -> CloudWatch {
        CloudWatch::new(
            client,
            "AWS/ELB".to_string(),
            "LoadBalancerName".to_string(),
            Duration::from_secs(60),
        )
        .expect("valid window")
    }

    #[tokio::test]
    async fn requests_one_statistic_over_trailing_window() {
        let rule = mock!(Client::get_metric_statistics)
            .match_requests(|req| {
                let now = DateTime::from(SystemTime::now()).secs();
                let dimension_matches = match req.dimensions() {
                    [dimension] => {
                        dimension.name() == Some("LoadBalancerName")
                            && dimension.value() == Some("abc123")
                    }
                    _ => false,
                };
                let window_matches = match (req.start_time(), req.end_time()) {
                    (Some(start), Some(end)) => {
                        end.secs() - start.secs() == 60 && (now - end.secs()).abs() <= 5
                    }
                    _ => false,
                };
                req.namespace() == Some("AWS/ELB")
                    && req.metric_name() == Some("HTTPCode_Backend_2XX")
                    && req.period() == Some(60)
                    && req.statistics() == [CloudWatchStatistic::Sum]
                    && dimension_matches
                    && window_matches
            })
            .then_output(|| {
                GetMetricStatisticsOutput::builder()
                    .label("HTTPCode_Backend_2XX")
                    .datapoints(point(60, 42.0))
                    .build()
            });
        let client = mock_client!(aws_sdk_cloudwatch, [&rule]);

        let value = elb(client)
            .fetch("abc123", "HTTPCode_Backend_2XX", Statistic::Sum)
            .await
            .expect("fetch succeeds");
        assert_eq!(value, 42.0);
        assert_eq!(rule.num_calls(), 1);
    }

    #[tokio::test]
    async fn empty_response_reads_as_zero() {
        let rule = mock!(Client::get_metric_statistics)
            .then_output(|| GetMetricStatisticsOutput::builder().build());
        let client = mock_client!(aws_sdk_cloudwatch, [&rule]);

        let value = elb(client)
            .fetch("abc123", "HTTPCode_Backend_5XX", Statistic::Sum)
            .await
            .expect("fetch succeeds");
        assert_eq!(value, 0.0);
    }

    #[tokio::test]
    async fn backend_error_is_returned() {
        let rule = mock!(Client::get_metric_statistics).then_error(|| {
            GetMetricStatisticsError::InvalidParameterValueException(
                InvalidParameterValueException::builder()
                    .message("bad dimension")
                    .build(),
            )
        });
        let client = mock_client!(aws_sdk_cloudwatch, [&rule]);

        let err = elb(client)
            .fetch("abc123", "Latency", Statistic::Average)
            .await
            .expect_err("backend fails");
        assert!(matches!(err, Error::CloudWatch(_)));
    }
}
