// Scheduler module - drives the periodic distribution passes
//
// A pass walks the configured collections in order, computes each one's
// shard distribution and publishes it. Passes run back to back on a single
// task, separated by a fixed sleep measured from the end of the previous
// pass (no wall-clock alignment, so a cycle lasts interval + scan time).
//
// # Failure handling
// Nothing raised during a pass escapes the loop. Depending on the
// configured `FailureScope`, a failing collection either only skips itself
// or aborts the remainder of the pass. The next pass always starts again
// from the first collection.

use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::FailureScope;
use crate::distribution::{DistributionCollector, DistributionOutcome};
use crate::metrics::{ExporterMetrics, MetricPublisher};

/// What happened during one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Collections whose distribution was published
    pub published: Vec<String>,

    /// Collections skipped because they are not sharded
    pub not_partitioned: Vec<String>,

    /// Collections whose scan failed
    pub failed: Vec<String>,

    /// Whether a failure stopped the pass before the last collection
    pub aborted: bool,
}

/// Polling driver: owns the collector and publisher and runs passes forever.
pub struct DistributionScheduler {
    collector: DistributionCollector,
    publisher: MetricPublisher,
    metrics: ExporterMetrics,
    collections: Vec<String>,
    interval: Duration,
    failure_scope: FailureScope,
}

impl DistributionScheduler {
    pub fn new(
        collector: DistributionCollector,
        publisher: MetricPublisher,
        metrics: ExporterMetrics,
        collections: Vec<String>,
        interval: Duration,
        failure_scope: FailureScope,
    ) -> Self {
        DistributionScheduler {
            collector,
            publisher,
            metrics,
            collections,
            interval,
            failure_scope,
        }
    }

    /// Runs passes until the task is dropped.
    ///
    /// The first pass starts immediately; each following one starts
    /// `interval` after the previous one finished.
    pub async fn start(mut self) {
        info!(
            "Starting distribution scheduler for {} collection(s) every {}s (failure scope: {})",
            self.collections.len(),
            self.interval.as_secs(),
            self.failure_scope
        );

        loop {
            self.run_pass().await;
            debug!("Sleeping {}s until the next pass", self.interval.as_secs());
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Runs a single pass over all configured collections.
    pub async fn run_pass(&mut self) -> PassReport {
        let started = Instant::now();
        let database = self.collector.database_name().to_string();
        let mut report = PassReport::default();

        for (position, collection) in self.collections.iter().enumerate() {
            match self.collector.compute_distribution(collection).await {
                Ok(DistributionOutcome::NotPartitioned) => {
                    self.publisher.retire(&database, collection);
                    report.not_partitioned.push(collection.clone());
                }
                Ok(DistributionOutcome::Partitioned(records)) => {
                    self.publisher.publish(&database, collection, &records);
                    report.published.push(collection.clone());
                }
                Err(e) => {
                    error!("Failed to compute shard distribution of '{}': {}", collection, e);
                    self.metrics
                        .scan_errors
                        .with_label_values(&[collection.as_str()])
                        .inc();
                    report.failed.push(collection.clone());

                    if self.failure_scope == FailureScope::Pass {
                        let remaining = self.collections.len() - position - 1;
                        if remaining > 0 {
                            warn!(
                                "Aborting pass, {} collection(s) left for the next one",
                                remaining
                            );
                            report.aborted = true;
                        }
                        break;
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        self.metrics.last_pass_duration.set(elapsed.as_secs_f64());
        self.metrics.last_pass_timestamp.set(Utc::now().timestamp());
        info!(
            "Pass complete in {:.2}s: {} published, {} not sharded, {} failed",
            elapsed.as_secs_f64(),
            report.published.len(),
            report.not_partitioned.len(),
            report.failed.len()
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::MongoClusterMetadata;
    use std::sync::Arc;

    fn cluster() -> FakeCluster {
        FakeCluster::new("shop")
            .with_shard("shardA", "h1:27017")
            .with_shard("shardB", "h2:27017")
            .with_sharded("orders", &[("shardA", 1000, 100, 4), ("shardB", 900, 90, 3)])
            .with_sharded("users", &[("shardA", 50, 5, 1)])
            .with_unsharded("logs")
    }

    fn scheduler(
        cluster: Arc<FakeCluster>,
        collections: &[&str],
        scope: FailureScope,
    ) -> (DistributionScheduler, ExporterMetrics) {
        let metrics = ExporterMetrics::new().unwrap();
        let scheduler = DistributionScheduler::new(
            DistributionCollector::new(cluster, "shop"),
            MetricPublisher::new(metrics.distribution.clone(), false),
            metrics.clone(),
            collections.iter().map(|c| c.to_string()).collect(),
            Duration::from_secs(1800),
            scope,
        );
        (scheduler, metrics)
    }

    fn published_collections(metrics: &ExporterMetrics) -> Vec<String> {
        let mut collections: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .filter(|family| family.get_name() == crate::metrics::DISTRIBUTION_METRIC)
            .flat_map(|family| family.get_metric().to_vec())
            .filter_map(|metric| {
                metric
                    .get_label()
                    .iter()
                    .find(|pair| pair.get_name() == "collection")
                    .map(|pair| pair.get_value().to_string())
            })
            .collect();
        collections.sort();
        collections.dedup();
        collections
    }

    #[tokio::test]
    async fn test_pass_publishes_sharded_collections() {
        let cluster = Arc::new(cluster());
        let (mut scheduler, metrics) =
            scheduler(cluster.clone(), &["orders", "logs", "users"], FailureScope::Collection);

        let report = scheduler.run_pass().await;

        assert_eq!(report.published, vec!["orders", "users"]);
        assert_eq!(report.not_partitioned, vec!["logs"]);
        assert!(report.failed.is_empty());
        assert!(!report.aborted);
        assert_eq!(published_collections(&metrics), vec!["orders", "users"]);
        assert_eq!(cluster.stats_calls(), vec!["orders", "logs", "users"]);
    }

    #[tokio::test]
    async fn test_pass_scope_aborts_remaining_collections() {
        let cluster = Arc::new(cluster().without_identity("orders"));
        let (mut scheduler, metrics) =
            scheduler(cluster.clone(), &["users", "orders", "logs"], FailureScope::Pass);

        let report = scheduler.run_pass().await;

        assert_eq!(report.published, vec!["users"]);
        assert_eq!(report.failed, vec!["orders"]);
        assert!(report.aborted);
        assert_eq!(cluster.stats_calls(), vec!["users", "orders"]);
        assert_eq!(metrics.scan_errors.with_label_values(&["orders"]).get(), 1);

        // The next pass starts over from the first collection.
        let report = scheduler.run_pass().await;
        assert_eq!(report.published, vec!["users"]);
        assert_eq!(
            cluster.stats_calls(),
            vec!["users", "orders", "users", "orders"]
        );
        assert_eq!(metrics.scan_errors.with_label_values(&["orders"]).get(), 2);
    }

    #[tokio::test]
    async fn test_collection_scope_isolates_failures() {
        let cluster = Arc::new(cluster().with_unreachable("orders"));
        let (mut scheduler, metrics) =
            scheduler(cluster.clone(), &["orders", "logs", "users"], FailureScope::Collection);

        let report = scheduler.run_pass().await;

        assert_eq!(report.failed, vec!["orders"]);
        assert_eq!(report.not_partitioned, vec!["logs"]);
        assert_eq!(report.published, vec!["users"]);
        assert!(!report.aborted);
        assert_eq!(cluster.stats_calls(), vec!["orders", "logs", "users"]);
        assert_eq!(published_collections(&metrics), vec!["users"]);
    }

    #[tokio::test]
    async fn test_failure_on_last_collection_is_not_an_abort() {
        let cluster = Arc::new(cluster().with_unreachable("users"));
        let (mut scheduler, _) = scheduler(cluster, &["orders", "users"], FailureScope::Pass);

        let report = scheduler.run_pass().await;

        assert_eq!(report.published, vec!["orders"]);
        assert_eq!(report.failed, vec!["users"]);
        assert!(!report.aborted);
    }

    #[tokio::test]
    async fn test_stalled_collection_does_not_block_the_pass() {
        let cluster = Arc::new(cluster().with_stalled("orders"));
        let metrics = ExporterMetrics::new().unwrap();
        let collector = DistributionCollector::new(cluster.clone(), "shop")
            .with_query_timeout(Some(Duration::from_millis(50)));
        let mut scheduler = DistributionScheduler::new(
            collector,
            MetricPublisher::new(metrics.distribution.clone(), false),
            metrics.clone(),
            vec!["orders".to_string(), "users".to_string()],
            Duration::from_secs(1800),
            FailureScope::Collection,
        );

        let report = scheduler.run_pass().await;

        assert_eq!(report.failed, vec!["orders"]);
        assert_eq!(report.published, vec!["users"]);
        assert_eq!(metrics.scan_errors.with_label_values(&["orders"]).get(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_the_pass_not_the_process() {
        let cluster = MongoClusterMetadata::connect(
            "mongodb://127.0.0.1:1/?directConnection=true",
            "shop",
            Some(Duration::from_millis(500)),
        )
        .await
        .unwrap();
        let metrics = ExporterMetrics::new().unwrap();
        let mut scheduler = DistributionScheduler::new(
            DistributionCollector::new(Arc::new(cluster), "shop"),
            MetricPublisher::new(metrics.distribution.clone(), false),
            metrics.clone(),
            vec!["orders".to_string(), "users".to_string()],
            Duration::from_secs(1800),
            FailureScope::Collection,
        );

        let report = scheduler.run_pass().await;

        assert_eq!(report.failed, vec!["orders", "users"]);
        assert!(report.published.is_empty());
        assert_eq!(metrics.scan_errors.with_label_values(&["users"]).get(), 1);
    }

    #[tokio::test]
    async fn test_pass_updates_self_metrics() {
        let (mut scheduler, metrics) =
            scheduler(Arc::new(cluster()), &["orders"], FailureScope::Collection);

        scheduler.run_pass().await;

        assert!(metrics.last_pass_timestamp.get() > 0);
        assert!(metrics.last_pass_duration.get() >= 0.0);
    }
}
