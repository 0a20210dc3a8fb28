// Metrics module - the Prometheus registry shared by the poller and the scrape endpoint
//
// The registry is built once at startup. The publisher writes the shard
// distribution gauges into it and the HTTP server encodes it on every scrape.

use prometheus::{
    Encoder, Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::fmt;
use thiserror::Error;

pub mod publisher;
pub mod server;

pub use publisher::MetricPublisher;

/// Name of the shard distribution gauge family
pub const DISTRIBUTION_METRIC: &str = "mongodb_shard_distribution";

/// Label names of the shard distribution gauge family, in order
pub const DISTRIBUTION_LABELS: [&str; 5] =
    ["database", "collection", "shard_name", "shard_host", "data"];

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Encoded metrics are not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Value reported under the `data` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    ShardData,
    ShardDocs,
    ShardChunks,
    EstimatedDataPerChunk,
    EstimatedDocsPerChunk,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::ShardData,
        Dimension::ShardDocs,
        Dimension::ShardChunks,
        Dimension::EstimatedDataPerChunk,
        Dimension::EstimatedDocsPerChunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::ShardData => "shard_data",
            Dimension::ShardDocs => "shard_docs",
            Dimension::ShardChunks => "shard_chunks",
            Dimension::EstimatedDataPerChunk => "estimated_data_per_chunk",
            Dimension::EstimatedDocsPerChunk => "estimated_docs_per_chunk",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All metrics exposed by the exporter.
///
/// Cloning is cheap: every handle points at the same underlying series.
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,

    /// Shard distribution gauge family
    pub distribution: IntGaugeVec,

    /// Collections that failed to scan, by collection
    pub scan_errors: IntCounterVec,

    pub last_pass_duration: Gauge,
    pub last_pass_timestamp: IntGauge,
}

impl ExporterMetrics {
    /// Creates a registry and registers all exporter metrics in it.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let help = Dimension::ALL
            .iter()
            .map(Dimension::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let distribution =
            IntGaugeVec::new(Opts::new(DISTRIBUTION_METRIC, help), &DISTRIBUTION_LABELS)?;
        registry.register(Box::new(distribution.clone()))?;

        let scan_errors = IntCounterVec::new(
            Opts::new(
                "shard_exporter_scan_errors_total",
                "Number of failed distribution scans, by collection",
            ),
            &["collection"],
        )?;
        registry.register(Box::new(scan_errors.clone()))?;

        let last_pass_duration = Gauge::with_opts(Opts::new(
            "shard_exporter_last_pass_duration_seconds",
            "Duration of the most recent polling pass",
        ))?;
        registry.register(Box::new(last_pass_duration.clone()))?;

        let last_pass_timestamp = IntGauge::with_opts(Opts::new(
            "shard_exporter_last_pass_timestamp_seconds",
            "Unix time at which the most recent polling pass completed",
        ))?;
        registry.register(Box::new(last_pass_timestamp.clone()))?;

        Ok(ExporterMetrics {
            registry,
            distribution,
            scan_errors,
            last_pass_duration,
            last_pass_timestamp,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Gathers and encodes a registry in the Prometheus text format.
pub fn encode_registry(registry: &Registry) -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_family_is_registered() {
        let metrics = ExporterMetrics::new().unwrap();
        metrics
            .distribution
            .with_label_values(&["shop", "orders", "shardA", "h1:27017", "shard_data"])
            .set(1000);

        let text = encode_registry(metrics.registry()).unwrap();

        assert!(text.contains(
            "# HELP mongodb_shard_distribution shard_data, shard_docs, shard_chunks, \
             estimated_data_per_chunk, estimated_docs_per_chunk"
        ));
        assert!(text.contains("# TYPE mongodb_shard_distribution gauge"));
        let sample = text
            .lines()
            .find(|line| line.starts_with("mongodb_shard_distribution{"))
            .unwrap();
        for label in [
            "database=\"shop\"",
            "collection=\"orders\"",
            "shard_name=\"shardA\"",
            "shard_host=\"h1:27017\"",
            "data=\"shard_data\"",
        ] {
            assert!(sample.contains(label), "{} not in {}", label, sample);
        }
        assert!(sample.ends_with("} 1000"), "{}", sample);
    }

    #[test]
    fn test_dimension_names() {
        let names: Vec<String> = Dimension::ALL.iter().map(|d| d.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "shard_data",
                "shard_docs",
                "shard_chunks",
                "estimated_data_per_chunk",
                "estimated_docs_per_chunk",
            ]
        );
    }
}
