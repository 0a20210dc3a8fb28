// Metric publisher - turns shard distribution records into gauge samples
//
// Every record expands into one sample per available dimension. Values
// overwrite whatever was published for the same labels before.

use prometheus::IntGaugeVec;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::Dimension;
use crate::distribution::ShardDistributionRecord;

/// Label values of one sample, in `DISTRIBUTION_LABELS` order
type LabelSet = [String; 5];

/// Writes shard distribution records into the gauge family.
///
/// Series whose labels stop being reported (a shard removed from the
/// cluster, a shard host change, estimates that become unavailable) are kept
/// as they are unless pruning is enabled. With pruning the publisher
/// remembers, per database and collection, the labels written by the last
/// publish and removes those the next publish no longer writes.
pub struct MetricPublisher {
    gauge: IntGaugeVec,
    prune_stale: bool,
    published: HashMap<(String, String), HashSet<LabelSet>>,
}

impl MetricPublisher {
    pub fn new(gauge: IntGaugeVec, prune_stale: bool) -> Self {
        MetricPublisher {
            gauge,
            prune_stale,
            published: HashMap::new(),
        }
    }

    /// Publishes the records of one collection.
    ///
    /// # Returns
    /// The number of samples written: 5 for a record with estimates,
    /// 3 for a shard that owns no chunks.
    pub fn publish(
        &mut self,
        database: &str,
        collection: &str,
        records: &[ShardDistributionRecord],
    ) -> usize {
        let mut written = HashSet::new();

        for record in records {
            let values = [
                (Dimension::ShardData, Some(record.shard_data_bytes)),
                (Dimension::ShardDocs, Some(record.shard_doc_count)),
                (Dimension::ShardChunks, Some(record.shard_chunk_count)),
                (Dimension::EstimatedDataPerChunk, record.estimated_bytes_per_chunk),
                (Dimension::EstimatedDocsPerChunk, record.estimated_docs_per_chunk),
            ];

            for (dimension, value) in values {
                let Some(value) = value else { continue };
                let labels = [
                    database,
                    collection,
                    record.shard_name.as_str(),
                    record.shard_host.as_str(),
                    dimension.as_str(),
                ];
                self.gauge
                    .with_label_values(&labels)
                    .set(i64::try_from(value).unwrap_or(i64::MAX));
                written.insert(labels.map(str::to_string));
            }
        }

        let count = written.len();
        debug!(
            "Published {} sample(s) for {}.{} from {} shard record(s)",
            count,
            database,
            collection,
            records.len()
        );

        if self.prune_stale {
            self.replace_published(database, collection, written);
        }
        count
    }

    /// Forgets a collection that is no longer sharded.
    ///
    /// Removes its series when pruning is enabled, does nothing otherwise.
    pub fn retire(&mut self, database: &str, collection: &str) {
        if self.prune_stale {
            self.replace_published(database, collection, HashSet::new());
        }
    }

    fn replace_published(&mut self, database: &str, collection: &str, current: HashSet<LabelSet>) {
        let key = (database.to_string(), collection.to_string());
        if let Some(previous) = self.published.remove(&key) {
            for stale in previous.difference(&current) {
                let labels: Vec<&str> = stale.iter().map(String::as_str).collect();
                match self.gauge.remove_label_values(&labels) {
                    Ok(()) => debug!("Removed stale series {:?}", stale),
                    Err(e) => debug!("Stale series {:?} already gone: {}", stale, e),
                }
            }
        }
        if !current.is_empty() {
            self.published.insert(key, current);
        }
    }
}
