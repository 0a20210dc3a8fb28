// Distribution module - derives per-shard chunk distribution figures
//
// For one collection this reads collStats, resolves the collection identity,
// and for every shard holding data looks up its host and chunk count to
// estimate the average chunk size and document count.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::{ClusterMetadata, SourceError};

/// Errors that abort the distribution of a single collection
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Collection identity not found in config.collections for namespace '{0}'")]
    CollectionIdentityNotFound(String),

    #[error("Shard '{shard}' referenced by '{namespace}' statistics not found in config.shards")]
    ShardNotFound { namespace: String, shard: String },

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Distribution figures of one collection on one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDistributionRecord {
    pub shard_name: String,
    pub shard_host: String,
    pub shard_data_bytes: u64,
    pub shard_doc_count: u64,
    pub shard_chunk_count: u64,

    /// `None` when the shard owns no chunks
    pub estimated_bytes_per_chunk: Option<u64>,

    /// `None` when the shard owns no chunks
    pub estimated_docs_per_chunk: Option<u64>,
}

impl ShardDistributionRecord {
    /// Builds a record, deriving the per-chunk estimates by truncating
    /// integer division. A shard with zero chunks gets no estimates.
    pub fn new(
        shard_name: String,
        shard_host: String,
        shard_data_bytes: u64,
        shard_doc_count: u64,
        shard_chunk_count: u64,
    ) -> Self {
        ShardDistributionRecord {
            estimated_bytes_per_chunk: shard_data_bytes.checked_div(shard_chunk_count),
            estimated_docs_per_chunk: shard_doc_count.checked_div(shard_chunk_count),
            shard_name,
            shard_host,
            shard_data_bytes,
            shard_doc_count,
            shard_chunk_count,
        }
    }
}

/// Result of inspecting one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionOutcome {
    /// The collection is not sharded; nothing should be published for it.
    NotPartitioned,

    /// One record per shard, in the order collStats listed the shards.
    Partitioned(Vec<ShardDistributionRecord>),
}

/// Computes shard distributions for collections of one database.
pub struct DistributionCollector {
    cluster: Arc<dyn ClusterMetadata>,
    database_name: String,

    /// Deadline applied to every metadata query
    query_timeout: Option<Duration>,
}

impl DistributionCollector {
    pub fn new(cluster: Arc<dyn ClusterMetadata>, database_name: &str) -> Self {
        DistributionCollector {
            cluster,
            database_name: database_name.to_string(),
            query_timeout: None,
        }
    }

    /// Bounds each metadata query; an expired query fails with `SourceError::Timeout`.
    pub fn with_query_timeout(mut self, query_timeout: Option<Duration>) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Computes the distribution of `collection` across the shards.
    ///
    /// # Returns
    /// * `Ok(NotPartitioned)` - The collection is not sharded
    /// * `Ok(Partitioned(records))` - One record per shard holding the collection
    /// * `Err(CollectError)` - Metadata is inconsistent or the cluster is unreachable
    pub async fn compute_distribution(
        &self,
        collection: &str,
    ) -> Result<DistributionOutcome, CollectError> {
        let stats = self
            .bounded("collStats", self.cluster.collection_stats(collection))
            .await?;
        if !stats.sharded {
            debug!("Collection {} is not sharded.", collection);
            return Ok(DistributionOutcome::NotPartitioned);
        }

        let namespace = format!("{}.{}", self.database_name, collection);
        let identity = self
            .bounded(
                "config.collections lookup",
                self.cluster.collection_identity(&namespace),
            )
            .await?
            .ok_or_else(|| CollectError::CollectionIdentityNotFound(namespace.clone()))?;

        let mut records = Vec::with_capacity(stats.shards.len());
        for shard in stats.shards {
            let host = self
                .bounded("config.shards lookup", self.cluster.shard_host(&shard.shard))
                .await?
                .ok_or_else(|| CollectError::ShardNotFound {
                    namespace: namespace.clone(),
                    shard: shard.shard.clone(),
                })?;

            let chunks = self
                .bounded(
                    "config.chunks count",
                    self.cluster.count_chunks(&identity, &shard.shard),
                )
                .await?;
            if chunks == 0 {
                warn!(
                    "Shard '{}' holds data of {} but owns no chunks, skipping per-chunk estimates",
                    shard.shard, namespace
                );
            }

            let record = ShardDistributionRecord::new(
                shard.shard,
                host,
                shard.size_bytes,
                shard.doc_count,
                chunks,
            );
            debug!(
                "{} on {} ({}): {} bytes, {} docs, {} chunks",
                namespace,
                record.shard_name,
                record.shard_host,
                record.shard_data_bytes,
                record.shard_doc_count,
                record.shard_chunk_count
            );
            records.push(record);
        }

        Ok(DistributionOutcome::Partitioned(records))
    }

    async fn bounded<T, F>(&self, operation: &'static str, query: F) -> Result<T, SourceError>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        match self.query_timeout {
            None => query.await,
            Some(timeout) => tokio::time::timeout(timeout, query)
                .await
                .map_err(|_| SourceError::Timeout { operation, timeout })?,
        }
    }
}
