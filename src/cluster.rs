// Cluster module - read-only access to sharded cluster metadata
//
// This module is responsible for:
// 1. Connecting to the MongoDB router (mongos)
// 2. Running collStats for a collection and normalising the per-shard figures
// 3. Looking up collection identities, shard hosts and chunk ownership
//    in the `config` database
//
// Nothing here is cached: every call reflects the live topology.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, Database};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while talking to the cluster
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("MongoDB query failed: {0}")]
    Query(#[from] mongodb::error::Error),

    #[error("Malformed collStats response for '{collection}': {reason}")]
    MalformedStats { collection: String, reason: String },

    #[error("{operation} did not complete within {}s", timeout.as_secs_f64())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

/// Size figures reported by collStats for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    pub shard: String,
    pub size_bytes: u64,
    pub doc_count: u64,
}

/// Collection-level statistics, as far as the distribution is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub sharded: bool,

    /// Per-shard figures, in the order the server returned them
    pub shards: Vec<ShardStats>,
}

impl CollectionStats {
    /// Extracts the sharding flag and per-shard figures from a collStats reply.
    ///
    /// # Returns BSON Document Structure (relevant fields only)
    /// ```json
    /// {
    ///   "sharded": true,
    ///   "shards": {
    ///     "shardA": { "size": 1000, "count": 100 },
    ///     "shardB": { "size": 900, "count": 90 }
    ///   }
    /// }
    /// ```
    ///
    /// A missing `sharded` flag means the collection is not sharded, and the
    /// `shards` sub-document is only read when it is.
    pub fn from_document(collection: &str, reply: &Document) -> Result<Self, SourceError> {
        let malformed = |reason: String| SourceError::MalformedStats {
            collection: collection.to_string(),
            reason,
        };

        let sharded = match reply.get("sharded") {
            None => false,
            Some(Bson::Boolean(sharded)) => *sharded,
            Some(other) => {
                return Err(malformed(format!("'sharded' is not a boolean: {}", other)));
            }
        };
        if !sharded {
            return Ok(CollectionStats {
                sharded,
                shards: Vec::new(),
            });
        }

        let shards = reply
            .get_document("shards")
            .map_err(|e| malformed(format!("'shards': {}", e)))?;

        let mut stats = Vec::with_capacity(shards.len());
        for (shard, value) in shards {
            let figures = value.as_document().ok_or_else(|| {
                malformed(format!("entry for shard '{}' is not a document", shard))
            })?;
            let size_bytes = read_count(figures, "size")
                .map_err(|reason| malformed(format!("shard '{}': {}", shard, reason)))?;
            let doc_count = read_count(figures, "count")
                .map_err(|reason| malformed(format!("shard '{}': {}", shard, reason)))?;
            stats.push(ShardStats {
                shard: shard.clone(),
                size_bytes,
                doc_count,
            });
        }

        Ok(CollectionStats {
            sharded,
            shards: stats,
        })
    }
}

/// Reads a non-negative numeric field, whatever BSON width the server used.
///
/// Doubles are truncated toward zero.
fn read_count(document: &Document, field: &str) -> Result<u64, String> {
    let value = document
        .get(field)
        .ok_or_else(|| format!("missing '{}'", field))?;
    let count = match value {
        Bson::Int32(v) => i64::from(*v),
        Bson::Int64(v) => *v,
        Bson::Double(v) if v.is_finite() => v.trunc() as i64,
        other => return Err(format!("'{}' is not a number: {}", field, other)),
    };
    u64::try_from(count).map_err(|_| format!("'{}' is negative: {}", field, count))
}

/// Stable identifier of a sharded collection (the `uuid` in `config.collections`).
///
/// Kept as the raw BSON value so it can be matched verbatim against `config.chunks`.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionIdentity(pub Bson);

/// Read operations the distribution collector needs from the cluster.
///
/// The MongoDB implementation is [`MongoClusterMetadata`]; tests use an
/// in-memory fake.
#[async_trait]
pub trait ClusterMetadata: Send + Sync {
    /// Collection statistics from the configured database.
    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats, SourceError>;

    /// Identity of the collection registered under `namespace` ("db.collection").
    async fn collection_identity(
        &self,
        namespace: &str,
    ) -> Result<Option<CollectionIdentity>, SourceError>;

    /// Connection host string of a shard.
    async fn shard_host(&self, shard: &str) -> Result<Option<String>, SourceError>;

    /// Number of chunk ranges of the collection owned by `shard`.
    async fn count_chunks(
        &self,
        identity: &CollectionIdentity,
        shard: &str,
    ) -> Result<u64, SourceError>;
}

/// Document in `config.shards`
#[derive(Debug, Deserialize)]
struct ShardDocument {
    host: String,
}

/// Cluster metadata read through a mongos router.
pub struct MongoClusterMetadata {
    client: Client,

    /// Database whose collections are inspected
    database_name: String,
}

impl MongoClusterMetadata {
    /// Creates the MongoDB client and checks the connection with a ping.
    ///
    /// Only a malformed connection string is an error. An unreachable
    /// server is logged and left to the polling passes, which report it
    /// per collection and try again on the next interval.
    ///
    /// # Arguments
    /// * `connection_string` - MongoDB connection URI, ideally of a mongos router
    /// * `database_name` - Database holding the collections to inspect
    /// * `query_timeout` - Optional connect and server selection timeout
    pub async fn connect(
        connection_string: &str,
        database_name: &str,
        query_timeout: Option<Duration>,
    ) -> Result<Self, SourceError> {
        let mut options = ClientOptions::parse(connection_string).await?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        if let Some(timeout) = query_timeout {
            options.connect_timeout = Some(timeout);
            options.server_selection_timeout = Some(timeout);
        }

        let client = Client::with_options(options)?;

        match client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
        {
            Ok(_) => info!("Successfully connected to MongoDB"),
            Err(e) => warn!(
                "MongoDB is not reachable yet, polling will keep retrying: {}",
                e
            ),
        }

        Ok(MongoClusterMetadata {
            client,
            database_name: database_name.to_string(),
        })
    }

    fn config_database(&self) -> Database {
        self.client.database("config")
    }
}

#[async_trait]
impl ClusterMetadata for MongoClusterMetadata {
    /// Executes: `db.runCommand({ collStats: "<collection>" })`
    async fn collection_stats(&self, collection: &str) -> Result<CollectionStats, SourceError> {
        debug!("Running collStats for {}.{}", self.database_name, collection);
        let reply = self
            .client
            .database(&self.database_name)
            .run_command(doc! { "collStats": collection }, None)
            .await?;
        CollectionStats::from_document(collection, &reply)
    }

    /// Executes: `config.collections.findOne({ _id: "<namespace>" })`
    async fn collection_identity(
        &self,
        namespace: &str,
    ) -> Result<Option<CollectionIdentity>, SourceError> {
        let collections: Collection<Document> = self.config_database().collection("collections");
        let entry = collections
            .find_one(doc! { "_id": namespace }, None)
            .await?;
        Ok(entry.and_then(|entry| entry.get("uuid").cloned().map(CollectionIdentity)))
    }

    /// Executes: `config.shards.findOne({ _id: "<shard>" })`
    async fn shard_host(&self, shard: &str) -> Result<Option<String>, SourceError> {
        let shards: Collection<ShardDocument> = self.config_database().collection("shards");
        let entry = shards.find_one(doc! { "_id": shard }, None).await?;
        Ok(entry.map(|entry| entry.host))
    }

    /// Executes: `config.chunks.countDocuments({ uuid: <identity>, shard: "<shard>" })`
    async fn count_chunks(
        &self,
        identity: &CollectionIdentity,
        shard: &str,
    ) -> Result<u64, SourceError> {
        let chunks: Collection<Document> = self.config_database().collection("chunks");
        let filter = doc! { "uuid": identity.0.clone(), "shard": shard };
        Ok(chunks.count_documents(filter, None).await?)
    }
}
