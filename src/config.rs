//! mongo river configuration, express in toml.
//!
//! Basic configuration file example:
//! ```toml
//! [[river]]
//! name = "person_river"
//!
//! [river.source]
//! # source db url, need to be a replica set.
//! uri = "mongodb://localhost:27017,localhost:27018/?replicaSet=rs0"
//! db = "mydb"
//! collection = "person"
//!
//! [river.target]
//! url = "http://localhost:9200"
//! index = "mydb"
//! type = "person"
//!
//! [river.pipeline]
//! bulk_size = 500
//! poll_interval_ms = 1000
//!
//! # optional, write river statistics into a dedicated index.
//! [river.statistics]
//! index = "stats-index"
//! type = "stats"
//! ```
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, RiverError};

/// All rivers defined in one configuration file.
#[derive(Deserialize, Debug, Clone)]
pub struct RiversConfig {
    /// river definitions, one per `[[river]]` table.
    #[serde(rename = "river", default)]
    pub rivers: Vec<RiverConfig>,
}

impl RiversConfig {
    /// parse and validate a configuration file content.
    pub fn from_toml(content: &str) -> Result<RiversConfig> {
        let conf: RiversConfig = toml::from_str(content)?;
        for river in conf.rivers.iter() {
            river.validate()?;
        }
        Ok(conf)
    }
}

/// One replication job.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RiverConfig {
    /// river name, unique inside one process.
    pub name: String,
    /// where to read oplog from.
    pub source: SourceConf,
    /// where to write documents to.
    pub target: TargetConf,
    /// batching and queueing behavior.
    #[serde(default)]
    pub pipeline: PipelineConf,
    /// how the supervisor retries after source failures.
    #[serde(default)]
    pub recovery: RecoveryConf,
    /// optional dedicated statistics location.
    #[serde(default)]
    pub statistics: Option<StatisticsConf>,
}

impl RiverConfig {
    /// create a river configuration with default pipeline and recovery settings.
    pub fn new(name: impl Into<String>, source: SourceConf, target: TargetConf) -> Self {
        RiverConfig {
            name: name.into(),
            source,
            target,
            pipeline: PipelineConf::default(),
            recovery: RecoveryConf::default(),
            statistics: None,
        }
    }

    /// source namespace, `db.collection`.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.source.db, self.source.collection)
    }

    /// identifier of the checkpoint document inside the target index.
    pub fn checkpoint_id(&self) -> String {
        self.target
            .checkpoint_id
            .clone()
            .unwrap_or_else(|| format!("{}_checkpoint", self.name))
    }

    /// Check that the configuration can drive a river.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(RiverError::Config {
                reason: format!("river {:?}: {}", self.name, reason),
            })
        };
        if self.name.is_empty() {
            return invalid("name must not be empty");
        }
        if self.source.db.is_empty() || self.source.collection.is_empty() {
            return invalid("source db and collection must not be empty");
        }
        if self.target.index.is_empty() {
            return invalid("target index must not be empty");
        }
        if self.pipeline.bulk_size == 0 {
            return invalid("bulk_size must be greater than 0");
        }
        if self.pipeline.queue_capacity == 0 {
            return invalid("queue_capacity must be greater than 0");
        }
        if self.pipeline.consumers == 0 {
            return invalid("consumers must be greater than 0");
        }
        if let Some(stats) = &self.statistics {
            if stats.index.is_empty() {
                return invalid("statistics index must not be empty");
            }
        }
        Ok(())
    }
}

/// Source replica set configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SourceConf {
    /// Source database url, it needs to be replica set, begins with 'mongodb://'
    pub uri: String,
    /// database name.
    pub db: String,
    /// collection name.
    pub collection: String,
    /// oplog time (seconds) to start from when no checkpoint exists, default is the oplog tail.
    #[serde(default)]
    pub initial_timestamp: Option<u32>,
    /// how partial updates are turned into index writes.
    #[serde(default)]
    pub partial_updates: PartialUpdateMode,
}

impl SourceConf {
    /// create a source configuration for `db.collection` behind `uri`.
    pub fn new(uri: impl Into<String>, db: impl Into<String>, collection: impl Into<String>) -> Self {
        SourceConf {
            uri: uri.into(),
            db: db.into(),
            collection: collection.into(),
            initial_timestamp: None,
            partial_updates: PartialUpdateMode::default(),
        }
    }
}

/// How an update oplog which only touches some fields reaches the index.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartialUpdateMode {
    /// send changed fields as a partial document, re-fetch only when a patch can't express it.
    Patch,
    /// always re-fetch the full document from source.
    Refetch,
}

impl Default for PartialUpdateMode {
    fn default() -> Self {
        PartialUpdateMode::Patch
    }
}

/// Target index configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TargetConf {
    /// search engine url.
    #[serde(default = "default_target_url")]
    pub url: String,
    /// index to replicate into.
    pub index: String,
    /// document type inside the index.
    #[serde(rename = "type", default = "default_doc_type")]
    pub doc_type: String,
    /// checkpoint document identifier, default is `<river name>_checkpoint`.
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

impl TargetConf {
    /// create a target configuration for `index`/`doc_type` on the default url.
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        TargetConf {
            url: default_target_url(),
            index: index.into(),
            doc_type: doc_type.into(),
            checkpoint_id: None,
        }
    }
}

/// Pipeline tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipelineConf {
    /// maximum intents in one bulk request.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    /// how long a consumer waits to fill a batch.
    #[serde(default = "default_bulk_timeout_ms")]
    pub bulk_timeout_ms: u64,
    /// hand-off queue capacity, the producer blocks when it's full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// how long the cursor sleeps when the oplog has nothing new.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// how many bulk indexing consumers to run.
    #[serde(default = "half_number_of_cpus")]
    pub consumers: usize,
    /// how many times a retryable bulk item is re-sent.
    #[serde(default = "default_max_item_retries")]
    pub max_item_retries: u32,
    /// backoff between item retries, grows linearly with the attempt.
    #[serde(default = "default_item_retry_backoff_ms")]
    pub item_retry_backoff_ms: u64,
    /// network timeout for source and target calls.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl PipelineConf {
    /// bulk timeout as a duration.
    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    /// poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// item retry backoff as a duration.
    pub fn item_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.item_retry_backoff_ms)
    }

    /// network timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for PipelineConf {
    fn default() -> Self {
        PipelineConf {
            bulk_size: default_bulk_size(),
            bulk_timeout_ms: default_bulk_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            consumers: half_number_of_cpus(),
            max_item_retries: default_max_item_retries(),
            item_retry_backoff_ms: default_item_retry_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Supervisor recovery settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecoveryConf {
    /// first backoff before reopening the pipeline.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// how many consecutive failed reopen attempts move the river to error state.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl RecoveryConf {
    /// backoff before the `attempt`-th (zero based) reopen.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl Default for RecoveryConf {
    fn default() -> Self {
        RecoveryConf {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Where statistics are written.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatisticsConf {
    /// statistics index name.
    pub index: String,
    /// statistics document type.
    #[serde(rename = "type", default = "default_doc_type")]
    pub doc_type: String,
    /// how often statistics are saved while the river runs.
    #[serde(default = "default_stats_interval_ms")]
    pub interval_ms: u64,
}

impl StatisticsConf {
    /// create a statistics location with default interval.
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        StatisticsConf {
            index: index.into(),
            doc_type: doc_type.into(),
            interval_ms: default_stats_interval_ms(),
        }
    }

    /// save interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_target_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_doc_type() -> String {
    "_doc".to_string()
}

fn default_bulk_size() -> usize {
    1000
}

fn default_bulk_timeout_ms() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    5 * default_bulk_size()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn half_number_of_cpus() -> usize {
    (num_cpus::get() / 2).max(1)
}

fn default_max_item_retries() -> u32 {
    3
}

fn default_item_retry_backoff_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_stats_interval_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rivers_with_defaults() {
        let content = r#"
            [[river]]
            name = "person_river"
            [river.source]
            uri = "mongodb://localhost:27017/?replicaSet=rs0"
            db = "mydb"
            collection = "person"
            [river.target]
            index = "mydb"
            type = "person"
            [river.statistics]
            index = "stats-index"
            type = "stats"
        "#;
        let conf = RiversConfig::from_toml(content).unwrap();
        assert_eq!(conf.rivers.len(), 1);
        let river = &conf.rivers[0];
        assert_eq!(river.namespace(), "mydb.person");
        assert_eq!(river.checkpoint_id(), "person_river_checkpoint");
        assert_eq!(river.target.url, "http://localhost:9200");
        assert_eq!(river.pipeline.bulk_size, 1000);
        assert_eq!(river.pipeline.queue_capacity, 5000);
        assert_eq!(river.source.partial_updates, PartialUpdateMode::Patch);
        assert!(river.pipeline.consumers >= 1);
        let stats = river.statistics.as_ref().unwrap();
        assert_eq!(stats.index, "stats-index");
        assert_eq!(stats.doc_type, "stats");
    }

    #[test]
    fn test_validate_rejects_zero_bulk_size() {
        let content = r#"
            [[river]]
            name = "r"
            [river.source]
            uri = "mongodb://localhost"
            db = "a"
            collection = "b"
            [river.target]
            index = "a"
            [river.pipeline]
            bulk_size = 0
        "#;
        let err = RiversConfig::from_toml(content).unwrap_err();
        assert!(matches!(err, RiverError::Config { .. }));
    }

    #[test]
    fn test_recovery_backoff_is_capped() {
        let conf = RecoveryConf {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            max_retries: 5,
        };
        assert_eq!(conf.backoff(0), Duration::from_millis(100));
        assert_eq!(conf.backoff(2), Duration::from_millis(400));
        assert_eq!(conf.backoff(10), Duration::from_millis(1000));
        assert_eq!(conf.backoff(100), Duration::from_millis(1000));
    }
}
