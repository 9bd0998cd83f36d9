//! Mongo river lib, which replicates one mongodb collection into a search index by tailing
//! the replica set oplog.
//!
//! A river is made of a producer which tails the source oplog and translates every entry into
//! [MutationIntent]s, a bounded [HandoffQueue] which carries them to one or more bulk indexing
//! consumers, and a [CheckpointStore] which persists how far the river got inside the target
//! index itself.  A [Supervisor] owns all of them, and a [RiverRegistry] owns supervisors.
//!
//! # Supervisor example:
//! ```no_run
//! use mongo_river::{EsTarget, MongoSource, RiverConfig, Supervisor};
//! use std::sync::Arc;
//!
//! let conf: RiverConfig = toml::from_str(r#"
//!     name = "person_river"
//!     [source]
//!     uri = "mongodb://localhost:27017/?replicaSet=rs0"
//!     db = "mydb"
//!     collection = "person"
//!     [target]
//!     url = "http://localhost:9200"
//!     index = "mydb"
//!     type = "person"
//! "#).unwrap();
//! let source = Arc::new(MongoSource::new(&conf.source, conf.pipeline.request_timeout()).unwrap());
//! let target = Arc::new(EsTarget::new(&conf.target, conf.pipeline.request_timeout()).unwrap());
//! let supervisor = Supervisor::new(conf, source, target);
//! supervisor.start().unwrap();
//! supervisor.wait();
//! ```

#![warn(missing_docs)]

pub mod blocking;
#[doc(hidden)]
pub mod bson_helper;
pub mod cmd_oplog;
mod config;
mod error;
pub mod intent;
pub mod oplog;
mod optime;
mod stats;
pub mod translate;

/// mongodb internal database which saves oplogs.
const OPLOG_DB: &str = "local";
/// mongodb internal collection which saves oplogs.
const OPLOG_COLL: &str = "oplog.rs";

/// oplog namespace key name.
const NAMESPACE_KEY: &str = "ns";
/// oplog timestamp key name.
const TIMESTAMP_KEY: &str = "ts";
/// oplog operation key name.
const OP_KEY: &str = "op";
/// oplog operation object key name.
const OBJ_KEY: &str = "o";
/// oplog additional operation object key name, holds the `_id` for update oplogs.
const OBJ2_KEY: &str = "o2";
/// oplog flag which marks entries written by chunk migration.
const FROM_MIGRATE_KEY: &str = "fromMigrate";
/// document identifier key.
const ID_KEY: &str = "_id";

/// insert operation.
const INSERT_OP: &str = "i";
/// update operation.
const UPDATE_OP: &str = "u";
/// delete operation.
const DELETE_OP: &str = "d";
/// noop operation.
const NOOP_OP: &str = "n";
/// command operation.
const COMMAND_OP: &str = "c";

pub use blocking::{
    BulkIndexer, CheckpointStore, EsTarget, HandoffQueue, IndexTarget, MongoSource, OplogCursor,
    OplogSource, RiverRegistry, RiverState, Supervisor,
};
pub use config::{
    PartialUpdateMode, PipelineConf, RecoveryConf, RiverConfig, RiversConfig, SourceConf,
    StatisticsConf, TargetConf,
};
pub use error::{Result, RiverError};
pub use intent::{Action, MutationIntent};
pub use oplog::{OpKind, OperationRecord};
pub use optime::Optime;
pub use stats::{Statistics, StatsSnapshot};
