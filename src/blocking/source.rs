use bson::{doc, Bson, Document, Timestamp};
use mongodb::options::{ClientOptions, FindOneOptions, FindOptions};
use mongodb::sync::{Client, Collection};
use std::time::Duration;

use crate::translate::DocumentFetcher;
use crate::{
    Optime, Result, RiverError, SourceConf, COMMAND_OP, NAMESPACE_KEY, NOOP_OP, OPLOG_COLL,
    OPLOG_DB, OP_KEY, TIMESTAMP_KEY,
};

/// A replicated data source the river can tail.
///
/// Implementations must return entries in oplog order, and report every connectivity or
/// replica set problem as [RiverError::SourceUnavailable].
pub trait OplogSource: DocumentFetcher + Send + Sync {
    /// position of the newest oplog entry, None when the oplog is empty.
    fn latest_optime(&self) -> Result<Option<Optime>>;

    /// position of the oldest oplog entry still kept, None when the oplog is empty.
    fn earliest_optime(&self) -> Result<Option<Optime>>;

    /// Read at most `limit` raw oplog entries strictly after `after` which pass `filter`.
    fn read_after(&self, after: Optime, filter: &OplogFilter, limit: usize) -> Result<Vec<Document>>;
}

/// Which oplog entries a river needs: everything on its namespace, commands of its
/// database, transactions and noops (to keep the position moving on a quiet collection).
#[derive(Debug, Clone, PartialEq)]
pub struct OplogFilter {
    db: String,
    collection: String,
}

impl OplogFilter {
    /// create a filter for `db.collection`.
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        OplogFilter {
            db: db.into(),
            collection: collection.into(),
        }
    }

    /// the replicated namespace.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.collection)
    }

    /// mongodb query selecting entries after `after`.
    pub fn to_query(&self, after: Optime) -> Document {
        doc! {
            TIMESTAMP_KEY: {"$gt": Timestamp::from(after)},
            "$or": [
                {NAMESPACE_KEY: self.namespace()},
                {NAMESPACE_KEY: format!("{}.$cmd", self.db), OP_KEY: COMMAND_OP},
                {NAMESPACE_KEY: "admin.$cmd", OP_KEY: COMMAND_OP},
                {OP_KEY: NOOP_OP},
            ]
        }
    }

    /// same selection as [to_query](OplogFilter::to_query), for in process sources.
    pub fn matches(&self, entry: &Document) -> bool {
        let ns = entry.get_str(NAMESPACE_KEY).unwrap_or("");
        let op = entry.get_str(OP_KEY).unwrap_or("");
        ns == self.namespace()
            || (op == COMMAND_OP && (ns == format!("{}.$cmd", self.db) || ns == "admin.$cmd"))
            || op == NOOP_OP
    }
}

/// Oplog source backed by a mongodb replica set.
///
/// Failover is handled by the driver's server discovery: after a primary step down, the
/// next read goes to the newly elected member.  Use `readPreference=primaryPreferred` in the
/// connection string to keep tailing from a secondary while no primary exists.
#[derive(Debug, Clone)]
pub struct MongoSource {
    client: Client,
    timeout: Duration,
}

impl MongoSource {
    /// connect to the replica set described by `conf`.
    ///
    /// Connecting, selecting a server and every query give up after `timeout`.
    pub fn new(conf: &SourceConf, timeout: Duration) -> Result<MongoSource> {
        let mut options = ClientOptions::parse(&conf.uri)?;
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        let client = Client::with_options(options)?;
        Ok(MongoSource { client, timeout })
    }

    fn oplog_coll(&self) -> Collection<Document> {
        self.client.database(OPLOG_DB).collection(OPLOG_COLL)
    }

    fn get_one_oplog_ts(&self, natural: i32) -> Result<Option<Optime>> {
        self.oplog_coll()
            .find_one(
                None,
                FindOneOptions::builder()
                    .sort(doc! {"$natural": natural})
                    .max_time(self.timeout)
                    .build(),
            )?
            .map(|d| d.get_timestamp(TIMESTAMP_KEY).map(Optime::from))
            .transpose()
            .map_err(RiverError::from)
    }
}

impl DocumentFetcher for MongoSource {
    fn fetch_document(&self, namespace: &str, id: &Bson) -> Result<Option<Document>> {
        let (db, coll) = namespace.split_once('.').ok_or_else(|| {
            RiverError::malformed(format!("invalid namespace {:?}", namespace))
        })?;
        let found = self
            .client
            .database(db)
            .collection::<Document>(coll)
            .find_one(
                doc! {"_id": id.clone()},
                FindOneOptions::builder().max_time(self.timeout).build(),
            )?;
        Ok(found)
    }
}

impl OplogSource for MongoSource {
    fn latest_optime(&self) -> Result<Option<Optime>> {
        self.get_one_oplog_ts(-1)
    }

    fn earliest_optime(&self) -> Result<Option<Optime>> {
        self.get_one_oplog_ts(1)
    }

    fn read_after(&self, after: Optime, filter: &OplogFilter, limit: usize) -> Result<Vec<Document>> {
        let cursor = self.oplog_coll().find(
            filter.to_query(after),
            FindOptions::builder()
                .sort(doc! {"$natural": 1})
                .limit(limit as i64)
                .max_time(self.timeout)
                .build(),
        )?;

        let mut result = vec![];
        for doc in cursor {
            result.push(doc?);
        }
        Ok(result)
    }
}
