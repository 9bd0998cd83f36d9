//! Provide structured command type oplog definition.

use bson::Bson;
use tracing::warn;

use crate::oplog::{OpKind, OperationRecord};
use crate::{Result, RiverError};

/// collection namespace.
#[derive(Debug, PartialEq)]
pub struct CollNs<'a> {
    /// database name.
    pub db_name: &'a str,
    /// collection name.
    pub coll_name: &'a str,
}

impl<'a> CollNs<'a> {
    /// construct a namespace from `db_name` and `coll_name`.
    pub fn new(db_name: &'a str, coll_name: &'a str) -> Self {
        CollNs { db_name, coll_name }
    }

    fn parse(ns: &'a str, key: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) => Ok(CollNs::new(db, coll)),
            None => Err(RiverError::malformed(format!(
                "`{}` should be a namespace split by '.', get {:?}",
                key, ns
            ))),
        }
    }

    /// true if this namespace is `db.coll`.
    pub fn is(&self, db: &str, coll: &str) -> bool {
        self.db_name == db && self.coll_name == coll
    }
}

/// Structured command type oplog definition.
///
/// Basically, use [CmdOplog::from_record] to parse mongodb command oplog, and then
/// [affects](CmdOplog::affects) to check if the command matters for a replicated collection.
#[derive(Debug, PartialEq)]
pub enum CmdOplog<'a> {
    /// rename collection command.
    RenameCollection {
        /// rename namespace from.
        from: CollNs<'a>,
        /// rename namespace to.
        to: CollNs<'a>,
    },
    /// drop collection command.
    DropCollection(CollNs<'a>),
    /// drop database command.
    DropDatabase(&'a str),
    /// create collection command.
    CreateCollection(CollNs<'a>),
    /// transaction, or any other batch of operations applied atomically.
    ApplyOps(Vec<OperationRecord>),
}

impl<'a> CmdOplog<'a> {
    /// Parse mongodb command oplog to create the item.
    ///
    /// It returns None when the command in `record` can't be recognized, or the record is not
    /// a command.
    ///
    /// # Example
    /// ```
    /// use mongo_river::cmd_oplog::{CmdOplog, CollNs};
    /// use mongo_river::{OperationRecord, OpKind, Optime};
    /// use bson::doc;
    /// let record = OperationRecord {
    ///     optime: Optime::new(1, 1),
    ///     namespace: "a.$cmd".to_string(),
    ///     kind: OpKind::Command(doc! {"renameCollection": "a.b", "to": "a.c"}),
    /// };
    /// let oplog = CmdOplog::from_record(&record).unwrap().unwrap();
    /// assert_eq!(
    ///     oplog,
    ///     CmdOplog::RenameCollection {
    ///         from: CollNs::new("a", "b"),
    ///         to: CollNs::new("a", "c")
    ///     }
    /// );
    /// ```
    pub fn from_record(record: &'a OperationRecord) -> Result<Option<Self>> {
        let obj = match &record.kind {
            OpKind::Command(obj) => obj,
            _ => return Ok(None),
        };
        let db = record.database();

        if obj.contains_key("renameCollection") {
            // obj structure:
            // {"renameCollection": "ns", "to": "ns"}
            let from = CollNs::parse(obj.get_str("renameCollection")?, "renameCollection")?;
            let to = CollNs::parse(obj.get_str("to")?, "to")?;
            Ok(Some(CmdOplog::RenameCollection { from, to }))
        } else if obj.contains_key("drop") {
            // obj structure:
            // { "drop": "coll" }
            let coll = obj.get_str("drop")?;
            Ok(Some(CmdOplog::DropCollection(CollNs::new(db, coll))))
        } else if obj.contains_key("dropDatabase") {
            // obj structure:
            // { "dropDatabase": 1 }
            Ok(Some(CmdOplog::DropDatabase(db)))
        } else if obj.contains_key("create") {
            // obj structure:
            // { "create": "coll" }
            let coll = obj.get_str("create")?;
            Ok(Some(CmdOplog::CreateCollection(CollNs::new(db, coll))))
        } else if obj.contains_key("applyOps") {
            // obj structure:
            // { "applyOps": [ {"op": "i", "ns": "a.b", "o": {...}}, ... ] }
            let mut nested = vec![];
            for op in obj.get_array("applyOps")? {
                match op {
                    Bson::Document(d) => nested.push(OperationRecord::from_doc_at(d, record.optime)?),
                    other => {
                        return Err(RiverError::malformed(format!(
                            "`applyOps` item should be a document, get {:?}",
                            other
                        )))
                    }
                }
            }
            Ok(Some(CmdOplog::ApplyOps(nested)))
        } else {
            warn!(?obj, "Get a command which can't be handled.");
            Ok(None)
        }
    }

    /// true when the command makes the replicated `db.coll` disappear, so the index has to be
    /// cleared.
    pub fn removes(&self, db: &str, coll: &str) -> bool {
        match self {
            CmdOplog::DropCollection(ns) => ns.is(db, coll),
            CmdOplog::DropDatabase(name) => *name == db,
            CmdOplog::RenameCollection { from, .. } => from.is(db, coll),
            _ => false,
        }
    }

    /// true when the command touches `db.coll` in any way.
    pub fn affects(&self, db: &str, coll: &str) -> bool {
        match self {
            CmdOplog::RenameCollection { from, to } => from.is(db, coll) || to.is(db, coll),
            CmdOplog::CreateCollection(ns) => ns.is(db, coll),
            CmdOplog::ApplyOps(ops) => ops.iter().any(|r| r.database() == db),
            _ => self.removes(db, coll),
        }
    }
}
