//! Most oplog information comes from here:
//! https://github.com/mongodb/mongo/blob/master/src/mongo/db/repl/oplog_entry.idl
//! https://github.com/mongodb/mongo/blob/master/src/mongo/db/repl/optime_and_wall_time_base.idl
//!
//! Useful fields:
//! ts: The time when the oplog entry was created. (Timestamp)
//! op: The operation type. (enum Optype)
//! ns: The namespace on which to apply the operation. (String)
//! o: The operation applied. (Document)
//! o2: Additional information about the operation applied. (Document)
//! fromMigrate: The entry was written by a chunk migration. (bool)
//!
//! For `op` field, the definition of OpType:
//! "c": Command
//! "i": Insert
//! "u": Update
//! "d": Delete
//! "n": Noop

use bson::{Bson, Document};

use crate::{
    Optime, Result, RiverError, COMMAND_OP, DELETE_OP, FROM_MIGRATE_KEY, ID_KEY, INSERT_OP,
    NAMESPACE_KEY, NOOP_OP, OBJ2_KEY, OBJ_KEY, OP_KEY, TIMESTAMP_KEY, UPDATE_OP,
};

/// One entry read from the oplog.  It's never changed after being read.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    /// position of this entry, nested transaction entries share their parent position.
    pub optime: Optime,
    /// namespace in `db.collection` form.
    pub namespace: String,
    /// what the entry does.
    pub kind: OpKind,
}

/// The operation carried by an oplog entry.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// a full document was inserted.
    Insert {
        /// inserted document `_id`.
        id: Bson,
        /// the full document.
        document: Document,
    },
    /// a document was updated, `modifier` is either a replacement or an update description.
    Update {
        /// updated document `_id`.
        id: Bson,
        /// replacement document, `$set`/`$unset` modifiers or a `$v: 2` diff.
        modifier: Document,
    },
    /// a document was deleted.
    Delete {
        /// deleted document `_id`.
        id: Bson,
    },
    /// a command, like drop collection or a transaction `applyOps`.
    Command(Document),
    /// nothing to replicate, the position still moves forward.
    Noop,
}

impl OperationRecord {
    /// Parse a raw oplog document.
    ///
    /// Entries from internal databases and entries written by chunk migration are returned
    /// as [OpKind::Noop] so their position can still be acknowledged.
    pub fn from_doc(doc: &Document) -> Result<Self> {
        let optime = Optime::from(doc.get_timestamp(TIMESTAMP_KEY)?);
        Self::from_doc_at(doc, optime)
    }

    /// Parse a raw oplog document which doesn't carry its own `ts`, like the nested entries of
    /// an `applyOps` command.
    pub fn from_doc_at(doc: &Document, optime: Optime) -> Result<Self> {
        let namespace = doc.get_str(NAMESPACE_KEY)?.to_string();
        let op = doc.get_str(OP_KEY)?;

        let kind = if doc.get_bool(FROM_MIGRATE_KEY).unwrap_or(false) {
            OpKind::Noop
        } else if op == COMMAND_OP {
            // transactions are logged against `admin.$cmd`, so commands skip the namespace filter.
            OpKind::Command(doc.get_document(OBJ_KEY)?.clone())
        } else if is_useless_namespace(&namespace) {
            OpKind::Noop
        } else {
            match op {
                INSERT_OP => {
                    let document = doc.get_document(OBJ_KEY)?.clone();
                    OpKind::Insert {
                        id: get_id(&document, OBJ_KEY)?,
                        document,
                    }
                }
                UPDATE_OP => OpKind::Update {
                    id: get_id(doc.get_document(OBJ2_KEY)?, OBJ2_KEY)?,
                    modifier: doc.get_document(OBJ_KEY)?.clone(),
                },
                DELETE_OP => OpKind::Delete {
                    id: get_id(doc.get_document(OBJ_KEY)?, OBJ_KEY)?,
                },
                NOOP_OP => OpKind::Noop,
                other => {
                    return Err(RiverError::malformed(format!(
                        "unknown oplog operation {:?} at {}",
                        other, optime
                    )))
                }
            }
        };

        Ok(OperationRecord {
            optime,
            namespace,
            kind,
        })
    }

    /// database part of the namespace.
    pub fn database(&self) -> &str {
        self.namespace
            .split_once('.')
            .map(|(db, _)| db)
            .unwrap_or(&self.namespace)
    }

    /// collection part of the namespace, empty when namespace has no collection.
    pub fn collection(&self) -> &str {
        self.namespace
            .split_once('.')
            .map(|(_, coll)| coll)
            .unwrap_or("")
    }
}

fn get_id(obj: &Document, obj_key: &str) -> Result<Bson> {
    obj.get(ID_KEY)
        .cloned()
        .ok_or_else(|| RiverError::malformed(format!("`{}` has no `{}` field", obj_key, ID_KEY)))
}

fn is_useless_namespace(ns: &str) -> bool {
    // namespace starts with "admin.", "local.", "config." is useless to use.
    ns.starts_with("admin.") || ns.starts_with("local.") || ns.starts_with("config.")
}
