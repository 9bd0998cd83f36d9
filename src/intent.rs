//! Index mutations derived from oplog entries.
use serde_json::{Map, Value};

use crate::Optime;

/// What to do with one index document.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// write the whole document, replacing any previous version.
    UpsertFull(Map<String, Value>),
    /// merge the given fields into the existing document.
    UpsertPartial(Map<String, Value>),
    /// remove the document.
    Delete,
    /// remove every document of the index, the source collection is gone.
    ClearIndex,
}

impl Action {
    /// short name used in logs and bulk requests.
    pub fn name(&self) -> &'static str {
        match self {
            Action::UpsertFull(_) => "index",
            Action::UpsertPartial(_) => "update",
            Action::Delete => "delete",
            Action::ClearIndex => "clear",
        }
    }
}

/// One mutation the pipeline owns until the index acknowledges it.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationIntent {
    /// target index.
    pub index: String,
    /// target document type.
    pub doc_type: String,
    /// target document id, empty for [Action::ClearIndex].
    pub id: String,
    /// the mutation.
    pub action: Action,
    /// position of the oplog entry this intent comes from.
    pub optime: Optime,
}

impl MutationIntent {
    /// true for intents which act on the whole index rather than one document.
    pub fn is_control(&self) -> bool {
        matches!(self.action, Action::ClearIndex)
    }

    /// true for intents whose result doesn't depend on what the index already holds.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self.action, Action::UpsertPartial(_))
    }
}
