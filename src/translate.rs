//! Turn oplog entries into index mutations.
//!
//! Inserts and replacement updates become [Action::UpsertFull], deletes become
//! [Action::Delete], and commands which make the replicated collection disappear become
//! [Action::ClearIndex].  Field level updates become [Action::UpsertPartial] when the changed
//! fields can be expressed as a document to deep merge, otherwise the current document is
//! fetched again from the source.
use bson::{Bson, Document};
use serde_json::Map;
use tracing::{debug, warn};

use crate::bson_helper::{doc_id, is_array_path, set_path, to_index_doc, to_index_value};
use crate::cmd_oplog::CmdOplog;
use crate::intent::{Action, MutationIntent};
use crate::oplog::{OpKind, OperationRecord};
use crate::{PartialUpdateMode, Result, RiverConfig, RiverError};

/// Read the current version of a source document.
pub trait DocumentFetcher {
    /// fetch document `id` from `namespace`, None when it doesn't exist anymore.
    fn fetch_document(&self, namespace: &str, id: &Bson) -> Result<Option<Document>>;
}

/// Oplog entry translator for one river.
#[derive(Debug, Clone)]
pub struct Translator {
    db: String,
    collection: String,
    namespace: String,
    index: String,
    doc_type: String,
    mode: PartialUpdateMode,
}

/// Changed fields of a partial update, when they can be merged without the full document.
enum Patch {
    Merge(Map<String, serde_json::Value>),
    Refetch,
}

impl Translator {
    /// create a translator for the river defined by `conf`.
    pub fn new(conf: &RiverConfig) -> Self {
        Translator {
            db: conf.source.db.clone(),
            collection: conf.source.collection.clone(),
            namespace: conf.namespace(),
            index: conf.target.index.clone(),
            doc_type: conf.target.doc_type.clone(),
            mode: conf.source.partial_updates,
        }
    }

    /// Translate one oplog entry.
    ///
    /// An empty result means the entry doesn't concern this river.  Entries which can't be
    /// interpreted return [RiverError::MalformedOperation].
    pub fn translate<F: DocumentFetcher + ?Sized>(
        &self,
        record: &OperationRecord,
        fetcher: &F,
    ) -> Result<Vec<MutationIntent>> {
        match &record.kind {
            OpKind::Noop => Ok(vec![]),
            OpKind::Command(_) => self.translate_command(record, fetcher),
            _ if record.namespace != self.namespace => Ok(vec![]),
            OpKind::Insert { id, document } => Ok(vec![self.intent(
                record,
                doc_id(id),
                Action::UpsertFull(to_index_doc(document)),
            )]),
            OpKind::Delete { id } => Ok(vec![self.intent(record, doc_id(id), Action::Delete)]),
            OpKind::Update { id, modifier } => self.translate_update(record, id, modifier, fetcher),
        }
    }

    fn translate_update<F: DocumentFetcher + ?Sized>(
        &self,
        record: &OperationRecord,
        id: &Bson,
        modifier: &Document,
        fetcher: &F,
    ) -> Result<Vec<MutationIntent>> {
        let is_diff = matches!(modifier.get("$v"), Some(Bson::Int32(2)) | Some(Bson::Int64(2)));
        let mut obj = modifier.clone();
        // $v is only for mongodb internal usage.
        obj.remove("$v");

        let is_update = is_diff || obj.keys().any(|x| x.starts_with('$'));
        if !is_update {
            // full document replacement.
            return Ok(vec![self.intent(
                record,
                doc_id(id),
                Action::UpsertFull(to_index_doc(&obj)),
            )]);
        }

        let patch = match self.mode {
            PartialUpdateMode::Refetch => Patch::Refetch,
            PartialUpdateMode::Patch if is_diff => patch_from_diff(&obj)?,
            PartialUpdateMode::Patch => patch_from_modifier(&obj)?,
        };
        match patch {
            Patch::Merge(fields) if fields.is_empty() => Ok(vec![]),
            Patch::Merge(fields) => Ok(vec![self.intent(
                record,
                doc_id(id),
                Action::UpsertPartial(fields),
            )]),
            Patch::Refetch => {
                debug!(optime = %record.optime, ?id, "Re-fetch document for partial update.");
                match fetcher.fetch_document(&record.namespace, id)? {
                    Some(doc) => Ok(vec![self.intent(
                        record,
                        doc_id(id),
                        Action::UpsertFull(to_index_doc(&doc)),
                    )]),
                    // the document is gone, its delete oplog comes later.
                    None => Ok(vec![]),
                }
            }
        }
    }

    fn translate_command<F: DocumentFetcher + ?Sized>(
        &self,
        record: &OperationRecord,
        fetcher: &F,
    ) -> Result<Vec<MutationIntent>> {
        let cmd = match CmdOplog::from_record(record)? {
            Some(cmd) => cmd,
            None => return Ok(vec![]),
        };
        if let CmdOplog::ApplyOps(ops) = &cmd {
            let mut intents = vec![];
            for op in ops {
                intents.extend(self.translate(op, fetcher)?);
            }
            return Ok(intents);
        }
        if cmd.removes(&self.db, &self.collection) {
            return Ok(vec![self.intent(record, String::new(), Action::ClearIndex)]);
        }
        if cmd.affects(&self.db, &self.collection) {
            warn!(?cmd, namespace = %self.namespace, "Command touches replicated collection, but needs no index change.");
        }
        Ok(vec![])
    }

    fn intent(&self, record: &OperationRecord, id: String, action: Action) -> MutationIntent {
        MutationIntent {
            index: self.index.clone(),
            doc_type: self.doc_type.clone(),
            id,
            action,
            optime: record.optime,
        }
    }
}

// classic update description:
// { "$set": {"a": 1, "b.c": 2}, "$unset": {"d": true} }
fn patch_from_modifier(modifier: &Document) -> Result<Patch> {
    let mut fields = Map::new();
    for (op, body) in modifier {
        match op.as_str() {
            "$set" => {
                let body = as_document(op, body)?;
                if !set_fields(&mut fields, body) {
                    return Ok(Patch::Refetch);
                }
            }
            // removing a field can't be expressed by merging.
            _ => return Ok(Patch::Refetch),
        }
    }
    Ok(Patch::Merge(fields))
}

// `$v: 2` update description:
// { "diff": { "u": {"a": 1}, "i": {"b": 2}, "d": {"c": false}, "sd": {...sub diff...} } }
fn patch_from_diff(obj: &Document) -> Result<Patch> {
    let diff = obj.get_document("diff")?;
    let mut fields = Map::new();
    for (section, body) in diff {
        match section.as_str() {
            "u" | "i" => {
                let body = as_document(section, body)?;
                if !set_fields(&mut fields, body) {
                    return Ok(Patch::Refetch);
                }
            }
            // field deletes and nested array/object sub diffs.
            _ => return Ok(Patch::Refetch),
        }
    }
    Ok(Patch::Merge(fields))
}

// a whole sub-document replaces the stored one, which a merge cannot express.
fn set_fields(fields: &mut Map<String, serde_json::Value>, body: &Document) -> bool {
    for (path, value) in body {
        if is_array_path(path)
            || matches!(value, Bson::Document(_))
            || !set_path(fields, path, to_index_value(value))
        {
            return false;
        }
    }
    true
}

fn as_document<'a>(key: &str, value: &'a Bson) -> Result<&'a Document> {
    match value {
        Bson::Document(d) => Ok(d),
        other => Err(RiverError::malformed(format!(
            "update section `{}` should be a document, get {:?}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Optime, SourceConf, TargetConf};
    use bson::doc;
    use serde_json::{json, Value};
    use std::cell::RefCell;

    struct FakeFetcher {
        doc: Option<Document>,
        calls: RefCell<usize>,
    }

    impl FakeFetcher {
        fn new(doc: Option<Document>) -> Self {
            FakeFetcher {
                doc,
                calls: RefCell::new(0),
            }
        }
    }

    impl DocumentFetcher for FakeFetcher {
        fn fetch_document(&self, _namespace: &str, _id: &Bson) -> Result<Option<Document>> {
            *self.calls.borrow_mut() += 1;
            Ok(self.doc.clone())
        }
    }

    fn translator(mode: PartialUpdateMode) -> Translator {
        let mut source = SourceConf::new("mongodb://localhost", "db", "person");
        source.partial_updates = mode;
        Translator::new(&RiverConfig::new(
            "river",
            source,
            TargetConf::new("idx", "person"),
        ))
    }

    fn record(kind: OpKind) -> OperationRecord {
        OperationRecord {
            optime: Optime::new(100, 1),
            namespace: "db.person".to_string(),
            kind,
        }
    }

    fn update(modifier: Document) -> OperationRecord {
        record(OpKind::Update {
            id: Bson::String("p1".to_string()),
            modifier,
        })
    }

    #[test]
    fn test_translate_insert() {
        let fetcher = FakeFetcher::new(None);
        let intents = translator(PartialUpdateMode::Patch)
            .translate(
                &record(OpKind::Insert {
                    id: Bson::String("p1".to_string()),
                    document: doc! {"_id": "p1", "name": "Richard"},
                }),
                &fetcher,
            )
            .unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].id, "p1");
        assert_eq!(intents[0].index, "idx");
        assert_eq!(intents[0].optime, Optime::new(100, 1));
        assert_eq!(
            intents[0].action,
            Action::UpsertFull(json!({"name": "Richard"}).as_object().cloned().unwrap())
        );
    }

    #[test]
    fn test_translate_delete_and_other_namespace() {
        let t = translator(PartialUpdateMode::Patch);
        let fetcher = FakeFetcher::new(None);
        let intents = t
            .translate(&record(OpKind::Delete { id: Bson::Int32(3) }), &fetcher)
            .unwrap();
        assert_eq!(intents[0].action, Action::Delete);
        assert_eq!(intents[0].id, "3");

        let mut other = record(OpKind::Delete { id: Bson::Int32(3) });
        other.namespace = "db.other".to_string();
        assert!(t.translate(&other, &fetcher).unwrap().is_empty());
    }

    #[test]
    fn test_translate_replacement_update() {
        let fetcher = FakeFetcher::new(None);
        let intents = translator(PartialUpdateMode::Patch)
            .translate(&update(doc! {"_id": "p1", "name": "Bob"}), &fetcher)
            .unwrap();
        assert!(matches!(intents[0].action, Action::UpsertFull(_)));
    }

    #[test]
    fn test_translate_set_becomes_partial() {
        let fetcher = FakeFetcher::new(None);
        let intents = translator(PartialUpdateMode::Patch)
            .translate(
                &update(doc! {"$v": 1, "$set": {"age": 30, "address.city": "Paris"}}),
                &fetcher,
            )
            .unwrap();
        match &intents[0].action {
            Action::UpsertPartial(fields) => assert_eq!(
                Value::Object(fields.clone()),
                json!({"age": 30, "address": {"city": "Paris"}})
            ),
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(*fetcher.calls.borrow(), 0);
    }

    #[test]
    fn test_translate_diff_update_becomes_partial() {
        let fetcher = FakeFetcher::new(None);
        let intents = translator(PartialUpdateMode::Patch)
            .translate(&update(doc! {"$v": 2, "diff": {"u": {"age": 31}}}), &fetcher)
            .unwrap();
        assert_eq!(
            intents[0].action,
            Action::UpsertPartial(json!({"age": 31}).as_object().cloned().unwrap())
        );
    }

    #[test]
    fn test_translate_unset_refetches() {
        let fetcher = FakeFetcher::new(Some(doc! {"_id": "p1", "name": "Richard"}));
        let intents = translator(PartialUpdateMode::Patch)
            .translate(&update(doc! {"$unset": {"age": true}}), &fetcher)
            .unwrap();
        assert_eq!(*fetcher.calls.borrow(), 1);
        assert_eq!(
            intents[0].action,
            Action::UpsertFull(json!({"name": "Richard"}).as_object().cloned().unwrap())
        );
    }

    #[test]
    fn test_translate_array_path_and_sub_diff_refetch() {
        let t = translator(PartialUpdateMode::Patch);
        let fetcher = FakeFetcher::new(None);
        // document vanished meanwhile, nothing to write.
        assert!(t
            .translate(&update(doc! {"$set": {"tags.1": "x"}}), &fetcher)
            .unwrap()
            .is_empty());
        assert!(t
            .translate(
                &update(doc! {"$v": 2, "diff": {"stags": {"a": true, "u1": "x"}}}),
                &fetcher
            )
            .unwrap()
            .is_empty());
        assert_eq!(*fetcher.calls.borrow(), 2);
    }

    #[test]
    fn test_translate_set_sub_document_refetches() {
        let fetcher = FakeFetcher::new(Some(doc! {"_id": "p1", "address": {"city": "Paris"}}));
        let t = translator(PartialUpdateMode::Patch);
        let intents = t
            .translate(&update(doc! {"$set": {"address": {"city": "Paris"}}}), &fetcher)
            .unwrap();
        assert_eq!(
            intents[0].action,
            Action::UpsertFull(
                json!({"address": {"city": "Paris"}})
                    .as_object()
                    .cloned()
                    .unwrap()
            )
        );
        t.translate(
            &update(doc! {"$v": 2, "diff": {"i": {"address": {"city": "Paris"}}}}),
            &fetcher,
        )
        .unwrap();
        assert_eq!(*fetcher.calls.borrow(), 2);
    }

    #[test]
    fn test_translate_refetch_mode() {
        let fetcher = FakeFetcher::new(Some(doc! {"_id": "p1", "age": 3}));
        let intents = translator(PartialUpdateMode::Refetch)
            .translate(&update(doc! {"$set": {"age": 3}}), &fetcher)
            .unwrap();
        assert!(matches!(intents[0].action, Action::UpsertFull(_)));
        assert_eq!(*fetcher.calls.borrow(), 1);
    }

    #[test]
    fn test_translate_drop_collection_clears_index() {
        let fetcher = FakeFetcher::new(None);
        let t = translator(PartialUpdateMode::Patch);
        let mut drop = record(OpKind::Command(doc! {"drop": "person"}));
        drop.namespace = "db.$cmd".to_string();
        let intents = t.translate(&drop, &fetcher).unwrap();
        assert_eq!(intents.len(), 1);
        assert!(intents[0].is_control());

        let mut drop_other = record(OpKind::Command(doc! {"drop": "other"}));
        drop_other.namespace = "db.$cmd".to_string();
        assert!(t.translate(&drop_other, &fetcher).unwrap().is_empty());
    }

    #[test]
    fn test_translate_transaction() {
        let fetcher = FakeFetcher::new(None);
        let mut txn = record(OpKind::Command(doc! {"applyOps": [
            {"op": "i", "ns": "db.person", "o": {"_id": "a", "x": 1}},
            {"op": "i", "ns": "db.other", "o": {"_id": "b", "x": 1}},
            {"op": "d", "ns": "db.person", "o": {"_id": "c"}},
        ]}));
        txn.namespace = "admin.$cmd".to_string();
        let intents = translator(PartialUpdateMode::Patch)
            .translate(&txn, &fetcher)
            .unwrap();
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].id, "a");
        assert_eq!(intents[1].action, Action::Delete);
    }

    #[test]
    fn test_translate_malformed_set() {
        let fetcher = FakeFetcher::new(None);
        let result =
            translator(PartialUpdateMode::Patch).translate(&update(doc! {"$set": 1}), &fetcher);
        assert!(matches!(result, Err(RiverError::MalformedOperation { .. })));
    }
}
