//! In process source and target, used by tests and local demos.
//!
//! [MemorySource] keeps collections plus an oplog and writes both the way a replica set
//! primary does.  [MemoryIndex] keeps documents per index and type and applies bulk requests
//! in order.  Both can be told to fail, to exercise recovery paths.
use bson::{doc, Bson, Document, Timestamp};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::source::{OplogFilter, OplogSource};
use super::target::{IndexTarget, ItemOutcome};
use crate::bson_helper::{doc_id, merge};
use crate::intent::{Action, MutationIntent};
use crate::translate::DocumentFetcher;
use crate::{Optime, Result, RiverError, ID_KEY, TIMESTAMP_KEY};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct SourceState {
    clock: u32,
    oplog: Vec<Document>,
    collections: HashMap<String, BTreeMap<String, Document>>,
    failing_reads: usize,
    unavailable: bool,
    reads: usize,
}

impl SourceState {
    fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        Timestamp {
            time: 1_600_000_000 + self.clock,
            increment: 1,
        }
    }

    fn log(&mut self, mut entry: Document) -> Optime {
        let ts = self.tick();
        entry.insert(TIMESTAMP_KEY, ts);
        self.oplog.push(entry);
        Optime::from(ts)
    }

    fn check_available(&mut self) -> Result<()> {
        if self.unavailable {
            return Err(RiverError::SourceUnavailable {
                detail: "no primary available".to_string(),
            });
        }
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(RiverError::SourceUnavailable {
                detail: "primary stepped down".to_string(),
            });
        }
        Ok(())
    }
}

/// In process replica set with a single collection per namespace.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<SourceState>,
}

impl MemorySource {
    /// create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `doc`, which must carry an `_id`.
    pub fn insert(&self, ns: &str, doc: Document) -> Optime {
        let mut state = lock(&self.state);
        let id = doc.get(ID_KEY).map(doc_id).unwrap_or_default();
        state
            .collections
            .entry(ns.to_string())
            .or_default()
            .insert(id, doc.clone());
        state.log(doc! {"op": "i", "ns": ns, "o": doc})
    }

    /// Apply a `$set` update, dotted paths create nested documents.
    pub fn update_set(&self, ns: &str, id: impl Into<Bson>, set: Document) -> Optime {
        let id = id.into();
        let mut state = lock(&self.state);
        if let Some(current) = state
            .collections
            .get_mut(ns)
            .and_then(|coll| coll.get_mut(&doc_id(&id)))
        {
            for (path, value) in set.iter() {
                set_dotted(current, path, value.clone());
            }
        }
        state.log(doc! {"op": "u", "ns": ns, "o2": {"_id": id}, "o": {"$v": 1, "$set": set}})
    }

    /// Remove top level `fields` with `$unset`.
    pub fn unset(&self, ns: &str, id: impl Into<Bson>, fields: &[&str]) -> Optime {
        let id = id.into();
        let mut state = lock(&self.state);
        if let Some(current) = state
            .collections
            .get_mut(ns)
            .and_then(|coll| coll.get_mut(&doc_id(&id)))
        {
            for field in fields {
                current.remove(*field);
            }
        }
        let mut unset = Document::new();
        for field in fields {
            unset.insert(*field, true);
        }
        state.log(doc! {"op": "u", "ns": ns, "o2": {"_id": id}, "o": {"$unset": unset}})
    }

    /// Replace the whole document with the same `_id`.
    pub fn replace(&self, ns: &str, doc: Document) -> Optime {
        let id = doc.get(ID_KEY).cloned().unwrap_or(Bson::Null);
        let mut state = lock(&self.state);
        state
            .collections
            .entry(ns.to_string())
            .or_default()
            .insert(doc_id(&id), doc.clone());
        state.log(doc! {"op": "u", "ns": ns, "o2": {"_id": id}, "o": doc})
    }

    /// Delete one document.
    pub fn delete(&self, ns: &str, id: impl Into<Bson>) -> Optime {
        let id = id.into();
        let mut state = lock(&self.state);
        if let Some(coll) = state.collections.get_mut(ns) {
            coll.remove(&doc_id(&id));
        }
        state.log(doc! {"op": "d", "ns": ns, "o": {"_id": id}})
    }

    /// Drop the collection `ns`.
    pub fn drop_collection(&self, ns: &str) -> Optime {
        let (db, coll) = ns.split_once('.').unwrap_or((ns, ""));
        let mut state = lock(&self.state);
        state.collections.remove(ns);
        state.log(doc! {"op": "c", "ns": format!("{}.$cmd", db), "o": {"drop": coll}})
    }

    /// Insert `docs` in one multi document transaction.
    pub fn insert_many_in_transaction(&self, ns: &str, docs: Vec<Document>) -> Optime {
        let mut state = lock(&self.state);
        let mut ops = vec![];
        for doc in docs {
            let id = doc.get(ID_KEY).map(doc_id).unwrap_or_default();
            state
                .collections
                .entry(ns.to_string())
                .or_default()
                .insert(id, doc.clone());
            ops.push(Bson::Document(doc! {"op": "i", "ns": ns, "o": doc}));
        }
        state.log(doc! {"op": "c", "ns": "admin.$cmd", "o": {"applyOps": ops}})
    }

    /// Write a periodic noop entry.
    pub fn noop(&self) -> Optime {
        lock(&self.state).log(doc! {"op": "n", "ns": "", "o": {"msg": "periodic noop"}})
    }

    /// Append an arbitrary entry, only `ts` is filled in.
    pub fn push_raw(&self, entry: Document) -> Optime {
        lock(&self.state).log(entry)
    }

    /// Forget oplog entries older than `optime`, like a capped oplog rolling over.
    pub fn truncate_oplog_before(&self, optime: Optime) {
        lock(&self.state).oplog.retain(|entry| {
            entry
                .get_timestamp(TIMESTAMP_KEY)
                .map(|ts| Optime::from(ts) >= optime)
                .unwrap_or(true)
        });
    }

    /// Fail the next `n` reads, as during a primary step down.
    pub fn fail_reads(&self, n: usize) {
        lock(&self.state).failing_reads = n;
    }

    /// Make every read fail until made available again.
    pub fn set_available(&self, available: bool) {
        lock(&self.state).unavailable = !available;
    }

    /// number of oplog reads served so far.
    pub fn reads(&self) -> usize {
        lock(&self.state).reads
    }

    /// current version of a document.
    pub fn document(&self, ns: &str, id: impl Into<Bson>) -> Option<Document> {
        lock(&self.state)
            .collections
            .get(ns)
            .and_then(|coll| coll.get(&doc_id(&id.into())).cloned())
    }
}

impl DocumentFetcher for MemorySource {
    fn fetch_document(&self, namespace: &str, id: &Bson) -> Result<Option<Document>> {
        let mut state = lock(&self.state);
        state.check_available()?;
        Ok(state
            .collections
            .get(namespace)
            .and_then(|coll| coll.get(&doc_id(id)).cloned()))
    }
}

impl OplogSource for MemorySource {
    fn latest_optime(&self) -> Result<Option<Optime>> {
        let mut state = lock(&self.state);
        state.check_available()?;
        Ok(state.oplog.last().and_then(entry_optime))
    }

    fn earliest_optime(&self) -> Result<Option<Optime>> {
        let mut state = lock(&self.state);
        state.check_available()?;
        Ok(state.oplog.first().and_then(entry_optime))
    }

    fn read_after(&self, after: Optime, filter: &OplogFilter, limit: usize) -> Result<Vec<Document>> {
        let mut state = lock(&self.state);
        state.check_available()?;
        state.reads += 1;
        Ok(state
            .oplog
            .iter()
            .filter(|entry| entry_optime(entry).map_or(false, |optime| optime > after))
            .filter(|entry| filter.matches(entry))
            .take(limit)
            .cloned()
            .collect())
    }
}

fn entry_optime(entry: &Document) -> Option<Optime> {
    entry.get_timestamp(TIMESTAMP_KEY).ok().map(Optime::from)
}

fn set_dotted(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_dotted(child, rest, value);
            }
        }
    }
}

type TypedId = (String, String);

#[derive(Default)]
struct IndexState {
    indices: BTreeMap<String, BTreeMap<TypedId, Map<String, Value>>>,
    failing_bulks: usize,
    failing_items: HashMap<String, (usize, bool)>,
    failing_document_writes: usize,
    bulk_requests: usize,
    applied: Vec<(String, &'static str, Optime)>,
}

/// In process search index.
#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<IndexState>,
}

impl MemoryIndex {
    /// create an index service without any index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` bulk requests as a whole with a retryable error.
    pub fn fail_next_bulks(&self, n: usize) {
        lock(&self.state).failing_bulks = n;
    }

    /// Fail the next `times` bulk items for document `id`.
    pub fn fail_items(&self, id: &str, times: usize, retryable: bool) {
        lock(&self.state)
            .failing_items
            .insert(id.to_string(), (times, retryable));
    }

    /// Fail the next `n` single document writes, which carry checkpoints and statistics.
    pub fn fail_document_writes(&self, n: usize) {
        lock(&self.state).failing_document_writes = n;
    }

    /// one stored document.
    pub fn document(&self, index: &str, doc_type: &str, id: &str) -> Option<Map<String, Value>> {
        lock(&self.state)
            .indices
            .get(index)
            .and_then(|docs| docs.get(&(doc_type.to_string(), id.to_string())).cloned())
    }

    /// all documents of one type, sorted by id.
    pub fn documents(&self, index: &str, doc_type: &str) -> BTreeMap<String, Map<String, Value>> {
        lock(&self.state)
            .indices
            .get(index)
            .map(|docs| {
                docs.iter()
                    .filter(|((t, _), _)| t == doc_type)
                    .map(|((_, id), doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// number of bulk requests received, including rejected ones.
    pub fn bulk_requests(&self) -> usize {
        lock(&self.state).bulk_requests
    }

    /// `(id, action, optime)` of every successfully applied bulk item, in apply order.
    pub fn applied(&self) -> Vec<(String, &'static str, Optime)> {
        lock(&self.state).applied.clone()
    }
}

impl IndexState {
    fn apply(&mut self, intent: &MutationIntent) -> ItemOutcome {
        if let Some((times, retryable)) = self.failing_items.get_mut(&intent.id) {
            if *times > 0 {
                *times -= 1;
                let reason = "injected item failure".to_string();
                return if *retryable {
                    ItemOutcome::Retryable(reason)
                } else {
                    ItemOutcome::Permanent(reason)
                };
            }
        }

        let docs = self.indices.entry(intent.index.clone()).or_default();
        let key = (intent.doc_type.clone(), intent.id.clone());
        match &intent.action {
            Action::UpsertFull(doc) => {
                docs.insert(key, doc.clone());
            }
            Action::UpsertPartial(fields) => match docs.get_mut(&key) {
                Some(existing) => merge(existing, fields),
                None => return ItemOutcome::Permanent("document missing".to_string()),
            },
            Action::Delete => {
                docs.remove(&key);
            }
            Action::ClearIndex => {
                return ItemOutcome::Permanent("control intent in bulk request".to_string())
            }
        }
        self.applied
            .push((intent.id.clone(), intent.action.name(), intent.optime));
        ItemOutcome::Success
    }
}

impl IndexTarget for MemoryIndex {
    fn bulk(&self, intents: &[&MutationIntent]) -> Result<Vec<ItemOutcome>> {
        let mut state = lock(&self.state);
        state.bulk_requests += 1;
        if state.failing_bulks > 0 {
            state.failing_bulks -= 1;
            return Err(RiverError::IndexWrite {
                retryable: true,
                reason: "injected bulk failure".to_string(),
            });
        }
        Ok(intents.iter().map(|intent| state.apply(intent)).collect())
    }

    fn clear(&self, index: &str, doc_type: &str, keep: &[&str]) -> Result<()> {
        if let Some(docs) = lock(&self.state).indices.get_mut(index) {
            docs.retain(|(t, id), _| t != doc_type || keep.contains(&id.as_str()));
        }
        Ok(())
    }

    fn get_document(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.document(index, doc_type, id).map(Value::Object))
    }

    fn put_document(&self, index: &str, doc_type: &str, id: &str, body: &Value) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failing_document_writes > 0 {
            state.failing_document_writes -= 1;
            return Err(RiverError::IndexWrite {
                retryable: true,
                reason: "injected document write failure".to_string(),
            });
        }
        let body = body.as_object().cloned().ok_or_else(|| RiverError::IndexWrite {
            retryable: false,
            reason: "document body must be an object".to_string(),
        })?;
        state
            .indices
            .entry(index.to_string())
            .or_default()
            .insert((doc_type.to_string(), id.to_string()), body);
        Ok(())
    }

    fn delete_document(&self, index: &str, doc_type: &str, id: &str) -> Result<()> {
        if let Some(docs) = lock(&self.state).indices.get_mut(index) {
            docs.remove(&(doc_type.to_string(), id.to_string()));
        }
        Ok(())
    }

    fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(lock(&self.state).indices.contains_key(index))
    }

    fn create_index(&self, index: &str) -> Result<()> {
        lock(&self.state)
            .indices
            .entry(index.to_string())
            .or_default();
        Ok(())
    }

    fn type_exists(&self, index: &str, doc_type: &str) -> Result<bool> {
        Ok(lock(&self.state)
            .indices
            .get(index)
            .map_or(false, |docs| docs.keys().any(|(t, _)| t == doc_type)))
    }

    fn count(&self, index: &str, doc_type: &str, exclude: &[&str]) -> Result<u64> {
        Ok(lock(&self.state).indices.get(index).map_or(0, |docs| {
            docs.keys()
                .filter(|(t, id)| t == doc_type && !exclude.contains(&id.as_str()))
                .count() as u64
        }))
    }
}
