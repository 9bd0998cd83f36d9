use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::intent::{Action, MutationIntent};
use crate::{Result, RiverError, TargetConf};

/// The only document type typeless (7.x and later) clusters accept.
const TYPELESS: &str = "_doc";

/// Per item result of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// the mutation is durable in the index.
    Success,
    /// the index couldn't take the mutation now, it may succeed later.
    Retryable(String),
    /// the index rejected the mutation for good.
    Permanent(String),
}

/// A search index service.
///
/// Whole request failures are returned as [RiverError::IndexWrite], per item failures of a
/// bulk request as [ItemOutcome]s in request order.
pub trait IndexTarget: Send + Sync {
    /// Apply document mutations in order.  Control intents are not allowed here.
    fn bulk(&self, intents: &[&MutationIntent]) -> Result<Vec<ItemOutcome>>;

    /// remove every document of `doc_type` from `index`, except the ids in `keep`.
    fn clear(&self, index: &str, doc_type: &str, keep: &[&str]) -> Result<()>;

    /// read one document, None when it doesn't exist.
    fn get_document(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Value>>;

    /// write one document, replacing any previous version.
    fn put_document(&self, index: &str, doc_type: &str, id: &str, body: &Value) -> Result<()>;

    /// remove one document, a missing document is not an error.
    fn delete_document(&self, index: &str, doc_type: &str, id: &str) -> Result<()>;

    /// true when `index` exists.
    fn index_exists(&self, index: &str) -> Result<bool>;

    /// create `index`, an existing index is not an error.
    fn create_index(&self, index: &str) -> Result<()>;

    /// true when `index` holds at least one document of `doc_type`.
    fn type_exists(&self, index: &str, doc_type: &str) -> Result<bool>;

    /// number of `doc_type` documents in `index`, not counting the ids in `exclude`.
    fn count(&self, index: &str, doc_type: &str, exclude: &[&str]) -> Result<u64>;

    /// make recent writes visible to searches.
    fn refresh(&self, _index: &str) -> Result<()> {
        Ok(())
    }
}

/// Elasticsearch compatible http target.
#[derive(Debug, Clone)]
pub struct EsTarget {
    client: Client,
    base: Url,
}

impl EsTarget {
    /// create a client for `conf.url`, every request gives up after `timeout`.
    pub fn new(conf: &TargetConf, timeout: Duration) -> Result<EsTarget> {
        let base = Url::parse(&conf.url).map_err(|e| RiverError::Config {
            reason: format!("invalid target url {:?}: {}", conf.url, e),
        })?;
        if base.cannot_be_a_base() {
            return Err(RiverError::Config {
                reason: format!("invalid target url {:?}", conf.url),
            });
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(EsTarget { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // checked in `new`, a base url always has path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn doc_endpoint(&self, index: &str, doc_type: &str, id: &str) -> Url {
        self.endpoint(&[index, doc_type, id])
    }
}

fn scoped_query(doc_type: &str, exclude: &[&str]) -> Value {
    let scope = if doc_type == TYPELESS {
        json!({"match_all": {}})
    } else {
        json!({"term": {"_type": doc_type}})
    };
    if exclude.is_empty() {
        return json!({ "query": scope });
    }
    json!({"query": {"bool": {
        "filter": [scope],
        "must_not": [{"ids": {"values": exclude}}],
    }}})
}

fn bulk_metadata(intent: &MutationIntent) -> Value {
    let mut meta = json!({"_index": intent.index, "_id": intent.id});
    if intent.doc_type != TYPELESS {
        meta["_type"] = json!(intent.doc_type);
    }
    if let Action::UpsertPartial(_) = intent.action {
        meta["retry_on_conflict"] = json!(3);
    }
    let mut line = Map::new();
    line.insert(intent.action.name().to_string(), meta);
    Value::Object(line)
}

fn bulk_body(intents: &[&MutationIntent]) -> Result<String> {
    let mut body = String::new();
    for intent in intents {
        let source = match &intent.action {
            Action::UpsertFull(doc) => Some(Value::Object(doc.clone())),
            Action::UpsertPartial(fields) => Some(json!({ "doc": fields })),
            Action::Delete => None,
            Action::ClearIndex => {
                return Err(RiverError::IndexWrite {
                    retryable: false,
                    reason: "control intent in bulk request".to_string(),
                })
            }
        };
        body.push_str(&serde_json::to_string(&bulk_metadata(intent))?);
        body.push('\n');
        if let Some(source) = source {
            body.push_str(&serde_json::to_string(&source)?);
            body.push('\n');
        }
    }
    Ok(body)
}

fn classify_item(intent: &MutationIntent, item: &Value) -> ItemOutcome {
    // every item is `{"<action>": {"status": .., "error": ..}}`.
    let result = item
        .as_object()
        .and_then(|o| o.values().next())
        .cloned()
        .unwrap_or(Value::Null);
    let status = result["status"].as_u64().unwrap_or(0) as u16;
    let reason = || format!("status {}: {}", status, result["error"]);
    match status {
        200..=299 => ItemOutcome::Success,
        404 if matches!(intent.action, Action::Delete) => ItemOutcome::Success,
        429 | 500..=599 => ItemOutcome::Retryable(reason()),
        _ => ItemOutcome::Permanent(reason()),
    }
}

fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
    let reason = format!("{}: {}", status, resp.text().unwrap_or_default());
    Err(RiverError::IndexWrite { retryable, reason })
}

impl IndexTarget for EsTarget {
    fn bulk(&self, intents: &[&MutationIntent]) -> Result<Vec<ItemOutcome>> {
        let body = bulk_body(intents)?;
        let resp = self
            .client
            .post(self.endpoint(&["_bulk"]))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()?;
        let resp: Value = check_status(resp)?.json()?;
        let items = resp["items"].as_array().cloned().unwrap_or_default();
        if items.len() != intents.len() {
            return Err(RiverError::IndexWrite {
                retryable: true,
                reason: format!(
                    "bulk response has {} items for {} requests",
                    items.len(),
                    intents.len()
                ),
            });
        }
        debug!(count = items.len(), errors = %resp["errors"], "Bulk request done.");
        Ok(intents
            .iter()
            .zip(items.iter())
            .map(|(intent, item)| classify_item(intent, item))
            .collect())
    }

    fn clear(&self, index: &str, doc_type: &str, keep: &[&str]) -> Result<()> {
        let mut url = self.endpoint(&[index, "_delete_by_query"]);
        url.query_pairs_mut()
            .append_pair("conflicts", "proceed")
            .append_pair("refresh", "true");
        let resp = self.client.post(url).json(&scoped_query(doc_type, keep)).send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp)?;
        Ok(())
    }

    fn get_document(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Value>> {
        let resp = self
            .client
            .get(self.doc_endpoint(index, doc_type, id))
            .send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mut found: Value = check_status(resp)?.json()?;
        Ok(Some(found["_source"].take()))
    }

    fn put_document(&self, index: &str, doc_type: &str, id: &str, body: &Value) -> Result<()> {
        let resp = self
            .client
            .put(self.doc_endpoint(index, doc_type, id))
            .json(body)
            .send()?;
        check_status(resp)?;
        Ok(())
    }

    fn delete_document(&self, index: &str, doc_type: &str, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.doc_endpoint(index, doc_type, id))
            .send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp)?;
        Ok(())
    }

    fn index_exists(&self, index: &str) -> Result<bool> {
        let resp = self.client.head(self.endpoint(&[index])).send()?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => check_status(resp).map(|_| true),
        }
    }

    fn create_index(&self, index: &str) -> Result<()> {
        let resp = self.client.put(self.endpoint(&[index])).send()?;
        if resp.status() == StatusCode::BAD_REQUEST {
            let text = resp.text().unwrap_or_default();
            if text.contains("resource_already_exists_exception") {
                return Ok(());
            }
            return Err(RiverError::IndexWrite {
                retryable: false,
                reason: text,
            });
        }
        check_status(resp)?;
        Ok(())
    }

    fn type_exists(&self, index: &str, doc_type: &str) -> Result<bool> {
        Ok(self.index_exists(index)? && self.count(index, doc_type, &[])? > 0)
    }

    fn count(&self, index: &str, doc_type: &str, exclude: &[&str]) -> Result<u64> {
        let resp = self
            .client
            .post(self.endpoint(&[index, "_count"]))
            .json(&scoped_query(doc_type, exclude))
            .send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let counted: Value = check_status(resp)?.json()?;
        Ok(counted["count"].as_u64().unwrap_or(0))
    }

    fn refresh(&self, index: &str) -> Result<()> {
        let resp = self.client.post(self.endpoint(&[index, "_refresh"])).send()?;
        check_status(resp)?;
        Ok(())
    }
}
