use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::target::{IndexTarget, ItemOutcome};
use crate::intent::{Action, MutationIntent};
use crate::{Optime, PipelineConf, Result, RiverError, Statistics};

/// Result of applying one batch.  Every item is either [ItemOutcome::Success] or
/// [ItemOutcome::Permanent], retryable failures never leave the indexer.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// one outcome per intent, in batch order.
    pub outcomes: Vec<ItemOutcome>,
    /// highest position among the batch intents, all of them have a known outcome.
    pub max_optime: Option<Optime>,
}

impl BatchReport {
    /// number of permanently failed intents.
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Permanent(_)))
            .count()
    }
}

/// Applies batches of intents to the target.
pub struct BulkIndexer {
    target: Arc<dyn IndexTarget>,
    stats: Statistics,
    max_retries: u32,
    backoff: Duration,
    // ids a control intent must not clear, like the checkpoint.
    keep: Vec<String>,
}

impl BulkIndexer {
    /// create an indexer which counts outcomes into `stats`.
    pub fn new(target: Arc<dyn IndexTarget>, stats: Statistics, conf: &PipelineConf) -> Self {
        BulkIndexer {
            target,
            stats,
            max_retries: conf.max_item_retries,
            backoff: conf.item_retry_backoff(),
            keep: vec![],
        }
    }

    /// Leave the documents with these ids in place when clearing an index.
    pub fn keeping(mut self, ids: Vec<String>) -> Self {
        self.keep = ids;
        self
    }

    /// Apply `batch` in order.
    ///
    /// Document intents between two control intents go out as one bulk request, retryable
    /// items are sent again up to the retry bound and then counted as failed.  An error is
    /// returned only when the target keeps rejecting whole requests, nothing of the
    /// unfinished part of the batch should be considered processed then.
    pub fn apply(&self, batch: &[MutationIntent]) -> Result<BatchReport> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut segment_start = 0;
        for (i, intent) in batch.iter().enumerate() {
            if intent.is_control() {
                outcomes.extend(self.apply_segment(&batch[segment_start..i])?);
                outcomes.push(self.apply_control(intent)?);
                segment_start = i + 1;
            }
        }
        outcomes.extend(self.apply_segment(&batch[segment_start..])?);

        self.count(batch, &outcomes);
        let report = BatchReport {
            max_optime: batch.iter().map(|i| i.optime).max(),
            outcomes,
        };
        debug!(size = batch.len(), failed = report.failed(), "Apply batch done.");
        Ok(report)
    }

    fn apply_control(&self, intent: &MutationIntent) -> Result<ItemOutcome> {
        let keep: Vec<&str> = self.keep.iter().map(String::as_str).collect();
        let mut attempt = 0;
        loop {
            match intent.action {
                Action::ClearIndex => match self.target.clear(&intent.index, &intent.doc_type, &keep) {
                    Ok(()) => {
                        warn!(index = %intent.index, doc_type = %intent.doc_type, optime = %intent.optime, "Source collection is gone, index cleared.");
                        return Ok(ItemOutcome::Success);
                    }
                    Err(e) if e.is_retryable() && attempt < self.max_retries => {
                        attempt += 1;
                        warn!(?e, attempt, "Clear index failed, retry.");
                        thread::sleep(self.backoff * attempt);
                    }
                    Err(e) => return Err(e),
                },
                _ => return Ok(ItemOutcome::Permanent("not a control intent".to_string())),
            }
        }
    }

    fn apply_segment(&self, segment: &[MutationIntent]) -> Result<Vec<ItemOutcome>> {
        if segment.is_empty() {
            return Ok(vec![]);
        }
        let items: Vec<&MutationIntent> = segment.iter().collect();
        let mut outcomes = self.send(&items)?;

        let mut attempt = 0;
        loop {
            let retryable: Vec<usize> = (0..segment.len())
                .filter(|&i| matches!(outcomes[i], ItemOutcome::Retryable(_)))
                .collect();
            if retryable.is_empty() {
                break;
            }
            if attempt >= self.max_retries {
                for i in retryable {
                    if let ItemOutcome::Retryable(reason) = &outcomes[i] {
                        warn!(id = %segment[i].id, %reason, attempt, "Give up retrying bulk item.");
                        outcomes[i] = ItemOutcome::Permanent(format!(
                            "still failing after {} retries: {}",
                            attempt, reason
                        ));
                    }
                }
                break;
            }
            attempt += 1;
            thread::sleep(self.backoff * attempt);

            let resend = self.plan_resend(segment, &mut outcomes, &retryable);
            if resend.is_empty() {
                continue;
            }
            debug!(count = resend.len(), attempt, "Resend bulk items.");
            let items: Vec<&MutationIntent> = resend.iter().map(|&i| &segment[i]).collect();
            for (i, outcome) in resend.iter().zip(self.send(&items)?) {
                outcomes[*i] = outcome;
            }
        }
        Ok(outcomes)
    }

    // A failed item whose document was later overwritten by an idempotent intent that
    // succeeded has nothing left to do.  Any other failed item is sent again together with
    // every later intent for the same document, so they still land in order.
    fn plan_resend(
        &self,
        segment: &[MutationIntent],
        outcomes: &mut [ItemOutcome],
        retryable: &[usize],
    ) -> Vec<usize> {
        let mut first_retry: HashMap<&str, usize> = HashMap::new();
        for &i in retryable {
            let superseded = segment[i + 1..]
                .iter()
                .zip(outcomes[i + 1..].iter())
                .any(|(later, outcome)| {
                    later.id == segment[i].id
                        && later.is_idempotent()
                        && *outcome == ItemOutcome::Success
                });
            if superseded {
                outcomes[i] = ItemOutcome::Success;
            } else {
                first_retry.entry(segment[i].id.as_str()).or_insert(i);
            }
        }
        (0..segment.len())
            .filter(|&k| {
                first_retry
                    .get(segment[k].id.as_str())
                    .map_or(false, |&first| k >= first)
            })
            .collect()
    }

    fn send(&self, items: &[&MutationIntent]) -> Result<Vec<ItemOutcome>> {
        let mut attempt = 0;
        loop {
            match self.target.bulk(items) {
                Ok(outcomes) if outcomes.len() == items.len() => return Ok(outcomes),
                Ok(outcomes) => {
                    return Err(RiverError::IndexWrite {
                        retryable: false,
                        reason: format!(
                            "target answered {} outcomes for {} items",
                            outcomes.len(),
                            items.len()
                        ),
                    })
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(?e, attempt, "Bulk request failed, retry.");
                    thread::sleep(self.backoff * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn count(&self, batch: &[MutationIntent], outcomes: &[ItemOutcome]) {
        for (intent, outcome) in batch.iter().zip(outcomes) {
            match (outcome, &intent.action) {
                (ItemOutcome::Success, Action::Delete) => self.stats.add_deleted(1),
                (ItemOutcome::Success, Action::ClearIndex) => {}
                (ItemOutcome::Success, _) => self.stats.add_indexed(1),
                (ItemOutcome::Permanent(reason), _) => {
                    warn!(id = %intent.id, action = intent.action.name(), optime = %intent.optime, %reason, "Bulk item failed permanently, dropped.");
                    self.stats.add_failed(1);
                }
                (ItemOutcome::Retryable(_), _) => self.stats.add_failed(1),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::memory::MemoryIndex;
    use serde_json::{json, Map, Value};

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn intent(id: &str, n: u32, action: Action) -> MutationIntent {
        MutationIntent {
            index: "idx".to_string(),
            doc_type: "t".to_string(),
            id: id.to_string(),
            action,
            optime: Optime::new(n, 1),
        }
    }

    fn indexer(index: &Arc<MemoryIndex>, stats: &Statistics) -> BulkIndexer {
        let conf = PipelineConf {
            max_item_retries: 2,
            item_retry_backoff_ms: 1,
            ..PipelineConf::default()
        };
        BulkIndexer::new(index.clone(), stats.clone(), &conf)
    }

    #[test]
    fn test_apply_counts_and_reports_max_optime() {
        let index = Arc::new(MemoryIndex::new());
        let stats = Statistics::new();
        let batch = vec![
            intent("a", 1, Action::UpsertFull(object(json!({"x": 1})))),
            intent("b", 2, Action::UpsertPartial(object(json!({"x": 1})))),
            intent("a", 3, Action::Delete),
        ];
        let report = indexer(&index, &stats).apply(&batch).unwrap();
        assert_eq!(report.max_optime, Some(Optime::new(3, 1)));
        assert_eq!(report.failed(), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.indexed, 1);
        assert_eq!(snapshot.deleted, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(index.bulk_requests(), 1);
    }

    #[test]
    fn test_retryable_item_is_retried() {
        let index = Arc::new(MemoryIndex::new());
        let stats = Statistics::new();
        index.fail_items("a", 1, true);
        let batch = vec![
            intent("a", 1, Action::UpsertFull(object(json!({"x": 1})))),
            intent("b", 2, Action::UpsertFull(object(json!({"x": 2})))),
        ];
        let report = indexer(&index, &stats).apply(&batch).unwrap();
        assert_eq!(report.failed(), 0);
        assert!(index.document("idx", "t", "a").is_some());
        assert_eq!(index.bulk_requests(), 2);
        assert_eq!(stats.snapshot().indexed, 2);
    }

    #[test]
    fn test_retry_keeps_document_order() {
        let index = Arc::new(MemoryIndex::new());
        let stats = Statistics::new();
        index.fail_items("a", 1, true);
        let batch = vec![
            intent("a", 1, Action::UpsertFull(object(json!({"x": 1, "y": 1})))),
            intent("a", 2, Action::UpsertPartial(object(json!({"y": 2})))),
        ];
        indexer(&index, &stats).apply(&batch).unwrap();
        assert_eq!(
            index.document("idx", "t", "a").unwrap(),
            object(json!({"x": 1, "y": 2}))
        );
    }

    #[test]
    fn test_superseded_failure_is_not_resent() {
        let index = Arc::new(MemoryIndex::new());
        let stats = Statistics::new();
        index.fail_items("a", 1, true);
        let batch = vec![
            intent("a", 1, Action::UpsertFull(object(json!({"v": 1})))),
            intent("a", 2, Action::UpsertFull(object(json!({"v": 2})))),
        ];
        indexer(&index, &stats).apply(&batch).unwrap();
        assert_eq!(index.bulk_requests(), 1);
        assert_eq!(
            index.document("idx", "t", "a").unwrap(),
            object(json!({"v": 2}))
        );
    }

    #[test]
    fn test_retryable_item_demoted_after_retries() {
        let index = Arc::new(MemoryIndex::new());
        let stats = Statistics::new();
        index.fail_items("a", 10, true);
        let batch = vec![intent("a", 1, Action::UpsertFull(Map::new()))];
        let report = indexer(&index, &stats).apply(&batch).unwrap();
        assert!(matches!(report.outcomes[0], ItemOutcome::Permanent(_)));
        assert_eq!(index.bulk_requests(), 3);
        assert_eq!(stats.snapshot().failed, 1);
    }

    #[test]
    fn test_whole_request_failure() {
        let index = Arc::new(MemoryIndex::new());
        let stats = Statistics::new();
        let batch = vec![intent("a", 1, Action::UpsertFull(Map::new()))];

        index.fail_next_bulks(1);
        assert!(indexer(&index, &stats).apply(&batch).is_ok());

        index.fail_next_bulks(5);
        assert!(indexer(&index, &stats).apply(&batch).is_err());
    }

    #[test]
    fn test_control_intent_splits_batch() {
        let index = Arc::new(MemoryIndex::new());
        let stats = Statistics::new();
        let batch = vec![
            intent("a", 1, Action::UpsertFull(Map::new())),
            intent("", 2, Action::ClearIndex),
            intent("b", 3, Action::UpsertFull(Map::new())),
        ];
        index
            .put_document("idx", "t", "river_checkpoint", &json!({"status": "running"}))
            .unwrap();
        let report = indexer(&index, &stats)
            .keeping(vec!["river_checkpoint".to_string()])
            .apply(&batch)
            .unwrap();
        assert_eq!(report.outcomes, vec![ItemOutcome::Success; 3]);
        assert!(index.document("idx", "t", "a").is_none());
        assert!(index.document("idx", "t", "river_checkpoint").is_some());
        assert!(index.document("idx", "t", "b").is_some());
        assert_eq!(index.bulk_requests(), 2);
        assert_eq!(stats.snapshot().indexed, 2);
    }
}
