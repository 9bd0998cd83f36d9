//! Restartable tailing read over the source oplog.
//!
//! The cursor polls `ts > position` queries rather than keeping a server side tailable
//! cursor open, so every read is short, a stop request is noticed within one poll interval,
//! and reopening after a replica set election is just another query from the last position.
use bson::Document;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::signal::ShutdownSignal;
use super::source::{OplogFilter, OplogSource};
use crate::oplog::OperationRecord;
use crate::{Optime, PipelineConf, Result, RiverError, TIMESTAMP_KEY};

/// Where a cursor starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// after the newest oplog entry.
    Tail,
    /// after the given position, without checking the oplog still reaches back that far.
    At(Optime),
    /// after a checkpoint, failing when the oplog was truncated past it.
    Resume(Optime),
}

/// Lazy, effectively infinite sequence of oplog entries.
///
/// It yields `Err(SourceUnavailable)` once and then ends when the source can't be read,
/// callers reopen it from the last position they safely processed.  Malformed entries are
/// yielded as `Err(MalformedOperation)` and the cursor keeps going.  The sequence ends
/// without error when the shutdown signal fires.
pub struct OplogCursor {
    source: Arc<dyn OplogSource>,
    filter: OplogFilter,
    position: Optime,
    buffer: VecDeque<Document>,
    read_limit: usize,
    poll_interval: Duration,
    signal: ShutdownSignal,
    failed: bool,
}

impl OplogCursor {
    /// Open a cursor on `source`.
    pub fn open(
        source: Arc<dyn OplogSource>,
        filter: OplogFilter,
        start: StartPosition,
        conf: &PipelineConf,
        signal: ShutdownSignal,
    ) -> Result<OplogCursor> {
        let position = match start {
            StartPosition::Tail => source.latest_optime()?.unwrap_or_default(),
            StartPosition::At(optime) => optime,
            StartPosition::Resume(optime) => {
                check_oplog_window(source.as_ref(), optime)?;
                optime
            }
        };
        info!(?start, %position, namespace = %filter.namespace(), "Open oplog cursor.");

        Ok(OplogCursor {
            source,
            filter,
            position,
            buffer: VecDeque::new(),
            read_limit: conf.bulk_size.max(1),
            poll_interval: conf.poll_interval(),
            signal,
            failed: false,
        })
    }

    /// position of the last entry this cursor returned, or its start position.
    pub fn position(&self) -> Optime {
        self.position
    }
}

impl Iterator for OplogCursor {
    type Item = Result<OperationRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed || self.signal.is_triggered() {
                return None;
            }
            if let Some(raw) = self.buffer.pop_front() {
                let result = OperationRecord::from_doc(&raw);
                match &result {
                    Ok(record) => self.position = record.optime,
                    Err(_) => {
                        if let Ok(ts) = raw.get_timestamp(TIMESTAMP_KEY) {
                            self.position = Optime::from(ts);
                        }
                    }
                }
                return Some(result);
            }

            match self
                .source
                .read_after(self.position, &self.filter, self.read_limit)
            {
                Ok(docs) if docs.is_empty() => {
                    if self.signal.wait(self.poll_interval) {
                        return None;
                    }
                }
                Ok(docs) => {
                    debug!(count = docs.len(), position = %self.position, "Read oplog entries.");
                    self.buffer.extend(docs);
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn check_oplog_window(source: &dyn OplogSource, position: Optime) -> Result<()> {
    if position.is_zero() {
        return Ok(());
    }
    match source.earliest_optime()? {
        Some(earliest) if earliest > position => {
            Err(RiverError::OplogWindowExceeded { position, earliest })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::memory::MemorySource;
    use crate::blocking::signal::shutdown_pair;
    use crate::OpKind;
    use bson::doc;

    fn conf() -> PipelineConf {
        PipelineConf {
            poll_interval_ms: 5,
            ..PipelineConf::default()
        }
    }

    fn filter() -> OplogFilter {
        OplogFilter::new("db", "person")
    }

    #[test]
    fn test_cursor_reads_from_position_and_tails() {
        let source = Arc::new(MemorySource::new());
        let first = source.insert("db.person", doc! {"_id": 1, "x": 1});
        source.insert("db.other", doc! {"_id": 2});
        source.insert("db.person", doc! {"_id": 3, "x": 3});

        let (mut trigger, signal) = shutdown_pair();
        let mut cursor = OplogCursor::open(
            source.clone(),
            filter(),
            StartPosition::At(first),
            &conf(),
            signal,
        )
        .unwrap();
        let record = cursor.next().unwrap().unwrap();
        assert!(matches!(record.kind, OpKind::Insert { .. }));
        assert_eq!(record.namespace, "db.person");
        assert!(record.optime > first);
        assert_eq!(cursor.position(), record.optime);

        // later writes show up on next poll.
        source.delete("db.person", 3);
        let record = cursor.next().unwrap().unwrap();
        assert!(matches!(record.kind, OpKind::Delete { .. }));

        trigger.trigger();
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_cursor_opens_at_tail() {
        let source = Arc::new(MemorySource::new());
        source.insert("db.person", doc! {"_id": 1});
        let latest = source.insert("db.person", doc! {"_id": 2});
        let (_trigger, signal) = shutdown_pair();
        let cursor =
            OplogCursor::open(source, filter(), StartPosition::Tail, &conf(), signal).unwrap();
        assert_eq!(cursor.position(), latest);
    }

    #[test]
    fn test_cursor_fails_once_when_source_unavailable() {
        let source = Arc::new(MemorySource::new());
        let (_trigger, signal) = shutdown_pair();
        let mut cursor = OplogCursor::open(
            source.clone(),
            filter(),
            StartPosition::Tail,
            &conf(),
            signal,
        )
        .unwrap();
        source.fail_reads(1);
        assert!(matches!(
            cursor.next(),
            Some(Err(RiverError::SourceUnavailable { .. }))
        ));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_resume_outside_oplog_window() {
        let source = Arc::new(MemorySource::new());
        let old = source.insert("db.person", doc! {"_id": 1});
        let newer = source.insert("db.person", doc! {"_id": 2});
        source.truncate_oplog_before(newer);

        let (_trigger, signal) = shutdown_pair();
        let result = OplogCursor::open(
            source.clone(),
            filter(),
            StartPosition::Resume(old),
            &conf(),
            signal.clone(),
        );
        assert!(matches!(
            result,
            Err(RiverError::OplogWindowExceeded { .. })
        ));
        assert!(
            OplogCursor::open(source, filter(), StartPosition::Resume(newer), &conf(), signal)
                .is_ok()
        );
    }

    #[test]
    fn test_malformed_entry_does_not_end_cursor() {
        let source = Arc::new(MemorySource::new());
        let (_trigger, signal) = shutdown_pair();
        let mut cursor = OplogCursor::open(
            source.clone(),
            filter(),
            StartPosition::Tail,
            &conf(),
            signal,
        )
        .unwrap();
        source.push_raw(doc! {"op": "i", "ns": "db.person", "o": {"no_id": true}});
        source.insert("db.person", doc! {"_id": 1});
        assert!(matches!(
            cursor.next(),
            Some(Err(RiverError::MalformedOperation { .. }))
        ));
        assert!(cursor.next().unwrap().is_ok());
    }
}
