//! River progress persisted inside the target index.
//!
//! The checkpoint document lives next to the replicated documents, same index and type,
//! under the reserved checkpoint id.  Clearing and counting the index leave that id out.
//! It holds:
//! ```json
//! {
//!     "optime": {"time": 1625000000, "increment": 3},
//!     "indexed": 10, "deleted": 1, "skipped": 0, "failed": 0,
//!     "updatedAt": "2021-06-29T20:53:20+00:00",
//!     "status": "running",
//!     "runId": "0d0b7f3e-..."
//! }
//! ```
//! Statistics documents go to the index and type configured for them, using the river name
//! as id.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::supervisor::RiverState;
use super::target::IndexTarget;
use crate::{Optime, Result, RiverConfig, RiverError, StatisticsConf, StatsSnapshot};

/// What a previous run persisted.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Checkpoint {
    /// last safely processed position, None for a river that never ran.
    pub optime: Option<Optime>,
    /// counters at that time.
    pub stats: StatsSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointDoc {
    #[serde(default)]
    optime: Option<Optime>,
    #[serde(flatten)]
    stats: StatsSnapshot,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    run_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsDoc<'a> {
    river: &'a str,
    namespace: String,
    index: &'a str,
    #[serde(flatten)]
    stats: StatsSnapshot,
    status: &'static str,
    updated_at: String,
}

/// Loads and saves one river's checkpoint.  Only one store per river may write.
pub struct CheckpointStore {
    target: Arc<dyn IndexTarget>,
    river: String,
    namespace: String,
    index: String,
    doc_type: String,
    checkpoint_id: String,
    statistics: Option<StatisticsConf>,
    run_id: String,
    last_saved: Option<Optime>,
}

impl CheckpointStore {
    /// create a store for the river `conf`, writes are tagged with `run_id`.
    pub fn new(conf: &RiverConfig, target: Arc<dyn IndexTarget>, run_id: impl Into<String>) -> Self {
        CheckpointStore {
            target,
            river: conf.name.clone(),
            namespace: conf.namespace(),
            index: conf.target.index.clone(),
            doc_type: conf.target.doc_type.clone(),
            checkpoint_id: conf.checkpoint_id(),
            statistics: conf.statistics.clone(),
            run_id: run_id.into(),
            last_saved: None,
        }
    }

    /// Read the persisted checkpoint, a river which never saved one gets the default.
    pub fn load(&mut self) -> Result<Checkpoint> {
        let found = self
            .target
            .get_document(&self.index, &self.doc_type, &self.checkpoint_id)?;
        let checkpoint = match found {
            None => Checkpoint::default(),
            Some(value) => {
                let doc: CheckpointDoc = serde_json::from_value(value)?;
                Checkpoint {
                    optime: doc.optime,
                    stats: doc.stats,
                }
            }
        };
        if let Some(optime) = checkpoint.optime {
            self.remember(optime);
        }
        info!(optime = ?checkpoint.optime, stats = ?checkpoint.stats, "Load checkpoint.");
        Ok(checkpoint)
    }

    /// true when `optime` is ahead of the saved checkpoint.
    pub fn needs(&self, optime: Optime) -> bool {
        self.last_saved.map_or(true, |saved| optime > saved)
    }

    /// last position this store saved or loaded.
    pub fn last_saved(&self) -> Option<Optime> {
        self.last_saved
    }

    /// Persist position, counters and river status.
    ///
    /// The persisted position never goes backwards: an older `optime` keeps the saved one.
    pub fn save(
        &mut self,
        optime: Option<Optime>,
        stats: StatsSnapshot,
        state: RiverState,
        error: Option<String>,
    ) -> Result<()> {
        let optime = match (optime, self.last_saved) {
            (Some(new), Some(saved)) => Some(new.max(saved)),
            (new, saved) => new.or(saved),
        };
        let doc = CheckpointDoc {
            optime,
            stats,
            updated_at: Utc::now().to_rfc3339(),
            status: state.as_str().to_string(),
            error,
            run_id: self.run_id.clone(),
        };
        let body = serde_json::to_value(&doc)?;
        self.target
            .put_document(&self.index, &self.doc_type, &self.checkpoint_id, &body)
            .map_err(|e| RiverError::CheckpointWrite {
                reason: e.to_string(),
            })?;
        if let Some(optime) = optime {
            self.remember(optime);
            debug!(%optime, status = state.as_str(), "Save checkpoint.");
        }
        Ok(())
    }

    /// Write the statistics document, when the river has a statistics index.
    pub fn save_statistics(&self, stats: StatsSnapshot, state: RiverState) -> Result<()> {
        let conf = match &self.statistics {
            Some(conf) => conf,
            None => return Ok(()),
        };
        if !self.target.index_exists(&conf.index)? {
            info!(index = %conf.index, "Create statistics index.");
            self.target.create_index(&conf.index)?;
        }
        let doc = StatisticsDoc {
            river: &self.river,
            namespace: self.namespace.clone(),
            index: &self.index,
            stats,
            status: state.as_str(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let body: Value = serde_json::to_value(&doc)?;
        self.target
            .put_document(&conf.index, &conf.doc_type, &self.river, &body)
    }

    /// Remove checkpoint and statistics documents.  Replicated documents are kept.
    pub fn remove(&mut self) -> Result<()> {
        self.target
            .delete_document(&self.index, &self.doc_type, &self.checkpoint_id)?;
        if let Some(conf) = &self.statistics {
            self.target
                .delete_document(&conf.index, &conf.doc_type, &self.river)?;
        }
        self.last_saved = None;
        Ok(())
    }

    fn remember(&mut self, optime: Optime) {
        if self.needs(optime) {
            self.last_saved = Some(optime);
        }
    }
}
