#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use mongo_river::blocking::memory::{MemoryIndex, MemorySource};
use mongo_river::{
    IndexTarget, Optime, RiverConfig, RiverState, SourceConf, Supervisor, TargetConf,
};

pub const DB: &str = "river_test";
pub const COLL: &str = "person";
pub const NS: &str = "river_test.person";
pub const INDEX: &str = "river_test";
pub const DOC_TYPE: &str = "person";
pub const RIVER: &str = "person_river";
pub const CHECKPOINT_ID: &str = "person_river_checkpoint";

pub struct Context {
    pub source: Arc<MemorySource>,
    pub index: Arc<MemoryIndex>,
    pub supervisor: Supervisor,
}

impl Context {
    pub fn new() -> Self {
        Self::with_conf(|_| {})
    }

    pub fn with_conf(configure: impl FnOnce(&mut RiverConfig)) -> Self {
        let source = Arc::new(MemorySource::new());
        let index = Arc::new(MemoryIndex::new());
        let supervisor = Supervisor::new(conf(configure), source.clone(), index.clone());
        Context {
            source,
            index,
            supervisor,
        }
    }

    /// start the river and wait until it tails the source.
    pub fn start(&self) {
        self.supervisor.start().unwrap();
        assert!(
            self.supervisor
                .wait_for_state(|s| s == RiverState::Running, Duration::from_secs(10)),
            "river didn't start, state {:?}, error {:?}",
            self.supervisor.state(),
            self.supervisor.last_error()
        );
    }

    /// wait until everything up to `optime` is checkpointed.
    pub fn wait_checkpoint(&self, optime: Optime) {
        assert!(
            wait_until(|| self.supervisor.checkpoint().map_or(false, |c| c >= optime)),
            "checkpoint {:?} never reached {}, state {:?}, error {:?}",
            self.supervisor.checkpoint(),
            optime,
            self.supervisor.state(),
            self.supervisor.last_error()
        );
    }

    /// number of replicated documents, the checkpoint left out.
    pub fn replicated_count(&self) -> u64 {
        self.index.count(INDEX, DOC_TYPE, &[CHECKPOINT_ID]).unwrap()
    }

    /// replicated documents by id, the checkpoint left out.
    pub fn replicated_documents(&self) -> BTreeMap<String, Map<String, Value>> {
        let mut docs = self.index.documents(INDEX, DOC_TYPE);
        docs.remove(CHECKPOINT_ID);
        docs
    }

    /// the persisted checkpoint document.
    pub fn checkpoint_document(&self) -> Option<Map<String, Value>> {
        self.index.document(INDEX, DOC_TYPE, CHECKPOINT_ID)
    }

    /// optimes of every applied bulk item, each one should show up once.
    pub fn applied_optimes(&self) -> Vec<(String, Optime)> {
        self.index
            .applied()
            .into_iter()
            .map(|(id, _, optime)| (id, optime))
            .collect()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.supervisor.stop();
    }
}

pub fn conf(configure: impl FnOnce(&mut RiverConfig)) -> RiverConfig {
    let mut conf = RiverConfig::new(
        RIVER,
        SourceConf::new("mongodb://localhost:27017", DB, COLL),
        TargetConf::new(INDEX, DOC_TYPE),
    );
    conf.pipeline.poll_interval_ms = 10;
    conf.pipeline.item_retry_backoff_ms = 1;
    conf.recovery.initial_backoff_ms = 10;
    conf.recovery.max_backoff_ms = 50;
    configure(&mut conf);
    conf
}

pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
