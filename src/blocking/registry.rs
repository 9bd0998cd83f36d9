use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

use super::source::OplogSource;
use super::supervisor::{RiverState, Supervisor};
use super::target::IndexTarget;
use crate::{Result, RiverConfig, RiverError, StatsSnapshot};

/// Every river running in this process, by name.
///
/// Each river keeps its own lifecycle; the registry only owns them.  The registry lock is
/// never held while a river starts or stops.
#[derive(Default)]
pub struct RiverRegistry {
    rivers: Mutex<HashMap<String, Arc<Supervisor>>>,
}

impl RiverRegistry {
    /// create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Supervisor>>> {
        self.rivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Define a new river, it's created stopped.
    pub fn create(
        &self,
        conf: RiverConfig,
        source: Arc<dyn OplogSource>,
        target: Arc<dyn IndexTarget>,
    ) -> Result<Arc<Supervisor>> {
        conf.validate()?;
        let mut rivers = self.lock();
        if rivers.contains_key(&conf.name) {
            return Err(RiverError::Config {
                reason: format!("river {:?} already exists", conf.name),
            });
        }
        info!(river = %conf.name, namespace = %conf.namespace(), index = %conf.target.index, "Create river.");
        let name = conf.name.clone();
        let supervisor = Arc::new(Supervisor::new(conf, source, target));
        rivers.insert(name, supervisor.clone());
        Ok(supervisor)
    }

    /// the river called `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.lock().get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<Supervisor>> {
        self.get(name).ok_or_else(|| RiverError::Config {
            reason: format!("river {:?} doesn't exist", name),
        })
    }

    /// start river `name`.
    pub fn start(&self, name: &str) -> Result<()> {
        self.require(name)?.start()
    }

    /// stop river `name`, blocks until its final checkpoint is written.
    pub fn stop(&self, name: &str) -> Result<()> {
        self.require(name)?.stop();
        Ok(())
    }

    /// Stop and forget river `name`, and remove its checkpoint and statistics documents.
    /// Source data and replicated documents stay untouched.
    pub fn delete(&self, name: &str) -> Result<()> {
        let supervisor = self.lock().remove(name).ok_or_else(|| RiverError::Config {
            reason: format!("river {:?} doesn't exist", name),
        })?;
        supervisor.stop();
        supervisor.remove_status()?;
        info!(river = %name, "Delete river.");
        Ok(())
    }

    /// names of all rivers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// state of river `name`.
    pub fn state(&self, name: &str) -> Option<RiverState> {
        self.get(name).map(|s| s.state())
    }

    /// counters of river `name`.
    pub fn statistics(&self, name: &str) -> Option<StatsSnapshot> {
        self.get(name).map(|s| s.statistics())
    }

    /// Start every river, returns the first failure.
    pub fn start_all(&self) -> Result<()> {
        for supervisor in self.all() {
            supervisor.start()?;
        }
        Ok(())
    }

    /// stop every river.
    pub fn stop_all(&self) {
        for supervisor in self.all() {
            supervisor.stop();
        }
    }

    /// Block until every river is stopped or failed.
    pub fn wait_all(&self) {
        for supervisor in self.all() {
            supervisor.wait();
        }
    }

    fn all(&self) -> Vec<Arc<Supervisor>> {
        self.lock().values().cloned().collect()
    }
}
