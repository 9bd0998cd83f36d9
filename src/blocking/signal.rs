use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Create a connected trigger and signal.  The signal fires once the trigger is triggered or
/// dropped, so a panicking owner also stops everything waiting on it.
pub fn shutdown_pair() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = channel::bounded(0);
    (ShutdownTrigger { tx: Some(tx) }, ShutdownSignal { rx })
}

/// Owner side of a cooperative stop request.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: Option<Sender<()>>,
}

impl ShutdownTrigger {
    /// ask every holder of the matching signal to stop.
    pub fn trigger(&mut self) {
        self.tx.take();
    }
}

/// Cloneable side of a cooperative stop request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl ShutdownSignal {
    /// true once stop was requested.
    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `timeout`, waking up early when stop is requested.
    ///
    /// Returns true when stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}
