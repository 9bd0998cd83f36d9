//! Bounded hand-off between the oplog producer and the bulk indexing consumers.
//!
//! With more than one consumer every consumer owns one partition, and intents are routed by
//! document id, so all intents of one document stay in enqueue order.
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use crate::intent::MutationIntent;
use crate::{Result, RiverError};

/// Factory for hand-off queues.
pub struct HandoffQueue;

impl HandoffQueue {
    /// create a single FIFO of `capacity` intents.
    pub fn bounded(capacity: usize) -> (QueueRouter, QueueReceiver) {
        let (router, mut receivers) = Self::partitioned(1, capacity);
        // partitioned always returns exactly `partitions` receivers.
        let receiver = receivers.remove(0);
        (router, receiver)
    }

    /// create `partitions` FIFOs sharing `capacity`, one receiver per consumer.
    pub fn partitioned(partitions: usize, capacity: usize) -> (QueueRouter, Vec<QueueReceiver>) {
        let partitions = partitions.max(1);
        let per_partition = (capacity / partitions).max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions)
            .map(|_| {
                let (tx, rx) = channel::bounded(per_partition);
                (tx, QueueReceiver { rx })
            })
            .unzip();
        (QueueRouter { senders }, receivers)
    }
}

/// Producer side of the hand-off queue.  Dropping it closes the queue.
#[derive(Debug)]
pub struct QueueRouter {
    senders: Vec<Sender<MutationIntent>>,
}

impl QueueRouter {
    /// Enqueue one intent, blocking while its partition is full.
    ///
    /// Control intents always go to the first partition, callers must make sure other
    /// partitions are idle before sending one.
    pub fn enqueue(&self, intent: MutationIntent) -> Result<()> {
        let partition = self.partition_of(&intent);
        self.senders[partition]
            .send(intent)
            .map_err(|_| RiverError::Stopped)
    }

    /// number of partitions.
    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// intents waiting in all partitions.
    pub fn len(&self) -> usize {
        self.senders.iter().map(|s| s.len()).sum()
    }

    /// true when no intent waits in any partition.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn partition_of(&self, intent: &MutationIntent) -> usize {
        if self.senders.len() == 1 || intent.is_control() {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        intent.id.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }
}

/// Result of [QueueReceiver::drain].
#[derive(Debug, PartialEq)]
pub enum Drained {
    /// up to `max_batch` intents in enqueue order.
    Items(Vec<MutationIntent>),
    /// nothing arrived before `max_wait`.
    Idle,
    /// the producer is gone and the queue is empty.
    Closed,
}

/// Consumer side of one queue partition.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: Receiver<MutationIntent>,
}

impl QueueReceiver {
    /// Wait until at least one intent is available or `max_wait` elapses, then collect up to
    /// `max_batch` intents which arrive before the same deadline.
    pub fn drain(&self, max_batch: usize, max_wait: Duration) -> Drained {
        let deadline = Instant::now() + max_wait;
        let first = match self.rx.recv_deadline(deadline) {
            Ok(intent) => intent,
            Err(RecvTimeoutError::Timeout) => return Drained::Idle,
            Err(RecvTimeoutError::Disconnected) => return Drained::Closed,
        };

        let mut batch = Vec::with_capacity(max_batch.min(1024));
        batch.push(first);
        while batch.len() < max_batch {
            match self.rx.try_recv() {
                Ok(intent) => batch.push(intent),
                Err(_) => match self.rx.recv_deadline(deadline) {
                    Ok(intent) => batch.push(intent),
                    Err(_) => break,
                },
            }
        }
        Drained::Items(batch)
    }
}
