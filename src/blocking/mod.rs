/// provide mongo river blocking apis.
mod checkpoint;
mod cursor;
mod indexer;
#[doc(hidden)]
pub mod memory;
mod progress;
mod queue;
mod registry;
mod signal;
mod source;
mod supervisor;
mod target;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use cursor::{OplogCursor, StartPosition};
pub use indexer::{BatchReport, BulkIndexer};
pub use progress::ProgressTracker;
pub use queue::{Drained, HandoffQueue, QueueReceiver, QueueRouter};
pub use registry::RiverRegistry;
pub use signal::{shutdown_pair, ShutdownSignal, ShutdownTrigger};
pub use source::{MongoSource, OplogFilter, OplogSource};
pub use supervisor::{RiverState, Supervisor};
pub use target::{EsTarget, IndexTarget, ItemOutcome};
