pub mod orchestrator;
pub mod pool;
pub mod snapshot;
pub mod store;

pub use orchestrator::{CloneError, CloneOrchestrator, DiscussionOutcome, SpawnOutcome};
pub use pool::{ClonePool, PoolError, PoolStats};
pub use snapshot::{Snapshot, SnapshotError, reconstruct};
pub use store::ContextStore;
