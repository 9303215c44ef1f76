//! Graph store contract and backends.
//!
//! The engine owns no storage: it reads through [`GraphStore`] and writes
//! one atomic [`GraphTransaction`] per unit of work.

mod locks;
mod memory;
mod traits;
mod transaction;

pub use locks::{CommunityLockTable, LockGuard, LockTable, NodeLockGuard, NodeLockTable};
pub use memory::InMemoryGraphStore;
pub use traits::{GraphStore, StorageError};
pub use transaction::{CommitReceipt, GraphTransaction, Mutation};
