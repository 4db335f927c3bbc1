//! # galena-chain
//! The chain-and-pool engine: block index, tip selection, reorgs, and
//! the transaction memory pool.

pub mod chain;
pub mod events;
pub mod pool;
pub mod store;

pub use chain::{AddOutcome, BlockChain, BlockHook};
pub use events::{ChainEvent, PoolEvent};
pub use pool::{Accounting, Submission, TransactionStore};
pub use store::{BlockRecord, MemoryStorage, Storage, StoredTx};
