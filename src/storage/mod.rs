pub mod kv;
pub mod memory;

pub use kv::{KvTransaction, TxMode};
pub use memory::{CollectionSpec, IndexSpec, MemoryStore};
