//! attend-store — SQLite persistence for enrollment galleries and the
//! attendance ledger, with optional at-rest sealing of embeddings.

pub mod seal;
pub mod sqlite;

pub use seal::{Seal, SealError};
pub use sqlite::{SqliteStore, StoreError};
