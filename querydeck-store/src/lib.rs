//! Local entity storage interface for QueryDeck.
//!
//! Defines the [`LocalStore`] trait the sync engine runs against, plus an
//! in-memory implementation. The app ships its own persistent store
//! behind the same trait; the engine cannot tell the difference, which is
//! also what makes the engine testable without a database.

mod error;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::{LocalStore, MemoryStore};
