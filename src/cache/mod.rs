//! Versioned request/response cache for offline support.
//!
//! Entries are tagged with a generation (cache version). A release installs
//! into a fresh generation, cuts over, and evicts everything else - partial
//! upgrades between generations are never attempted.

mod key;
mod store;

pub use key::RequestKey;
pub use store::{CacheEntry, CacheStore, CachedResponse};
