//! Persistent response cache for offline use.
//!
//! `CacheStorage` holds any number of named stores on disk; the router keeps
//! exactly one of them live per cache version. Each `CacheStore` maps a
//! normalized request (method + URL) to the last response stored for it.
//! Entries are JSON files named by the SHA-256 of the request key.

pub mod store;

pub use store::{CacheStorage, CacheStore, CachedData, EntryInfo};
