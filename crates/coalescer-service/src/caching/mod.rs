//! In-memory response caching.
//!
//! The [`CacheStore`] keeps successful results for a fixed time-to-live and holds at most a
//! fixed number of entries. Expiry is checked lazily on read; there is no background sweep.

mod store;

pub use store::*;
