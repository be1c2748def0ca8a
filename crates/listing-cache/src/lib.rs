//! Bounded cache of folder listings.
//!
//! Hits are served immediately and refreshed in the background; misses are
//! fetched, stored and returned. The cache holds at most `capacity` folders
//! and evicts the oldest inserted entry first.

mod cache;
mod store;

pub use cache::{FolderKey, ListingCache, MissPolicy, RefreshedListing};
pub use store::BoundedMap;

/// Default number of cached folders.
pub const DEFAULT_CAPACITY: usize = 10;
