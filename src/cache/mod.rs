//! Decoded-object caching (spec §4.3, §4.6).

pub mod item_cache;
pub mod shared;

pub use item_cache::{ItemCache, Storable};
pub use shared::{SharedCacheManager, SharedWorkspace, Transaction};
