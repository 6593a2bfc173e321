pub mod backoff;
pub mod cache_set;
pub mod coalescer;
pub mod config;
pub mod errors;
pub mod store;
pub mod view;
pub mod watch_cache;

pub use cache_set::WatchCacheSet;
pub use coalescer::Coalescer;
pub use config::CacheConfig;
pub use store::Store;
pub use view::{
    FlushTarget, ObjectView, OwnedTarget, OwnedTrigger, ResourceView, SummaryView, ViewTarget,
    empty_snapshot,
};
pub use watch_cache::{BrokenReason, CacheState, WatchCache, WatchKey, WatchStats};
