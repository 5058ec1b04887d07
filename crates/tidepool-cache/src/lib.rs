//! tidepool-cache: the query-result cache consulted before a pool is hit.
//!
//! ```text
//! derive_key(query, params) ──► QueryCache::get ──hit──► Arc<QueryResult>
//!                                   │ miss
//!                                   ▼
//!                      pool executes ──► QueryCache::set (reads only)
//! ```
//!
//! Entries expire after their TTL and are evicted least-recently-used
//! first once the byte budget is exceeded. Writes are never cached, and
//! keeping the cache coherent after a write is up to the caller, through
//! tag or glob invalidation.

pub mod cache;
pub mod key;
mod lru;

pub use cache::{CacheError, CacheStats, Cacheable, EntryInfo, MAX_TTL, QueryCache, Weigh};
pub use key::{derive_key, is_write_statement, normalize_query, query_of};
