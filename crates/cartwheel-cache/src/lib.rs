//! Two-tier result cache.
//!
//! The list tier caches whole search-result lists keyed by the user's query
//! and answers near-duplicate queries through embedding similarity. The
//! detail tier is a keyed on-disk map for product-detail records. Both tiers
//! run misses through a single-flight guard so concurrent requests for the
//! same key share one producer, and both treat backend failures as misses
//! rather than errors.

pub mod detail;
pub mod remote;
pub mod semantic;
pub mod single_flight;

pub use detail::DetailCache;
pub use remote::RemoteListBackend;
pub use semantic::{ListCacheBackend, ListEntry, MemoryListBackend, SemanticListCache, normalize_query};
pub use single_flight::SingleFlight;
