//! Artifact caching for the Dreamscape Gateway
//!
//! Maps request fingerprints to validated artifacts with quality-tiered
//! TTLs, LRU eviction and single-flight build coalescing. An optional
//! shared second tier is written through best-effort.

pub mod cache;
pub mod fingerprint;
pub mod shared;
pub mod single_flight;

pub use cache::{CachePerformance, CacheStats, CachedDream, DreamCache, InvalidationStrategy, OptimizeReport};
pub use fingerprint::Fingerprint;
pub use shared::{HttpSharedCache, SharedCache};
pub use single_flight::{Flight, FlightLease, SingleFlight};
