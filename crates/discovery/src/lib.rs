//! # Discovery
//!
//! Finding streams on the network.
//!
//! - [`resolve_all`], [`resolve_byprop`], [`resolve_bypred`]: one-shot
//!   queries returning the descriptors that answered.
//! - [`ContinuousResolver`]: background discovery with a pruned cache and
//!   found/lost notifications.

mod continuous;
mod resolve;

pub use continuous::{CacheKey, ContinuousResolver, DiscoveryCacheEntry, DiscoveryEvent};
pub use resolve::{resolve_all, resolve_byprop, resolve_bypred};
