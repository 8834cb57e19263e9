//! # Contracts
//!
//! Frozen interface contracts shared by every crate of the bridge: stream
//! descriptors, sample encodings, metadata trees, query predicates, wire
//! messages, the error taxonomy and shared configuration.
//! All other crates depend on this crate, reverse dependencies are prohibited.
//!
//! ## Time Model
//! - Timestamps are seconds (`f64`) in the producer's local clock domain
//! - Inlets map them into the consumer's domain by adding the clock offset

mod blueprint;
mod config;
mod descriptor;
mod error;
mod metadata;
mod observer;
mod predicate;
mod sample;
mod stream_uid;
mod wire;

pub use blueprint::*;
pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use metadata::{ChannelSpec, MetadataTree, NodeId};
pub use observer::{ObserverRegistry, SubscriptionId};
pub use predicate::{CompareOp, Expr, Predicate, QUERYABLE_PROPERTIES};
pub use sample::{ChannelFormat, Sample, SampleData, SampleValue};
pub use stream_uid::StreamUid;
pub use wire::*;
