//! # Transport
//!
//! Stream endpoints over UDP (discovery, clock probes) and TCP (sample data).
//!
//! - [`StreamOutlet`] publishes a descriptor and fans samples out to every
//!   connected consumer.
//! - [`StreamInlet`] subscribes to one resolved stream and buffers what it
//!   receives until pulled.
//! - [`query_streams`] / [`QuerySocket`] send query waves; the `discovery`
//!   crate builds its resolvers on them.
//!
//! ## Example
//!
//! ```ignore
//! use transport::{StreamContext, StreamOutlet};
//! use contracts::{ChannelFormat, NetworkConfig, OutletConfig, StreamDescriptor};
//!
//! let ctx = StreamContext::new(NetworkConfig::default())?;
//! let desc = StreamDescriptor::new("EEG", "EEG", 8, 250.0, ChannelFormat::Float32, "amp-1")?;
//! let outlet = StreamOutlet::new(&ctx, desc, OutletConfig::default()).await?;
//! outlet.push_sample(&[0.0f32; 8], None, true)?;
//! ```

mod context;
mod inlet;
mod metrics;
mod outlet;
mod query;
mod queue;
mod service;

pub use context::StreamContext;
pub use inlet::StreamInlet;
pub use metrics::{OutletMetrics, OutletMetricsSnapshot};
pub use outlet::{deduce_timestamps, ChunkTimestamps, StreamOutlet};
pub use query::{query_streams, QuerySocket};
pub use queue::{CloseReason, Pop, SampleQueue};
