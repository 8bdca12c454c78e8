//! # MUSKIE - Object Store HTTP Gateway
//!
//! The request-processing front door of a sharded object store: it
//! terminates HTTP, resolves metadata in the index, and streams object
//! bytes between clients and the back-end storage nodes.
//!
//! ## Architecture
//!
//! - `config`: startup configuration and environment overrides
//! - `error`: the public error taxonomy with HTTP mapping
//! - `metrics`: Prometheus collectors and text exposition
//! - `shark`: per-storage-node HTTP clients with 100-continue uploads
//! - `picker`: datacenter-aware placement selection for new objects
//! - `throttle`: bounded-concurrency admission control
//! - `meta`: canonical keys, metadata records, namespace guards, snaplinks
//! - `stream`: the hashing/counting/capping CheckStream
//! - `ops`: the object data plane (put, get, delete, list)
//! - `server`: the axum router, middleware, and conditional requests
//! - `context`: the process-wide collaborator context

#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;

// Leaf components
pub mod picker;
pub mod shark;
pub mod stream;
pub mod throttle;
pub mod util;

// Metadata envelope
pub mod meta;

// Data plane and HTTP surface
pub mod ops;
pub mod server;

// Shared test fixtures (mock storage nodes, canned records)
pub mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use context::{ProcessContext, ReqCtx};
pub use error::{MuskieError, MuskieResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
