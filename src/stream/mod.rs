//! Streaming primitives for the object data plane

pub mod check;

pub use check::{CheckStream, CheckStreamError, ZERO_BYTE_MD5};
