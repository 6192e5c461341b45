#![warn(clippy::unwrap_used)]

//! Low-latency key-value cache used for rate limiting.
//!
//! `CacheBackend` is the seam; `RedisCache` talks to a real server and
//! `LocalCache` keeps everything in-process for development and tests.

pub mod backend;
pub mod client;
pub mod local;

pub use backend::{CacheBackend, CacheError, CacheResult};
pub use client::RedisCache;
pub use local::LocalCache;
