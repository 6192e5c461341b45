//! Document store for every taskflow table.
//!
//! Rows live in DashMap (development and tests); every mutation is a
//! single-document patch, matching the guarantees of the hosted backend.
//! Nothing here spans documents atomically.

pub mod database;

pub use database::Database;
