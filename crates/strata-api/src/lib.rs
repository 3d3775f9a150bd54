//! HTTP API for the Strata memory substrate.
//!
//! Exposes packet ingestion, retrieval, lineage and knowledge queries, and
//! housekeeping over a JSON HTTP surface built on axum.

pub mod error;
pub mod rate_limiter;
pub mod routes;
pub mod server;
