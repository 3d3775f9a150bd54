//! Core types for the Strata memory substrate.
//!
//! This crate defines the shared data structures used across the packet store,
//! ingestion pipeline, retrieval subsystem, housekeeping engine and HTTP API.
//! It contains no business logic.

pub mod config;
pub mod error;
pub mod housekeeping;
pub mod knowledge;
pub mod lineage;
pub mod packet;
pub mod pipeline;
pub mod retrieval;
