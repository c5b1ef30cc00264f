//! # Extraction Guard Core
//!
//! Runtime-free logic for Extraction Guard: the extraction record model,
//! the guarded [`store::RecordStore`] contract, canonical field groups,
//! suggestion validation and merge policy, the aggregation consistency
//! checker, and the fallback cache.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Everything
//! that needs a runtime lives in the `extraction-guard` crate.

pub mod cache;
pub mod consistency;
pub mod fields;
pub mod merge;
pub mod models;
pub mod store;
pub mod validate;
