//! # Extraction Guard
//!
//! Concurrency-safe storage and review for invoice extraction records.
//!
//! Many workers and reviewers touch the same records at once. Every
//! mutation goes through a predicate-guarded single-statement update, so a
//! lost race is a typed outcome rather than silent corruption. Fields the
//! document analyzer was unsure about are re-asked of a completion service
//! in static field groups, with bounded concurrency, retry with backoff,
//! a halt on rate limiting, and an input-keyed cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Analyzer   │──▶│   Pipeline   │──▶│    SQLite    │
//! │ (collaborator)│  │ claim/patch  │   │ guarded rows │
//! └──────────────┘   └──────┬───────┘   └──────┬───────┘
//!                           │                  │
//!                    ┌──────▼───────┐   ┌──────▼───────┐
//!                    │   Fallback   │   │   Gateway    │◀── CLI / HTTP
//!                    │ orchestrator │   │  (409 on     │
//!                    └──────────────┘   │   conflict)  │
//!                                       └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Guarded SQLite `RecordStore` |
//! | [`gateway`] | Optimistic concurrency gateway |
//! | [`completion`] | Completion-service clients |
//! | [`fallback`] | Fallback orchestrator |
//! | [`pipeline`] | Single-record extraction pipeline |
//! | [`records`] | CLI command implementations |
//! | [`server`] | Review HTTP API |
//!
//! The runtime-free model, validation, merge policy, consistency checker
//! and cache live in `extraction_guard_core`.

pub mod completion;
pub mod config;
pub mod db;
pub mod fallback;
pub mod gateway;
pub mod migrate;
pub mod pipeline;
pub mod records;
pub mod server;
pub mod sqlite_store;
