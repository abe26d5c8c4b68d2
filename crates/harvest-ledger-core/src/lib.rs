//! # Harvest Ledger Core
//!
//! Runtime-free logic for Harvest Ledger: the snapshot data model, the
//! repository traits, the SCD Type-2 versioning decision, the vocabulary
//! interner, the checkpointed harvest controller and the paginated fetch
//! contract.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or HTTP client. The
//! native crate supplies SQLite and JSON-file repositories, the HTTP page
//! source and the timers used for backoff.

pub mod clock;
pub mod error;
pub mod fetch;
pub mod harvest;
pub mod models;
pub mod store;
pub mod versioning;
pub mod vocabulary;
