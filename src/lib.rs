//! # Harvest Ledger
//!
//! Resumable catalog harvesting into a slowly-changing-dimension history.
//!
//! A harvest walks a large list of entity keys, pages through a remote
//! endpoint for each one, folds the records into an attribute snapshot, and
//! records the snapshot as a Type-2 version: the open version is closed and
//! a new one opened only when something actually changed. Progress is
//! checkpointed so a killed run picks up where it left off.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ HTTP source  │──▶│  fetch_all   │──▶│  Snapshot    │
//! │ (paginated)  │   │ retry/cursor │   │ + vocabulary │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │  Harvest     │─────── per key ─────▶│ VersionStore │
//! │  controller  │                      │  (SCD-2)     │
//! └──────┬───────┘                      └──────┬───────┘
//!        ▼                                     ▼
//!   checkpoints                        SQLite / JSON files
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hl init                          # create database
//! hl harvest --keys-file apps.txt  # harvest, resumable
//! hl history 570                   # full version history of one key
//! hl as-of 570 2025-03-20          # state at a point in time
//! hl checkpoint status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection and repository selection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite repositories |
//! | [`file_store`] | JSON file repositories |
//! | [`fetch`] | Paginated fetch loop |
//! | [`connector_http`] | HTTP page source |
//! | [`snapshot`] | Raw records to snapshots |
//! | [`harvest_cmd`] | `hl harvest` |
//! | [`import`] | `hl import` history backfill |
//! | [`inspect`] | History, point-in-time, vocabulary and checkpoint views |
//! | [`progress`] | Progress reporting on stderr |
//! | [`logging`] | `tracing` subscriber setup |

pub mod config;
pub mod connector_http;
pub mod db;
pub mod fetch;
pub mod file_store;
pub mod harvest_cmd;
pub mod import;
pub mod inspect;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod snapshot;
pub mod sqlite_store;
