//! # Repository Module
//!
//! Record store access for groundsync.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncManager (groundsync-sync)                                         │
//! │       │                                                                 │
//! │       │  records::find_id(&mut tx, model, "a")                          │
//! │       │  records::save(&mut tx, model, write)                           │
//! │       ▼                                                                 │
//! │  records (per-model SQL built from the declaration)                     │
//! │                                                                         │
//! │  Worker / tests                                                         │
//! │       │                                                                 │
//! │       │  db.records(model).get_by_external_id("a")                      │
//! │       │  db.sync_runs().last("person")                                  │
//! │       ▼                                                                 │
//! │  RecordRepository / SyncRunRepository (pool)                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`records::RecordRepository`] - Rows of declared models
//! - [`sync_run::SyncRunRepository`] - Sync pass history

pub mod records;
pub mod sync_run;
