//! racetrack-state — embedded registry store for Racetrack.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the four registry entities: job families, jobs, deployment
//! attempts and trashed jobs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{name}/{version}`) enable prefix scans over the versions
//! of one job family.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. It holds no cached mutable copies:
//! every operation re-reads then writes.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
