//! racetrack-reconcile — the registry reconciler.
//!
//! Periodically diffs the registry view of jobs against what the
//! infrastructure monitors actually observe, marking vanished jobs
//! LOST, restoring them when they reappear, and flagging jobs whose job
//! type was uninstalled. Writes happen only on an actual difference.

pub mod reconciler;

pub use reconciler::Reconciler;
