//! The telemerge latest-state merge and flush engine.
//!
//! Per-sensor telemetry arrives keyed by device identifier. This crate keeps
//! the latest known value of every sensor of every device in a
//! [`store::MergeStore`] and, whenever a flush trigger arrives, hands a
//! detached snapshot of that state to one of four flush strategies. The
//! [`engine::MergeEngine`] ties the pieces together and is the only type most
//! callers need.
//!
//! Nothing in this crate performs I/O on its own behalf except through the
//! [`cache::Cache`] seam used by the cache-publishing strategy. Time is
//! injected through [`clock::Clock`] so that eviction and windowing are
//! deterministic under test.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub mod cache;
pub mod clock;
pub mod engine;
pub mod publisher;
pub mod record;
pub mod slot;
pub mod store;
pub mod strategy;
pub mod trigger;

pub use engine::MergeEngine;
