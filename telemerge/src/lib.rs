//! The telemerge daemon.
//!
//! This library supports the telemerge binary. It wires the merge engine from
//! `telemerge-engine` to inbound sources, a periodic flush trigger and an
//! outbound sink, and owns the daemon's configuration.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
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

pub mod config;
pub mod runtime;
pub mod sink;
pub mod source;
