//! The capella ingestion benchmark.
//!
//! This library supports the `capella-bench` binary found elsewhere in this
//! project. A run fires randomly selected statsd lines from a fixed corpus at
//! a UDP endpoint from many concurrent workers for a fixed duration, then
//! reports how many metrics were generated per second.

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
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod accumulator;
pub mod config;
pub mod coordinator;
pub mod corpus;
pub mod transport;
pub mod worker;
