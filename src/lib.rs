//! Kestrel is a host telemetry agent core. It runs pluggable checks on a
//! schedule, folds their raw samples -- gauges, counters, rates,
//! histograms, sets -- into normalized time-series points with correct
//! temporal semantics, aggregates them per collection cycle and hands the
//! assembled payload to a transmission boundary.
//!
//! The heavy lifting lives in two subsystems:
//!
//!  * the metric aggregation engine (`store`, `aggregator`): context-keyed
//!    sample storage, counter-rate computation, histogram and percentile
//!    reduction, context expiry;
//!  * the check execution scheduler (`check`, `collector`): the per-check,
//!    per-instance run loop with minimum-interval throttling, failure
//!    isolation, warning and metadata lifecycle, and per-cycle status
//!    reporting.
//!
//! Everything outside those two -- check discovery, OS stat internals,
//! cloud metadata, the HTTP wire -- is a collaborator behind a trait.
#![allow(unknown_lints)]
#![deny(trivial_numeric_casts, missing_docs, unstable_features, unused_import_braces)]
extern crate chrono;
extern crate clap;
extern crate quantiles;
extern crate regex;
extern crate seahash;
extern crate serde;
extern crate toml;
extern crate uuid;

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate serde_json;

#[cfg(test)]
extern crate quickcheck;

pub mod aggregator;
pub mod check;
pub mod collector;
pub mod config;
pub mod emitter;
pub mod metric;
pub mod status;
pub mod store;
pub mod time;
