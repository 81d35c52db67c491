//! Quartermaster Benchmarks
//!
//! This crate contains performance benchmarks for the quartermaster
//! registry, covering first-use acquisition, cached hits, contended fan-in,
//! and batch provides.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
