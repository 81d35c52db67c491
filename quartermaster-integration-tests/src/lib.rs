//! Integration tests for `quartermaster`
//!
//! This crate contains integration tests that verify the interaction between
//! multiple `quartermaster` crates (the core registry, the postgres provider)
//! and real sockets, without requiring a database server.

// This is a test-only crate
#![cfg(test)]
