//! Example services wired through the `quartermaster` resource registry
//!
//! This crate shows how a small backend declares its external resources once
//! and lets the registry handle sharing, lazy startup, and ordered teardown:
//! a PostgreSQL pool, a notification dispatcher built on top of that pool, an
//! event-driven gateway transport, and a release-less asset catalog.
//!
//! The `feed` example binary wires all of them together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// These are examples, so we don't need to be as pedantic
#![allow(clippy::missing_const_for_fn)]

use quartermaster::ResourceKey;
use sqlx::PgPool;

/// Release-less asset catalog: acquired lazily, skipped at teardown
pub mod assets;

/// Event-driven gateway transport with unexpected-close detection
pub mod gateway;

/// Notification dispatcher built on the shared PostgreSQL pool
pub mod notifications;

/// Key for the shared PostgreSQL pool that data-backed services request
/// through their [`quartermaster::AcquireContext`].
pub const POSTGRES: ResourceKey<PgPool> = ResourceKey::new("postgres");
