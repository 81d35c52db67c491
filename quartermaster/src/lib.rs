//! `Quartermaster` - Lazy resource lifecycle registry
//!
//! Declares named external resources (database pools, service sockets,
//! storage clients) together with how to acquire and release them, acquires
//! each one lazily on first use, shares a single in-flight acquisition
//! between concurrent requesters, and tears down in exact reverse
//! acquisition order - touching only what was actually brought up.
//!
//! # Quick start
//!
//! ```
//! use quartermaster::{Lifecycle, Registry, ResourceKey};
//! use std::sync::Arc;
//!
//! struct Pool { url: String }
//! struct Mailer { pool: Arc<Pool> }
//!
//! const POOL: ResourceKey<Pool> = ResourceKey::new("pool");
//! const MAILER: ResourceKey<Mailer> = ResourceKey::new("mailer");
//!
//! # tokio_test::block_on(async {
//! let registry = Registry::new();
//!
//! registry.register(
//!     POOL,
//!     Lifecycle::new(|| async {
//!         Ok(Pool { url: "postgres://localhost".to_owned() })
//!     })
//!     .with_release(|pool| async move {
//!         drop(pool); // close connections here
//!         Ok(())
//!     }),
//! )?;
//!
//! // The mailer pulls the pool through its context: the pool is acquired
//! // on demand, and released *after* the mailer at teardown.
//! registry.register(
//!     MAILER,
//!     Lifecycle::with_context(|context| async move {
//!         let pool = context.registry().provide_one(POOL).await?;
//!         Ok(Mailer { pool })
//!     }),
//! )?;
//!
//! let mailer = registry.provide_one(MAILER).await?;
//! assert_eq!(mailer.pool.url, "postgres://localhost");
//!
//! let failures = registry.cleanup().await;
//! assert!(failures.is_empty());
//! # Ok::<_, quartermaster::RegistryError>(())
//! # }).unwrap();
//! ```
//!
//! Registration is pure bookkeeping; a registered resource that is never
//! requested is never acquired and never released. Acquisition outcomes,
//! failures included, are memoized for the life of the registry; callbacks
//! that want to outwait a booting backend retry internally with
//! [`retry_until_ready`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod key;
pub mod lifecycle;
pub mod provide;
pub mod registry;
pub mod retry;

pub use errors::{AcquireError, CleanupFailure, RegistryError, RegistryResult, ReleaseError};
pub use key::{KeyName, ResourceKey};
pub use lifecycle::{AcquireContext, CloseIntent, Lifecycle};
pub use provide::ResourceSet;
pub use registry::Registry;
pub use retry::{retry_until_ready, RetryPolicy};
