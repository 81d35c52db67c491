//! Cross-crate behavior of the postgres provider under the registry
//!
//! No database server is involved: these tests lean on the provider's
//! laziness (registration never connects) and on how its failures propagate
//! through the registry's memoization.

use std::time::Duration;

use quartermaster::{Lifecycle, Registry, RegistryError, ResourceKey};
use quartermaster_postgres::{lifecycle_with_config, PostgresConfig};
use sqlx::PgPool;

const POSTGRES: ResourceKey<PgPool> = ResourceKey::new("postgres");
const CACHE: ResourceKey<u32> = ResourceKey::new("cache");

// Nothing listens on the discard port.
const UNREACHABLE_URL: &str = "postgres://127.0.0.1:9/nope";

fn quick_config() -> PostgresConfig {
    PostgresConfig::default().with_acquire_timeout(Duration::from_millis(200))
}

#[tokio::test]
async fn registering_the_provider_contacts_no_server() {
    let registry = Registry::new();
    registry
        .register(POSTGRES, quartermaster_postgres::lifecycle(UNREACHABLE_URL))
        .unwrap();

    // Never provided: teardown has nothing to do and nothing fails.
    assert_eq!(registry.pending_releases(), 0);
    assert!(registry.cleanup().await.is_empty());
}

#[tokio::test]
async fn a_failed_connection_is_memoized_and_leaves_no_release() {
    let registry = Registry::new();
    registry
        .register(POSTGRES, lifecycle_with_config(UNREACHABLE_URL, quick_config()))
        .unwrap();

    let first = registry.provide_one(POSTGRES).await.unwrap_err();
    let second = registry.provide_one(POSTGRES).await.unwrap_err();
    for error in [first, second] {
        match error {
            RegistryError::Acquisition { source, .. } => assert!(source.is_not_ready()),
            other => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(registry.pending_releases(), 0);
    assert!(registry.cleanup().await.is_empty());
}

#[tokio::test]
async fn a_failing_pool_does_not_poison_batch_neighbours() {
    let registry = Registry::new();
    registry
        .register(POSTGRES, lifecycle_with_config(UNREACHABLE_URL, quick_config()))
        .unwrap();
    registry
        .register(
            CACHE,
            Lifecycle::new(|| async { Ok(7_u32) }).with_release(|_| async { Ok(()) }),
        )
        .unwrap();

    assert!(registry.provide((POSTGRES, CACHE)).await.is_err());

    // The healthy member finished acquiring and is served from cache.
    assert_eq!(*registry.provide_one(CACHE).await.unwrap(), 7);
    assert_eq!(registry.pending_releases(), 1);
    assert!(registry.cleanup().await.is_empty());
    assert_eq!(registry.pending_releases(), 0);
}
