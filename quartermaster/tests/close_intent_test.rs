//! Close-intent tests.
//!
//! A transport that watches its own connection close needs to know whether
//! the teardown coordinator asked for that close. The registry raises the
//! key's intent token for exactly the duration of its release callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quartermaster::{CloseIntent, Lifecycle, Registry, ResourceKey};

const GATEWAY: ResourceKey<Transport> = ResourceKey::new("gateway");

/// A fake transport that keeps the intent token its acquire was given.
struct Transport {
    intent: CloseIntent,
}

#[tokio::test]
async fn intent_is_raised_only_while_the_release_runs() {
    let registry = Registry::new();
    let seen_during_release = Arc::new(AtomicBool::new(false));

    let seen = Arc::clone(&seen_during_release);
    registry
        .register(
            GATEWAY,
            Lifecycle::with_context(|context| async move {
                Ok(Transport {
                    intent: context.close_intent(),
                })
            })
            .with_release(move |transport| {
                let seen = Arc::clone(&seen);
                async move {
                    // What a close-event handler would observe while the
                    // coordinator closes this transport.
                    seen.store(transport.intent.is_expected(), Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let transport = registry.provide_one(GATEWAY).await.unwrap();

    // Before teardown: a close now would be unexpected.
    assert!(!transport.intent.is_expected());

    let failures = registry.cleanup().await;
    assert!(failures.is_empty());

    // During the release the intent read as expected; afterwards it is
    // lowered again.
    assert!(seen_during_release.load(Ordering::SeqCst));
    assert!(!transport.intent.is_expected());
}

#[tokio::test]
async fn intent_is_lowered_even_when_the_release_fails() {
    let registry = Registry::new();

    registry
        .register(
            GATEWAY,
            Lifecycle::with_context(|context| async move {
                Ok(Transport {
                    intent: context.close_intent(),
                })
            })
            .with_release(|_| async { Err(quartermaster::ReleaseError::message("jammed")) }),
        )
        .unwrap();

    let transport = registry.provide_one(GATEWAY).await.unwrap();
    let failures = registry.cleanup().await;

    assert_eq!(failures.len(), 1);
    assert!(!transport.intent.is_expected());
}
