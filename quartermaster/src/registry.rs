//! The resource registry: registration table, lazy single-flight instance
//! cache, acquisition order log, and the teardown coordinator.
//!
//! # Acquisition
//!
//! Nothing is acquired at registration time. The first
//! [`provide_one`](Registry::provide_one) for a key creates its acquisition
//! future, publishes it in the cache, and spawns a driver task so the
//! acquisition runs to completion even if every requester goes away. All
//! concurrent and later requests for the key await clones of that one shared
//! future; success and failure are both memoized for the life of the
//! registry, so the acquire callback runs at most once per key. Callbacks
//! that want another chance on a transiently unavailable backend retry
//! internally (see [`retry_until_ready`](crate::retry::retry_until_ready)).
//!
//! # Teardown
//!
//! Each successful acquisition that has a release callback appends an entry
//! to the order log. [`cleanup`](Registry::cleanup) drains that log
//! last-acquired-first, which releases dependents before the dependencies
//! they were built on: a dependency requested from inside an acquire
//! callback necessarily finished acquiring before its dependent did.
//! Resources that were registered but never acquired, and resources without
//! a release callback, are not touched.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::{AcquireError, CleanupFailure, RegistryError, RegistryResult, ReleaseError};
use crate::key::{KeyName, ResourceKey};
use crate::lifecycle::{
    AcquireContext, CloseIntent, ErasedAcquire, ErasedInstance, ErasedRelease, Lifecycle,
};

tokio::task_local! {
    /// Keys whose acquire callbacks the current task is inside, outermost
    /// first. Captured when an acquisition future is created and extended
    /// around its acquire callback, so nested requests see the full chain
    /// and a self-request fails fast instead of awaiting itself forever.
    static ACQUIRE_CHAIN: Vec<KeyName>;
}

/// Memoized outcome of one acquisition; every requester awaits a clone.
type SharedAcquire = Shared<BoxFuture<'static, Result<ErasedInstance, AcquireError>>>;

/// Release callback with the acquired instance already bound to it.
type ReleaseThunk = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ReleaseError>> + Send>;

/// One entry in the registration table.
struct Registration {
    instance_type: TypeId,
    instance_type_name: &'static str,
    acquire: ErasedAcquire,
    /// Moved into the acquisition future on first request and bound to the
    /// instance if acquisition succeeds.
    release: Option<ErasedRelease>,
}

/// One entry in the instance cache.
struct CachedAcquire {
    instance_type: TypeId,
    instance_type_name: &'static str,
    future: SharedAcquire,
}

/// One entry in the acquisition order log.
struct CleanupEntry {
    key: KeyName,
    close_intent: CloseIntent,
    release: ReleaseThunk,
}

/// Registration table and instance cache, guarded together so the
/// create-or-lookup decision for a key is a single critical section.
#[derive(Default)]
struct State {
    table: HashMap<KeyName, Registration>,
    cache: HashMap<KeyName, CachedAcquire>,
}

struct RegistryInner {
    state: Mutex<State>,
    /// Separate handle so acquisition futures can append entries without
    /// holding a reference back to the registry itself.
    order_log: Arc<Mutex<Vec<CleanupEntry>>>,
}

/// A lazy resource lifecycle registry.
///
/// Cheap to clone: clones share the same registrations, cached instances,
/// and order log. A typical process builds one during startup, registers
/// every resource it might need, and lets first use drive acquisition.
///
/// ```
/// use quartermaster::{Lifecycle, Registry, ResourceKey};
///
/// const GREETING: ResourceKey<String> = ResourceKey::new("greeting");
///
/// # tokio_test::block_on(async {
/// let registry = Registry::new();
/// registry.register(GREETING, Lifecycle::new(|| async { Ok("hello".to_owned()) }))?;
///
/// // First request acquires; later requests share the same instance.
/// let first = registry.provide_one(GREETING).await?;
/// let second = registry.provide_one(GREETING).await?;
/// assert!(std::sync::Arc::ptr_eq(&first, &second));
///
/// let failures = registry.cleanup().await;
/// assert!(failures.is_empty());
/// # Ok::<_, quartermaster::RegistryError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(State::default()),
                order_log: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Registers acquire/release instructions under a key.
    ///
    /// Pure bookkeeping: nothing runs until the key is first provided.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] if the name is taken; the
    /// original registration is left intact.
    pub fn register<T>(&self, key: ResourceKey<T>, lifecycle: Lifecycle<T>) -> RegistryResult<()>
    where
        T: Send + Sync + 'static,
    {
        let name = key.name();
        let mut state = self.inner.state.lock();

        if state.table.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered { key: name });
        }
        if state.cache.contains_key(&name) {
            // The cache is never reset, so a re-registration after
            // deregistration can only serve the already-cached instance.
            debug!(
                key = %name,
                "[registry.register] name already has a cached acquisition; new instructions will not run"
            );
        }

        state.table.insert(
            name,
            Registration {
                instance_type: TypeId::of::<T>(),
                instance_type_name: std::any::type_name::<T>(),
                acquire: lifecycle.acquire,
                release: lifecycle.release,
            },
        );
        debug!(key = %name, "[registry.register] registered resource");
        Ok(())
    }

    /// Removes a key's registration.
    ///
    /// In-flight and completed acquisitions are unaffected: a cached
    /// instance keeps being served and its release still runs at teardown.
    /// Only future first-time acquisitions lose their instructions.
    /// Deregistering an absent key logs a warning and does nothing else.
    pub fn deregister<T>(&self, key: ResourceKey<T>) {
        let name = key.name();
        if self.inner.state.lock().table.remove(&name).is_some() {
            debug!(key = %name, "[registry.deregister] deregistered resource");
        } else {
            warn!(key = %name, "[registry.deregister] resource is not registered");
        }
    }

    /// Provides the instance for one key, acquiring it on first use.
    ///
    /// Concurrent callers share a single acquisition; a memoized failure is
    /// returned to every caller without re-running the acquire callback.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotRegistered`] when the key has neither a cached
    /// acquisition nor a registration, [`RegistryError::TypeMismatch`] when
    /// the key's instance type does not match the registered one,
    /// [`RegistryError::AcquisitionCycle`] when the key is already being
    /// acquired by this task, and [`RegistryError::Acquisition`] when the
    /// acquire callback fails.
    #[instrument(name = "registry.provide_one", skip(self), fields(key = %key))]
    pub async fn provide_one<T>(&self, key: ResourceKey<T>) -> RegistryResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let name = key.name();
        let (future, registered) = self.acquisition::<T>(name)?;

        let instance = future
            .await
            .map_err(|source| RegistryError::Acquisition { key: name, source })?;

        instance
            .downcast::<T>()
            .map_err(|_| RegistryError::TypeMismatch {
                key: name,
                registered,
                requested: std::any::type_name::<T>(),
            })
    }

    /// Looks up or creates the shared acquisition future for a key.
    ///
    /// This is the one place the create-or-lookup decision is made, inside a
    /// single non-async critical section: no await point can interleave
    /// between the cache miss and the future being published.
    fn acquisition<T>(&self, name: KeyName) -> RegistryResult<(SharedAcquire, &'static str)>
    where
        T: Send + Sync + 'static,
    {
        // Read the requesting task's chain before anything else; a key
        // already on it means this request would await its own acquisition.
        let chain = ACQUIRE_CHAIN.try_with(Clone::clone).unwrap_or_default();
        if chain.contains(&name) {
            return Err(RegistryError::AcquisitionCycle { key: name, chain });
        }

        let mut state = self.inner.state.lock();

        // Cache before table: deregistration never unservices an instance
        // that was already acquired (or is still acquiring).
        if let Some(cached) = state.cache.get(&name) {
            if cached.instance_type != TypeId::of::<T>() {
                return Err(RegistryError::TypeMismatch {
                    key: name,
                    registered: cached.instance_type_name,
                    requested: std::any::type_name::<T>(),
                });
            }
            return Ok((cached.future.clone(), cached.instance_type_name));
        }

        let Some(registration) = state.table.get_mut(&name) else {
            return Err(RegistryError::NotRegistered { key: name });
        };
        if registration.instance_type != TypeId::of::<T>() {
            return Err(RegistryError::TypeMismatch {
                key: name,
                registered: registration.instance_type_name,
                requested: std::any::type_name::<T>(),
            });
        }

        let acquire = Arc::clone(&registration.acquire);
        let release = registration.release.take();
        let registered = registration.instance_type_name;

        let close_intent = CloseIntent::new();
        let context = AcquireContext::new(name, self.clone(), close_intent.clone());
        let order_log = Arc::clone(&self.inner.order_log);

        let mut scope = chain;
        scope.push(name);

        let future: SharedAcquire = async move {
            info!(key = %name, "[registry.acquire] acquiring resource");
            match ACQUIRE_CHAIN.scope(scope, acquire(context)).await {
                Ok(instance) => {
                    if let Some(release) = release {
                        let bound = Arc::clone(&instance);
                        order_log.lock().push(CleanupEntry {
                            key: name,
                            close_intent,
                            release: Box::new(move || release(bound)),
                        });
                    }
                    info!(key = %name, "[registry.acquire] resource ready");
                    Ok(instance)
                }
                Err(error) => {
                    error!(key = %name, error = %error, "[registry.acquire] acquisition failed");
                    Err(error)
                }
            }
        }
        .boxed()
        .shared();

        state.cache.insert(
            name,
            CachedAcquire {
                instance_type: TypeId::of::<T>(),
                instance_type_name: registered,
                future: future.clone(),
            },
        );
        drop(state);

        // Drive the acquisition independently of its requesters: if every
        // caller is cancelled mid-await, the resource still finishes
        // acquiring and still reaches the order log for teardown.
        drop(tokio::spawn(future.clone()));

        Ok((future, registered))
    }

    /// Releases every acquired resource in reverse acquisition order.
    ///
    /// Only resources whose acquisition completed successfully and whose
    /// registration supplied a release callback are touched. Each entry is
    /// consumed as it is drained, so repeated or concurrent calls release
    /// nothing twice. A failing release is recorded and the drain continues;
    /// the returned report is empty on a fully clean shutdown.
    ///
    /// Around each release callback the key's [`CloseIntent`] is raised and
    /// lowered, letting event handlers recognize the close as coordinated.
    #[instrument(name = "registry.cleanup", skip(self))]
    pub async fn cleanup(&self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();

        while let Some(entry) = self.next_cleanup_entry() {
            let CleanupEntry {
                key,
                close_intent,
                release,
            } = entry;

            info!(key = %key, "[registry.cleanup] releasing resource");
            close_intent.set_expected(true);
            let outcome = release().await;
            close_intent.set_expected(false);

            match outcome {
                Ok(()) => info!(key = %key, "[registry.cleanup] resource released"),
                Err(error) => {
                    error!(key = %key, error = %error, "[registry.cleanup] release failed");
                    failures.push(CleanupFailure { key, error });
                }
            }
        }

        if failures.is_empty() {
            info!("[registry.cleanup] cleanup complete");
        } else {
            warn!(
                failures = failures.len(),
                "[registry.cleanup] cleanup finished with failures"
            );
        }
        failures
    }

    /// Number of releases the order log is currently holding.
    ///
    /// Counts successful acquisitions that registered a release callback and
    /// have not been drained by [`cleanup`](Self::cleanup) yet.
    #[must_use]
    pub fn pending_releases(&self) -> usize {
        self.inner.order_log.lock().len()
    }

    /// Pops the most recent order-log entry; the lock is scoped to this call
    /// so it is never held across the release await.
    fn next_cleanup_entry(&self) -> Option<CleanupEntry> {
        self.inner.order_log.lock().pop()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Registry")
            .field("registered", &state.table.len())
            .field("acquired", &state.cache.len())
            .field("pending_releases", &self.inner.order_log.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const NUMBER: ResourceKey<u32> = ResourceKey::new("number");
    const TEXT: ResourceKey<String> = ResourceKey::new("text");

    #[test]
    fn duplicate_registration_is_rejected_and_original_kept() {
        let registry = Registry::new();
        registry
            .register(NUMBER, Lifecycle::new(|| async { Ok(1_u32) }))
            .unwrap();

        let err = registry
            .register(NUMBER, Lifecycle::new(|| async { Ok(2_u32) }))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::AlreadyRegistered { key } if key == "number"
        ));

        // The original instructions survive the rejected attempt.
        tokio_test::block_on(async {
            let n = registry.provide_one(NUMBER).await.unwrap();
            assert_eq!(*n, 1);
        });
    }

    #[test]
    #[traced_test]
    fn deregistering_an_absent_key_warns_and_continues() {
        let registry = Registry::new();
        registry.deregister(NUMBER);
        assert!(logs_contain("resource is not registered"));
    }

    #[tokio::test]
    async fn providing_an_unregistered_key_fails_without_side_effects() {
        let registry = Registry::new();
        let err = registry.provide_one(NUMBER).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered { key } if key == "number"));

        // No future was cached: registering now and providing works.
        registry
            .register(NUMBER, Lifecycle::new(|| async { Ok(9_u32) }))
            .unwrap();
        assert_eq!(*registry.provide_one(NUMBER).await.unwrap(), 9);
        assert_eq!(registry.pending_releases(), 0);
    }

    #[tokio::test]
    async fn same_name_different_type_fails_loudly() {
        let registry = Registry::new();
        registry
            .register(TEXT, Lifecycle::new(|| async { Ok("hi".to_owned()) }))
            .unwrap();

        // Before acquisition: rejected against the registration.
        let err = registry
            .provide_one(ResourceKey::<u32>::new("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));

        // After acquisition: rejected against the cache.
        let _ = registry.provide_one(TEXT).await.unwrap();
        let err = registry
            .provide_one(ResourceKey::<u32>::new("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn debug_output_reports_counts() {
        let registry = Registry::new();
        registry
            .register(NUMBER, Lifecycle::new(|| async { Ok(1_u32) }))
            .unwrap();
        let _ = registry.provide_one(NUMBER).await.unwrap();

        let rendered = format!("{registry:?}");
        assert!(rendered.contains("registered: 1"));
        assert!(rendered.contains("acquired: 1"));
    }
}
