//! Lifecycle declarations: how to acquire a resource and how to release it.
//!
//! A [`Lifecycle`] pairs a required acquire callback with an optional release
//! callback. Both are plain async closures over the caller's own types; the
//! registry erases them at construction so heterogeneous resources share one
//! table. A lifecycle is immutable once registered.
//!
//! Acquire callbacks that need to reach back into the registry (to request a
//! dependency) or to observe teardown (event-driven transports) take an
//! [`AcquireContext`] via [`Lifecycle::with_context`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::errors::{AcquireError, ReleaseError};
use crate::key::KeyName;
use crate::registry::Registry;

/// A resource instance with its concrete type erased.
pub(crate) type ErasedInstance = Arc<dyn Any + Send + Sync>;

/// Type-erased acquire callback. `Fn` (not `FnOnce`) because the closure is
/// stored behind an `Arc` and invoked from the acquisition future; it still
/// runs at most once per key, the single-flight cache guarantees that.
pub(crate) type ErasedAcquire =
    Arc<dyn Fn(AcquireContext) -> BoxFuture<'static, Result<ErasedInstance, AcquireError>> + Send + Sync>;

/// Type-erased release callback, consumed when the acquisition that owns it
/// succeeds.
pub(crate) type ErasedRelease =
    Box<dyn FnOnce(ErasedInstance) -> BoxFuture<'static, Result<(), ReleaseError>> + Send + Sync>;

/// Acquire/release instructions for one resource.
///
/// ```
/// use quartermaster::{AcquireError, Lifecycle};
///
/// struct Cache { entries: Vec<String> }
///
/// let lifecycle = Lifecycle::new(|| async {
///     Ok(Cache { entries: Vec::new() })
/// })
/// .with_release(|cache| async move {
///     drop(cache);
///     Ok(())
/// });
/// # let _: Lifecycle<Cache> = lifecycle;
/// ```
///
/// A lifecycle without a release callback is valid: such resources are
/// acquired normally but skipped entirely at teardown.
pub struct Lifecycle<T> {
    pub(crate) acquire: ErasedAcquire,
    pub(crate) release: Option<ErasedRelease>,
    _instance: PhantomData<fn() -> T>,
}

impl<T> Lifecycle<T>
where
    T: Send + Sync + 'static,
{
    /// Declares a resource acquired by a plain async closure.
    pub fn new<F, Fut>(acquire: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AcquireError>> + Send + 'static,
    {
        Self::with_context(move |_context| acquire())
    }

    /// Declares a resource whose acquire callback receives an
    /// [`AcquireContext`]: the key being acquired, a registry handle for
    /// requesting dependencies, and the key's [`CloseIntent`].
    pub fn with_context<F, Fut>(acquire: F) -> Self
    where
        F: Fn(AcquireContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AcquireError>> + Send + 'static,
    {
        let acquire: ErasedAcquire = Arc::new(move |context| {
            let fut = acquire(context);
            async move { fut.await.map(|instance| Arc::new(instance) as ErasedInstance) }.boxed()
        });
        Self {
            acquire,
            release: None,
            _instance: PhantomData,
        }
    }

    /// Attaches the release callback invoked during teardown.
    ///
    /// The callback receives the shared instance handle; other holders of
    /// the `Arc` may still exist, so releasing typically means telling the
    /// resource to shut down rather than consuming it.
    #[must_use]
    pub fn with_release<F, Fut>(mut self, release: F) -> Self
    where
        F: FnOnce(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ReleaseError>> + Send + 'static,
    {
        self.release = Some(Box::new(move |instance: ErasedInstance| {
            // The registry only pairs a release with the instance its own
            // acquisition produced, so the downcast holds by construction.
            match instance.downcast::<T>() {
                Ok(typed) => release(typed).boxed(),
                Err(_) => async {
                    Err(ReleaseError::message(
                        "instance type changed between acquisition and release",
                    ))
                }
                .boxed(),
            }
        }));
        self
    }

    /// Whether a release callback was attached.
    #[must_use]
    pub const fn has_release(&self) -> bool {
        self.release.is_some()
    }
}

impl<T> fmt::Debug for Lifecycle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("has_release", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

/// Context handed to acquire callbacks registered with
/// [`Lifecycle::with_context`].
#[derive(Debug, Clone)]
pub struct AcquireContext {
    key: KeyName,
    registry: Registry,
    close_intent: CloseIntent,
}

impl AcquireContext {
    pub(crate) const fn new(key: KeyName, registry: Registry, close_intent: CloseIntent) -> Self {
        Self {
            key,
            registry,
            close_intent,
        }
    }

    /// The key being acquired.
    #[must_use]
    pub const fn key(&self) -> KeyName {
        self.key
    }

    /// Registry handle for requesting dependencies from inside an
    /// acquisition. Requests made through it participate in cycle detection.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A reader handle on this key's close intent, for transports that need
    /// to tell a coordinated close apart from a dropped connection.
    #[must_use]
    pub fn close_intent(&self) -> CloseIntent {
        self.close_intent.clone()
    }
}

/// Expected-close token for one resource.
///
/// The registry raises the flag immediately before invoking the key's
/// release callback and lowers it immediately after, whatever the outcome.
/// Event handlers that observe their transport closing consult
/// [`is_expected`](Self::is_expected): `true` means the teardown coordinator
/// asked for this close, `false` means the connection dropped on its own.
///
/// Handles are cheap clones over shared state. Everything outside the
/// registry's own teardown path gets read-only access.
#[derive(Debug, Clone)]
pub struct CloseIntent {
    expected: Arc<AtomicBool>,
}

impl CloseIntent {
    pub(crate) fn new() -> Self {
        Self {
            expected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the close currently being observed was requested by the
    /// teardown coordinator.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        self.expected.load(Ordering::Acquire)
    }

    pub(crate) fn set_expected(&self, expected: bool) {
        self.expected.store(expected, Ordering::Release);
    }
}
