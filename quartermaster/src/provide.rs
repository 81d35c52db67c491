//! Batch provisioning: request several resources in one call.
//!
//! [`Registry::provide`] accepts a single [`ResourceKey`] or a tuple of keys
//! (up to eight) and resolves them concurrently, returning the matching
//! tuple of shared instances:
//!
//! ```
//! use quartermaster::{Lifecycle, Registry, ResourceKey};
//!
//! const HOST: ResourceKey<String> = ResourceKey::new("host");
//! const PORT: ResourceKey<u16> = ResourceKey::new("port");
//!
//! # tokio_test::block_on(async {
//! let registry = Registry::new();
//! registry.register(HOST, Lifecycle::new(|| async { Ok("localhost".to_owned()) }))?;
//! registry.register(PORT, Lifecycle::new(|| async { Ok(5432_u16) }))?;
//!
//! let (host, port) = registry.provide((HOST, PORT)).await?;
//! assert_eq!(format!("{host}:{port}"), "localhost:5432");
//! # Ok::<_, quartermaster::RegistryError>(())
//! # }).unwrap();
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::errors::RegistryResult;
use crate::key::ResourceKey;
use crate::registry::Registry;

/// A set of keys that can be provided together.
///
/// Implemented for [`ResourceKey`] itself and for tuples of keys up to arity
/// eight. Tuple members resolve concurrently; each one still goes through
/// the per-key single-flight cache, so two keys appearing in overlapping
/// batches are acquired once each.
#[async_trait]
pub trait ResourceSet: Send {
    /// What the set resolves to: `Arc<T>` for a single key, a tuple of
    /// `Arc`s for a tuple of keys.
    type Resolved: Send;

    /// Resolves every key in the set against the registry.
    async fn provide_all(self, registry: &Registry) -> RegistryResult<Self::Resolved>;
}

#[async_trait]
impl<T> ResourceSet for ResourceKey<T>
where
    T: Send + Sync + 'static,
{
    type Resolved = Arc<T>;

    async fn provide_all(self, registry: &Registry) -> RegistryResult<Self::Resolved> {
        registry.provide_one(self).await
    }
}

macro_rules! impl_resource_set_for_tuple {
    ($(($key:ident, $ty:ident)),+) => {
        #[async_trait]
        impl<$($ty,)+> ResourceSet for ($(ResourceKey<$ty>,)+)
        where
            $($ty: Send + Sync + 'static,)+
        {
            type Resolved = ($(Arc<$ty>,)+);

            async fn provide_all(self, registry: &Registry) -> RegistryResult<Self::Resolved> {
                let ($($key,)+) = self;
                futures::try_join!($(registry.provide_one($key),)+)
            }
        }
    };
}

impl_resource_set_for_tuple!((a, A));
impl_resource_set_for_tuple!((a, A), (b, B));
impl_resource_set_for_tuple!((a, A), (b, B), (c, C));
impl_resource_set_for_tuple!((a, A), (b, B), (c, C), (d, D));
impl_resource_set_for_tuple!((a, A), (b, B), (c, C), (d, D), (e, E));
impl_resource_set_for_tuple!((a, A), (b, B), (c, C), (d, D), (e, E), (f, F));
impl_resource_set_for_tuple!((a, A), (b, B), (c, C), (d, D), (e, E), (f, F), (g, G));
impl_resource_set_for_tuple!(
    (a, A),
    (b, B),
    (c, C),
    (d, D),
    (e, E),
    (f, F),
    (g, G),
    (h, H)
);

impl Registry {
    /// Provides a set of resources, acquiring any not-yet-acquired ones
    /// concurrently.
    ///
    /// # Errors
    ///
    /// The first failure of any member, as [`provide_one`](Self::provide_one)
    /// would report it. Other members of the batch still complete their
    /// acquisitions in the background and remain memoized.
    #[instrument(name = "registry.provide", skip_all)]
    pub async fn provide<S>(&self, keys: S) -> RegistryResult<S::Resolved>
    where
        S: ResourceSet,
    {
        keys.provide_all(self).await
    }
}
