//! Typed resource keys.
//!
//! A [`ResourceKey`] names one external resource and carries the instance
//! type it resolves to, so `provide_one(SQL)` yields an `Arc<PgPool>` without
//! any casting at the call site. Applications declare their keys as `const`
//! items, one per resource:
//!
//! ```
//! use quartermaster::ResourceKey;
//!
//! struct SearchClient;
//!
//! const SEARCH: ResourceKey<SearchClient> = ResourceKey::new("search");
//!
//! assert_eq!(SEARCH.name().as_str(), "search");
//! ```
//!
//! Key identity is the name alone. Two keys with the same name but different
//! instance types denote the same registry slot, and the registry rejects the
//! second type loudly rather than ever handing back a miscast instance.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// A typed handle for one named resource.
///
/// `ResourceKey` is `Copy` regardless of the instance type: the type
/// parameter is phantom, the key itself is just a static name. Construction
/// is `const` so keys can live alongside the services that use them.
pub struct ResourceKey<T> {
    name: &'static str,
    _instance: PhantomData<fn() -> T>,
}

impl<T> ResourceKey<T> {
    /// Creates a key with the given name.
    ///
    /// The name is the key's identity: registering two keys with the same
    /// name registers the same resource, whatever their instance types say.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _instance: PhantomData,
        }
    }

    /// The untyped name of this key, as used in errors, logs, and cleanup
    /// reports.
    #[must_use]
    pub const fn name(&self) -> KeyName {
        KeyName(self.name)
    }
}

// Manual impls: the derives would bound `T`, but the key is a name plus a
// phantom, copyable for any instance type.
impl<T> Clone for ResourceKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResourceKey<T> {}

impl<T> PartialEq for ResourceKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for ResourceKey<T> {}

impl<T> Hash for ResourceKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<T> fmt::Debug for ResourceKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceKey").field(&self.name).finish()
    }
}

impl<T> fmt::Display for ResourceKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The untyped name of a resource key.
///
/// Appears wherever the instance type has been erased: error variants,
/// structured log fields, [`CleanupFailure`](crate::CleanupFailure) reports,
/// and the acquisition chain carried by cycle errors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyName(&'static str);

impl KeyName {
    /// The name as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for KeyName {
    // Bare quoted name, so a chain renders as ["gateway", "sql"].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.0, f)
    }
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl PartialEq<&str> for KeyName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
