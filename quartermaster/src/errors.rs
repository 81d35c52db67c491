//! Error types for registration, acquisition, and teardown.
//!
//! Three layers, matching where failures happen:
//!
//! - [`RegistryError`] — what callers of [`Registry`](crate::Registry)
//!   operations see: bookkeeping failures (`AlreadyRegistered`,
//!   `NotRegistered`, `TypeMismatch`, `AcquisitionCycle`) and acquisition
//!   failures forwarded from the callbacks.
//! - [`AcquireError`] — produced by acquire callbacks. Cloneable, because a
//!   failed acquisition is memoized and every concurrent (and later) caller
//!   receives the same error.
//! - [`ReleaseError`] — produced by release callbacks. Collected into
//!   [`CleanupFailure`] rows during teardown rather than aborting it.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::key::KeyName;

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned by [`Registry`](crate::Registry) operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A registration already exists under this name. The original
    /// registration is left intact.
    #[error("Resource '{key}' is already registered")]
    AlreadyRegistered {
        /// The contested key name.
        key: KeyName,
    },

    /// The key has no registration and no cached instance, so there are no
    /// instructions for acquiring it.
    #[error("Resource '{key}' is not registered")]
    NotRegistered {
        /// The unknown key name.
        key: KeyName,
    },

    /// A key with this name was first used with a different instance type.
    #[error("Resource '{key}' holds an instance of {registered}, requested as {requested}")]
    TypeMismatch {
        /// The contested key name.
        key: KeyName,
        /// Type name the registry holds for this key.
        registered: &'static str,
        /// Type name the caller requested.
        requested: &'static str,
    },

    /// A resource was requested from inside its own acquisition. Without
    /// this check the request would await its own memoized future and hang
    /// forever.
    #[error("Cyclic acquisition of resource '{key}' (chain: {chain:?})")]
    AcquisitionCycle {
        /// The key that closed the cycle.
        key: KeyName,
        /// Keys whose acquire callbacks the requesting task was inside,
        /// outermost first.
        chain: Vec<KeyName>,
    },

    /// The acquire callback failed. The failure is memoized: every caller
    /// for this key observes this same error.
    #[error("Acquisition of resource '{key}' failed: {source}")]
    Acquisition {
        /// The key whose acquisition failed.
        key: KeyName,
        /// The underlying callback error.
        #[source]
        source: AcquireError,
    },
}

/// Why an acquire callback failed.
///
/// `Clone` is part of the contract: acquisition outcomes are shared between
/// all requesters of a key, so the error travels through a shared future and
/// must be duplicable. A wrapped source error is kept behind an [`Arc`] for
/// that reason.
///
/// The *not ready* kind marks failures worth retrying from inside the
/// callback (see [`retry_until_ready`](crate::retry::retry_until_ready));
/// everything else is terminal for the whole process lifetime of the key.
#[derive(Debug, Clone)]
pub struct AcquireError {
    kind: AcquireErrorKind,
}

#[derive(Debug, Clone)]
enum AcquireErrorKind {
    NotReady {
        detail: String,
    },
    Terminal {
        detail: String,
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },
}

impl AcquireError {
    /// The backing service is not ready to accept this resource yet; the
    /// same attempt may succeed later.
    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self {
            kind: AcquireErrorKind::NotReady {
                detail: detail.into(),
            },
        }
    }

    /// A terminal failure described by a message.
    pub fn message(detail: impl Into<String>) -> Self {
        Self {
            kind: AcquireErrorKind::Terminal {
                detail: detail.into(),
                source: None,
            },
        }
    }

    /// A terminal failure wrapping an underlying error, preserved on the
    /// [`source`](std::error::Error::source) chain.
    pub fn with_source(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            kind: AcquireErrorKind::Terminal {
                detail: source.to_string(),
                source: Some(Arc::new(source)),
            },
        }
    }

    /// Whether this failure is the retry signal understood by
    /// [`retry_until_ready`](crate::retry::retry_until_ready).
    #[must_use]
    pub const fn is_not_ready(&self) -> bool {
        matches!(self.kind, AcquireErrorKind::NotReady { .. })
    }
}

/// Lets acquire callbacks use `?` when requesting their dependencies through
/// [`AcquireContext::registry`](crate::AcquireContext::registry). A failed
/// dependency is a terminal failure for the dependent resource.
impl From<RegistryError> for AcquireError {
    fn from(error: RegistryError) -> Self {
        Self::with_source(error)
    }
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AcquireErrorKind::NotReady { detail } => write!(f, "Not ready: {detail}"),
            AcquireErrorKind::Terminal { detail, .. } => f.write_str(detail),
        }
    }
}

impl std::error::Error for AcquireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            AcquireErrorKind::Terminal {
                source: Some(source),
                ..
            } => Some(source.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

/// Why a release callback failed.
///
/// Release failures never abort teardown; they are reported as
/// [`CleanupFailure`] rows from [`Registry::cleanup`](crate::Registry::cleanup).
#[derive(Debug)]
pub struct ReleaseError {
    detail: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ReleaseError {
    /// A failure described by a message.
    pub fn message(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            source: None,
        }
    }

    /// A failure wrapping an underlying error, preserved on the
    /// [`source`](std::error::Error::source) chain.
    pub fn with_source(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            detail: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for ReleaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// One failed release, as reported by [`Registry::cleanup`](crate::Registry::cleanup).
///
/// Cleanup returns every failure it encountered instead of stopping at the
/// first one; an empty report means a clean shutdown.
#[derive(Debug)]
pub struct CleanupFailure {
    /// The key whose release callback failed.
    pub key: KeyName,
    /// What the release callback reported.
    pub error: ReleaseError,
}
