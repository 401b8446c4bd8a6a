//! Failure categories shared by every policy.
//!
//! Retry (`retry_on`/`abort_on`), circuit breaker (`fail_on`/`skip_on`) and fallback
//! (`apply_on`/`skip_on`) all decide by category membership. Body errors classify
//! themselves through [`Categorized`]; failures produced by the engine itself carry the
//! fixed categories below.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Name of a class of failures, e.g. `ServiceUnavailable`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct FailureCategory(Cow<'static, str>);

impl FailureCategory {
    /// An attempt exceeded its timeout.
    pub const TIMEOUT: FailureCategory = FailureCategory::from_static("Timeout");
    /// The circuit breaker rejected the call.
    pub const CIRCUIT_OPEN: FailureCategory = FailureCategory::from_static("CircuitBreakerOpen");
    /// The bulkhead rejected the call.
    pub const BULKHEAD_FULL: FailureCategory = FailureCategory::from_static("BulkheadFull");

    /// Category from a static name (usable in `const` items).
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Category from an owned name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Category name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for FailureCategory {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for FailureCategory {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Classifies an error into a [`FailureCategory`].
///
/// Implemented by the error type of every guarded body.
///
/// ```
/// use faultline::{Categorized, FailureCategory};
///
/// #[derive(Debug)]
/// enum StoreError { Unavailable, NotFound }
///
/// impl Categorized for StoreError {
///     fn category(&self) -> FailureCategory {
///         match self {
///             StoreError::Unavailable => FailureCategory::from_static("Unavailable"),
///             StoreError::NotFound => FailureCategory::from_static("NotFound"),
///         }
///     }
/// }
/// ```
pub trait Categorized {
    /// Category of this failure.
    fn category(&self) -> FailureCategory;
}

impl Categorized for std::io::Error {
    fn category(&self) -> FailureCategory {
        FailureCategory::new(format!("{:?}", self.kind()))
    }
}

/// A set of categories, or the wildcard matching every category.
///
/// Text form: `*` matches any category, the empty string matches none, anything else is a
/// comma-separated list of names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CategorySet {
    any: bool,
    members: BTreeSet<FailureCategory>,
}

impl CategorySet {
    /// Matches every category.
    pub fn any() -> Self {
        Self { any: true, members: BTreeSet::new() }
    }

    /// Matches nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Matches exactly the given categories.
    pub fn of<I, C>(categories: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<FailureCategory>,
    {
        Self { any: false, members: categories.into_iter().map(Into::into).collect() }
    }

    /// Membership test; the wildcard contains everything.
    pub fn contains(&self, category: &FailureCategory) -> bool {
        self.any || self.members.contains(category)
    }

    /// True when the set matches nothing.
    pub fn is_empty(&self) -> bool {
        !self.any && self.members.is_empty()
    }

    /// True for the wildcard set.
    pub fn is_any(&self) -> bool {
        self.any
    }
}

impl fmt::Display for CategorySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return f.write_str("*");
        }
        let mut first = true;
        for member in &self.members {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(member.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for CategorySet {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(Self::any());
        }
        Ok(Self::of(
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| FailureCategory::new(name)),
        ))
    }
}
