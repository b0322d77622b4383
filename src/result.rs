//! Resolution accounting.
//!
//! Every `prepare` and `compute` call returns a [`ResolutionResult`], even when some
//! or all keys failed. Failures are folded into the result as [`Diagnostic`]s rather
//! than propagated, so a partially resolved slice is always usable.

use std::fmt;
use std::ops::AddAssign;

use crate::condition::ConditionKey;
use crate::error::ResolutionError;

/// One per-key or per-entity failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Entity path, when known.
    pub path: Option<String>,

    /// Affected key, when the failure is about a key.
    pub key: Option<ConditionKey>,

    /// Cause.
    pub error: ResolutionError,
}

impl Diagnostic {
    /// Diagnostic about a key.
    #[must_use]
    pub const fn for_key(key: ConditionKey, error: ResolutionError) -> Self {
        Self {
            path: None,
            key: Some(key),
            error,
        }
    }

    /// Diagnostic about an entity.
    #[must_use]
    pub fn for_entity(path: impl Into<String>, error: ResolutionError) -> Self {
        Self {
            path: Some(path.into()),
            key: None,
            error,
        }
    }

    /// Attaches an entity path.
    #[must_use]
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// True for ordinary sparseness (see [`ResolutionError::is_expected`]).
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        self.error.is_expected()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, &self.key) {
            (Some(path), Some(key)) => write!(f, "{path} {key}: {}", self.error),
            (Some(path), None) => write!(f, "{path}: {}", self.error),
            (None, Some(key)) => write!(f, "{key}: {}", self.error),
            (None, None) => write!(f, "{}", self.error),
        }
    }
}

/// Counts of a resolution or computation pass.
///
/// - `selected`: served from the manager cache
/// - `loaded`: fetched from the backing store
/// - `computed`: produced by a rule or by the dependency calculator
/// - `missing`: not resolved; see `diagnostics`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionResult {
    /// Served from the manager cache.
    pub selected: usize,
    /// Fetched from the backing store.
    pub loaded: usize,
    /// Produced by a rule or the calculator.
    pub computed: usize,
    /// Not resolved.
    pub missing: usize,
    /// One entry per missing key or unusable entity.
    pub diagnostics: Vec<Diagnostic>,
}

impl ResolutionResult {
    /// Number of keys considered: `selected + loaded + computed + missing`.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.selected + self.loaded + self.computed + self.missing
    }

    /// Number of keys that ended up with a value.
    #[must_use]
    pub const fn resolved(&self) -> usize {
        self.selected + self.loaded + self.computed
    }

    /// True if nothing is missing.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.missing == 0
    }

    /// Counts one missing key and records why.
    pub fn record_missing(&mut self, diagnostic: Diagnostic) {
        self.missing += 1;
        self.diagnostics.push(diagnostic);
    }

    /// Diagnostics that indicate a fault rather than sparseness.
    pub fn faults(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_expected())
    }
}

impl AddAssign for ResolutionResult {
    fn add_assign(&mut self, rhs: Self) {
        self.selected += rhs.selected;
        self.loaded += rhs.loaded;
        self.computed += rhs.computed;
        self.missing += rhs.missing;
        self.diagnostics.extend(rhs.diagnostics);
    }
}

impl fmt::Display for ResolutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:7} conditions (S:{},L:{},C:{},M:{})",
            self.total(),
            self.selected,
            self.loaded,
            self.computed,
            self.missing
        )
    }
}
