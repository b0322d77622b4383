//! Intervals of validity.
//!
//! An [`Iov`] names the window for which a set of conditions is requested, and the
//! window for which a resolved condition is authoritative. Both ends are inclusive.
//! IOVs of different [`IovType`]s are never comparable: an "epoch" window never
//! covers a "run" window, whatever the numbers say.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Identifier of an IOV type (the unit a range is expressed in).
///
/// Types are registered by name in an [`IovTypeRegistry`]; the ids of the two
/// built-in types are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IovType(u32);

impl IovType {
    /// Seconds since the UNIX epoch.
    pub const EPOCH: Self = Self(0);

    /// Run numbers.
    pub const RUN: Self = Self(1);

    /// Returns the numeric id.
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for IovType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type{}", self.0)
    }
}

/// Inclusive range `[start, end]` of IOV keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IovRange {
    /// First key of the range (inclusive).
    pub start: i64,

    /// Last key of the range (inclusive).
    pub end: i64,
}

impl IovRange {
    /// The widest representable range.
    pub const ALL: Self = Self {
        start: i64::MIN,
        end: i64::MAX,
    };

    /// Creates a range.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidIovRange` if `start > end`.
    pub const fn new(start: i64, end: i64) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidIovRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Creates a single-key range.
    #[must_use]
    pub const fn point(at: i64) -> Self {
        Self { start: at, end: at }
    }

    /// True if `other` lies entirely inside this range.
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// True if `key` lies inside this range.
    #[must_use]
    pub const fn contains_key(&self, key: i64) -> bool {
        self.start <= key && key <= self.end
    }

    /// True if the two ranges share at least one key.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns the intersection of two ranges, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// Number of keys covered, saturating at `u64::MAX`.
    #[must_use]
    pub fn width(&self) -> u64 {
        let span = i128::from(self.end) - i128::from(self.start) + 1;
        u64::try_from(span).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for IovRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

/// Interval of validity: an immutable `(type, range)` pair.
///
/// # Examples
///
/// ```
/// use iovcond::{Iov, IovType};
///
/// let run = Iov::new(IovType::RUN, 100, 200).unwrap();
/// assert!(run.contains(&Iov::point(IovType::RUN, 150)));
/// assert!(!run.contains(&Iov::point(IovType::EPOCH, 150)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Iov {
    /// Unit of the range.
    pub iov_type: IovType,

    /// Covered keys.
    pub range: IovRange,
}

impl Iov {
    /// Creates an IOV from explicit bounds.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidIovRange` if `start > end`.
    pub fn new(iov_type: IovType, start: i64, end: i64) -> Result<Self, ValidationError> {
        let range = IovRange::new(start, end)?;
        Ok(Self { iov_type, range })
    }

    /// Creates a point-in-time IOV.
    #[must_use]
    pub const fn point(iov_type: IovType, at: i64) -> Self {
        Self {
            iov_type,
            range: IovRange::point(at),
        }
    }

    /// Creates an IOV covering every key of the given type.
    #[must_use]
    pub const fn forever(iov_type: IovType) -> Self {
        Self {
            iov_type,
            range: IovRange::ALL,
        }
    }

    /// Creates a point-in-time epoch IOV for a calendar instant.
    #[must_use]
    pub fn at_time(at: DateTime<Utc>) -> Self {
        Self::point(IovType::EPOCH, at.timestamp())
    }

    /// Creates an epoch IOV spanning `[from, to]`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidIovRange` if `from > to`.
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, ValidationError> {
        Self::new(IovType::EPOCH, from.timestamp(), to.timestamp())
    }

    /// True if this IOV is of the same type and its range covers `other`.
    ///
    /// This is the cache-reuse test: a condition valid for `self` may serve a request
    /// for `other`.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.iov_type == other.iov_type && self.range.contains(&other.range)
    }

    /// True if both IOVs have the same type and their ranges overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.iov_type == other.iov_type && self.range.overlaps(&other.range)
    }

    /// Returns the intersection of two IOVs of the same type, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if self.iov_type != other.iov_type {
            return None;
        }
        self.range.intersection(&other.range).map(|range| Self {
            iov_type: self.iov_type,
            range,
        })
    }

    /// True for single-key IOVs.
    #[must_use]
    pub const fn is_point(&self) -> bool {
        self.range.start == self.range.end
    }
}

impl fmt::Display for Iov {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.iov_type, self.range)
    }
}

/// Name registry for IOV types.
///
/// Pre-seeded with `"epoch"` and `"run"`. Registering a name twice returns the
/// existing type.
#[derive(Debug, Clone)]
pub struct IovTypeRegistry {
    by_name: HashMap<String, IovType>,
    names: Vec<String>,
}

impl Default for IovTypeRegistry {
    fn default() -> Self {
        let mut registry = Self {
            by_name: HashMap::new(),
            names: Vec::new(),
        };
        registry.register("epoch");
        registry.register("run");
        registry
    }
}

impl IovTypeRegistry {
    /// Creates a registry holding the built-in types.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type name, returning its id.
    pub fn register(&mut self, name: &str) -> IovType {
        let name = name.trim().to_ascii_lowercase();
        if let Some(existing) = self.by_name.get(&name) {
            return *existing;
        }
        // Ids are dense indices into `names`; the registry never shrinks.
        #[allow(clippy::cast_possible_truncation)]
        let ty = IovType(self.names.len() as u32);
        self.names.push(name.clone());
        self.by_name.insert(name, ty);
        ty
    }

    /// Looks up a type by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<IovType> {
        self.by_name.get(&name.trim().to_ascii_lowercase()).copied()
    }

    /// Looks up a type by name, failing for unknown names.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownIovType` if the name was never registered.
    pub fn require(&self, name: &str) -> Result<IovType, ValidationError> {
        self.get(name).ok_or_else(|| ValidationError::UnknownIovType {
            name: name.to_string(),
        })
    }

    /// Returns the registered name of a type.
    #[must_use]
    pub fn name(&self, ty: IovType) -> Option<&str> {
        self.names.get(ty.0 as usize).map(String::as_str)
    }

    /// Human-readable rendering of an IOV, with calendar dates for epoch IOVs.
    #[must_use]
    pub fn describe(&self, iov: &Iov) -> String {
        let name = self.name(iov.iov_type).unwrap_or("unknown");
        if iov.iov_type != IovType::EPOCH {
            return format!("{name}{}", iov.range);
        }
        let fmt_key = |key: i64| match Utc.timestamp_opt(key, 0).single() {
            Some(t) => t.format("%d-%m-%Y %H:%M:%S").to_string(),
            None => key.to_string(),
        };
        if iov.is_point() {
            format!("{name}({})", fmt_key(iov.range.start))
        } else {
            format!(
                "{name}({} -> {})",
                fmt_key(iov.range.start),
                fmt_key(iov.range.end)
            )
        }
    }
}
