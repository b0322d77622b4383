//! Values a condition can hold.
//!
//! The backing store owns the schema of persisted payloads; the engine only needs
//! to recognise the alignment types it composes. Everything else travels as an
//! opaque value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::alignment::{Delta, Transform};
use crate::error::ResolutionError;

/// Possible payloads of a condition.
///
/// # Examples
///
/// ```
/// use iovcond::{Delta, Payload};
///
/// let p = Payload::Delta(Delta::translation(1.0, 0.0, 0.0));
/// assert!(p.as_delta().is_ok());
/// assert!(Payload::Float(2.0).as_delta().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// No value.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Free text.
    Text(String),
    /// Entity-local alignment correction.
    Delta(Delta),
    /// Absolute alignment.
    Transform(Transform),
    /// Named parameter block, ordered by name.
    Params(BTreeMap<String, Payload>),
    /// Anything else the store hands over.
    Structured(serde_json::Value),
}

impl Payload {
    /// True for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric value; integers are widened.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text value, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Absolute transform, if any.
    #[must_use]
    pub const fn as_transform(&self) -> Option<&Transform> {
        match self {
            Self::Transform(t) => Some(t),
            _ => None,
        }
    }

    /// Reads an alignment delta.
    ///
    /// Accepts a bare `Delta`, or a parameter block whose first entry is one (the
    /// layout produced by catalog-style converters).
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError::MalformedPayload` for anything else, or if the delta
    /// holds non-finite components.
    pub fn as_delta(&self) -> Result<&Delta, ResolutionError> {
        let delta = match self {
            Self::Delta(d) => d,
            Self::Params(params) => match params.values().next() {
                Some(Self::Delta(d)) => d,
                Some(other) => {
                    return Err(ResolutionError::malformed(
                        "delta parameter block",
                        format!("params with leading {}", other.type_name()),
                    ))
                }
                None => return Err(ResolutionError::malformed("delta", "empty params")),
            },
            other => return Err(ResolutionError::malformed("delta", other.type_name())),
        };
        delta.validate()?;
        Ok(delta)
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Delta(_) => "delta",
            Self::Transform(_) => "transform",
            Self::Params(_) => "params",
            Self::Structured(_) => "structured",
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::Null
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Delta> for Payload {
    fn from(d: Delta) -> Self {
        Self::Delta(d)
    }
}

impl From<Transform> for Payload {
    fn from(t: Transform) -> Self {
        Self::Transform(t)
    }
}
