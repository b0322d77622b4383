//! Alignment algebra and the dependency calculator built on it.
//!
//! A [`Delta`] is an entity-local correction loaded from the store. The calculator
//! turns the deltas of a tree into absolute [`Transform`]s by composing each delta
//! with the absolute transform of its nearest aligned ancestor.

mod calculator;
mod collector;

pub use calculator::{
    CalculatorConfig, CompositionRule, Deltas, DependencyCalculator, RigidComposition,
    TranslationComposition,
};
pub use collector::{collect_deltas, DeltaCollection};

use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;

/// 3-vector.
pub type Vector3 = [f64; 3];

/// 3x3 matrix, row-major.
pub type Matrix3 = [[f64; 3]; 3];

const IDENTITY3: Matrix3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Rotation given as ZYX Euler angles (radians): `Rz(phi) * Ry(theta) * Rx(psi)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    /// About z.
    pub phi: f64,
    /// About y.
    pub theta: f64,
    /// About x.
    pub psi: f64,
}

impl Rotation {
    /// Creates a rotation from ZYX angles.
    #[must_use]
    pub const fn zyx(phi: f64, theta: f64, psi: f64) -> Self {
        Self { phi, theta, psi }
    }

    /// Rotation matrix.
    #[must_use]
    pub fn matrix(&self) -> Matrix3 {
        let (sa, ca) = self.phi.sin_cos();
        let (sb, cb) = self.theta.sin_cos();
        let (sc, cc) = self.psi.sin_cos();
        [
            [ca * cb, ca * sb * sc - sa * cc, ca * sb * cc + sa * sc],
            [sa * cb, sa * sb * sc + ca * cc, sa * sb * cc - ca * sc],
            [-sb, cb * sc, cb * cc],
        ]
    }
}

/// Entity-local alignment correction.
///
/// Any of the three parts may be absent; an empty delta is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Delta {
    /// Shift applied after the rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<Vector3>,

    /// Rotation about the pivot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,

    /// Point the rotation is applied about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot: Option<Vector3>,
}

impl Delta {
    /// Pure translation.
    #[must_use]
    pub const fn translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            translation: Some([x, y, z]),
            rotation: None,
            pivot: None,
        }
    }

    /// Pure rotation about the origin.
    #[must_use]
    pub const fn rotation(rotation: Rotation) -> Self {
        Self {
            translation: None,
            rotation: Some(rotation),
            pivot: None,
        }
    }

    /// Sets the rotation pivot.
    #[must_use]
    pub fn with_pivot(mut self, pivot: Vector3) -> Self {
        self.pivot = Some(pivot);
        self
    }

    /// True if a translation is set.
    #[must_use]
    pub const fn has_translation(&self) -> bool {
        self.translation.is_some()
    }

    /// True if a rotation is set.
    #[must_use]
    pub const fn has_rotation(&self) -> bool {
        self.rotation.is_some()
    }

    /// True if a pivot is set.
    #[must_use]
    pub const fn has_pivot(&self) -> bool {
        self.pivot.is_some()
    }

    /// Rejects non-finite components.
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError::MalformedPayload` naming the offending part.
    pub fn validate(&self) -> Result<(), ResolutionError> {
        let finite = |v: &[f64]| v.iter().all(|x| x.is_finite());
        if let Some(t) = &self.translation {
            if !finite(t) {
                return Err(ResolutionError::malformed("finite translation", format!("{t:?}")));
            }
        }
        if let Some(r) = &self.rotation {
            if !finite(&[r.phi, r.theta, r.psi]) {
                return Err(ResolutionError::malformed("finite rotation", format!("{r:?}")));
            }
        }
        if let Some(p) = &self.pivot {
            if !finite(p) {
                return Err(ResolutionError::malformed("finite pivot", format!("{p:?}")));
            }
        }
        Ok(())
    }

    /// Affine transform of this delta: `T(translation) * T(pivot) * R * T(-pivot)`.
    #[must_use]
    pub fn to_transform(&self) -> Transform {
        let rotation = self.rotation.map_or(IDENTITY3, |r| r.matrix());
        let t = self.translation.unwrap_or([0.0; 3]);
        let p = self.pivot.unwrap_or([0.0; 3]);
        let rp = mat_vec(&rotation, &p);
        Transform {
            rotation,
            translation: [
                t[0] + p[0] - rp[0],
                t[1] + p[1] - rp[1],
                t[2] + p[2] - rp[2],
            ],
        }
    }
}

/// Rigid transform `x -> rotation * x + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Rotation matrix.
    pub rotation: Matrix3,
    /// Translation vector.
    pub translation: Vector3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    /// The identity transform.
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            rotation: IDENTITY3,
            translation: [0.0; 3],
        }
    }

    /// Pure translation.
    #[must_use]
    pub const fn translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            rotation: IDENTITY3,
            translation: [x, y, z],
        }
    }

    /// `self * other`: applies `other` first, then `self`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        let mut rotation = [[0.0; 3]; 3];
        for (i, row) in rotation.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.rotation[i][k] * other.rotation[k][j]).sum();
            }
        }
        let rt = mat_vec(&self.rotation, &other.translation);
        Self {
            rotation,
            translation: [
                rt[0] + self.translation[0],
                rt[1] + self.translation[1],
                rt[2] + self.translation[2],
            ],
        }
    }

    /// Applies the transform to a point.
    #[must_use]
    pub fn apply(&self, point: &Vector3) -> Vector3 {
        let r = mat_vec(&self.rotation, point);
        [
            r[0] + self.translation[0],
            r[1] + self.translation[1],
            r[2] + self.translation[2],
        ]
    }

    /// Component-wise comparison within `eps`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, eps: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= eps;
        self.translation
            .iter()
            .zip(other.translation.iter())
            .all(|(a, b)| close(*a, *b))
            && self
                .rotation
                .iter()
                .flatten()
                .zip(other.rotation.iter().flatten())
                .all(|(a, b)| close(*a, *b))
    }
}

fn mat_vec(m: &Matrix3, v: &Vector3) -> Vector3 {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}
