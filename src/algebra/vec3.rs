//! Tagged 3D vector.

use crate::algebra::Trf3;
use na::Vector3;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

/// Distance below which two points are considered identical.
pub const IDENT_DIST: f64 = 1.0e-4;
/// Distance below which two unit directions are considered identical.
pub const IDENT_DIR: f64 = 1.0e-3;

/// A 3D vector that knows whether it is a point or a derivative.
///
/// A derivative vector (a velocity, an acceleration, …) is a free vector: when it is
/// transformed by a [`Trf3`], only the rotation block applies and the translation is
/// ignored. A point picks up the translation.
///
/// Equality is fuzzy: two vectors compare equal when their distance is at most
/// [`IDENT_DIST`]. This relation is not transitive near the tolerance boundary.
#[derive(Copy, Clone, Debug, Default)]
pub struct Vec3 {
    /// The components.
    pub coords: Vector3<f64>,
    /// Set if this vector is a time or arclength derivative rather than a point.
    pub is_derivative: bool,
}

impl Vec3 {
    /// A point with the given components.
    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            coords: Vector3::new(x, y, z),
            is_derivative: false,
        }
    }

    /// A derivative vector with the given components.
    #[inline]
    pub fn derivative(x: f64, y: f64, z: f64) -> Self {
        Self {
            coords: Vector3::new(x, y, z),
            is_derivative: true,
        }
    }

    /// The origin.
    #[inline]
    pub fn zeros() -> Self {
        Self::default()
    }

    /// Wraps an nalgebra vector, tagged as requested.
    #[inline]
    pub fn from_vector(coords: Vector3<f64>, is_derivative: bool) -> Self {
        Self {
            coords,
            is_derivative,
        }
    }

    /// The x component.
    #[inline]
    pub fn x(&self) -> f64 {
        self.coords.x
    }

    /// The y component.
    #[inline]
    pub fn y(&self) -> f64 {
        self.coords.y
    }

    /// The z component.
    #[inline]
    pub fn z(&self) -> f64 {
        self.coords.z
    }

    /// Euclidean length.
    #[inline]
    pub fn len(&self) -> f64 {
        self.coords.norm()
    }

    /// Squared euclidean length.
    #[inline]
    pub fn len_sq(&self) -> f64 {
        self.coords.norm_squared()
    }

    /// Distance to another point.
    #[inline]
    pub fn dist_to(&self, other: &Vec3) -> f64 {
        (self.coords - other.coords).norm()
    }

    /// Scales this vector to unit length.
    ///
    /// Returns `false`, leaving the vector untouched, if it has zero length.
    pub fn unit_len(&mut self) -> bool {
        let len = self.len();
        if len <= f64::EPSILON {
            return false;
        }
        self.coords /= len;
        true
    }

    /// A unit-length copy, or `None` for a zero vector.
    pub fn unit(&self) -> Option<Self> {
        let mut res = *self;
        res.unit_len().then_some(res)
    }

    /// Inner (dot) product.
    #[inline]
    pub fn inner(&self, other: &Vec3) -> f64 {
        self.coords.dot(&other.coords)
    }

    /// Outer (cross) product. The result is a derivative if either operand is.
    #[inline]
    pub fn outer(&self, other: &Vec3) -> Vec3 {
        Vec3 {
            coords: self.coords.cross(&other.coords),
            is_derivative: self.is_derivative || other.is_derivative,
        }
    }

    /// Unsigned angle between two vectors in `[0, π]`.
    ///
    /// Computed from the ratio of the outer-product magnitude and the inner product, which
    /// stays accurate near `0` and `π` where `acos` loses precision. Returns `0` if either
    /// vector is zero.
    pub fn angle_to(&self, other: &Vec3) -> f64 {
        let lo = self.coords.cross(&other.coords).norm();
        let lp = self.coords.dot(&other.coords);
        if lo == 0.0 && lp == 0.0 {
            return 0.0;
        }
        lo.atan2(lp)
    }

    /// Whether both vectors point the same way, within [`IDENT_DIR`].
    pub fn is_same_dir(&self, other: &Vec3) -> bool {
        match (self.unit(), other.unit()) {
            (Some(a), Some(b)) => (a.coords - b.coords).norm() <= IDENT_DIR,
            _ => false,
        }
    }

    /// Applies `trf` to this vector in place.
    ///
    /// The translation is only added when this vector is a point.
    pub fn transform(&mut self, trf: &Trf3) {
        *self = trf.transform_vec(self);
    }
}

impl From<Vector3<f64>> for Vec3 {
    fn from(coords: Vector3<f64>) -> Self {
        Self::from_vector(coords, false)
    }
}

impl From<Vec3> for Vector3<f64> {
    fn from(v: Vec3) -> Self {
        v.coords
    }
}

impl PartialEq for Vec3 {
    fn eq(&self, other: &Self) -> bool {
        self.dist_to(other) <= IDENT_DIST
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    /// A point moved by a free vector stays a point.
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3 {
            coords: self.coords + rhs.coords,
            is_derivative: self.is_derivative && rhs.is_derivative,
        }
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Vec3) {
        *self = *self + rhs;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    /// The difference of two points is a derivative (a free vector).
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3 {
            coords: self.coords - rhs.coords,
            is_derivative: self.is_derivative || !rhs.is_derivative,
        }
    }
}

impl SubAssign for Vec3 {
    fn sub_assign(&mut self, rhs: Vec3) {
        *self = *self - rhs;
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Vec3 {
        Vec3 {
            coords: self.coords * rhs,
            is_derivative: self.is_derivative,
        }
    }
}

impl MulAssign<f64> for Vec3 {
    fn mul_assign(&mut self, rhs: f64) {
        self.coords *= rhs;
    }
}

impl Div<f64> for Vec3 {
    type Output = Vec3;

    fn div(self, rhs: f64) -> Vec3 {
        Vec3 {
            coords: self.coords / rhs,
            is_derivative: self.is_derivative,
        }
    }
}

impl Neg for Vec3 {
    type Output = Vec3;

    fn neg(self) -> Vec3 {
        Vec3 {
            coords: -self.coords,
            is_derivative: self.is_derivative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn fuzzy_equality() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        assert_eq!(a, Vec3::new(1.0 + 0.5 * IDENT_DIST, 2.0, 3.0));
        assert_ne!(a, Vec3::new(1.0 + 2.0 * IDENT_DIST, 2.0, 3.0));
    }

    #[test]
    fn angle_is_robust_at_the_extremes() {
        let x = Vec3::new(1.0, 0.0, 0.0);
        assert_eq!(x.angle_to(&x), 0.0);
        assert_relative_eq!(x.angle_to(&-x), PI);
        assert_relative_eq!(x.angle_to(&Vec3::new(0.0, 3.0, 0.0)), FRAC_PI_2);
        let tiny = Vec3::new(1.0, 1.0e-9, 0.0);
        assert_relative_eq!(x.angle_to(&tiny), 1.0e-9, max_relative = 1.0e-6);
        assert_eq!(x.angle_to(&Vec3::zeros()), 0.0);
    }

    #[test]
    fn point_difference_is_a_derivative() {
        let d = Vec3::new(1.0, 1.0, 0.0) - Vec3::new(0.0, 1.0, 0.0);
        assert!(d.is_derivative);
        let p = Vec3::new(1.0, 1.0, 0.0) + d;
        assert!(!p.is_derivative);
        assert!((d + d).is_derivative);

        let mut q = Vec3::new(2.0, 0.0, 0.0);
        q -= Vec3::derivative(1.0, 0.0, 0.0);
        assert!(!q.is_derivative);
    }

    #[test]
    fn unit_len_rejects_zero() {
        let mut z = Vec3::zeros();
        assert!(!z.unit_len());
        let u = Vec3::new(0.0, 3.0, 4.0).unit().unwrap();
        assert_relative_eq!(u.len(), 1.0);
        assert!(u.is_same_dir(&Vec3::new(0.0, 0.6, 0.8)));
    }
}
