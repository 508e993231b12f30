//! Homogeneous 3D transform with a derivative tag.

use crate::algebra::Vec3;
use crate::error::{KinematicsError, Result};
use na::{Matrix3, Rotation3, Unit, Vector3};
use num_traits::Zero;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// Determinants below this magnitude make a transform non-invertible.
pub const SINGULAR_DET: f64 = 1.0e-12;

/// A 3x4 transform: a 3x3 block followed by a translation column.
///
/// A pose (`is_derivative == false`) maps local coordinates to parent coordinates. A
/// derivative (`is_derivative == true`) is the time or coordinate derivative of a pose: its
/// implicit homogeneous row is `[0 0 0 0]` instead of `[0 0 0 1]`, so it never contributes a
/// translation when it is the *right* operand of a composition.
///
/// Composition follows `C = A ∘ B`:
/// - `C.rot = A.rot · B.rot`,
/// - `C.trans = A.rot · B.trans + (A.trans if B is a pose, else 0)`,
/// - `C.is_derivative = A.is_derivative || B.is_derivative`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Trf3 {
    /// The 3x3 block (a rotation for poses, its derivative otherwise).
    pub rot: Matrix3<f64>,
    /// The translation column.
    pub trans: Vector3<f64>,
    /// Set if this transform is a derivative of a pose.
    pub is_derivative: bool,
}

impl Default for Trf3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Trf3 {
    /// The identity pose.
    #[inline]
    pub fn identity() -> Self {
        Self {
            rot: Matrix3::identity(),
            trans: Vector3::zeros(),
            is_derivative: false,
        }
    }

    /// A derivative transform with every entry zero.
    #[inline]
    pub fn zero_derivative() -> Self {
        Self {
            rot: Matrix3::zeros(),
            trans: Vector3::zeros(),
            is_derivative: true,
        }
    }

    /// A pose from a 3x3 block and a translation.
    #[inline]
    pub fn new(rot: Matrix3<f64>, trans: Vector3<f64>) -> Self {
        Self {
            rot,
            trans,
            is_derivative: false,
        }
    }

    /// A derivative transform from a 3x3 block and a translation.
    #[inline]
    pub fn derivative(rot: Matrix3<f64>, trans: Vector3<f64>) -> Self {
        Self {
            rot,
            trans,
            is_derivative: true,
        }
    }

    /// A pure translation.
    #[inline]
    pub fn from_translation(trans: Vector3<f64>) -> Self {
        Self::new(Matrix3::identity(), trans)
    }

    /// A rotation of `angle` radians about `axis`, through the origin.
    pub fn from_axis_angle(axis: &Unit<Vector3<f64>>, angle: f64) -> Self {
        Self::new(
            Rotation3::from_axis_angle(axis, angle).into_inner(),
            Vector3::zeros(),
        )
    }

    /// A rotation about the x axis.
    pub fn rot_x(angle: f64) -> Self {
        Self::from_axis_angle(&Vector3::x_axis(), angle)
    }

    /// A rotation about the y axis.
    pub fn rot_y(angle: f64) -> Self {
        Self::from_axis_angle(&Vector3::y_axis(), angle)
    }

    /// A rotation about the z axis.
    pub fn rot_z(angle: f64) -> Self {
        Self::from_axis_angle(&Vector3::z_axis(), angle)
    }

    /// The local-to-parent pose of a frame located at `org`.
    ///
    /// The frame's z axis is `z_dir`; its x axis is `x_dir` with the component along
    /// `z_dir` removed. Returns `None` if either direction is zero or both are parallel.
    pub fn from_frame(org: &Vec3, z_dir: &Vec3, x_dir: &Vec3) -> Option<Self> {
        let lz = z_dir.coords.try_normalize(f64::EPSILON)?;
        let ly = lz.cross(&x_dir.coords).try_normalize(f64::EPSILON)?;
        let lx = ly.cross(&lz);
        Some(Self::new(Matrix3::from_columns(&[lx, ly, lz]), org.coords))
    }

    /// The translation as a point.
    #[inline]
    pub fn origin(&self) -> Vec3 {
        Vec3::from_vector(self.trans, self.is_derivative)
    }

    /// Determinant of the 3x3 block.
    #[inline]
    pub fn determinant(&self) -> f64 {
        self.rot.determinant()
    }

    /// Composes `self ∘ rhs`. See the type-level documentation for the tag rule.
    #[inline]
    pub fn compose(&self, rhs: &Trf3) -> Trf3 {
        let mut trans = self.rot * rhs.trans;
        if !rhs.is_derivative {
            trans += self.trans;
        }
        Trf3 {
            rot: self.rot * rhs.rot,
            trans,
            is_derivative: self.is_derivative || rhs.is_derivative,
        }
    }

    /// The algebraic inverse.
    ///
    /// Fails with [`KinematicsError::SingularTransform`] when the 3x3 block has a
    /// determinant below [`SINGULAR_DET`].
    pub fn try_inverse(&self) -> Result<Trf3> {
        let det = self.determinant();
        if det.abs() < SINGULAR_DET {
            return Err(KinematicsError::SingularTransform { det });
        }
        let inv = self
            .rot
            .try_inverse()
            .ok_or(KinematicsError::SingularTransform { det })?;
        Ok(Trf3 {
            rot: inv,
            trans: -(inv * self.trans),
            is_derivative: self.is_derivative,
        })
    }

    /// Inverts in place. On failure `self` is left untouched.
    pub fn invert(&mut self) -> Result<()> {
        *self = self.try_inverse()?;
        Ok(())
    }

    /// The inverse of a rigid pose, using the transpose of the rotation block.
    ///
    /// Only valid when `rot` is orthonormal.
    #[inline]
    pub fn inverse_rigid(&self) -> Trf3 {
        let rt = self.rot.transpose();
        Trf3 {
            rot: rt,
            trans: -(rt * self.trans),
            is_derivative: self.is_derivative,
        }
    }

    /// Applies this transform to a tagged vector.
    ///
    /// The translation is added only to points. The result is a derivative if either the
    /// vector or this transform is one.
    pub fn transform_vec(&self, v: &Vec3) -> Vec3 {
        let mut coords = self.rot * v.coords;
        if !v.is_derivative {
            coords += self.trans;
        }
        Vec3::from_vector(coords, v.is_derivative || self.is_derivative)
    }

    /// Applies this transform to a point.
    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rot * p + self.trans
    }

    /// Mirrors this transform through the plane through `org` with normal `axis`.
    ///
    /// The result is `M ∘ self ∘ M`, where `M` is the reflection. A proper rotation
    /// stays proper.
    pub fn mirror(&self, org: &Vec3, axis: &Vec3) -> Option<Trf3> {
        let aux = if axis.y().abs() < axis.x().abs() {
            Vec3::new(0.0, 1.0, 0.0)
        } else {
            Vec3::new(1.0, 0.0, 0.0)
        };
        let frame = Trf3::from_frame(org, axis, &aux)?;
        let flip = Trf3::new(
            Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0)),
            Vector3::zeros(),
        );
        let reflect = frame * flip * frame.inverse_rigid();
        Some(reflect * *self * reflect)
    }

    /// The rotation vector (axis times angle) of the 3x3 block.
    ///
    /// The block must be a rotation. Angles close to `π` keep their magnitude
    /// instead of collapsing like the skew-symmetric part does.
    pub fn scaled_axis(&self) -> Vector3<f64> {
        Rotation3::from_matrix_unchecked(self.rot).scaled_axis()
    }

    /// Whether both transforms agree within `eps` entry-wise.
    pub fn relative_eq(&self, other: &Trf3, eps: f64) -> bool {
        (self.rot - other.rot).amax() <= eps && (self.trans - other.trans).amax() <= eps
    }
}

impl Mul<Trf3> for Trf3 {
    type Output = Trf3;

    #[inline]
    fn mul(self, rhs: Trf3) -> Trf3 {
        self.compose(&rhs)
    }
}

impl<'a> Mul<&'a Trf3> for &'a Trf3 {
    type Output = Trf3;

    #[inline]
    fn mul(self, rhs: &'a Trf3) -> Trf3 {
        self.compose(rhs)
    }
}

impl Mul<f64> for Trf3 {
    type Output = Trf3;

    fn mul(self, rhs: f64) -> Trf3 {
        Trf3 {
            rot: self.rot * rhs,
            trans: self.trans * rhs,
            is_derivative: self.is_derivative,
        }
    }
}

impl Add for Trf3 {
    type Output = Trf3;

    /// Entry-wise sum; only meaningful between derivatives.
    fn add(self, rhs: Trf3) -> Trf3 {
        Trf3 {
            rot: self.rot + rhs.rot,
            trans: self.trans + rhs.trans,
            is_derivative: self.is_derivative || rhs.is_derivative,
        }
    }
}

impl AddAssign for Trf3 {
    fn add_assign(&mut self, rhs: Trf3) {
        *self = *self + rhs;
    }
}

impl Sub for Trf3 {
    type Output = Trf3;

    fn sub(self, rhs: Trf3) -> Trf3 {
        self + (-rhs)
    }
}

impl Neg for Trf3 {
    type Output = Trf3;

    fn neg(self) -> Trf3 {
        Trf3 {
            rot: -self.rot,
            trans: -self.trans,
            is_derivative: self.is_derivative,
        }
    }
}

impl Zero for Trf3 {
    fn zero() -> Self {
        Self::zero_derivative()
    }

    fn is_zero(&self) -> bool {
        self.rot.iter().all(|e| *e == 0.0) && self.trans.iter().all(|e| *e == 0.0)
    }
}
