//! A pose together with its first three time derivatives.

use crate::algebra::Trf3;
use crate::error::Result;
use std::ops::Mul;

/// A pose and its speed, acceleration and jerk.
///
/// Products follow the Leibniz rule and inverses use the closed-form derivatives of
/// `P⁻¹`. The derivative entries are tagged derivatives, so the [`Trf3`] composition rule
/// keeps translations out of the places where they do not belong.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TrfJet {
    /// The pose.
    pub pos: Trf3,
    /// First time derivative.
    pub speed: Trf3,
    /// Second time derivative.
    pub accel: Trf3,
    /// Third time derivative.
    pub jerk: Trf3,
}

impl Default for TrfJet {
    fn default() -> Self {
        Self::constant(Trf3::identity())
    }
}

impl TrfJet {
    /// A pose that does not move.
    #[inline]
    pub fn constant(pos: Trf3) -> Self {
        Self {
            pos,
            speed: Trf3::zero_derivative(),
            accel: Trf3::zero_derivative(),
            jerk: Trf3::zero_derivative(),
        }
    }

    /// Time jet of `E(q(t))` from the partials of `E` with respect to `q`.
    ///
    /// `partials` holds `E`, `∂E`, `∂²E`, `∂³E`; `rates` holds `q̇`, `q̈`, `q⃛`.
    pub fn from_partials(partials: &[Trf3; 4], rates: [f64; 3]) -> Self {
        let [e, e1, e2, e3] = *partials;
        let [v, a, j] = rates;
        Self {
            pos: e,
            speed: e1 * v,
            accel: e2 * (v * v) + e1 * a,
            jerk: e3 * (v * v * v) + e2 * (3.0 * v * a) + e1 * j,
        }
    }

    /// Leibniz product `self ∘ rhs` up to the third derivative.
    pub fn compose(&self, rhs: &TrfJet) -> TrfJet {
        let (a, b) = (self, rhs);
        TrfJet {
            pos: a.pos * b.pos,
            speed: a.speed * b.pos + a.pos * b.speed,
            accel: a.accel * b.pos + (a.speed * b.speed) * 2.0 + a.pos * b.accel,
            jerk: a.jerk * b.pos
                + (a.accel * b.speed) * 3.0
                + (a.speed * b.accel) * 3.0
                + a.pos * b.jerk,
        }
    }

    /// The jet of `pos⁻¹`.
    ///
    /// With `Q = P⁻¹`:
    /// `Q' = -Q P' Q`, `Q'' = -Q (P'' Q + 2 P' Q')`, `Q''' = -Q (P''' Q + 3 P'' Q' + 3 P' Q'')`.
    pub fn try_inverse(&self) -> Result<TrfJet> {
        let q = self.pos.try_inverse()?;
        let q1 = -(q * self.speed * q);
        let q2 = -(q * (self.accel * q + (self.speed * q1) * 2.0));
        let q3 = -(q * (self.jerk * q + (self.accel * q1) * 3.0 + (self.speed * q2) * 3.0));
        Ok(TrfJet {
            pos: q,
            speed: q1,
            accel: q2,
            jerk: q3,
        })
    }

    /// Same as [`Self::try_inverse`] for a rigid pose.
    pub fn inverse_rigid(&self) -> TrfJet {
        let q = self.pos.inverse_rigid();
        let q1 = -(q * self.speed * q);
        let q2 = -(q * (self.accel * q + (self.speed * q1) * 2.0));
        let q3 = -(q * (self.jerk * q + (self.accel * q1) * 3.0 + (self.speed * q2) * 3.0));
        TrfJet {
            pos: q,
            speed: q1,
            accel: q2,
            jerk: q3,
        }
    }

    /// The entry of the given derivative order (0 = pose).
    ///
    /// # Panics
    /// Panics if `order > 3`.
    pub fn order(&self, order: usize) -> &Trf3 {
        match order {
            0 => &self.pos,
            1 => &self.speed,
            2 => &self.accel,
            3 => &self.jerk,
            _ => panic!("jet order {order} out of range 0..=3"),
        }
    }
}

impl Mul<TrfJet> for TrfJet {
    type Output = TrfJet;

    #[inline]
    fn mul(self, rhs: TrfJet) -> TrfJet {
        self.compose(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na::Vector3;

    // Cubic translation followed by steady rotations about x and z.
    fn motion(t: f64) -> Trf3 {
        let c = Vector3::new(1.0, -2.0, 0.5);
        let v = Vector3::new(0.3, 0.1, -0.4);
        let a = Vector3::new(-0.2, 0.6, 0.1);
        let j = Vector3::new(0.05, 0.0, 0.3);
        Trf3::from_translation(c + v * t + a * (t * t / 2.0) + j * (t * t * t / 6.0))
            * Trf3::rot_x(0.5 * t)
            * Trf3::rot_z(0.8 * t)
    }

    fn numeric_jet(f: impl Fn(f64) -> Trf3, t: f64) -> TrfJet {
        let h = 1.0e-3;
        let d = |a: Trf3, b: Trf3, s: f64| Trf3::derivative(a.rot - b.rot, a.trans - b.trans) * s;
        let (m2, m1, p0, p1, p2) = (f(t - 2.0 * h), f(t - h), f(t), f(t + h), f(t + 2.0 * h));
        TrfJet {
            pos: p0,
            speed: d(p1, m1, 1.0 / (2.0 * h)),
            accel: d(p1, p0, 1.0 / (h * h)) + d(m1, p0, 1.0 / (h * h)),
            jerk: d(p2, m2, 1.0 / (2.0 * h * h * h)) + d(m1, p1, 1.0 / (h * h * h)),
        }
    }

    fn assert_jet_eq(a: &TrfJet, b: &TrfJet, eps: f64) {
        for k in 0..4 {
            assert!(
                a.order(k).relative_eq(b.order(k), eps),
                "order {k}: {:?} vs {:?}",
                a.order(k),
                b.order(k)
            );
        }
    }

    #[test]
    fn leibniz_product_matches_finite_differences() {
        let t = 0.4;
        let a = numeric_jet(motion, t);
        let b = numeric_jet(|t| motion(2.0 * t).inverse_rigid(), t);
        let prod = a * b;
        let expected = numeric_jet(|t| motion(t) * motion(2.0 * t).inverse_rigid(), t);
        assert_jet_eq(&prod, &expected, 1.0e-4);
    }

    #[test]
    fn inverse_matches_finite_differences() {
        let t = -0.3;
        let jet = numeric_jet(motion, t);
        let inv = jet.try_inverse().unwrap();
        let expected = numeric_jet(|t| motion(t).inverse_rigid(), t);
        assert_jet_eq(&inv, &expected, 1.0e-4);
        assert_jet_eq(&jet.inverse_rigid(), &inv, 1.0e-10);
    }

    #[test]
    fn constant_jet_is_neutral() {
        let jet = numeric_jet(motion, 0.1);
        let id = TrfJet::default();
        assert_jet_eq(&(id * jet), &jet, 1.0e-12);
        assert_jet_eq(&(jet * id), &jet, 1.0e-12);
    }
}
