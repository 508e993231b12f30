//! Read-only measurement frames attached to bodies.

use crate::algebra::{Trf3, TrfJet, Vec3};
use crate::kinematics::{Body, BodyHandle};

/// A named local frame on a body.
///
/// Probes add no coordinates; they only re-express the body kinematics at another
/// place. Query them through [`Model::probe_jet`](crate::kinematics::Model::probe_jet).
#[derive(Clone, Debug, PartialEq)]
pub struct Probe {
    pub(crate) name: String,
    pub(crate) body: BodyHandle,
    pub(crate) local: Trf3,
}

impl Probe {
    /// The probe name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The body carrying the probe.
    pub fn body(&self) -> BodyHandle {
        self.body
    }

    /// The probe frame in body coordinates.
    pub fn local(&self) -> &Trf3 {
        &self.local
    }

    /// Absolute pose with speed, acceleration and jerk, given the carrying body.
    pub fn jet_on(&self, body: &Body) -> TrfJet {
        *body.jet() * TrfJet::constant(self.local)
    }

    /// Absolute position of the probe origin and its first three time derivatives.
    pub fn point_jet_on(&self, body: &Body) -> [Vec3; 4] {
        let jet = self.jet_on(body);
        let origin = Vec3::zeros();
        [
            jet.pos.transform_vec(&origin),
            Vec3::from_vector(jet.speed.trans, true),
            Vec3::from_vector(jet.accel.trans, true),
            Vec3::from_vector(jet.jerk.trans, true),
        ]
    }
}
