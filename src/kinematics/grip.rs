//! Grips: offset relations between two bodies, optionally through a joint.

use crate::algebra::{Trf3, TrfJet};
use crate::kinematics::{BodyHandle, Joint};
use crate::track::ArcLinTrack;

/// How the last topology build used a grip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum GripRole {
    /// No topology was built since the grip was added.
    #[default]
    Unclassified,
    /// Spanning-tree edge: places its child body.
    Tree,
    /// Loop-closing edge: contributes six residual equations.
    Loop,
}

#[derive(Clone, Debug)]
/// Helper struct for defining a grip to be added to a [`Model`](crate::kinematics::Model).
pub struct GripDesc {
    /// Unique grip name.
    pub name: String,
    /// First body.
    pub body1: BodyHandle,
    /// Second body.
    pub body2: BodyHandle,
    /// Grip frame in the coordinates of `body1`.
    pub offset1: Trf3,
    /// Grip frame in the coordinates of `body2`.
    pub offset2: Trf3,
    /// The joint, or `None` for a rigid connection.
    pub joint: Option<Joint>,
}

impl GripDesc {
    /// A rigid grip between two bodies with identity offsets.
    pub fn new(name: impl Into<String>, body1: BodyHandle, body2: BodyHandle) -> Self {
        Self {
            name: name.into(),
            body1,
            body2,
            offset1: Trf3::identity(),
            offset2: Trf3::identity(),
            joint: None,
        }
    }

    /// Sets both offsets.
    #[must_use]
    pub fn offsets(mut self, offset1: Trf3, offset2: Trf3) -> Self {
        self.offset1 = offset1;
        self.offset2 = offset2;
        self
    }

    /// Inserts a joint between the two grip frames.
    #[must_use]
    pub fn joint(mut self, joint: Joint) -> Self {
        self.joint = Some(joint);
        self
    }
}

/// A named relation `pos(body1) ∘ offset1 ∘ J = pos(body2) ∘ offset2`.
#[derive(Clone, Debug)]
pub struct Grip {
    pub(crate) name: String,
    pub(crate) body1: BodyHandle,
    pub(crate) body2: BodyHandle,
    pub(crate) offset1: Trf3,
    pub(crate) offset2: Trf3,
    pub(crate) joint: Option<Joint>,
    pub(crate) role: GripRole,
    pub(crate) parent_rel: bool,
    pub(crate) loop_count: usize,
}

impl Grip {
    pub(crate) fn from_desc(desc: GripDesc) -> Self {
        Self {
            name: desc.name,
            body1: desc.body1,
            body2: desc.body2,
            offset1: desc.offset1,
            offset2: desc.offset2,
            joint: desc.joint,
            role: GripRole::Unclassified,
            parent_rel: true,
            loop_count: 0,
        }
    }

    /// The grip name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First body.
    pub fn body1(&self) -> BodyHandle {
        self.body1
    }

    /// Second body.
    pub fn body2(&self) -> BodyHandle {
        self.body2
    }

    /// The body on the other side of `body`, or `None` if `body` is not attached.
    pub fn other_body(&self, body: BodyHandle) -> Option<BodyHandle> {
        if body == self.body1 {
            Some(self.body2)
        } else if body == self.body2 {
            Some(self.body1)
        } else {
            None
        }
    }

    /// Grip frame in `body1` coordinates.
    pub fn offset1(&self) -> &Trf3 {
        &self.offset1
    }

    /// Grip frame in `body2` coordinates.
    pub fn offset2(&self) -> &Trf3 {
        &self.offset2
    }

    /// The joint, if this is not a rigid grip.
    pub fn joint(&self) -> Option<&Joint> {
        self.joint.as_ref()
    }

    /// Role assigned by the last topology build.
    pub fn role(&self) -> GripRole {
        self.role
    }

    /// Whether `body1` is the tree parent of `body2`.
    ///
    /// Set when the grip is classified as a tree edge; loop grips keep `true`.
    pub fn is_parent_rel(&self) -> bool {
        self.parent_rel
    }

    /// Number of closure loops passing through this grip.
    pub fn loop_count(&self) -> usize {
        self.loop_count
    }

    /// Relative pose `offset1 ∘ J ∘ offset2⁻¹` of `body2` in `body1` coordinates.
    pub fn relative_pos(&self, tracks: &[ArcLinTrack]) -> Trf3 {
        let joint = self
            .joint
            .as_ref()
            .map_or_else(Trf3::identity, |j| j.pos(tracks));
        self.offset1 * joint * self.offset2.inverse_rigid()
    }

    /// The relative pose with its rates, `offset1 ∘ J ∘ offset2⁻¹`.
    pub fn relative_jet(&self, tracks: &[ArcLinTrack]) -> TrfJet {
        let joint = self
            .joint
            .as_ref()
            .map_or_else(TrfJet::default, |j| j.jet(tracks));
        TrfJet::constant(self.offset1) * joint * TrfJet::constant(self.offset2.inverse_rigid())
    }

    /// The relative pose taken from `from` to the other body.
    ///
    /// Walking from `body1` gives [`Self::relative_pos`], walking from `body2` its inverse.
    pub(crate) fn step_jet(&self, from: BodyHandle, tracks: &[ArcLinTrack]) -> TrfJet {
        let jet = self.relative_jet(tracks);
        if from == self.body1 {
            jet
        } else {
            jet.inverse_rigid()
        }
    }

    /// The step pose from `from` with its partials with respect to each joint coordinate.
    pub(crate) fn step_partials(
        &self,
        from: BodyHandle,
        tracks: &[ArcLinTrack],
    ) -> (Trf3, Vec<Trf3>) {
        let (j, dj) = match &self.joint {
            Some(joint) => joint.partials(tracks),
            None => (Trf3::identity(), vec![]),
        };
        let off2_inv = self.offset2.inverse_rigid();
        let step = self.offset1 * j * off2_inv;
        let forward = from == self.body1;
        let derivs = dj
            .into_iter()
            .map(|d| {
                let d_step = self.offset1 * d * off2_inv;
                if forward {
                    d_step
                } else {
                    // d(S⁻¹) = -S⁻¹ dS S⁻¹
                    let inv = step.inverse_rigid();
                    -(inv * d_step * inv)
                }
            })
            .collect();
        if forward {
            (step, derivs)
        } else {
            (step.inverse_rigid(), derivs)
        }
    }
}
