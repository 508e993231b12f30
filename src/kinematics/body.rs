//! Rigid-body definition.

use crate::algebra::{Trf3, TrfJet, Vec3};
use crate::kinematics::{GripHandle, ProbeHandle};

#[derive(Clone, Debug, Default)]
/// Helper struct for defining a body to be added to a [`Model`](crate::kinematics::Model).
pub struct BodyDesc {
    /// Unique body name.
    pub name: String,
    /// The body’s initial absolute pose.
    pub pose: Trf3,
    /// Whether this body is the ground of its component.
    ///
    /// A ground body never moves: it is always picked as the root of its component
    /// and the model-wide [`transform`](crate::kinematics::Model::transform) skips it.
    pub is_ground: bool,
}

impl BodyDesc {
    /// A free body named `name` at the origin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A ground body named `name`.
    #[must_use]
    pub fn ground(name: impl Into<String>) -> Self {
        Self {
            is_ground: true,
            ..Self::new(name)
        }
    }

    /// Sets the initial pose.
    #[must_use]
    pub fn pose(mut self, pose: Trf3) -> Self {
        self.pose = pose;
        self
    }
}

/// A rigid body: its absolute pose and rates plus the links derived by the last
/// topology build.
#[derive(Clone, Debug)]
pub struct Body {
    pub(crate) name: String,
    pub(crate) jet: TrfJet,
    pub(crate) is_ground: bool,
    pub(crate) grips: Vec<GripHandle>,
    pub(crate) probes: Vec<ProbeHandle>,
    // Derived by the topology build.
    pub(crate) parent: Option<GripHandle>,
    pub(crate) level: Option<usize>,
}

impl Body {
    pub(crate) fn from_desc(desc: BodyDesc) -> Self {
        Self {
            name: desc.name,
            jet: TrfJet::constant(desc.pose),
            is_ground: desc.is_ground,
            grips: vec![],
            probes: vec![],
            parent: None,
            level: None,
        }
    }

    /// The body name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Is this a ground body?
    pub fn is_ground(&self) -> bool {
        self.is_ground
    }

    /// The absolute pose.
    pub fn pos(&self) -> &Trf3 {
        &self.jet.pos
    }

    /// Time derivative of the absolute pose.
    pub fn speed(&self) -> &Trf3 {
        &self.jet.speed
    }

    /// Second time derivative of the absolute pose.
    pub fn accel(&self) -> &Trf3 {
        &self.jet.accel
    }

    /// Third time derivative of the absolute pose.
    pub fn jerk(&self) -> &Trf3 {
        &self.jet.jerk
    }

    /// Pose and rates together.
    pub fn jet(&self) -> &TrfJet {
        &self.jet
    }

    /// Inverse pose with its rates.
    pub fn inv_jet(&self) -> TrfJet {
        self.jet.inverse_rigid()
    }

    /// Inverse of the absolute pose.
    pub fn inv_pos(&self) -> Trf3 {
        self.jet.pos.inverse_rigid()
    }

    /// Time derivative of the inverse pose.
    pub fn inv_speed(&self) -> Trf3 {
        self.inv_jet().speed
    }

    /// Second time derivative of the inverse pose.
    pub fn inv_accel(&self) -> Trf3 {
        self.inv_jet().accel
    }

    /// Third time derivative of the inverse pose.
    pub fn inv_jerk(&self) -> Trf3 {
        self.inv_jet().jerk
    }

    /// Maps a point given in body coordinates to absolute coordinates.
    pub fn abs_point(&self, local: &Vec3) -> Vec3 {
        self.jet.pos.transform_vec(local)
    }

    /// Grips attached to this body, in insertion order.
    pub fn grips(&self) -> &[GripHandle] {
        &self.grips
    }

    /// Probes attached to this body.
    pub fn probes(&self) -> &[ProbeHandle] {
        &self.probes
    }

    /// The tree grip leading to this body from its parent, if any.
    ///
    /// Only meaningful after a topology build. Roots have none.
    pub fn parent_grip(&self) -> Option<GripHandle> {
        self.parent
    }

    /// Depth in the spanning tree (0 for a root), or `None` before a topology build.
    pub fn level(&self) -> Option<usize> {
        self.level
    }

    pub(crate) fn clear_tree_links(&mut self) {
        self.parent = None;
        self.level = None;
    }
}
