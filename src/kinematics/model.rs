//! The model arena: bodies, grips, tracks and probes addressed by handle or name.

use crate::algebra::{Trf3, TrfJet, Vec3};
use crate::error::{KinematicsError, Result};
use crate::kinematics::{
    Body, BodyDesc, Grip, GripDesc, GripRole, Joint, JointCoordsMut, JointKind, Probe, Topology,
};
use crate::track::ArcLinTrack;
use std::collections::HashMap;

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) usize);

        impl $name {
            /// Arena index of the handle.
            pub fn index(&self) -> usize {
                self.0
            }
        }
    };
}

handle!(
    /// Handle to a body of a [`Model`].
    BodyHandle
);
handle!(
    /// Handle to a grip of a [`Model`].
    GripHandle
);
handle!(
    /// Handle to a track of a [`Model`].
    TrackHandle
);
handle!(
    /// Handle to a probe of a [`Model`].
    ProbeHandle
);

/// Handle to a topology produced by [`Model::build_topology`].
///
/// It records the model epoch at build time. Any structural edit afterwards makes it
/// stale and every call taking it fails with [`KinematicsError::StaleTopology`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopologyHandle {
    pub(crate) index: usize,
    pub(crate) epoch: u64,
}

impl TopologyHandle {
    /// Index of the topology (one per connected component).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Model epoch at build time.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

fn insert_name<H: Copy>(
    names: &mut HashMap<String, H>,
    kind: &'static str,
    name: &str,
    handle: H,
) -> Result<()> {
    if names.contains_key(name) {
        return Err(KinematicsError::duplicate_name(kind, name));
    }
    names.insert(name.to_string(), handle);
    Ok(())
}

fn lookup<H: Copy>(names: &HashMap<String, H>, kind: &'static str, name: &str) -> Result<H> {
    names
        .get(name)
        .copied()
        .ok_or_else(|| KinematicsError::unknown_name(kind, name))
}

/// Owns every body, grip, track and probe of a mechanism, plus the topologies
/// derived from them.
///
/// Bodies, grips and probes are stored in slots that stay put when an element is
/// removed, so handles of the remaining elements stay valid. Tracks are never removed.
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub(crate) bodies: Vec<Option<Body>>,
    pub(crate) grips: Vec<Option<Grip>>,
    pub(crate) tracks: Vec<ArcLinTrack>,
    pub(crate) probes: Vec<Option<Probe>>,
    body_names: HashMap<String, BodyHandle>,
    grip_names: HashMap<String, GripHandle>,
    track_names: HashMap<String, TrackHandle>,
    probe_names: HashMap<String, ProbeHandle>,
    pub(crate) topologies: Vec<Topology>,
    pub(crate) epoch: u64,
    pub(crate) built_epoch: Option<u64>,
}

impl Model {
    /// An empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural edit counter. Topologies built at an older epoch are stale.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    /*
     * Bodies.
     */
    /// Adds a body.
    ///
    /// # Errors
    /// [`KinematicsError::DuplicateName`] if the name is taken.
    pub fn add_body(&mut self, desc: BodyDesc) -> Result<BodyHandle> {
        let handle = BodyHandle(self.bodies.len());
        insert_name(&mut self.body_names, "body", &desc.name, handle)?;
        self.bodies.push(Some(Body::from_desc(desc)));
        self.bump_epoch();
        Ok(handle)
    }

    /// Removes a body along with every grip and probe attached to it.
    pub fn remove_body(&mut self, handle: BodyHandle) -> Result<Body> {
        self.body(handle)?;
        let attached: Vec<GripHandle> = self
            .grips_iter()
            .filter(|(_, g)| g.body1 == handle || g.body2 == handle)
            .map(|(h, _)| h)
            .collect();
        for grip in attached {
            self.remove_grip(grip)?;
        }
        let probes = self.body(handle)?.probes.clone();
        for probe in probes {
            if let Some(p) = self.probes[probe.0].take() {
                self.probe_names.remove(&p.name);
            }
        }
        let body = self.bodies[handle.0]
            .take()
            .ok_or(KinematicsError::InvalidHandle {
                kind: "body",
                index: handle.0,
            })?;
        self.body_names.remove(&body.name);
        self.bump_epoch();
        Ok(body)
    }

    /// The body behind `handle`.
    pub fn body(&self, handle: BodyHandle) -> Result<&Body> {
        self.bodies
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(KinematicsError::InvalidHandle {
                kind: "body",
                index: handle.0,
            })
    }

    pub(crate) fn body_mut(&mut self, handle: BodyHandle) -> Result<&mut Body> {
        self.bodies
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(KinematicsError::InvalidHandle {
                kind: "body",
                index: handle.0,
            })
    }

    /// Looks a body up by name.
    pub fn body_by_name(&self, name: &str) -> Result<BodyHandle> {
        lookup(&self.body_names, "body", name)
    }

    /// Iterates over the live bodies.
    pub fn bodies_iter(&self) -> impl Iterator<Item = (BodyHandle, &Body)> {
        self.bodies
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (BodyHandle(i), b)))
    }

    /// Number of live bodies.
    pub fn body_count(&self) -> usize {
        self.body_names.len()
    }

    /// Moves a body. Rates are reset to zero.
    ///
    /// Bodies placed by a built topology are overwritten by the next
    /// [`update_positions`](Self::update_positions); use this to place roots or to seed
    /// [`init_vars_from_pos`](Self::init_vars_from_pos).
    pub fn set_body_pos(&mut self, handle: BodyHandle, pose: Trf3) -> Result<()> {
        self.body_mut(handle)?.jet = TrfJet::constant(pose);
        Ok(())
    }

    /// Sets the pose and rates of a body, typically a moving root.
    pub fn set_body_jet(&mut self, handle: BodyHandle, jet: TrfJet) -> Result<()> {
        self.body_mut(handle)?.jet = jet;
        Ok(())
    }

    /// Flags a body as ground (or not).
    pub fn set_ground(&mut self, handle: BodyHandle, is_ground: bool) -> Result<()> {
        let body = self.body_mut(handle)?;
        if body.is_ground != is_ground {
            body.is_ground = is_ground;
            self.bump_epoch();
        }
        Ok(())
    }

    /// Applies `trf` to every non-ground body, rates included.
    pub fn transform(&mut self, trf: &Trf3) {
        let trf = TrfJet::constant(*trf);
        for body in self.bodies.iter_mut().flatten() {
            if !body.is_ground {
                body.jet = trf * body.jet;
            }
        }
    }

    /*
     * Grips.
     */
    /// Adds a grip.
    ///
    /// # Errors
    /// [`KinematicsError::DuplicateName`] if the name is taken, and
    /// [`KinematicsError::InvalidHandle`] if a body or the track of a track joint does not
    /// exist.
    pub fn add_grip(&mut self, desc: GripDesc) -> Result<GripHandle> {
        self.body(desc.body1)?;
        self.body(desc.body2)?;
        if let Some(JointKind::Track { track, .. }) = desc.joint.as_ref().map(Joint::kind) {
            self.track(*track)?;
        }
        let handle = GripHandle(self.grips.len());
        insert_name(&mut self.grip_names, "grip", &desc.name, handle)?;
        let (b1, b2) = (desc.body1, desc.body2);
        self.grips.push(Some(Grip::from_desc(desc)));
        self.body_mut(b1)?.grips.push(handle);
        if b2 != b1 {
            self.body_mut(b2)?.grips.push(handle);
        }
        self.bump_epoch();
        Ok(handle)
    }

    /// Removes a grip and its joint.
    pub fn remove_grip(&mut self, handle: GripHandle) -> Result<Grip> {
        let grip = self
            .grips
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or(KinematicsError::InvalidHandle {
                kind: "grip",
                index: handle.0,
            })?;
        self.grip_names.remove(&grip.name);
        for body in [grip.body1, grip.body2] {
            if let Ok(body) = self.body_mut(body) {
                body.grips.retain(|g| *g != handle);
                if body.parent == Some(handle) {
                    body.clear_tree_links();
                }
            }
        }
        self.bump_epoch();
        Ok(grip)
    }

    /// The grip behind `handle`.
    pub fn grip(&self, handle: GripHandle) -> Result<&Grip> {
        self.grips
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(KinematicsError::InvalidHandle {
                kind: "grip",
                index: handle.0,
            })
    }

    pub(crate) fn grip_mut(&mut self, handle: GripHandle) -> Result<&mut Grip> {
        self.grips
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(KinematicsError::InvalidHandle {
                kind: "grip",
                index: handle.0,
            })
    }

    /// Looks a grip up by name.
    pub fn grip_by_name(&self, name: &str) -> Result<GripHandle> {
        lookup(&self.grip_names, "grip", name)
    }

    /// Iterates over the live grips.
    pub fn grips_iter(&self) -> impl Iterator<Item = (GripHandle, &Grip)> {
        self.grips
            .iter()
            .enumerate()
            .filter_map(|(i, g)| g.as_ref().map(|g| (GripHandle(i), g)))
    }

    /// The joint of a grip.
    ///
    /// # Errors
    /// [`KinematicsError::InvalidHandle`] for a dead handle or a rigid grip.
    pub fn joint(&self, grip: GripHandle) -> Result<&Joint> {
        self.grip(grip)?
            .joint
            .as_ref()
            .ok_or(KinematicsError::InvalidHandle {
                kind: "joint",
                index: grip.0,
            })
    }

    /// Write access to the coordinate values and rates of a grip's joint.
    ///
    /// # Errors
    /// [`KinematicsError::InvalidHandle`] for a dead handle or a rigid grip.
    pub fn joint_mut(&mut self, grip: GripHandle) -> Result<JointCoordsMut<'_>> {
        self.joint_entry(grip).map(JointCoordsMut::new)
    }

    fn joint_entry(&mut self, grip: GripHandle) -> Result<&mut Joint> {
        self.grip_mut(grip)?
            .joint
            .as_mut()
            .ok_or(KinematicsError::InvalidHandle {
                kind: "joint",
                index: grip.0,
            })
    }

    /// Changes the fixed flag of a joint coordinate.
    ///
    /// A change alters the variable layout and makes existing topologies stale.
    ///
    /// # Panics
    /// Panics if `local` is not a coordinate of the joint.
    pub fn set_fixed(&mut self, grip: GripHandle, local: usize, fixed: bool) -> Result<()> {
        if self.joint_entry(grip)?.set_fixed(local, fixed) {
            self.bump_epoch();
        }
        Ok(())
    }

    /// Sets the fixed flag of every coordinate of every joint.
    pub fn set_fixed_all(&mut self, fixed: bool) {
        let mut changed = false;
        let joints = self
            .grips
            .iter_mut()
            .flatten()
            .filter_map(|g| g.joint.as_mut());
        for joint in joints {
            for local in 0..joint.var_count() {
                changed |= joint.set_fixed(local, fixed);
            }
        }
        if changed {
            self.bump_epoch();
        }
    }

    /// `pos(body1) ∘ offset1 ∘ J ∘ offset2⁻¹ ∘ pos(body2)⁻¹`: identity when the grip holds.
    pub fn grip_mismatch(&self, handle: GripHandle) -> Result<Trf3> {
        let grip = self.grip(handle)?;
        let b1 = self.body(grip.body1)?;
        let b2 = self.body(grip.body2)?;
        Ok(*b1.pos() * grip.relative_pos(&self.tracks) * b2.inv_pos())
    }

    /*
     * Tracks.
     */
    /// Adds a track.
    pub fn add_track(&mut self, name: &str, track: ArcLinTrack) -> Result<TrackHandle> {
        let handle = TrackHandle(self.tracks.len());
        insert_name(&mut self.track_names, "track", name, handle)?;
        self.tracks.push(track);
        Ok(handle)
    }

    /// The track behind `handle`.
    pub fn track(&self, handle: TrackHandle) -> Result<&ArcLinTrack> {
        self.tracks.get(handle.0).ok_or(KinematicsError::InvalidHandle {
            kind: "track",
            index: handle.0,
        })
    }

    /// Mutable access to a track, for example to reload its points.
    pub fn track_mut(&mut self, handle: TrackHandle) -> Result<&mut ArcLinTrack> {
        self.tracks.get_mut(handle.0).ok_or(KinematicsError::InvalidHandle {
            kind: "track",
            index: handle.0,
        })
    }

    /// Looks a track up by name.
    pub fn track_by_name(&self, name: &str) -> Result<TrackHandle> {
        lookup(&self.track_names, "track", name)
    }

    /// All tracks, indexed by [`TrackHandle::index`].
    pub fn tracks(&self) -> &[ArcLinTrack] {
        &self.tracks
    }

    /// Pairs `track` with the parallel rail `co_track`.
    /// See [`ArcLinTrack::set_co_track`].
    pub fn set_co_track(
        &mut self,
        track: TrackHandle,
        co_track: TrackHandle,
        reverse_dir: bool,
        max_s_diff: f64,
    ) -> Result<()> {
        let co = self.track(co_track)?.clone();
        self.track_mut(track)?
            .set_co_track(&co, reverse_dir, max_s_diff)
    }

    /*
     * Probes.
     */
    /// Attaches a probe frame `local` (in body coordinates) to `body`.
    pub fn add_probe(&mut self, name: &str, body: BodyHandle, local: Trf3) -> Result<ProbeHandle> {
        self.body(body)?;
        let handle = ProbeHandle(self.probes.len());
        insert_name(&mut self.probe_names, "probe", name, handle)?;
        self.probes.push(Some(Probe {
            name: name.to_string(),
            body,
            local,
        }));
        self.body_mut(body)?.probes.push(handle);
        Ok(handle)
    }

    /// The probe behind `handle`.
    pub fn probe(&self, handle: ProbeHandle) -> Result<&Probe> {
        self.probes
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(KinematicsError::InvalidHandle {
                kind: "probe",
                index: handle.0,
            })
    }

    /// Looks a probe up by name.
    pub fn probe_by_name(&self, name: &str) -> Result<ProbeHandle> {
        lookup(&self.probe_names, "probe", name)
    }

    /// Absolute pose of a probe frame with its speed, acceleration and jerk.
    pub fn probe_jet(&self, handle: ProbeHandle) -> Result<TrfJet> {
        let probe = self.probe(handle)?;
        Ok(probe.jet_on(self.body(probe.body)?))
    }

    /// Absolute position of a probe origin and its first three time derivatives.
    pub fn probe_point_jet(&self, handle: ProbeHandle) -> Result<[Vec3; 4]> {
        let probe = self.probe(handle)?;
        Ok(probe.point_jet_on(self.body(probe.body)?))
    }

    /*
     * Topology bookkeeping.
     */
    pub(crate) fn reset_derived(&mut self) {
        for body in self.bodies.iter_mut().flatten() {
            body.clear_tree_links();
        }
        for grip in self.grips.iter_mut().flatten() {
            grip.role = GripRole::Unclassified;
            grip.parent_rel = true;
            grip.loop_count = 0;
            if let Some(joint) = grip.joint.as_mut() {
                joint.clear_var_indices();
            }
        }
        if !self.topologies.is_empty() {
            log::debug!(
                "dropping {} topologies built at epoch {:?}",
                self.topologies.len(),
                self.built_epoch
            );
        }
        self.topologies.clear();
        self.built_epoch = None;
    }

    /// The topology behind `handle`.
    ///
    /// # Errors
    /// [`KinematicsError::StaleTopology`] if the model changed since the build and
    /// [`KinematicsError::NotBuilt`] if no such topology exists.
    pub fn topology(&self, handle: TopologyHandle) -> Result<&Topology> {
        if self.built_epoch != Some(handle.epoch) || handle.epoch != self.epoch {
            return Err(KinematicsError::StaleTopology {
                built: handle.epoch,
                current: self.epoch,
            });
        }
        self.topologies
            .get(handle.index)
            .ok_or(KinematicsError::NotBuilt {
                index: handle.index,
            })
    }

    /// Handles to the topologies of the last build, if it is still current.
    pub fn topology_handles(&self) -> Vec<TopologyHandle> {
        match self.built_epoch {
            Some(epoch) if epoch == self.epoch => (0..self.topologies.len())
                .map(|index| TopologyHandle { index, epoch })
                .collect(),
            _ => vec![],
        }
    }
}
