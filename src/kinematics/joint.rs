//! Joint variants and their generalized coordinates.

use crate::algebra::{Trf3, TrfJet, Vec3};
use crate::kinematics::TrackHandle;
use crate::track::ArcLinTrack;
use na::{Matrix3, Rotation3, Unit, Vector3};
use num_traits::Zero;
use std::ops::Deref;

// Track handles of joints owned by a `Model` are checked when the grip is added,
// and tracks are never removed, so this only fails for joints evaluated against a
// foreign track list.
fn track_of(tracks: &[ArcLinTrack], track: TrackHandle) -> &ArcLinTrack {
    tracks.get(track.0).unwrap_or_else(|| {
        panic!(
            "track handle {} is not in the given track list ({} tracks)",
            track.0,
            tracks.len()
        )
    })
}

/// The kinematic pair implemented by a [`Joint`].
///
/// Every variant is a product of elementary motions, one per coordinate, applied in
/// coordinate order. The z axis is the main joint axis.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum JointKind {
    /// Rotation about z.
    Revolute,
    /// Translation along z.
    Slide,
    /// Rotation about z, then translation along z.
    RevoluteSlide,
    /// Universal joint: rotation about z, then about the rotated y.
    Cross,
    /// Spherical joint: rotations about z, y and x.
    Ball,
    /// Spherical joint followed by a translation along z.
    BallSlide,
    /// Translation along z, spherical joint, translation along z.
    Ball2Slide,
    /// Wheel on a rail.
    ///
    /// Coordinates: arclength `s` on the track, camber about the rail frame's y axis,
    /// misalignment about x, and a lateral slide along z. The wheel centre sits at
    /// `wheel_rad + pipe_radius` along the rail normal (see [`ArcLinTrack::frame`]).
    Track {
        /// The rail.
        track: TrackHandle,
        /// Wheel radius.
        wheel_rad: f64,
    },
}

impl JointKind {
    /// Number of generalized coordinates.
    pub fn coord_count(&self) -> usize {
        match self {
            Self::Revolute | Self::Slide => 1,
            Self::RevoluteSlide | Self::Cross => 2,
            Self::Ball => 3,
            Self::BallSlide | Self::Track { .. } => 4,
            Self::Ball2Slide => 5,
        }
    }

    /// Short lowercase name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Revolute => "revolute",
            Self::Slide => "slide",
            Self::RevoluteSlide => "revolute-slide",
            Self::Cross => "cross",
            Self::Ball => "ball",
            Self::BallSlide => "ball-slide",
            Self::Ball2Slide => "ball-2-slide",
            Self::Track { .. } => "track",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Stage {
    Rot(Unit<Vector3<f64>>),
    Slide {
        axis: Vector3<f64>,
        offset: Vector3<f64>,
    },
    TrackFrame(TrackHandle),
}

impl Stage {
    fn is_angular(&self) -> bool {
        matches!(self, Stage::Rot(_))
    }

    /// The stage transform and its first three derivatives with respect to `q`.
    fn partials(&self, q: f64, tracks: &[ArcLinTrack]) -> [Trf3; 4] {
        match self {
            Stage::Rot(axis) => {
                let r = Trf3::from_axis_angle(axis, q);
                let k = Trf3::derivative(axis.cross_matrix(), Vector3::zeros());
                let r1 = k * r;
                let r2 = k * r1;
                let r3 = k * r2;
                [r, r1, r2, r3]
            }
            Stage::Slide { axis, offset } => [
                Trf3::from_translation(offset + axis * q),
                Trf3::derivative(Matrix3::zeros(), *axis),
                Trf3::zero(),
                Trf3::zero(),
            ],
            Stage::TrackFrame(track) => track_of(tracks, *track).frame_partials(q),
        }
    }
}

/// One generalized coordinate of a joint.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct JointCoord {
    /// Current value.
    pub value: f64,
    /// First time derivative.
    pub speed: f64,
    /// Second time derivative.
    pub accel: f64,
    /// Third time derivative.
    pub jerk: f64,
    fixed: bool,
    angular: bool,
    var_idx: Option<usize>,
}

impl JointCoord {
    /// Whether the coordinate is driven externally instead of solved for.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Whether the coordinate is an angle (in radians).
    pub fn is_angular(&self) -> bool {
        self.angular
    }

    /// Index in the topology's variable vector, if the coordinate is free and built.
    pub fn var_idx(&self) -> Option<usize> {
        self.var_idx
    }

    fn rates(&self) -> [f64; 3] {
        [self.speed, self.accel, self.jerk]
    }
}

/// A joint: a [`JointKind`] with the state of its coordinates.
///
/// Coordinate indices passed to the accessors are local (`0..var_count()`). An index
/// outside that range is a programming error and panics.
#[derive(Clone, Debug, PartialEq)]
pub struct Joint {
    kind: JointKind,
    coords: Vec<JointCoord>,
}

impl Joint {
    /// A joint of the given kind with every coordinate at zero and free.
    pub fn new(kind: JointKind) -> Self {
        let mut joint = Self {
            kind,
            coords: vec![JointCoord::default(); kind.coord_count()],
        };
        for (i, c) in joint.coords.iter_mut().enumerate() {
            c.angular = Self::stage_of(&kind, i, 0.0).is_angular();
        }
        joint
    }

    /// A revolute joint.
    pub fn revolute() -> Self {
        Self::new(JointKind::Revolute)
    }

    /// A slide joint.
    pub fn slide() -> Self {
        Self::new(JointKind::Slide)
    }

    /// A wheel on `track` with the given wheel radius.
    pub fn track(track: TrackHandle, wheel_rad: f64) -> Self {
        Self::new(JointKind::Track { track, wheel_rad })
    }

    /// The joint variant.
    pub fn kind(&self) -> &JointKind {
        &self.kind
    }

    /// Total number of coordinates.
    pub fn var_count(&self) -> usize {
        self.coords.len()
    }

    /// Number of coordinates whose fixed flag equals `fixed`.
    pub fn var_count_fixed(&self, fixed: bool) -> usize {
        self.coords.iter().filter(|c| c.fixed == fixed).count()
    }

    /// All coordinates.
    pub fn coords(&self) -> &[JointCoord] {
        &self.coords
    }

    /// The `local`-th coordinate.
    pub fn coord(&self, local: usize) -> &JointCoord {
        self.check(local);
        &self.coords[local]
    }

    /// Value of the `local`-th coordinate.
    pub fn value(&self, local: usize) -> f64 {
        self.coord(local).value
    }

    /// Speed of the `local`-th coordinate.
    pub fn speed(&self, local: usize) -> f64 {
        self.coord(local).speed
    }

    /// Acceleration of the `local`-th coordinate.
    pub fn accel(&self, local: usize) -> f64 {
        self.coord(local).accel
    }

    /// Jerk of the `local`-th coordinate.
    pub fn jerk(&self, local: usize) -> f64 {
        self.coord(local).jerk
    }

    /// Sets the value of the `local`-th coordinate.
    pub fn set_value(&mut self, local: usize, value: f64) {
        self.check(local);
        self.coords[local].value = value;
    }

    /// Sets the speed of the `local`-th coordinate.
    pub fn set_speed(&mut self, local: usize, speed: f64) {
        self.check(local);
        self.coords[local].speed = speed;
    }

    /// Sets the acceleration of the `local`-th coordinate.
    pub fn set_accel(&mut self, local: usize, accel: f64) {
        self.check(local);
        self.coords[local].accel = accel;
    }

    /// Sets the jerk of the `local`-th coordinate.
    pub fn set_jerk(&mut self, local: usize, jerk: f64) {
        self.check(local);
        self.coords[local].jerk = jerk;
    }

    /// Whether the `local`-th coordinate is fixed.
    pub fn is_fixed(&self, local: usize) -> bool {
        self.coord(local).fixed
    }

    /// Whether the `local`-th coordinate is an angle.
    pub fn is_angular(&self, local: usize) -> bool {
        self.coord(local).angular
    }

    /// Global variable index of the `local`-th coordinate.
    pub fn var_idx(&self, local: usize) -> Option<usize> {
        self.coord(local).var_idx
    }

    /// Changes a fixed flag. Returns `true` if it changed.
    ///
    /// This alters the variable layout, so only the model may call it.
    pub(crate) fn set_fixed(&mut self, local: usize, fixed: bool) -> bool {
        self.check(local);
        let changed = self.coords[local].fixed != fixed;
        self.coords[local].fixed = fixed;
        changed
    }

    pub(crate) fn clear_var_indices(&mut self) {
        for c in &mut self.coords {
            c.var_idx = None;
        }
    }

    pub(crate) fn set_var_idx(&mut self, local: usize, idx: usize) {
        self.coords[local].var_idx = Some(idx);
    }

    /// Wheel radius of a track joint.
    pub fn wheel_rad(&self) -> Option<f64> {
        match self.kind {
            JointKind::Track { wheel_rad, .. } => Some(wheel_rad),
            _ => None,
        }
    }

    /// Changes the wheel radius of a track joint without touching `s`.
    ///
    /// Returns `false` for other joint kinds.
    pub fn set_wheel_rad(&mut self, rad: f64) -> bool {
        match &mut self.kind {
            JointKind::Track { wheel_rad, .. } => {
                *wheel_rad = rad;
                true
            }
            _ => false,
        }
    }

    fn check(&self, local: usize) {
        assert!(
            local < self.coords.len(),
            "coordinate {local} out of range for a {} joint ({} coordinates)",
            self.kind.name(),
            self.coords.len()
        );
    }

    fn stage_of(kind: &JointKind, local: usize, pipe_radius: f64) -> Stage {
        let z_slide = Stage::Slide {
            axis: Vector3::z(),
            offset: Vector3::zeros(),
        };
        let rz = Stage::Rot(Vector3::z_axis());
        let ry = Stage::Rot(Vector3::y_axis());
        let rx = Stage::Rot(Vector3::x_axis());
        match (kind, local) {
            (JointKind::Revolute, _) => rz,
            (JointKind::Slide, _) => z_slide,
            (JointKind::RevoluteSlide, 0) => rz,
            (JointKind::RevoluteSlide, _) => z_slide,
            (JointKind::Cross, 0) => rz,
            (JointKind::Cross, _) => ry,
            (JointKind::Ball | JointKind::BallSlide, 0) => rz,
            (JointKind::Ball | JointKind::BallSlide, 1) => ry,
            (JointKind::Ball | JointKind::BallSlide, 2) => rx,
            (JointKind::Ball | JointKind::BallSlide, _) => z_slide,
            (JointKind::Ball2Slide, 1) => rz,
            (JointKind::Ball2Slide, 2) => ry,
            (JointKind::Ball2Slide, 3) => rx,
            (JointKind::Ball2Slide, _) => z_slide,
            (JointKind::Track { track, .. }, 0) => Stage::TrackFrame(*track),
            (JointKind::Track { .. }, 1) => ry,
            (JointKind::Track { .. }, 2) => rx,
            (JointKind::Track { wheel_rad, .. }, _) => Stage::Slide {
                axis: Vector3::z(),
                offset: Vector3::x() * (wheel_rad + pipe_radius),
            },
        }
    }

    fn stage_partials(&self, tracks: &[ArcLinTrack]) -> Vec<[Trf3; 4]> {
        let pipe_radius = match self.kind {
            JointKind::Track { track, .. } => track_of(tracks, track).pipe_radius(),
            _ => 0.0,
        };
        self.coords
            .iter()
            .enumerate()
            .map(|(i, c)| Self::stage_of(&self.kind, i, pipe_radius).partials(c.value, tracks))
            .collect()
    }

    /// Relative pose produced by the current coordinate values.
    ///
    /// # Panics
    /// Panics if a track joint's handle does not index into `tracks`.
    pub fn pos(&self, tracks: &[ArcLinTrack]) -> Trf3 {
        self.stage_partials(tracks)
            .iter()
            .fold(Trf3::identity(), |acc, p| acc * p[0])
    }

    /// Inverse of [`Self::pos`].
    pub fn inv_pos(&self, tracks: &[ArcLinTrack]) -> Trf3 {
        self.pos(tracks).inverse_rigid()
    }

    /// The pose and every partial derivative `∂pos/∂q_i`, in coordinate order.
    pub fn partials(&self, tracks: &[ArcLinTrack]) -> (Trf3, Vec<Trf3>) {
        let stages = self.stage_partials(tracks);
        let n = stages.len();
        let mut prefix = Vec::with_capacity(n + 1);
        prefix.push(Trf3::identity());
        for p in &stages {
            let last = prefix[prefix.len() - 1];
            prefix.push(last * p[0]);
        }
        let mut suffix = vec![Trf3::identity(); n + 1];
        for i in (0..n).rev() {
            suffix[i] = stages[i][0] * suffix[i + 1];
        }
        let derivs = (0..n)
            .map(|i| prefix[i] * stages[i][1] * suffix[i + 1])
            .collect();
        (prefix[n], derivs)
    }

    /// The relative pose with its speed, acceleration and jerk, from the coordinate rates.
    pub fn jet(&self, tracks: &[ArcLinTrack]) -> TrfJet {
        self.stage_partials(tracks)
            .iter()
            .zip(&self.coords)
            .fold(TrfJet::default(), |acc, (p, c)| {
                acc * TrfJet::from_partials(p, c.rates())
            })
    }

    /// Inverse of [`Self::jet`].
    pub fn inv_jet(&self, tracks: &[ArcLinTrack]) -> TrfJet {
        self.jet(tracks).inverse_rigid()
    }

    /// Back-solves the coordinates from a relative pose `target`.
    ///
    /// Only free coordinates change unless `fixed_also` is set. Components of `target`
    /// the joint cannot produce are ignored; translations of a two-slide joint are split
    /// in the least-squares sense.
    pub fn init_vars_from_pos(&mut self, target: &Trf3, fixed_also: bool, tracks: &[ArcLinTrack]) {
        let r = &target.rot;
        let t = &target.trans;
        let euler = || Rotation3::from_matrix_unchecked(*r).euler_angles();
        let values: Vec<f64> = match self.kind {
            JointKind::Revolute => vec![r[(1, 0)].atan2(r[(0, 0)])],
            JointKind::Slide => vec![t.z],
            JointKind::RevoluteSlide => vec![r[(1, 0)].atan2(r[(0, 0)]), t.z],
            JointKind::Cross => vec![(-r[(0, 1)]).atan2(r[(1, 1)]), (-r[(2, 0)]).atan2(r[(2, 2)])],
            JointKind::Ball => {
                let (roll, pitch, yaw) = euler();
                vec![yaw, pitch, roll]
            }
            JointKind::BallSlide => {
                let (roll, pitch, yaw) = euler();
                vec![yaw, pitch, roll, r.tr_mul(t).z]
            }
            JointKind::Ball2Slide => {
                let (roll, pitch, yaw) = euler();
                let w = r.column(2).into_owned();
                let c = w.z;
                let det = 1.0 - c * c;
                let (s1, s2) = if det < 1.0e-12 {
                    (t.z, 0.0)
                } else {
                    let wt = w.dot(t);
                    ((t.z - c * wt) / det, (wt - c * t.z) / det)
                };
                vec![s1, yaw, pitch, roll, s2]
            }
            JointKind::Track { track, .. } => {
                let rail = track_of(tracks, track);
                let (s, _) = rail.find_point(&Vec3::from(*t));
                let local = rail.frame(s).inverse_rigid() * *target;
                let m = &local.rot;
                let camber = (-m[(2, 0)]).atan2(m[(0, 0)]);
                let misalign = (-m[(1, 2)]).atan2(m[(1, 1)]);
                vec![s, camber, misalign, m.tr_mul(&local.trans).z]
            }
        };
        for (c, v) in self.coords.iter_mut().zip(values) {
            if fixed_also || !c.fixed {
                c.value = v;
            }
        }
    }
}

/// Coordinate access to a joint owned by a [`Model`](crate::kinematics::Model).
///
/// Values and rates can be written; the joint kind, its coordinate count and its
/// fixed flags cannot, since those are part of the built topology. Reads go through
/// [`Deref`] to the [`Joint`].
///
/// ```compile_fail
/// use kinema3d::kinematics::{BodyDesc, GripDesc, Joint, JointKind, Model};
///
/// let mut model = Model::new();
/// let a = model.add_body(BodyDesc::ground("ground")).unwrap();
/// let b = model.add_body(BodyDesc::new("arm")).unwrap();
/// let g = model.add_grip(GripDesc::new("hinge", a, b).joint(Joint::revolute())).unwrap();
/// *model.joint_mut(g).unwrap() = Joint::new(JointKind::Ball);
/// ```
#[derive(Debug)]
pub struct JointCoordsMut<'a> {
    joint: &'a mut Joint,
}

impl<'a> JointCoordsMut<'a> {
    pub(crate) fn new(joint: &'a mut Joint) -> Self {
        Self { joint }
    }

    /// See [`Joint::set_value`].
    pub fn set_value(&mut self, local: usize, value: f64) {
        self.joint.set_value(local, value);
    }

    /// See [`Joint::set_speed`].
    pub fn set_speed(&mut self, local: usize, speed: f64) {
        self.joint.set_speed(local, speed);
    }

    /// See [`Joint::set_accel`].
    pub fn set_accel(&mut self, local: usize, accel: f64) {
        self.joint.set_accel(local, accel);
    }

    /// See [`Joint::set_jerk`].
    pub fn set_jerk(&mut self, local: usize, jerk: f64) {
        self.joint.set_jerk(local, jerk);
    }

    /// See [`Joint::set_wheel_rad`].
    pub fn set_wheel_rad(&mut self, rad: f64) -> bool {
        self.joint.set_wheel_rad(rad)
    }
}

impl Deref for JointCoordsMut<'_> {
    type Target = Joint;

    fn deref(&self) -> &Joint {
        self.joint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const KINDS: [JointKind; 7] = [
        JointKind::Revolute,
        JointKind::Slide,
        JointKind::RevoluteSlide,
        JointKind::Cross,
        JointKind::Ball,
        JointKind::BallSlide,
        JointKind::Ball2Slide,
    ];

    fn sample(kind: JointKind) -> Joint {
        let mut joint = Joint::new(kind);
        for i in 0..joint.var_count() {
            joint.set_value(i, 0.3 + 0.17 * i as f64);
            joint.set_speed(i, 0.5 - 0.2 * i as f64);
            joint.set_accel(i, -0.4 + 0.1 * i as f64);
            joint.set_jerk(i, 0.25);
        }
        joint
    }

    fn rail() -> Vec<ArcLinTrack> {
        let pts: Vec<Vec3> = (0..12)
            .map(|i| {
                let a = i as f64 * std::f64::consts::TAU / 12.0;
                Vec3::new(5.0 * a.cos(), 5.0 * a.sin(), 0.3 * a.sin())
            })
            .collect();
        vec![ArcLinTrack::from_points(&pts, true, 0.2).unwrap()]
    }

    #[test]
    fn coordinate_counts_and_kinds() {
        assert_eq!(Joint::revolute().var_count(), 1);
        assert_eq!(Joint::new(JointKind::Ball2Slide).var_count(), 5);
        let track = Joint::track(TrackHandle(0), 0.4);
        assert_eq!(track.var_count(), 4);
        assert!(!track.is_angular(0));
        assert!(track.is_angular(1) && track.is_angular(2));
        assert!(!track.is_angular(3));
        assert_eq!(track.wheel_rad(), Some(0.4));
        assert_eq!(Joint::revolute().wheel_rad(), None);
    }

    #[test]
    fn partials_match_finite_differences() {
        let tracks = rail();
        let kinds = KINDS
            .iter()
            .copied()
            .chain([JointKind::Track {
                track: TrackHandle(0),
                wheel_rad: 0.4,
            }]);
        for kind in kinds {
            let joint = sample(kind);
            let (pos, derivs) = joint.partials(&tracks);
            assert!(pos.relative_eq(&joint.pos(&tracks), 1.0e-12));
            for (i, d) in derivs.iter().enumerate() {
                let h = 1.0e-6;
                let mut plus = joint.clone();
                plus.set_value(i, joint.value(i) + h);
                let mut minus = joint.clone();
                minus.set_value(i, joint.value(i) - h);
                let (p, m) = (plus.pos(&tracks), minus.pos(&tracks));
                assert!(d.is_derivative);
                assert_relative_eq!(d.rot, (p.rot - m.rot) / (2.0 * h), epsilon = 1.0e-6);
                assert_relative_eq!(d.trans, (p.trans - m.trans) / (2.0 * h), epsilon = 1.0e-6);
            }
        }
    }

    #[test]
    fn speed_is_the_chain_rule() {
        let tracks = rail();
        for kind in KINDS {
            let joint = sample(kind);
            let (_, derivs) = joint.partials(&tracks);
            let expected = derivs
                .iter()
                .zip(joint.coords())
                .fold(Trf3::zero(), |acc, (d, c)| acc + *d * c.speed);
            assert!(joint.jet(&tracks).speed.relative_eq(&expected, 1.0e-12));
        }
    }

    #[test]
    fn init_vars_recovers_coordinates() {
        let tracks = rail();
        for kind in KINDS {
            let joint = sample(kind);
            let target = joint.pos(&tracks);
            let mut fresh = Joint::new(kind);
            fresh.init_vars_from_pos(&target, false, &tracks);
            assert!(
                fresh.pos(&tracks).relative_eq(&target, 1.0e-9),
                "{} joint did not round-trip",
                kind.name()
            );
        }

        let wheel = JointKind::Track {
            track: TrackHandle(0),
            wheel_rad: 0.4,
        };
        let mut joint = Joint::new(wheel);
        joint.set_value(0, 7.5);
        joint.set_value(1, 0.05);
        joint.set_value(2, -0.03);
        let target = joint.pos(&tracks);
        let mut fresh = Joint::new(wheel);
        fresh.init_vars_from_pos(&target, false, &tracks);
        assert_relative_eq!(fresh.value(0), 7.5, epsilon = 1.0e-3);
        assert!(fresh.pos(&tracks).relative_eq(&target, 1.0e-3));
    }

    #[test]
    fn fixed_coordinates_are_kept() {
        let tracks = rail();
        let mut joint = Joint::new(JointKind::RevoluteSlide);
        joint.set_fixed(1, true);
        joint.set_value(1, 2.0);
        let target = Trf3::from_translation(Vector3::new(0.0, 0.0, 5.0)) * Trf3::rot_z(0.3);
        joint.init_vars_from_pos(&target, false, &tracks);
        assert_relative_eq!(joint.value(0), 0.3, epsilon = 1.0e-12);
        assert_eq!(joint.value(1), 2.0);
        joint.init_vars_from_pos(&target, true, &tracks);
        assert_relative_eq!(joint.value(1), 5.0, epsilon = 1.0e-12);
        assert_eq!(joint.var_count_fixed(true), 1);
    }

    #[test]
    fn wheel_radius_offsets_along_the_normal() {
        let tracks = rail();
        let mut joint = Joint::track(TrackHandle(0), 0.4);
        joint.set_value(0, 2.0);
        let frame = tracks[0].frame(2.0);
        let centre = joint.pos(&tracks).trans;
        let normal = frame.rot.column(0).into_owned();
        assert_relative_eq!(centre, frame.trans + normal * 0.5, epsilon = 1.0e-12);
        assert!(joint.set_wheel_rad(0.6));
        assert_eq!(joint.value(0), 2.0);
        assert_relative_eq!(
            joint.pos(&tracks).trans,
            frame.trans + normal * 0.7,
            epsilon = 1.0e-12
        );
    }

    #[test]
    #[should_panic(expected = "not in the given track list")]
    fn track_joint_against_foreign_tracks_panics() {
        let joint = Joint::track(TrackHandle(2), 0.1);
        let _ = joint.pos(&rail());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn local_index_out_of_range_panics() {
        Joint::revolute().value(1);
    }
}
