//! Bodies connected by grips and joints, and the loop-closure solver.

pub use body::{Body, BodyDesc};
pub use grip::{Grip, GripDesc, GripRole};
pub use joint::{Joint, JointCoord, JointCoordsMut, JointKind};
pub use model::{BodyHandle, GripHandle, Model, ProbeHandle, TopologyHandle, TrackHandle};
pub use probe::Probe;
pub use sequence::{CoordSnapshot, Sequence, State};
pub use solver::{SolveReport, SolverParams};
pub use topology::{ClosureLoop, LoopStep, Topology, TopologyState, VarRef};

/// Rigid bodies and their derived tree links.
pub mod body;
/// Grips: offsets between two bodies, optionally through a joint.
pub mod grip;
/// The joint variants and their coordinates.
pub mod joint;
/// The arena owning every object of a mechanism.
pub mod model;
/// Measurement frames attached to bodies.
pub mod probe;
/// Recording and replay of solved states.
pub mod sequence;
/// Position, speed, acceleration and jerk solves.
pub mod solver;
/// Spanning tree, loops and variable numbering.
pub mod topology;
