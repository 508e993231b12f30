//! Recording of solved states for replay.

use crate::error::Result;
use crate::kinematics::{GripHandle, Model, TopologyHandle};
use std::collections::HashMap;

/// One captured joint coordinate.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct CoordSnapshot {
    /// Value.
    pub pos: f64,
    /// Speed.
    pub speed: f64,
    /// Acceleration.
    pub accel: f64,
    /// Jerk.
    pub jerk: f64,
}

/// An immutable snapshot of every joint coordinate of a topology.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    index: usize,
    time: f64,
    coords: HashMap<GripHandle, Vec<CoordSnapshot>>,
}

impl State {
    /// Position in the owning sequence.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Time stamp given at capture (the index for [`Sequence::add_current_topo_state`]).
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Whether the joint of `grip` was captured.
    pub fn contains(&self, grip: GripHandle) -> bool {
        self.coords.contains_key(&grip)
    }

    /// Captured coordinates of the joint of `grip`.
    pub fn joint_coords(&self, grip: GripHandle) -> Option<&[CoordSnapshot]> {
        self.coords.get(&grip).map(Vec::as_slice)
    }

    /// A captured coordinate, or `None` if the joint was not part of the topology.
    ///
    /// # Panics
    /// Panics if `local` is not a coordinate of a captured joint.
    pub fn coord(&self, grip: GripHandle, local: usize) -> Option<&CoordSnapshot> {
        self.coords.get(&grip).map(|coords| {
            assert!(
                local < coords.len(),
                "coordinate {local} out of range for a joint with {} coordinates",
                coords.len()
            );
            &coords[local]
        })
    }

    /// Captured value.
    pub fn pos(&self, grip: GripHandle, local: usize) -> Option<f64> {
        self.coord(grip, local).map(|c| c.pos)
    }

    /// Captured speed.
    pub fn speed(&self, grip: GripHandle, local: usize) -> Option<f64> {
        self.coord(grip, local).map(|c| c.speed)
    }

    /// Captured acceleration.
    pub fn accel(&self, grip: GripHandle, local: usize) -> Option<f64> {
        self.coord(grip, local).map(|c| c.accel)
    }

    /// Captured jerk.
    pub fn jerk(&self, grip: GripHandle, local: usize) -> Option<f64> {
        self.coord(grip, local).map(|c| c.jerk)
    }
}

/// An append-only list of [`State`]s of one topology.
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    name: String,
    topology: TopologyHandle,
    states: Vec<State>,
}

impl Sequence {
    /// An empty sequence recording `topology`.
    pub fn new(name: impl Into<String>, topology: TopologyHandle) -> Self {
        Self {
            name: name.into(),
            topology,
            states: vec![],
        }
    }

    /// The sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The recorded topology.
    pub fn topology(&self) -> TopologyHandle {
        self.topology
    }

    /// Number of states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Is this sequence empty?
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// All states, in capture order.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// The `index`-th state.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn state(&self, index: usize) -> &State {
        assert!(
            index < self.states.len(),
            "state index {index} out of range (len {})",
            self.states.len()
        );
        &self.states[index]
    }

    /// Captures the current joint coordinates, stamped with the state index.
    pub fn add_current_topo_state(&mut self, model: &Model) -> Result<usize> {
        let time = self.states.len() as f64;
        self.add_state_at(model, time)
    }

    /// Captures the current joint coordinates, stamped with `time`.
    ///
    /// # Errors
    /// [`KinematicsError::StaleTopology`](crate::KinematicsError::StaleTopology) if the
    /// model changed since the topology was built.
    pub fn add_state_at(&mut self, model: &Model, time: f64) -> Result<usize> {
        let topo = model.topology(self.topology)?;
        let mut coords = HashMap::new();
        for grip in topo.grips() {
            if let Some(joint) = model.grip(grip)?.joint() {
                let snapshot = joint
                    .coords()
                    .iter()
                    .map(|c| CoordSnapshot {
                        pos: c.value,
                        speed: c.speed,
                        accel: c.accel,
                        jerk: c.jerk,
                    })
                    .collect();
                coords.insert(grip, snapshot);
            }
        }
        let index = self.states.len();
        self.states.push(State {
            index,
            time,
            coords,
        });
        Ok(index)
    }
}

impl Model {
    /// Restores the joint coordinates captured in a state and re-places the bodies.
    ///
    /// # Panics
    /// Panics if `index` is not a state of `sequence`.
    pub fn apply_state(&mut self, sequence: &Sequence, index: usize) -> Result<()> {
        let state = sequence.state(index);
        self.topology(sequence.topology())?;
        for (grip, coords) in &state.coords {
            let mut joint = self.joint_mut(*grip)?;
            for (local, c) in coords.iter().enumerate() {
                joint.set_value(local, c.pos);
                joint.set_speed(local, c.speed);
                joint.set_accel(local, c.accel);
                joint.set_jerk(local, c.jerk);
            }
        }
        self.update_positions(sequence.topology())
    }
}
