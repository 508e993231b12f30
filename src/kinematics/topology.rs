//! Spanning tree, closure loops and variable numbering of a model.

use crate::error::{KinematicsError, Result};
use crate::kinematics::{
    BodyHandle, GripHandle, GripRole, Joint, JointKind, Model, SolverParams, TopologyHandle,
};
use std::collections::{BTreeSet, VecDeque};

/// A free joint coordinate, addressed by grip and local coordinate index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarRef {
    /// The grip carrying the joint.
    pub grip: GripHandle,
    /// Coordinate index within the joint.
    pub local: usize,
}

/// One step of a closure loop: crossing `grip` starting from body `from`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoopStep {
    /// The crossed grip.
    pub grip: GripHandle,
    /// The body the step leaves from.
    pub from: BodyHandle,
}

/// A closed walk through the body graph.
///
/// The walk starts at `body1` of the closing grip, crosses it, then returns through
/// the spanning tree. The product of the step transforms is the identity exactly
/// when the loop is closed.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosureLoop {
    pub(crate) closing: GripHandle,
    pub(crate) steps: Vec<LoopStep>,
}

impl ClosureLoop {
    /// The loop-closing grip.
    pub fn closing_grip(&self) -> GripHandle {
        self.closing
    }

    /// The steps, starting with the closing grip.
    pub fn steps(&self) -> &[LoopStep] {
        &self.steps
    }
}

/// Build state of a model's topologies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TopologyState {
    /// No successful build yet, or the last one failed.
    Unbuilt,
    /// The topologies match the model.
    Built,
    /// The model changed structurally since the last build.
    Stale,
}

/// One connected component: its spanning tree, closure loops and free variables.
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    pub(crate) root: BodyHandle,
    pub(crate) bodies: Vec<BodyHandle>,
    pub(crate) tree_grips: Vec<GripHandle>,
    pub(crate) loops: Vec<ClosureLoop>,
    pub(crate) vars: Vec<VarRef>,
    pub(crate) loop_vars: Vec<usize>,
}

impl Topology {
    /// The root body. Its pose is an input; every other body is placed from it.
    pub fn root(&self) -> BodyHandle {
        self.root
    }

    /// Bodies in breadth-first order, root first.
    pub fn bodies(&self) -> &[BodyHandle] {
        &self.bodies
    }

    /// Tree grips; `tree_grips()[i]` places `bodies()[i + 1]`.
    pub fn tree_grips(&self) -> &[GripHandle] {
        &self.tree_grips
    }

    /// Loop-closing grips.
    pub fn loop_grips(&self) -> impl Iterator<Item = GripHandle> + '_ {
        self.loops.iter().map(|l| l.closing)
    }

    /// Every grip of the component: tree grips, then loop grips.
    pub fn grips(&self) -> impl Iterator<Item = GripHandle> + '_ {
        self.tree_grips.iter().copied().chain(self.loop_grips())
    }

    /// The closure loops.
    pub fn loops(&self) -> &[ClosureLoop] {
        &self.loops
    }

    /// Number of closure loops.
    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    /// Number of scalar loop equations (six per loop).
    pub fn residual_count(&self) -> usize {
        6 * self.loops.len()
    }

    /// Number of free coordinates, the length of the solver's variable vector.
    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Free coordinates in variable-index order.
    pub fn vars(&self) -> &[VarRef] {
        &self.vars
    }

    /// Variable indices of the free coordinates that act on at least one loop.
    pub fn loop_vars(&self) -> &[usize] {
        &self.loop_vars
    }

    /// Variable index of a coordinate, if it is free and part of this topology.
    pub fn var_index(&self, grip: GripHandle, local: usize) -> Option<usize> {
        self.vars
            .iter()
            .position(|v| v.grip == grip && v.local == local)
    }
}

impl Model {
    /// Build state of the topologies.
    pub fn topology_state(&self) -> TopologyState {
        match self.built_epoch {
            None => TopologyState::Unbuilt,
            Some(epoch) if epoch == self.epoch => TopologyState::Built,
            Some(_) => TopologyState::Stale,
        }
    }

    /// Splits the model into connected components and prepares each for solving.
    ///
    /// Per component, a breadth-first walk from the root (the first ground body, else
    /// the body with the lowest handle) classifies every grip as a tree edge or a loop
    /// edge. Free coordinates are then numbered: tree grips in walk order first, then
    /// loop grips. Finally, body poses are propagated from each root.
    ///
    /// The previous topologies are discarded, even if the build fails.
    ///
    /// # Errors
    /// [`KinematicsError::OverConstrained`] if a component has fewer free loop
    /// coordinates than the numerical rank of its loop equations, or contains a loop of
    /// rigid grips that does not close. [`KinematicsError::InvalidHandle`] if a track
    /// joint refers to a missing track.
    pub fn build_topology(&mut self) -> Result<Vec<TopologyHandle>> {
        self.reset_derived();
        for (_, grip) in self.grips_iter() {
            if let Some(JointKind::Track { track, .. }) = grip.joint().map(Joint::kind) {
                self.track(*track)?;
            }
        }

        let mut roots: Vec<BodyHandle> = self
            .bodies_iter()
            .filter(|(_, b)| b.is_ground)
            .map(|(h, _)| h)
            .collect();
        roots.extend(self.bodies_iter().filter(|(_, b)| !b.is_ground).map(|(h, _)| h));

        let mut visited = vec![false; self.bodies.len()];
        let mut topologies = vec![];
        for root in roots {
            if !visited[root.0] {
                let mut topo = self.span_component(root, &mut visited)?;
                self.close_loops(&mut topo)?;
                self.number_vars(&mut topo)?;
                topologies.push(topo);
            }
        }

        let params = SolverParams::default();
        for topo in &topologies {
            if let Err(err) = self.check_constraints(topo, &params) {
                log::warn!("{err}");
                self.reset_derived();
                return Err(err);
            }
        }

        self.topologies = topologies;
        self.built_epoch = Some(self.epoch);
        let handles = self.topology_handles();
        for (handle, topo) in handles.iter().zip(&self.topologies) {
            log::debug!(
                "topology {}: root `{}`, {} bodies, {} loops, {} free coordinates",
                handle.index,
                self.body(topo.root)?.name,
                topo.bodies.len(),
                topo.loops.len(),
                topo.vars.len()
            );
        }
        for handle in &handles {
            self.update_positions(*handle)?;
        }
        Ok(handles)
    }

    fn span_component(&mut self, root: BodyHandle, visited: &mut [bool]) -> Result<Topology> {
        visited[root.0] = true;
        self.body_mut(root)?.level = Some(0);
        let mut topo = Topology {
            root,
            bodies: vec![root],
            tree_grips: vec![],
            loops: vec![],
            vars: vec![],
            loop_vars: vec![],
        };

        let mut queue = VecDeque::from([root]);
        while let Some(body) = queue.pop_front() {
            let level = self.body(body)?.level.unwrap_or(0);
            let grips = self.body(body)?.grips.clone();
            for handle in grips {
                let grip = self.grip(handle)?;
                if grip.role != GripRole::Unclassified {
                    continue;
                }
                let other = grip.other_body(body).unwrap_or(body);
                let parent_rel = grip.body1 == body;
                if visited[other.0] {
                    self.grip_mut(handle)?.role = GripRole::Loop;
                    topo.loops.push(ClosureLoop {
                        closing: handle,
                        steps: vec![],
                    });
                } else {
                    visited[other.0] = true;
                    let grip = self.grip_mut(handle)?;
                    grip.role = GripRole::Tree;
                    grip.parent_rel = parent_rel;
                    let child = self.body_mut(other)?;
                    child.parent = Some(handle);
                    child.level = Some(level + 1);
                    topo.bodies.push(other);
                    topo.tree_grips.push(handle);
                    queue.push_back(other);
                }
            }
        }
        Ok(topo)
    }

    /// Tree walk from `from` to `to`: up to the common ancestor, then down.
    fn tree_path(&self, from: BodyHandle, to: BodyHandle) -> Result<Vec<LoopStep>> {
        let mut up = vec![];
        let mut down = vec![];
        let (mut x, mut y) = (from, to);
        while x != y {
            let (bx, by) = (self.body(x)?, self.body(y)?);
            if bx.level >= by.level {
                let grip = bx.parent.ok_or(KinematicsError::InvalidHandle {
                    kind: "body",
                    index: x.0,
                })?;
                up.push(LoopStep { grip, from: x });
                x = self.grip(grip)?.other_body(x).unwrap_or(x);
            } else {
                let grip = by.parent.ok_or(KinematicsError::InvalidHandle {
                    kind: "body",
                    index: y.0,
                })?;
                let parent = self.grip(grip)?.other_body(y).unwrap_or(y);
                down.push(LoopStep { grip, from: parent });
                y = parent;
            }
        }
        up.extend(down.into_iter().rev());
        Ok(up)
    }

    fn close_loops(&mut self, topo: &mut Topology) -> Result<()> {
        for lp in &mut topo.loops {
            let closing = self.grip(lp.closing)?;
            let (start, end) = (closing.body1, closing.body2);
            lp.steps = vec![LoopStep {
                grip: lp.closing,
                from: start,
            }];
            lp.steps.extend(self.tree_path(end, start)?);
            for step in &lp.steps {
                self.grip_mut(step.grip)?.loop_count += 1;
            }
        }
        Ok(())
    }

    fn number_vars(&mut self, topo: &mut Topology) -> Result<()> {
        let grips: Vec<GripHandle> = topo.grips().collect();
        for grip in grips {
            if let Some(joint) = self.grip_mut(grip)?.joint.as_mut() {
                for local in 0..joint.var_count() {
                    if !joint.is_fixed(local) {
                        joint.set_var_idx(local, topo.vars.len());
                        topo.vars.push(VarRef { grip, local });
                    }
                }
            }
        }

        let in_loops: BTreeSet<GripHandle> = topo
            .loops
            .iter()
            .flat_map(|l| l.steps.iter().map(|s| s.grip))
            .collect();
        topo.loop_vars = topo
            .vars
            .iter()
            .enumerate()
            .filter(|(_, v)| in_loops.contains(&v.grip))
            .map(|(i, _)| i)
            .collect();
        Ok(())
    }

    /// Compares the free loop coordinates against the rank of the loop equations
    /// with respect to all loop coordinates, fixed ones included.
    ///
    /// A loop of rigid grips has no coordinates at all; it is accepted only if it
    /// already closes.
    fn check_constraints(&self, topo: &Topology, params: &SolverParams) -> Result<()> {
        if topo.loops.is_empty() {
            return Ok(());
        }
        let (res, _) = self.loop_system(topo, 0, |_, _| None)?;
        for (l, lp) in topo.loops.iter().enumerate() {
            let rigid = lp
                .steps
                .iter()
                .map(|step| self.grip(step.grip).map(|g| g.joint().is_none()))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .all(|r| r);
            if !rigid {
                continue;
            }
            let open = (0..6)
                .filter(|&i| {
                    let tol = if i < 3 { params.rot_tol } else { params.pos_tol };
                    res[6 * l + i].abs() >= tol
                })
                .count();
            if open > 0 {
                return Err(KinematicsError::OverConstrained {
                    root: self.body(topo.root)?.name.clone(),
                    free: 0,
                    constraints: open,
                });
            }
        }

        let in_loops: BTreeSet<GripHandle> = topo
            .loops
            .iter()
            .flat_map(|l| l.steps.iter().map(|s| s.grip))
            .collect();
        let mut columns = vec![];
        for grip in in_loops {
            if let Some(joint) = self.grip(grip)?.joint() {
                columns.extend((0..joint.var_count()).map(|local| VarRef { grip, local }));
            }
        }
        if columns.is_empty() {
            return Ok(());
        }
        let (_, jac) = self.loop_system(topo, columns.len(), |var, _| {
            columns.iter().position(|c| *c == var)
        })?;
        let svd = jac.svd(false, false);
        let eps = (params.rank_tol * svd.singular_values.max()).max(f64::EPSILON);
        let constraints = svd.rank(eps);
        let free = topo.loop_vars.len();
        if free < constraints {
            return Err(KinematicsError::OverConstrained {
                root: self.body(topo.root)?.name.clone(),
                free,
                constraints,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{BodyDesc, GripDesc, Joint};

    fn chain(model: &mut Model, n: usize) -> Vec<BodyHandle> {
        (0..n)
            .map(|i| {
                let desc = if i == 0 {
                    BodyDesc::ground("b0")
                } else {
                    BodyDesc::new(format!("b{i}"))
                };
                model.add_body(desc).unwrap()
            })
            .collect()
    }

    #[test]
    fn tree_levels_and_parents() {
        let mut model = Model::new();
        let b = chain(&mut model, 3);
        let g0 = model.add_grip(GripDesc::new("g0", b[0], b[1]).joint(Joint::revolute())).unwrap();
        // Reversed direction: body2 is the parent.
        let g1 = model.add_grip(GripDesc::new("g1", b[2], b[1]).joint(Joint::slide())).unwrap();
        let handles = model.build_topology().unwrap();
        assert_eq!(handles.len(), 1);
        let topo = model.topology(handles[0]).unwrap();
        assert_eq!(topo.root(), b[0]);
        assert_eq!(topo.bodies(), &b[..]);
        assert_eq!(topo.loop_count(), 0);
        assert_eq!(topo.var_count(), 2);
        assert_eq!(model.body(b[2]).unwrap().level(), Some(2));
        assert_eq!(model.body(b[2]).unwrap().parent_grip(), Some(g1));
        assert!(model.grip(g0).unwrap().is_parent_rel());
        assert!(!model.grip(g1).unwrap().is_parent_rel());
        assert_eq!(model.joint(g1).unwrap().var_idx(0), Some(1));
    }

    #[test]
    fn disjoint_components_get_their_own_topology() {
        let mut model = Model::new();
        let b = chain(&mut model, 4);
        model.add_grip(GripDesc::new("g0", b[0], b[1]).joint(Joint::revolute())).unwrap();
        model.add_grip(GripDesc::new("g1", b[3], b[2]).joint(Joint::revolute())).unwrap();
        let handles = model.build_topology().unwrap();
        assert_eq!(handles.len(), 2);
        // No ground in the second component: the lowest handle is the root.
        assert_eq!(model.topology(handles[1]).unwrap().root(), b[2]);
        for h in handles {
            assert_eq!(model.topology(h).unwrap().vars()[0].local, 0);
        }
    }

    #[test]
    fn loop_walk_crosses_the_common_ancestor() {
        // A Y-shaped tree closed between the two branch tips.
        let mut model = Model::new();
        let b = chain(&mut model, 4);
        let hinge = || Joint::revolute();
        let g = [
            model.add_grip(GripDesc::new("g0", b[0], b[1]).joint(hinge())).unwrap(),
            model.add_grip(GripDesc::new("g1", b[0], b[2]).joint(hinge())).unwrap(),
            model.add_grip(GripDesc::new("g2", b[1], b[3]).joint(hinge())).unwrap(),
            model.add_grip(GripDesc::new("g3", b[3], b[2]).joint(hinge())).unwrap(),
        ];
        let handles = model.build_topology().unwrap();
        let topo = model.topology(handles[0]).unwrap();
        assert_eq!(topo.loop_grips().collect::<Vec<_>>(), vec![g[3]]);
        let steps: Vec<_> = topo.loops()[0].steps().iter().map(|s| (s.grip, s.from)).collect();
        assert_eq!(
            steps,
            vec![(g[3], b[3]), (g[1], b[2]), (g[0], b[0]), (g[2], b[1])]
        );
        assert!(g.iter().all(|h| model.grip(*h).unwrap().loop_count() == 1));
        // Loop grips are numbered last.
        assert_eq!(model.joint(g[3]).unwrap().var_idx(0), Some(3));
        assert_eq!(topo.loop_vars(), &[0, 1, 2, 3]);
    }

    #[test]
    fn state_machine() {
        let mut model = Model::new();
        let b = chain(&mut model, 2);
        assert_eq!(model.topology_state(), TopologyState::Unbuilt);
        let g = model.add_grip(GripDesc::new("g0", b[0], b[1]).joint(Joint::revolute())).unwrap();
        let handles = model.build_topology().unwrap();
        assert_eq!(model.topology_state(), TopologyState::Built);
        model.set_fixed(g, 0, true).unwrap();
        assert_eq!(model.topology_state(), TopologyState::Stale);
        assert!(model.topology(handles[0]).unwrap_err().is_stale());
        assert!(model.topology_handles().is_empty());
    }

    fn double_weld(second: crate::algebra::Trf3) -> (Model, BodyHandle) {
        let mut model = Model::new();
        let bodies = chain(&mut model, 2);
        model
            .add_grip(GripDesc::new("weld_a", bodies[0], bodies[1]))
            .unwrap();
        let desc =
            GripDesc::new("weld_b", bodies[0], bodies[1]).offsets(second, Default::default());
        model.add_grip(desc).unwrap();
        (model, bodies[1])
    }

    #[test]
    fn conflicting_rigid_loop_is_over_constrained() {
        let shift = crate::algebra::Trf3::from_translation(na::Vector3::new(0.0, 0.5, 0.0));
        let (mut model, _) = double_weld(shift);
        let err = model.build_topology().unwrap_err();
        assert!(matches!(
            err,
            KinematicsError::OverConstrained { free: 0, constraints: 1, .. }
        ));
        assert_eq!(model.topology_state(), TopologyState::Unbuilt);
    }

    #[test]
    fn consistent_rigid_loop_is_accepted() {
        let (mut model, body) = double_weld(Default::default());
        let topo = model.build_topology().unwrap()[0];
        assert_eq!(model.topology(topo).unwrap().loop_count(), 1);
        let mut vars = model.var_vec(topo).unwrap();
        let report = model
            .solve_pos(topo, &SolverParams::default(), &mut vars)
            .unwrap();
        assert_eq!(report.iterations, 0);
        assert_eq!(model.body(body).unwrap().level(), Some(1));
    }
}
