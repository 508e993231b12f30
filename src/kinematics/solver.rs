//! Loop-closure solver: positions by damped Newton iteration, rates by linear solves.

use crate::algebra::{Trf3, TrfJet};
use crate::error::{KinematicsError, Result};
use crate::kinematics::{Model, Topology, TopologyHandle, VarRef};
use na::{DMatrix, DVector, Matrix3, Vector3};

/// Tuning of [`Model::solve_pos`] and the rate solves.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolverParams {
    /// Newton step cap.
    pub max_iter: usize,
    /// Largest accepted rotation residual component, in radians.
    pub rot_tol: f64,
    /// Largest accepted position residual component.
    pub pos_tol: f64,
    /// Largest change of an angular coordinate in one Newton step, in radians.
    pub max_angular_step: f64,
    /// Singular values below `rank_tol` times the largest one are treated as zero.
    pub rank_tol: f64,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            max_iter: 50,
            rot_tol: 1.0e-6,
            pos_tol: 1.0e-6,
            max_angular_step: 10.0f64.to_radians(),
            rank_tol: 1.0e-9,
        }
    }
}

impl SolverParams {
    /// Sets the iteration cap.
    #[must_use]
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Sets both residual tolerances.
    #[must_use]
    pub fn tolerances(mut self, rot_tol: f64, pos_tol: f64) -> Self {
        self.rot_tol = rot_tol;
        self.pos_tol = pos_tol;
        self
    }

    /// Sets the per-step limit for angular coordinates.
    #[must_use]
    pub fn max_angular_step(mut self, max_angular_step: f64) -> Self {
        self.max_angular_step = max_angular_step;
        self
    }
}

/// Outcome of a converged [`Model::solve_pos`].
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct SolveReport {
    /// Newton steps taken; zero if the loops were already closed.
    pub iterations: usize,
    /// Largest rotation residual component at exit.
    pub max_rot: f64,
    /// Largest position residual component at exit.
    pub max_dist: f64,
}

// Rotation part of a derivative `d` of the rotation `r`, as an angular vector.
fn vex_of(d: &Matrix3<f64>, r: &Matrix3<f64>) -> Vector3<f64> {
    let w = d * r.transpose();
    Vector3::new(
        0.5 * (w[(2, 1)] - w[(1, 2)]),
        0.5 * (w[(0, 2)] - w[(2, 0)]),
        0.5 * (w[(1, 0)] - w[(0, 1)]),
    )
}

fn residual_norms(res: &DVector<f64>) -> (f64, f64) {
    let (mut max_rot, mut max_dist) = (0.0f64, 0.0f64);
    for (i, r) in res.iter().enumerate() {
        if i % 6 < 3 {
            max_rot = max_rot.max(r.abs());
        } else {
            max_dist = max_dist.max(r.abs());
        }
    }
    (max_rot, max_dist)
}

fn least_squares(jac: &DMatrix<f64>, rhs: &DVector<f64>, rank_tol: f64) -> DVector<f64> {
    if jac.is_empty() {
        return DVector::zeros(jac.ncols());
    }
    let svd = jac.clone().svd(true, true);
    let eps = (rank_tol * svd.singular_values.max()).max(f64::EPSILON);
    svd.solve(rhs, eps)
        .unwrap_or_else(|_| DVector::zeros(jac.ncols()))
}

impl Model {
    fn step_partials_of(
        &self,
        topo: &Topology,
        loop_idx: usize,
    ) -> Result<Vec<(Trf3, Vec<(VarRef, bool, Trf3)>)>> {
        topo.loops[loop_idx]
            .steps
            .iter()
            .map(|step| {
                let grip = self.grip(step.grip)?;
                let (pos, derivs) = grip.step_partials(step.from, &self.tracks);
                let derivs = derivs
                    .into_iter()
                    .enumerate()
                    .map(|(local, d)| {
                        let fixed = grip.joint.as_ref().is_some_and(|j| j.is_fixed(local));
                        (VarRef { grip: step.grip, local }, fixed, d)
                    })
                    .collect();
                Ok((pos, derivs))
            })
            .collect()
    }

    /// Loop residuals and their Jacobian.
    ///
    /// Each loop contributes six rows: the rotation vector of the loop product, then
    /// its translation. `column` maps a joint coordinate (and its fixed flag) to a
    /// Jacobian column; coordinates it maps to `None` are left out.
    pub(crate) fn loop_system(
        &self,
        topo: &Topology,
        ncols: usize,
        column: impl Fn(VarRef, bool) -> Option<usize>,
    ) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let nrows = topo.residual_count();
        let mut res = DVector::zeros(nrows);
        let mut jac = DMatrix::zeros(nrows, ncols);

        for l in 0..topo.loops.len() {
            let steps = self.step_partials_of(topo, l)?;
            let n = steps.len();
            let mut suffix = vec![Trf3::identity(); n + 1];
            for k in (0..n).rev() {
                suffix[k] = steps[k].0 * suffix[k + 1];
            }
            let product = suffix[0];
            let row = 6 * l;
            res.fixed_rows_mut::<3>(row).copy_from(&product.scaled_axis());
            res.fixed_rows_mut::<3>(row + 3).copy_from(&product.trans);

            let mut prefix = Trf3::identity();
            for (k, (pos, derivs)) in steps.iter().enumerate() {
                for (var, fixed, d) in derivs {
                    if let Some(col) = column(*var, *fixed) {
                        let dl = prefix * *d * suffix[k + 1];
                        let mut c = jac.fixed_view_mut::<3, 1>(row, col);
                        c += vex_of(&dl.rot, &product.rot);
                        let mut c = jac.fixed_view_mut::<3, 1>(row + 3, col);
                        c += dl.trans;
                    }
                }
                prefix = prefix * *pos;
            }
        }
        Ok((res, jac))
    }

    // Columns of the free coordinates: their variable indices.
    fn free_columns(&self) -> impl Fn(VarRef, bool) -> Option<usize> + '_ {
        move |var, fixed| {
            if fixed {
                return None;
            }
            self.joint(var.grip).ok().and_then(|j| j.var_idx(var.local))
        }
    }

    /// Loop residuals of a topology at the current coordinates, six per loop.
    pub fn loop_residuals(&self, topology: TopologyHandle) -> Result<DVector<f64>> {
        let topo = self.topology(topology)?;
        let (res, _) = self.loop_system(topo, 0, |_, _| None)?;
        Ok(res)
    }

    /// Current values of the free coordinates, in variable-index order.
    pub fn var_vec(&self, topology: TopologyHandle) -> Result<DVector<f64>> {
        let topo = self.topology(topology)?;
        let values = topo
            .vars
            .iter()
            .map(|v| self.joint(v.grip).map(|j| j.value(v.local)))
            .collect::<Result<Vec<_>>>()?;
        Ok(DVector::from_vec(values))
    }

    /// Writes `var_vec` into the free coordinates.
    ///
    /// # Panics
    /// Panics if `var_vec` does not have one entry per free coordinate.
    pub fn set_var_vec(&mut self, topology: TopologyHandle, var_vec: &DVector<f64>) -> Result<()> {
        let vars = self.topology(topology)?.vars.clone();
        assert_eq!(
            var_vec.len(),
            vars.len(),
            "variable vector has {} entries, the topology has {} free coordinates",
            var_vec.len(),
            vars.len()
        );
        for (v, value) in vars.iter().zip(var_vec.iter()) {
            self.joint_mut(v.grip)?.set_value(v.local, *value);
        }
        Ok(())
    }

    /// Places every non-root body of the topology from its tree parent.
    ///
    /// Pose, speed, acceleration and jerk are propagated together from the root jet
    /// and the joint coordinates and rates.
    pub fn update_positions(&mut self, topology: TopologyHandle) -> Result<()> {
        let topo = self.topology(topology)?;
        let placements: Vec<_> = topo
            .tree_grips
            .iter()
            .zip(&topo.bodies[1..])
            .map(|(g, b)| (*g, *b))
            .collect();
        for (grip, child) in placements {
            let g = self.grip(grip)?;
            let parent = g.other_body(child).unwrap_or(child);
            let jet = *self.body(parent)?.jet() * g.step_jet(parent, &self.tracks);
            self.body_mut(child)?.jet = jet;
        }
        Ok(())
    }

    /// Seeds joint coordinates from the current body poses.
    ///
    /// For every grip of the topology, the joint is fitted to the relative pose of its
    /// two bodies. Fixed coordinates are kept unless `fixed_also` is set.
    pub fn init_vars_from_pos(&mut self, topology: TopologyHandle, fixed_also: bool) -> Result<()> {
        let grips: Vec<_> = self.topology(topology)?.grips().collect();
        for handle in grips {
            let grip = self.grip(handle)?;
            if grip.joint.is_none() {
                continue;
            }
            let rel = self.body(grip.body1)?.inv_pos() * *self.body(grip.body2)?.pos();
            let target = grip.offset1.inverse_rigid() * rel * grip.offset2;
            let Model { grips, tracks, .. } = &mut *self;
            if let Some(joint) = grips[handle.0].as_mut().and_then(|g| g.joint.as_mut()) {
                joint.init_vars_from_pos(&target, fixed_also, tracks);
            }
        }
        Ok(())
    }

    /// Closes the loops of a topology by damped Newton iteration.
    ///
    /// `var_vec` holds the initial guess for every free coordinate in variable-index
    /// order (see [`Self::var_vec`]). Fixed coordinates keep their current values. Each
    /// iteration writes `var_vec` into the joints, evaluates the loop residuals and, if
    /// they are not yet within tolerance, takes a least-squares Newton step. Steps of
    /// angular coordinates are capped at [`SolverParams::max_angular_step`].
    ///
    /// On success `var_vec` holds the solution and every body of the topology is
    /// placed. A topology without loops converges in zero iterations.
    ///
    /// # Errors
    /// [`KinematicsError::NotConverged`] after `max_iter` steps; `var_vec` and the joints
    /// then hold the last iterate. [`KinematicsError::StaleTopology`] if the model
    /// changed since the build.
    ///
    /// # Panics
    /// Panics if `var_vec` does not have one entry per free coordinate.
    pub fn solve_pos(
        &mut self,
        topology: TopologyHandle,
        params: &SolverParams,
        var_vec: &mut DVector<f64>,
    ) -> Result<SolveReport> {
        self.set_var_vec(topology, var_vec)?;
        let topo = self.topology(topology)?.clone();
        if topo.loops.is_empty() {
            self.update_positions(topology)?;
            return Ok(SolveReport::default());
        }

        let angular: Vec<bool> = topo
            .vars
            .iter()
            .map(|v| self.joint(v.grip).map(|j| j.is_angular(v.local)))
            .collect::<Result<_>>()?;

        let mut iterations = 0;
        loop {
            let (res, jac) = self.loop_system(&topo, topo.vars.len(), self.free_columns())?;
            let (max_rot, max_dist) = residual_norms(&res);
            log::trace!("iteration {iterations}: rotation {max_rot:e}, position {max_dist:e}");

            if max_rot < params.rot_tol && max_dist < params.pos_tol {
                self.update_positions(topology)?;
                log::debug!("position solve converged in {iterations} iterations");
                return Ok(SolveReport {
                    iterations,
                    max_rot,
                    max_dist,
                });
            }
            if iterations >= params.max_iter {
                self.update_positions(topology)?;
                let err = KinematicsError::NotConverged {
                    iterations,
                    max_rot,
                    max_dist,
                };
                log::warn!("{err}");
                return Err(err);
            }

            let mut step = least_squares(&jac, &(-res), params.rank_tol);
            let largest = step
                .iter()
                .zip(&angular)
                .filter(|(_, a)| **a)
                .fold(0.0f64, |m, (s, _)| m.max(s.abs()));
            if largest > params.max_angular_step {
                let scale = params.max_angular_step / largest;
                log::trace!("angular step {largest:e} scaled by {scale:e}");
                step *= scale;
            }
            *var_vec += step;
            self.set_var_vec(topology, var_vec)?;
            iterations += 1;
        }
    }

    /// Solves the free coordinate speeds from the fixed (driven) ones.
    ///
    /// Requires closed loops: call [`Self::solve_pos`] first. Bodies of the topology
    /// get their speeds from the root jet and the joint rates.
    ///
    /// # Errors
    /// [`KinematicsError::RateMismatch`] if the drive speeds are incompatible with the
    /// loops.
    pub fn solve_speed(&mut self, topology: TopologyHandle, params: &SolverParams) -> Result<()> {
        self.solve_rates(topology, params, 1)
    }

    /// Solves the free coordinate accelerations. Speeds must be solved already.
    pub fn solve_accel(&mut self, topology: TopologyHandle, params: &SolverParams) -> Result<()> {
        self.solve_rates(topology, params, 2)
    }

    /// Solves the free coordinate jerks. Speeds and accelerations must be solved already.
    pub fn solve_jerk(&mut self, topology: TopologyHandle, params: &SolverParams) -> Result<()> {
        self.solve_rates(topology, params, 3)
    }

    fn set_rate(&mut self, var: VarRef, order: usize, value: f64) -> Result<()> {
        let mut joint = self.joint_mut(var.grip)?;
        match order {
            1 => joint.set_speed(var.local, value),
            2 => joint.set_accel(var.local, value),
            _ => joint.set_jerk(var.local, value),
        }
        Ok(())
    }

    fn loop_jet(&self, topo: &Topology, loop_idx: usize) -> Result<TrfJet> {
        topo.loops[loop_idx]
            .steps
            .iter()
            .try_fold(TrfJet::default(), |acc, step| {
                Ok(acc * self.grip(step.grip)?.step_jet(step.from, &self.tracks))
            })
    }

    // The differentiated loop equations are linear in the highest-order rates of the
    // free coordinates; their coefficients are the position Jacobian.
    fn solve_rates(
        &mut self,
        topology: TopologyHandle,
        params: &SolverParams,
        order: usize,
    ) -> Result<()> {
        let topo = self.topology(topology)?.clone();
        let name = ["pos", "speed", "accel", "jerk"][order];
        for &i in &topo.loop_vars {
            self.set_rate(topo.vars[i], order, 0.0)?;
        }
        if topo.loops.is_empty() || topo.loop_vars.is_empty() {
            return self.update_positions(topology);
        }

        let (_, jac) = self.loop_system(&topo, topo.vars.len(), self.free_columns())?;
        let mut rhs = DVector::zeros(topo.residual_count());
        for l in 0..topo.loops.len() {
            let jet = self.loop_jet(&topo, l)?;
            let d = jet.order(order);
            rhs.fixed_rows_mut::<3>(6 * l).copy_from(&vex_of(&d.rot, &jet.pos.rot));
            rhs.fixed_rows_mut::<3>(6 * l + 3).copy_from(&d.trans);
        }
        let rhs = -rhs;
        let rates = least_squares(&jac, &rhs, params.rank_tol);
        let residual = (&jac * &rates - &rhs).amax();
        let bound = params.rot_tol.max(params.pos_tol) * (1.0 + rhs.amax());
        if residual > bound {
            let err = KinematicsError::RateMismatch {
                order: name,
                residual,
            };
            log::warn!("{err}");
            return Err(err);
        }
        for &i in &topo.loop_vars {
            self.set_rate(topo.vars[i], order, rates[i])?;
        }
        log::debug!("{name} solve done, residual {residual:e}");
        self.update_positions(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{BodyDesc, GripDesc, Joint};
    use approx::assert_relative_eq;

    // A slider held by two rigidly coupled slides: the second one must follow the first.
    fn parallel_slides() -> (Model, TopologyHandle, crate::kinematics::GripHandle) {
        let mut model = Model::new();
        let ground = model.add_body(BodyDesc::ground("ground")).unwrap();
        let slider = model.add_body(BodyDesc::new("slider")).unwrap();
        let drive = model
            .add_grip(GripDesc::new("drive", ground, slider).joint(Joint::slide()))
            .unwrap();
        model
            .add_grip(GripDesc::new("guide", ground, slider).joint(Joint::slide()))
            .unwrap();
        model.set_fixed(drive, 0, true).unwrap();
        model.joint_mut(drive).unwrap().set_value(0, 0.75);
        let handles = model.build_topology().unwrap();
        (model, handles[0], drive)
    }

    #[test]
    fn linear_loop_converges_in_one_step() {
        let (mut model, topo, _) = parallel_slides();
        let mut vars = model.var_vec(topo).unwrap();
        assert_eq!(vars.len(), 1);
        let report = model.solve_pos(topo, &SolverParams::default(), &mut vars).unwrap();
        assert_eq!(report.iterations, 1);
        assert_relative_eq!(vars[0], 0.75, epsilon = 1.0e-12);
        assert!(model.loop_residuals(topo).unwrap().amax() < 1.0e-12);
    }

    #[test]
    fn speeds_follow_the_drive() {
        let (mut model, topo, drive) = parallel_slides();
        let params = SolverParams::default();
        let mut vars = model.var_vec(topo).unwrap();
        model.solve_pos(topo, &params, &mut vars).unwrap();
        let mut joint = model.joint_mut(drive).unwrap();
        joint.set_speed(0, 2.0);
        joint.set_accel(0, -1.0);
        model.solve_speed(topo, &params).unwrap();
        model.solve_accel(topo, &params).unwrap();
        model.solve_jerk(topo, &params).unwrap();

        let guide = model.grip_by_name("guide").unwrap();
        let joint = model.joint(guide).unwrap();
        assert_relative_eq!(joint.speed(0), 2.0, epsilon = 1.0e-9);
        assert_relative_eq!(joint.accel(0), -1.0, epsilon = 1.0e-9);
        assert_relative_eq!(joint.jerk(0), 0.0, epsilon = 1.0e-9);
        let slider = model.body_by_name("slider").unwrap();
        assert_relative_eq!(model.body(slider).unwrap().speed().trans.z, 2.0, epsilon = 1.0e-9);
    }

    #[test]
    fn wrong_length_variable_vector_panics() {
        let (mut model, topo, _) = parallel_slides();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut vars = DVector::zeros(3);
            let _ = model.solve_pos(topo, &SolverParams::default(), &mut vars);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn least_squares_without_unknowns_is_empty() {
        let jac = DMatrix::zeros(6, 0);
        let rhs = DVector::from_element(6, 1.0);
        assert_eq!(least_squares(&jac, &rhs, 1.0e-9).len(), 0);
    }

    #[test]
    fn params_builders() {
        let params = SolverParams::default().max_iter(3).tolerances(1.0e-4, 1.0e-5);
        assert_eq!(params.max_iter, 3);
        assert_eq!(params.rot_tol, 1.0e-4);
        assert_eq!(params.pos_tol, 1.0e-5);
        assert_relative_eq!(SolverParams::default().max_angular_step, 10.0f64.to_radians());
    }
}
