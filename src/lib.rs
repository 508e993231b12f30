#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

extern crate nalgebra as na;

/// Tagged vectors, homogeneous transforms and pose jets.
///
/// A single transform type serves for poses and for their time derivatives. The
/// derivative tag decides whether a translation is picked up during composition.
pub mod algebra;
/// Error and result types.
pub mod error;
/// Bodies, grips, joints, topologies and the loop-closure solver.
///
/// The [`Model`](kinematics::Model) owns everything; topologies, sequences and
/// handles refer into it.
pub mod kinematics;
/// Arc/line space curves used as rails by track joints.
pub mod track;

pub use error::{KinematicsError, Result};

/// Mathematical types used throughout the crate.
pub mod math {
    pub use crate::algebra::{Trf3, TrfJet, Vec3};
    pub use na::{DMatrix, DVector, Matrix3, Unit, Vector3};

    /// Dynamically sized vector of free joint coordinates.
    pub type VarVec = na::DVector<f64>;
}
