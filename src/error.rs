//! Error types of the kinematics engine.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, KinematicsError>;

/// Errors reported by model edits, topology builds, solves and track queries.
///
/// Out-of-range indices (track point index, joint coordinate index, state index)
/// are programming errors and panic instead of producing one of these variants.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum KinematicsError {
    /// An object with the same name already exists in its registry.
    #[error("a {kind} named `{name}` already exists")]
    DuplicateName {
        /// The registry kind (`"body"`, `"grip"`, …).
        kind: &'static str,
        /// The offending name.
        name: String,
    },

    /// No object with that name exists in its registry.
    #[error("no {kind} named `{name}`")]
    UnknownName {
        /// The registry kind (`"body"`, `"grip"`, …).
        kind: &'static str,
        /// The name that was looked up.
        name: String,
    },

    /// The handle refers to an object that was removed.
    #[error("{kind} handle {index} does not refer to a live object")]
    InvalidHandle {
        /// The registry kind.
        kind: &'static str,
        /// The arena slot.
        index: usize,
    },

    /// The model changed structurally since the topology was built.
    #[error("topology built at epoch {built} is stale (model is at epoch {current}); rebuild it")]
    StaleTopology {
        /// Model epoch the topology was built at.
        built: u64,
        /// Current model epoch.
        current: u64,
    },

    /// No topology was built yet, or the index is not one of the built ones.
    #[error("topology {index} does not exist; call `build_topology` first")]
    NotBuilt {
        /// The requested topology index.
        index: usize,
    },

    /// A connected component has fewer free coordinates than independent loop constraints.
    #[error(
        "component rooted at `{root}` is over-constrained: {free} free coordinates for {constraints} independent loop constraints"
    )]
    OverConstrained {
        /// Name of the component's root body.
        root: String,
        /// Number of free coordinates acting on the loops.
        free: usize,
        /// Numerical rank of the loop constraints.
        constraints: usize,
    },

    /// The position solver hit its iteration cap before meeting both tolerances.
    #[error(
        "position solve did not converge after {iterations} iterations (rotation residual {max_rot:e}, position residual {max_dist:e})"
    )]
    NotConverged {
        /// Newton steps taken.
        iterations: usize,
        /// Largest remaining rotation residual.
        max_rot: f64,
        /// Largest remaining position residual.
        max_dist: f64,
    },

    /// A rate-level solve could not satisfy the differentiated loop equations.
    #[error("{order} solve left a loop residual of {residual:e}")]
    RateMismatch {
        /// Which derivative order was solved (`"speed"`, `"accel"`, `"jerk"`).
        order: &'static str,
        /// Largest remaining residual.
        residual: f64,
    },

    /// A track needs at least two points.
    #[error("track needs at least 2 points, got {count}")]
    DegenerateTrack {
        /// Number of points supplied.
        count: usize,
    },

    /// A track point has a NaN or infinite coordinate.
    #[error("track point {index} is not finite")]
    NonFiniteTrackPoint {
        /// Index of the offending point.
        index: usize,
    },

    /// The 3x3 block of a transform is (numerically) singular.
    #[error("transform is not invertible (determinant {det:e})")]
    SingularTransform {
        /// Determinant of the rotation block.
        det: f64,
    },

    /// Corresponding points of two paired tracks drift further apart than allowed.
    #[error("co-track mismatch at point {index}: arclength drift {drift} exceeds {max}")]
    CoTrackMismatch {
        /// Index of the track point where the bound was exceeded.
        index: usize,
        /// Local arclength mismatch found.
        drift: f64,
        /// The allowed bound.
        max: f64,
    },
}

impl KinematicsError {
    /// Create an unknown-name error.
    #[must_use]
    pub fn unknown_name(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownName {
            kind,
            name: name.into(),
        }
    }

    /// Create a duplicate-name error.
    #[must_use]
    pub fn duplicate_name(kind: &'static str, name: impl Into<String>) -> Self {
        Self::DuplicateName {
            kind,
            name: name.into(),
        }
    }

    /// Check if this is a non-convergence report.
    #[must_use]
    pub fn is_not_converged(&self) -> bool {
        matches!(self, Self::NotConverged { .. })
    }

    /// Check if this error is cured by rebuilding the topology.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleTopology { .. } | Self::NotBuilt { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_numbers() {
        let err = KinematicsError::NotConverged {
            iterations: 7,
            max_rot: 1.0e-3,
            max_dist: 2.5e-2,
        };
        let msg = err.to_string();
        assert!(msg.contains("7 iterations"));
        assert!(msg.contains("1e-3"));
        assert!(err.is_not_converged());

        let err = KinematicsError::unknown_name("body", "crank");
        assert_eq!(err.to_string(), "no body named `crank`");
        assert!(!err.is_stale());
    }

    #[test]
    fn stale_predicate() {
        assert!(KinematicsError::StaleTopology {
            built: 1,
            current: 2
        }
        .is_stale());
        assert!(KinematicsError::NotBuilt { index: 0 }.is_stale());
    }
}
