//! Transform algebra: tagged vectors, tagged transforms and their time jets.

pub use jet::TrfJet;
pub use trf3::{Trf3, SINGULAR_DET};
pub use vec3::{Vec3, IDENT_DIR, IDENT_DIST};

/// Pose-with-derivatives products and inverses.
pub mod jet;
/// The 3x4 homogeneous transform.
pub mod trf3;
/// The tagged 3D vector.
pub mod vec3;
