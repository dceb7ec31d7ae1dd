#![recursion_limit = "256"]

pub mod bounding_box;
pub mod camera;
pub mod gaussian_splats;
pub mod rasterize;
pub mod voxelize;

mod quat;

pub use quat::{quat_scale_to_basis, quat_to_rotmat};

use burn::tensor::{Tensor, backend::Backend};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unsupported projection mode {0} (expected 0 = parallel or 1 = cone)")]
    UnsupportedMode(u32),
    #[error("cannot create a Gaussian set from an empty seed cloud")]
    EmptySeed,
    #[error("seed cloud has {positions} positions but {densities} densities")]
    SeedLengthMismatch { positions: usize, densities: usize },
}

/// The covariance input of the rasterizer and voxelizer. Either activated
/// scale/rotation pairs, or a covariance precomputed by the caller (packed
/// as the six upper-triangular coefficients per Gaussian).
#[derive(Debug, Clone)]
pub enum CovSource<B: Backend> {
    ScaleRotation {
        /// `[N, 3]`, positive (post-activation).
        scales: Tensor<B, 2>,
        /// `[N, 4]`, unit quaternions (post-activation).
        rotations: Tensor<B, 2>,
    },
    /// `[N, 6]` packed symmetric covariance.
    Precomputed(Tensor<B, 2>),
}
