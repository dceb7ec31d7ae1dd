use crate::{RenderError, quat::quat_scale_to_basis};
use burn::tensor::{Int, Tensor, TensorData, activation::softplus, backend::Backend};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::trace_span;

/// The Gaussian set: a structure-of-arrays over N Gaussians.
///
/// All four arrays are autodiff leaves and always share the same leading
/// dimension. Structural mutation goes through [`GaussianSet::select`] and
/// [`GaussianSet::concat`], which reindex every array together; letting the
/// arrays diverge in length is an invariant breach and panics.
#[derive(Debug, Clone)]
pub struct GaussianSet<B: Backend> {
    /// `[N, 3]` world-space positions.
    pub means: Tensor<B, 2>,
    /// `[N, 3]` log-scales (pre-activation).
    pub log_scales: Tensor<B, 2>,
    /// `[N, 4]` raw quaternions in `(w, x, y, z)` order (pre-activation).
    pub rotations: Tensor<B, 2>,
    /// `[N, 1]` raw densities (pre-activation).
    pub raw_densities: Tensor<B, 2>,
}

/// Normalize each row to unit length.
pub fn norm_vec<B: Backend>(vec: Tensor<B, 2>) -> Tensor<B, 2> {
    let magnitudes =
        Tensor::clamp_min(Tensor::sum_dim(vec.clone().powi_scalar(2), 1).sqrt(), 1e-32);
    vec / magnitudes
}

pub fn inverse_softplus(x: f32) -> f32 {
    ((x.exp() - 1.0).max(1e-30)).ln()
}

#[derive(PartialEq, Clone, Copy, Debug)]
struct BallPoint(glam::Vec3A);

impl ball_tree::Point for BallPoint {
    fn distance(&self, other: &Self) -> f64 {
        self.0.distance(other.0) as f64
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        Self(self.0.lerp(other.0, d as f32 / self.0.distance(other.0)))
    }

    fn midpoint(a: &Self, b: &Self) -> Self {
        Self((a.0 + b.0) / 2.0)
    }
}

/// Default `(min, max)` clamp for KNN-derived seed scales, world units.
pub const DEFAULT_SCALE_BOUNDS: (f32, f32) = (1e-4, 1.0);

/// Isotropic log-scales from nearest-neighbor spacing, clamped to
/// `scale_bounds` before the log.
fn knn_log_scales(positions: &[f32], scale_bounds: (f32, f32)) -> Vec<f32> {
    let _ = trace_span!("knn_log_scales").entered();

    let n = positions.len() / 3;
    if n < 3 {
        return vec![0.0; n];
    }

    let tree_points: Vec<BallPoint> = positions
        .chunks_exact(3)
        .map(|v| BallPoint(glam::Vec3A::new(v[0], v[1], v[2])))
        .collect();
    let empty = vec![(); tree_points.len()];
    let tree = ball_tree::BallTree::new(tree_points.clone(), empty);

    tree_points
        .par_iter()
        .map_with(tree.query(), |query, p| {
            // Half the average of the two nearest distances (skipping self).
            let mut q = query.nn(p).skip(1);
            let a1 = q.next().map_or(1e-3, |p| p.1) as f32;
            let a2 = q.next().map_or(1e-3, |p| p.1) as f32;
            ((a1 + a2) / 4.0).clamp(scale_bounds.0, scale_bounds.1).ln()
        })
        .collect()
}

impl<B: Backend> GaussianSet<B> {
    /// Initialize N Gaussians from a seed point cloud: given positions and
    /// densities, isotropic scale from nearest-neighbor spacing (or a
    /// supplied constant), identity rotation.
    pub fn from_seed(
        positions: Vec<f32>,
        densities: Vec<f32>,
        initial_scale: Option<f32>,
        device: &B::Device,
    ) -> Result<Self, RenderError> {
        Self::from_seed_with_bounds(
            positions,
            densities,
            initial_scale,
            DEFAULT_SCALE_BOUNDS,
            device,
        )
    }

    /// [`Self::from_seed`] with an explicit clamp on the KNN-derived scales.
    pub fn from_seed_with_bounds(
        positions: Vec<f32>,
        densities: Vec<f32>,
        initial_scale: Option<f32>,
        scale_bounds: (f32, f32),
        device: &B::Device,
    ) -> Result<Self, RenderError> {
        let n = positions.len() / 3;
        if n == 0 {
            return Err(RenderError::EmptySeed);
        }
        if densities.len() != n {
            return Err(RenderError::SeedLengthMismatch {
                positions: n,
                densities: densities.len(),
            });
        }

        let log_scales: Vec<f32> = match initial_scale {
            Some(s) => vec![s.ln(); n * 3],
            None => knn_log_scales(&positions, scale_bounds)
                .into_iter()
                .flat_map(|s| [s, s, s])
                .collect(),
        };
        let rotations: Vec<f32> = [1.0, 0.0, 0.0, 0.0].repeat(n);
        let raw_densities: Vec<f32> = densities.into_iter().map(inverse_softplus).collect();

        Ok(Self::from_tensors(
            Tensor::from_data(TensorData::new(positions, [n, 3]), device),
            Tensor::from_data(TensorData::new(log_scales, [n, 3]), device),
            Tensor::from_data(TensorData::new(rotations, [n, 4]), device),
            Tensor::from_data(TensorData::new(raw_densities, [n, 1]), device),
        ))
    }

    pub fn from_tensors(
        means: Tensor<B, 2>,
        log_scales: Tensor<B, 2>,
        rotations: Tensor<B, 2>,
        raw_densities: Tensor<B, 2>,
    ) -> Self {
        let set = Self {
            means: means.detach().require_grad(),
            log_scales: log_scales.detach().require_grad(),
            rotations: rotations.detach().require_grad(),
            raw_densities: raw_densities.detach().require_grad(),
        };
        set.validate_lengths();
        set
    }

    /// Panics when any per-Gaussian array diverged in length.
    pub fn validate_lengths(&self) {
        let n = self.means.dims()[0];
        assert_eq!(self.means.dims()[1], 3, "means must be 3D");
        assert_eq!(self.rotations.dims(), [n, 4], "rotation length diverged");
        assert_eq!(self.log_scales.dims(), [n, 3], "scale length diverged");
        assert_eq!(self.raw_densities.dims(), [n, 1], "density length diverged");
    }

    pub fn num_gaussians(&self) -> usize {
        self.means.dims()[0]
    }

    pub fn device(&self) -> B::Device {
        self.means.device()
    }

    pub fn xyz(&self) -> Tensor<B, 2> {
        self.means.clone()
    }

    /// Activated densities, always ≥ 0.
    pub fn densities(&self) -> Tensor<B, 2> {
        softplus(self.raw_densities.clone(), 1.0)
    }

    /// Activated scales, always positive.
    pub fn scales(&self) -> Tensor<B, 2> {
        self.log_scales.clone().exp()
    }

    /// Unit-quaternion rotations.
    pub fn rotations_normed(&self) -> Tensor<B, 2> {
        norm_vec(self.rotations.clone())
    }

    /// Packed 3D covariance `R diag((m·s)²) Rᵀ` as `[N, 6]` upper-triangular
    /// coefficients, with a caller-supplied scale modifier `m`.
    pub fn covariance(&self, modifier: f32) -> Tensor<B, 2> {
        let n = self.num_gaussians();
        let basis = quat_scale_to_basis(self.rotations_normed(), self.scales() * modifier);
        let cov = basis.clone().matmul(basis.swap_dims(1, 2));
        let el = |i: usize, j: usize| cov.clone().slice([0..n, i..i + 1, j..j + 1]).reshape([n, 1]);
        Tensor::cat(
            vec![el(0, 0), el(0, 1), el(0, 2), el(1, 1), el(1, 2), el(2, 2)],
            1,
        )
    }

    /// Keep only the Gaussians at `indices`, reindexing every array together.
    /// The result is a fresh set of autodiff leaves.
    pub fn select(&self, indices: Tensor<B, 1, Int>) -> Self {
        Self::from_tensors(
            self.means.clone().select(0, indices.clone()),
            self.log_scales.clone().select(0, indices.clone()),
            self.rotations.clone().select(0, indices.clone()),
            self.raw_densities.clone().select(0, indices),
        )
    }

    /// Append the Gaussians of `extra`, reindexing every array together.
    pub fn concat(&self, extra: &Self) -> Self {
        Self::from_tensors(
            Tensor::cat(vec![self.means.clone(), extra.means.clone()], 0),
            Tensor::cat(vec![self.log_scales.clone(), extra.log_scales.clone()], 0),
            Tensor::cat(vec![self.rotations.clone(), extra.rotations.clone()], 0),
            Tensor::cat(
                vec![self.raw_densities.clone(), extra.raw_densities.clone()],
                0,
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn seed_sphere(n: usize) -> (Vec<f32>, Vec<f32>) {
        let positions = (0..n)
            .flat_map(|i| {
                let theta = i as f32 / n as f32 * std::f32::consts::TAU;
                [theta.cos(), theta.sin(), 0.0]
            })
            .collect();
        (positions, vec![1.0; n])
    }

    #[test]
    fn from_seed_sets_all_lengths() {
        let device = Default::default();
        let (positions, densities) = seed_sphere(100);
        let set = GaussianSet::<B>::from_seed(positions, densities, Some(0.01), &device).unwrap();
        assert_eq!(set.num_gaussians(), 100);
        assert_eq!(set.means.dims(), [100, 3]);
        assert_eq!(set.log_scales.dims(), [100, 3]);
        assert_eq!(set.rotations.dims(), [100, 4]);
        assert_eq!(set.raw_densities.dims(), [100, 1]);
    }

    #[test]
    fn activations_are_non_negative() {
        let device = Default::default();
        let (positions, densities) = seed_sphere(16);
        let set = GaussianSet::<B>::from_seed(positions, densities, None, &device).unwrap();

        let dens = set.densities().into_data().into_vec::<f32>().unwrap();
        assert!(dens.iter().all(|&d| d >= 0.0));
        // Seeded with density 1.0, activation must give that back.
        assert!(dens.iter().all(|&d| (d - 1.0).abs() < 1e-4));

        let scales = set.scales().into_data().into_vec::<f32>().unwrap();
        assert!(scales.iter().all(|&s| s > 0.0));

        let rot_norms = set
            .rotations_normed()
            .powi_scalar(2)
            .sum_dim(1)
            .sqrt()
            .into_data()
            .into_vec::<f32>()
            .unwrap();
        assert!(rot_norms.iter().all(|&r| (r - 1.0).abs() < 1e-5));
    }

    #[test]
    fn knn_scales_respect_configured_bounds() {
        let device = Default::default();
        // Points 10 units apart would give KNN scales of 5; the upper bound
        // has to clamp them down.
        let positions: Vec<f32> = (0..4).flat_map(|i| [i as f32 * 10.0, 0.0, 0.0]).collect();
        let set = GaussianSet::<B>::from_seed_with_bounds(
            positions,
            vec![1.0; 4],
            None,
            (1e-3, 0.5),
            &device,
        )
        .unwrap();
        let scales = set.scales().into_data().into_vec::<f32>().unwrap();
        assert!(scales.iter().all(|&s| (s - 0.5).abs() < 1e-5), "{scales:?}");
    }

    #[test]
    fn empty_seed_fails() {
        let device = Default::default();
        let res = GaussianSet::<B>::from_seed(vec![], vec![], Some(0.1), &device);
        assert!(matches!(res, Err(RenderError::EmptySeed)));
    }

    #[test]
    fn covariance_of_isotropic_gaussian_is_diagonal() {
        let device = Default::default();
        let set = GaussianSet::<B>::from_seed(
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            vec![1.0, 1.0],
            Some(0.5),
            &device,
        )
        .unwrap();
        let cov = set
            .covariance(1.0)
            .into_data()
            .into_vec::<f32>()
            .unwrap();
        // (xx, xy, xz, yy, yz, zz) per Gaussian; identity rotation keeps it diagonal.
        for chunk in cov.chunks_exact(6) {
            assert!((chunk[0] - 0.25).abs() < 1e-5);
            assert!(chunk[1].abs() < 1e-6 && chunk[2].abs() < 1e-6 && chunk[4].abs() < 1e-6);
            assert!((chunk[3] - 0.25).abs() < 1e-5);
            assert!((chunk[5] - 0.25).abs() < 1e-5);
        }
    }

    #[test]
    fn select_and_concat_keep_arrays_synchronized() {
        let device = Default::default();
        let (positions, densities) = seed_sphere(10);
        let set = GaussianSet::<B>::from_seed(positions, densities, Some(0.1), &device).unwrap();
        let keep = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![0i64, 2, 4], [3]), &device);
        let kept = set.select(keep);
        assert_eq!(kept.num_gaussians(), 3);
        let grown = kept.concat(&kept);
        assert_eq!(grown.num_gaussians(), 6);
    }
}
