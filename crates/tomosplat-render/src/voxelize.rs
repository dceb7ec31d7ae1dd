use crate::{
    CovSource,
    quat::{invert_sym3, quat_to_rotmat, unpack_sym3},
    rasterize::RenderAux,
};
use burn::tensor::{Int, Tensor, backend::Backend};
use tracing::trace_span;

/// Gaussians per outer chunk.
const GAUSSIAN_CHUNK: usize = 64;

/// Voxels per inner chunk. Keeps the `[chunk, voxels, 3]` offset tensor at a
/// few megabytes.
const VOXEL_CHUNK: usize = 32768;

/// The reconstruction grid: resolution, physical size and world-space center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub n_voxel: [usize; 3],
    pub s_voxel: [f32; 3],
    pub center: [f32; 3],
}

impl GridSpec {
    pub fn num_voxels(&self) -> usize {
        self.n_voxel[0] * self.n_voxel[1] * self.n_voxel[2]
    }

    /// Physical edge length of one voxel per axis.
    pub fn voxel_size(&self) -> [f32; 3] {
        [
            self.s_voxel[0] / self.n_voxel[0] as f32,
            self.s_voxel[1] / self.n_voxel[1] as f32,
            self.s_voxel[2] / self.n_voxel[2] as f32,
        ]
    }

    fn axis_min(&self, axis: usize) -> f32 {
        self.center[axis] - self.s_voxel[axis] * 0.5
    }

    fn axis_max(&self, axis: usize) -> f32 {
        self.center[axis] + self.s_voxel[axis] * 0.5
    }

    /// Voxel-center coordinates, `[V, 3]` flattened with z fastest so the
    /// result reshapes straight into `[nx, ny, nz]`.
    fn coords<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let [nx, ny, nz] = self.n_voxel;
        let size = self.voxel_size();
        let axis = |n: usize, i: usize| {
            (Tensor::<B, 1, Int>::arange(0..n as i64, device).float() + 0.5) * size[i]
                + self.axis_min(i)
        };
        let gx = axis(nx, 0).reshape([nx, 1, 1]).expand([nx, ny, nz]);
        let gy = axis(ny, 1).reshape([1, ny, 1]).expand([nx, ny, nz]);
        let gz = axis(nz, 2).reshape([1, 1, nz]).expand([nx, ny, nz]);
        let v = nx * ny * nz;
        Tensor::stack::<2>(
            vec![gx.reshape([v]), gy.reshape([v]), gz.reshape([v])],
            1,
        )
    }
}

#[derive(Debug, Clone)]
pub struct VoxelizeOutput<B: Backend> {
    /// `[nx, ny, nz]` reconstructed attenuation volume.
    pub volume: Tensor<B, 3>,
    pub aux: RenderAux<B>,
}

/// Evaluate the Gaussian mixture at every voxel center and accumulate the
/// attenuation volume. Like [`crate::rasterize::rasterize`] this is pure
/// tensor math and differentiable end to end.
///
/// The exponent is evaluated as `|diag(1/s) Rᵀ d|²` in the scale/rotation
/// case, which avoids forming and inverting the 3x3 covariance.
pub fn voxelize<B: Backend>(
    grid: &GridSpec,
    means: Tensor<B, 2>,
    cov: CovSource<B>,
    densities: Tensor<B, 2>,
) -> VoxelizeOutput<B> {
    let _span = trace_span!("voxelize").entered();

    let device = means.device();
    let n = means.dims()[0];
    let [nx, ny, nz] = grid.n_voxel;
    let v = grid.num_voxels();
    assert!(v > 0, "can't voxelize onto an empty grid");

    // World-space cutoff radius per Gaussian (3 sigma of the largest axis).
    let radius_world = match &cov {
        CovSource::ScaleRotation { scales, .. } => scales.clone().max_dim(1) * 3.0,
        CovSource::Precomputed(cov6) => {
            let diag = Tensor::cat(
                vec![
                    cov6.clone().slice([0..n, 0..1]),
                    cov6.clone().slice([0..n, 3..4]),
                    cov6.clone().slice([0..n, 5..6]),
                ],
                1,
            );
            diag.max_dim(1).clamp_min(0.0).sqrt() * 3.0
        }
    };

    // Cull Gaussians whose 3 sigma box misses the grid entirely.
    let mut vis = Tensor::<B, 2>::ones([n, 1], &device);
    for axis in 0..3 {
        let coord = means.clone().slice([0..n, axis..axis + 1]);
        vis = vis
            * (coord.clone() + radius_world.clone())
                .greater_elem(grid.axis_min(axis))
                .float()
            * (coord - radius_world.clone())
                .lower_elem(grid.axis_max(axis))
                .float();
    }
    let vis = vis.detach();

    let min_voxel = grid
        .voxel_size()
        .into_iter()
        .fold(f32::INFINITY, f32::min);
    let radii = (radius_world / min_voxel * vis.clone())
        .reshape([n])
        .detach();

    // The whitening transform per Gaussian, applied to voxel offsets as a row
    // vector: y = d · Qᵀ with Q = diag(1/s) Rᵀ, so Qᵀ = R diag(1/s).
    let whitener = |range: std::ops::Range<usize>| match &cov {
        CovSource::ScaleRotation { scales, rotations } => {
            let rot = quat_to_rotmat(rotations.clone().slice([range.clone()]));
            let inv_s = scales.clone().slice([range]).recip();
            rot * inv_s.unsqueeze_dim::<3>(1)
        }
        CovSource::Precomputed(cov6) => {
            // No factor available, fall back to the full inverse; the
            // exponent branch below consumes it as d Σ⁻¹ dᵀ.
            invert_sym3(unpack_sym3(cov6.clone().slice([range])))
        }
    };
    let uses_factor = matches!(cov, CovSource::ScaleRotation { .. });

    let weights = densities * vis;
    let coords = grid.coords::<B>(&device);

    let mut volume = Tensor::<B, 2>::zeros([1, v], &device);
    let mut g_start = 0;
    while g_start < n {
        let g_end = (g_start + GAUSSIAN_CHUNK).min(n);
        let nc = g_end - g_start;
        let mu = means
            .clone()
            .slice([g_start..g_end])
            .unsqueeze_dim::<3>(1);
        let q = whitener(g_start..g_end);
        let dens = weights.clone().slice([g_start..g_end]);

        let mut v_start = 0;
        while v_start < v {
            let v_end = (v_start + VOXEL_CHUNK).min(v);
            let vc = v_end - v_start;
            let d = coords
                .clone()
                .slice([v_start..v_end])
                .unsqueeze_dim::<3>(0)
                - mu.clone();

            let power = if uses_factor {
                let y = d.matmul(q.clone());
                y.clone().mul(y).sum_dim(2).reshape([nc, vc]) * -0.5
            } else {
                let e = d.clone().matmul(q.clone()).mul(d).sum_dim(2);
                e.reshape([nc, vc]) * -0.5
            };

            let contrib = (power.clamp_max(0.0).exp() * dens.clone()).sum_dim(0);
            let updated = volume.clone().slice([0..1, v_start..v_end]) + contrib;
            volume = volume.slice_assign([0..1, v_start..v_end], updated);
            v_start = v_end;
        }
        g_start = g_end;
    }

    VoxelizeOutput {
        volume: volume.reshape([nx, ny, nz]),
        aux: RenderAux { radii },
    }
}
