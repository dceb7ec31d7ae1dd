use crate::{
    CovSource,
    camera::{Camera, ProjectionMode},
    quat::{quat_scale_to_basis, unpack_sym3},
};
use burn::tensor::{Bool, Tensor, TensorData, backend::Backend};
use glam::Mat3;
use tracing::trace_span;

/// Gaussians per accumulation chunk. Bounds the size of the per-chunk
/// `[chunk, pixels]` weight tensor.
const GAUSSIAN_CHUNK: usize = 256;

/// Minimum depth in front of a cone-beam source.
const NEAR_PLANE: f32 = 0.01;

/// Screen-space low-pass dilation added to the projected covariance diagonal.
const COV_DILATION: f32 = 0.3;

/// Per-render side outputs. `radii[i] == 0` exactly when Gaussian `i` was
/// culled; the visibility filter is derived from that.
#[derive(Debug, Clone)]
pub struct RenderAux<B: Backend> {
    /// `[N]` projected screen radii in pixels (0 for culled Gaussians).
    pub radii: Tensor<B, 1>,
}

impl<B: Backend> RenderAux<B> {
    pub fn visibility_filter(&self) -> Tensor<B, 1, Bool> {
        self.radii.clone().greater_elem(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutput<B: Backend> {
    /// `[H, W]` single-channel X-ray projection.
    pub image: Tensor<B, 2>,
    pub aux: RenderAux<B>,
}

fn mat3_tensor<B: Backend>(m: Mat3, device: &B::Device) -> Tensor<B, 2> {
    let rows: Vec<f32> = (0..3).flat_map(|i| m.row(i).to_array()).collect();
    Tensor::from_data(TensorData::new(rows, [3, 3]), device)
}

fn pixel_grid<B: Backend>(len: usize, device: &B::Device) -> Tensor<B, 1> {
    Tensor::arange(0..len as i64, device).float() + 0.5
}

/// Project the Gaussians onto the camera's detector and accumulate the X-ray
/// transmission image. Purely tensor ops, so gradients flow to every input
/// through the backend's autodiff.
pub fn rasterize<B: Backend>(
    camera: &Camera,
    means: Tensor<B, 2>,
    cov: CovSource<B>,
    densities: Tensor<B, 2>,
) -> RenderOutput<B> {
    let _span = trace_span!("rasterize").entered();

    let device = means.device();
    let n = means.dims()[0];
    let (w, h) = (camera.width as usize, camera.height as usize);
    assert!(w > 0 && h > 0, "can't render images with 0 size");

    let (fx, fy) = camera.focal();
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);

    let rot = mat3_tensor::<B>(camera.rotation, &device);
    let t = Tensor::<B, 1>::from_data(
        TensorData::new(camera.translation.to_array().to_vec(), [3]),
        &device,
    );

    // World to view space. The view convention is right-handed with the
    // camera looking down -z, so depth is the negated z coordinate.
    let cam_pts = means.matmul(rot.clone().transpose()) + t.unsqueeze_dim::<2>(0);
    let tx = cam_pts.clone().slice([0..n, 0..1]);
    let ty = cam_pts.clone().slice([0..n, 1..2]);
    let tz = cam_pts.slice([0..n, 2..3]);
    let depth = tz.neg();

    // Projected centers and the projection Jacobian rows.
    let (px, py, jac) = match camera.mode {
        ProjectionMode::Parallel => {
            let px = tx.clone() * fx + cx;
            let py = ty.clone() * fy + cy;
            let zeros = Tensor::zeros_like(&tx);
            let row0 = Tensor::cat(vec![zeros.clone() + fx, zeros.clone(), zeros.clone()], 1);
            let row1 = Tensor::cat(vec![zeros.clone(), zeros.clone() + fy, zeros], 1);
            (px, py, Tensor::stack::<3>(vec![row0, row1], 1))
        }
        ProjectionMode::Cone { .. } => {
            let d = depth.clone().clamp_min(NEAR_PLANE);
            let px = tx.clone() / d.clone() * fx + cx;
            let py = ty.clone() / d.clone() * fy + cy;
            let zeros = Tensor::zeros_like(&tx);
            let row0 = Tensor::cat(
                vec![
                    d.clone().recip() * fx,
                    zeros.clone(),
                    tx.clone() / (d.clone() * d.clone()) * fx,
                ],
                1,
            );
            let row1 = Tensor::cat(
                vec![
                    zeros,
                    d.clone().recip() * fy,
                    ty.clone() / (d.clone() * d) * fy,
                ],
                1,
            );
            (px, py, Tensor::stack::<3>(vec![row0, row1], 1))
        }
    };

    // cov2d = (J W) Σ (J W)ᵀ with the usual screen-space dilation.
    let jw = jac.matmul(rot.unsqueeze_dim::<3>(0).expand([n, 3, 3]));
    let cov2d = match cov {
        CovSource::ScaleRotation { scales, rotations } => {
            let basis = quat_scale_to_basis(rotations, scales);
            let half = jw.matmul(basis);
            half.clone().matmul(half.swap_dims(1, 2))
        }
        CovSource::Precomputed(cov6) => {
            let sigma = unpack_sym3(cov6);
            jw.clone().matmul(sigma).matmul(jw.swap_dims(1, 2))
        }
    };

    let a = cov2d.clone().slice([0..n, 0..1, 0..1]).reshape([n, 1]) + COV_DILATION;
    let c = cov2d.clone().slice([0..n, 1..2, 1..2]).reshape([n, 1]) + COV_DILATION;
    let b = cov2d.slice([0..n, 0..1, 1..2]).reshape([n, 1]);

    let det = (a.clone() * c.clone() - b.clone() * b.clone()).clamp_min(1e-12);
    let conic_a = c.clone() / det.clone();
    let conic_b = b.clone().neg() / det.clone();
    let conic_c = a.clone() / det.clone();

    // Screen radius at 3 sigma of the major axis.
    let mid = (a + c) / 2.0;
    let lambda_max = mid.clone() + (mid.clone() * mid - det).clamp_min(1e-12).sqrt();
    let radius = (lambda_max.sqrt() * 3.0).ceil();

    // Cull Gaussians behind the source (cone beam) and outside the detector.
    let in_front = match camera.mode {
        ProjectionMode::Parallel => Tensor::ones_like(&radius),
        ProjectionMode::Cone { .. } => depth.greater_elem(NEAR_PLANE).float(),
    };
    let in_bounds = (px.clone() + radius.clone()).greater_elem(0.0).float()
        * (px.clone() - radius.clone()).lower_elem(w as f32).float()
        * (py.clone() + radius.clone()).greater_elem(0.0).float()
        * (py.clone() - radius.clone()).lower_elem(h as f32).float();
    let vis_mask = (in_front * in_bounds).detach();

    let radii = (radius * vis_mask.clone()).reshape([n]).detach();
    let weights = densities * vis_mask;

    // Accumulate additively: X-ray attenuation is a line integral, there is
    // no occlusion ordering between Gaussians.
    let gx = pixel_grid::<B>(w, &device)
        .unsqueeze_dim::<2>(0)
        .expand([h, w])
        .reshape([1, h * w]);
    let gy = pixel_grid::<B>(h, &device)
        .unsqueeze_dim::<2>(1)
        .expand([h, w])
        .reshape([1, h * w]);

    let mut image = Tensor::<B, 2>::zeros([1, h * w], &device);
    let mut start = 0;
    while start < n {
        let end = (start + GAUSSIAN_CHUNK).min(n);
        let dx = gx.clone() - px.clone().slice([start..end]);
        let dy = gy.clone() - py.clone().slice([start..end]);
        let power = (dx.clone() * dx.clone() * conic_a.clone().slice([start..end])
            + dy.clone() * dy.clone() * conic_c.clone().slice([start..end]))
            * -0.5
            - dx * dy * conic_b.clone().slice([start..end]);
        let alpha = power.clamp_max(0.0).exp() * weights.clone().slice([start..end]);
        image = image + alpha.sum_dim(0);
        start = end;
    }

    RenderOutput {
        image: image.reshape([h, w]),
        aux: RenderAux { radii },
    }
}
