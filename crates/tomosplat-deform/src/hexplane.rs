use burn::{
    config::Config,
    module::{Module, Param},
    tensor::{Distribution, Tensor, backend::Backend},
};
use tracing::trace_span;

/// Configuration of the factorized spatio-temporal feature grid.
#[derive(Config, Debug)]
pub struct HexPlaneConfig {
    /// Features stored per plane cell.
    #[config(default = 32)]
    pub feature_dim: usize,
    /// Base grid resolution per axis, `[x, y, z, t]`. The spatial axes are
    /// upsampled per multires level, the time axis is not.
    #[config(default = "[64, 64, 64, 150]")]
    pub resolution: [usize; 4],
    /// Spatial upsampling factors, one plane set per entry.
    #[config(default = "vec![1, 2, 4, 8]")]
    pub multires: Vec<usize>,
    /// Half-width of the axis-aligned box the grid covers.
    #[config(default = 1.6)]
    pub bounds: f32,
}

impl HexPlaneConfig {
    /// Width of the feature vector [`HexPlaneField::forward`] produces.
    pub fn output_dim(&self) -> usize {
        self.feature_dim * self.multires.len()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> HexPlaneField<B> {
        let grids = self
            .multires
            .iter()
            .map(|&level| PlaneSet::new(self.feature_dim, self.resolution, level, device))
            .collect();
        HexPlaneField {
            grids,
            bounds: self.bounds,
        }
    }
}

/// Bilinear lookup into one plane `[F, H, W]` at N normalized coordinates,
/// `u` along the W axis and `v` along H. Returns `[N, F]`.
///
/// Gradients flow both into the plane values (through `select`) and into the
/// coordinates (through the interpolation weights).
fn sample_plane<B: Backend>(plane: Tensor<B, 3>, u: Tensor<B, 1>, v: Tensor<B, 1>) -> Tensor<B, 2> {
    let [f, h, w] = plane.dims();

    let x = u.clamp(0.0, 1.0) * (w - 1) as f32;
    let y = v.clamp(0.0, 1.0) * (h - 1) as f32;
    // Keep the base corner one cell away from the far edge so the +1
    // neighbor always exists.
    let x0 = x.clone().floor().clamp(0.0, (w - 2) as f32);
    let y0 = y.clone().floor().clamp(0.0, (h - 2) as f32);
    let fx = x - x0.clone();
    let fy = y - y0.clone();

    let x0i = x0.int();
    let y0i = y0.int();
    let flat = plane.reshape([f, h * w]);
    let corner = |dx: i32, dy: i32| {
        let idx = (y0i.clone() + dy) * w as i32 + (x0i.clone() + dx);
        flat.clone().select(1, idx)
    };

    let gx = -fx.clone() + 1.0;
    let gy = -fy.clone() + 1.0;
    let weight = |t: Tensor<B, 1>| t.unsqueeze_dim::<2>(0);

    let out = corner(0, 0) * weight(gx.clone() * gy.clone())
        + corner(1, 0) * weight(fx.clone() * gy)
        + corner(0, 1) * weight(gx * fy.clone())
        + corner(1, 1) * weight(fx * fy);
    out.swap_dims(0, 1)
}

fn tv_2d<B: Backend>(plane: Tensor<B, 3>) -> Tensor<B, 1> {
    let [f, h, w] = plane.dims();
    let dv = plane.clone().slice([0..f, 1..h, 0..w]) - plane.clone().slice([0..f, 0..h - 1, 0..w]);
    let du = plane.clone().slice([0..f, 0..h, 1..w]) - plane.slice([0..f, 0..h, 0..w - 1]);
    dv.powi_scalar(2).mean() + du.powi_scalar(2).mean()
}

/// Squared second difference along the time axis (dim 1 of a time plane).
fn time_curvature<B: Backend>(plane: Tensor<B, 3>) -> Tensor<B, 1> {
    let [f, h, w] = plane.dims();
    let d2 = plane.clone().slice([0..f, 2..h, 0..w])
        - plane.clone().slice([0..f, 1..h - 1, 0..w]) * 2.0
        + plane.slice([0..f, 0..h - 2, 0..w]);
    d2.powi_scalar(2).mean()
}

/// One multires level: six 2D feature planes, one per pair of the four
/// `(x, y, z, t)` axes. A plane over axes `(a, b)` is stored `[F, res_b,
/// res_a]` and sampled at `(u_a, u_b)`.
#[derive(Module, Debug)]
pub struct PlaneSet<B: Backend> {
    xy: Param<Tensor<B, 3>>,
    xz: Param<Tensor<B, 3>>,
    yz: Param<Tensor<B, 3>>,
    xt: Param<Tensor<B, 3>>,
    yt: Param<Tensor<B, 3>>,
    zt: Param<Tensor<B, 3>>,
}

impl<B: Backend> PlaneSet<B> {
    fn new(feature_dim: usize, res: [usize; 4], level: usize, device: &B::Device) -> Self {
        // Spatial planes start small and positive, time planes start near
        // one so the multiplicative fusion is close to time-invariant.
        let spatial = |a: usize, b: usize| {
            Param::from_tensor(Tensor::random(
                [feature_dim, res[b] * level, res[a] * level],
                Distribution::Uniform(0.1, 0.5),
                device,
            ))
        };
        let temporal = |a: usize| {
            Param::from_tensor(Tensor::random(
                [feature_dim, res[3], res[a] * level],
                Distribution::Uniform(0.9, 1.1),
                device,
            ))
        };
        Self {
            xy: spatial(0, 1),
            xz: spatial(0, 2),
            yz: spatial(1, 2),
            xt: temporal(0),
            yt: temporal(1),
            zt: temporal(2),
        }
    }

    /// Fused feature `[N, F]`: the product of all six plane lookups.
    fn forward(
        &self,
        x: Tensor<B, 1>,
        y: Tensor<B, 1>,
        z: Tensor<B, 1>,
        t: Tensor<B, 1>,
    ) -> Tensor<B, 2> {
        sample_plane(self.xy.val(), x.clone(), y.clone())
            * sample_plane(self.xz.val(), x.clone(), z.clone())
            * sample_plane(self.yz.val(), y.clone(), z.clone())
            * sample_plane(self.xt.val(), x, t.clone())
            * sample_plane(self.yt.val(), y, t.clone())
            * sample_plane(self.zt.val(), z, t)
    }

    fn spatial_planes(&self) -> [Tensor<B, 3>; 3] {
        [self.xy.val(), self.xz.val(), self.yz.val()]
    }

    fn time_planes(&self) -> [Tensor<B, 3>; 3] {
        [self.xt.val(), self.yt.val(), self.zt.val()]
    }
}

/// Multi-resolution hexplane feature field over space and normalized time.
#[derive(Module, Debug)]
pub struct HexPlaneField<B: Backend> {
    grids: Vec<PlaneSet<B>>,
    bounds: f32,
}

impl<B: Backend> HexPlaneField<B> {
    /// Look up features for N points at N times; `positions` is `[N, 3]`
    /// world space, `time` is `[N]` in `[0, 1]`. Returns `[N, F * levels]`.
    pub fn forward(&self, positions: Tensor<B, 2>, time: Tensor<B, 1>) -> Tensor<B, 2> {
        let _span = trace_span!("hexplane_forward").entered();

        let n = positions.dims()[0];
        let norm = (positions / self.bounds).clamp(-1.0, 1.0) * 0.5 + 0.5;
        let x = norm.clone().slice([0..n, 0..1]).reshape([n]);
        let y = norm.clone().slice([0..n, 1..2]).reshape([n]);
        let z = norm.slice([0..n, 2..3]).reshape([n]);

        let feats = self
            .grids
            .iter()
            .map(|set| set.forward(x.clone(), y.clone(), z.clone(), time.clone()))
            .collect();
        Tensor::cat(feats, 1)
    }

    /// Total variation over the spatial planes of every level.
    pub fn tv_loss(&self) -> Tensor<B, 1> {
        self.grids
            .iter()
            .flat_map(|set| set.spatial_planes())
            .map(tv_2d)
            .reduce(|a, b| a + b)
            .expect("hexplane has at least one level")
    }

    /// Penalizes acceleration along the time axis of the time planes.
    pub fn time_smoothness(&self) -> Tensor<B, 1> {
        self.grids
            .iter()
            .flat_map(|set| set.time_planes())
            .map(time_curvature)
            .reduce(|a, b| a + b)
            .expect("hexplane has at least one level")
    }

    /// L1 pull of the time planes towards one (the time-invariant state).
    pub fn l1_time(&self) -> Tensor<B, 1> {
        self.grids
            .iter()
            .flat_map(|set| set.time_planes())
            .map(|p| (p - 1.0).abs().mean())
            .reduce(|a, b| a + b)
            .expect("hexplane has at least one level")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray;

    fn tiny_config() -> HexPlaneConfig {
        HexPlaneConfig::new()
            .with_feature_dim(4)
            .with_resolution([8, 8, 8, 6])
            .with_multires(vec![1, 2])
            .with_bounds(1.6)
    }

    #[test]
    fn forward_shape_matches_output_dim() {
        let device = Default::default();
        let config = tiny_config();
        let field = config.init::<B>(&device);

        let positions = Tensor::from_data(
            TensorData::new(vec![0.0f32, 0.0, 0.0, 1.0, -1.0, 0.5], [2, 3]),
            &device,
        );
        let time = Tensor::from_data(TensorData::new(vec![0.0f32, 0.7], [2]), &device);

        let feat = field.forward(positions, time);
        assert_eq!(feat.dims(), [2, config.output_dim()]);
        let vals = feat.into_data().into_vec::<f32>().unwrap();
        assert!(vals.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn out_of_bounds_points_clamp_instead_of_panicking() {
        let device = Default::default();
        let field = tiny_config().init::<B>(&device);
        let positions = Tensor::from_data(
            TensorData::new(vec![100.0f32, -100.0, 100.0], [1, 3]),
            &device,
        );
        let time = Tensor::from_data(TensorData::new(vec![1.5f32], [1]), &device);
        let vals = field
            .forward(positions, time)
            .into_data()
            .into_vec::<f32>()
            .unwrap();
        assert!(vals.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn regularizers_are_finite_and_non_negative() {
        let device = Default::default();
        let field = tiny_config().init::<B>(&device);
        for loss in [field.tv_loss(), field.time_smoothness(), field.l1_time()] {
            let v: f32 = loss.into_scalar();
            assert!(v.is_finite());
            assert!(v >= 0.0);
        }
    }
}
