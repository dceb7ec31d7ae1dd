use burn::tensor::{
    Int, Tensor,
    backend::{AutodiffBackend, Backend},
};
use tomosplat_render::gaussian_splats::GaussianSet;

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPS: f64 = 1e-15;

/// Adam state for one Gaussian parameter array. Unlike the framework
/// optimizers this state can be reindexed, so densification can grow and
/// shrink the parameter arrays without losing momentum for survivors.
#[derive(Debug, Clone)]
pub struct ParamAdam<B: Backend> {
    pub moment1: Tensor<B, 2>,
    pub moment2: Tensor<B, 2>,
}

impl<B: Backend> ParamAdam<B> {
    pub fn new(shape: [usize; 2], device: &B::Device) -> Self {
        Self {
            moment1: Tensor::zeros(shape, device),
            moment2: Tensor::zeros(shape, device),
        }
    }

    pub fn from_moments(moment1: Tensor<B, 2>, moment2: Tensor<B, 2>) -> Self {
        assert_eq!(moment1.dims(), moment2.dims(), "moment shapes diverged");
        Self { moment1, moment2 }
    }

    /// One bias-corrected Adam update. `iteration` starts at 1.
    pub fn step(
        &mut self,
        iteration: i32,
        value: Tensor<B, 2>,
        grad: Tensor<B, 2>,
        lr: f64,
    ) -> Tensor<B, 2> {
        self.moment1 = self.moment1.clone() * BETA1 + grad.clone() * (1.0 - BETA1);
        self.moment2 = self.moment2.clone() * BETA2 + grad.powi_scalar(2) * (1.0 - BETA2);

        let m_hat = self.moment1.clone() / (1.0 - BETA1.powi(iteration));
        let v_hat = self.moment2.clone() / (1.0 - BETA2.powi(iteration));
        value - m_hat * lr / (v_hat.sqrt() + EPS)
    }

    /// Keep momentum rows at `indices` only.
    pub fn select(&mut self, indices: Tensor<B, 1, Int>) {
        self.moment1 = self.moment1.clone().select(0, indices.clone());
        self.moment2 = self.moment2.clone().select(0, indices);
    }

    /// Append `extra` rows of zero momentum for freshly created Gaussians.
    pub fn grow(&mut self, extra: usize) {
        let [_, cols] = self.moment1.dims();
        let device = self.moment1.device();
        let zeros = Tensor::zeros([extra, cols], &device);
        self.moment1 = Tensor::cat(vec![self.moment1.clone(), zeros.clone()], 0);
        self.moment2 = Tensor::cat(vec![self.moment2.clone(), zeros], 0);
    }
}

/// Per-parameter learning rates for one step.
#[derive(Debug, Clone, Copy)]
pub struct SplatLrs {
    pub means: f64,
    pub log_scales: f64,
    pub rotations: f64,
    pub raw_densities: f64,
}

/// Adam over the four Gaussian parameter arrays. Momentum lives on the inner
/// backend; the autodiff graph only exists within a single training step.
#[derive(Debug, Clone)]
pub struct SplatOptim<B: AutodiffBackend> {
    iteration: i32,
    pub means: ParamAdam<B::InnerBackend>,
    pub log_scales: ParamAdam<B::InnerBackend>,
    pub rotations: ParamAdam<B::InnerBackend>,
    pub raw_densities: ParamAdam<B::InnerBackend>,
}

impl<B: AutodiffBackend> SplatOptim<B> {
    pub fn new(splats: &GaussianSet<B>) -> Self {
        let n = splats.num_gaussians();
        let device = splats.device();
        Self {
            iteration: 0,
            means: ParamAdam::new([n, 3], &device),
            log_scales: ParamAdam::new([n, 3], &device),
            rotations: ParamAdam::new([n, 4], &device),
            raw_densities: ParamAdam::new([n, 1], &device),
        }
    }

    pub fn from_parts(
        iteration: i32,
        means: ParamAdam<B::InnerBackend>,
        log_scales: ParamAdam<B::InnerBackend>,
        rotations: ParamAdam<B::InnerBackend>,
        raw_densities: ParamAdam<B::InnerBackend>,
    ) -> Self {
        Self {
            iteration,
            means,
            log_scales,
            rotations,
            raw_densities,
        }
    }

    pub fn iteration(&self) -> i32 {
        self.iteration
    }

    /// Apply one update and return the set with fresh leaf tensors.
    /// Parameters that received no gradient this step are left untouched.
    pub fn step(
        &mut self,
        lrs: SplatLrs,
        splats: &GaussianSet<B>,
        grads: &B::Gradients,
    ) -> GaussianSet<B> {
        self.iteration += 1;
        let t = self.iteration;

        let means = match splats.means.grad(grads) {
            Some(g) => self.means.step(t, splats.means.clone().inner(), g, lrs.means),
            None => splats.means.clone().inner(),
        };
        let log_scales = match splats.log_scales.grad(grads) {
            Some(g) => {
                self.log_scales
                    .step(t, splats.log_scales.clone().inner(), g, lrs.log_scales)
            }
            None => splats.log_scales.clone().inner(),
        };
        let rotations = match splats.rotations.grad(grads) {
            Some(g) => {
                self.rotations
                    .step(t, splats.rotations.clone().inner(), g, lrs.rotations)
            }
            None => splats.rotations.clone().inner(),
        };
        let raw_densities = match splats.raw_densities.grad(grads) {
            Some(g) => self.raw_densities.step(
                t,
                splats.raw_densities.clone().inner(),
                g,
                lrs.raw_densities,
            ),
            None => splats.raw_densities.clone().inner(),
        };

        GaussianSet::from_tensors(
            Tensor::from_inner(means),
            Tensor::from_inner(log_scales),
            Tensor::from_inner(rotations),
            Tensor::from_inner(raw_densities),
        )
    }

    /// Reindex all momentum to the surviving Gaussians.
    pub fn select(&mut self, indices: Tensor<B::InnerBackend, 1, Int>) {
        self.means.select(indices.clone());
        self.log_scales.select(indices.clone());
        self.rotations.select(indices.clone());
        self.raw_densities.select(indices);
    }

    /// Zero momentum for `extra` appended Gaussians.
    pub fn grow(&mut self, extra: usize) {
        self.means.grow(extra);
        self.log_scales.grow(extra);
        self.rotations.grow(extra);
        self.raw_densities.grow(extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type B = Autodiff<NdArray>;

    #[test]
    fn adam_descends_a_quadratic() {
        let device = Default::default();
        let mut state = ParamAdam::<NdArray>::new([1, 1], &device);
        let mut x = Tensor::<NdArray, 2>::from_data(TensorData::new(vec![1.0f32], [1, 1]), &device);
        for t in 1..=300 {
            let grad = x.clone() * 2.0;
            x = state.step(t, x, grad, 0.02);
        }
        let v: f32 = x.into_scalar();
        assert!(v.abs() < 0.05, "did not converge, x = {v}");
    }

    #[test]
    fn step_updates_only_params_with_gradients() {
        let device = Default::default();
        let splats = GaussianSet::<B>::from_seed(
            vec![0.5, 0.0, 0.0, 0.0, 0.5, 0.0],
            vec![1.0, 1.0],
            Some(0.1),
            &device,
        )
        .unwrap();
        let mut optim = SplatOptim::new(&splats);

        // Loss only touches the means.
        let loss = splats.means.clone().powi_scalar(2).sum();
        let grads = loss.backward();

        let before_scales = splats.log_scales.clone().into_data();
        let lrs = SplatLrs {
            means: 0.1,
            log_scales: 0.1,
            rotations: 0.1,
            raw_densities: 0.1,
        };
        let stepped = optim.step(lrs, &splats, &grads);

        let means_moved = stepped
            .means
            .clone()
            .inner()
            .not_equal(splats.means.clone().inner())
            .any()
            .into_scalar();
        assert!(means_moved);
        stepped
            .log_scales
            .clone()
            .into_data()
            .assert_eq(&before_scales, true);
        assert_eq!(optim.iteration(), 1);
    }

    #[test]
    fn select_and_grow_track_array_length() {
        let device = Default::default();
        let splats = GaussianSet::<B>::from_seed(
            (0..30).map(|i| i as f32 * 0.1).collect(),
            vec![1.0; 10],
            Some(0.1),
            &device,
        )
        .unwrap();
        let mut optim = SplatOptim::new(&splats);

        let keep = Tensor::<NdArray, 1, Int>::from_data(
            TensorData::new(vec![0i64, 3, 7], [3]),
            &device,
        );
        optim.select(keep);
        assert_eq!(optim.means.moment1.dims(), [3, 3]);

        optim.grow(5);
        assert_eq!(optim.means.moment1.dims(), [8, 3]);
        assert_eq!(optim.raw_densities.moment2.dims(), [8, 1]);
    }
}
