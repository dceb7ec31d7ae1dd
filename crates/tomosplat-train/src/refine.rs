use crate::optim::SplatOptim;
use burn::tensor::{
    Distribution, Int, Tensor, TensorData,
    backend::{AutodiffBackend, Backend},
};
use tomosplat_render::{gaussian_splats::GaussianSet, quat_scale_to_basis};
use tracing::trace_span;

/// Scale divisor applied to both children of a split.
const SPLIT_SCALE_DIV: f32 = 1.6;

/// Densification thresholds. Fractional thresholds are relative to the scene
/// extent (half-diagonal of the reconstruction volume).
#[derive(Debug, Clone)]
pub struct RefineConfig {
    /// Mean positional gradient above which a Gaussian grows.
    pub grad_threshold: f32,
    /// Growing Gaussians larger than this fraction of the extent split,
    /// smaller ones clone.
    pub split_scale_fraction: f32,
    /// Gaussians with activated density below this are pruned.
    pub min_density: f32,
    /// Gaussians with a projected radius above this many pixels are pruned.
    pub max_screen_size: f32,
    /// Gaussians larger than this fraction of the extent are pruned.
    pub max_scale_fraction: f32,
    /// Hard cap on the total number of Gaussians.
    pub max_gaussians: usize,
}

/// Positional gradient and screen-size statistics accumulated between
/// refinement rounds. Lengths track the Gaussian set; a densification resets
/// them to zero at the new size.
#[derive(Debug, Clone)]
pub struct RefineStats<B: Backend> {
    grad_accum: Tensor<B, 1>,
    denom: Tensor<B, 1>,
    max_radii: Tensor<B, 1>,
}

impl<B: Backend> RefineStats<B> {
    pub fn new(n: usize, device: &B::Device) -> Self {
        Self {
            grad_accum: Tensor::zeros([n], device),
            denom: Tensor::zeros([n], device),
            max_radii: Tensor::zeros([n], device),
        }
    }

    pub fn len(&self) -> usize {
        self.grad_accum.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record one render: the positional gradient norm of every visible
    /// Gaussian and its projected radius.
    pub fn accumulate(
        &mut self,
        mean_grads: Tensor<B, 2>,
        radii: Tensor<B, 1>,
        visible: Tensor<B, 1>,
    ) {
        let n = self.len();
        assert_eq!(mean_grads.dims()[0], n, "stats length diverged");

        let norms = mean_grads.powi_scalar(2).sum_dim(1).sqrt().reshape([n]);
        self.grad_accum = self.grad_accum.clone() + norms * visible.clone();
        self.denom = self.denom.clone() + visible;
        self.max_radii = self.max_radii.clone().max_pair(radii);
    }

    /// Average positional gradient over the renders each Gaussian was
    /// visible in.
    pub fn average_grad(&self) -> Tensor<B, 1> {
        self.grad_accum.clone() / self.denom.clone().clamp_min(1.0)
    }

    pub fn max_radii(&self) -> Tensor<B, 1> {
        self.max_radii.clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefineSummary {
    pub split: usize,
    pub cloned: usize,
    pub pruned: usize,
    pub final_count: usize,
}

fn to_host<B: Backend>(t: Tensor<B, 1>) -> Vec<f32> {
    t.into_data()
        .into_vec::<f32>()
        .expect("refine stats are float tensors")
}

fn int_tensor<B: Backend>(idx: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::from_data(TensorData::new(idx.to_vec(), [idx.len()]), device)
}

/// Two jittered children per selected Gaussian, sampled from the parent's
/// covariance, with scales shrunk by [`SPLIT_SCALE_DIV`].
fn split_children<B: AutodiffBackend>(sel: &GaussianSet<B>) -> GaussianSet<B> {
    let k = sel.num_gaussians();
    let device = sel.device();
    let basis = quat_scale_to_basis(sel.rotations_normed(), sel.scales());

    let child = || {
        let noise = Tensor::random([k, 3, 1], Distribution::Normal(0.0, 1.0), &device);
        let offsets = basis.clone().matmul(noise).reshape([k, 3]);
        GaussianSet::from_tensors(
            sel.means.clone() + offsets,
            sel.log_scales.clone() - SPLIT_SCALE_DIV.ln(),
            sel.rotations.clone(),
            sel.raw_densities.clone(),
        )
    };
    child().concat(&child())
}

/// One refinement round: split high-gradient large Gaussians, clone
/// high-gradient small ones, prune transparent and oversized ones. The
/// optimizer is reindexed alongside; fresh Gaussians start with zero
/// momentum. Returns the new set, which the caller must pair with a stats
/// reset at the new size.
pub fn densify_and_prune<B: AutodiffBackend>(
    splats: GaussianSet<B>,
    optim: &mut SplatOptim<B>,
    stats: &RefineStats<B::InnerBackend>,
    config: &RefineConfig,
    extent: f32,
) -> (GaussianSet<B>, RefineSummary) {
    let _span = trace_span!("densify_and_prune").entered();

    let n = splats.num_gaussians();
    assert_eq!(stats.len(), n, "refine stats out of sync with the splats");

    let avg_grad = to_host(stats.average_grad());
    let max_radii = to_host(stats.max_radii());
    let scale_max = to_host(
        splats
            .log_scales
            .clone()
            .inner()
            .exp()
            .max_dim(1)
            .reshape([n]),
    );
    let density = to_host(splats.densities().inner().reshape([n]));

    let split_above = config.split_scale_fraction * extent;
    let prune_above = config.max_scale_fraction * extent;

    let mut survivors: Vec<i64> = Vec::with_capacity(n);
    let mut split_idx: Vec<i64> = vec![];
    let mut clone_idx: Vec<i64> = vec![];
    let mut pruned = 0;
    for i in 0..n {
        let prune = density[i] < config.min_density
            || max_radii[i] > config.max_screen_size
            || scale_max[i] > prune_above;
        if prune {
            pruned += 1;
            continue;
        }
        let grow = avg_grad[i] > config.grad_threshold;
        if grow && scale_max[i] > split_above {
            // Parent is replaced by its children.
            split_idx.push(i as i64);
            continue;
        }
        if grow {
            clone_idx.push(i as i64);
        }
        survivors.push(i as i64);
    }

    // Ration new growth against the cap, preferring the highest-gradient
    // candidates. Parents of rationed-out splits stay alive as survivors.
    let by_grad_desc = |idx: &mut Vec<i64>| {
        idx.sort_by(|&a, &b| {
            avg_grad[b as usize]
                .partial_cmp(&avg_grad[a as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    };
    let mut budget = config.max_gaussians.saturating_sub(survivors.len());
    by_grad_desc(&mut split_idx);
    let kept_splits = (budget / 2).min(split_idx.len());
    survivors.extend_from_slice(&split_idx[kept_splits..]);
    split_idx.truncate(kept_splits);
    budget = budget.saturating_sub(split_idx.len() * 2);
    by_grad_desc(&mut clone_idx);
    clone_idx.truncate(budget);

    let device = splats.device();
    let mut out = splats.select(int_tensor(&survivors, &device));
    optim.select(int_tensor(&survivors, &device));

    let mut grown = 0;
    if !clone_idx.is_empty() {
        let clones = splats.select(int_tensor(&clone_idx, &device));
        out = out.concat(&clones);
        grown += clone_idx.len();
    }
    if !split_idx.is_empty() {
        let children = split_children(&splats.select(int_tensor(&split_idx, &device)));
        out = out.concat(&children);
        grown += split_idx.len() * 2;
    }
    optim.grow(grown);

    // Hard cap on the whole population: drop the lowest-density Gaussians
    // until the count is back at the cap.
    if out.num_gaussians() > config.max_gaussians {
        let n_out = out.num_gaussians();
        let dens = to_host(out.densities().inner().reshape([n_out]));
        let mut order: Vec<i64> = (0..n_out as i64).collect();
        order.sort_by(|&a, &b| {
            dens[b as usize]
                .partial_cmp(&dens[a as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(config.max_gaussians);
        order.sort_unstable();
        pruned += n_out - order.len();
        out = out.select(int_tensor(&order, &device));
        optim.select(int_tensor(&order, &device));
    }

    let summary = RefineSummary {
        split: split_idx.len(),
        cloned: clone_idx.len(),
        pruned,
        final_count: out.num_gaussians(),
    };
    log::info!(
        "Refined splats: {} split, {} cloned, {} pruned, {} total",
        summary.split,
        summary.cloned,
        summary.pruned,
        summary.final_count
    );
    (out, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray>;
    type Inner = NdArray;

    fn test_splats(device: &<B as Backend>::Device) -> GaussianSet<B> {
        // Two Gaussians: one large (scale 0.5), one small (scale 0.01).
        let set = GaussianSet::<B>::from_seed(
            vec![0.0, 0.0, 0.0, 0.5, 0.5, 0.5],
            vec![1.0, 1.0],
            Some(0.5),
            device,
        )
        .unwrap();
        let mut log_scales = vec![0.5f32.ln(); 3];
        log_scales.extend(vec![0.01f32.ln(); 3]);
        GaussianSet::from_tensors(
            set.means.clone(),
            Tensor::from_data(TensorData::new(log_scales, [2, 3]), device),
            set.rotations.clone(),
            set.raw_densities.clone(),
        )
    }

    fn stats_with_grads(grads: &[f32], device: &<B as Backend>::Device) -> RefineStats<Inner> {
        let n = grads.len();
        let mut stats = RefineStats::<Inner>::new(n, device);
        let per_axis: Vec<f32> = grads.iter().flat_map(|&g| [g, 0.0, 0.0]).collect();
        stats.accumulate(
            Tensor::from_data(TensorData::new(per_axis, [n, 3]), device),
            Tensor::zeros([n], device),
            Tensor::ones([n], device),
        );
        stats
    }

    fn config() -> RefineConfig {
        RefineConfig {
            grad_threshold: 1e-4,
            split_scale_fraction: 0.1,
            min_density: 1e-5,
            max_screen_size: 1e9,
            max_scale_fraction: 1e9,
            max_gaussians: 1000,
        }
    }

    #[test]
    fn high_grad_large_gaussian_splits_small_one_clones() {
        let device = Default::default();
        let splats = test_splats(&device);
        let mut optim = SplatOptim::new(&splats);
        let stats = stats_with_grads(&[1.0, 1.0], &device);

        // Extent 1: Gaussian 0 (scale 0.5) is above the 0.1 split fraction,
        // Gaussian 1 (scale 0.01) is below and clones.
        let (out, summary) = densify_and_prune(splats, &mut optim, &stats, &config(), 1.0);
        assert_eq!(summary.split, 1);
        assert_eq!(summary.cloned, 1);
        assert_eq!(summary.pruned, 0);
        // Survivor (clone parent) + its clone + two children.
        assert_eq!(out.num_gaussians(), 4);
        assert_eq!(optim.means.moment1.dims()[0], 4);
    }

    #[test]
    fn quiet_gaussians_are_left_alone() {
        let device = Default::default();
        let splats = test_splats(&device);
        let mut optim = SplatOptim::new(&splats);
        let stats = stats_with_grads(&[0.0, 0.0], &device);

        let (out, summary) = densify_and_prune(splats, &mut optim, &stats, &config(), 1.0);
        assert_eq!(out.num_gaussians(), 2);
        assert_eq!(summary.split + summary.cloned + summary.pruned, 0);
    }

    #[test]
    fn cap_blocks_growth() {
        let device = Default::default();
        let splats = test_splats(&device);
        let mut optim = SplatOptim::new(&splats);
        let stats = stats_with_grads(&[1.0, 1.0], &device);

        let mut cfg = config();
        cfg.max_gaussians = 2;
        let (out, summary) = densify_and_prune(splats, &mut optim, &stats, &cfg, 1.0);
        assert_eq!(out.num_gaussians(), 2);
        assert_eq!(summary.split, 0);
    }

    #[test]
    fn cap_drops_lowest_density_gaussians() {
        let device = Default::default();
        // Three Gaussians with descending densities.
        let splats = GaussianSet::<B>::from_seed(
            vec![0.0, 0.0, 0.0, 0.5, 0.0, 0.0, -0.5, 0.0, 0.0],
            vec![1.0, 0.5, 0.2],
            Some(0.1),
            &device,
        )
        .unwrap();
        let mut optim = SplatOptim::new(&splats);
        let stats = stats_with_grads(&[0.0, 0.0, 0.0], &device);

        let mut cfg = config();
        cfg.max_gaussians = 2;
        let (out, summary) = densify_and_prune(splats, &mut optim, &stats, &cfg, 1.0);

        assert_eq!(out.num_gaussians(), 2);
        assert_eq!(summary.pruned, 1);
        assert_eq!(optim.means.moment1.dims()[0], 2);
        // The faintest Gaussian is the one that goes.
        let dens = out
            .densities()
            .inner()
            .into_data()
            .into_vec::<f32>()
            .unwrap();
        assert!(dens.iter().all(|&d| (d - 0.2).abs() > 1e-3), "{dens:?}");
    }

    #[test]
    fn zero_density_threshold_prunes_nothing() {
        let device = Default::default();
        let splats = test_splats(&device);
        let mut optim = SplatOptim::new(&splats);
        let stats = stats_with_grads(&[0.0, 0.0], &device);

        let mut cfg = config();
        cfg.min_density = 0.0;
        let (out, summary) = densify_and_prune(splats, &mut optim, &stats, &cfg, 1.0);
        // Activated densities are never negative, so nothing falls below 0.
        assert_eq!(out.num_gaussians(), 2);
        assert_eq!(summary.pruned, 0);
    }

    #[test]
    fn transparent_gaussians_are_pruned() {
        let device = Default::default();
        let base = test_splats(&device);
        // Push Gaussian 1's density to effectively zero.
        let raw = Tensor::from_data(
            TensorData::new(vec![1.0f32, -30.0], [2, 1]),
            &device,
        );
        let splats = GaussianSet::from_tensors(
            base.means.clone(),
            base.log_scales.clone(),
            base.rotations.clone(),
            raw,
        );
        let mut optim = SplatOptim::new(&splats);
        let stats = stats_with_grads(&[0.0, 0.0], &device);

        let (out, summary) = densify_and_prune(splats, &mut optim, &stats, &config(), 1.0);
        assert_eq!(summary.pruned, 1);
        assert_eq!(out.num_gaussians(), 1);
    }
}
