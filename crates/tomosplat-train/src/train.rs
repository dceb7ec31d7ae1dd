use crate::{
    checkpoint,
    config::TrainConfig,
    eval::EvalReport,
    lr_schedule::ExponLr,
    optim::{SplatLrs, SplatOptim},
    refine::{RefineStats, RefineSummary, densify_and_prune},
    ssim::Ssim,
};
use burn::{
    module::Param,
    optim::{Adam, AdamConfig, GradientsParams, Optimizer, adaptor::OptimizerAdaptor},
    tensor::{ElementConversion, Tensor, activation::softplus, backend::AutodiffBackend},
};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::path::{Path, PathBuf};
use tomosplat_dataset::Scene;
use tomosplat_deform::{DeformationField, Stage, hexplane::HexPlaneField, network::DeformNetwork};
use tomosplat_render::{
    CovSource,
    camera::Camera,
    gaussian_splats::{GaussianSet, norm_vec},
    rasterize::rasterize,
};
use tracing::trace_span;

#[derive(Debug, Clone)]
pub struct TrainStats {
    pub iter: u32,
    pub stage: Stage,
    pub loss: f32,
    pub num_gaussians: usize,
    pub refine: Option<RefineSummary>,
}

/// Owns the whole optimization: the Gaussian set, the deformation field,
/// their optimizers and the refinement bookkeeping. The scene stays plain
/// data; one [`Trainer::step`] consumes one training view.
pub struct Trainer<B: AutodiffBackend> {
    pub config: TrainConfig,
    pub scene: Scene,
    pub splats: GaussianSet<B>,
    pub deform: DeformationField<B>,

    optim: SplatOptim<B>,
    grid_optim: OptimizerAdaptor<Adam, HexPlaneField<B>, B>,
    net_optim: OptimizerAdaptor<Adam, DeformNetwork<B>, B>,
    period_optim: OptimizerAdaptor<Adam, Param<Tensor<B, 1>>, B>,

    stats: RefineStats<B::InnerBackend>,
    sched_means: ExponLr,
    sched_grid: ExponLr,
    sched_net: ExponLr,
    ssim: Ssim<B>,

    iter: u32,
    view_queue: Vec<usize>,
    rng: StdRng,
    extent: f32,
    max_time: f32,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        config: TrainConfig,
        scene: Scene,
        splats: GaussianSet<B>,
        deform: DeformationField<B>,
        device: &B::Device,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        anyhow::ensure!(
            !scene.train_views.is_empty(),
            "scene '{}' has no training views",
            scene.name
        );
        B::seed(config.seed);

        let extent = scene.scanner.extent();
        let max_time = scene
            .train_views
            .iter()
            .map(|v| v.camera.time)
            .fold(0.0, f32::max);

        let adam = AdamConfig::new().with_epsilon(1e-15);
        let optim = SplatOptim::new(&splats);
        let stats = RefineStats::new(splats.num_gaussians(), device);

        let sched_means = ExponLr::new(
            config.lr_means * extent as f64,
            config.lr_means_end * extent as f64,
            config.total_steps,
        )
        .with_delay(config.lr_delay_steps, config.lr_delay_mult);
        let sched_grid = ExponLr::new(config.lr_grid, config.lr_grid_end, config.total_steps);
        let sched_net = ExponLr::new(config.lr_net, config.lr_net_end, config.total_steps);

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            scene,
            splats,
            deform,
            optim,
            grid_optim: adam.init(),
            net_optim: adam.init(),
            period_optim: adam.init(),
            stats,
            sched_means,
            sched_grid,
            sched_net,
            ssim: Ssim::new(11, device),
            iter: 0,
            view_queue: vec![],
            extent,
            max_time,
            device: device.clone(),
        })
    }

    /// Swap in state loaded from a checkpoint and continue from `iteration`.
    pub fn restore(
        &mut self,
        splats: GaussianSet<B>,
        optim: SplatOptim<B>,
        deform: DeformationField<B>,
        iteration: u32,
    ) {
        self.stats = RefineStats::new(splats.num_gaussians(), &self.device);
        self.splats = splats;
        self.optim = optim;
        self.deform = deform;
        self.iter = iteration;
        self.view_queue.clear();
    }

    pub fn iter(&self) -> u32 {
        self.iter
    }

    pub fn is_done(&self) -> bool {
        self.iter >= self.config.total_steps
    }

    pub fn stage(&self) -> Stage {
        if self.iter < self.config.coarse_steps {
            Stage::Coarse
        } else {
            Stage::Fine
        }
    }

    fn next_view(&mut self) -> (Camera, burn::tensor::TensorData) {
        if self.view_queue.is_empty() {
            self.view_queue = (0..self.scene.train_views.len()).collect();
            self.view_queue.shuffle(&mut self.rng);
        }
        let idx = self.view_queue.pop().expect("queue was just refilled");
        let view = &self.scene.train_views[idx];
        (view.camera.clone(), view.projection.clone())
    }

    /// Render the splats deformed to `time` through `camera`.
    fn render(&self, camera: &Camera, time: f32, stage: Stage) -> tomosplat_render::rasterize::RenderOutput<B> {
        let deformed = self.deform.evaluate(
            self.splats.means.clone(),
            self.splats.log_scales.clone(),
            self.splats.rotations.clone(),
            self.splats.raw_densities.clone(),
            time,
            stage,
        );
        rasterize(
            camera,
            deformed.means,
            CovSource::ScaleRotation {
                scales: deformed.log_scales.exp(),
                rotations: norm_vec(deformed.rotations),
            },
            softplus(deformed.raw_densities, 1.0),
        )
    }

    /// Scan time one physiological cycle away from `time`, for the
    /// consistency prior. A period longer than the scan leaves no adjacent
    /// cycle to compare against, which is a configuration error.
    fn adjacent_cycle_time(&self, time: f32) -> anyhow::Result<f32> {
        let period = self.deform.period();
        if time + period <= self.max_time {
            Ok(time + period)
        } else if time - period >= 0.0 {
            Ok(time - period)
        } else {
            anyhow::bail!(
                "cycle period {period:.4} spans the whole scan (time range 0..{:.4}); \
                 no adjacent cycle exists for the consistency prior. Lower --period-init \
                 or set --period-prior-weight 0.",
                self.max_time
            )
        }
    }

    pub fn step(&mut self) -> anyhow::Result<TrainStats> {
        let _span = trace_span!("train_step").entered();

        let iter = self.iter;
        let stage = self.stage();
        let (camera, projection) = self.next_view();
        let gt = Tensor::<B, 2>::from_data(projection, &self.device);

        let out = self.render(&camera, camera.time, stage);
        let l1 = (out.image.clone() - gt.clone()).abs().mean();
        let mut loss =
            l1 + self.ssim.dssim(out.image.clone(), gt.clone()) * self.config.ssim_weight;

        if stage == Stage::Fine {
            if self.config.tv_weight > 0.0 {
                loss = loss + self.deform.grid.tv_loss() * self.config.tv_weight;
            }
            if self.config.time_smoothness_weight > 0.0 {
                loss = loss
                    + self.deform.grid.time_smoothness() * self.config.time_smoothness_weight;
            }
            if self.config.l1_time_weight > 0.0 {
                loss = loss + self.deform.grid.l1_time() * self.config.l1_time_weight;
            }
            if self.config.period_prior_weight > 0.0 {
                // The same view rendered one cycle away must explain the
                // same measurement.
                let prior_time = self.adjacent_cycle_time(camera.time)?;
                let prior = self.render(&camera, prior_time, stage);
                loss = loss
                    + (prior.image - gt).abs().mean() * self.config.period_prior_weight;
            }
        }

        let loss_val: f32 = loss.clone().into_scalar().elem();
        let mut grads = loss.backward();

        if let Some(mean_grads) = self.splats.means.grad(&grads) {
            self.stats.accumulate(
                mean_grads,
                out.aux.radii.clone().inner(),
                out.aux.visibility_filter().float().inner(),
            );
        }

        let lrs = SplatLrs {
            means: self.sched_means.lr(iter),
            log_scales: self.config.lr_scales,
            rotations: self.config.lr_rotations,
            raw_densities: self.config.lr_densities,
        };
        self.splats = self.optim.step(lrs, &self.splats, &grads);

        if stage == Stage::Fine {
            let grid_grads = GradientsParams::from_module(&mut grads, &self.deform.grid);
            self.deform.grid =
                self.grid_optim
                    .step(self.sched_grid.lr(iter), self.deform.grid.clone(), grid_grads);

            let net_grads = GradientsParams::from_module(&mut grads, &self.deform.net);
            self.deform.net =
                self.net_optim
                    .step(self.sched_net.lr(iter), self.deform.net.clone(), net_grads);

            let period_grads = GradientsParams::from_module(&mut grads, &self.deform.log_period);
            self.deform.log_period = self.period_optim.step(
                self.config.lr_period,
                self.deform.log_period.clone(),
                period_grads,
            );
        }

        let refine = self.maybe_refine(iter);
        self.iter += 1;

        Ok(TrainStats {
            iter: self.iter,
            stage,
            loss: loss_val,
            num_gaussians: self.splats.num_gaussians(),
            refine,
        })
    }

    fn maybe_refine(&mut self, iter: u32) -> Option<RefineSummary> {
        let c = &self.config;
        let due = c.refine_every > 0
            && iter >= c.densify_from
            && iter < c.densify_until
            && iter % c.refine_every == 0;
        if !due {
            return None;
        }

        let (splats, summary) = densify_and_prune(
            self.splats.clone(),
            &mut self.optim,
            &self.stats,
            &c.refine_config(),
            self.extent,
        );
        self.splats = splats;
        self.stats = RefineStats::new(self.splats.num_gaussians(), &self.device);
        Some(summary)
    }

    pub fn eval(&self, export_dir: Option<&Path>) -> anyhow::Result<EvalReport> {
        crate::eval::eval_volumes(
            &self.splats,
            &self.deform,
            &self.scene,
            self.stage(),
            export_dir,
        )
    }

    pub fn checkpoint(&self, out_dir: &Path) -> anyhow::Result<PathBuf> {
        checkpoint::save(out_dir, self.iter, &self.splats, &self.optim, &self.deform)
    }
}
