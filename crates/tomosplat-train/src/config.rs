use crate::refine::RefineConfig;
use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tomosplat_deform::{DeformationConfig, hexplane::HexPlaneConfig};

#[derive(Clone, Debug, Parser, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Features stored per hexplane cell.
    #[arg(long, help_heading = "Model options", default_value = "32")]
    pub feature_dim: usize,

    /// Base grid resolution as x,y,z,t.
    #[arg(
        long,
        help_heading = "Model options",
        value_delimiter = ',',
        default_value = "64,64,64,150"
    )]
    pub grid_resolution: Vec<usize>,

    /// Spatial upsampling factors of the hexplane levels.
    #[arg(
        long,
        help_heading = "Model options",
        value_delimiter = ',',
        default_value = "1,2,4,8"
    )]
    pub multires: Vec<usize>,

    /// Half-width of the box the hexplane covers.
    #[arg(long, help_heading = "Model options", default_value = "1.6")]
    pub bounds: f32,

    /// Width of the deformation decoder.
    #[arg(long, help_heading = "Model options", default_value = "64")]
    pub net_width: usize,

    /// Hidden layers of the deformation decoder.
    #[arg(long, help_heading = "Model options", default_value = "1")]
    pub net_depth: usize,

    /// Initial physiological cycle period in normalized scan time.
    #[arg(long, help_heading = "Model options", default_value = "1.0")]
    pub period_init: f32,

    /// Keep Gaussian positions static over time.
    #[arg(long, help_heading = "Model options")]
    pub no_deform_positions: bool,

    /// Keep Gaussian scales static over time.
    #[arg(long, help_heading = "Model options")]
    pub no_deform_scales: bool,

    /// Keep Gaussian rotations static over time.
    #[arg(long, help_heading = "Model options")]
    pub no_deform_rotations: bool,

    /// Let Gaussian densities vary over time.
    #[arg(long, help_heading = "Model options")]
    pub deform_densities: bool,

    /// Lower bound of the KNN-derived seed scale, world units.
    #[arg(long, help_heading = "Model options", default_value = "1e-4")]
    pub scale_min: f32,

    /// Upper bound of the KNN-derived seed scale, world units.
    #[arg(long, help_heading = "Model options", default_value = "1.0")]
    pub scale_max: f32,

    /// Steps of static (coarse) training before the deformation kicks in.
    #[arg(long, help_heading = "Training options", default_value = "3000")]
    pub coarse_steps: u32,

    /// Total number of steps to train for.
    #[arg(long, help_heading = "Training options", default_value = "30000")]
    pub total_steps: u32,

    /// Weight of the DSSIM loss (relative to L1).
    #[arg(long, help_heading = "Training options", default_value = "0.2")]
    pub ssim_weight: f32,

    /// Weight of the spatial total variation of the hexplane.
    #[arg(long, help_heading = "Training options", default_value = "2e-4")]
    pub tv_weight: f32,

    /// Weight of the time-axis smoothness of the hexplane.
    #[arg(long, help_heading = "Training options", default_value = "1e-3")]
    pub time_smoothness_weight: f32,

    /// Weight of the L1 pull of the time planes towards identity.
    #[arg(long, help_heading = "Training options", default_value = "1e-4")]
    pub l1_time_weight: f32,

    /// Weight of the adjacent-cycle consistency prior.
    #[arg(long, help_heading = "Training options", default_value = "0.05")]
    pub period_prior_weight: f32,

    /// Start learning rate for the mean parameters, scaled by scene extent.
    #[arg(long, help_heading = "Training options", default_value = "1.6e-4")]
    pub lr_means: f64,

    /// Final learning rate for the mean parameters.
    #[arg(long, help_heading = "Training options", default_value = "1.6e-6")]
    pub lr_means_end: f64,

    /// Warmup steps for the mean learning rate (0 disables).
    #[arg(long, help_heading = "Training options", default_value = "0")]
    pub lr_delay_steps: u32,

    /// Damping of the mean learning rate at warmup start.
    #[arg(long, help_heading = "Training options", default_value = "0.01")]
    pub lr_delay_mult: f64,

    /// Learning rate for the scale parameters.
    #[arg(long, help_heading = "Training options", default_value = "5e-3")]
    pub lr_scales: f64,

    /// Learning rate for the rotation parameters.
    #[arg(long, help_heading = "Training options", default_value = "1e-3")]
    pub lr_rotations: f64,

    /// Learning rate for the density parameters.
    #[arg(long, help_heading = "Training options", default_value = "5e-2")]
    pub lr_densities: f64,

    /// Start learning rate of the hexplane grids.
    #[arg(long, help_heading = "Training options", default_value = "6.4e-3")]
    pub lr_grid: f64,

    /// Final learning rate of the hexplane grids.
    #[arg(long, help_heading = "Training options", default_value = "6.4e-5")]
    pub lr_grid_end: f64,

    /// Start learning rate of the deformation decoder.
    #[arg(long, help_heading = "Training options", default_value = "6.4e-4")]
    pub lr_net: f64,

    /// Final learning rate of the deformation decoder.
    #[arg(long, help_heading = "Training options", default_value = "6.4e-6")]
    pub lr_net_end: f64,

    /// Learning rate of the cycle period.
    #[arg(long, help_heading = "Training options", default_value = "1e-4")]
    pub lr_period: f64,

    /// RNG seed for view shuffling and densification jitter.
    #[arg(long, help_heading = "Training options", default_value = "42")]
    pub seed: u64,

    /// Steps between refinement rounds (0 disables densification).
    #[arg(long, help_heading = "Refine options", default_value = "100")]
    pub refine_every: u32,

    /// First step at which densification may run.
    #[arg(long, help_heading = "Refine options", default_value = "500")]
    pub densify_from: u32,

    /// Last step at which densification may run.
    #[arg(long, help_heading = "Refine options", default_value = "15000")]
    pub densify_until: u32,

    /// Mean positional gradient above which a Gaussian grows.
    #[arg(long, help_heading = "Refine options", default_value = "5e-5")]
    pub grad_threshold: f32,

    /// Scale fraction of the scene extent separating splits from clones.
    #[arg(long, help_heading = "Refine options", default_value = "0.01")]
    pub split_scale_fraction: f32,

    /// Gaussians below this activated density are pruned.
    #[arg(long, help_heading = "Refine options", default_value = "1e-5")]
    pub min_density: f32,

    /// Gaussians above this projected pixel radius are pruned.
    #[arg(long, help_heading = "Refine options", default_value = "20.0")]
    pub max_screen_size: f32,

    /// Gaussians above this scale fraction of the extent are pruned.
    #[arg(long, help_heading = "Refine options", default_value = "0.1")]
    pub max_scale_fraction: f32,

    /// Hard cap on the number of Gaussians.
    #[arg(long, help_heading = "Refine options", default_value = "500000")]
    pub max_gaussians: usize,

    /// Steps between evaluations (0 disables).
    #[arg(long, help_heading = "Eval options", default_value = "5000")]
    pub eval_every: u32,

    /// Steps between checkpoints (0 disables periodic checkpoints).
    #[arg(long, help_heading = "Eval options", default_value = "10000")]
    pub checkpoint_every: u32,

    /// Don't write reconstructed phase volumes during evaluation.
    #[arg(long, help_heading = "Eval options")]
    pub skip_volume_export: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::parse_from([""])
    }
}

impl TrainConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.grid_resolution.len() == 4,
            "--grid-resolution needs exactly 4 values (x,y,z,t), got {}",
            self.grid_resolution.len()
        );
        anyhow::ensure!(
            self.grid_resolution.iter().all(|&r| r >= 2),
            "--grid-resolution values must be at least 2, got {:?}",
            self.grid_resolution
        );
        anyhow::ensure!(!self.multires.is_empty(), "--multires must not be empty");
        anyhow::ensure!(
            self.multires.iter().all(|&m| m >= 1),
            "--multires factors must be at least 1, got {:?}",
            self.multires
        );
        anyhow::ensure!(
            0.0 < self.scale_min && self.scale_min < self.scale_max,
            "--scale-min ({}) must be positive and below --scale-max ({})",
            self.scale_min,
            self.scale_max
        );
        anyhow::ensure!(
            self.coarse_steps <= self.total_steps,
            "--coarse-steps ({}) exceeds --total-steps ({})",
            self.coarse_steps,
            self.total_steps
        );
        anyhow::ensure!(self.period_init > 0.0, "--period-init must be positive");
        Ok(())
    }

    pub fn refine_config(&self) -> RefineConfig {
        RefineConfig {
            grad_threshold: self.grad_threshold,
            split_scale_fraction: self.split_scale_fraction,
            min_density: self.min_density,
            max_screen_size: self.max_screen_size,
            max_scale_fraction: self.max_scale_fraction,
            max_gaussians: self.max_gaussians,
        }
    }

    pub fn deformation_config(&self) -> DeformationConfig {
        let grid = HexPlaneConfig::new()
            .with_feature_dim(self.feature_dim)
            .with_resolution([
                self.grid_resolution[0],
                self.grid_resolution[1],
                self.grid_resolution[2],
                self.grid_resolution[3],
            ])
            .with_multires(self.multires.clone())
            .with_bounds(self.bounds);
        DeformationConfig::new(grid)
            .with_net_width(self.net_width)
            .with_net_depth(self.net_depth)
            .with_period_init(self.period_init)
            .with_deform_positions(!self.no_deform_positions)
            .with_deform_scales(!self.no_deform_scales)
            .with_deform_rotations(!self.no_deform_rotations)
            .with_deform_densities(self.deform_densities)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing config to {path:?}"))?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading config from {path:?}"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Resume semantics: the saved config is the base, and any CLI value
    /// that differs from the built-in default wins over it.
    pub fn resume_from(path: &Path, cli: &Self) -> anyhow::Result<Self> {
        let mut base = serde_json::to_value(Self::load(path)?)?;
        let defaults = serde_json::to_value(Self::default())?;
        let cli_values = serde_json::to_value(cli)?;

        if let (Some(base), Some(defaults), Some(cli_values)) = (
            base.as_object_mut(),
            defaults.as_object(),
            cli_values.as_object(),
        ) {
            for (key, value) in cli_values {
                if defaults.get(key) != Some(value) {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(serde_json::from_value(base)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        TrainConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_resolution_is_rejected() {
        let mut config = TrainConfig::default();
        config.grid_resolution = vec![64, 64];
        assert!(config.validate().is_err());

        // Bilinear lookup needs at least two cells per plane axis.
        config.grid_resolution = vec![64, 64, 64, 1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn resume_keeps_saved_values_unless_cli_overrides() {
        let dir = std::env::temp_dir().join("tomosplat-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cfg_args.json");

        let mut saved = TrainConfig::default();
        saved.total_steps = 123;
        saved.ssim_weight = 0.5;
        saved.save(&path).unwrap();

        // CLI left at defaults: saved values stick.
        let merged = TrainConfig::resume_from(&path, &TrainConfig::default()).unwrap();
        assert_eq!(merged.total_steps, 123);
        assert_eq!(merged.ssim_weight, 0.5);

        // Explicit CLI value beats the saved one.
        let mut cli = TrainConfig::default();
        cli.total_steps = 999;
        let merged = TrainConfig::resume_from(&path, &cli).unwrap();
        assert_eq!(merged.total_steps, 999);
        assert_eq!(merged.ssim_weight, 0.5);
    }
}
