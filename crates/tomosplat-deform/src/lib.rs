//! Time-conditioned deformation of a Gaussian set: a multires hexplane
//! feature grid, a small decoder network and a learnable cycle period.

pub mod hexplane;
pub mod network;

use burn::{
    config::Config,
    module::{Module, Param},
    tensor::{ElementConversion, Tensor, TensorData, backend::Backend},
};
use hexplane::{HexPlaneConfig, HexPlaneField};
use network::{DeformNetwork, DeformNetworkConfig};
use tracing::trace_span;

/// Training stage. The coarse stage fits a static volume; the deformation
/// field only participates in the fine stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Coarse,
    Fine,
}

#[derive(Config, Debug)]
pub struct DeformationConfig {
    pub grid: HexPlaneConfig,
    #[config(default = 64)]
    pub net_width: usize,
    #[config(default = 1)]
    pub net_depth: usize,
    /// Initial cycle period in normalized scan time.
    #[config(default = 1.0)]
    pub period_init: f32,
    #[config(default = true)]
    pub deform_positions: bool,
    #[config(default = true)]
    pub deform_scales: bool,
    #[config(default = true)]
    pub deform_rotations: bool,
    /// Density changes over time are off by default; attenuation is usually
    /// carried by motion alone.
    #[config(default = false)]
    pub deform_densities: bool,
}

impl DeformationConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeformationField<B> {
        let net = DeformNetworkConfig::new(self.grid.output_dim())
            .with_width(self.net_width)
            .with_depth(self.net_depth)
            .init(device);
        DeformationField {
            grid: self.grid.init(device),
            net,
            log_period: Param::from_tensor(Tensor::from_data(
                TensorData::new(vec![self.period_init.ln()], [1]),
                device,
            )),
            deform_positions: self.deform_positions,
            deform_scales: self.deform_scales,
            deform_rotations: self.deform_rotations,
            deform_densities: self.deform_densities,
        }
    }
}

/// Pre-activation Gaussian parameters after deformation to one time instant.
#[derive(Debug, Clone)]
pub struct DeformedGaussians<B: Backend> {
    pub means: Tensor<B, 2>,
    pub log_scales: Tensor<B, 2>,
    pub rotations: Tensor<B, 2>,
    pub raw_densities: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct DeformationField<B: Backend> {
    pub grid: HexPlaneField<B>,
    pub net: DeformNetwork<B>,
    /// Log of the physiological cycle period, learned alongside the field.
    pub log_period: Param<Tensor<B, 1>>,
    deform_positions: bool,
    deform_scales: bool,
    deform_rotations: bool,
    deform_densities: bool,
}

impl<B: Backend> DeformationField<B> {
    /// Current cycle period as a plain scalar. Only for control flow; the
    /// differentiable path runs through [`Self::evaluate`].
    pub fn period(&self) -> f32 {
        self.log_period.val().exp().into_scalar().elem::<f32>()
    }

    /// Deform the pre-activation parameters to scan time `time`. Offsets are
    /// added to the raw parameters; activations stay with the caller. In the
    /// coarse stage this is the identity.
    pub fn evaluate(
        &self,
        means: Tensor<B, 2>,
        log_scales: Tensor<B, 2>,
        rotations: Tensor<B, 2>,
        raw_densities: Tensor<B, 2>,
        time: f32,
        stage: Stage,
    ) -> DeformedGaussians<B> {
        if stage == Stage::Coarse {
            return DeformedGaussians {
                means,
                log_scales,
                rotations,
                raw_densities,
            };
        }

        let _span = trace_span!("deform_evaluate").entered();
        let n = means.dims()[0];
        let device = means.device();

        // Fold scan time into the learned cycle. fract keeps the gradient
        // path to log_period through the division.
        let period = self.log_period.val().exp();
        let t = Tensor::<B, 1>::from_data(TensorData::new(vec![time], [1]), &device);
        let raw = t / period;
        let phase = raw.clone() - raw.floor();

        let features = self.grid.forward(means.clone(), phase.expand([n]));
        let offsets = self.net.forward(features);

        DeformedGaussians {
            means: if self.deform_positions {
                means + offsets.position
            } else {
                means
            },
            log_scales: if self.deform_scales {
                log_scales + offsets.log_scale
            } else {
                log_scales
            },
            rotations: if self.deform_rotations {
                rotations + offsets.rotation
            } else {
                rotations
            },
            raw_densities: if self.deform_densities {
                raw_densities + offsets.density
            } else {
                raw_densities
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    fn tiny_field(device: &<B as Backend>::Device) -> DeformationField<B> {
        let grid = HexPlaneConfig::new()
            .with_feature_dim(4)
            .with_resolution([8, 8, 8, 6])
            .with_multires(vec![1, 2]);
        DeformationConfig::new(grid)
            .with_net_width(16)
            .init(device)
    }

    fn random_params(
        n: usize,
        device: &<B as Backend>::Device,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        (
            Tensor::random([n, 3], Distribution::Uniform(-1.0, 1.0), device),
            Tensor::random([n, 3], Distribution::Uniform(-3.0, -1.0), device),
            Tensor::random([n, 4], Distribution::Default, device),
            Tensor::random([n, 1], Distribution::Uniform(0.0, 1.0), device),
        )
    }

    #[test]
    fn coarse_stage_is_identity() {
        let device = Default::default();
        let field = tiny_field(&device);
        let (means, log_scales, rotations, raw_densities) = random_params(7, &device);

        let out = field.evaluate(
            means.clone(),
            log_scales.clone(),
            rotations.clone(),
            raw_densities.clone(),
            0.4,
            Stage::Coarse,
        );

        assert!(out.means.equal(means).all().into_scalar());
        assert!(out.log_scales.equal(log_scales).all().into_scalar());
        assert!(out.rotations.equal(rotations).all().into_scalar());
        assert!(out.raw_densities.equal(raw_densities).all().into_scalar());
    }

    #[test]
    fn fine_stage_keeps_shapes() {
        let device = Default::default();
        let field = tiny_field(&device);
        let (means, log_scales, rotations, raw_densities) = random_params(7, &device);

        let out = field.evaluate(means, log_scales, rotations, raw_densities, 0.4, Stage::Fine);
        assert_eq!(out.means.dims(), [7, 3]);
        assert_eq!(out.log_scales.dims(), [7, 3]);
        assert_eq!(out.rotations.dims(), [7, 4]);
        assert_eq!(out.raw_densities.dims(), [7, 1]);
    }

    #[test]
    fn densities_stay_static_by_default() {
        let device = Default::default();
        let field = tiny_field(&device);
        let (means, log_scales, rotations, raw_densities) = random_params(5, &device);

        let out = field.evaluate(
            means,
            log_scales,
            rotations,
            raw_densities.clone(),
            0.4,
            Stage::Fine,
        );
        assert!(out.raw_densities.equal(raw_densities).all().into_scalar());
    }

    #[test]
    fn disabled_position_head_leaves_means_untouched() {
        let device = Default::default();
        let grid = HexPlaneConfig::new()
            .with_feature_dim(4)
            .with_resolution([8, 8, 8, 6])
            .with_multires(vec![1]);
        let field: DeformationField<B> = DeformationConfig::new(grid)
            .with_net_width(16)
            .with_deform_positions(false)
            .init(&device);
        let (means, log_scales, rotations, raw_densities) = random_params(5, &device);

        let out = field.evaluate(
            means.clone(),
            log_scales,
            rotations,
            raw_densities,
            0.4,
            Stage::Fine,
        );
        assert!(out.means.equal(means).all().into_scalar());
    }

    #[test]
    fn period_starts_at_configured_value() {
        let device = Default::default();
        let grid = HexPlaneConfig::new()
            .with_feature_dim(4)
            .with_resolution([8, 8, 8, 6])
            .with_multires(vec![1]);
        let field: DeformationField<B> = DeformationConfig::new(grid)
            .with_period_init(0.5)
            .init(&device);
        assert!((field.period() - 0.5).abs() < 1e-6);
    }
}
