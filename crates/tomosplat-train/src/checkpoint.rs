use crate::optim::{ParamAdam, SplatOptim};
use anyhow::Context;
use burn::{
    module::Module,
    record::{BinFileRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder},
    tensor::{ElementConversion, Int, Tensor, TensorData, backend::AutodiffBackend, backend::Backend},
};
use std::path::{Path, PathBuf};
use tomosplat_deform::{DeformationConfig, DeformationField};
use tomosplat_render::gaussian_splats::GaussianSet;

pub const CHECKPOINT_SUBDIR: &str = "point_cloud";

/// Everything needed to resume the Gaussian side of training exactly:
/// parameters plus both Adam moments and the optimizer step count.
#[derive(Record)]
pub struct SplatState<B: Backend> {
    pub means: Tensor<B, 2>,
    pub log_scales: Tensor<B, 2>,
    pub rotations: Tensor<B, 2>,
    pub raw_densities: Tensor<B, 2>,
    pub m1_means: Tensor<B, 2>,
    pub m2_means: Tensor<B, 2>,
    pub m1_log_scales: Tensor<B, 2>,
    pub m2_log_scales: Tensor<B, 2>,
    pub m1_rotations: Tensor<B, 2>,
    pub m2_rotations: Tensor<B, 2>,
    pub m1_raw_densities: Tensor<B, 2>,
    pub m2_raw_densities: Tensor<B, 2>,
    pub adam_iteration: Tensor<B, 1, Int>,
}

pub fn checkpoint_dir(out_dir: &Path, iteration: u32) -> PathBuf {
    out_dir
        .join(CHECKPOINT_SUBDIR)
        .join(format!("iteration_{iteration}"))
}

/// Highest iteration with a saved checkpoint under `out_dir`, if any.
pub fn latest_iteration(out_dir: &Path) -> Option<u32> {
    let entries = std::fs::read_dir(out_dir.join(CHECKPOINT_SUBDIR)).ok()?;
    entries
        .filter_map(|e| {
            let name = e.ok()?.file_name().to_string_lossy().to_string();
            name.strip_prefix("iteration_")?.parse::<u32>().ok()
        })
        .max()
}

pub fn save<B: AutodiffBackend>(
    out_dir: &Path,
    iteration: u32,
    splats: &GaussianSet<B>,
    optim: &SplatOptim<B>,
    deform: &DeformationField<B>,
) -> anyhow::Result<PathBuf> {
    let dir = checkpoint_dir(out_dir, iteration);
    std::fs::create_dir_all(&dir)?;

    let device = splats.device();
    let state = SplatState {
        means: splats.means.clone().inner(),
        log_scales: splats.log_scales.clone().inner(),
        rotations: splats.rotations.clone().inner(),
        raw_densities: splats.raw_densities.clone().inner(),
        m1_means: optim.means.moment1.clone(),
        m2_means: optim.means.moment2.clone(),
        m1_log_scales: optim.log_scales.moment1.clone(),
        m2_log_scales: optim.log_scales.moment2.clone(),
        m1_rotations: optim.rotations.moment1.clone(),
        m2_rotations: optim.rotations.moment2.clone(),
        m1_raw_densities: optim.raw_densities.moment1.clone(),
        m2_raw_densities: optim.raw_densities.moment2.clone(),
        adam_iteration: Tensor::from_data(
            TensorData::new(vec![optim.iteration() as i64], [1]),
            &device,
        ),
    };

    let bin = BinFileRecorder::<FullPrecisionSettings>::new();
    bin.record(state, dir.join("gaussians"))
        .context("writing gaussians.bin")?;

    let mpk = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    deform
        .clone()
        .save_file(dir.join("deform"), &mpk)
        .context("writing deform.mpk")?;

    log::info!("Saved checkpoint at iteration {iteration} to {dir:?}");
    Ok(dir)
}

/// Load a checkpoint. `iteration < 0` picks the latest one. Both the
/// Gaussian state and the deformation weights must be present; a checkpoint
/// with only one of them is corrupt and refuses to load.
pub fn load<B: AutodiffBackend>(
    out_dir: &Path,
    iteration: i64,
    deform_config: &DeformationConfig,
    device: &B::Device,
) -> anyhow::Result<(GaussianSet<B>, SplatOptim<B>, DeformationField<B>, u32)> {
    let iteration = if iteration < 0 {
        latest_iteration(out_dir)
            .with_context(|| format!("no checkpoints found under {out_dir:?}"))?
    } else {
        iteration as u32
    };
    let dir = checkpoint_dir(out_dir, iteration);

    let bin = BinFileRecorder::<FullPrecisionSettings>::new();
    let state: SplatState<B::InnerBackend> = bin
        .load(dir.join("gaussians"), device)
        .with_context(|| format!("reading gaussians.bin from {dir:?}"))?;

    let mpk = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let deform = deform_config
        .init::<B>(device)
        .load_file(dir.join("deform"), &mpk, device)
        .with_context(|| format!("reading deform.mpk from {dir:?}"))?;

    let splats = GaussianSet::from_tensors(
        Tensor::from_inner(state.means),
        Tensor::from_inner(state.log_scales),
        Tensor::from_inner(state.rotations),
        Tensor::from_inner(state.raw_densities),
    );
    let adam_iteration: i64 = state.adam_iteration.into_scalar().elem();
    let optim = SplatOptim::from_parts(
        adam_iteration as i32,
        ParamAdam::from_moments(state.m1_means, state.m2_means),
        ParamAdam::from_moments(state.m1_log_scales, state.m2_log_scales),
        ParamAdam::from_moments(state.m1_rotations, state.m2_rotations),
        ParamAdam::from_moments(state.m1_raw_densities, state.m2_raw_densities),
    );

    log::info!("Loaded checkpoint from {dir:?}");
    Ok((splats, optim, deform, iteration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use tomosplat_deform::hexplane::HexPlaneConfig;

    type B = Autodiff<NdArray>;

    fn tensor_bits<BE: Backend>(t: Tensor<BE, 2>) -> Vec<f32> {
        t.into_data().into_vec::<f32>().unwrap()
    }

    #[test]
    fn checkpoint_roundtrip_is_exact() {
        let device = Default::default();
        let dir = std::env::temp_dir().join("tomosplat-checkpoint-test");
        let _ = std::fs::remove_dir_all(&dir);

        let splats = GaussianSet::<B>::from_seed(
            vec![0.1, 0.2, 0.3, -0.1, -0.2, -0.3],
            vec![1.0, 0.5],
            None,
            &device,
        )
        .unwrap();
        let mut optim = SplatOptim::new(&splats);
        // Take one real step so the moments are non-trivial.
        let loss = splats.means.clone().powi_scalar(2).sum();
        let grads = loss.backward();
        let lrs = crate::optim::SplatLrs {
            means: 0.01,
            log_scales: 0.01,
            rotations: 0.01,
            raw_densities: 0.01,
        };
        let splats = optim.step(lrs, &splats, &grads);

        let deform_config = DeformationConfig::new(
            HexPlaneConfig::new()
                .with_feature_dim(4)
                .with_resolution([8, 8, 8, 6])
                .with_multires(vec![1]),
        )
        .with_net_width(8);
        let deform = deform_config.init::<B>(&device);

        save(&dir, 7, &splats, &optim, &deform).unwrap();
        let (loaded, loaded_optim, _deform, iter) =
            load::<B>(&dir, -1, &deform_config, &device).unwrap();

        assert_eq!(iter, 7);
        assert_eq!(
            tensor_bits(loaded.means.inner()),
            tensor_bits(splats.means.clone().inner())
        );
        assert_eq!(
            tensor_bits(loaded_optim.means.moment1.clone()),
            tensor_bits(optim.means.moment1.clone())
        );
        assert_eq!(loaded_optim.iteration(), optim.iteration());
    }

    #[test]
    fn missing_deform_weights_fail_the_load() {
        let device = Default::default();
        let dir = std::env::temp_dir().join("tomosplat-checkpoint-missing");
        let _ = std::fs::remove_dir_all(&dir);

        let splats =
            GaussianSet::<B>::from_seed(vec![0.0, 0.0, 0.0], vec![1.0], Some(0.1), &device)
                .unwrap();
        let optim = SplatOptim::new(&splats);
        let deform_config = DeformationConfig::new(
            HexPlaneConfig::new()
                .with_feature_dim(4)
                .with_resolution([8, 8, 8, 6])
                .with_multires(vec![1]),
        );
        let deform = deform_config.init::<B>(&device);

        let saved = save(&dir, 1, &splats, &optim, &deform).unwrap();
        std::fs::remove_file(saved.join("deform.mpk")).unwrap();

        assert!(load::<B>(&dir, 1, &deform_config, &device).is_err());
    }
}
