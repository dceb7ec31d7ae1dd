use anyhow::Context;
use burn::tensor::{Tensor, activation::softplus, backend::AutodiffBackend};
use std::{fs::File, io::BufWriter, path::Path};
use tomosplat_dataset::Scene;
use tomosplat_deform::{DeformationField, Stage};
use tomosplat_render::{
    CovSource,
    gaussian_splats::{GaussianSet, norm_vec},
    voxelize::voxelize,
};
use tracing::trace_span;

#[derive(Debug, Clone)]
pub struct PhaseEval {
    pub phase: u32,
    /// Scan time the volume was reconstructed at.
    pub time: f32,
    /// 3D PSNR against the reference volume, when one is available.
    pub psnr: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub phases: Vec<PhaseEval>,
    pub mean_psnr: Option<f32>,
}

fn psnr_3d(rendered: &[f32], reference: &[f32]) -> f32 {
    let peak = reference.iter().fold(0.0f32, |a, &b| a.max(b)).max(1e-6);
    let mse = rendered
        .iter()
        .zip(reference)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        / rendered.len() as f32;
    10.0 * (peak * peak / mse).log10()
}

fn save_volume_npy(path: &Path, shape: [usize; 3], data: &[f32]) -> anyhow::Result<()> {
    use npyz::WriterBuilder;

    let file = BufWriter::new(File::create(path)?);
    let mut writer = npyz::WriteOptions::new()
        .default_dtype()
        .shape(&[shape[0] as u64, shape[1] as u64, shape[2] as u64])
        .writer(file)
        .begin_nd()?;
    writer.extend(data.iter().copied())?;
    writer.finish()?;
    Ok(())
}

/// Representative scan time for a phase: the mean acquisition time of its
/// views, or an even spacing when no view carries the phase.
fn phase_time(scene: &Scene, phase: u32) -> f32 {
    let times: Vec<f32> = scene
        .train_views
        .iter()
        .chain(&scene.eval_views)
        .filter(|v| v.camera.phase == phase)
        .map(|v| v.camera.time)
        .collect();
    if times.is_empty() {
        (phase as f32 + 0.5) / scene.num_phases() as f32
    } else {
        times.iter().sum::<f32>() / times.len() as f32
    }
}

/// Reconstruct one volume per phase and score it against the reference
/// volumes when the scene ships them. With `export_dir` set, every volume is
/// also written out as `vol_phase_<p>.npy`.
pub fn eval_volumes<B: AutodiffBackend>(
    splats: &GaussianSet<B>,
    deform: &DeformationField<B>,
    scene: &Scene,
    stage: Stage,
    export_dir: Option<&Path>,
) -> anyhow::Result<EvalReport> {
    let _span = trace_span!("eval_volumes").entered();

    if let Some(dir) = export_dir {
        std::fs::create_dir_all(dir)?;
    }
    let grid = scene.scanner.grid();

    let mut phases = Vec::new();
    for phase in 0..scene.num_phases() {
        let time = phase_time(scene, phase);
        let deformed = deform.evaluate(
            splats.means.clone(),
            splats.log_scales.clone(),
            splats.rotations.clone(),
            splats.raw_densities.clone(),
            time,
            stage,
        );
        let out = voxelize(
            &grid,
            deformed.means,
            CovSource::ScaleRotation {
                scales: deformed.log_scales.exp(),
                rotations: norm_vec(deformed.rotations),
            },
            softplus(deformed.raw_densities, 1.0),
        );
        let volume: Tensor<B::InnerBackend, 3> = out.volume.inner();
        let data = volume
            .into_data()
            .into_vec::<f32>()
            .expect("volume is a float tensor");

        let psnr = scene.phase_volumes.get(phase as usize).and_then(|gt| {
            if gt.shape != vec![grid.n_voxel[0], grid.n_voxel[1], grid.n_voxel[2]] {
                log::warn!(
                    "Reference volume for phase {phase} has shape {:?}, expected {:?}; skipping",
                    gt.shape,
                    grid.n_voxel
                );
                return None;
            }
            let reference = gt.clone().into_vec::<f32>().ok()?;
            Some(psnr_3d(&data, &reference))
        });

        if let Some(dir) = export_dir {
            let path = dir.join(format!("vol_phase_{phase:03}.npy"));
            save_volume_npy(&path, grid.n_voxel, &data)
                .with_context(|| format!("writing {path:?}"))?;
        }

        if let Some(psnr) = psnr {
            log::info!("Eval phase {phase}: psnr {psnr:.2} dB");
        }
        phases.push(PhaseEval { phase, time, psnr });
    }

    let scored: Vec<f32> = phases.iter().filter_map(|p| p.psnr).collect();
    let mean_psnr = (!scored.is_empty()).then(|| scored.iter().sum::<f32>() / scored.len() as f32);
    Ok(EvalReport { phases, mean_psnr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::backend::Backend;
    use tomosplat_deform::{DeformationConfig, hexplane::HexPlaneConfig};
    use tomosplat_render::camera::{ProjectionMode, ScannerConfig};

    type B = Autodiff<NdArray>;

    fn test_scene_with_reference(
        splats: &GaussianSet<B>,
        deform: &DeformationField<B>,
    ) -> Scene {
        let scanner = ScannerConfig {
            n_voxel: [8, 8, 8],
            s_voxel: [2.0, 2.0, 2.0],
            off_origin: [0.0, 0.0, 0.0],
            dso: 4.0,
            dsd: 8.0,
            s_detector: [3.0, 3.0],
            n_detector: [16, 16],
        };
        let grid = scanner.grid();
        // The reference is the model's own reconstruction, so eval must
        // report a near-perfect score.
        let deformed = deform.evaluate(
            splats.means.clone(),
            splats.log_scales.clone(),
            splats.rotations.clone(),
            splats.raw_densities.clone(),
            0.5,
            Stage::Coarse,
        );
        let gt = voxelize(
            &grid,
            deformed.means,
            CovSource::ScaleRotation {
                scales: deformed.log_scales.exp(),
                rotations: norm_vec(deformed.rotations),
            },
            softplus(deformed.raw_densities, 1.0),
        )
        .volume
        .inner()
        .into_data();

        Scene {
            name: "eval-test".to_owned(),
            scanner,
            mode: ProjectionMode::Parallel,
            train_views: vec![],
            eval_views: vec![],
            phase_volumes: vec![gt],
        }
    }

    #[test]
    fn self_reference_scores_high_psnr() {
        let device = <B as Backend>::Device::default();
        let splats = GaussianSet::<B>::from_seed(
            vec![0.0, 0.0, 0.0, 0.3, -0.3, 0.2],
            vec![1.0, 0.5],
            Some(0.2),
            &device,
        )
        .unwrap();
        let deform = DeformationConfig::new(
            HexPlaneConfig::new()
                .with_feature_dim(4)
                .with_resolution([8, 8, 8, 4])
                .with_multires(vec![1]),
        )
        .init::<B>(&device);

        let scene = test_scene_with_reference(&splats, &deform);
        let report = eval_volumes(&splats, &deform, &scene, Stage::Coarse, None).unwrap();

        assert_eq!(report.phases.len(), 1);
        let psnr = report.mean_psnr.unwrap();
        assert!(psnr > 40.0, "psnr {psnr}");
    }
}
