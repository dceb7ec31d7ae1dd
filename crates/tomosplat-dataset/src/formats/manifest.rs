use super::ScannerMeta;
use crate::{
    FormatError,
    scene::{Scene, SceneView},
};
use burn::tensor::TensorData;
use serde::Deserialize;
use std::path::Path;
use tomosplat_render::camera::Camera;
use tracing::trace_span;

#[derive(Debug, Deserialize)]
struct Manifest {
    scanner: ScannerMeta,
    proj_train: Vec<ProjEntry>,
    #[serde(default)]
    proj_eval: Vec<ProjEntry>,
    /// Optional reference reconstructions, one `.npy` volume per phase.
    #[serde(default)]
    gt_volumes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProjEntry {
    file_path: String,
    /// Source angle on the circular trajectory, radians.
    angle: f32,
    /// Acquisition time normalized to `[0, 1]` over the scan.
    #[serde(default)]
    time: f32,
    #[serde(default)]
    phase: u32,
}

/// Parse a `.npy` payload into float tensor data, accepting f32 or f64.
pub(crate) fn read_npy(bytes: &[u8]) -> Result<(Vec<usize>, Vec<f32>), FormatError> {
    let npy = npyz::NpyFile::new(bytes)?;
    let shape: Vec<usize> = npy.shape().iter().map(|&d| d as usize).collect();
    if let Ok(data) = npy.into_vec::<f32>() {
        return Ok((shape, data));
    }
    let npy = npyz::NpyFile::new(bytes)?;
    let data = npy.into_vec::<f64>()?;
    Ok((shape, data.into_iter().map(|x| x as f32).collect()))
}

fn load_projection(dir: &Path, entry: &ProjEntry) -> Result<TensorData, FormatError> {
    let bytes = std::fs::read(dir.join(&entry.file_path))?;
    let (shape, data) = read_npy(&bytes)?;
    let [h, w] = shape[..] else {
        return Err(FormatError::InvalidFormat(format!(
            "projection '{}' must be 2D, got shape {shape:?}",
            entry.file_path
        )));
    };
    Ok(TensorData::new(data, [h, w]))
}

fn load_views(
    dir: &Path,
    entries: &[ProjEntry],
    meta: &ScannerMeta,
) -> Result<Vec<SceneView>, FormatError> {
    let scanner = meta.to_config();
    let mode = meta.projection_mode()?;
    entries
        .iter()
        .map(|entry| {
            let projection = load_projection(dir, entry)?;
            let camera = Camera::from_angle(&scanner, entry.angle, mode, entry.time, entry.phase);
            Ok(SceneView { camera, projection })
        })
        .collect()
}

pub(crate) fn load(dir: &Path, name: &str) -> Result<Scene, FormatError> {
    let _span = trace_span!("load_manifest_scene").entered();

    let manifest: Manifest =
        serde_json::from_slice(&std::fs::read(dir.join("meta_data.json"))?)?;
    if manifest.proj_train.is_empty() {
        return Err(FormatError::InvalidFormat(
            "scene has no training projections".to_owned(),
        ));
    }

    let train_views = load_views(dir, &manifest.proj_train, &manifest.scanner)?;
    let eval_views = load_views(dir, &manifest.proj_eval, &manifest.scanner)?;

    let phase_volumes = manifest
        .gt_volumes
        .iter()
        .map(|rel| {
            let bytes = std::fs::read(dir.join(rel))?;
            let (shape, data) = read_npy(&bytes)?;
            let [nx, ny, nz] = shape[..] else {
                return Err(FormatError::InvalidFormat(format!(
                    "volume '{rel}' must be 3D, got shape {shape:?}"
                )));
            };
            Ok(TensorData::new(data, [nx, ny, nz]))
        })
        .collect::<Result<Vec<_>, _>>()?;

    log::info!(
        "Loaded scene '{name}': {} train / {} eval views, {} reference volumes",
        train_views.len(),
        eval_views.len(),
        phase_volumes.len()
    );

    Ok(Scene {
        name: name.to_owned(),
        scanner: manifest.scanner.to_config(),
        mode: manifest.scanner.projection_mode()?,
        train_views,
        eval_views,
        phase_volumes,
    })
}
