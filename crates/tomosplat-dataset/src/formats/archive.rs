use super::ScannerMeta;
use crate::{
    FormatError,
    scene::{Scene, SceneView},
};
use burn::tensor::TensorData;
use serde::Deserialize;
use std::{fs::File, io::BufReader, path::Path};
use tomosplat_render::camera::Camera;
use tracing::trace_span;

/// A whole acquisition pickled into one file. Projections are stored as
/// plain nested lists (row per detector line), not as numpy array objects.
#[derive(Debug, Deserialize)]
struct Archive {
    scanner: ScannerMeta,
    train: Split,
    #[serde(default)]
    eval: Option<Split>,
}

#[derive(Debug, Deserialize)]
struct Split {
    angles: Vec<f32>,
    #[serde(default)]
    times: Vec<f32>,
    #[serde(default)]
    phases: Vec<u32>,
    projections: Vec<Vec<Vec<f32>>>,
}

impl Split {
    fn into_views(self, meta: &ScannerMeta) -> Result<Vec<SceneView>, FormatError> {
        let scanner = meta.to_config();
        let mode = meta.projection_mode()?;
        let n = self.angles.len();
        if self.projections.len() != n {
            return Err(FormatError::InvalidFormat(format!(
                "{n} angles but {} projections",
                self.projections.len()
            )));
        }

        self.projections
            .into_iter()
            .enumerate()
            .map(|(i, rows)| {
                let h = rows.len();
                let w = rows.first().map_or(0, Vec::len);
                if h == 0 || w == 0 || rows.iter().any(|r| r.len() != w) {
                    return Err(FormatError::InvalidFormat(format!(
                        "projection {i} is ragged or empty"
                    )));
                }
                let data: Vec<f32> = rows.into_iter().flatten().collect();
                let time = self.times.get(i).copied().unwrap_or(0.0);
                let phase = self.phases.get(i).copied().unwrap_or(0);
                Ok(SceneView {
                    camera: Camera::from_angle(&scanner, self.angles[i], mode, time, phase),
                    projection: TensorData::new(data, [h, w]),
                })
            })
            .collect()
    }
}

pub(crate) fn load(file: &Path, name: &str) -> Result<Scene, FormatError> {
    let _span = trace_span!("load_archive_scene").entered();

    let reader = BufReader::new(File::open(file)?);
    let archive: Archive = serde_pickle::from_reader(reader, serde_pickle::DeOptions::new())?;
    if archive.train.angles.is_empty() {
        return Err(FormatError::InvalidFormat(
            "archive has no training projections".to_owned(),
        ));
    }

    let meta = archive.scanner;
    let train_views = archive.train.into_views(&meta)?;
    let eval_views = match archive.eval {
        Some(split) => split.into_views(&meta)?,
        None => vec![],
    };

    log::info!(
        "Loaded scene '{name}': {} train / {} eval views",
        train_views.len(),
        eval_views.len()
    );

    Ok(Scene {
        name: name.to_owned(),
        scanner: meta.to_config(),
        mode: meta.projection_mode()?,
        train_views,
        eval_views,
        phase_volumes: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> ScannerMeta {
        serde_json::from_str(
            r#"{
                "nVoxel": [32, 32, 32], "sVoxel": [2.0, 2.0, 2.0],
                "DSO": 4.0, "DSD": 8.0,
                "sDetector": [3.0, 3.0], "nDetector": [4, 2],
                "mode": 0
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn split_without_times_defaults_to_zero() {
        let split = Split {
            angles: vec![0.0, 1.0],
            times: vec![],
            phases: vec![],
            projections: vec![vec![vec![0.0; 4]; 2]; 2],
        };
        let views = split.into_views(&test_meta()).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].projection.shape, vec![2, 4]);
        assert_eq!(views[1].camera.time, 0.0);
        assert_eq!(views[1].camera.phase, 0);
    }

    #[test]
    fn ragged_projection_is_rejected() {
        let split = Split {
            angles: vec![0.0],
            times: vec![],
            phases: vec![],
            projections: vec![vec![vec![0.0; 4], vec![0.0; 3]]],
        };
        assert!(split.into_views(&test_meta()).is_err());
    }
}
