pub mod archive;
pub mod manifest;

use crate::{FormatError, scene::Scene};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tomosplat_render::camera::{ProjectionMode, ScannerConfig};

/// Where a scene comes from. Probing is explicit: a path resolves to exactly
/// one source kind or fails, it never falls through format by format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneSource {
    /// Directory with a `meta_data.json` manifest and `.npy` projections.
    Manifest { dir: PathBuf },
    /// Single `.pickle`/`.pkl` archive with everything inlined.
    Archive { file: PathBuf },
}

impl SceneSource {
    pub fn probe(path: &Path) -> Result<Self, FormatError> {
        if path.is_dir() && path.join("meta_data.json").is_file() {
            return Ok(Self::Manifest {
                dir: path.to_path_buf(),
            });
        }
        let ext = path.extension().and_then(|e| e.to_str());
        if path.is_file() && matches!(ext, Some("pickle") | Some("pkl")) {
            return Ok(Self::Archive {
                file: path.to_path_buf(),
            });
        }
        Err(FormatError::UnrecognizedScene(path.to_path_buf()))
    }

    /// The scene name, used to derive default companion paths.
    pub fn name(&self) -> String {
        let path = match self {
            Self::Manifest { dir } => dir,
            Self::Archive { file } => file,
        };
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "scene".to_owned())
    }

    /// Directory that companion files (like the seed cloud) live next to.
    pub fn base_dir(&self) -> PathBuf {
        match self {
            Self::Manifest { dir } => dir.clone(),
            Self::Archive { file } => file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn load(&self) -> Result<Scene, FormatError> {
        log::info!("Loading scene from {self:?}");
        match self {
            Self::Manifest { dir } => manifest::load(dir, &self.name()),
            Self::Archive { file } => archive::load(file, &self.name()),
        }
    }
}

/// Scanner geometry as serialized in both scene formats.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerMeta {
    #[serde(rename = "nVoxel")]
    pub n_voxel: [usize; 3],
    #[serde(rename = "sVoxel")]
    pub s_voxel: [f32; 3],
    #[serde(rename = "offOrigin", default)]
    pub off_origin: [f32; 3],
    #[serde(rename = "DSO")]
    pub dso: f32,
    #[serde(rename = "DSD")]
    pub dsd: f32,
    #[serde(rename = "sDetector")]
    pub s_detector: [f32; 2],
    #[serde(rename = "nDetector")]
    pub n_detector: [usize; 2],
    /// 0 = parallel beam, 1 = cone beam. Anything else is rejected.
    pub mode: u32,
}

impl ScannerMeta {
    pub fn to_config(&self) -> ScannerConfig {
        ScannerConfig {
            n_voxel: self.n_voxel,
            s_voxel: self.s_voxel,
            off_origin: self.off_origin,
            dso: self.dso,
            dsd: self.dsd,
            s_detector: self.s_detector,
            n_detector: self.n_detector,
        }
    }

    pub fn projection_mode(&self) -> Result<ProjectionMode, FormatError> {
        let (fovx, fovy) = self.to_config().fov();
        Ok(ProjectionMode::from_mode_index(self.mode, fovx, fovy)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_rejects_unknown_paths() {
        let err = SceneSource::probe(Path::new("/definitely/not/here.txt"));
        assert!(matches!(err, Err(FormatError::UnrecognizedScene(_))));
    }

    #[test]
    fn scanner_meta_rejects_unknown_mode() {
        let meta: ScannerMeta = serde_json::from_str(
            r#"{
                "nVoxel": [64, 64, 64], "sVoxel": [2.0, 2.0, 2.0],
                "DSO": 4.0, "DSD": 8.0,
                "sDetector": [3.0, 3.0], "nDetector": [128, 128],
                "mode": 7
            }"#,
        )
        .unwrap();
        assert!(meta.projection_mode().is_err());
        assert_eq!(meta.off_origin, [0.0, 0.0, 0.0]);
    }
}
