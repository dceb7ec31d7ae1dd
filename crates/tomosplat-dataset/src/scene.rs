use burn::tensor::TensorData;
use glam::Vec3;
use tomosplat_render::{
    bounding_box::BoundingBox,
    camera::{Camera, ProjectionMode, ScannerConfig},
};

/// One captured projection: the camera it was taken with and the measured
/// attenuation image as `[H, W]` tensor data.
#[derive(Debug, Clone)]
pub struct SceneView {
    pub camera: Camera,
    pub projection: TensorData,
}

/// A loaded acquisition. Plain data; training state lives with the trainer.
#[derive(Debug, Clone)]
pub struct Scene {
    pub name: String,
    pub scanner: ScannerConfig,
    pub mode: ProjectionMode,
    pub train_views: Vec<SceneView>,
    /// Held-out projections for evaluation; may be empty.
    pub eval_views: Vec<SceneView>,
    /// Ground-truth phase volumes `[nx, ny, nz]`, indexed by phase; may be
    /// empty when the acquisition ships without reference reconstructions.
    pub phase_volumes: Vec<TensorData>,
}

impl Scene {
    /// World-space bounds of the reconstruction volume.
    pub fn bounds(&self) -> BoundingBox {
        let center = Vec3::from_array(self.scanner.off_origin);
        let half = Vec3::from_array(self.scanner.s_voxel) * 0.5;
        BoundingBox::from_min_max(center - half, center + half)
    }

    /// Number of distinct physiological phases across all views.
    pub fn num_phases(&self) -> u32 {
        self.train_views
            .iter()
            .chain(&self.eval_views)
            .map(|v| v.camera.phase + 1)
            .max()
            .unwrap_or(1)
    }
}
