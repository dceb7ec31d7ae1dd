use crate::{RenderError, voxelize::GridSpec};
use glam::{Mat3, Mat4, Vec3, vec3};

/// Projection geometry of one captured view.
///
/// Parallel-beam views use unit field-of-view tangents; cone-beam views carry
/// the full horizontal/vertical field of view in radians. Any other mode
/// index found in a dataset is a configuration error and is rejected here,
/// at construction, rather than at render time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProjectionMode {
    Parallel,
    Cone { fovx: f32, fovy: f32 },
}

impl ProjectionMode {
    pub fn from_mode_index(mode: u32, fovx: f32, fovy: f32) -> Result<Self, RenderError> {
        match mode {
            0 => Ok(Self::Parallel),
            1 => Ok(Self::Cone { fovx, fovy }),
            other => Err(RenderError::UnsupportedMode(other)),
        }
    }

    pub fn tan_half_fov(&self) -> (f32, f32) {
        match self {
            Self::Parallel => (1.0, 1.0),
            Self::Cone { fovx, fovy } => ((fovx * 0.5).tan(), (fovy * 0.5).tan()),
        }
    }
}

/// Scanner geometry shared by every view of an acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    /// Reconstruction grid resolution (voxels per axis).
    pub n_voxel: [usize; 3],
    /// Physical size of the reconstruction volume.
    pub s_voxel: [f32; 3],
    /// Offset of the volume center from the world origin.
    pub off_origin: [f32; 3],
    /// Source-to-origin distance.
    pub dso: f32,
    /// Source-to-detector distance.
    pub dsd: f32,
    /// Physical detector size.
    pub s_detector: [f32; 2],
    /// Detector resolution in pixels.
    pub n_detector: [usize; 2],
}

impl ScannerConfig {
    pub fn grid(&self) -> GridSpec {
        GridSpec {
            n_voxel: self.n_voxel,
            s_voxel: self.s_voxel,
            center: self.off_origin,
        }
    }

    /// Cone-beam field of view subtended by the detector.
    pub fn fov(&self) -> (f32, f32) {
        let fovx = 2.0 * (self.s_detector[0] * 0.5 / self.dsd).atan();
        let fovy = 2.0 * (self.s_detector[1] * 0.5 / self.dsd).atan();
        (fovx, fovy)
    }

    /// Half-diagonal of the volume, used as the scene extent for
    /// densification thresholds.
    pub fn extent(&self) -> f32 {
        let half = vec3(self.s_voxel[0], self.s_voxel[1], self.s_voxel[2]) * 0.5;
        half.length()
    }
}

/// Immutable per-view record: pose, projection mode, detector size and the
/// acquisition time within the physiological cycle.
#[derive(Debug, Clone)]
pub struct Camera {
    /// World-to-view rotation.
    pub rotation: Mat3,
    /// World-to-view translation.
    pub translation: Vec3,
    pub mode: ProjectionMode,
    pub width: u32,
    pub height: u32,
    /// Acquisition time, normalized to `[0, 1]` over the scan.
    pub time: f32,
    /// Discretized phase of the physiological cycle this view belongs to.
    pub phase: u32,
}

impl Camera {
    pub fn new(
        rotation: Mat3,
        translation: Vec3,
        mode: ProjectionMode,
        width: u32,
        height: u32,
        time: f32,
        phase: u32,
    ) -> Self {
        Self {
            rotation,
            translation,
            mode,
            width,
            height,
            time,
            phase,
        }
    }

    /// Build a view on a circular source trajectory around the z axis. The
    /// source sits at `dso * (cos angle, sin angle, 0)` looking at the
    /// volume center.
    pub fn from_angle(
        scanner: &ScannerConfig,
        angle: f32,
        mode: ProjectionMode,
        time: f32,
        phase: u32,
    ) -> Self {
        let center = Vec3::from_array(scanner.off_origin);
        let eye = center + scanner.dso * vec3(angle.cos(), angle.sin(), 0.0);
        let view = Mat4::look_at_rh(eye, center, Vec3::Z);
        let rotation = Mat3::from_mat4(view);
        let translation = view.w_axis.truncate();
        Self::new(
            rotation,
            translation,
            mode,
            scanner.n_detector[0] as u32,
            scanner.n_detector[1] as u32,
            time,
            phase,
        )
    }

    pub fn world_to_view(&self) -> Mat4 {
        let mut m = Mat4::from_mat3(self.rotation);
        m.w_axis = self.translation.extend(1.0);
        m
    }

    /// Camera center in world space.
    pub fn position(&self) -> Vec3 {
        -(self.rotation.transpose() * self.translation)
    }

    /// Focal lengths in pixels derived from the FOV tangents.
    pub fn focal(&self) -> (f32, f32) {
        let (tan_x, tan_y) = self.mode.tan_half_fov();
        (
            self.width as f32 / (2.0 * tan_x),
            self.height as f32 / (2.0 * tan_y),
        )
    }
}
