//! Loading of 4D CT acquisitions: scanner geometry, captured projections
//! and the seed point cloud the Gaussian set is initialized from.

pub mod formats;
pub mod init_cloud;
pub mod scene;

use std::path::PathBuf;

pub use formats::SceneSource;
pub use scene::{Scene, SceneView};

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid scene manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid scene archive: {0}")]
    Pickle(#[from] serde_pickle::Error),

    #[error("invalid data: {0}")]
    InvalidFormat(String),

    #[error(
        "'{0}' is neither a scene directory with a meta_data.json nor a .pickle archive"
    )]
    UnrecognizedScene(PathBuf),

    #[error("seed point cloud not found at '{0}'")]
    MissingSeed(PathBuf),

    #[error(transparent)]
    Render(#[from] tomosplat_render::RenderError),
}
