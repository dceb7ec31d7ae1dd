//! Training of a deformable Gaussian attenuation model: loss composition,
//! a resizable optimizer, densification and evaluation.

pub mod checkpoint;
pub mod config;
pub mod eval;
pub mod lr_schedule;
pub mod optim;
pub mod refine;
pub mod ssim;
pub mod train;

pub use config::TrainConfig;
pub use train::{TrainStats, Trainer};
