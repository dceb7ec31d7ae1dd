use crate::{FormatError, formats::SceneSource, formats::manifest::read_npy};
use ply_rs::{
    parser::Parser,
    ply::{DefaultElement, Property},
};
use std::{
    io::Read,
    path::{Path, PathBuf},
};
use tracing::trace_span;

/// Seed positions and densities the Gaussian set starts from.
#[derive(Debug, Clone)]
pub struct SeedCloud {
    /// Flattened `[N, 3]` xyz.
    pub positions: Vec<f32>,
    /// `[N]` initial attenuation densities.
    pub densities: Vec<f32>,
}

/// Conventional location of the seed cloud next to the scene data.
pub fn default_seed_path(source: &SceneSource) -> PathBuf {
    source.base_dir().join(format!("init_{}.npy", source.name()))
}

pub fn load_seed(path: &Path) -> Result<SeedCloud, FormatError> {
    let _span = trace_span!("load_seed").entered();

    if !path.is_file() {
        return Err(FormatError::MissingSeed(path.to_path_buf()));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => load_npy_seed(&std::fs::read(path)?),
        Some("ply") => load_ply_seed(&mut std::fs::File::open(path)?),
        other => Err(FormatError::InvalidFormat(format!(
            "unsupported seed cloud extension {other:?} (expected .npy or .ply)"
        ))),
    }
}

/// `[N, 4]` rows of `x y z density`, or `[N, 3]` with unit densities.
fn load_npy_seed(bytes: &[u8]) -> Result<SeedCloud, FormatError> {
    let (shape, data) = read_npy(bytes)?;
    let [n, cols] = shape[..] else {
        return Err(FormatError::InvalidFormat(format!(
            "seed cloud must be 2D, got shape {shape:?}"
        )));
    };
    match cols {
        3 => Ok(SeedCloud {
            positions: data,
            densities: vec![1.0; n],
        }),
        4 => {
            let mut positions = Vec::with_capacity(n * 3);
            let mut densities = Vec::with_capacity(n);
            for row in data.chunks_exact(4) {
                positions.extend_from_slice(&row[..3]);
                densities.push(row[3]);
            }
            Ok(SeedCloud {
                positions,
                densities,
            })
        }
        _ => Err(FormatError::InvalidFormat(format!(
            "seed cloud rows must have 3 or 4 columns, got {cols}"
        ))),
    }
}

fn load_ply_seed(reader: &mut impl Read) -> Result<SeedCloud, FormatError> {
    let ply = Parser::<DefaultElement>::new().read_ply(reader)?;
    let vertices = ply.payload.get("vertex").ok_or_else(|| {
        FormatError::InvalidFormat("seed .ply has no vertex element".to_owned())
    })?;

    let scalar = |v: &DefaultElement, key: &str| match v.get(key) {
        Some(Property::Float(f)) => Ok(*f),
        Some(Property::Double(d)) => Ok(*d as f32),
        _ => Err(FormatError::InvalidFormat(format!(
            "seed .ply vertex is missing float property '{key}'"
        ))),
    };

    let mut positions = Vec::with_capacity(vertices.len() * 3);
    let mut densities = Vec::with_capacity(vertices.len());
    for v in vertices {
        positions.push(scalar(v, "x")?);
        positions.push(scalar(v, "y")?);
        positions.push(scalar(v, "z")?);
        densities.push(scalar(v, "density")?);
    }
    Ok(SeedCloud {
        positions,
        densities,
    })
}
