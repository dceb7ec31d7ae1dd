use glam::Vec3;

/// Axis-aligned bounding volume, stored as center + half-extents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub center: Vec3,
    pub extent: Vec3,
}

impl BoundingBox {
    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self {
            center: (min + max) / 2.0,
            extent: (max - min) / 2.0,
        }
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.extent
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.extent
    }

    pub fn median_size(&self) -> f32 {
        let mut sizes = [self.extent.x, self.extent.y, self.extent.z];
        sizes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sizes[1] * 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::vec3;

    #[test]
    fn min_max_roundtrip() {
        let bb = BoundingBox::from_min_max(vec3(-1.0, -2.0, -3.0), vec3(1.0, 2.0, 3.0));
        assert_eq!(bb.min(), vec3(-1.0, -2.0, -3.0));
        assert_eq!(bb.max(), vec3(1.0, 2.0, 3.0));
        assert_eq!(bb.median_size(), 4.0);
    }
}
