use crate::errors::BraggFitError;
use serde::{
    Deserialize,
    Serialize,
};

/// Counts binned on a regular grid in reciprocal space.
///
/// Counts are stored row-major with the x axis slowest and z fastest,
/// `origin` is the Q coordinate of the centre of voxel `(0, 0, 0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawVoxelGrid", into = "RawVoxelGrid")]
pub struct VoxelGrid {
    shape: [usize; 3],
    origin: [f64; 3],
    spacing: [f64; 3],
    counts: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawVoxelGrid {
    shape: [usize; 3],
    origin: [f64; 3],
    spacing: [f64; 3],
    counts: Vec<f64>,
}

impl TryFrom<RawVoxelGrid> for VoxelGrid {
    type Error = BraggFitError;

    fn try_from(raw: RawVoxelGrid) -> Result<Self, Self::Error> {
        VoxelGrid::new(raw.shape, raw.origin, raw.spacing, raw.counts)
    }
}

impl From<VoxelGrid> for RawVoxelGrid {
    fn from(grid: VoxelGrid) -> Self {
        RawVoxelGrid {
            shape: grid.shape,
            origin: grid.origin,
            spacing: grid.spacing,
            counts: grid.counts,
        }
    }
}

impl VoxelGrid {
    pub fn new(
        shape: [usize; 3],
        origin: [f64; 3],
        spacing: [f64; 3],
        counts: Vec<f64>,
    ) -> Result<Self, BraggFitError> {
        let expected = shape.iter().product::<usize>();
        if expected == 0 {
            return Err(BraggFitError::InvalidGrid {
                context: format!("grid shape {:?} has no voxels", shape),
            });
        }
        if counts.len() != expected {
            return Err(BraggFitError::InvalidGrid {
                context: format!(
                    "expected {} counts for shape {:?}, got {}",
                    expected,
                    shape,
                    counts.len()
                ),
            });
        }
        if spacing.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(BraggFitError::InvalidGrid {
                context: format!("spacing must be finite and positive, got {:?}", spacing),
            });
        }
        if origin.iter().any(|o| !o.is_finite()) {
            return Err(BraggFitError::InvalidGrid {
                context: format!("origin must be finite, got {:?}", origin),
            });
        }
        if let Some(pos) = counts.iter().position(|c| !(c.is_finite() && *c >= 0.0)) {
            return Err(BraggFitError::InvalidGrid {
                context: format!("count at index {} is {}", pos, counts[pos]),
            });
        }
        Ok(Self {
            shape,
            origin,
            spacing,
            counts,
        })
    }

    /// Builds a grid of `shape` centred on `center`.
    pub fn centered_on(
        center: [f64; 3],
        shape: [usize; 3],
        spacing: [f64; 3],
        counts: Vec<f64>,
    ) -> Result<Self, BraggFitError> {
        let origin = [
            center[0] - spacing[0] * (shape[0] as f64 - 1.0) / 2.0,
            center[1] - spacing[1] * (shape[1] as f64 - 1.0) / 2.0,
            center[2] - spacing[2] * (shape[2] as f64 - 1.0) / 2.0,
        ];
        Self::new(shape, origin, spacing, counts)
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn total_counts(&self) -> f64 {
        self.counts.iter().sum()
    }

    #[inline]
    pub fn flat_index(&self, ijk: [usize; 3]) -> usize {
        (ijk[0] * self.shape[1] + ijk[1]) * self.shape[2] + ijk[2]
    }

    #[inline]
    pub fn unravel(&self, idx: usize) -> [usize; 3] {
        let k = idx % self.shape[2];
        let rest = idx / self.shape[2];
        let j = rest % self.shape[1];
        let i = rest / self.shape[1];
        [i, j, k]
    }

    /// Q coordinate (Å⁻¹) of the centre of the voxel at flat index `idx`.
    pub fn q_at(&self, idx: usize) -> [f64; 3] {
        let ijk = self.unravel(idx);
        [
            self.origin[0] + ijk[0] as f64 * self.spacing[0],
            self.origin[1] + ijk[1] as f64 * self.spacing[1],
            self.origin[2] + ijk[2] as f64 * self.spacing[2],
        ]
    }

    /// Flat indices of the box of half-width `radius` around `ijk`, clipped at the edges.
    pub fn neighborhood(&self, ijk: [usize; 3], radius: usize) -> impl Iterator<Item = usize> + '_ {
        let lo = [
            ijk[0].saturating_sub(radius),
            ijk[1].saturating_sub(radius),
            ijk[2].saturating_sub(radius),
        ];
        let hi = [
            (ijk[0] + radius).min(self.shape[0] - 1),
            (ijk[1] + radius).min(self.shape[1] - 1),
            (ijk[2] + radius).min(self.shape[2] - 1),
        ];
        (lo[0]..=hi[0]).flat_map(move |i| {
            (lo[1]..=hi[1])
                .flat_map(move |j| (lo[2]..=hi[2]).map(move |k| self.flat_index([i, j, k])))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        let grid = VoxelGrid::new([2, 3, 4], [0.0; 3], [1.0; 3], vec![0.0; 24]).unwrap();
        for idx in 0..grid.len() {
            assert_eq!(grid.flat_index(grid.unravel(idx)), idx);
        }
        assert_eq!(grid.unravel(23), [1, 2, 3]);
    }

    #[test]
    fn test_centered_grid_center_voxel() {
        let grid =
            VoxelGrid::centered_on([1.0, 2.0, 3.0], [5, 5, 5], [0.1; 3], vec![0.0; 125]).unwrap();
        let center = grid.q_at(grid.flat_index([2, 2, 2]));
        for (a, b) in center.iter().zip([1.0, 2.0, 3.0].iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert!(VoxelGrid::new([2, 2, 2], [0.0; 3], [1.0; 3], vec![0.0; 7]).is_err());
        assert!(VoxelGrid::new([2, 2, 2], [0.0; 3], [0.0, 1.0, 1.0], vec![0.0; 8]).is_err());
        let mut counts = vec![0.0; 8];
        counts[3] = -1.0;
        assert!(VoxelGrid::new([2, 2, 2], [0.0; 3], [1.0; 3], counts).is_err());
    }

    #[test]
    fn test_neighborhood_is_clipped() {
        let grid = VoxelGrid::new([3, 3, 3], [0.0; 3], [1.0; 3], vec![0.0; 27]).unwrap();
        assert_eq!(grid.neighborhood([0, 0, 0], 1).count(), 8);
        assert_eq!(grid.neighborhood([1, 1, 1], 1).count(), 27);
    }

    #[test]
    fn test_deserialize_validates() {
        let bad = r#"{"shape":[1,1,2],"origin":[0,0,0],"spacing":[1,1,1],"counts":[1.0]}"#;
        assert!(serde_json::from_str::<VoxelGrid>(bad).is_err());
        let good = r#"{"shape":[1,1,2],"origin":[0,0,0],"spacing":[1,1,1],"counts":[1.0,2.0]}"#;
        let grid: VoxelGrid = serde_json::from_str(good).unwrap();
        assert_eq!(grid.total_counts(), 3.0);
    }
}
