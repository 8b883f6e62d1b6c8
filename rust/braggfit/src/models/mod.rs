pub mod geometry;
pub mod grid;

pub use geometry::PeakGeometry;
pub use grid::VoxelGrid;
