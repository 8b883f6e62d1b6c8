#![allow(dead_code)]

use braggfit::config::{
    ModeratorCoefficients,
    DEFAULT_TOF_CONSTANT,
};
use braggfit::{
    InstrumentConstants,
    PeakGeometry,
    PeakInput,
    VoxelGrid,
};

pub const GRID_SIZE: usize = 20;
pub const SPACING: f64 = 0.005;
pub const BLOB_CENTER: [usize; 3] = [10, 10, 10];
pub const BLOB_SIGMA: f64 = 2.0;
pub const BLOB_AMPLITUDE: f64 = 1000.0;

pub fn constants() -> InstrumentConstants {
    InstrumentConstants {
        tof_constant: DEFAULT_TOF_CONSTANT,
        detector_rows: 256,
        detector_cols: 256,
        moderator: ModeratorCoefficients {
            alpha0: 1.6,
            alpha1: 1.5,
            beta0: 31.9,
            kappa: 46.0,
        },
    }
}

pub fn geometry(peak_id: u32) -> PeakGeometry {
    PeakGeometry {
        peak_id,
        l1: 30.0,
        l2: 0.45,
        scattering_half_angle: 0.7,
        q_nominal: [3.0, 4.0, 0.5],
        detector_row: 100,
        detector_col: 100,
        bank: Some("bank17".to_string()),
    }
}

/// Squared distance (in voxels) from the blob centre.
pub fn voxel_r2(ijk: [usize; 3]) -> f64 {
    ijk.iter()
        .zip(BLOB_CENTER.iter())
        .map(|(a, b)| (*a as f64 - *b as f64).powi(2))
        .sum()
}

/// Integer-valued Gaussian blob on an otherwise empty grid around `q_nominal`.
pub fn blob_grid(q_nominal: [f64; 3]) -> VoxelGrid {
    let n = GRID_SIZE;
    let mut counts = Vec::with_capacity(n * n * n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                let r2 = voxel_r2([i, j, k]);
                let v = BLOB_AMPLITUDE * (-0.5 * r2 / (BLOB_SIGMA * BLOB_SIGMA)).exp();
                counts.push(v.round());
            }
        }
    }
    VoxelGrid::centered_on(q_nominal, [n, n, n], [SPACING; 3], counts).unwrap()
}

pub fn zero_grid(q_nominal: [f64; 3]) -> VoxelGrid {
    let n = GRID_SIZE;
    VoxelGrid::centered_on(q_nominal, [n, n, n], [SPACING; 3], vec![0.0; n * n * n]).unwrap()
}

pub fn blob_input(peak_id: u32) -> PeakInput {
    let geometry = geometry(peak_id);
    PeakInput {
        grid: blob_grid(geometry.q_nominal),
        geometry,
    }
}

pub fn zero_input(peak_id: u32) -> PeakInput {
    let geometry = geometry(peak_id);
    PeakInput {
        grid: zero_grid(geometry.q_nominal),
        geometry,
    }
}

/// Same blob as [`blob_input`], recorded one pixel away from the detector boundary.
pub fn edge_blob_input(peak_id: u32) -> PeakInput {
    let mut input = blob_input(peak_id);
    input.geometry.detector_row = 1;
    input
}
