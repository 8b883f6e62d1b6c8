//! Providers of peak geometry and voxel counts.

pub mod json;

pub use json::{
    JsonPeakSource,
    PeakFileFormat,
};

use crate::errors::DataReadingError;
use crate::pipeline::PeakInput;

/// Anything that can hand the pipeline a list of peaks to integrate.
pub trait PeakSource {
    /// Human-readable origin of the peaks, for logging.
    fn describe(&self) -> String;

    fn read_peaks(&self) -> Result<Vec<PeakInput>, DataReadingError>;
}

impl PeakSource for Vec<PeakInput> {
    fn describe(&self) -> String {
        format!("{} in-memory peaks", self.len())
    }

    fn read_peaks(&self) -> Result<Vec<PeakInput>, DataReadingError> {
        Ok(self.clone())
    }
}
