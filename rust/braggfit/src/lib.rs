//! Profile fitting and integration of Bragg peaks from time-of-flight
//! single-crystal neutron diffraction.
//!
//! Each peak arrives as a small grid of counts in reciprocal space together
//! with its instrument geometry. The counts are mapped into (TOF, polar,
//! azimuthal), separated from the Poisson background, and described by the
//! product of a TOF pulse profile and an angular bivariate Gaussian. That
//! joint model is scaled to the counts to give the integrated intensity.

pub mod background;
pub mod config;
pub mod data_sources;
pub mod errors;
pub mod fitting;
pub mod library;
pub mod mapping;
pub mod models;
pub mod pipeline;
pub mod profiles;

pub use config::{
    InstrumentConfig,
    InstrumentConstants,
    IntegrationConfig,
};
pub use data_sources::{
    JsonPeakSource,
    PeakSource,
};
pub use errors::{
    BraggFitError,
    DataReadingError,
    Result,
};
pub use library::{
    StrongPeakEntry,
    StrongPeakLibrary,
};
pub use models::{
    PeakGeometry,
    VoxelGrid,
};
pub use pipeline::{
    BatchSummary,
    FitResult,
    FitStatus,
    FitTimings,
    IntegrationPipeline,
    PeakInput,
    PipelineOutput,
};
