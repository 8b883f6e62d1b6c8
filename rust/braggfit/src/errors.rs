use std::fmt::Display;
use std::path::PathBuf;

/// The stage of the per-peak fit an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStage {
    Mapping,
    Background,
    TofProfile,
    AngularProfile,
    Scaling,
}

impl Display for FitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FitStage::Mapping => "mapping",
            FitStage::Background => "background",
            FitStage::TofProfile => "tof_profile",
            FitStage::AngularProfile => "angular_profile",
            FitStage::Scaling => "scaling",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// TOF is undefined for a zero (or negative) scattering half-angle.
    NonPositiveScatteringAngle(f64),
    NonPositiveFlightPath { l1: f64, l2: f64 },
    NonFiniteValue { field: &'static str },
    ZeroLengthQ,
}

impl Display for GeometryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveScatteringAngle(x) => write!(
                f,
                "scattering half-angle must be positive (got {} rad), TOF is undefined",
                x
            ),
            Self::NonPositiveFlightPath { l1, l2 } => {
                write!(f, "flight paths must be positive (L1={}, L2={})", l1, l2)
            }
            Self::NonFiniteValue { field } => write!(f, "non-finite geometry value in {}", field),
            Self::ZeroLengthQ => write!(f, "nominal Q vector has zero length"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    MissingParameter { name: &'static str },
    InvalidParameter { name: &'static str, reason: String },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingParameter { name } => {
                write!(f, "missing required instrument parameter `{}`", name)
            }
            Self::InvalidParameter { name, reason } => {
                write!(f, "invalid parameter `{}`: {}", name, reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BraggFitError {
    Geometry(GeometryError),
    /// Not enough signal to feed a stage's solver.
    DegenerateFit {
        stage: FitStage,
        context: String,
    },
    /// The nonlinear solver ran out of iterations (or hit a singular system).
    FitConvergence {
        model: &'static str,
        iterations: usize,
        context: String,
    },
    Configuration(ConfigurationError),
    InvalidGrid {
        context: String,
    },
}

impl BraggFitError {
    pub fn degenerate(stage: FitStage, context: impl Into<String>) -> Self {
        Self::DegenerateFit {
            stage,
            context: context.into(),
        }
    }

    pub fn is_degenerate(&self) -> bool {
        matches!(self, Self::DegenerateFit { .. })
    }

    pub fn is_convergence(&self) -> bool {
        matches!(self, Self::FitConvergence { .. })
    }

    pub fn append_to_context(mut self, ctx: &str) -> Self {
        match &mut self {
            BraggFitError::DegenerateFit { context, .. }
            | BraggFitError::FitConvergence { context, .. }
            | BraggFitError::InvalidGrid { context } => {
                if !context.is_empty() {
                    context.push_str("; ");
                }
                context.push_str(ctx);
            }
            BraggFitError::Geometry(_) | BraggFitError::Configuration(_) => {}
        }
        self
    }
}

impl Display for BraggFitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Geometry(e) => write!(f, "geometry error: {}", e),
            Self::DegenerateFit { stage, context } => {
                write!(f, "degenerate fit in {} stage: {}", stage, context)
            }
            Self::FitConvergence {
                model,
                iterations,
                context,
            } => write!(
                f,
                "{} fit did not converge after {} iterations: {}",
                model, iterations, context
            ),
            Self::Configuration(e) => write!(f, "configuration error: {}", e),
            Self::InvalidGrid { context } => write!(f, "invalid voxel grid: {}", context),
        }
    }
}

impl std::error::Error for BraggFitError {}

impl From<GeometryError> for BraggFitError {
    fn from(x: GeometryError) -> Self {
        Self::Geometry(x)
    }
}

impl From<ConfigurationError> for BraggFitError {
    fn from(x: ConfigurationError) -> Self {
        Self::Configuration(x)
    }
}

pub type Result<T> = std::result::Result<T, BraggFitError>;

/// Failure to read or write peak inputs and strong peak libraries.
#[derive(Debug)]
pub enum DataReadingError {
    FileReadingError {
        source: std::io::Error,
        context: &'static str,
        path: PathBuf,
    },
    ParsingError {
        source: serde_json::Error,
        context: String,
    },
}

impl DataReadingError {
    pub fn append_to_context(mut self, ctx: &str) -> Self {
        if let DataReadingError::ParsingError { context, .. } = &mut self {
            if !context.is_empty() {
                context.push_str("; ");
            }
            context.push_str(ctx);
        }
        self
    }
}

impl Display for DataReadingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileReadingError {
                source,
                context,
                path,
            } => write!(f, "{} ({}): {}", context, path.display(), source),
            Self::ParsingError { source, context } => {
                write!(f, "json error ({}): {}", context, source)
            }
        }
    }
}

impl std::error::Error for DataReadingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FileReadingError { source, .. } => Some(source),
            Self::ParsingError { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_appended() {
        let err = BraggFitError::degenerate(FitStage::TofProfile, "no signal bins")
            .append_to_context("peak 12");
        match err {
            BraggFitError::DegenerateFit { context, stage } => {
                assert_eq!(stage, FitStage::TofProfile);
                assert_eq!(context, "no signal bins; peak 12");
            }
            _ => panic!("Expected a degenerate fit error"),
        }
    }

    #[test]
    fn test_missing_parameter_message_names_parameter() {
        let err: BraggFitError = ConfigurationError::MissingParameter {
            name: "tof_constant",
        }
        .into();
        assert!(err.to_string().contains("tof_constant"));
    }
}
