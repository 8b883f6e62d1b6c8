//! Angular shapes of well-measured peaks, borrowed by weak or edge peaks.
//!
//! The library is built once (from the free fits of a first pass, or loaded
//! from a previous run) and then shared read-only between worker threads.

use crate::errors::DataReadingError;
use crate::mapping::wrap_to_pi;
use serde::{
    Deserialize,
    Serialize,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrongPeakEntry {
    pub azimuthal: f64,
    pub polar: f64,
    pub sigma_polar: f64,
    pub sigma_azimuthal: f64,
    pub correlation: f64,
}

impl StrongPeakEntry {
    /// Azimuthal differences are taken the short way around the circle.
    fn squared_distance(&self, azimuthal: f64, polar: f64) -> f64 {
        let da = wrap_to_pi(self.azimuthal - azimuthal);
        let dp = self.polar - polar;
        da * da + dp * dp
    }
}

#[derive(Debug, Default)]
pub struct StrongPeakLibraryBuilder {
    entries: Vec<StrongPeakEntry>,
}

impl StrongPeakLibraryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: StrongPeakEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = StrongPeakEntry>) -> &mut Self {
        self.entries.extend(entries);
        self
    }

    pub fn build(self) -> StrongPeakLibrary {
        StrongPeakLibrary {
            entries: self.entries.into(),
        }
    }
}

/// Immutable snapshot; cloning shares the entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrongPeakLibrary {
    entries: Arc<[StrongPeakEntry]>,
}

impl Default for StrongPeakLibrary {
    fn default() -> Self {
        Self {
            entries: Arc::from(Vec::new()),
        }
    }
}

impl StrongPeakLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StrongPeakEntry> {
        self.entries.iter()
    }

    /// Closest entry in (azimuthal, polar). Ties go to the earliest entry.
    pub fn nearest(&self, azimuthal: f64, polar: f64) -> Option<(usize, &StrongPeakEntry)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, e) in self.entries.iter().enumerate() {
            let d = e.squared_distance(azimuthal, polar);
            match best {
                Some((_, bd)) if !(d < bd) => {}
                _ => best = Some((i, d)),
            }
        }
        best.map(|(i, _)| (i, &self.entries[i]))
    }

    /// Returns a new library with `extra` appended after the current entries.
    pub fn extended(&self, extra: impl IntoIterator<Item = StrongPeakEntry>) -> Self {
        let mut builder = StrongPeakLibraryBuilder::new();
        builder.extend(self.entries.iter().copied()).extend(extra);
        builder.build()
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn load(path: &Path) -> Result<Self, DataReadingError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| DataReadingError::FileReadingError {
                source: e,
                context: "Error reading strong peak library",
                path: path.to_path_buf(),
            })?;
        let out = Self::from_json_str(&content).map_err(|e| DataReadingError::ParsingError {
            source: e,
            context: format!("strong peak library {}", path.display()),
        })?;
        info!(
            "Loaded {} strong peak entries from {}",
            out.len(),
            path.display()
        );
        Ok(out)
    }

    pub fn save(&self, path: &Path) -> Result<(), DataReadingError> {
        let content = self
            .to_json_string()
            .map_err(|e| DataReadingError::ParsingError {
                source: e,
                context: "serializing strong peak library".to_string(),
            })?;
        std::fs::write(path, content).map_err(|e| DataReadingError::FileReadingError {
            source: e,
            context: "Error writing strong peak library",
            path: path.to_path_buf(),
        })
    }
}

impl FromIterator<StrongPeakEntry> for StrongPeakLibrary {
    fn from_iter<T: IntoIterator<Item = StrongPeakEntry>>(iter: T) -> Self {
        let mut builder = StrongPeakLibraryBuilder::new();
        builder.extend(iter);
        builder.build()
    }
}
