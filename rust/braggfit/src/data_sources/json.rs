use super::PeakSource;
use crate::errors::DataReadingError;
use crate::pipeline::PeakInput;
use std::io::{
    BufRead,
    BufReader,
};
use std::path::{
    Path,
    PathBuf,
};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakFileFormat {
    /// A single JSON array of peaks.
    Json,
    /// One peak object per line.
    NdJson,
}

impl PeakFileFormat {
    pub fn detect_from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("ndjson") | Some("jsonl") => PeakFileFormat::NdJson,
            _ => PeakFileFormat::Json,
        }
    }
}

/// Peaks stored as JSON on disk, each `{"geometry": {...}, "grid": {...}}`.
#[derive(Debug, Clone)]
pub struct JsonPeakSource {
    path: PathBuf,
    format: PeakFileFormat,
}

impl JsonPeakSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = PeakFileFormat::detect_from_path(&path);
        Self { path, format }
    }

    pub fn with_format(path: impl Into<PathBuf>, format: PeakFileFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse_json(content: &str) -> Result<Vec<PeakInput>, DataReadingError> {
        serde_json::from_str(content).map_err(|e| DataReadingError::ParsingError {
            source: e,
            context: "json array of peaks".to_string(),
        })
    }

    pub fn parse_ndjson<R: BufRead>(reader: R) -> Result<Vec<PeakInput>, DataReadingError> {
        let mut out = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| DataReadingError::ParsingError {
                source: serde_json::Error::io(e),
                context: format!("line {}", lineno + 1),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let peak = serde_json::from_str(&line).map_err(|e| DataReadingError::ParsingError {
                source: e,
                context: format!("line {}", lineno + 1),
            })?;
            out.push(peak);
        }
        Ok(out)
    }
}

impl PeakSource for JsonPeakSource {
    fn describe(&self) -> String {
        format!("{:?} peaks from {}", self.format, self.path.display())
    }

    fn read_peaks(&self) -> Result<Vec<PeakInput>, DataReadingError> {
        let file = std::fs::File::open(&self.path).map_err(|e| {
            DataReadingError::FileReadingError {
                source: e,
                context: "Error opening peak file",
                path: self.path.clone(),
            }
        })?;
        let reader = BufReader::new(file);
        let peaks = match self.format {
            PeakFileFormat::Json => {
                serde_json::from_reader(reader).map_err(|e| DataReadingError::ParsingError {
                    source: e,
                    context: "json array of peaks".to_string(),
                })
            }
            PeakFileFormat::NdJson => Self::parse_ndjson(reader),
        }
        .map_err(|e| e.append_to_context(&self.path.display().to_string()))?;
        info!("Read {} peaks from {}", peaks.len(), self.path.display());
        Ok(peaks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEAK: &str = r#"{"geometry": {"peak_id": 4, "l1": 30.0, "l2": 0.45, "scattering_half_angle": 0.7, "q_nominal": [1.0, 2.0, 3.0], "detector_row": 10, "detector_col": 20}, "grid": {"shape": [1, 1, 2], "origin": [1.0, 2.0, 3.0], "spacing": [0.1, 0.1, 0.1], "counts": [0.0, 5.0]}}"#;

    #[test]
    fn test_format_detection() {
        assert_eq!(
            PeakFileFormat::detect_from_path(Path::new("peaks.ndjson")),
            PeakFileFormat::NdJson
        );
        assert_eq!(
            PeakFileFormat::detect_from_path(Path::new("peaks.json")),
            PeakFileFormat::Json
        );
    }

    #[test]
    fn test_parse_json_array() {
        let peaks = JsonPeakSource::parse_json(&format!("[{}]", PEAK)).unwrap();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].geometry.peak_id, 4);
        assert_eq!(peaks[0].geometry.bank, None);
        assert_eq!(peaks[0].grid.total_counts(), 5.0);
    }

    #[test]
    fn test_parse_ndjson_skips_blank_lines() {
        let content = format!("{}\n\n{}\n", PEAK, PEAK);
        let peaks = JsonPeakSource::parse_ndjson(content.as_bytes()).unwrap();
        assert_eq!(peaks.len(), 2);
    }

    #[test]
    fn test_invalid_grid_is_a_parse_error() {
        let bad = PEAK.replace("[0.0, 5.0]", "[0.0, -5.0]");
        let err = JsonPeakSource::parse_json(&format!("[{}]", bad)).unwrap_err();
        assert!(matches!(err, DataReadingError::ParsingError { .. }));
    }

    #[test]
    fn test_missing_file() {
        let src = JsonPeakSource::new("/definitely/not/here.json");
        let err = src.read_peaks().unwrap_err();
        assert!(matches!(err, DataReadingError::FileReadingError { .. }));
    }
}
