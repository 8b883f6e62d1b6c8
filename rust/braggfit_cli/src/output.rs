use crate::errors::CliError;
use braggfit::{
    FitResult,
    FitStatus,
};
use serde::Serialize;
use std::path::Path;

/// Sink for per-peak results.
pub trait PeakTableWriter {
    fn write_result(&mut self, result: &FitResult) -> Result<(), CliError>;

    fn finish(self) -> Result<(), CliError>;
}

/// One CSV row per peak; model columns are empty for failed peaks.
#[derive(Debug, Serialize)]
struct PeakRow<'a> {
    peak_id: u32,
    bank: Option<&'a str>,
    status: &'static str,
    failure_reason: Option<&'a str>,
    intensity: f64,
    sigma: f64,
    i_over_sigma: f64,
    a1: f64,
    a0: f64,
    scaling_chi2: f64,
    pp_lambda: f64,
    n_signal_voxels: usize,
    qx: Option<f64>,
    qy: Option<f64>,
    qz: Option<f64>,
    dq: Option<f64>,
    tof_t0: Option<f64>,
    tof_chi2: Option<f64>,
    angular_mode: Option<&'static str>,
    mu_polar: Option<f64>,
    mu_azimuthal: Option<f64>,
    sigma_polar: Option<f64>,
    sigma_azimuthal: Option<f64>,
    correlation: Option<f64>,
    angular_chi2: Option<f64>,
    degenerate_covariance: bool,
    forced_refit_error: Option<&'a str>,
}

impl<'a> From<&'a FitResult> for PeakRow<'a> {
    fn from(r: &'a FitResult) -> Self {
        let tof = r.tof_profile.as_ref();
        let ang = r.angular_profile.as_ref();
        PeakRow {
            peak_id: r.peak_id,
            bank: r.bank.as_deref(),
            status: match r.status {
                FitStatus::Integrated => "integrated",
                FitStatus::Failed { .. } => "failed",
            },
            failure_reason: r.failure_reason(),
            intensity: r.intensity,
            sigma: r.sigma,
            i_over_sigma: r.signal_to_noise(),
            a1: r.a1,
            a0: r.a0,
            scaling_chi2: r.scaling_reduced_chi_squared,
            pp_lambda: r.pp_lambda,
            n_signal_voxels: r.n_signal_voxels,
            qx: r.refined_q.map(|q| q[0]),
            qy: r.refined_q.map(|q| q[1]),
            qz: r.refined_q.map(|q| q[2]),
            dq: r.dq,
            tof_t0: tof.map(|t| t.t0),
            tof_chi2: tof.map(|t| t.reduced_chi_squared),
            angular_mode: ang.map(|a| a.mode.as_str()),
            mu_polar: ang.map(|a| a.mu_polar),
            mu_azimuthal: ang.map(|a| a.mu_azimuthal),
            sigma_polar: ang.map(|a| a.sigma_polar),
            sigma_azimuthal: ang.map(|a| a.sigma_azimuthal),
            correlation: ang.map(|a| a.correlation),
            angular_chi2: ang.map(|a| a.reduced_chi_squared),
            degenerate_covariance: r.degenerate_covariance,
            forced_refit_error: r.forced_refit_error.as_deref(),
        }
    }
}

pub struct CsvPeakTableWriter<W: std::io::Write> {
    writer: csv::Writer<W>,
    nwritten: usize,
}

impl CsvPeakTableWriter<std::fs::File> {
    pub fn create(path: &Path) -> Result<Self, CliError> {
        let writer = csv::Writer::from_path(path).map_err(|e| CliError::Io {
            source: e.to_string(),
            path: Some(path.to_string_lossy().to_string()),
        })?;
        Ok(Self {
            writer,
            nwritten: 0,
        })
    }
}

impl<W: std::io::Write> CsvPeakTableWriter<W> {
    pub fn from_writer(inner: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(inner),
            nwritten: 0,
        }
    }

    pub fn num_written(&self) -> usize {
        self.nwritten
    }

    pub fn into_inner(self) -> Result<W, CliError> {
        self.writer.into_inner().map_err(|e| CliError::Io {
            source: e.to_string(),
            path: None,
        })
    }
}

impl<W: std::io::Write> PeakTableWriter for CsvPeakTableWriter<W> {
    fn write_result(&mut self, result: &FitResult) -> Result<(), CliError> {
        self.writer.serialize(PeakRow::from(result))?;
        self.nwritten += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<(), CliError> {
        self.writer.flush().map_err(|e| CliError::Io {
            source: e.to_string(),
            path: None,
        })
    }
}

pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), CliError> {
    let file = std::fs::File::create(path).map_err(|e| CliError::Io {
        source: e.to_string(),
        path: Some(path.to_string_lossy().to_string()),
    })?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), value).map_err(|e| CliError::Io {
        source: e.to_string(),
        path: Some(path.to_string_lossy().to_string()),
    })
}
