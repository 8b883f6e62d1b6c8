use super::timings::FitTimings;
use crate::background::SignalMask;
use crate::library::StrongPeakEntry;
use crate::profiles::{
    AngularFitMode,
    AngularProfileModel,
    JointProfile,
    TofProfileModel,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FitStatus {
    Integrated,
    Failed { reason: String },
}

/// Outcome of fitting and integrating one peak.
///
/// The composed model and the signal mask are kept in memory only.
#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    pub peak_id: u32,
    pub bank: Option<String>,
    pub status: FitStatus,
    pub intensity: f64,
    pub sigma: f64,
    pub a1: f64,
    pub a0: f64,
    pub scaling_reduced_chi_squared: f64,
    pub pp_lambda: f64,
    pub n_signal_voxels: usize,
    pub refined_q: Option<[f64; 3]>,
    pub dq: Option<f64>,
    pub tof_profile: Option<TofProfileModel>,
    pub angular_profile: Option<AngularProfileModel>,
    /// The angular covariance was not positive-definite; intensity is zero.
    pub degenerate_covariance: bool,
    /// The peak asked for a borrowed angular shape and the library had none.
    /// Set whether or not the later stages succeeded.
    pub wants_borrowed_shape: bool,
    /// Why the re-fit with a borrowed shape failed; the first-pass result was kept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_refit_error: Option<String>,
    #[serde(skip)]
    pub composed: Option<Vec<f64>>,
    #[serde(skip)]
    pub mask: Option<SignalMask>,
    pub timings: FitTimings,
}

impl FitResult {
    pub(crate) fn failed(peak_id: u32, bank: Option<String>, reason: String) -> Self {
        Self {
            peak_id,
            bank,
            status: FitStatus::Failed { reason },
            intensity: 0.0,
            sigma: 0.0,
            a1: 0.0,
            a0: 0.0,
            scaling_reduced_chi_squared: f64::NAN,
            pp_lambda: 0.0,
            n_signal_voxels: 0,
            refined_q: None,
            dq: None,
            tof_profile: None,
            angular_profile: None,
            degenerate_covariance: false,
            wants_borrowed_shape: false,
            forced_refit_error: None,
            composed: None,
            mask: None,
            timings: FitTimings::default(),
        }
    }

    pub(crate) fn integrated(
        peak_id: u32,
        bank: Option<String>,
        mask: SignalMask,
        tof: TofProfileModel,
        angular: AngularProfileModel,
        joint: JointProfile,
    ) -> Self {
        Self {
            peak_id,
            bank,
            status: FitStatus::Integrated,
            intensity: joint.intensity,
            sigma: joint.sigma,
            a1: joint.a1,
            a0: joint.a0,
            scaling_reduced_chi_squared: joint.reduced_chi_squared,
            pp_lambda: mask.pp_lambda(),
            n_signal_voxels: mask.num_signal(),
            refined_q: Some(joint.refined_q),
            dq: Some(joint.dq),
            tof_profile: Some(tof),
            angular_profile: Some(angular),
            degenerate_covariance: joint.degenerate_covariance,
            wants_borrowed_shape: false,
            forced_refit_error: None,
            composed: Some(joint.scaled),
            mask: Some(mask),
            timings: FitTimings::default(),
        }
    }

    pub fn is_integrated(&self) -> bool {
        self.status == FitStatus::Integrated
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            FitStatus::Failed { reason } => Some(reason),
            FitStatus::Integrated => None,
        }
    }

    pub fn angular_mode(&self) -> Option<AngularFitMode> {
        self.angular_profile.as_ref().map(|a| a.mode)
    }

    /// `I / σ`, zero when σ is zero.
    pub fn signal_to_noise(&self) -> f64 {
        if self.sigma > 0.0 {
            self.intensity / self.sigma
        } else {
            0.0
        }
    }

    /// The angular shape of this peak, if it is good enough to lend to weaker peaks.
    pub fn strong_peak_entry(&self, force_cutoff: f64) -> Option<StrongPeakEntry> {
        if !self.is_integrated() {
            return None;
        }
        let angular = self.angular_profile.as_ref()?;
        if self.degenerate_covariance
            || angular.mode != AngularFitMode::Free
            || angular.is_degenerate()
            || angular.histogram_total < force_cutoff
        {
            return None;
        }
        Some(angular.as_strong_peak_entry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn angular(mode: AngularFitMode, total: f64) -> AngularProfileModel {
        AngularProfileModel {
            amplitude: 10.0,
            mu_polar: 1.2,
            mu_azimuthal: 0.4,
            sigma_polar: 0.002,
            sigma_azimuthal: 0.003,
            correlation: 0.1,
            background: 0.0,
            mode,
            reduced_chi_squared: 1.0,
            std_errors: vec![],
            histogram_total: total,
        }
    }

    fn with_angular(model: AngularProfileModel) -> FitResult {
        let mut out = FitResult::failed(1, None, String::new());
        out.status = FitStatus::Integrated;
        out.angular_profile = Some(model);
        out
    }

    #[test]
    fn test_strong_peak_entry_requires_free_strong_fit() {
        let strong = with_angular(angular(AngularFitMode::Free, 1000.0));
        let entry = strong.strong_peak_entry(250.0).unwrap();
        assert_eq!(entry.polar, 1.2);
        assert_eq!(entry.sigma_azimuthal, 0.003);

        let weak = with_angular(angular(AngularFitMode::Free, 100.0));
        assert!(weak.strong_peak_entry(250.0).is_none());

        let unavailable = with_angular(angular(AngularFitMode::ForcedUnavailable, 1000.0));
        assert!(unavailable.strong_peak_entry(250.0).is_none());

        let mut collapsed = with_angular(angular(AngularFitMode::Free, 1000.0));
        collapsed.degenerate_covariance = true;
        assert!(collapsed.strong_peak_entry(250.0).is_none());
    }

    #[test]
    fn test_failed_result_is_zero_and_serializes() {
        let out = FitResult::failed(9, Some("bank1".into()), "no signal".into());
        assert!(!out.is_integrated());
        assert_eq!(out.intensity, 0.0);
        assert_eq!(out.failure_reason(), Some("no signal"));
        assert!(out.strong_peak_entry(0.0).is_none());
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["status"]["status"], "failed");
        assert_eq!(json["status"]["reason"], "no signal");
        assert_eq!(json["degenerate_covariance"], false);
        assert!(json.get("forced_refit_error").is_none());
    }
}
