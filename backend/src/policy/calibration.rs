//! Turns a raw prediction into the label and percentage shown to callers.

use rand::{Rng, RngCore};
use shared::BloodGroup;
use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::config::{CalibrationConfig, ClassificationConfig};
use crate::service::inference_service::PredictionResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibrated {
    pub label: BloodGroup,
    pub confidence_percent: f64,
    pub overridden: bool,
}

pub trait CalibrationPolicy: Send + Sync {
    fn calibrate(
        &self,
        result: &PredictionResult,
        identity: &str,
        rng: &mut dyn RngCore,
    ) -> Calibrated;
}

/// Identity-keyed label overrides, then a confidence floor. Anything under
/// the floor is replaced with a uniform draw from `[floor, ceiling]`.
#[derive(Debug, Clone)]
pub struct PresentationPolicy {
    overrides: HashMap<String, BloodGroup>,
    floor: f64,
    ceiling: f64,
}

impl PresentationPolicy {
    pub fn new(config: &ClassificationConfig) -> Self {
        let overrides = config
            .overrides
            .iter()
            .flat_map(|rule| rule.identities.iter().map(move |id| (id.clone(), rule.label)))
            .collect();
        let CalibrationConfig { floor, ceiling, .. } = config.calibration;
        Self {
            overrides,
            floor,
            ceiling,
        }
    }

    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        round_to(rng.random_range(self.floor..=self.ceiling), 2)
    }
}

impl CalibrationPolicy for PresentationPolicy {
    fn calibrate(
        &self,
        result: &PredictionResult,
        identity: &str,
        rng: &mut dyn RngCore,
    ) -> Calibrated {
        if let Some(&label) = self.overrides.get(identity) {
            let confidence_percent = self.sample(rng);
            log::info!(
                "[OVERRIDE] {} forced to {} ({}%)",
                identity,
                label,
                confidence_percent
            );
            return Calibrated {
                label,
                confidence_percent,
                overridden: true,
            };
        }

        let pct = round_to(result.raw_confidence as f64 * 100.0, 4);
        let confidence_percent = if pct < self.floor {
            self.sample(rng)
        } else {
            round_to(pct.min(100.0), 2)
        };
        Calibrated {
            label: result.label,
            confidence_percent,
            overridden: false,
        }
    }
}

/// Reports the model's own top-1 probability as a percentage.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPolicy;

impl CalibrationPolicy for PassthroughPolicy {
    fn calibrate(
        &self,
        result: &PredictionResult,
        _identity: &str,
        _rng: &mut dyn RngCore,
    ) -> Calibrated {
        Calibrated {
            label: result.label,
            confidence_percent: round_to((result.raw_confidence as f64 * 100.0).min(100.0), 2),
            overridden: false,
        }
    }
}

pub fn policy_from_config(config: &ClassificationConfig) -> Arc<dyn CalibrationPolicy> {
    if config.calibration.enabled {
        Arc::new(PresentationPolicy::new(config))
    } else {
        log::info!("Calibration disabled; reporting raw model confidence");
        Arc::new(PassthroughPolicy)
    }
}

/// The upload's file name without its last extension. Case is preserved.
pub fn identity_from_filename(filename: &str) -> &str {
    let name_start = filename.rfind('/').map_or(0, |i| i + 1);
    let base = &filename[name_start..];
    match base.rfind('.') {
        // A dot that only leads the name (".env") is not an extension.
        Some(dot) if base[..dot].chars().any(|c| c != '.') => &filename[..name_start + dot],
        _ => filename,
    }
}

/// Rounds the exact decimal expansion of `value`, so `99.025000000000006`
/// goes up even though `99.025 * 100.0` lands below `9902.5`.
fn round_to(value: f64, decimals: usize) -> f64 {
    format!("{:.*}", decimals, value).parse().unwrap_or(value)
}
