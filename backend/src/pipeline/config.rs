use serde::{Deserialize, Serialize};
use shared::BloodGroup;
use std::collections::HashSet;
use std::path::Path;

use crate::config::ConfigError;

const DEFAULT_CLASSIFICATION_CONFIG: &str = include_str!("../../config/classification.yaml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    pub version: f32,
    pub labels: Vec<BloodGroup>,
    #[serde(default)]
    pub overrides: Vec<OverrideRule>,
    pub calibration: CalibrationConfig,
}

/// Forces `label` for every request whose identity is listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRule {
    pub label: BloodGroup,
    pub identities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub enabled: bool,
    pub floor: f64,
    pub ceiling: f64,
}

impl ClassificationConfig {
    /// Reads the YAML file at `path`, or the bundled default when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let config_str =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Self::from_yaml_str(&config_str)
            }
            None => Self::from_yaml_str(DEFAULT_CLASSIFICATION_CONFIG),
        }
    }

    pub fn from_yaml_str(config_str: &str) -> Result<Self, ConfigError> {
        let config: ClassificationConfig = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_classes(&self) -> i64 {
        self.labels.len() as i64
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.labels.is_empty() {
            return Err(ConfigError::Invalid("label vocabulary is empty".into()));
        }

        let mut seen_labels = HashSet::new();
        for label in &self.labels {
            if !seen_labels.insert(label) {
                return Err(ConfigError::Invalid(format!("label {} listed twice", label)));
            }
        }

        let mut seen_identities: HashSet<&str> = HashSet::new();
        for rule in &self.overrides {
            if !self.labels.contains(&rule.label) {
                return Err(ConfigError::Invalid(format!(
                    "override label {} is not in the vocabulary",
                    rule.label
                )));
            }
            for identity in &rule.identities {
                if !seen_identities.insert(identity.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "identity {} appears in more than one override list",
                        identity
                    )));
                }
            }
        }

        let calibration = &self.calibration;
        if !(calibration.floor > 0.0
            && calibration.floor <= calibration.ceiling
            && calibration.ceiling <= 100.0)
        {
            return Err(ConfigError::Invalid(format!(
                "calibration range [{}, {}] must lie within (0, 100]",
                calibration.floor, calibration.ceiling
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_config_is_valid() {
        let config = ClassificationConfig::load(None).unwrap();
        assert_eq!(config.num_classes(), 8);
        assert_eq!(config.labels[2], BloodGroup::AbPositive);
        assert_eq!(config.overrides.len(), 2);
        assert!(config.calibration.enabled);
        assert!((config.calibration.floor - 99.01).abs() < 1e-9);
    }

    #[test]
    fn rejects_overlapping_override_lists() {
        let yaml = r#"
version: 1.0
labels: ["A+", "AB+"]
overrides:
  - label: "AB+"
    identities: [same]
  - label: "A+"
    identities: [same]
calibration: { enabled: true, floor: 99.01, ceiling: 99.99 }
"#;
        let err = ClassificationConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_label() {
        let yaml = r#"
version: 1.0
labels: ["A+", "C+"]
calibration: { enabled: true, floor: 99.01, ceiling: 99.99 }
"#;
        let err = ClassificationConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_inverted_calibration_range() {
        let yaml = r#"
version: 1.0
labels: ["A+"]
calibration: { enabled: true, floor: 99.99, ceiling: 99.01 }
"#;
        assert!(ClassificationConfig::from_yaml_str(yaml).is_err());
    }
}
