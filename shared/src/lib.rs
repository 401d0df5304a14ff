use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Blood-group labels the classifier can emit.
///
/// The declaration order is the order the default classification config uses
/// for the model's output indices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
    AsRefStr,
)]
pub enum BloodGroup {
    #[serde(rename = "A+")]
    #[strum(serialize = "A+")]
    APositive,
    #[serde(rename = "A-")]
    #[strum(serialize = "A-")]
    ANegative,
    #[serde(rename = "AB+")]
    #[strum(serialize = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    #[strum(serialize = "AB-")]
    AbNegative,
    #[serde(rename = "B+")]
    #[strum(serialize = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    #[strum(serialize = "B-")]
    BNegative,
    #[serde(rename = "O+")]
    #[strum(serialize = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    #[strum(serialize = "O-")]
    ONegative,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PredictionResponse {
    pub filename: String,
    pub prediction: BloodGroup,
    pub confidence: f64,
    pub original_image: String,
    pub preprocessed_image: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn labels_round_trip_through_display() {
        for group in BloodGroup::iter() {
            assert_eq!(BloodGroup::from_str(&group.to_string()).unwrap(), group);
        }
    }

    #[test]
    fn serde_uses_clinical_notation() {
        let json = serde_json::to_string(&BloodGroup::AbPositive).unwrap();
        assert_eq!(json, "\"AB+\"");
        let parsed: BloodGroup = serde_json::from_str("\"O-\"").unwrap();
        assert_eq!(parsed, BloodGroup::ONegative);
    }

    #[test]
    fn declaration_order_matches_training_vocabulary() {
        let labels: Vec<String> = BloodGroup::iter().map(|g| g.to_string()).collect();
        assert_eq!(labels, ["A+", "A-", "AB+", "AB-", "B+", "B-", "O+", "O-"]);
    }
}
