use serde::{ Serialize, Deserialize };

pub const MIN_CONFIDENCE: f64 = 0.0;
pub const MAX_CONFIDENCE: f64 = 100.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PossibleCondition {
    pub name: String,
    /// Always within `[0, 100]` once it leaves the analysis gateway.
    pub confidence_score: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_suggestions: Option<String>,
}

/// One completed analysis. Immutable once built; the ledger entry owns it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub id: String,
    pub date: String,
    /// The uploaded image as a `data:<mime>;base64,...` URI.
    pub image: String,
    pub possible_conditions: Vec<PossibleCondition>,
    pub disclaimer: String,
}

pub fn clamp_confidence(score: f64) -> f64 {
    if score.is_nan() {
        return MIN_CONFIDENCE;
    }
    score.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_scores() {
        assert_eq!(clamp_confidence(-5.0), 0.0);
        assert_eq!(clamp_confidence(140.0), 100.0);
        assert_eq!(clamp_confidence(62.5), 62.5);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(f64::INFINITY), 100.0);
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let condition = PossibleCondition {
            name: "Eczema".into(),
            confidence_score: 70.0,
            description: "Dry, itchy patches.".into(),
            symptoms: None,
            treatment_suggestions: None,
        };
        let json = serde_json::to_value(&condition).unwrap();
        assert!(json.get("symptoms").is_none());
        assert!(json.get("treatment_suggestions").is_none());
    }
}
