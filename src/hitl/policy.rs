use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::eval::lookup;

/// When an agent node needs a human sign-off before its successors run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalMode {
    /// Never gate.
    FullAuto,
    /// Gate when the output's confidence is below the threshold.
    Threshold,
    /// Gate a random sample of outputs.
    SpotCheck,
    /// Always gate.
    #[default]
    PreApproval,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApprovalPolicy {
    #[serde(default)]
    pub mode: ApprovalMode,
    /// path of the confidence score inside the agent output
    #[serde(default = "default_confidence_field")]
    pub confidence_field: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// share of outputs routed to a reviewer in spot-check mode
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_confidence_field() -> String {
    "confidence".to_string()
}

fn default_threshold() -> f64 {
    0.8
}

fn default_sample_rate() -> f64 {
    0.1
}

/// Outcome of checking an agent output against its approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateCheck {
    /// The policy is already satisfied; record an automatic approval.
    Bypass,
    /// Park the node until a human decides.
    Required,
}

impl ApprovalPolicy {
    pub fn new(mode: ApprovalMode) -> Self {
        Self {
            mode,
            confidence_field: default_confidence_field(),
            threshold: default_threshold(),
            sample_rate: default_sample_rate(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(format!("approval threshold {} is outside [0, 1]", self.threshold));
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(format!("approval sample_rate {} is outside [0, 1]", self.sample_rate));
        }
        Ok(())
    }

    pub fn check(
        &self,
        output: &Value,
    ) -> GateCheck {
        let required = match self.mode {
            ApprovalMode::FullAuto => false,
            ApprovalMode::PreApproval => true,
            // a missing or non-numeric score counts as low confidence
            ApprovalMode::Threshold => !lookup(output, &self.confidence_field).and_then(Value::as_f64).is_some_and(|score| score >= self.threshold),
            ApprovalMode::SpotCheck => rand::random::<f64>() < self.sample_rate,
        };

        if required { GateCheck::Required } else { GateCheck::Bypass }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_threshold_mode() {
        let policy = ApprovalPolicy::new(ApprovalMode::Threshold);
        assert_eq!(policy.check(&json!({"confidence": 0.95})), GateCheck::Bypass);
        assert_eq!(policy.check(&json!({"confidence": 0.5})), GateCheck::Required);
        assert_eq!(policy.check(&json!({"other": 1})), GateCheck::Required);
    }

    #[test]
    fn test_fixed_modes() {
        assert_eq!(ApprovalPolicy::new(ApprovalMode::FullAuto).check(&json!(null)), GateCheck::Bypass);
        assert_eq!(ApprovalPolicy::new(ApprovalMode::PreApproval).check(&json!({"confidence": 1.0})), GateCheck::Required);
    }

    #[test]
    fn test_spot_check_extremes() {
        let mut policy = ApprovalPolicy::new(ApprovalMode::SpotCheck);
        policy.sample_rate = 0.0;
        assert_eq!(policy.check(&json!({})), GateCheck::Bypass);
        policy.sample_rate = 1.0;
        assert_eq!(policy.check(&json!({})), GateCheck::Required);
    }

    #[test]
    fn test_policy_serde_defaults() {
        let policy: ApprovalPolicy = serde_json::from_value(json!({"mode": "threshold", "threshold": 0.6})).unwrap();
        assert_eq!(policy.confidence_field, "confidence");
        assert_eq!(policy.threshold, 0.6);
        assert!(policy.validate().is_ok());

        let bad: ApprovalPolicy = serde_json::from_value(json!({"mode": "spot_check", "sample_rate": 2.0})).unwrap();
        assert!(bad.validate().is_err());
    }
}
