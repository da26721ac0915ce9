//! The job broker's wire record (§6 "Job broker"): `{operation_id, type,
//! card_number, duration?, promo_code?, user_id, amount, account_id?,
//! smartcard_type?}`.

use serde::{Deserialize, Serialize};
use worker_db::OperationType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub operation_id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub card_number: String,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub promo_code: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default = "default_smartcard_type")]
    pub smartcard_type: String,
}

fn default_smartcard_type() -> String {
    "CISCO".to_string()
}

impl Job {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smartcard_type_defaults_to_cisco_when_absent() {
        let raw = r#"{"operation_id":"op1","type":"START_RENEWAL","card_number":"1234567890","user_id":"u1","amount":0}"#;
        let job = Job::from_json(raw).unwrap();
        assert_eq!(job.smartcard_type, "CISCO");
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job {
            operation_id: "op1".into(),
            op_type: OperationType::CompletePurchase,
            card_number: "1234567890".into(),
            duration: None,
            promo_code: Some("PROMO10".into()),
            user_id: "u1".into(),
            amount: 50.0,
            account_id: Some("a1".into()),
            smartcard_type: "CISCO".into(),
        };
        let raw = job.to_json().unwrap();
        assert_eq!(Job::from_json(&raw).unwrap(), job);
    }
}
