//! Result records for each [`crate::UpstreamClient`] method (§4.5).

use resource_cache::PackageOption;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginResult {
    pub success: bool,
    pub requires_captcha: bool,
    pub captcha_image: Option<String>,
    pub error: Option<String>,
}

impl LoginResult {
    pub fn success() -> Self {
        Self {
            success: true,
            requires_captcha: false,
            captcha_image: None,
            error: None,
        }
    }

    pub fn captcha_required(image: impl Into<String>) -> Self {
        Self {
            success: false,
            requires_captcha: true,
            captcha_image: Some(image.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            requires_captcha: false,
            captcha_image: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadPackagesResult {
    pub success: bool,
    pub packages: Vec<PackageOption>,
    pub stb_number: Option<String>,
    pub dealer_balance: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletePurchaseResult {
    pub awaiting_confirm: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalResult {
    pub success: bool,
    pub card_status: serde_json::Value,
    pub contracts: serde_json::Value,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallmentResult {
    pub exists: bool,
    pub installment: Option<serde_json::Value>,
    pub subscriber: Option<serde_json::Value>,
    pub dealer_balance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayInstallmentResult {
    pub success: bool,
    pub message: String,
}
