//! Row types for the relational store, matching the data model.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DealerAccount {
    pub id: String,
    pub username: String,
    pub password: String,
    pub totp_seed: Option<String>,
    pub proxy_id: Option<String>,
    pub active: bool,
    pub priority: i64,
    pub last_known_balance: Option<f64>,
    pub balance_updated_at: Option<i64>,
    pub cooldown_until: i64,
    pub fail_reason: Option<String>,
    pub last_used_at: i64,
}

impl DealerAccount {
    /// Whether the pool may consider this account a candidate right now.
    /// Busy-lease state lives in the shared store, not here.
    pub fn is_usable(&self, now: i64) -> bool {
        self.active && now >= self.cooldown_until
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    StartRenewal,
    CompletePurchase,
    ConfirmPurchase,
    CancelConfirm,
    SignalCheck,
    SignalActivate,
    SignalRefresh,
    StartInstallment,
    ConfirmInstallment,
    CheckAccountBalance,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::StartRenewal => "START_RENEWAL",
            OperationType::CompletePurchase => "COMPLETE_PURCHASE",
            OperationType::ConfirmPurchase => "CONFIRM_PURCHASE",
            OperationType::CancelConfirm => "CANCEL_CONFIRM",
            OperationType::SignalCheck => "SIGNAL_CHECK",
            OperationType::SignalActivate => "SIGNAL_ACTIVATE",
            OperationType::SignalRefresh => "SIGNAL_REFRESH",
            OperationType::StartInstallment => "START_INSTALLMENT",
            OperationType::ConfirmInstallment => "CONFIRM_INSTALLMENT",
            OperationType::CheckAccountBalance => "CHECK_ACCOUNT_BALANCE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "START_RENEWAL" => OperationType::StartRenewal,
            "COMPLETE_PURCHASE" => OperationType::CompletePurchase,
            "CONFIRM_PURCHASE" => OperationType::ConfirmPurchase,
            "CANCEL_CONFIRM" => OperationType::CancelConfirm,
            "SIGNAL_CHECK" => OperationType::SignalCheck,
            "SIGNAL_ACTIVATE" => OperationType::SignalActivate,
            "SIGNAL_REFRESH" => OperationType::SignalRefresh,
            "START_INSTALLMENT" => OperationType::StartInstallment,
            "CONFIRM_INSTALLMENT" => OperationType::ConfirmInstallment,
            "CHECK_ACCOUNT_BALANCE" => OperationType::CheckAccountBalance,
            _ => return None,
        })
    }
}

/// The global status set driven by the core (§4.6). Terminal states are
/// `Completed`, `Failed`, `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Processing,
    AwaitingCaptcha,
    AwaitingPackage,
    Completing,
    AwaitingFinalConfirm,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::Processing => "PROCESSING",
            OperationStatus::AwaitingCaptcha => "AWAITING_CAPTCHA",
            OperationStatus::AwaitingPackage => "AWAITING_PACKAGE",
            OperationStatus::Completing => "COMPLETING",
            OperationStatus::AwaitingFinalConfirm => "AWAITING_FINAL_CONFIRM",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => OperationStatus::Pending,
            "PROCESSING" => OperationStatus::Processing,
            "AWAITING_CAPTCHA" => OperationStatus::AwaitingCaptcha,
            "AWAITING_PACKAGE" => OperationStatus::AwaitingPackage,
            "COMPLETING" => OperationStatus::Completing,
            "AWAITING_FINAL_CONFIRM" => OperationStatus::AwaitingFinalConfirm,
            "COMPLETED" => OperationStatus::Completed,
            "FAILED" => OperationStatus::Failed,
            "CANCELLED" => OperationStatus::Cancelled,
            _ => return None,
        })
    }

    /// P2: once terminal, status never changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// The tagged `response_data` variant described in the design notes: a
/// discriminated record replacing the upstream's dynamic JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResponseData {
    AwaitingPackageSnapshot {
        session: serde_json::Value,
        dealer_balance: Option<f64>,
        saved_at: i64,
        smartcard_type: String,
    },
    AwaitingFinalConfirmSnapshot {
        session: serde_json::Value,
        dealer_balance: Option<f64>,
        saved_at: i64,
        #[serde(default)]
        is_installment: bool,
    },
    SignalCheckSnapshot {
        card_status: serde_json::Value,
        contracts: serde_json::Value,
        session: serde_json::Value,
        checked_at: i64,
        awaiting_activate: bool,
    },
    InstallmentSnapshot {
        installment: serde_json::Value,
        subscriber: serde_json::Value,
        dealer_balance: Option<f64>,
        is_installment: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub user_id: String,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub card_number: String,
    pub account_id: Option<String>,
    pub amount: f64,
    pub selected_package: Option<String>,
    pub stb_number: Option<String>,
    pub captcha_image: Option<String>,
    pub captcha_solution: Option<String>,
    pub response_data: Option<ResponseData>,
    pub response_message: Option<String>,
    pub heartbeat_at: Option<i64>,
    pub heartbeat_expiry: Option<i64>,
    pub final_confirm_expiry: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Refund,
    OperationDeduct,
    Correction,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Withdraw => "WITHDRAW",
            TransactionKind::Refund => "REFUND",
            TransactionKind::OperationDeduct => "OPERATION_DEDUCT",
            TransactionKind::Correction => "CORRECTION",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "DEPOSIT" => TransactionKind::Deposit,
            "WITHDRAW" => TransactionKind::Withdraw,
            "REFUND" => TransactionKind::Refund,
            "OPERATION_DEDUCT" => TransactionKind::OperationDeduct,
            "CORRECTION" => TransactionKind::Correction,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub operation_id: String,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: f64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_type_round_trips_through_its_string_form() {
        for t in [
            OperationType::StartRenewal,
            OperationType::CompletePurchase,
            OperationType::ConfirmPurchase,
            OperationType::CancelConfirm,
            OperationType::SignalCheck,
            OperationType::SignalActivate,
            OperationType::SignalRefresh,
            OperationType::StartInstallment,
            OperationType::ConfirmInstallment,
            OperationType::CheckAccountBalance,
        ] {
            assert_eq!(OperationType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn terminal_statuses_are_exactly_completed_failed_cancelled() {
        for s in [
            OperationStatus::Pending,
            OperationStatus::Processing,
            OperationStatus::AwaitingCaptcha,
            OperationStatus::AwaitingPackage,
            OperationStatus::Completing,
            OperationStatus::AwaitingFinalConfirm,
        ] {
            assert!(!s.is_terminal());
        }
        for s in [
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn dealer_account_usable_iff_active_and_past_cooldown() {
        let account = DealerAccount {
            id: "a1".into(),
            username: "u".into(),
            password: "p".into(),
            totp_seed: None,
            proxy_id: None,
            active: true,
            priority: 0,
            last_known_balance: None,
            balance_updated_at: None,
            cooldown_until: 1_000,
            fail_reason: None,
            last_used_at: 0,
        };
        assert!(!account.is_usable(500));
        assert!(account.is_usable(1_000));
        assert!(account.is_usable(1_500));

        let inactive = DealerAccount {
            active: false,
            cooldown_until: 0,
            ..account
        };
        assert!(!inactive.is_usable(10_000));
    }
}
