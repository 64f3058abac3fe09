//! Account and lease records.
//!
//! Field names on the wire (JSON payloads and change-feed attribute names)
//! follow the persisted record shape, e.g. `AccountStatus`, `LeaseStatusReason`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque key/value metadata attached to an account.
pub type Metadata = BTreeMap<String, Value>;

/// Returned when a status string does not name a known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind} value: {value}")]
pub struct UnknownStatus {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Canonical string form, as persisted.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle status of a pooled account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Awaiting (or undergoing) reset; not available for leasing.
    NotReady,
    /// Clean and available for a new lease.
    Ready,
    /// Assigned to a principal through an Active lease.
    Leased,
}

string_enum!(AccountStatus, "AccountStatus", {
    NotReady => "NotReady",
    Ready => "Ready",
    Leased => "Leased",
});

/// Status of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseStatus {
    /// The principal may use the account.
    Active,
    /// Retired; kept for history and reactivation.
    Inactive,
    /// Temporarily held because of a budget threshold.
    FinanceLock,
    /// Held while the account is being reset.
    ResetLock,
    /// Held for both budget and reset reasons.
    ResetFinanceLock,
}

string_enum!(LeaseStatus, "LeaseStatus", {
    Active => "Active",
    Inactive => "Inactive",
    FinanceLock => "FinanceLock",
    ResetLock => "ResetLock",
    ResetFinanceLock => "ResetFinanceLock",
});

impl LeaseStatus {
    /// All statuses, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Active,
        Self::Inactive,
        Self::FinanceLock,
        Self::ResetLock,
        Self::ResetFinanceLock,
    ];

    /// `true` for the three lock states.
    #[must_use]
    pub const fn is_lock(&self) -> bool {
        matches!(
            self,
            Self::FinanceLock | Self::ResetLock | Self::ResetFinanceLock
        )
    }
}

/// Why a lease holds its current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseStatusReason {
    /// Lease is in use.
    Active,
    /// The lease passed its expiry date.
    Expired,
    /// Spend exceeded the lease budget.
    OverBudget,
    /// The principal or an operator ended the lease.
    Destroyed,
    /// Provisioning failed and the lease was rolled back.
    Rollback,
}

string_enum!(LeaseStatusReason, "LeaseStatusReason", {
    Active => "Active",
    Expired => "Expired",
    OverBudget => "OverBudget",
    Destroyed => "Destroyed",
    Rollback => "Rollback",
});

impl LeaseStatusReason {
    /// Reasons a caller may give when decommissioning a lease.
    #[must_use]
    pub const fn is_decommission_reason(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Expired | Self::OverBudget)
    }
}

/// A pooled cloud account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier.
    #[serde(rename = "Id")]
    pub id: String,
    /// Current status; changed only through conditional transitions.
    #[serde(rename = "AccountStatus")]
    pub status: AccountStatus,
    /// Role the engine assumes to administer the account.
    #[serde(rename = "AdminRoleArn")]
    pub admin_role_arn: String,
    /// Role granted to the leasing principal.
    #[serde(rename = "PrincipalRoleArn", default)]
    pub principal_role_arn: String,
    /// Hash of the principal policy last applied, if any.
    #[serde(
        rename = "PrincipalPolicyHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub principal_policy_hash: Option<String>,
    /// Opaque metadata.
    #[serde(rename = "Metadata", default)]
    pub metadata: Metadata,
    /// Creation time, epoch seconds.
    #[serde(rename = "CreatedOn")]
    pub created_on: i64,
    /// Last write time, epoch seconds.
    #[serde(rename = "LastModifiedOn")]
    pub last_modified_on: i64,
}

impl Account {
    /// New account record stamped with `now`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        status: AccountStatus,
        admin_role_arn: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id: id.into(),
            status,
            admin_role_arn: admin_role_arn.into(),
            principal_role_arn: String::new(),
            principal_policy_hash: None,
            metadata: Metadata::new(),
            created_on: now,
            last_modified_on: now,
        }
    }
}

/// A principal's lease on an account. Keyed by `(account_id, principal_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Leased account.
    #[serde(rename = "AccountId")]
    pub account_id: String,
    /// Leasing principal.
    #[serde(rename = "PrincipalId")]
    pub principal_id: String,
    /// Globally unique lease id, fixed at creation.
    #[serde(rename = "Id")]
    pub id: String,
    /// Current status.
    #[serde(rename = "LeaseStatus")]
    pub status: LeaseStatus,
    /// Reason for the current status.
    #[serde(rename = "LeaseStatusReason")]
    pub status_reason: LeaseStatusReason,
    /// Budget ceiling.
    #[serde(rename = "BudgetAmount")]
    pub budget_amount: f64,
    /// ISO currency code of the budget.
    #[serde(rename = "BudgetCurrency")]
    pub budget_currency: String,
    /// Addresses notified on budget thresholds.
    #[serde(rename = "BudgetNotificationEmails", default)]
    pub budget_notification_emails: Vec<String>,
    /// Creation time, epoch seconds.
    #[serde(rename = "CreatedOn")]
    pub created_on: i64,
    /// Last write time, epoch seconds.
    #[serde(rename = "LastModifiedOn")]
    pub last_modified_on: i64,
    /// Last status change, epoch seconds.
    #[serde(rename = "LeaseStatusModifiedOn")]
    pub status_modified_on: i64,
    /// Expiry, epoch seconds.
    #[serde(rename = "ExpiresOn")]
    pub expires_on: i64,
}

/// Budget requested for a lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseBudget {
    /// Budget ceiling.
    pub amount: f64,
    /// ISO currency code.
    pub currency: String,
    /// Addresses notified on budget thresholds.
    #[serde(default)]
    pub notification_emails: Vec<String>,
    /// Requested expiry, epoch seconds; the configured default applies when absent.
    #[serde(default)]
    pub expires_on: Option<i64>,
}

impl LeaseBudget {
    /// Budget without notification addresses or explicit expiry.
    #[must_use]
    pub fn new(amount: f64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
            notification_emails: Vec::new(),
            expires_on: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_parse_back() {
        for status in LeaseStatus::ALL {
            assert_eq!(status.as_str().parse::<LeaseStatus>().unwrap(), status);
        }
        assert_eq!(
            "NotReady".parse::<AccountStatus>().unwrap(),
            AccountStatus::NotReady
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "Paused".parse::<LeaseStatus>().unwrap_err();
        assert_eq!(err.kind, "LeaseStatus");
        assert_eq!(err.to_string(), "Unknown LeaseStatus value: Paused");
    }

    #[test]
    fn lock_states() {
        assert!(LeaseStatus::FinanceLock.is_lock());
        assert!(LeaseStatus::ResetFinanceLock.is_lock());
        assert!(!LeaseStatus::Active.is_lock());
        assert!(!LeaseStatus::Inactive.is_lock());
    }

    #[test]
    fn lease_serializes_with_record_field_names() {
        let lease = Lease {
            account_id: "111111111111".into(),
            principal_id: "alice".into(),
            id: "lease-1".into(),
            status: LeaseStatus::Active,
            status_reason: LeaseStatusReason::Active,
            budget_amount: 250.0,
            budget_currency: "USD".into(),
            budget_notification_emails: vec!["alice@example.com".into()],
            created_on: 100,
            last_modified_on: 100,
            status_modified_on: 100,
            expires_on: 700,
        };

        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["AccountId"], "111111111111");
        assert_eq!(json["LeaseStatus"], "Active");
        assert_eq!(json["LeaseStatusModifiedOn"], 100);

        let back: Lease = serde_json::from_value(json).unwrap();
        assert_eq!(back, lease);
    }

    #[test]
    fn account_omits_missing_policy_hash() {
        let account = Account::new("123", AccountStatus::Ready, "arn:admin", 5);
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["AccountStatus"], "Ready");
        assert!(json.get("PrincipalPolicyHash").is_none());
    }
}
