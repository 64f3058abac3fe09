//! Change-feed records observed on the lease table.
//!
//! Each record carries the kind of mutation and the raw attribute images of the
//! row before and after it. Images are maps of attribute name to a typed value
//! (`{"S": "..."}`, `{"N": "42"}`, `{"SS": [...]}`, ...).

use crate::model::{Lease, LeaseStatus, LeaseStatusReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Attribute name holding the lease status in lease images.
pub const LEASE_STATUS_ATTRIBUTE: &str = "LeaseStatus";

/// Errors that can occur while decoding change-feed records.
///
/// All of these are permanent for the record at hand: retrying the same
/// record yields the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeFeedError {
    /// The raw record was not a valid change record.
    #[error("Malformed change record: {0}")]
    Malformed(String),

    /// An expected attribute is absent from an image.
    #[error("Missing attribute '{name}' in {image} image")]
    MissingAttribute {
        /// Attribute name.
        name: String,
        /// `before` or `after`.
        image: &'static str,
    },

    /// An attribute is present but has the wrong type or an unparsable value.
    #[error("Invalid attribute '{name}': {reason}")]
    InvalidAttribute {
        /// Attribute name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// String.
    #[serde(rename = "S")]
    String(String),
    /// Number, carried as its decimal string.
    #[serde(rename = "N")]
    Number(String),
    /// Set of strings.
    #[serde(rename = "SS")]
    StringSet(Vec<String>),
    /// List of values.
    #[serde(rename = "L")]
    List(Vec<AttributeValue>),
    /// Nested map.
    #[serde(rename = "M")]
    Map(BTreeMap<String, AttributeValue>),
    /// Boolean.
    #[serde(rename = "BOOL")]
    Bool(bool),
    /// Explicit null.
    #[serde(rename = "NULL")]
    Null(bool),
}

impl AttributeValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "S",
            Self::Number(_) => "N",
            Self::StringSet(_) => "SS",
            Self::List(_) => "L",
            Self::Map(_) => "M",
            Self::Bool(_) => "BOOL",
            Self::Null(_) => "NULL",
        }
    }
}

/// Attribute name to value.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventKind {
    /// Row created; no `before` image.
    Insert,
    /// Row updated; both images present.
    Modify,
    /// Row deleted; no `after` image.
    Remove,
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Mutation kind.
    #[serde(rename = "eventKind")]
    pub event_kind: ChangeEventKind,
    /// Row image before the mutation.
    #[serde(default)]
    pub before: AttributeMap,
    /// Row image after the mutation.
    #[serde(default)]
    pub after: AttributeMap,
}

impl ChangeRecord {
    /// A MODIFY record between two lease snapshots.
    #[must_use]
    pub fn modify(before: &Lease, after: &Lease) -> Self {
        Self {
            event_kind: ChangeEventKind::Modify,
            before: encode_lease(before),
            after: encode_lease(after),
        }
    }

    /// Decode a record from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeFeedError::Malformed`] if `bytes` is not a change record.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ChangeFeedError> {
        serde_json::from_slice(bytes).map_err(|e| ChangeFeedError::Malformed(e.to_string()))
    }

    /// Lease status in the `before` image.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeFeedError`] if the attribute is absent or invalid.
    pub fn previous_status(&self) -> Result<LeaseStatus, ChangeFeedError> {
        lease_status(&self.before, "before")
    }

    /// Lease status in the `after` image.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeFeedError`] if the attribute is absent or invalid.
    pub fn next_status(&self) -> Result<LeaseStatus, ChangeFeedError> {
        lease_status(&self.after, "after")
    }

    /// Lease snapshot decoded from the `after` image.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeFeedError`] if a required attribute is absent or invalid.
    pub fn after_lease(&self) -> Result<Lease, ChangeFeedError> {
        decode_lease(&self.after, "after")
    }
}

fn lease_status(image: &AttributeMap, side: &'static str) -> Result<LeaseStatus, ChangeFeedError> {
    parse_attr(image, LEASE_STATUS_ATTRIBUTE, side)
}

fn string_attr<'a>(
    image: &'a AttributeMap,
    name: &str,
    side: &'static str,
) -> Result<&'a str, ChangeFeedError> {
    match image.get(name) {
        Some(AttributeValue::String(s)) => Ok(s),
        Some(other) => Err(ChangeFeedError::InvalidAttribute {
            name: name.to_string(),
            reason: format!("expected S, found {}", other.type_name()),
        }),
        None => Err(ChangeFeedError::MissingAttribute {
            name: name.to_string(),
            image: side,
        }),
    }
}

fn parse_attr<T>(image: &AttributeMap, name: &str, side: &'static str) -> Result<T, ChangeFeedError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    string_attr(image, name, side)?
        .parse()
        .map_err(|e: T::Err| ChangeFeedError::InvalidAttribute {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn number_attr<T>(image: &AttributeMap, name: &str) -> Result<Option<T>, ChangeFeedError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match image.get(name) {
        None | Some(AttributeValue::Null(_)) => Ok(None),
        Some(AttributeValue::Number(n)) => {
            n.parse()
                .map(Some)
                .map_err(|e: T::Err| ChangeFeedError::InvalidAttribute {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
        }
        Some(other) => Err(ChangeFeedError::InvalidAttribute {
            name: name.to_string(),
            reason: format!("expected N, found {}", other.type_name()),
        }),
    }
}

/// Decode a lease from a row image.
///
/// `AccountId`, `PrincipalId` and `LeaseStatus` are required. Timestamps,
/// budget fields and the reason fall back to zero values when absent, as rows
/// written before those attributes existed lack them.
///
/// # Errors
///
/// Returns [`ChangeFeedError`] if a required attribute is absent or any
/// attribute has the wrong type.
pub fn decode_lease(image: &AttributeMap, side: &'static str) -> Result<Lease, ChangeFeedError> {
    let status_reason = match image.get("LeaseStatusReason") {
        None => LeaseStatusReason::Active,
        Some(_) => parse_attr(image, "LeaseStatusReason", side)?,
    };
    let id = match image.get("Id") {
        None => String::new(),
        Some(_) => string_attr(image, "Id", side)?.to_string(),
    };
    let budget_currency = match image.get("BudgetCurrency") {
        None => String::new(),
        Some(_) => string_attr(image, "BudgetCurrency", side)?.to_string(),
    };
    let budget_notification_emails = match image.get("BudgetNotificationEmails") {
        None | Some(AttributeValue::Null(_)) => Vec::new(),
        Some(AttributeValue::StringSet(set)) => set.clone(),
        Some(AttributeValue::List(items)) => items
            .iter()
            .map(|item| match item {
                AttributeValue::String(s) => Ok(s.clone()),
                other => Err(ChangeFeedError::InvalidAttribute {
                    name: "BudgetNotificationEmails".to_string(),
                    reason: format!("expected S list items, found {}", other.type_name()),
                }),
            })
            .collect::<Result<_, _>>()?,
        Some(other) => {
            return Err(ChangeFeedError::InvalidAttribute {
                name: "BudgetNotificationEmails".to_string(),
                reason: format!("expected SS, found {}", other.type_name()),
            });
        }
    };

    Ok(Lease {
        account_id: string_attr(image, "AccountId", side)?.to_string(),
        principal_id: string_attr(image, "PrincipalId", side)?.to_string(),
        id,
        status: lease_status(image, side)?,
        status_reason,
        budget_amount: number_attr(image, "BudgetAmount")?.unwrap_or(0.0),
        budget_currency,
        budget_notification_emails,
        created_on: number_attr(image, "CreatedOn")?.unwrap_or(0),
        last_modified_on: number_attr(image, "LastModifiedOn")?.unwrap_or(0),
        status_modified_on: number_attr(image, "LeaseStatusModifiedOn")?.unwrap_or(0),
        expires_on: number_attr(image, "ExpiresOn")?.unwrap_or(0),
    })
}

/// Encode a lease as a row image. Empty string sets are omitted.
#[must_use]
pub fn encode_lease(lease: &Lease) -> AttributeMap {
    let s = |v: &str| AttributeValue::String(v.to_string());
    let n = |v: String| AttributeValue::Number(v);

    let mut image = AttributeMap::new();
    image.insert("AccountId".into(), s(&lease.account_id));
    image.insert("PrincipalId".into(), s(&lease.principal_id));
    image.insert("Id".into(), s(&lease.id));
    image.insert(LEASE_STATUS_ATTRIBUTE.into(), s(lease.status.as_str()));
    image.insert("LeaseStatusReason".into(), s(lease.status_reason.as_str()));
    image.insert("BudgetAmount".into(), n(lease.budget_amount.to_string()));
    image.insert("BudgetCurrency".into(), s(&lease.budget_currency));
    if !lease.budget_notification_emails.is_empty() {
        image.insert(
            "BudgetNotificationEmails".into(),
            AttributeValue::StringSet(lease.budget_notification_emails.clone()),
        );
    }
    image.insert("CreatedOn".into(), n(lease.created_on.to_string()));
    image.insert("LastModifiedOn".into(), n(lease.last_modified_on.to_string()));
    image.insert(
        "LeaseStatusModifiedOn".into(),
        n(lease.status_modified_on.to_string()),
    );
    image.insert("ExpiresOn".into(), n(lease.expires_on.to_string()));
    image
}
