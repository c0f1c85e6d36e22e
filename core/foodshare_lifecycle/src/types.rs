//! # Types
//!
//! Shared data structures used across all modules of the lifecycle engine.
//!
//! ## Status as a Finite-State Machine
//!
//! [`DonationStatus`] follows this lifecycle:
//!
//! ```text
//! Available ──► Claimed ──► Completed
//!     │  ▲          │
//!     │  └──────────┘   (request rejected / cancelled)
//!     └──► Expired
//! any ──► admin-forced terminal state
//! ```
//!
//! [`RequestStatus`] is strictly forward-only: `Pending` moves to exactly one
//! of `Approved`, `Rejected` or `Cancelled` and never leaves it.
//!
//! Every record carries a `version` that starts at 1 and is bumped on each
//! saved change. The persistence collaborator uses it to detect writes that
//! raced past the engine's writer lock.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

// ── Identifiers ──────────────────────────────────────────────────────

/// Opaque donation identifier, allocated sequentially by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DonationId(pub u64);

/// Opaque request identifier, allocated sequentially by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

/// External user identifier (donor, beneficiary or admin).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DonationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Enumerations ─────────────────────────────────────────────────────

/// Lifecycle status of a donation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    /// Open for requests.
    Available,
    /// A request was approved; waiting for pickup.
    Claimed,
    /// Picked up.
    Completed,
    /// Expiry timestamp passed before completion.
    Expired,
    /// Removed from circulation by an admin.
    Rejected,
}

impl DonationStatus {
    pub const ALL: [DonationStatus; 5] = [
        DonationStatus::Available,
        DonationStatus::Claimed,
        DonationStatus::Completed,
        DonationStatus::Expired,
        DonationStatus::Rejected,
    ];

    /// `Completed`, `Expired` and `Rejected` accept no further user transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DonationStatus::Completed | DonationStatus::Expired | DonationStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DonationStatus::Available => "available",
            DonationStatus::Claimed => "claimed",
            DonationStatus::Completed => "completed",
            DonationStatus::Expired => "expired",
            DonationStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for DonationStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(DonationStatus::Available),
            "claimed" => Ok(DonationStatus::Claimed),
            "completed" => Ok(DonationStatus::Completed),
            "expired" => Ok(DonationStatus::Expired),
            "rejected" => Ok(DonationStatus::Rejected),
            other => Err(LifecycleError::Validation(format!(
                "unknown donation status: {other}"
            ))),
        }
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a donation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        RequestStatus::Pending,
        RequestStatus::Approved,
        RequestStatus::Rejected,
        RequestStatus::Cancelled,
    ];

    /// A pending or approved request still holds its donation.
    pub fn is_outstanding(self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Approved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "cancelled" => Ok(RequestStatus::Cancelled),
            other => Err(LifecycleError::Validation(format!(
                "unknown request status: {other}"
            ))),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoodCategory {
    Perishable,
    NonPerishable,
    Prepared,
    Other,
}

impl FoodCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FoodCategory::Perishable => "perishable",
            FoodCategory::NonPerishable => "non_perishable",
            FoodCategory::Prepared => "prepared",
            FoodCategory::Other => "other",
        }
    }
}

impl FromStr for FoodCategory {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "perishable" => Ok(FoodCategory::Perishable),
            "non_perishable" => Ok(FoodCategory::NonPerishable),
            "prepared" => Ok(FoodCategory::Prepared),
            "other" => Ok(FoodCategory::Other),
            other => Err(LifecycleError::Validation(format!(
                "unknown food category: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityUnit {
    Kg,
    Lb,
    Liters,
    Items,
    Servings,
}

impl QuantityUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            QuantityUnit::Kg => "kg",
            QuantityUnit::Lb => "lb",
            QuantityUnit::Liters => "liters",
            QuantityUnit::Items => "items",
            QuantityUnit::Servings => "servings",
        }
    }
}

impl FromStr for QuantityUnit {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kg" => Ok(QuantityUnit::Kg),
            "lb" => Ok(QuantityUnit::Lb),
            "liters" => Ok(QuantityUnit::Liters),
            "items" => Ok(QuantityUnit::Items),
            "servings" => Ok(QuantityUnit::Servings),
            other => Err(LifecycleError::Validation(format!(
                "unknown quantity unit: {other}"
            ))),
        }
    }
}

// ── Value objects ────────────────────────────────────────────────────

const KG_PER_LB: f64 = 0.453_592_37;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub amount: f64,
    pub unit: QuantityUnit,
}

impl Quantity {
    pub fn new(amount: f64, unit: QuantityUnit) -> Self {
        Quantity { amount, unit }
    }

    /// Weight in kilograms, or `None` for units that carry no weight.
    pub fn as_kg(&self) -> Option<f64> {
        match self.unit {
            QuantityUnit::Kg => Some(self.amount),
            QuantityUnit::Lb => Some(self.amount * KG_PER_LB),
            QuantityUnit::Liters | QuantityUnit::Items | QuantityUnit::Servings => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickupWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// ── Records ──────────────────────────────────────────────────────────

/// A food lot offered by a donor for pickup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    pub id: DonationId,
    /// Donor who owns the donation.
    pub donor_id: UserId,
    pub description: String,
    pub category: FoodCategory,
    pub quantity: Quantity,
    /// After this instant the expiry sweep may terminate the donation.
    pub expires_at: DateTime<Utc>,
    pub pickup_window: PickupWindow,
    pub pickup_address: String,
    pub status: DonationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Donation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Trailing comma-separated part of the pickup address, e.g. `London` in
    /// `221B Baker Street, London`.
    pub fn city(&self) -> Option<&str> {
        let (_, city) = self.pickup_address.rsplit_once(',')?;
        let city = city.trim();
        (!city.is_empty()).then_some(city)
    }

    /// Copy with `status` replaced and bookkeeping fields advanced.
    pub(crate) fn with_status(&self, status: DonationStatus, now: DateTime<Utc>) -> Donation {
        Donation {
            status,
            updated_at: now,
            version: self.version + 1,
            ..self.clone()
        }
    }
}

/// A beneficiary's claim of intent against one donation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationRequest {
    pub id: RequestId,
    pub donation_id: DonationId,
    pub beneficiary_id: UserId,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl DonationRequest {
    pub(crate) fn with_status(&self, status: RequestStatus, now: DateTime<Utc>) -> DonationRequest {
        DonationRequest {
            status,
            updated_at: now,
            version: self.version + 1,
            ..self.clone()
        }
    }
}

// ── Donor input ──────────────────────────────────────────────────────

/// Donor-supplied fields for a new donation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewDonation {
    pub description: String,
    pub category: FoodCategory,
    pub quantity: Quantity,
    pub expires_at: DateTime<Utc>,
    pub pickup_window: PickupWindow,
    pub pickup_address: String,
}

impl NewDonation {
    /// Reject records that would be malformed once stored.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.description.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "description must not be empty".to_string(),
            ));
        }
        if self.pickup_address.trim().is_empty() {
            return Err(LifecycleError::Validation(
                "pickup address must not be empty".to_string(),
            ));
        }
        if !self.quantity.amount.is_finite() || self.quantity.amount <= 0.0 {
            return Err(LifecycleError::Validation(format!(
                "quantity must be positive, got {}",
                self.quantity.amount
            )));
        }
        if self.pickup_window.start >= self.pickup_window.end {
            return Err(LifecycleError::Validation(
                "pickup window must start before it ends".to_string(),
            ));
        }
        if self.expires_at <= now {
            return Err(LifecycleError::Validation(
                "expiry must be in the future".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial edit of a donation; `None` keeps the current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DonationUpdate {
    pub description: Option<String>,
    pub category: Option<FoodCategory>,
    pub quantity: Option<Quantity>,
    pub expires_at: Option<DateTime<Utc>>,
    pub pickup_window: Option<PickupWindow>,
    pub pickup_address: Option<String>,
}

impl DonationUpdate {
    /// Merge onto the editable fields of `donation`, producing the candidate input.
    pub fn merge(self, donation: &Donation) -> NewDonation {
        NewDonation {
            description: self.description.unwrap_or_else(|| donation.description.clone()),
            category: self.category.unwrap_or(donation.category),
            quantity: self.quantity.unwrap_or(donation.quantity),
            expires_at: self.expires_at.unwrap_or(donation.expires_at),
            pickup_window: self.pickup_window.unwrap_or(donation.pickup_window),
            pickup_address: self
                .pickup_address
                .unwrap_or_else(|| donation.pickup_address.clone()),
        }
    }
}
