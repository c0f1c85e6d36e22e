//! # Role-Based Access Control
//!
//! | Role          | May do                                                        |
//! |---------------|---------------------------------------------------------------|
//! | `Donor`       | create donations; edit, delete, complete its own; approve or reject requests on its own donations |
//! | `Beneficiary` | create requests; cancel its own pending requests              |
//! | `Admin`       | everything a donor may do on any donation; override statuses  |
//!
//! Identity is asserted by the caller. These helpers only decide whether the
//! asserted actor may perform an action on a given record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};
use crate::types::{Donation, DonationRequest, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Donor,
    Beneficiary,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Donor => "donor",
            Role::Beneficiary => "beneficiary",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "donor" => Ok(Role::Donor),
            "beneficiary" => Ok(Role::Beneficiary),
            "admin" => Ok(Role::Admin),
            other => Err(LifecycleError::Validation(format!("unknown role: {other}"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user on whose behalf an operation runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Actor {
            id: UserId::new(id),
            role,
        }
    }

    pub fn donor(id: impl Into<String>) -> Self {
        Actor::new(id, Role::Donor)
    }

    pub fn beneficiary(id: impl Into<String>) -> Self {
        Actor::new(id, Role::Beneficiary)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Actor::new(id, Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    fn deny(&self, action: &'static str) -> LifecycleError {
        LifecycleError::NotAuthorized {
            actor: self.id.clone(),
            action,
        }
    }
}

pub fn require_role(actor: &Actor, role: Role, action: &'static str) -> Result<()> {
    if actor.role == role {
        Ok(())
    } else {
        Err(actor.deny(action))
    }
}

pub fn require_admin(actor: &Actor, action: &'static str) -> Result<()> {
    require_role(actor, Role::Admin, action)
}

/// The donation's owner, or any admin.
pub fn require_owner_or_admin(actor: &Actor, donation: &Donation, action: &'static str) -> Result<()> {
    if actor.is_admin() || (actor.role == Role::Donor && actor.id == donation.donor_id) {
        Ok(())
    } else {
        Err(actor.deny(action))
    }
}

/// Only the beneficiary who filed the request.
pub fn require_requester(actor: &Actor, request: &DonationRequest, action: &'static str) -> Result<()> {
    if actor.role == Role::Beneficiary && actor.id == request.beneficiary_id {
        Ok(())
    } else {
        Err(actor.deny(action))
    }
}
