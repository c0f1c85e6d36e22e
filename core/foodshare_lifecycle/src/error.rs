//! Lifecycle error taxonomy.
//!
//! Every variant is local and recoverable: callers surface them to users or
//! refresh their view and retry. None of them aborts the process.

use thiserror::Error;

use crate::types::{DonationId, DonationStatus, RequestId, RequestStatus, UserId};

/// Coarse grouping used by adapters to pick a user-facing response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidStateTransition,
    Conflict,
    ConcurrentModification,
    NotAuthorized,
    Validation,
    Storage,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("donation {0} not found")]
    DonationNotFound(DonationId),

    #[error("donation request {0} not found")]
    RequestNotFound(RequestId),

    #[error("donation {id} is not available (status: {status})")]
    DonationNotAvailable { id: DonationId, status: DonationStatus },

    #[error("donation {donation_id} already has an outstanding request ({existing})")]
    DuplicateRequest {
        donation_id: DonationId,
        existing: RequestId,
    },

    #[error("donation request {id} is not pending (status: {status})")]
    RequestNotPending { id: RequestId, status: RequestStatus },

    #[error("donation request {id} cannot be cancelled (status: {status})")]
    RequestNotCancellable { id: RequestId, status: RequestStatus },

    #[error("donation {id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        id: DonationId,
        from: DonationStatus,
        to: DonationStatus,
    },

    #[error("donation {0} has not reached its expiry time")]
    NotYetExpired(DonationId),

    #[error("donation {donation_id} is referenced by outstanding request {request_id}")]
    DonationInUse {
        donation_id: DonationId,
        request_id: RequestId,
    },

    #[error("user {actor} is not allowed to {action}")]
    NotAuthorized { actor: UserId, action: &'static str },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} was modified concurrently")]
    ConcurrentModification { entity: String },

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LifecycleError {
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        LifecycleError::Storage(Box::new(err))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DonationNotFound(_) | Self::RequestNotFound(_) => ErrorKind::NotFound,
            Self::DonationNotAvailable { .. }
            | Self::RequestNotPending { .. }
            | Self::RequestNotCancellable { .. }
            | Self::InvalidStateTransition { .. }
            | Self::NotYetExpired(_) => ErrorKind::InvalidStateTransition,
            Self::DuplicateRequest { .. } | Self::DonationInUse { .. } => ErrorKind::Conflict,
            Self::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Self::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
