//! Error types for the handle table and continuation store

use dirsvc_types::{ClientIdentity, ContinuationToken, HandleId, HandleKind};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("Invalid handle: {id}")]
    InvalidHandle { id: HandleId },

    #[error("Handle {id} is a {actual} handle, expected {expected}")]
    WrongKind {
        id: HandleId,
        expected: HandleKind,
        actual: HandleKind,
    },

    #[error("Handle {id} is not usable by client {client}")]
    NotOwner { id: HandleId, client: ClientIdentity },

    #[error("Invalid parent {parent} for {kind} handle")]
    InvalidParent { kind: HandleKind, parent: HandleId },

    #[error("Table full: all {capacity} slots are in use")]
    TableFull { capacity: u32 },

    #[error("Table storage allocation failed")]
    AllocationFailed,

    #[error("Invalid continuation token: {token}")]
    InvalidToken { token: ContinuationToken },

    #[error("Continuation owner {owner} is not a live directory node")]
    InvalidOwner { owner: HandleId },

    #[error("Continuation payload for token {token} has a different type")]
    PayloadType { token: ContinuationToken },

    #[error("Invalid table limits: {reason}")]
    InvalidLimits { reason: String },

    #[error("Handle table inconsistency: {reason}")]
    Internal { reason: String },
}

impl HandleError {
    /// Errors caused by stale or foreign handles. These are routine and are
    /// not logged above debug level.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            HandleError::InvalidHandle { .. }
                | HandleError::WrongKind { .. }
                | HandleError::NotOwner { .. }
                | HandleError::InvalidParent { .. }
                | HandleError::InvalidToken { .. }
                | HandleError::InvalidOwner { .. }
                | HandleError::PayloadType { .. }
        )
    }

    /// Errors caused by running out of slots or memory.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            HandleError::TableFull { .. } | HandleError::AllocationFailed
        )
    }

    /// The form of this error that may be reported to a remote client.
    ///
    /// `NotOwner` collapses to `InvalidHandle` so a client cannot probe for
    /// handles belonging to other clients.
    pub fn client_visible(self) -> Self {
        match self {
            HandleError::NotOwner { id, .. } => HandleError::InvalidHandle { id },
            other => other,
        }
    }

    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        HandleError::Internal {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HandleError>;
