//! Error classification shared by every retry and poll loop.

use serde::{Deserialize, Serialize};

use crate::RemoteError;

/// How a failed remote call should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// Transient transport failure: repeat the same call.
    Retryable,
    /// Abort and surface the error.
    NonRetryable,
    /// The project does not exist from the caller's point of view.
    NotFound,
}

/// What a forbidden response means. The default collapses it into not-found;
/// `Surface` keeps it as a hard error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForbiddenPolicy {
    #[default]
    TreatAsNotFound,
    Surface,
}

/// Capabilities a remote error exposes to the classifier.
pub trait Classify {
    /// Network timeout or connectivity failure expected to clear.
    fn is_transient(&self) -> bool;
    /// 404-equivalent.
    fn is_not_found(&self) -> bool;
    /// 403-equivalent.
    fn is_forbidden(&self) -> bool;
}

impl Classify for RemoteError {
    fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transport { timeout, temporary, .. } if *timeout || *temporary)
    }

    fn is_not_found(&self) -> bool { matches!(self, RemoteError::Status { code: 404, .. }) }

    fn is_forbidden(&self) -> bool { matches!(self, RemoteError::Status { code: 403, .. }) }
}

pub fn classify<E: Classify + ?Sized>(err: &E, policy: ForbiddenPolicy) -> Classification {
    if err.is_not_found() {
        return Classification::NotFound;
    }
    if err.is_forbidden() {
        return match policy {
            ForbiddenPolicy::TreatAsNotFound => Classification::NotFound,
            ForbiddenPolicy::Surface => Classification::NonRetryable,
        };
    }
    if err.is_transient() { Classification::Retryable } else { Classification::NonRetryable }
}
