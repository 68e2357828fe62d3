//! Crate-level error type and the caller-visible error taxonomy.
//!
//! Each subsystem defines its own `thiserror` enum (`GossipError`,
//! `RegistryError`, `RouterError`, `KnowledgeError`, `DispatchError`), one per
//! module. [`CoreError`] wraps each of them with `#[from]` so call sites can
//! use `?` uniformly, and exposes the caller-visible [`ErrorKind`] for
//! serialization into the external response envelope.

use thiserror::Error;

use crate::dispatcher::DispatchError;
use crate::gossip::GossipError;
use crate::knowledge::KnowledgeError;
use crate::registry::RegistryError;
use crate::router::RouterError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Gossip(#[from] GossipError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// The caller-visible error kind from §7. Every fatal response carries one
/// of these instead of a raw exception payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoCapableNode,
    AllCandidatesStale,
    DeadlineExceeded,
    HandlerFailed,
    Overloaded,
    CostUnavailable,
    KnowledgeDomainMissing,
    ChunkChecksumMismatch,
}

impl CoreError {
    /// Maps any internal error onto the caller-visible taxonomy. Errors that
    /// the router/dispatcher already recover from locally (per §7's
    /// propagation policy) never reach this point as `CoreError` — this is
    /// only for the ones that do surface.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Router(RouterError::NoCapableNode) => ErrorKind::NoCapableNode,
            CoreError::Router(RouterError::AllCandidatesStale) => ErrorKind::AllCandidatesStale,
            CoreError::Router(RouterError::DeadlineExceeded) => ErrorKind::DeadlineExceeded,
            CoreError::Router(RouterError::SpecificNodeUnavailable(_)) => {
                ErrorKind::NoCapableNode
            }
            CoreError::Dispatch(DispatchError::HandlerFailed(_)) => ErrorKind::HandlerFailed,
            CoreError::Dispatch(DispatchError::Overloaded) => ErrorKind::Overloaded,
            CoreError::Knowledge(KnowledgeError::DomainMissing(_)) => {
                ErrorKind::KnowledgeDomainMissing
            }
            CoreError::Knowledge(KnowledgeError::ChecksumMismatch(_)) => {
                ErrorKind::ChunkChecksumMismatch
            }
            _ => ErrorKind::HandlerFailed,
        }
    }
}
