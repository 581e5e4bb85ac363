use thiserror::Error;

use crate::channel::ChannelError;
use crate::guru::GuruError;
use crate::ledger::LedgerError;
use crate::model::{HostId, InstanceId, State};
use crate::planner::PlannerError;
use crate::services::ServiceError;
use crate::state::{Event, ListenerError, TransitionError};
use crate::store::StoreError;

/// Coarse classification callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Another operation holds the instance; retry later.
    Concurrency,
    ResourceUnavailable,
    InsufficientCapacity,
    /// The host may or may not have acted; handled by check/force-stop.
    Indeterminate,
    IllegalTransition,
    NotFound,
    InvalidRequest,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::InsufficientCapacity => "insufficient_capacity",
            ErrorKind::Indeterminate => "indeterminate",
            ErrorKind::IllegalTransition => "illegal_transition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("instance {0} not found")]
    NotFound(InstanceId),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("instance {instance} is busy: {detail}")]
    Concurrency { instance: InstanceId, detail: String },
    #[error("instance {instance} cannot {event} while {state}")]
    NoTransition {
        instance: InstanceId,
        state: State,
        event: Event,
    },
    #[error("insufficient capacity to deploy instance {instance}: {detail}")]
    InsufficientCapacity { instance: InstanceId, detail: String },
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("agent on {host} unavailable: {reason}")]
    AgentUnavailable { host: HostId, reason: String },
    #[error("{command} on {host} timed out; outcome unknown")]
    OperationTimedOut { host: HostId, command: &'static str },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Fatal(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            OrchestratorError::Concurrency { .. } => ErrorKind::Concurrency,
            OrchestratorError::NoTransition { .. } => ErrorKind::IllegalTransition,
            OrchestratorError::InsufficientCapacity { .. } => ErrorKind::InsufficientCapacity,
            OrchestratorError::ResourceUnavailable(_) | OrchestratorError::AgentUnavailable { .. } => {
                ErrorKind::ResourceUnavailable
            }
            OrchestratorError::OperationTimedOut { .. } => ErrorKind::Indeterminate,
            OrchestratorError::Store(_) | OrchestratorError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Worth retrying the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Concurrency | ErrorKind::ResourceUnavailable
        )
    }

    pub fn concurrency(instance: InstanceId, detail: impl Into<String>) -> Self {
        OrchestratorError::Concurrency {
            instance,
            detail: detail.into(),
        }
    }
}

impl From<LedgerError> for OrchestratorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Busy { instance, .. } => {
                OrchestratorError::concurrency(instance, err.to_string())
            }
            LedgerError::Store(e) => OrchestratorError::Store(e),
            other => OrchestratorError::Fatal(other.to_string()),
        }
    }
}

impl From<TransitionError> for OrchestratorError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::NoTransition {
                instance,
                from,
                event,
            } => OrchestratorError::NoTransition {
                instance,
                state: from,
                event,
            },
            TransitionError::Stale { instance, .. } | TransitionError::WorkInactive { instance, .. } => {
                OrchestratorError::concurrency(instance, err.to_string())
            }
            TransitionError::Vetoed {
                source: ListenerError::InsufficientCapacity { host, detail },
                ..
            } => OrchestratorError::ResourceUnavailable(format!("{host}: {detail}")),
            TransitionError::Vetoed { .. } => OrchestratorError::Fatal(err.to_string()),
            TransitionError::Store(e) => OrchestratorError::Store(e),
        }
    }
}

impl From<ChannelError> for OrchestratorError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::AgentUnavailable { host, reason } => {
                OrchestratorError::AgentUnavailable { host, reason }
            }
            ChannelError::OperationTimedOut { host, command, .. } => {
                OrchestratorError::OperationTimedOut { host, command }
            }
            ChannelError::Protocol { .. } => OrchestratorError::Fatal(err.to_string()),
        }
    }
}

impl From<ServiceError> for OrchestratorError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::ResourceUnavailable(m) => OrchestratorError::ResourceUnavailable(m),
            ServiceError::InsufficientCapacity(m) => OrchestratorError::ResourceUnavailable(m),
            ServiceError::LimitExceeded(m) => OrchestratorError::InvalidRequest(m),
            ServiceError::NotFound(m) => OrchestratorError::Fatal(format!("{m} not found")),
            ServiceError::Failed(m) => OrchestratorError::Fatal(m),
        }
    }
}

impl From<PlannerError> for OrchestratorError {
    fn from(err: PlannerError) -> Self {
        match err {
            PlannerError::Store(e) => OrchestratorError::Store(e),
        }
    }
}

impl From<GuruError> for OrchestratorError {
    fn from(err: GuruError) -> Self {
        match err {
            GuruError::Missing(_) => OrchestratorError::Fatal(err.to_string()),
            GuruError::Rejected { .. } => OrchestratorError::ResourceUnavailable(err.to_string()),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
