//! Boundary to the remote call-origination server.

use crate::campaign::types::{DialAttempt, NotificationRequest, NotifyStatus, ResultCode};
use async_trait::async_trait;
use thiserror::Error;

pub mod ari;

pub use ari::AriTransport;

/// Failure of a single request/response exchange with the server
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("authentication rejected")]
    Authentication,

    #[error("request rejected: {0}")]
    WrongRequest(String),

    #[error("internal server error: {0}")]
    InternalServer(String),

    #[error("{0}")]
    Unknown(String),
}

impl TransportError {
    /// True when the server answered and reported a failure of its own,
    /// as opposed to the exchange never completing.
    pub fn is_server_side(&self) -> bool {
        matches!(
            self,
            TransportError::Authentication
                | TransportError::WrongRequest(_)
                | TransportError::InternalServer(_)
        )
    }

    /// Status a poll settles at when the exchange fails
    pub fn as_notify_status(&self) -> NotifyStatus {
        if self.is_server_side() {
            NotifyStatus::ServerError
        } else {
            NotifyStatus::NetworkError
        }
    }
}

impl From<&TransportError> for ResultCode {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Timeout => ResultCode::TimeoutError,
            TransportError::HostNotFound(_) => ResultCode::HostNotFoundError,
            TransportError::ConnectionRefused(_) => ResultCode::ConnectionRefusedError,
            TransportError::Authentication => ResultCode::AuthenticationError,
            TransportError::WrongRequest(_) => ResultCode::WrongRequestError,
            TransportError::InternalServer(_) => ResultCode::InternalServerError,
            TransportError::Unknown(_) => ResultCode::UnknowError,
        }
    }
}

/// Network side of the orchestrator. Implementations own session setup and
/// credentials; calls may run concurrently from many tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a whole request in one exchange
    async fn submit(&self, request: &NotificationRequest) -> Result<(), TransportError>;

    /// Place one call attempt. Servers that dial on their own after
    /// submission keep the default.
    async fn dial(&self, _attempt: &DialAttempt) -> Result<(), TransportError> {
        Ok(())
    }

    /// Current status of one accepted target
    async fn query_status(&self, notify_id: &str) -> Result<NotifyStatus, TransportError>;

    /// Whether the latest call of `notify_id` has been picked up, as seen by
    /// the last `query_status`
    fn is_answered(&self, _notify_id: &str) -> bool {
        false
    }

    /// Tear down whatever call is still live for `notify_id` after an
    /// attempt gave up on it
    async fn abandon(&self, _notify_id: &str) -> Result<(), TransportError> {
        Ok(())
    }
}
