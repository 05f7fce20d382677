use thiserror::Error;

/// Errors reported synchronously by the request builder and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("request {0} already exists")]
    DuplicateRequest(String),

    #[error("request {0} is not a draft")]
    UnknownDraft(String),

    #[error("notify id {notify_id} already used in request {request_id}")]
    DuplicateNotifyId {
        request_id: String,
        notify_id: String,
    },

    #[error("request {request_id} is a {actual} request, expected {expected}")]
    WrongRequestKind {
        request_id: String,
        expected: &'static str,
        actual: &'static str,
    },
}
