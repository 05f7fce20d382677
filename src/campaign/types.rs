use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of the single submission exchange for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    CommandAccepted,
    TimeoutError,
    HostNotFoundError,
    ConnectionRefusedError,
    AuthenticationError,
    WrongRequestError,
    InternalServerError,
    UnknowError,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::CommandAccepted => "command_accepted",
            ResultCode::TimeoutError => "timeout_error",
            ResultCode::HostNotFoundError => "host_not_found_error",
            ResultCode::ConnectionRefusedError => "connection_refused_error",
            ResultCode::AuthenticationError => "authentication_error",
            ResultCode::WrongRequestError => "wrong_request_error",
            ResultCode::InternalServerError => "internal_server_error",
            ResultCode::UnknowError => "unknow_error",
        }
    }
}

/// Per-target notification status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifyStatus {
    PreparedToNotify,
    CanceledNotify,
    DelayedNotify,
    PreparedToSendingToServer,
    SendedToServer,
    NotifyInProcess,
    /// Call answered
    Completed,
    /// Dial failed: busy, no answer or answer wait elapsed
    Failed,
    /// Callee acknowledged the announcement with a keypad press
    Confirmed,
    NetworkError,
    ServerError,
}

impl NotifyStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Terminal kinds. `Failed` may still be followed by a retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotifyStatus::Completed
                | NotifyStatus::Confirmed
                | NotifyStatus::Failed
                | NotifyStatus::NetworkError
                | NotifyStatus::ServerError
                | NotifyStatus::CanceledNotify
        )
    }

    /// Edges of the per-target state machine
    pub fn can_transition_to(self, next: NotifyStatus) -> bool {
        use NotifyStatus::*;

        if next == CanceledNotify {
            return !self.is_terminal() || self == Failed;
        }
        match self {
            PreparedToNotify => next == PreparedToSendingToServer,
            PreparedToSendingToServer => next == SendedToServer,
            SendedToServer | DelayedNotify => next == NotifyInProcess,
            NotifyInProcess => matches!(
                next,
                Completed | Failed | Confirmed | NetworkError | ServerError
            ),
            Failed => next == NotifyInProcess,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyStatus::PreparedToNotify => "prepared_to_notify",
            NotifyStatus::CanceledNotify => "canceled_notify",
            NotifyStatus::DelayedNotify => "delayed_notify",
            NotifyStatus::PreparedToSendingToServer => "prepared_to_sending_to_server",
            NotifyStatus::SendedToServer => "sended_to_server",
            NotifyStatus::NotifyInProcess => "notify_in_process",
            NotifyStatus::Completed => "completed",
            NotifyStatus::Failed => "failed",
            NotifyStatus::Confirmed => "confirmed",
            NotifyStatus::NetworkError => "network_error",
            NotifyStatus::ServerError => "server_error",
        }
    }
}

/// What the callee hears
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Announcement {
    /// Recording referenced through the server dial plan
    Predefined { context: String, extension: String },
    /// Caller supplied media file, not validated here
    Custom { media_path: PathBuf },
}

/// One phone number inside a notify request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub notify_id: String,
    pub phone_number: String,
    pub status: NotifyStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl NotificationTarget {
    pub fn new(notify_id: impl Into<String>, phone_number: impl Into<String>) -> Self {
        NotificationTarget {
            notify_id: notify_id.into(),
            phone_number: phone_number.into(),
            status: NotifyStatus::PreparedToNotify,
            attempts: 0,
            last_attempt_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Notify {
        announcement: Announcement,
        targets: Vec<NotificationTarget>,
    },
    Cancel {
        notify_ids: Vec<String>,
    },
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Notify { .. } => "notify",
            RequestKind::Cancel { .. } => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Draft,
    Submitted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub request_id: String,
    pub kind: RequestKind,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(request_id: impl Into<String>, kind: RequestKind) -> Self {
        NotificationRequest {
            request_id: request_id.into(),
            kind,
            state: RequestState::Draft,
            created_at: Utc::now(),
        }
    }

    pub fn is_draft(&self) -> bool {
        self.state == RequestState::Draft
    }

    /// Every notify id the request refers to, in insertion order
    pub fn notify_ids(&self) -> Vec<&str> {
        match &self.kind {
            RequestKind::Notify { targets, .. } => {
                targets.iter().map(|t| t.notify_id.as_str()).collect()
            }
            RequestKind::Cancel { notify_ids } => notify_ids.iter().map(String::as_str).collect(),
        }
    }
}

/// Everything a transport needs to place one call attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialAttempt {
    pub notify_id: String,
    pub phone_number: String,
    pub announcement: Announcement,
    /// 1-based
    pub attempt: u32,
}

/// Point-in-time view of a tracked target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub request_id: String,
    pub notify_id: String,
    pub phone_number: String,
    pub status: NotifyStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// No further transitions will happen
    pub settled: bool,
}
