use crate::campaign::types::{NotifyStatus, ResultCode};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Observable output of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    Finished {
        request_id: String,
        result: ResultCode,
    },
    Status {
        notify_id: String,
        status: NotifyStatus,
    },
}

/// Receiver of orchestrator events. Called from the tracker task only,
/// one event at a time, so implementations must not block for long.
pub trait EventSink: Send + Sync {
    fn finished(&self, request_id: &str, result: ResultCode);

    fn notify_status(&self, notify_id: &str, status: NotifyStatus);
}

/// Forwards events into an unbounded channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<NotifyEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotifyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }

    fn send(&self, event: NotifyEvent) {
        if self.tx.send(event).is_err() {
            warn!("Event receiver dropped, event discarded");
        }
    }
}

impl EventSink for ChannelSink {
    fn finished(&self, request_id: &str, result: ResultCode) {
        self.send(NotifyEvent::Finished {
            request_id: request_id.to_string(),
            result,
        });
    }

    fn notify_status(&self, notify_id: &str, status: NotifyStatus) {
        self.send(NotifyEvent::Status {
            notify_id: notify_id.to_string(),
            status,
        });
    }
}

/// Logs every event
pub struct TracingSink;

impl EventSink for TracingSink {
    fn finished(&self, request_id: &str, result: ResultCode) {
        info!(
            request_id = %request_id,
            result = result.as_str(),
            code = result.code(),
            "Request finished"
        );
    }

    fn notify_status(&self, notify_id: &str, status: NotifyStatus) {
        info!(
            notify_id = %notify_id,
            status = status.as_str(),
            code = status.code(),
            "Notify status changed"
        );
    }
}
