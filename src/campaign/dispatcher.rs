use crate::campaign::builder::RequestRegistry;
use crate::campaign::tracker::StatusTracker;
use crate::campaign::types::{NotificationRequest, RequestKind, ResultCode};
use crate::config::Config;
use crate::transport::Transport;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Submits frozen requests and hands accepted targets to the tracker
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    tracker: StatusTracker,
    registry: Arc<Mutex<RequestRegistry>>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        tracker: StatusTracker,
        registry: Arc<Mutex<RequestRegistry>>,
    ) -> Self {
        Dispatcher {
            transport,
            tracker,
            registry,
        }
    }

    /// Spawn the submission of an already frozen request.
    /// `config` is the snapshot the request runs with until every target settles.
    pub fn dispatch(&self, request: NotificationRequest, config: Arc<Config>) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let tracker = self.tracker.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let request_id = request.request_id.clone();

            info!(
                request_id = %request_id,
                kind = request.kind.as_str(),
                targets = request.notify_ids().len(),
                "Submitting request"
            );

            // park the targets first so no poll sees a half-cancelled call
            let cancelled = match &request.kind {
                RequestKind::Cancel { notify_ids } => notify_ids.clone(),
                RequestKind::Notify { .. } => Vec::new(),
            };
            if !cancelled.is_empty() {
                tracker.hold(&cancelled).await;
            }

            let result = submit(transport.as_ref(), &request, &config).await;

            if result == ResultCode::CommandAccepted {
                info!(request_id = %request_id, "Request accepted by server");
            } else {
                warn!(
                    request_id = %request_id,
                    result = result.as_str(),
                    "Request rejected, no targets tracked"
                );
            }

            // free the id before `finished` so callers can reuse it right away
            lock_registry(&registry).finish(&request_id);
            tracker.finished(request.clone(), result);

            if result != ResultCode::CommandAccepted {
                if !cancelled.is_empty() {
                    tracker.release(&cancelled);
                }
                return;
            }

            match request.kind {
                RequestKind::Notify {
                    announcement,
                    targets,
                } => {
                    for target in targets {
                        tracker.track(&request_id, &announcement, target, config.clone());
                    }
                }
                RequestKind::Cancel { notify_ids } => {
                    for notify_id in notify_ids {
                        tracker.cancel(&notify_id);
                    }
                }
            }
        })
    }
}

/// One bounded submission exchange, classified into a result code
async fn submit(
    transport: &dyn Transport,
    request: &NotificationRequest,
    config: &Config,
) -> ResultCode {
    match timeout(config.request_timeout(), transport.submit(request)).await {
        Ok(Ok(())) => ResultCode::CommandAccepted,
        Ok(Err(e)) => {
            warn!(request_id = %request.request_id, error = %e, "Submission failed");
            ResultCode::from(&e)
        }
        Err(_) => ResultCode::TimeoutError,
    }
}

pub(crate) fn lock_registry(registry: &Mutex<RequestRegistry>) -> MutexGuard<'_, RequestRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
