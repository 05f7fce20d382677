use crate::campaign::archive::{FinishedRequest, NotifyArchive};
use crate::campaign::events::EventSink;
use crate::campaign::poller::{PollerControl, TargetPoller};
use crate::campaign::types::{
    Announcement, NotificationRequest, NotificationTarget, NotifyStatus, ResultCode,
    TargetSnapshot,
};
use crate::config::Config;
use crate::transport::Transport;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Messages handled by the tracker task
pub(crate) enum TrackerCommand {
    Finished {
        request: NotificationRequest,
        result: ResultCode,
    },
    Track {
        request_id: String,
        announcement: Announcement,
        target: NotificationTarget,
        config: Arc<Config>,
    },
    Update {
        notify_id: String,
        status: NotifyStatus,
        attempt: u32,
        retry_pending: bool,
    },
    Hold {
        notify_ids: Vec<String>,
        done: oneshot::Sender<()>,
    },
    Release {
        notify_ids: Vec<String>,
    },
    Cancel {
        notify_id: String,
    },
    Snapshot {
        notify_id: String,
        reply: oneshot::Sender<Option<TargetSnapshot>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the tracker task.
///
/// The task is the only place per-target state lives and the only caller of
/// the event sink, so events for one notify id come out in transition order.
#[derive(Clone)]
pub struct StatusTracker {
    tx: mpsc::UnboundedSender<TrackerCommand>,
}

impl StatusTracker {
    /// Spawn the tracker task on the current runtime. At most `retention`
    /// settled targets stay in memory; older ones are only in the archive.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        archive: Option<Arc<NotifyArchive>>,
        retention: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut board = TargetBoard::new(transport, sink, archive, retention, tx.downgrade());

        tokio::spawn(async move {
            info!("Status tracker started");
            while let Some(cmd) = rx.recv().await {
                if !board.handle(cmd).await {
                    break;
                }
            }
            info!("Status tracker stopped");
        });

        StatusTracker { tx }
    }

    fn send(&self, cmd: TrackerCommand) {
        if self.tx.send(cmd).is_err() {
            warn!("Status tracker stopped, command dropped");
        }
    }

    pub fn finished(&self, request: NotificationRequest, result: ResultCode) {
        self.send(TrackerCommand::Finished { request, result });
    }

    pub fn track(
        &self,
        request_id: &str,
        announcement: &Announcement,
        target: NotificationTarget,
        config: Arc<Config>,
    ) {
        self.send(TrackerCommand::Track {
            request_id: request_id.to_string(),
            announcement: announcement.clone(),
            target,
            config,
        });
    }

    /// Park the pollers of `notify_ids` while a cancellation is submitted.
    /// Resolves once every poller has been told.
    pub async fn hold(&self, notify_ids: &[String]) {
        let (done, rx) = oneshot::channel();
        self.send(TrackerCommand::Hold {
            notify_ids: notify_ids.to_vec(),
            done,
        });
        let _ = rx.await;
    }

    /// Resume pollers held for a cancellation the server rejected
    pub fn release(&self, notify_ids: &[String]) {
        self.send(TrackerCommand::Release {
            notify_ids: notify_ids.to_vec(),
        });
    }

    pub fn cancel(&self, notify_id: &str) {
        self.send(TrackerCommand::Cancel {
            notify_id: notify_id.to_string(),
        });
    }

    pub async fn snapshot(&self, notify_id: &str) -> Option<TargetSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::Snapshot {
            notify_id: notify_id.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    /// Cancel every poller and wait for them to exit. No events are emitted.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        self.send(TrackerCommand::Shutdown { done });
        let _ = rx.await;
    }
}

struct TrackedTarget {
    request_id: String,
    target: NotificationTarget,
    settled: bool,
    /// Order in which the target settled, used for eviction
    settled_seq: u64,
    /// Cancellations in flight for this target
    holds: u32,
    control: watch::Sender<PollerControl>,
}

impl TrackedTarget {
    fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            request_id: self.request_id.clone(),
            notify_id: self.target.notify_id.clone(),
            phone_number: self.target.phone_number.clone(),
            status: self.target.status,
            attempts: self.target.attempts,
            last_attempt_at: self.target.last_attempt_at,
            settled: self.settled,
        }
    }
}

/// State owned by the tracker task
pub(crate) struct TargetBoard {
    targets: HashMap<String, TrackedTarget>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    archive: Option<Arc<NotifyArchive>>,
    retention: usize,
    settled_order: VecDeque<(String, u64)>,
    settle_seq: u64,
    updates: mpsc::WeakUnboundedSender<TrackerCommand>,
    pollers: Vec<JoinHandle<()>>,
}

impl TargetBoard {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        archive: Option<Arc<NotifyArchive>>,
        retention: usize,
        updates: mpsc::WeakUnboundedSender<TrackerCommand>,
    ) -> Self {
        TargetBoard {
            targets: HashMap::new(),
            transport,
            sink,
            archive,
            retention,
            settled_order: VecDeque::new(),
            settle_seq: 0,
            updates,
            pollers: Vec::new(),
        }
    }

    /// Apply one command. Returns false once the task should stop.
    pub(crate) async fn handle(&mut self, cmd: TrackerCommand) -> bool {
        match cmd {
            TrackerCommand::Finished { request, result } => self.finish_request(request, result),
            TrackerCommand::Track {
                request_id,
                announcement,
                target,
                config,
            } => self.track(request_id, announcement, target, config),
            TrackerCommand::Update {
                notify_id,
                status,
                attempt,
                retry_pending,
            } => self.update(&notify_id, status, attempt, retry_pending),
            TrackerCommand::Hold { notify_ids, done } => {
                self.hold(&notify_ids);
                let _ = done.send(());
            }
            TrackerCommand::Release { notify_ids } => self.release(&notify_ids),
            TrackerCommand::Cancel { notify_id } => self.cancel(&notify_id),
            TrackerCommand::Snapshot { notify_id, reply } => {
                let _ = reply.send(self.snapshot(&notify_id));
            }
            TrackerCommand::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn finish_request(&mut self, request: NotificationRequest, result: ResultCode) {
        self.sink.finished(&request.request_id, result);

        if let Some(archive) = &self.archive {
            let finished = FinishedRequest {
                request,
                result,
                finished_at: Utc::now().timestamp_millis(),
            };
            if let Err(e) = archive.record_finished(&finished) {
                error!(
                    request_id = %finished.request.request_id,
                    "Failed to archive finished request: {:?}", e
                );
            }
        }
    }

    fn track(
        &mut self,
        request_id: String,
        announcement: Announcement,
        target: NotificationTarget,
        config: Arc<Config>,
    ) {
        let notify_id = target.notify_id.clone();

        if let Some(existing) = self.targets.get(&notify_id) {
            if !existing.settled {
                warn!(
                    notify_id = %notify_id,
                    request_id = %request_id,
                    active_request_id = %existing.request_id,
                    "Notify id already being tracked, target ignored"
                );
                return;
            }
        }

        let updates = match self.updates.upgrade() {
            Some(tx) => tx,
            None => return,
        };

        let (control_tx, control_rx) = watch::channel(PollerControl::Run);
        let phone_number = target.phone_number.clone();
        self.targets.insert(
            notify_id.clone(),
            TrackedTarget {
                request_id,
                target,
                settled: false,
                settled_seq: 0,
                holds: 0,
                control: control_tx,
            },
        );

        self.update(&notify_id, NotifyStatus::PreparedToSendingToServer, 0, false);
        self.update(&notify_id, NotifyStatus::SendedToServer, 0, false);

        let poller = TargetPoller::new(
            notify_id,
            phone_number,
            announcement,
            config,
            self.transport.clone(),
            updates,
            control_rx,
        );

        self.pollers.retain(|handle| !handle.is_finished());
        self.pollers.push(tokio::spawn(poller.run()));
    }

    fn update(&mut self, notify_id: &str, status: NotifyStatus, attempt: u32, retry_pending: bool) {
        let entry = match self.targets.get_mut(notify_id) {
            Some(entry) if !entry.settled => entry,
            _ => {
                debug!(
                    notify_id = %notify_id,
                    status = status.as_str(),
                    "Update for settled or unknown target dropped"
                );
                return;
            }
        };

        // Reject out-of-order transitions
        if !entry.target.status.can_transition_to(status) {
            warn!(
                notify_id = %notify_id,
                from = entry.target.status.as_str(),
                to = status.as_str(),
                "Invalid status transition dropped"
            );
            return;
        }

        // Apply transition
        entry.target.status = status;
        if attempt > 0 {
            entry.target.attempts = attempt;
        }
        if status == NotifyStatus::NotifyInProcess {
            entry.target.last_attempt_at = Some(Utc::now());
        }
        // A failed attempt with a retry ahead is not final
        entry.settled = status.is_terminal() && !(status == NotifyStatus::Failed && retry_pending);
        let settled = entry.settled.then(|| entry.snapshot());

        self.sink.notify_status(notify_id, status);

        // Persist and bound memory once final
        if let Some(snapshot) = settled {
            self.archive_outcome(&snapshot);
            self.retire(notify_id);
        }
    }

    fn hold(&mut self, notify_ids: &[String]) {
        for notify_id in notify_ids {
            if let Some(entry) = self.targets.get_mut(notify_id) {
                if entry.settled {
                    continue;
                }
                entry.holds += 1;
                let _ = entry.control.send(PollerControl::Hold);
                debug!(notify_id = %notify_id, holds = entry.holds, "Poller held for cancellation");
            }
        }
    }

    fn release(&mut self, notify_ids: &[String]) {
        for notify_id in notify_ids {
            if let Some(entry) = self.targets.get_mut(notify_id) {
                if entry.settled || entry.holds == 0 {
                    continue;
                }
                entry.holds -= 1;
                if entry.holds == 0 {
                    let _ = entry.control.send(PollerControl::Run);
                    debug!(notify_id = %notify_id, "Poller released, cancellation rejected");
                }
            }
        }
    }

    fn cancel(&mut self, notify_id: &str) {
        let entry = match self.targets.get_mut(notify_id) {
            Some(entry) if !entry.settled => entry,
            _ => {
                debug!(notify_id = %notify_id, "Cancel for settled or unknown target ignored");
                return;
            }
        };

        info!(notify_id = %notify_id, "Notification cancelled");

        // Settle first so late poller reports are dropped
        entry.target.status = NotifyStatus::CanceledNotify;
        entry.settled = true;
        let _ = entry.control.send(PollerControl::Cancel);
        let snapshot = entry.snapshot();

        self.sink.notify_status(notify_id, NotifyStatus::CanceledNotify);
        self.archive_outcome(&snapshot);
        self.retire(notify_id);
    }

    /// Queue a settled target for eviction and drop the oldest ones past `retention`
    fn retire(&mut self, notify_id: &str) {
        self.settle_seq += 1;
        let seq = self.settle_seq;
        if let Some(entry) = self.targets.get_mut(notify_id) {
            entry.settled_seq = seq;
        }
        self.settled_order.push_back((notify_id.to_string(), seq));

        while self.settled_order.len() > self.retention {
            if let Some((id, seq)) = self.settled_order.pop_front() {
                // skip ids tracked again since they settled
                let stale = self
                    .targets
                    .get(&id)
                    .map(|entry| entry.settled && entry.settled_seq == seq)
                    .unwrap_or(false);
                if stale {
                    self.targets.remove(&id);
                    debug!(notify_id = %id, "Settled target evicted");
                }
            }
        }
    }

    /// Live state first, then the archive for evicted targets
    fn snapshot(&self, notify_id: &str) -> Option<TargetSnapshot> {
        if let Some(entry) = self.targets.get(notify_id) {
            return Some(entry.snapshot());
        }

        let archive = self.archive.as_ref()?;
        match archive.target_outcome(notify_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(notify_id = %notify_id, "Failed to read archived outcome: {:?}", e);
                None
            }
        }
    }

    fn archive_outcome(&self, snapshot: &TargetSnapshot) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.record_outcome(snapshot) {
                error!(notify_id = %snapshot.notify_id, "Failed to archive outcome: {:?}", e);
            }
        }
    }

    async fn shutdown(&mut self) {
        for entry in self.targets.values() {
            let _ = entry.control.send(PollerControl::Cancel);
        }
        let pollers = std::mem::take(&mut self.pollers);
        futures::future::join_all(pollers).await;
    }
}
