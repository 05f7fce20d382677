use crate::campaign::tracker::TrackerCommand;
use crate::campaign::types::{Announcement, DialAttempt, NotifyStatus};
use crate::config::Config;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Signal from the tracker to one poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerControl {
    Run,
    /// A cancellation is being submitted; park until it resolves
    Hold,
    Cancel,
}

/// Dial/poll/retry loop for one accepted target.
///
/// The poller never emits events itself: every transition goes back to the
/// tracker task, which owns the target state and the sink.
pub(crate) struct TargetPoller {
    notify_id: String,
    phone_number: String,
    announcement: Announcement,
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    updates: mpsc::UnboundedSender<TrackerCommand>,
    control: watch::Receiver<PollerControl>,
}

impl TargetPoller {
    pub(crate) fn new(
        notify_id: String,
        phone_number: String,
        announcement: Announcement,
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        updates: mpsc::UnboundedSender<TrackerCommand>,
        control: watch::Receiver<PollerControl>,
    ) -> Self {
        TargetPoller {
            notify_id,
            phone_number,
            announcement,
            config,
            transport,
            updates,
            control,
        }
    }

    pub async fn run(mut self) {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            if !self.wait(self.config.inter_attempt_delay()).await {
                debug!(notify_id = %self.notify_id, "Poller cancelled before dialing");
                return;
            }

            attempt += 1;
            self.report(NotifyStatus::NotifyInProcess, attempt, false);

            let outcome = match self.run_attempt(attempt).await {
                Some(status) => status,
                None => {
                    debug!(notify_id = %self.notify_id, attempt, "Poller cancelled mid-attempt");
                    return;
                }
            };

            if outcome != NotifyStatus::Failed {
                info!(
                    notify_id = %self.notify_id,
                    attempt,
                    status = outcome.as_str(),
                    "Notification settled"
                );
                self.report(outcome, attempt, false);
                return;
            }

            let retry = attempt < max_attempts;
            if retry {
                warn!(
                    notify_id = %self.notify_id,
                    attempt,
                    max_attempts,
                    "Call attempt failed, scheduling retry"
                );
            } else {
                warn!(
                    notify_id = %self.notify_id,
                    attempts = attempt,
                    "Max retry attempts exceeded, marking notification as failed"
                );
            }
            self.report(NotifyStatus::Failed, attempt, retry);
            if !retry {
                return;
            }
        }
    }

    /// One dial followed by polling. `None` when cancelled.
    async fn run_attempt(&mut self, attempt: u32) -> Option<NotifyStatus> {
        let request_timeout = self.config.request_timeout();
        let dial = DialAttempt {
            notify_id: self.notify_id.clone(),
            phone_number: self.phone_number.clone(),
            announcement: self.announcement.clone(),
            attempt,
        };

        let dialed = timeout(request_timeout, self.transport.dial(&dial)).await;

        // a cancellation submitted while dialing must not leave the call ringing
        if !self.checkpoint().await {
            self.abandon().await;
            return None;
        }

        match dialed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(notify_id = %self.notify_id, attempt, error = %e, "Dial failed");
                return Some(e.as_notify_status());
            }
            Err(_) => {
                warn!(notify_id = %self.notify_id, attempt, "Dial timed out");
                self.abandon().await;
                return Some(NotifyStatus::NetworkError);
            }
        }

        let deadline = Instant::now() + self.config.answer_wait_time();

        loop {
            if !self.wait(self.config.status_poll_delay()).await {
                return None;
            }

            let polled = timeout(request_timeout, self.transport.query_status(&self.notify_id)).await;

            // responses that land while a cancellation is pending are dropped
            if !self.checkpoint().await {
                return None;
            }

            let status = match polled {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(notify_id = %self.notify_id, attempt, error = %e, "Status query failed");
                    self.abandon().await;
                    return Some(e.as_notify_status());
                }
                Err(_) => {
                    warn!(notify_id = %self.notify_id, attempt, "Status query timed out");
                    self.abandon().await;
                    return Some(NotifyStatus::NetworkError);
                }
            };

            if status.is_terminal() {
                return Some(status);
            }

            // the answer window only bounds ringing; an answered call runs to its end
            if Instant::now() >= deadline && !self.transport.is_answered(&self.notify_id) {
                debug!(notify_id = %self.notify_id, attempt, "Answer wait time elapsed");
                self.abandon().await;
                return Some(NotifyStatus::Failed);
            }
        }
    }

    /// Drop the live call of this attempt, if any
    async fn abandon(&self) {
        let request_timeout = self.config.request_timeout();
        match timeout(request_timeout, self.transport.abandon(&self.notify_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(notify_id = %self.notify_id, error = %e, "Failed to abandon call");
            }
            Err(_) => {
                warn!(notify_id = %self.notify_id, "Abandoning call timed out");
            }
        }
    }

    /// Sleep unless cancelled first, then pass a checkpoint.
    /// Returns false on cancellation.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;

        loop {
            if *self.control.borrow_and_update() == PollerControl::Cancel {
                return false;
            }

            let control = &mut self.control;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                changed = control.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }

        self.checkpoint().await
    }

    /// Park while a cancellation is pending. True to go on, false when cancelled.
    async fn checkpoint(&mut self) -> bool {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                PollerControl::Run => return true,
                PollerControl::Cancel => return false,
                PollerControl::Hold => {}
            }

            if self.control.changed().await.is_err() {
                return false;
            }
        }
    }

    fn report(&self, status: NotifyStatus, attempt: u32, retry_pending: bool) {
        let update = TrackerCommand::Update {
            notify_id: self.notify_id.clone(),
            status,
            attempt,
            retry_pending,
        };
        if self.updates.send(update).is_err() {
            debug!(notify_id = %self.notify_id, "Tracker gone, update dropped");
        }
    }
}
