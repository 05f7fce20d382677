use crate::campaign::archive::NotifyArchive;
use crate::campaign::builder::RequestRegistry;
use crate::campaign::dispatcher::{lock_registry, Dispatcher};
use crate::campaign::events::EventSink;
use crate::campaign::tracker::StatusTracker;
use crate::campaign::types::TargetSnapshot;
use crate::config::Config;
use crate::error::NotifyError;
use crate::transport::Transport;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

/// Entry point of the orchestrator: builds requests, submits them and
/// reports progress to its own event sink.
///
/// Must be created inside a tokio runtime.
pub struct NotifyClient {
    config: RwLock<Arc<Config>>,
    registry: Arc<Mutex<RequestRegistry>>,
    dispatcher: Dispatcher,
    tracker: StatusTracker,
}

impl NotifyClient {
    pub fn new(config: Config, transport: Arc<dyn Transport>, sink: Arc<dyn EventSink>) -> Self {
        Self::build(config, transport, sink, None)
    }

    pub fn with_archive(
        config: Config,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        archive: Arc<NotifyArchive>,
    ) -> Self {
        Self::build(config, transport, sink, Some(archive))
    }

    fn build(
        config: Config,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        archive: Option<Arc<NotifyArchive>>,
    ) -> Self {
        let registry = Arc::new(Mutex::new(RequestRegistry::new()));
        let tracker =
            StatusTracker::spawn(transport.clone(), sink, archive, config.settled_retention);
        let dispatcher = Dispatcher::new(transport, tracker.clone(), registry.clone());

        NotifyClient {
            config: RwLock::new(Arc::new(config)),
            registry,
            dispatcher,
            tracker,
        }
    }

    /// Configuration the next submitted request will snapshot
    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_config(&self, config: Config) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    /// Change individual options, e.g. `client.update_config(|c| c.max_retries = 1)`.
    /// Requests already submitted keep the values they started with.
    pub fn update_config(&self, change: impl FnOnce(&mut Config)) {
        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        change(Arc::make_mut(&mut guard));
    }

    pub fn create_predefined_notify(
        &self,
        context: &str,
        extension: &str,
        request_id: &str,
    ) -> Result<(), NotifyError> {
        lock_registry(&self.registry).create_predefined_notify(context, extension, request_id)
    }

    pub fn create_custom_notify(
        &self,
        media_path: impl Into<PathBuf>,
        request_id: &str,
    ) -> Result<(), NotifyError> {
        lock_registry(&self.registry).create_custom_notify(media_path, request_id)
    }

    pub fn cancel_notify(&self, request_id: &str) -> Result<(), NotifyError> {
        lock_registry(&self.registry).cancel_notify(request_id)
    }

    pub fn add_target(
        &self,
        request_id: &str,
        phone_number: &str,
        notify_id: &str,
    ) -> Result<(), NotifyError> {
        lock_registry(&self.registry).add_target(request_id, phone_number, notify_id)
    }

    pub fn mark_cancel(&self, request_id: &str, notify_id: &str) -> Result<(), NotifyError> {
        lock_registry(&self.registry).mark_cancel(request_id, notify_id)
    }

    /// Add a target to a notify draft or a notify id to a cancel draft.
    /// Returns false without changing anything when the call is not valid.
    pub fn add_phone_to_notify(&self, request_id: &str, phone_number: &str, notify_id: &str) -> bool {
        match lock_registry(&self.registry).add_phone_to_notify(request_id, phone_number, notify_id)
        {
            Ok(()) => true,
            Err(e) => {
                warn!(request_id = %request_id, notify_id = %notify_id, error = %e, "Add rejected");
                false
            }
        }
    }

    /// Freeze the draft and start its submission. The outcome arrives as a
    /// `finished` event; false means `request_id` is not a draft.
    pub fn send_request(&self, request_id: &str) -> bool {
        let request = match lock_registry(&self.registry).submit(request_id) {
            Ok(request) => request,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Send rejected");
                return false;
            }
        };

        self.dispatcher.dispatch(request, self.config());
        true
    }

    /// Current state of a tracked target. Evicted targets are looked up in
    /// the archive when there is one.
    pub async fn target_status(&self, notify_id: &str) -> Option<TargetSnapshot> {
        self.tracker.snapshot(notify_id).await
    }

    /// Stop every poller without emitting further events
    pub async fn shutdown(&self) {
        self.tracker.shutdown().await;
    }
}
