use crate::campaign::types::{
    Announcement, NotificationRequest, NotificationTarget, RequestKind, RequestState,
};
use crate::error::NotifyError;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Active requests keyed by request id: drafts still being filled plus
/// submitted requests whose `finished` event has not fired yet.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    requests: HashMap<String, NotificationRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        RequestRegistry {
            requests: HashMap::new(),
        }
    }

    pub fn create_predefined_notify(
        &mut self,
        context: &str,
        extension: &str,
        request_id: &str,
    ) -> Result<(), NotifyError> {
        let announcement = Announcement::Predefined {
            context: context.to_string(),
            extension: extension.to_string(),
        };
        self.insert_draft(
            request_id,
            RequestKind::Notify {
                announcement,
                targets: Vec::new(),
            },
        )
    }

    pub fn create_custom_notify(
        &mut self,
        media_path: impl Into<PathBuf>,
        request_id: &str,
    ) -> Result<(), NotifyError> {
        let announcement = Announcement::Custom {
            media_path: media_path.into(),
        };
        self.insert_draft(
            request_id,
            RequestKind::Notify {
                announcement,
                targets: Vec::new(),
            },
        )
    }

    pub fn cancel_notify(&mut self, request_id: &str) -> Result<(), NotifyError> {
        self.insert_draft(
            request_id,
            RequestKind::Cancel {
                notify_ids: Vec::new(),
            },
        )
    }

    fn insert_draft(&mut self, request_id: &str, kind: RequestKind) -> Result<(), NotifyError> {
        if self.requests.contains_key(request_id) {
            return Err(NotifyError::DuplicateRequest(request_id.to_string()));
        }

        info!(
            request_id = %request_id,
            kind = kind.as_str(),
            "Draft request created"
        );
        self.requests
            .insert(request_id.to_string(), NotificationRequest::new(request_id, kind));
        Ok(())
    }

    /// Append a phone number to a notify draft
    pub fn add_target(
        &mut self,
        request_id: &str,
        phone_number: &str,
        notify_id: &str,
    ) -> Result<(), NotifyError> {
        let request = self.draft_mut(request_id)?;
        match &mut request.kind {
            RequestKind::Notify { targets, .. } => {
                if targets.iter().any(|t| t.notify_id == notify_id) {
                    return Err(duplicate(request_id, notify_id));
                }
                targets.push(NotificationTarget::new(notify_id, phone_number));
            }
            other => {
                return Err(NotifyError::WrongRequestKind {
                    request_id: request_id.to_string(),
                    expected: "notify",
                    actual: other.as_str(),
                })
            }
        }

        debug!(request_id = %request_id, notify_id = %notify_id, "Target added");
        Ok(())
    }

    /// Record a notify id to be cancelled by a cancel draft
    pub fn mark_cancel(&mut self, request_id: &str, notify_id: &str) -> Result<(), NotifyError> {
        let request = self.draft_mut(request_id)?;
        match &mut request.kind {
            RequestKind::Cancel { notify_ids } => {
                if notify_ids.iter().any(|id| id == notify_id) {
                    return Err(duplicate(request_id, notify_id));
                }
                notify_ids.push(notify_id.to_string());
            }
            other => {
                return Err(NotifyError::WrongRequestKind {
                    request_id: request_id.to_string(),
                    expected: "cancel",
                    actual: other.as_str(),
                })
            }
        }

        debug!(request_id = %request_id, notify_id = %notify_id, "Target marked for cancellation");
        Ok(())
    }

    /// Add a target or a cancellation depending on which kind of draft
    /// `request_id` names. The phone number is ignored for cancel drafts.
    pub fn add_phone_to_notify(
        &mut self,
        request_id: &str,
        phone_number: &str,
        notify_id: &str,
    ) -> Result<(), NotifyError> {
        let is_cancel = matches!(
            self.draft_mut(request_id)?.kind,
            RequestKind::Cancel { .. }
        );
        if is_cancel {
            self.mark_cancel(request_id, notify_id)
        } else {
            self.add_target(request_id, phone_number, notify_id)
        }
    }

    /// Freeze a draft and hand back a copy for submission
    pub fn submit(&mut self, request_id: &str) -> Result<NotificationRequest, NotifyError> {
        let request = self.draft_mut(request_id)?;
        request.state = RequestState::Submitted;
        Ok(request.clone())
    }

    /// Drop a request whose `finished` event is about to fire, freeing its id
    pub fn finish(&mut self, request_id: &str) -> Option<NotificationRequest> {
        self.requests.remove(request_id)
    }

    pub fn get(&self, request_id: &str) -> Option<&NotificationRequest> {
        self.requests.get(request_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn draft_mut(&mut self, request_id: &str) -> Result<&mut NotificationRequest, NotifyError> {
        match self.requests.get_mut(request_id) {
            Some(request) if request.is_draft() => Ok(request),
            _ => Err(NotifyError::UnknownDraft(request_id.to_string())),
        }
    }
}

fn duplicate(request_id: &str, notify_id: &str) -> NotifyError {
    NotifyError::DuplicateNotifyId {
        request_id: request_id.to_string(),
        notify_id: notify_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::types::NotifyStatus;

    #[test]
    fn test_duplicate_request_id_rejected() {
        let mut registry = RequestRegistry::new();
        registry
            .create_predefined_notify("outbound", "1000", "req1")
            .unwrap();

        let err = registry.create_custom_notify("/tmp/a.wav", "req1").unwrap_err();
        assert_eq!(err, NotifyError::DuplicateRequest("req1".to_string()));
        assert_eq!(registry.cancel_notify("req1"), Err(err));
    }

    #[test]
    fn test_duplicate_notify_id_leaves_targets_unchanged() {
        let mut registry = RequestRegistry::new();
        registry
            .create_predefined_notify("outbound", "1000", "req1")
            .unwrap();

        assert!(registry.add_phone_to_notify("req1", "+15551234", "n1").is_ok());
        assert!(registry.add_phone_to_notify("req1", "+15559999", "n1").is_err());

        let request = registry.get("req1").unwrap();
        match &request.kind {
            RequestKind::Notify { targets, .. } => {
                assert_eq!(targets.len(), 1);
                assert_eq!(targets[0].phone_number, "+15551234");
                assert_eq!(targets[0].status, NotifyStatus::PreparedToNotify);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_add_phone_dispatches_by_kind() {
        let mut registry = RequestRegistry::new();
        registry.cancel_notify("req2").unwrap();
        registry.add_phone_to_notify("req2", "", "n1").unwrap();

        assert_eq!(registry.get("req2").unwrap().notify_ids(), vec!["n1"]);

        let err = registry.add_target("req2", "+1555", "n2").unwrap_err();
        assert!(matches!(err, NotifyError::WrongRequestKind { expected: "notify", .. }));
    }

    #[test]
    fn test_submitted_request_is_frozen() {
        let mut registry = RequestRegistry::new();
        registry.create_custom_notify("/srv/alert.wav", "req1").unwrap();
        registry.add_phone_to_notify("req1", "+1555", "n1").unwrap();

        let submitted = registry.submit("req1").unwrap();
        assert_eq!(submitted.state, RequestState::Submitted);

        assert!(registry.add_phone_to_notify("req1", "+1556", "n2").is_err());
        assert!(registry.submit("req1").is_err());
        assert!(registry.create_predefined_notify("c", "e", "req1").is_err());

        registry.finish("req1");
        assert!(registry.create_predefined_notify("c", "e", "req1").is_ok());
    }

    #[test]
    fn test_unknown_request() {
        let mut registry = RequestRegistry::new();
        assert_eq!(
            registry.add_phone_to_notify("nope", "+1555", "n1"),
            Err(NotifyError::UnknownDraft("nope".to_string()))
        );
        assert!(registry.submit("nope").is_err());
        assert!(registry.is_empty());
    }
}
