use crate::campaign::types::{NotificationRequest, ResultCode, TargetSnapshot};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A request after its `finished` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedRequest {
    pub request: NotificationRequest,
    pub result: ResultCode,
    pub finished_at: i64, // epoch ms
}

/// sled-backed record of finished requests and settled targets
pub struct NotifyArchive {
    db: sled::Db,
    finished_requests: sled::Tree,
    target_outcomes: sled::Tree,
}

impl NotifyArchive {
    pub fn open(db_path: &str) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create archive directory: {}", parent.display())
            })?;
        }

        let db = sled::open(db_path)
            .with_context(|| format!("Failed to open sled database at: {}", db_path))?;

        // One tree per record kind
        let finished_requests = db
            .open_tree("finished_requests")
            .context("Failed to open finished_requests tree")?;

        let target_outcomes = db
            .open_tree("target_outcomes")
            .context("Failed to open target_outcomes tree")?;

        Ok(NotifyArchive {
            db,
            finished_requests,
            target_outcomes,
        })
    }

    /// Request ids are reusable once finished, so the key carries the finish time
    pub fn record_finished(&self, finished: &FinishedRequest) -> Result<()> {
        let key = format!("{}:{:020}", finished.request.request_id, finished.finished_at);

        // Serialize request
        let value = bincode::serialize(finished).context("Failed to serialize finished request")?;

        // Store and flush before reporting success
        self.finished_requests
            .insert(key.as_str(), value)
            .context("Failed to insert finished request")?;
        self.db
            .flush()
            .context("Failed to flush sled DB after request insert")?;

        debug!(request_id = %finished.request.request_id, "Finished request archived");
        Ok(())
    }

    /// All archived submissions of `request_id`, oldest first
    pub fn finished_requests(&self, request_id: &str) -> Result<Vec<FinishedRequest>> {
        let prefix = format!("{}:", request_id);
        let mut out = Vec::new();

        for item in self.finished_requests.scan_prefix(prefix.as_bytes()) {
            // Zero-padded timestamps keep prefix scans in finish order
            let (_, value) = item.context("Failed to read from finished_requests tree")?;
            let finished: FinishedRequest =
                bincode::deserialize(&value).context("Failed to deserialize finished request")?;
            out.push(finished);
        }

        Ok(out)
    }

    pub fn record_outcome(&self, outcome: &TargetSnapshot) -> Result<()> {
        // Serialize snapshot
        let value = bincode::serialize(outcome).context("Failed to serialize target outcome")?;

        // Latest outcome per notify id wins
        self.target_outcomes
            .insert(outcome.notify_id.as_str(), value)
            .context("Failed to insert target outcome")?;
        self.db
            .flush()
            .context("Failed to flush sled DB after outcome insert")?;

        debug!(
            notify_id = %outcome.notify_id,
            status = outcome.status.as_str(),
            "Target outcome archived"
        );
        Ok(())
    }

    pub fn target_outcome(&self, notify_id: &str) -> Result<Option<TargetSnapshot>> {
        match self.target_outcomes.get(notify_id)? {
            Some(value) => {
                let outcome: TargetSnapshot = bincode::deserialize(&value)
                    .context("Failed to deserialize target outcome")?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::types::{Announcement, NotifyStatus, RequestKind};
    use tempfile::TempDir;

    fn open_archive() -> (TempDir, NotifyArchive) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("archive.db");
        let archive = NotifyArchive::open(db_path.to_str().unwrap()).unwrap();
        (temp_dir, archive)
    }

    #[test]
    fn test_reused_request_id_keeps_both_submissions() {
        let (_temp_dir, archive) = open_archive();

        let request = NotificationRequest::new(
            "req1",
            RequestKind::Notify {
                announcement: Announcement::Predefined {
                    context: "outbound".to_string(),
                    extension: "1000".to_string(),
                },
                targets: Vec::new(),
            },
        );

        for (result, at) in [(ResultCode::TimeoutError, 10), (ResultCode::CommandAccepted, 20)] {
            archive
                .record_finished(&FinishedRequest {
                    request: request.clone(),
                    result,
                    finished_at: at,
                })
                .unwrap();
        }

        let history = archive.finished_requests("req1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].result, ResultCode::TimeoutError);
        assert_eq!(history[1].result, ResultCode::CommandAccepted);
        assert!(archive.finished_requests("req").unwrap().is_empty());
    }

    #[test]
    fn test_target_outcome_round_trip() {
        let (_temp_dir, archive) = open_archive();
        assert!(archive.target_outcome("n1").unwrap().is_none());

        let outcome = TargetSnapshot {
            request_id: "req1".to_string(),
            notify_id: "n1".to_string(),
            phone_number: "+15551234".to_string(),
            status: NotifyStatus::Confirmed,
            attempts: 2,
            last_attempt_at: Some(chrono::Utc::now()),
            settled: true,
        };
        archive.record_outcome(&outcome).unwrap();

        assert_eq!(archive.target_outcome("n1").unwrap(), Some(outcome));
    }
}
