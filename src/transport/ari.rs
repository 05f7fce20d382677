//! Asterisk REST Interface (ARI) transport.
//!
//! Every call attempt originates its own channel; the transport remembers the
//! latest channel per notify id so status queries and cancellations can find it.

use crate::campaign::types::{Announcement, DialAttempt, NotificationRequest, NotifyStatus, RequestKind};
use crate::config::Config;
use crate::transport::{Transport, TransportError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Channel variable the dial plan sets once the announcement has played
const RESULT_VARIABLE: &str = "NOTIFY_RESULT";

#[derive(Debug, Clone)]
struct LiveChannel {
    channel_id: String,
    answered: bool,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct VariableValue {
    value: String,
}

pub struct AriTransport {
    http_client: Client,
    base_url: String,
    username: String,
    password: String,
    technology: String,
    application: String,
    channels: Mutex<HashMap<String, LiveChannel>>,
}

impl AriTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(AriTransport {
            http_client,
            base_url: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            technology: config.technology.clone(),
            application: config.ari_application.clone(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http_client.get(format!("{}{}", self.base_url, path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http_client.post(format!("{}{}", self.base_url, path)))
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http_client.delete(format!("{}{}", self.base_url, path)))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.username, Some(&self.password))
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, LiveChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_channel(&self, notify_id: &str) -> Option<LiveChannel> {
        self.channels().get(notify_id).cloned()
    }

    async fn hang_up(&self, notify_id: &str) -> Result<(), TransportError> {
        let channel = match self.live_channel(notify_id) {
            Some(channel) => channel,
            None => return Ok(()),
        };

        let response = self
            .delete(&format!("/channels/{}", channel.channel_id))
            .send()
            .await
            .map_err(classify)?;

        if response.status() != StatusCode::NOT_FOUND {
            check_status(response).await?;
        }
        self.channels().remove(notify_id);

        info!(notify_id = %notify_id, channel_id = %channel.channel_id, "Channel hung up");
        Ok(())
    }

    async fn call_result(&self, channel_id: &str) -> Result<Option<String>, TransportError> {
        let response = self
            .get(&format!("/channels/{}/variable", channel_id))
            .query(&[("variable", RESULT_VARIABLE)])
            .send()
            .await
            .map_err(classify)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let value: VariableValue = check_status(response)
            .await?
            .json()
            .await
            .map_err(classify)?;

        Ok(Some(value.value).filter(|v| !v.is_empty()))
    }
}

#[async_trait]
impl Transport for AriTransport {
    async fn submit(&self, request: &NotificationRequest) -> Result<(), TransportError> {
        match &request.kind {
            RequestKind::Notify { .. } => {
                let response = self.get("/asterisk/info").send().await.map_err(classify)?;
                check_status(response).await?;
                Ok(())
            }
            RequestKind::Cancel { notify_ids } => {
                for notify_id in notify_ids {
                    self.hang_up(notify_id).await?;
                }
                Ok(())
            }
        }
    }

    async fn dial(&self, attempt: &DialAttempt) -> Result<(), TransportError> {
        let channel_id = format!("{}-{}", attempt.notify_id, Uuid::new_v4());
        let mut params = vec![
            ("endpoint", format!("{}/{}", self.technology, attempt.phone_number)),
            ("channelId", channel_id.clone()),
        ];

        match &attempt.announcement {
            Announcement::Predefined { context, extension } => {
                params.push(("context", context.clone()));
                params.push(("extension", extension.clone()));
                params.push(("priority", "1".to_string()));
            }
            Announcement::Custom { media_path } => {
                params.push(("app", self.application.clone()));
                params.push(("appArgs", media_uri(media_path)));
            }
        }

        let response = self
            .post("/channels")
            .query(&params)
            .send()
            .await
            .map_err(classify)?;
        check_status(response).await?;

        debug!(
            notify_id = %attempt.notify_id,
            channel_id = %channel_id,
            attempt = attempt.attempt,
            "Channel originated"
        );

        self.channels().insert(
            attempt.notify_id.clone(),
            LiveChannel {
                channel_id,
                answered: false,
            },
        );
        Ok(())
    }

    async fn query_status(&self, notify_id: &str) -> Result<NotifyStatus, TransportError> {
        let channel = self
            .live_channel(notify_id)
            .ok_or_else(|| TransportError::WrongRequest(format!("no channel for {}", notify_id)))?;

        let response = self
            .get(&format!("/channels/{}", channel.channel_id))
            .send()
            .await
            .map_err(classify)?;

        // channel gone: the call ended
        if response.status() == StatusCode::NOT_FOUND {
            self.channels().remove(notify_id);
            return Ok(if channel.answered {
                NotifyStatus::Completed
            } else {
                NotifyStatus::Failed
            });
        }

        let info: ChannelInfo = check_status(response)
            .await?
            .json()
            .await
            .map_err(classify)?;

        let status = match info.state.as_str() {
            "Up" => {
                if let Some(live) = self.channels().get_mut(notify_id) {
                    live.answered = true;
                }
                match self.call_result(&channel.channel_id).await?.as_deref() {
                    Some("confirmed") => NotifyStatus::Confirmed,
                    Some("completed") => NotifyStatus::Completed,
                    _ => NotifyStatus::NotifyInProcess,
                }
            }
            "Busy" => NotifyStatus::Failed,
            _ => NotifyStatus::NotifyInProcess,
        };

        // the attempt is over, the server tears the channel down on its own
        if status.is_terminal() {
            self.channels().remove(notify_id);
        }

        Ok(status)
    }

    fn is_answered(&self, notify_id: &str) -> bool {
        self.channels()
            .get(notify_id)
            .map(|live| live.answered)
            .unwrap_or(false)
    }

    async fn abandon(&self, notify_id: &str) -> Result<(), TransportError> {
        let result = self.hang_up(notify_id).await;
        // a failed hang-up is not retried, the next attempt dials a fresh channel
        self.channels().remove(notify_id);
        result
    }
}

/// Asterisk plays `sound:` URIs without the file extension
fn media_uri(path: &Path) -> String {
    format!("sound:{}", path.with_extension("").display())
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    let detail = format!("HTTP {}: {}", code, body);

    Err(match code {
        401 | 403 => TransportError::Authentication,
        400 | 404 | 409 | 422 => TransportError::WrongRequest(detail),
        500..=599 => TransportError::InternalServer(detail),
        _ => TransportError::Unknown(detail),
    })
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }

    let detail = error_chain(&err);
    if err.is_connect() {
        let lowered = detail.to_lowercase();
        if lowered.contains("dns error")
            || lowered.contains("failed to lookup address")
            || lowered.contains("name or service not known")
        {
            return TransportError::HostNotFound(detail);
        }
        return TransportError::ConnectionRefused(detail);
    }

    TransportError::Unknown(detail)
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::types::NotificationTarget;
    use wiremock::matchers::{header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> Config {
        Config::default()
            .with_username("ops")
            .with_password("secret")
            .with_server_address("127.0.0.1")
            .with_service_port(server.address().port())
            .with_technology("PJSIP")
            .with_ari_application("voice-notify")
    }

    fn notify_request() -> NotificationRequest {
        NotificationRequest::new(
            "req1",
            RequestKind::Notify {
                announcement: Announcement::Predefined {
                    context: "outbound".to_string(),
                    extension: "1000".to_string(),
                },
                targets: vec![NotificationTarget::new("n1", "+15551234")],
            },
        )
    }

    fn attempt(announcement: Announcement) -> DialAttempt {
        DialAttempt {
            notify_id: "n1".to_string(),
            phone_number: "+15551234".to_string(),
            announcement,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_submit_checks_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ari/asterisk/info"))
            .and(header("authorization", "Basic b3BzOnNlY3JldA=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let transport = AriTransport::new(&config_for(&server)).unwrap();
        assert_eq!(transport.submit(&notify_request()).await, Ok(()));
    }

    #[tokio::test]
    async fn test_submit_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ari/asterisk/info"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = AriTransport::new(&config_for(&server)).unwrap();
        assert_eq!(
            transport.submit(&notify_request()).await,
            Err(TransportError::Authentication)
        );

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/ari/asterisk/info"))
            .respond_with(ResponseTemplate::new(503).set_body_string("restarting"))
            .mount(&server)
            .await;

        assert!(matches!(
            transport.submit(&notify_request()).await,
            Err(TransportError::InternalServer(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config::default()
            .with_server_address("127.0.0.1")
            .with_service_port(port);
        let transport = AriTransport::new(&config).unwrap();

        assert!(matches!(
            transport.submit(&notify_request()).await,
            Err(TransportError::ConnectionRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_and_confirmed_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ari/channels"))
            .and(query_param("endpoint", "PJSIP/+15551234"))
            .and(query_param("context", "outbound"))
            .and(query_param("extension", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "Up"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+/variable$"))
            .and(query_param("variable", RESULT_VARIABLE))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": "confirmed"})),
            )
            .mount(&server)
            .await;

        let transport = AriTransport::new(&config_for(&server)).unwrap();
        transport
            .dial(&attempt(Announcement::Predefined {
                context: "outbound".to_string(),
                extension: "1000".to_string(),
            }))
            .await
            .unwrap();

        assert_eq!(transport.query_status("n1").await, Ok(NotifyStatus::Confirmed));
        assert!(transport.channels().is_empty());
    }

    #[tokio::test]
    async fn test_answered_call_is_tracked_and_abandoned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ari/channels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "Up"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+/variable$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": ""})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+$"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let transport = AriTransport::new(&config_for(&server)).unwrap();
        transport
            .dial(&attempt(Announcement::Custom {
                media_path: "/srv/media/alert.wav".into(),
            }))
            .await
            .unwrap();

        assert!(!transport.is_answered("n1"));
        assert_eq!(transport.query_status("n1").await, Ok(NotifyStatus::NotifyInProcess));
        assert!(transport.is_answered("n1"));

        // the entry goes even when the server refuses the hang-up
        assert!(matches!(
            transport.abandon("n1").await,
            Err(TransportError::InternalServer(_))
        ));
        assert!(transport.channels().is_empty());
        assert!(!transport.is_answered("n1"));
    }

    #[tokio::test]
    async fn test_vanished_channel_before_answer_is_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ari/channels"))
            .and(query_param("app", "voice-notify"))
            .and(query_param("appArgs", "sound:/srv/media/alert"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "Ringing"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = AriTransport::new(&config_for(&server)).unwrap();
        transport
            .dial(&attempt(Announcement::Custom {
                media_path: "/srv/media/alert.wav".into(),
            }))
            .await
            .unwrap();

        assert_eq!(transport.query_status("n1").await, Ok(NotifyStatus::NotifyInProcess));
        assert_eq!(transport.query_status("n1").await, Ok(NotifyStatus::Failed));
    }

    #[tokio::test]
    async fn test_busy_channel_is_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ari/channels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"state": "Busy"})))
            .mount(&server)
            .await;

        let transport = AriTransport::new(&config_for(&server)).unwrap();
        transport
            .dial(&attempt(Announcement::Custom {
                media_path: "/srv/media/alert.wav".into(),
            }))
            .await
            .unwrap();

        assert_eq!(transport.query_status("n1").await, Ok(NotifyStatus::Failed));
        assert!(transport.channels().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_hangs_up_live_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ari/channels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/ari/channels/n1-[^/]+$"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = AriTransport::new(&config_for(&server)).unwrap();
        transport
            .dial(&attempt(Announcement::Custom {
                media_path: "/srv/media/alert.wav".into(),
            }))
            .await
            .unwrap();

        let cancel = NotificationRequest::new(
            "req2",
            RequestKind::Cancel {
                notify_ids: vec!["n1".to_string(), "unknown".to_string()],
            },
        );
        assert_eq!(transport.submit(&cancel).await, Ok(()));
        assert!(matches!(
            transport.query_status("n1").await,
            Err(TransportError::WrongRequest(_))
        ));
    }

    #[test]
    fn test_media_uri_strips_extension() {
        assert_eq!(media_uri(Path::new("/srv/media/alert.wav")), "sound:/srv/media/alert");
        assert_eq!(media_uri(Path::new("greeting")), "sound:greeting");
    }
}
