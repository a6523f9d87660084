use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{
    DecodeSnafu, NotConfiguredSnafu, NotFoundSnafu, RequestSnafu, StatusSnafu, SyncResult,
    TimeoutSnafu,
};
use super::ids::{MessageId, SessionId};
use super::types::{Message, SessionSummary};
use super::BoxFuture;

/// Remote mirror of the session log.
///
/// Any call may fail; callers treat the remote as advisory.
pub trait SessionSync: Send + Sync {
    fn list_sessions(&self) -> BoxFuture<'_, SyncResult<Vec<SessionSummary>>>;
    /// Fails with [`crate::SyncError::NotFound`] when the remote has no such session.
    fn fetch_history<'a>(&'a self, session_id: &'a SessionId)
    -> BoxFuture<'a, SyncResult<Vec<Message>>>;
    fn push_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        message: &'a Message,
        title: Option<&'a str>,
    ) -> BoxFuture<'a, SyncResult<()>>;
    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, SyncResult<()>>;
    fn delete_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        message_id: MessageId,
    ) -> BoxFuture<'a, SyncResult<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub base_url: String,
    pub bearer_token: String,
    pub timeout: Duration,
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into().trim().to_string(),
            timeout: Duration::from_secs(8),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct PushMessageBody<'a> {
    message: &'a Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SessionListPayload {
    Wrapped { sessions: Vec<SessionSummary> },
    Bare(Vec<SessionSummary>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
    Wrapped { messages: Vec<Message> },
    Bare(Vec<Message>),
}

/// JSON-over-HTTP session sync authenticated with a bearer token.
pub struct HttpSessionSync {
    config: SyncConfig,
    client: reqwest::Client,
}

impl HttpSessionSync {
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context(RequestSnafu {
                stage: "sync-build-client",
            })?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        stage: &'static str,
        resource: String,
    ) -> SyncResult<reqwest::Response> {
        let request = request.bearer_auth(&self.config.bearer_token);
        let response = match tokio::time::timeout(self.config.timeout, request.send()).await {
            Ok(result) => result.context(RequestSnafu { stage })?,
            Err(_) => {
                return TimeoutSnafu {
                    stage,
                    timeout_ms: self.config.timeout.as_millis() as u64,
                }
                .fail();
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return NotFoundSnafu { stage, resource }.fail();
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }
}

impl SessionSync for HttpSessionSync {
    fn list_sessions(&self) -> BoxFuture<'_, SyncResult<Vec<SessionSummary>>> {
        Box::pin(async move {
            let response = self
                .send(
                    self.client.get(self.url("/sessions")),
                    "sync-list-sessions",
                    "session list".to_string(),
                )
                .await?;
            let payload = response
                .json::<SessionListPayload>()
                .await
                .context(DecodeSnafu {
                    stage: "sync-list-sessions-decode",
                })?;
            Ok(match payload {
                SessionListPayload::Wrapped { sessions } | SessionListPayload::Bare(sessions) => {
                    sessions
                }
            })
        })
    }

    fn fetch_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, SyncResult<Vec<Message>>> {
        Box::pin(async move {
            let response = self
                .send(
                    self.client
                        .get(self.url(&format!("/sessions/{session_id}/messages"))),
                    "sync-fetch-history",
                    format!("session '{session_id}'"),
                )
                .await?;
            let payload = response.json::<HistoryPayload>().await.context(DecodeSnafu {
                stage: "sync-fetch-history-decode",
            })?;
            Ok(match payload {
                HistoryPayload::Wrapped { messages } | HistoryPayload::Bare(messages) => messages,
            })
        })
    }

    fn push_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        message: &'a Message,
        title: Option<&'a str>,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            let path = format!("/sessions/{session_id}/messages/{}", message.id);
            self.send(
                self.client
                    .put(self.url(&path))
                    .json(&PushMessageBody { message, title }),
                "sync-push-message",
                format!("session '{session_id}'"),
            )
            .await?;
            Ok(())
        })
    }

    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            self.send(
                self.client
                    .delete(self.url(&format!("/sessions/{session_id}"))),
                "sync-delete-session",
                format!("session '{session_id}'"),
            )
            .await?;
            Ok(())
        })
    }

    fn delete_message<'a>(
        &'a self,
        session_id: &'a SessionId,
        message_id: MessageId,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            let path = format!("/sessions/{session_id}/messages/{message_id}");
            self.send(
                self.client.delete(self.url(&path)),
                "sync-delete-message",
                format!("message '{message_id}'"),
            )
            .await?;
            Ok(())
        })
    }
}

/// Stand-in used when no remote is configured; every call reports
/// [`crate::SyncError::NotConfigured`] so the store runs purely local.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineSync;

impl OfflineSync {
    fn unavailable<T: Send + 'static>(stage: &'static str) -> BoxFuture<'static, SyncResult<T>> {
        Box::pin(std::future::ready(NotConfiguredSnafu { stage }.fail()))
    }
}

impl SessionSync for OfflineSync {
    fn list_sessions(&self) -> BoxFuture<'_, SyncResult<Vec<SessionSummary>>> {
        Self::unavailable("offline-list-sessions")
    }

    fn fetch_history<'a>(
        &'a self,
        _session_id: &'a SessionId,
    ) -> BoxFuture<'a, SyncResult<Vec<Message>>> {
        Self::unavailable("offline-fetch-history")
    }

    fn push_message<'a>(
        &'a self,
        _session_id: &'a SessionId,
        _message: &'a Message,
        _title: Option<&'a str>,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Self::unavailable("offline-push-message")
    }

    fn delete_session<'a>(&'a self, _session_id: &'a SessionId) -> BoxFuture<'a, SyncResult<()>> {
        Self::unavailable("offline-delete-session")
    }

    fn delete_message<'a>(
        &'a self,
        _session_id: &'a SessionId,
        _message_id: MessageId,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Self::unavailable("offline-delete-message")
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;
    use crate::SyncError;

    /// Answers a single request with a canned response and closes.
    fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = [0_u8; 4096];
            let _ = stream.read(&mut request);
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        });
        format!("http://{address}")
    }

    fn client(base_url: String) -> HttpSessionSync {
        HttpSessionSync::new(SyncConfig::new(base_url, "token").with_timeout(Duration::from_secs(5)))
            .unwrap()
    }

    #[test]
    fn config_trims_trailing_slash_and_token_whitespace() {
        let config = SyncConfig::new(" https://sync.example/api/ ", " secret \n");
        assert_eq!(config.base_url, "https://sync.example/api");
        assert_eq!(config.bearer_token, "secret");
    }

    #[tokio::test]
    async fn missing_session_maps_to_not_found() {
        let sync = client(serve_once("404 Not Found", "{}"));
        let session_id = SessionId::parse("gone").unwrap();

        let error = sync.fetch_history(&session_id).await.unwrap_err();
        assert!(error.is_not_found(), "{error}");
    }

    #[tokio::test]
    async fn other_failures_keep_status_and_body() {
        let sync = client(serve_once("500 Internal Server Error", "boom"));
        let session_id = SessionId::parse("s1").unwrap();

        let error = sync.delete_session(&session_id).await.unwrap_err();
        match error {
            SyncError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected status error, got {other}"),
        }
    }

    #[tokio::test]
    async fn wrapped_and_bare_payloads_both_decode() {
        let sync = client(serve_once(
            "200 OK",
            r#"{"sessions":[{"id":"s1","title":"Trip","lastModified":5}]}"#,
        ));
        let sessions = sync.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "Trip");

        let sync = client(serve_once(
            "200 OK",
            r#"[{"id":7,"role":"user","content":"hi","timestamp":7}]"#,
        ));
        let session_id = SessionId::parse("s1").unwrap();
        let history = sync.fetch_history(&session_id).await.unwrap();
        assert_eq!(history[0].id, MessageId::new(7));
    }

    #[tokio::test]
    async fn offline_sync_reports_not_configured() {
        let session_id = SessionId::parse("s1").unwrap();
        let error = OfflineSync.fetch_history(&session_id).await.unwrap_err();
        assert!(matches!(error, SyncError::NotConfigured { .. }));
        assert!(!error.is_not_found());
    }
}
