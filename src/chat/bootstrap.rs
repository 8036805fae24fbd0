//! Bootstrap: the HTTP-only phase preceding any socket work.
//!
//! Loads the chat session state and the persisted message history for one
//! application. Both fetches resolve (success or failure) before a socket is
//! dialed, which is what keeps historical and streamed message ids from
//! colliding. Failures degrade soft: a session fetch error reports an open
//! session so a transient outage never blocks the channel, and a history
//! fetch error yields an empty seed (the live stream is authoritative from
//! then on).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::{ChatSession, Sender, SessionState};

/// Session-state response from the applications service.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStateResponse {
    pub state: SessionState,
    #[serde(default)]
    pub exists: bool,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<i64>,
}

/// One persisted history entry. Presence of `userId` marks the candidate's
/// own messages; everything else came from the counterpart.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub body: String,
    #[serde(rename = "userId", default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn sender(&self) -> Sender {
        if self.user_id.is_some() {
            Sender::Me
        } else {
            Sender::Them
        }
    }
}

/// Transport seam so the channel can be bootstrapped against test doubles.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn fetch_session(&self, application_id: u64) -> Result<SessionStateResponse>;
    async fn fetch_history(&self, application_id: u64) -> Result<Vec<HistoryEntry>>;
}

/// REST implementation of [`SessionApi`].
#[derive(Clone)]
pub struct HttpSessionApi {
    client: Client,
    base_url: String,
}

impl HttpSessionApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .context("Failed to build chat HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn fetch_session(&self, application_id: u64) -> Result<SessionStateResponse> {
        let url = self.url(&format!("/applications/{application_id}/session"));
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("GET session state failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET session state {}: {}", status, text));
        }

        resp.json::<SessionStateResponse>()
            .await
            .context("Failed to parse session state response")
    }

    async fn fetch_history(&self, application_id: u64) -> Result<Vec<HistoryEntry>> {
        let url = self.url(&format!("/applications/{application_id}/messages"));
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("GET message history failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET message history {}: {}", status, text));
        }

        resp.json::<Vec<HistoryEntry>>()
            .await
            .context("Failed to parse message history response")
    }
}

/// Result of one bootstrap pass. Always produced, whatever the transport did.
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub session: ChatSession,
    pub history: Vec<HistoryEntry>,
}

/// Runs the two preflight fetches for one application binding.
pub struct SessionBootstrapper<A: SessionApi + ?Sized> {
    api: std::sync::Arc<A>,
}

impl<A: SessionApi + ?Sized> SessionBootstrapper<A> {
    pub fn new(api: std::sync::Arc<A>) -> Self {
        Self { api }
    }

    /// Load session state and history. Never fails: both calls degrade soft.
    pub async fn load(&self, application_id: u64, auth_token: Option<String>) -> BootstrapOutcome {
        let session = match self.api.fetch_session(application_id).await {
            Ok(resp) => {
                debug!(
                    application_id,
                    state = ?resp.state,
                    exists = resp.exists,
                    "chat session state loaded"
                );
                ChatSession {
                    application_id,
                    state: resp.state,
                    session_id: resp.session_id,
                    auth_token,
                }
            }
            Err(e) => {
                // Optimistic availability: a transient outage must not lock
                // the candidate out of the channel.
                warn!(application_id, error = %e, "session state fetch failed; assuming open");
                ChatSession {
                    application_id,
                    state: SessionState::Open,
                    session_id: None,
                    auth_token,
                }
            }
        };

        let history = match self.api.fetch_history(application_id).await {
            Ok(entries) => {
                debug!(application_id, count = entries.len(), "message history loaded");
                entries
            }
            Err(e) => {
                warn!(application_id, error = %e, "history fetch failed; starting with empty transcript");
                Vec::new()
            }
        };

        BootstrapOutcome { session, history }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StubApi {
        session: Result<SessionStateResponse, String>,
        history: Result<Vec<HistoryEntry>, String>,
    }

    #[async_trait]
    impl SessionApi for StubApi {
        async fn fetch_session(&self, _application_id: u64) -> Result<SessionStateResponse> {
            self.session
                .clone()
                .map_err(|e| anyhow::anyhow!(e))
        }

        async fn fetch_history(&self, _application_id: u64) -> Result<Vec<HistoryEntry>> {
            self.history
                .clone()
                .map_err(|e| anyhow::anyhow!(e))
        }
    }

    #[tokio::test]
    async fn test_bootstrap_happy_path() {
        let api = Arc::new(StubApi {
            session: Ok(SessionStateResponse {
                state: SessionState::Open,
                exists: true,
                session_id: Some(7),
            }),
            history: Ok(vec![HistoryEntry {
                body: "Hi".to_string(),
                user_id: Some(1),
                created_at: None,
            }]),
        });

        let outcome = SessionBootstrapper::new(api).load(42, None).await;
        assert_eq!(outcome.session.state, SessionState::Open);
        assert_eq!(outcome.session.session_id, Some(7));
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.history[0].sender(), Sender::Me);
    }

    #[tokio::test]
    async fn test_bootstrap_fails_soft_to_open_and_empty() {
        let api = Arc::new(StubApi {
            session: Err("connection refused".to_string()),
            history: Err("connection refused".to_string()),
        });

        let outcome = SessionBootstrapper::new(api).load(42, None).await;
        assert_eq!(outcome.session.state, SessionState::Open);
        assert_eq!(outcome.session.session_id, None);
        assert!(outcome.history.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_reports_closed_session() {
        let api = Arc::new(StubApi {
            session: Ok(SessionStateResponse {
                state: SessionState::Closed,
                exists: true,
                session_id: Some(3),
            }),
            history: Ok(Vec::new()),
        });

        let outcome = SessionBootstrapper::new(api).load(42, None).await;
        assert!(outcome.session.is_closed());
    }

    #[test]
    fn test_history_entry_sender_mapping() {
        let mine = HistoryEntry {
            body: "Hi".to_string(),
            user_id: Some(9),
            created_at: None,
        };
        let theirs = HistoryEntry {
            body: "Hello".to_string(),
            user_id: None,
            created_at: None,
        };
        assert_eq!(mine.sender(), Sender::Me);
        assert_eq!(theirs.sender(), Sender::Them);
    }

    #[test]
    fn test_history_entry_wire_shape() {
        let entries: Vec<HistoryEntry> = serde_json::from_str(
            r#"[{"body":"Hi","userId":1,"created_at":"2025-03-01T12:00:00Z"},{"body":"Hello"}]"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sender(), Sender::Me);
        assert!(entries[0].created_at.is_some());
        assert_eq!(entries[1].sender(), Sender::Them);
        assert!(entries[1].created_at.is_none());
    }
}
