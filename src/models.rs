//! Shared domain types and configuration for the chat channel client.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Message authorship within one transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Me,
    Them,
}

/// One transcript entry. Append-only: never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique within one application binding, strictly increasing.
    pub id: u64,
    pub text: String,
    pub sender: Sender,
}

/// Server-side lifecycle state of a chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    /// Terminal: no live connection is attempted for a closed session.
    Closed,
}

/// Chat session descriptor, fetched once at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub application_id: u64,
    pub state: SessionState,
    pub session_id: Option<i64>,
    /// Optional token appended to the socket URL as `?token=`.
    pub auth_token: Option<String>,
}

impl ChatSession {
    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }
}

const DEFAULT_API_BASE: &str = "http://localhost:8001";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// REST base URL for session-state and history fetches.
    pub api_base_url: String,
    /// WebSocket base URL. Defaults to `api_base_url` with the scheme
    /// swapped to ws/wss.
    pub ws_base_url: String,

    // Reconnection
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    // Timeouts
    pub connect_timeout_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE.to_string(),
            ws_base_url: ws_base_from_api(DEFAULT_API_BASE),
            max_reconnect_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 15_000,
            connect_timeout_ms: 10_000,
            http_timeout_secs: 30,
        }
    }
}

impl ChatConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Ok(v) = std::env::var("API_BASE_URL") {
            config.ws_base_url = ws_base_from_api(&v);
            config.api_base_url = v;
        }
        if let Ok(v) = std::env::var("WS_BASE_URL") {
            config.ws_base_url = v;
        }
        if let Ok(v) = std::env::var("CHAT_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v.parse().unwrap_or(config.max_reconnect_attempts);
        }
        if let Ok(v) = std::env::var("CHAT_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v.parse().unwrap_or(config.backoff_base_ms);
        }
        if let Ok(v) = std::env::var("CHAT_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v.parse().unwrap_or(config.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("CHAT_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = v.parse().unwrap_or(config.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = v.parse().unwrap_or(config.http_timeout_secs);
        }

        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Derive the socket base URL from the REST base URL (http -> ws, https -> wss).
pub fn ws_base_from_api(api_base: &str) -> String {
    if let Some(rest) = api_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_base_from_api() {
        assert_eq!(ws_base_from_api("http://localhost:8001"), "ws://localhost:8001");
        assert_eq!(ws_base_from_api("https://api.example.com"), "wss://api.example.com");
        // Already a socket URL: passed through untouched
        assert_eq!(ws_base_from_api("ws://localhost:8001"), "ws://localhost:8001");
    }

    #[test]
    fn test_sender_wire_names() {
        assert_eq!(serde_json::to_string(&Sender::Me).unwrap(), "\"me\"");
        assert_eq!(serde_json::to_string(&Sender::Them).unwrap(), "\"them\"");
    }

    #[test]
    fn test_session_state_wire_names() {
        let open: SessionState = serde_json::from_str("\"open\"").unwrap();
        let closed: SessionState = serde_json::from_str("\"closed\"").unwrap();
        assert_eq!(open, SessionState::Open);
        assert_eq!(closed, SessionState::Closed);
    }

    #[test]
    fn test_default_config() {
        let config = ChatConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.ws_base_url, "ws://localhost:8001");
    }
}
