//! Client for the host lifecycle (extensions) API
//!
//! Two calls are used: one registration that returns the session identifier,
//! and a long-poll for the next lifecycle event. Both are single-shot: any
//! transport failure, non-200 status, or undecodable body is returned as an
//! error and the caller treats it as fatal.
//!
//! The HTTP client has no request timeout. The host holds the poll open until
//! an event is ready, for as long as the function stays idle.

use crate::config::ExtensionConfig;
use crate::error::{ExtensionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Header carrying the extension name at registration
pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";

/// Header carrying the session identifier
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Lifecycle event kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Invoke,
    Shutdown,
    /// Anything else, including an empty or missing kind
    Unknown(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Invoke => "INVOKE",
            EventKind::Shutdown => "SHUTDOWN",
            EventKind::Unknown(kind) => kind,
        }
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "INVOKE" => EventKind::Invoke,
            "SHUTDOWN" => EventKind::Shutdown,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub request_id: Option<String>,
    pub deadline_ms: Option<u64>,
    pub invoked_function_arn: Option<String>,
    pub shutdown_reason: Option<String>,
}

impl LifecycleEvent {
    /// An event with no details besides its kind
    pub fn of(kind: EventKind) -> Self {
        Self {
            kind,
            request_id: None,
            deadline_ms: None,
            invoked_function_arn: None,
            shutdown_reason: None,
        }
    }
}

/// Body of the poll response. Fields this process does not use are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub invoked_function_arn: Option<String>,
    #[serde(default)]
    pub shutdown_reason: Option<String>,
}

impl From<NextEventResponse> for LifecycleEvent {
    fn from(response: NextEventResponse) -> Self {
        Self {
            kind: EventKind::from(response.event_type.as_str()),
            request_id: response.request_id,
            deadline_ms: response.deadline_ms,
            invoked_function_arn: response.invoked_function_arn,
            shutdown_reason: response.shutdown_reason,
        }
    }
}

/// Registration request body
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub events: Vec<String>,
}

/// Registration response body, decoded leniently for logging
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub function_version: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
}

/// Result of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSession {
    pub id: String,
}

/// HTTP client for the lifecycle API
#[derive(Debug, Clone)]
pub struct LifecycleClient {
    client: reqwest::Client,
    base_url: String,
    extension_name: String,
}

impl LifecycleClient {
    /// Create a client for `base_url` (e.g. `http://127.0.0.1:9001/2020-01-01/extension`).
    pub fn new(base_url: impl Into<String>, extension_name: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            ExtensionError::lifecycle("client", format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            extension_name: extension_name.into(),
        })
    }

    pub fn from_config(config: &ExtensionConfig) -> Result<Self> {
        Self::new(config.lifecycle_base_url(), config.extension_name.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register for `events` and return the session.
    pub async fn register(&self, events: &[EventKind]) -> Result<ExtensionSession> {
        let url = format!("{}/register", self.base_url);
        let request = RegisterRequest {
            events: events.iter().map(|e| e.as_str().to_string()).collect(),
        };

        let response = self
            .client
            .post(&url)
            .header(EXTENSION_NAME_HEADER, &self.extension_name)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExtensionError::lifecycle("register", e.to_string()))?;

        let status = response.status();
        let id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| ExtensionError::lifecycle("register", e.to_string()))?;

        if status.as_u16() != 200 {
            return Err(ExtensionError::lifecycle_status(
                "register",
                status.as_u16(),
                String::from_utf8_lossy(&body),
            ));
        }

        let id = id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ExtensionError::lifecycle_missing_header(EXTENSION_ID_HEADER))?;

        match serde_json::from_slice::<RegisterResponse>(&body) {
            Ok(details) => info!(
                extension = %self.extension_name,
                function = details.function_name.as_deref().unwrap_or(""),
                version = details.function_version.as_deref().unwrap_or(""),
                handler = details.handler.as_deref().unwrap_or(""),
                "Registered with lifecycle API"
            ),
            Err(_) => info!(extension = %self.extension_name, "Registered with lifecycle API"),
        }

        Ok(ExtensionSession { id })
    }

    /// Block until the host delivers the next lifecycle event.
    pub async fn next_event(&self, session: &ExtensionSession) -> Result<LifecycleEvent> {
        let url = format!("{}/event/next", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(EXTENSION_ID_HEADER, &session.id)
            .send()
            .await
            .map_err(|e| ExtensionError::lifecycle("next event", e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ExtensionError::lifecycle("next event", e.to_string()))?;

        if status.as_u16() != 200 {
            return Err(ExtensionError::lifecycle_status(
                "next event",
                status.as_u16(),
                String::from_utf8_lossy(&body),
            ));
        }

        let decoded: NextEventResponse = serde_json::from_slice(&body)
            .map_err(|e| ExtensionError::lifecycle_malformed("next event", e.to_string()))?;
        let event = LifecycleEvent::from(decoded);

        debug!(
            kind = %event.kind,
            request_id = event.request_id.as_deref().unwrap_or(""),
            deadline_ms = event.deadline_ms.unwrap_or_default(),
            shutdown_reason = event.shutdown_reason.as_deref().unwrap_or(""),
            "Received lifecycle event"
        );
        Ok(event)
    }
}
