//! Event bridge
//!
//! Translates lifecycle events into status publications:
//!
//! ```text
//!            publish "started"
//!                   │
//!                   ▼
//!   ┌────────► Polling ── poll error ──► (fatal, returned)
//!   │               │
//!   │  INVOKE: publish "invoked"
//!   │  other:  log and ignore
//!   └───────────────┤
//!                   │ SHUTDOWN: publish "shutting down"
//!                   ▼
//!               Terminated
//! ```
//!
//! Publication failures are logged and swallowed so the host's event queue
//! keeps draining. Poll failures end the loop with an error.

use crate::client::BrokerClient;
use crate::config::StatusMessages;
use crate::error::Result;
use crate::lifecycle::{EventKind, ExtensionSession, LifecycleClient, LifecycleEvent};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Source of lifecycle events
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Block until the next event is available.
    async fn next_event(&self, session: &ExtensionSession) -> Result<LifecycleEvent>;
}

/// Sink for status messages
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

#[async_trait]
impl EventSource for LifecycleClient {
    async fn next_event(&self, session: &ExtensionSession) -> Result<LifecycleEvent> {
        LifecycleClient::next_event(self, session).await
    }
}

#[async_trait]
impl Publisher for BrokerClient {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        BrokerClient::publish(self, topic, payload).await
    }
}

/// Bridge state; `Terminated` is final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Polling,
    Terminated,
}

/// Counters kept by a bridge run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub events: u64,
    pub invocations: u64,
    pub unknown_events: u64,
    pub published: u64,
    pub publish_failures: u64,
}

pub struct EventBridge<S, P> {
    source: S,
    publisher: P,
    topic: String,
    messages: StatusMessages,
    state: BridgeState,
    stats: BridgeStats,
}

impl<S: EventSource, P: Publisher> EventBridge<S, P> {
    pub fn new(source: S, publisher: P, topic: impl Into<String>, messages: StatusMessages) -> Self {
        Self {
            source,
            publisher,
            topic: topic.into(),
            messages,
            state: BridgeState::Polling,
            stats: BridgeStats::default(),
        }
    }

    /// Publish the start status, then poll until SHUTDOWN.
    ///
    /// Returns `Ok` only after the SHUTDOWN event has been handled. Any poll
    /// failure is returned unchanged; the bridge does not retry.
    pub async fn run(&mut self, session: &ExtensionSession) -> Result<BridgeStats> {
        let started = self.messages.started.clone();
        self.publish_status(&started).await;

        while self.state == BridgeState::Polling {
            let event = self.source.next_event(session).await?;
            self.handle(event).await;
        }

        info!(
            events = self.stats.events,
            invocations = self.stats.invocations,
            publish_failures = self.stats.publish_failures,
            "Event bridge terminated"
        );
        Ok(self.stats.clone())
    }

    async fn handle(&mut self, event: LifecycleEvent) {
        self.stats.events += 1;
        match event.kind {
            EventKind::Invoke => {
                self.stats.invocations += 1;
                debug!(request_id = event.request_id.as_deref().unwrap_or(""), "Function invoked");
                let invoked = self.messages.invoked.clone();
                self.publish_status(&invoked).await;
            }
            EventKind::Shutdown => {
                info!(
                    reason = event.shutdown_reason.as_deref().unwrap_or(""),
                    "Received shutdown event"
                );
                let shutting_down = self.messages.shutting_down.clone();
                self.publish_status(&shutting_down).await;
                self.state = BridgeState::Terminated;
            }
            EventKind::Unknown(kind) => {
                self.stats.unknown_events += 1;
                warn!(event_type = %kind, "Received unknown event type");
            }
        }
    }

    async fn publish_status(&mut self, message: &str) {
        match self
            .publisher
            .publish(&self.topic, Bytes::copy_from_slice(message.as_bytes()))
            .await
        {
            Ok(()) => {
                self.stats.published += 1;
                debug!(topic = %self.topic, message, "Published status");
            }
            Err(e) => {
                self.stats.publish_failures += 1;
                warn!(topic = %self.topic, message, error = %e, "Failed to publish status");
            }
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtensionError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays a fixed script of poll results
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<LifecycleEvent>>>,
        polls: Arc<Mutex<u32>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<LifecycleEvent>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                polls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_event(&self, session: &ExtensionSession) -> Result<LifecycleEvent> {
            assert_eq!(session.id, "abc123");
            *self.polls.lock() += 1;
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| panic!("polled past the end of the script"))
        }
    }

    /// Records publications; fails the ones whose index is listed
    #[derive(Clone, Default)]
    struct RecordingPublisher {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        attempts: Arc<Mutex<usize>>,
        fail_on: Vec<usize>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                *attempts += 1;
                *attempts - 1
            };
            if self.fail_on.contains(&attempt) {
                return Err(ExtensionError::NotConnected);
            }
            self.sent.lock().push((
                topic.to_string(),
                String::from_utf8(payload.to_vec()).unwrap(),
            ));
            Ok(())
        }
    }

    fn session() -> ExtensionSession {
        ExtensionSession {
            id: "abc123".to_string(),
        }
    }

    fn event(kind: EventKind) -> Result<LifecycleEvent> {
        Ok(LifecycleEvent::of(kind))
    }

    fn payloads(publisher: &RecordingPublisher) -> Vec<String> {
        publisher.sent.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    #[tokio::test]
    async fn test_invoke_invoke_shutdown() {
        let publisher = RecordingPublisher::default();
        let source = ScriptedSource::new(vec![
            event(EventKind::Invoke),
            event(EventKind::Invoke),
            event(EventKind::Shutdown),
        ]);
        let mut bridge =
            EventBridge::new(source, publisher.clone(), "lambda", StatusMessages::default());

        let stats = bridge.run(&session()).await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Terminated);
        assert_eq!(
            payloads(&publisher),
            vec![
                "Extension started",
                "Function invoked",
                "Function invoked",
                "Extension shutting down"
            ]
        );
        assert!(publisher.sent.lock().iter().all(|(t, _)| t == "lambda"));
        assert_eq!(stats.events, 3);
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.published, 4);
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let publisher = RecordingPublisher::default();
        let source = ScriptedSource::new(vec![
            event(EventKind::Unknown("UNKNOWN".to_string())),
            event(EventKind::Unknown(String::new())),
            event(EventKind::Shutdown),
        ]);
        let mut bridge =
            EventBridge::new(source, publisher.clone(), "lambda", StatusMessages::default());

        let stats = bridge.run(&session()).await.unwrap();
        assert_eq!(
            payloads(&publisher),
            vec!["Extension started", "Extension shutting down"]
        );
        assert_eq!(stats.unknown_events, 2);
    }

    #[tokio::test]
    async fn test_poll_error_is_fatal_and_stops_polling() {
        let publisher = RecordingPublisher::default();
        let source = ScriptedSource::new(vec![
            event(EventKind::Invoke),
            Err(ExtensionError::lifecycle_status("next event", 500, "")),
            event(EventKind::Shutdown),
        ]);
        let polls = source.polls.clone();
        let mut bridge =
            EventBridge::new(source, publisher.clone(), "lambda", StatusMessages::default());

        let err = bridge.run(&session()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
        assert_eq!(*polls.lock(), 2);
        assert_eq!(bridge.state(), BridgeState::Polling);
        assert_eq!(
            payloads(&publisher),
            vec!["Extension started", "Function invoked"]
        );
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_the_loop() {
        let publisher = RecordingPublisher {
            fail_on: vec![0, 2],
            ..Default::default()
        };
        let source = ScriptedSource::new(vec![
            event(EventKind::Invoke),
            event(EventKind::Invoke),
            event(EventKind::Shutdown),
        ]);
        let mut bridge =
            EventBridge::new(source, publisher.clone(), "lambda", StatusMessages::default());

        let stats = bridge.run(&session()).await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Terminated);
        assert_eq!(stats.publish_failures, 2);
        assert_eq!(
            payloads(&publisher),
            vec!["Function invoked", "Extension shutting down"]
        );
    }
}
