//! Event bus for orchestration observers.
//!
//! Pub/sub messaging over a Tokio broadcast channel. Publishing is
//! fire-and-forget: no acknowledgement, and a missing or lagging subscriber
//! never affects the publisher.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::OrchestratorEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus backed by a broadcast channel.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. No receivers is fine.
    pub fn publish(&self, event: OrchestratorEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
pub struct EventFilter {
    /// Filter by project path
    pub project_path: Option<PathBuf>,
    /// Filter by feature ID
    pub feature_id: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self {
            project_path: None,
            feature_id: None,
            event_types: None,
        }
    }

    /// Filter by project path
    pub fn project(mut self, project_path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(project_path.into());
        self
    }

    /// Filter by feature ID
    pub fn feature(mut self, feature_id: &str) -> Self {
        self.feature_id = Some(feature_id.to_string());
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &OrchestratorEvent) -> bool {
        if let Some(ref project) = self.project_path {
            if event.project_path() != project {
                return false;
            }
        }

        if let Some(ref fid) = self.feature_id {
            match event.feature_id() {
                Some(event_fid) if event_fid == fid => {}
                _ => return false,
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<OrchestratorEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<OrchestratorEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<OrchestratorEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::error::FailureKind;

    fn started(project: &str, feature: &str) -> OrchestratorEvent {
        OrchestratorEvent::FeatureStarted {
            project_path: PathBuf::from(project),
            feature_id: feature.to_string(),
            auto_mode: true,
            worktree_path: None,
            branch_name: None,
            model: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(started("/proj", "f1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "feature_started");
        assert_eq!(received.feature_id(), Some("f1"));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert!(!bus.has_subscribers());
        bus.publish(started("/proj", "f1"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(started("/proj", "f1"));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event_type(), e2.event_type());
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::new()
            .project("/proj")
            .types(vec!["feature_started", "feature_failed"]);

        assert!(filter.matches(&started("/proj", "f1")));
        assert!(!filter.matches(&started("/other", "f1")));

        let completed = OrchestratorEvent::FeatureCompleted {
            project_path: PathBuf::from("/proj"),
            feature_id: "f1".to_string(),
            passes: true,
            summary: None,
            learnings: None,
            timestamp: Utc::now(),
        };
        assert!(!filter.matches(&completed));

        // Loop-level events never match a feature filter.
        let feature_filter = EventFilter::new().feature("f1");
        let idle = OrchestratorEvent::AutoLoopIdle {
            project_path: PathBuf::from("/proj"),
            branch_name: None,
            timestamp: Utc::now(),
        };
        assert!(!feature_filter.matches(&idle));
        assert!(feature_filter.matches(&started("/proj", "f1")));
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new();
        let mut filtered = bus.subscribe_filtered(EventFilter::new().feature("target"));

        bus.publish(started("/proj", "other"));
        bus.publish(OrchestratorEvent::FeatureFailed {
            project_path: PathBuf::from("/proj"),
            feature_id: "target".to_string(),
            kind: FailureKind::AgentError,
            message: "exit 1".to_string(),
            timestamp: Utc::now(),
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.feature_id(), Some("target"));
        assert_eq!(event.event_type(), "feature_failed");
    }
}
