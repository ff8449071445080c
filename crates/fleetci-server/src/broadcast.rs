//! Client event fan-out over a tokio broadcast channel.

use fleetci_core::event::{Broadcaster, Event};
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events buffered per slow client before it lags.
pub const DEFAULT_CAPACITY: usize = 1024;

/// An event plus the project it is scoped to. `None` reaches every client.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub project_id: Option<String>,
    pub event: Event,
}

impl Envelope {
    /// Whether a client subscribed to `projects` should see this event.
    /// An empty subscription set receives everything.
    pub fn visible_to(&self, projects: &HashSet<String>) -> bool {
        match &self.project_id {
            None => true,
            Some(_) if projects.is_empty() => true,
            Some(project) => projects.contains(project),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<Envelope>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, envelope: Envelope) {
        // No subscribers is not an error.
        if self.tx.send(envelope).is_err() {
            trace!("No clients connected, event dropped");
        }
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast_to_project(&self, project_id: &str, event: Event) {
        self.publish(Envelope {
            project_id: Some(project_id.to_string()),
            event,
        });
    }

    fn broadcast_to_clients(&self, event: Event) {
        self.publish(Envelope {
            project_id: None,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_project_scoping() {
        let broadcaster = ChannelBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast_to_project(
            "alpha",
            Event::CronNoConnectedNodes {
                project_id: "alpha".into(),
                cron_job_id: "cron_alpha_n".into(),
                cron_node_id: "n".into(),
            },
        );
        broadcaster.broadcast_to_clients(Event::ServerShutdown {
            reason: "bye".into(),
        });

        let scoped = rx.recv().await.unwrap();
        let global = rx.recv().await.unwrap();
        assert_eq!(scoped.project_id.as_deref(), Some("alpha"));
        assert!(global.project_id.is_none());

        let beta: HashSet<String> = ["beta".to_string()].into_iter().collect();
        assert!(!scoped.visible_to(&beta));
        assert!(global.visible_to(&beta));
        assert!(scoped.visible_to(&HashSet::new()));
    }

    #[test]
    fn test_publish_without_clients() {
        let broadcaster = ChannelBroadcaster::default();
        assert_eq!(broadcaster.client_count(), 0);
        broadcaster.broadcast_to_clients(Event::ServerShutdown {
            reason: "nobody listening".into(),
        });
    }
}
