// =============================================================================
// CHANGE FEED
// =============================================================================
// Push notifications for committed changes to shared capacity state.
//
// Services publish after their store call succeeds. Subscribers (the
// occupancy cache) refresh themselves from these events; the domain logic
// never waits on delivery, so a feed with no subscribers is fine.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    BedChanged { bed_id: Uuid, department_id: Uuid },
    DepartmentChanged { department_id: Uuid },
    PatientChanged { patient_id: String },
    LedgerChanged { department_id: Uuid },
}

impl ChangeEvent {
    /// Department whose occupancy summary this event may have changed
    pub fn department_id(&self) -> Option<Uuid> {
        match self {
            ChangeEvent::BedChanged { department_id, .. }
            | ChangeEvent::DepartmentChanged { department_id }
            | ChangeEvent::LedgerChanged { department_id } => Some(*department_id),
            ChangeEvent::PatientChanged { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ChangeEvent) {
        // Err only means nobody is listening
        if self.sender.send(event).is_err() {
            tracing::trace!("Change event dropped, no subscribers");
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let feed = ChangeFeed::new(8);
        let mut rx = feed.subscribe();
        let department_id = Uuid::new_v4();

        feed.publish(ChangeEvent::DepartmentChanged { department_id });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.department_id(), Some(department_id));
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let feed = ChangeFeed::default();
        feed.publish(ChangeEvent::PatientChanged {
            patient_id: "PT-20261019-0001".into(),
        });
    }
}
