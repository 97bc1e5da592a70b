use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-therapist change feed. Calendar views subscribe to the therapists on
/// screen and refresh when an accepted mutation lands.
pub struct ScheduleHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for ScheduleHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes on a therapist's calendar. Creates the channel if needed.
    pub fn subscribe(&self, therapist_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(therapist_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send to one therapist's subscribers. No-op if nobody is listening.
    pub fn send(&self, therapist_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&therapist_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Route an event to every therapist it touches.
    pub fn publish(&self, event: &Event) {
        for therapist_id in event.therapist_ids() {
            self.send(therapist_id, event);
        }
    }

    /// Drop a therapist's channel, e.g. when they leave the salon.
    pub fn remove(&self, therapist_id: &Ulid) {
        self.channels.remove(therapist_id);
    }
}
