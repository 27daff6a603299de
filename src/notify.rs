use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-instructor broadcast of committed events. Email and WhatsApp senders
/// subscribe here to learn about new and cancelled bookings.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to an instructor's events. Creates the channel if needed.
    pub fn subscribe(&self, instructor_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(instructor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, instructor_id: Ulid, event: &Event) {
        let Some(sender) = self.channels.get(&instructor_id) else {
            return;
        };
        if let Ok(receivers) = sender.send(event.clone()) {
            tracing::debug!(
                instructor = %instructor_id,
                receivers,
                payload = %payload(event),
                "notification published"
            );
        }
    }

    /// Drop the channel, e.g. when the instructor is removed.
    pub fn remove(&self, instructor_id: &Ulid) {
        self.channels.remove(instructor_id);
    }
}

/// JSON body handed to notification senders.
fn payload(event: &Event) -> String {
    let detail = match event {
        Event::BookingCreated { booking } => json!({
            "booking_id": booking.id.to_string(),
            "student_id": booking.student_id.to_string(),
            "start": booking.span.start.to_string(),
            "end": booking.span.end.to_string(),
            "status": booking.status.as_str(),
        }),
        Event::BookingStatusChanged { id, status, .. } => json!({
            "booking_id": id.to_string(),
            "status": status.as_str(),
        }),
        _ => serde_json::Value::Null,
    };
    json!({
        "kind": event.kind(),
        "instructor_id": event.instructor_id().to_string(),
        "detail": detail,
    })
    .to_string()
}
