use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, Ms, TenantId};

const CHANNEL_CAPACITY: usize = 256;
/// Channel count at which `subscribe` first sweeps out abandoned channels.
const PRUNE_AT: usize = 1024;

/// `booking-confirmed`: published once the booking is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename = "booking-confirmed")]
pub struct BookingConfirmed {
    pub booking_id: Ulid,
    pub tenant_id: TenantId,
    pub student_id: Ulid,
    pub instructor_id: Ulid,
    pub vehicle_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
}

impl BookingConfirmed {
    pub fn from_booking(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id,
            tenant_id: booking.tenant_id.clone(),
            student_id: booking.student_id,
            instructor_id: booking.instructor_id,
            vehicle_id: booking.vehicle_id,
            start: booking.span.start,
            end: booking.span.end,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Broadcast hub keyed by student or instructor id.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingConfirmed>>,
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

    /// Subscribe to confirmations involving `party`. Creates the channel if needed.
    pub fn subscribe(&self, party: Ulid) -> broadcast::Receiver<BookingConfirmed> {
        if self.channels.len() >= PRUNE_AT {
            self.prune();
        }
        let sender = self
            .channels
            .entry(party)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening; a channel whose
    /// receivers are all gone is dropped.
    pub fn send(&self, party: Ulid, event: &BookingConfirmed) {
        let delivered = match self.channels.get(&party) {
            Some(sender) => sender.send(event.clone()).is_ok(),
            None => return,
        };
        if !delivered {
            self.channels.remove_if(&party, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// Drop every channel nobody listens on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before.saturating_sub(self.channels.len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Fan out to the student's and the instructor's channels.
    pub fn booking_confirmed(&self, event: BookingConfirmed) {
        self.send(event.student_id, &event);
        self.send(event.instructor_id, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Span};

    fn booking() -> Booking {
        Booking {
            id: Ulid::new(),
            tenant_id: TenantId::new("school"),
            student_id: Ulid::new(),
            instructor_id: Ulid::new(),
            vehicle_id: Some(Ulid::new()),
            span: Span::new(3_600_000, 7_200_000),
            status: BookingStatus::Confirmed,
            credits_cost: 1,
            cancellation_reason: None,
            cancelled_at: None,
            completed_at: None,
            instructor_notes: None,
        }
    }

    #[tokio::test]
    async fn student_and_instructor_both_hear_it() {
        let hub = NotifyHub::new();
        let b = booking();
        let mut student_rx = hub.subscribe(b.student_id);
        let mut instructor_rx = hub.subscribe(b.instructor_id);

        hub.booking_confirmed(BookingConfirmed::from_booking(&b));

        assert_eq!(student_rx.recv().await.unwrap().booking_id, b.id);
        assert_eq!(instructor_rx.recv().await.unwrap().booking_id, b.id);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.booking_confirmed(BookingConfirmed::from_booking(&booking()));
    }

    #[test]
    fn json_payload() {
        let b = booking();
        let json: serde_json::Value =
            serde_json::from_str(&BookingConfirmed::from_booking(&b).to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "booking-confirmed");
        assert_eq!(json["booking_id"], b.id.to_string());
        assert_eq!(json["tenant_id"], "school");
        assert_eq!(json["vehicle_id"], b.vehicle_id.unwrap().to_string());
        assert_eq!(json["start"], 3_600_000);
    }

    #[tokio::test]
    async fn abandoned_channels_are_dropped() {
        let hub = NotifyHub::new();
        let b = booking();
        let student_rx = hub.subscribe(b.student_id);
        let mut instructor_rx = hub.subscribe(b.instructor_id);
        drop(student_rx);

        hub.booking_confirmed(BookingConfirmed::from_booking(&b));
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(instructor_rx.recv().await.unwrap().booking_id, b.id);

        drop(instructor_rx);
        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn subscribe_sweeps_once_the_map_is_large() {
        let hub = NotifyHub::new();
        for _ in 0..PRUNE_AT {
            drop(hub.subscribe(Ulid::new()));
        }
        assert_eq!(hub.channel_count(), PRUNE_AT);
        let _live = hub.subscribe(Ulid::new());
        assert_eq!(hub.channel_count(), 1);
    }
}
