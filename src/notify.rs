use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, ReservationStatus};

/// Changes buffered per subscriber before it starts lagging.
pub const DEFAULT_FEED_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    ServiceUpdated,
    ServiceRemoved,
    ReservationCreated,
    ReservationUpdated,
    StatusChanged,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::ServiceUpdated => "serviceUpdated",
            ChangeKind::ServiceRemoved => "serviceRemoved",
            ChangeKind::ReservationCreated => "reservationCreated",
            ChangeKind::ReservationUpdated => "reservationUpdated",
            ChangeKind::StatusChanged => "statusChanged",
        }
    }
}

/// What a watcher of one service learns about an applied event. Deliberately
/// thin: subscribers refetch whatever they display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub service_id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
}

impl From<&Event> for Change {
    fn from(event: &Event) -> Self {
        let (kind, reservation_id, status) = match event {
            Event::ServiceRegistered { .. } => (ChangeKind::ServiceUpdated, None, None),
            Event::ServiceRemoved { .. } => (ChangeKind::ServiceRemoved, None, None),
            Event::ReservationCreated { reservation } => (
                ChangeKind::ReservationCreated,
                Some(reservation.id),
                Some(reservation.status),
            ),
            Event::ReservationUpdated { id, .. } => (ChangeKind::ReservationUpdated, Some(*id), None),
            Event::StatusChanged { id, status, .. } => {
                (ChangeKind::StatusChanged, Some(*id), Some(*status))
            }
            Event::BookingConfirmed { id, .. } => (
                ChangeKind::StatusChanged,
                Some(*id),
                Some(ReservationStatus::Confirmed),
            ),
        };
        Self {
            kind,
            service_id: event.service_id(),
            reservation_id,
            status,
        }
    }
}

/// Per-service change feeds.
///
/// A feed exists only while someone watches it: publishing to a feed whose
/// last subscriber left drops it, and removing a service closes its feed
/// after the removal itself has been delivered.
pub struct NotifyHub {
    feeds: DashMap<Ulid, broadcast::Sender<Change>>,
    buffer: usize,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_FEED_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            feeds: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, service_id: Ulid) -> broadcast::Receiver<Change> {
        self.feeds
            .entry(service_id)
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }

    /// Live subscribers of one service.
    pub fn watchers(&self, service_id: &Ulid) -> usize {
        self.feeds
            .get(service_id)
            .map_or(0, |feed| feed.receiver_count())
    }

    /// Fan an applied event out to its service's watchers.
    pub fn publish(&self, event: &Event) {
        let change = Change::from(event);
        let service_id = change.service_id;
        let kind = change.kind;

        let delivered = match self.feeds.get(&service_id) {
            Some(feed) => feed.send(change).is_ok(),
            None => return,
        };
        if kind == ChangeKind::ServiceRemoved {
            self.feeds.remove(&service_id);
        } else if !delivered {
            self.feeds
                .remove_if(&service_id, |_, feed| feed.receiver_count() == 0);
        }
    }
}
