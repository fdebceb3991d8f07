use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::SharedServiceState;

/// In-memory tenant state: services plus the reverse indexes that let a
/// reservation or booking id find its service without a scan.
pub struct InMemoryStore {
    services: DashMap<Ulid, SharedServiceState>,
    reservation_to_service: DashMap<Ulid, Ulid>,
    /// booking id → linked reservation ids (one per cart line).
    bookings: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            reservation_to_service: DashMap::new(),
            bookings: DashMap::new(),
        }
    }

    // ── Services ─────────────────────────────────────────────

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn contains_service(&self, id: &Ulid) -> bool {
        self.services.contains_key(id)
    }

    pub fn get_service(&self, id: &Ulid) -> Option<SharedServiceState> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn insert_service(&self, id: Ulid, state: SharedServiceState) {
        self.services.insert(id, state);
    }

    /// Insert unless another registration won the race. Returns whether it inserted.
    pub fn insert_service_if_absent(&self, id: Ulid, state: SharedServiceState) -> bool {
        match self.services.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
        }
    }

    pub fn remove_service(&self, id: &Ulid) -> Option<SharedServiceState> {
        self.services.remove(id).map(|(_, s)| s)
    }

    pub fn service_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.services.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Reservation index ────────────────────────────────────

    pub fn service_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_service
            .get(reservation_id)
            .map(|e| *e.value())
    }

    pub fn contains_reservation(&self, reservation_id: &Ulid) -> bool {
        self.reservation_to_service.contains_key(reservation_id)
    }

    /// Reserve an id for a create in flight. Returns false when it is taken,
    /// whether by a live reservation or another in-flight create.
    pub fn claim_reservation_id(&self, reservation_id: Ulid, service_id: Ulid) -> bool {
        match self.reservation_to_service.entry(reservation_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(service_id);
                true
            }
        }
    }

    /// Undo a claim whose create never made it into the log.
    pub fn release_reservation_id(&self, reservation_id: &Ulid, service_id: &Ulid) {
        self.reservation_to_service
            .remove_if(reservation_id, |_, sid| sid == service_id);
    }

    // ── Booking index ────────────────────────────────────────

    pub fn reservations_for_booking(&self, booking_id: &Ulid) -> Vec<Ulid> {
        self.bookings
            .get(booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn link_booking(&self, booking_id: Ulid, reservation_id: Ulid) {
        let mut ids = self.bookings.entry(booking_id).or_default();
        if !ids.contains(&reservation_id) {
            ids.push(reservation_id);
        }
    }

    fn unlink_booking(&self, booking_id: &Ulid, reservation_id: &Ulid) {
        let now_empty = match self.bookings.get_mut(booking_id) {
            Some(mut ids) => {
                ids.retain(|r| r != reservation_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.bookings.remove(booking_id);
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a reservation-level event to its service. Service registration and
    /// removal are handled at the map level by the engine.
    pub fn apply_event(&self, ss: &mut ServiceState, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                self.reservation_to_service
                    .insert(reservation.id, reservation.service_id);
                if let Some(bid) = reservation.booking_id {
                    self.link_booking(bid, reservation.id);
                }
                ss.insert(reservation.clone());
            }
            Event::ReservationUpdated {
                id,
                span,
                quantity,
                notes,
                at,
                ..
            } => {
                // Start may move, so re-insert to keep the sort order.
                if let Some(mut r) = ss.remove(*id) {
                    r.span = *span;
                    r.quantity = *quantity;
                    r.notes = notes.clone();
                    r.updated_at = *at;
                    ss.insert(r);
                }
            }
            Event::StatusChanged { id, status, at, .. } => {
                if let Some(r) = ss.get_mut(*id) {
                    r.status = *status;
                    r.updated_at = *at;
                }
            }
            Event::BookingConfirmed {
                id,
                booking_id,
                at,
                ..
            } => {
                if let Some(r) = ss.get_mut(*id) {
                    r.status = ReservationStatus::Confirmed;
                    if r.kind == ReservationType::SoftHold {
                        r.kind = ReservationType::Booking;
                    }
                    r.expires_at = None;
                    r.updated_at = *at;
                    if r.booking_id.is_none() {
                        r.booking_id = *booking_id;
                        if let Some(bid) = booking_id {
                            self.link_booking(*bid, *id);
                        }
                    }
                }
            }
            Event::ServiceRegistered { config } => {
                ss.config = config.clone();
            }
            Event::ServiceRemoved { .. } => {}
        }
    }

    /// Drop every index entry of a service that is going away.
    pub fn forget_service(&self, ss: &ServiceState) {
        for r in &ss.reservations {
            self.forget_reservation(r);
        }
    }

    /// Remove a terminal reservation from memory entirely.
    pub fn purge(&self, ss: &mut ServiceState, id: Ulid) -> Option<Reservation> {
        let r = ss.remove(id)?;
        self.forget_reservation(&r);
        Some(r)
    }

    fn forget_reservation(&self, r: &Reservation) {
        self.reservation_to_service.remove(&r.id);
        if let Some(bid) = r.booking_id {
            self.unlink_booking(&bid, &r.id);
        }
    }
}
