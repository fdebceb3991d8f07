use std::collections::HashMap;

use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_RESERVATIONS_PER_BOOKING;
use crate::model::*;

use super::conflict::{check_capacity, now_ms};
use super::mutations::NewReservation;
use super::{Engine, EngineError};

/// Checkout hold request. The hold expires `ttl_ms` after it is placed.
#[derive(Debug, Clone)]
pub struct SoftHoldRequest {
    pub service_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub quantity: u32,
    pub ttl_ms: Ms,
    pub booking_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub notes: Option<String>,
}

/// A pending reservation that no longer holds capacity (a lapsed soft hold)
/// must win its capacity back before it can be confirmed.
///
/// `extra` are siblings revived earlier in the same confirmation.
pub(super) fn revalidate_lapsed(
    ss: &ServiceState,
    r: &Reservation,
    now: Ms,
    extra: &[Reservation],
) -> Result<(), EngineError> {
    if r.holds_capacity(now) {
        return Ok(());
    }
    check_capacity(ss, r.kind, &r.span, r.quantity, now, Some(r.id), extra)
}

/// Reached from Confirmed, so a retried confirm has nothing left to do.
fn is_past_confirmation(status: ReservationStatus) -> bool {
    matches!(
        status,
        ReservationStatus::Confirmed
            | ReservationStatus::InUse
            | ReservationStatus::Completed
            | ReservationStatus::NoShow
    )
}

impl Engine {
    pub async fn place_soft_hold(&self, req: SoftHoldRequest) -> Result<Reservation, EngineError> {
        if req.ttl_ms <= 0 {
            return Err(EngineError::InvalidRange {
                span: Span {
                    start: req.start,
                    end: req.end,
                },
                reason: "hold ttl must be positive",
            });
        }
        let mut new = NewReservation::new(
            req.service_id,
            req.start,
            req.end,
            req.quantity,
            ReservationType::SoftHold,
        );
        new.expires_at = Some(now_ms().saturating_add(req.ttl_ms));
        new.booking_id = req.booking_id;
        new.customer_id = req.customer_id;
        new.notes = req.notes;
        self.create_reservation(new).await
    }

    /// Confirm every reservation linked to `booking_id`, across services.
    ///
    /// All-or-nothing: every pending line is validated under the locks of all
    /// involved services before anything is written. Retrying is harmless:
    /// lines already confirmed (or further along) are left as they are.
    pub async fn confirm_booking(&self, booking_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let ids = self.store.reservations_for_booking(&booking_id);
        if ids.is_empty() {
            return Err(EngineError::NotFound(booking_id));
        }
        if ids.len() > MAX_RESERVATIONS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many reservations in booking"));
        }

        let mut lines: Vec<(Ulid, Ulid)> = ids
            .iter()
            .filter_map(|id| self.store.service_for_reservation(id).map(|sid| (sid, *id)))
            .collect();
        lines.sort();
        let mut service_ids: Vec<Ulid> = lines.iter().map(|(sid, _)| *sid).collect();
        service_ids.dedup();

        // One commit permit for the whole batch, then service locks in sorted
        // order.
        let _permit = self.commit_permit().await?;
        let mut guards: HashMap<Ulid, OwnedRwLockWriteGuard<ServiceState>> =
            HashMap::with_capacity(service_ids.len());
        for sid in &service_ids {
            let guard = self.lock_service(sid).await?;
            guards.insert(*sid, guard);
        }

        // Phase 1: validate everything under the locks.
        let now = now_ms();
        let mut to_confirm: Vec<(Ulid, Ulid)> = Vec::new();
        let mut revived: HashMap<Ulid, Vec<Reservation>> = HashMap::new();
        for (sid, id) in &lines {
            let Some(ss) = guards.get(sid) else { continue };
            let Some(r) = ss.get(*id) else { continue };
            if is_past_confirmation(r.status) {
                continue;
            }
            if !r.status.can_transition_to(ReservationStatus::Confirmed) {
                return Err(EngineError::InvalidTransition {
                    id: *id,
                    from: r.status,
                    to: ReservationStatus::Confirmed,
                });
            }
            let extra = revived.entry(*sid).or_default();
            revalidate_lapsed(ss, r, now, extra)?;
            if !r.holds_capacity(now) {
                extra.push(r.clone());
            }
            to_confirm.push((*sid, *id));
        }

        // Phase 2: one log append for the whole batch, then apply.
        if !to_confirm.is_empty() {
            let events: Vec<Event> = to_confirm
                .iter()
                .map(|(sid, id)| Event::BookingConfirmed {
                    id: *id,
                    service_id: *sid,
                    booking_id: Some(booking_id),
                    at: now,
                })
                .collect();
            self.wal_append(events.clone()).await?;
            for event in &events {
                if let Some(ss) = guards.get_mut(&event.service_id()) {
                    self.store.apply_event(ss, event);
                    self.notify.publish(event);
                }
            }
            info!(
                "booking {booking_id} confirmed ({} reservation(s))",
                to_confirm.len()
            );
        } else {
            debug!("booking {booking_id} already confirmed");
        }

        Ok(lines
            .iter()
            .filter_map(|(sid, id)| guards.get(sid).and_then(|ss| ss.get(*id)).cloned())
            .collect())
    }

    /// Pending → Confirmed for a single reservation.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.set_status(id, ReservationStatus::Confirmed).await
    }

    /// Confirmed → InUse (item handed out).
    pub async fn start_rental(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.set_status(id, ReservationStatus::InUse).await
    }

    pub async fn complete(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.set_status(id, ReservationStatus::Completed).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.set_status(id, ReservationStatus::NoShow).await
    }
}
