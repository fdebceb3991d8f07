use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_capacity, check_reconfigure, now_ms, validate_against_service, validate_quantity,
    validate_range,
};
use super::store::InMemoryStore;
use super::{Engine, EngineError, WalCommand};

/// Input for `create_reservation`. Times are Unix milliseconds.
#[derive(Debug, Clone)]
pub struct NewReservation {
    /// Caller-chosen id; generated when absent.
    pub id: Option<Ulid>,
    pub service_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub quantity: u32,
    pub kind: ReservationType,
    /// `Pending` or `Confirmed`; defaults by kind.
    pub status: Option<ReservationStatus>,
    pub booking_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub expires_at: Option<Ms>,
    pub notes: Option<String>,
}

impl NewReservation {
    pub fn new(service_id: Ulid, start: Ms, end: Ms, quantity: u32, kind: ReservationType) -> Self {
        Self {
            id: None,
            service_id,
            start,
            end,
            quantity,
            kind,
            status: None,
            booking_id: None,
            customer_id: None,
            expires_at: None,
            notes: None,
        }
    }
}

/// Mutable fields of a reservation. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ReservationPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub quantity: Option<u32>,
    pub notes: Option<String>,
}

fn validate_notes(notes: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

fn validate_config(config: &ServiceConfig) -> Result<(), EngineError> {
    if config.capacity == 0 {
        return Err(EngineError::InvalidQuantity {
            quantity: 0,
            reason: "service capacity must be at least 1",
        });
    }
    if let Some(ref n) = config.name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("service name too long"));
    }
    for buffer in [config.buffer_before, config.buffer_after] {
        if !(0..=MAX_BUFFER_MS).contains(&buffer) {
            return Err(EngineError::LimitExceeded("buffer out of range"));
        }
    }
    Ok(())
}

/// Status a new reservation starts in.
fn initial_status(
    kind: ReservationType,
    requested: Option<ReservationStatus>,
    id: Ulid,
) -> Result<ReservationStatus, EngineError> {
    use ReservationStatus::*;
    let status = match (kind, requested) {
        (ReservationType::Maintenance | ReservationType::Blocked, None) => Confirmed,
        (_, None) => Pending,
        (_, Some(s)) => s,
    };
    let allowed = match kind {
        // A hold is confirmed through checkout, never created confirmed.
        ReservationType::SoftHold => status == Pending,
        _ => matches!(status, Pending | Confirmed),
    };
    if !allowed {
        return Err(EngineError::InvalidTransition {
            id,
            from: Pending,
            to: status,
        });
    }
    Ok(status)
}

impl Engine {
    // ── Services ─────────────────────────────────────────────

    /// Insert or replace a service's configuration.
    pub async fn register_service(&self, config: ServiceConfig) -> Result<(), EngineError> {
        validate_config(&config)?;
        let id = config.id;

        if !self.store.contains_service(&id) {
            if self.store.service_count() >= MAX_SERVICES_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many services"));
            }
            let _permit = self.commit_permit().await?;
            let event = Event::ServiceRegistered {
                config: config.clone(),
            };
            self.wal_append(vec![event.clone()]).await?;
            let state = Arc::new(RwLock::new(ServiceState::new(config.clone())));
            if self.store.insert_service_if_absent(id, state) {
                info!("service {id} registered (capacity {})", config.capacity);
            } else {
                // Lost a race with a concurrent registration. The logged event
                // replays as a config replace, so apply it that way.
                let mut guard = self.lock_service(&id).await?;
                self.store.apply_event(&mut guard, &event);
            }
            self.notify.publish(&event);
            return Ok(());
        }

        let mut guard = self.write_service(&id).await?;
        if guard.config == config {
            return Ok(());
        }
        check_reconfigure(&config, &guard.reservations, now_ms())?;
        let event = Event::ServiceRegistered { config };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("service {id} config updated");
        Ok(())
    }

    pub async fn remove_service(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.write_service(&id).await?;
        let now = now_ms();
        if let Some(r) = guard.reservations.iter().find(|r| r.holds_capacity(now)) {
            return Err(EngineError::InvalidState {
                id: r.id,
                status: r.status,
                reason: "service still has active reservations",
            });
        }

        let event = Event::ServiceRemoved { id };
        self.wal_append(vec![event.clone()]).await?;
        self.store.remove_service(&id);
        self.store.forget_service(&guard);
        self.notify.publish(&event);
        info!("service {id} removed");
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        let span = validate_range(req.start, req.end)?;
        validate_quantity(req.quantity)?;
        validate_notes(&req.notes)?;

        let id = req.id.unwrap_or_else(Ulid::new);
        let status = initial_status(req.kind, req.status, id)?;
        let now = now_ms();
        let expires_at = match req.kind {
            ReservationType::SoftHold => match req.expires_at {
                None => {
                    return Err(EngineError::InvalidRange {
                        span,
                        reason: "soft hold requires an expiry",
                    });
                }
                Some(exp) if exp <= now => {
                    return Err(EngineError::InvalidRange {
                        span,
                        reason: "soft hold expiry already passed",
                    });
                }
                exp => exp,
            },
            _ => None,
        };
        if let Some(bid) = req.booking_id
            && self.store.reservations_for_booking(&bid).len() >= MAX_RESERVATIONS_PER_BOOKING
        {
            return Err(EngineError::LimitExceeded("too many reservations in booking"));
        }

        // Claimed tenant-wide before the log sees it; creates on other
        // services cannot take the same id meanwhile.
        let claim = IdClaim::take(&self.store, id, req.service_id)?;
        let mut guard = self.write_service(&req.service_id).await?;
        validate_against_service(&guard.config, req.kind, &span, req.quantity)?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many reservations on service"));
        }
        check_capacity(&guard, req.kind, &span, req.quantity, now, None, &[])?;

        let reservation = Reservation {
            id,
            service_id: req.service_id,
            span,
            quantity: req.quantity,
            status,
            kind: req.kind,
            booking_id: req.booking_id,
            customer_id: req.customer_id,
            expires_at,
            notes: req.notes,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.keep();
        metrics::counter!(
            crate::observability::RESERVATIONS_CREATED_TOTAL,
            "kind" => kind_label(reservation.kind)
        )
        .increment(1);
        Ok(reservation)
    }

    /// Change dates, quantity or notes of a Pending or Confirmed reservation.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        if let Some(q) = patch.quantity {
            validate_quantity(q)?;
        }
        validate_notes(&patch.notes)?;

        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !matches!(
            current.status,
            ReservationStatus::Pending | ReservationStatus::Confirmed
        ) {
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
                reason: "only pending or confirmed reservations can be edited",
            });
        }
        let now = now_ms();
        if !current.holds_capacity(now) {
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
                reason: "soft hold has expired",
            });
        }

        let span = validate_range(
            patch.start.unwrap_or(current.span.start),
            patch.end.unwrap_or(current.span.end),
        )?;
        let quantity = patch.quantity.unwrap_or(current.quantity);
        validate_against_service(&guard.config, current.kind, &span, quantity)?;
        check_capacity(&guard, current.kind, &span, quantity, now, Some(id), &[])?;

        let event = Event::ReservationUpdated {
            id,
            service_id: current.service_id,
            span,
            quantity,
            notes: patch.notes.or(current.notes),
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Move a reservation along the status state machine.
    pub async fn set_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }
        let now = now_ms();

        let event = if status == ReservationStatus::Confirmed {
            super::lifecycle::revalidate_lapsed(&guard, &current, now, &[])?;
            Event::BookingConfirmed {
                id,
                service_id: current.service_id,
                booking_id: current.booking_id,
                at: now,
            }
        } else {
            Event::StatusChanged {
                id,
                service_id: current.service_id,
                status,
                at: now,
            }
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.set_status(id, ReservationStatus::Cancelled).await
    }

    // ── Background maintenance ───────────────────────────────

    /// Cancel every pending soft hold with `expires_at <= now`. Idempotent.
    ///
    /// A service that cannot be locked or logged is skipped until the next
    /// sweep; the others are still swept.
    pub async fn expire_soft_holds(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        let mut expired = Vec::new();
        for service_id in self.store.service_ids() {
            match self.expire_in_service(service_id, now, &mut expired).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => warn!("soft hold sweep skipped service {service_id}: {e}"),
            }
        }
        if !expired.is_empty() {
            metrics::counter!(crate::observability::SOFT_HOLDS_EXPIRED_TOTAL)
                .increment(expired.len() as u64);
            debug!("expired {} soft hold(s)", expired.len());
        }
        Ok(expired)
    }

    async fn expire_in_service(
        &self,
        service_id: Ulid,
        now: Ms,
        expired: &mut Vec<Ulid>,
    ) -> Result<(), EngineError> {
        // Read pass first so quiet services are never write-locked.
        let any = self
            .read_service(&service_id)
            .await?
            .reservations
            .iter()
            .any(|r| is_lapsed_hold(r, now));
        if !any {
            return Ok(());
        }

        let mut guard = self.write_service(&service_id).await?;
        let ids: Vec<Ulid> = guard
            .reservations
            .iter()
            .filter(|r| is_lapsed_hold(r, now))
            .map(|r| r.id)
            .collect();
        for id in ids {
            let event = Event::StatusChanged {
                id,
                service_id,
                status: ReservationStatus::Cancelled,
                at: now,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            expired.push(id);
        }
        Ok(())
    }

    /// Drop terminal reservations whose range ended more than `retention` ago.
    /// Memory only; the next compaction removes them from the log.
    pub async fn gc_terminal_reservations(
        &self,
        now: Ms,
        retention: Ms,
    ) -> Result<usize, EngineError> {
        let cutoff = now.saturating_sub(retention);
        let mut purged = 0;
        for service_id in self.store.service_ids() {
            let mut guard = match self.write_service(&service_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => {
                    warn!("terminal gc skipped service {service_id}: {e}");
                    continue;
                }
            };
            let ids: Vec<Ulid> = guard
                .reservations
                .iter()
                .filter(|r| r.status.is_terminal() && r.span.end <= cutoff)
                .map(|r| r.id)
                .collect();
            for id in ids {
                if self.store.purge(&mut guard, id).is_some() {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            debug!("purged {purged} terminal reservation(s)");
        }
        Ok(purged)
    }

    /// Rewrite the log with only the events needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = tokio::time::timeout(self.store_timeout, self.commit_gate.clone().write_owned())
            .await
            .map_err(|_| EngineError::StoreUnavailable("timed out waiting to compact".into()))?;

        let mut events = Vec::new();
        for service_id in self.store.service_ids() {
            let Some(rs) = self.store.get_service(&service_id) else {
                continue;
            };
            let guard = rs.read().await;
            events.push(Event::ServiceRegistered {
                config: guard.config.clone(),
            });
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        match rx.await {
            Ok(Ok(())) => {
                debug!("WAL compacted to {count} event(s)");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("WAL compaction failed: {e}");
                Err(EngineError::StoreUnavailable(format!("WAL compaction: {e}")))
            }
            Err(_) => Err(EngineError::StoreUnavailable(
                "WAL writer dropped response".into(),
            )),
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Holds a reservation id in the index for a create in flight. Released on
/// drop unless the create reached the log.
struct IdClaim<'a> {
    store: &'a InMemoryStore,
    id: Ulid,
    service_id: Ulid,
    kept: bool,
}

impl<'a> IdClaim<'a> {
    fn take(store: &'a InMemoryStore, id: Ulid, service_id: Ulid) -> Result<Self, EngineError> {
        if !store.claim_reservation_id(id, service_id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(Self {
            store,
            id,
            service_id,
            kept: false,
        })
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.store.release_reservation_id(&self.id, &self.service_id);
        }
    }
}

fn is_lapsed_hold(r: &Reservation, now: Ms) -> bool {
    r.kind == ReservationType::SoftHold
        && r.status == ReservationStatus::Pending
        && r.expires_at.is_some_and(|exp| exp <= now)
}

fn kind_label(kind: ReservationType) -> &'static str {
    match kind {
        ReservationType::SoftHold => "soft_hold",
        ReservationType::Booking => "booking",
        ReservationType::Maintenance => "maintenance",
        ReservationType::Blocked => "blocked",
    }
}
