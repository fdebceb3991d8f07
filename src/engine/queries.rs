use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{evaluate, now_ms, validate_quantity, validate_range};
use super::occupancy::{Calendar, load_profile};
use super::{Engine, EngineError};

fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = validate_range(start, end)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

fn status_matches(r: &Reservation, statuses: Option<&[ReservationStatus]>) -> bool {
    statuses.is_none_or(|set| set.contains(&r.status))
}

impl Engine {
    pub async fn get_service(&self, id: Ulid) -> Result<ServiceConfig, EngineError> {
        let guard = self.read_service(&id).await?;
        Ok(guard.config.clone())
    }

    /// All registered services, by id.
    pub async fn list_services(&self) -> Result<Vec<ServiceConfig>, EngineError> {
        let mut out = Vec::new();
        for id in self.store.service_ids() {
            match self.read_service(&id).await {
                Ok(guard) => out.push(guard.config.clone()),
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let service_id = self
            .store
            .service_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.read_service(&service_id).await?;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every reservation of a service, terminal ones included, by start.
    pub async fn list_reservations(
        &self,
        service_id: Ulid,
        statuses: Option<&[ReservationStatus]>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let guard = self.read_service(&service_id).await?;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| status_matches(r, statuses))
            .cloned()
            .collect())
    }

    /// Reservations whose own range intersects `[start, end)`, by start.
    pub async fn query_overlapping(
        &self,
        service_id: Ulid,
        start: Ms,
        end: Ms,
        statuses: Option<&[ReservationStatus]>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let window = validate_window(start, end)?;
        let guard = self.read_service(&service_id).await?;
        Ok(guard
            .overlapping(window)
            .filter(|r| status_matches(r, statuses))
            .cloned()
            .collect())
    }

    /// Whether `quantity` units are free over the whole of `[start, end)`.
    ///
    /// The candidate is treated as a booking, or as the kind of the excluded
    /// reservation when re-checking an edit in place.
    pub async fn check_availability(
        &self,
        service_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: u32,
        exclude: Option<Ulid>,
    ) -> Result<AvailabilityCheck, EngineError> {
        let span = validate_range(start, end)?;
        validate_quantity(quantity)?;

        let guard = self.read_service(&service_id).await?;
        if quantity > guard.config.capacity {
            return Err(EngineError::InvalidQuantity {
                quantity,
                reason: "exceeds service capacity",
            });
        }
        let kind = exclude
            .and_then(|id| guard.get(id))
            .map_or(ReservationType::Booking, |r| r.kind);
        Ok(evaluate(&guard, kind, &span, quantity, now_ms(), exclude, &[]))
    }

    /// Per-slot availability over `[start, end)`.
    ///
    /// Builds one load profile for the range up front; the returned calendar
    /// is detached from the store and can be iterated (or cloned and
    /// re-iterated) without holding any lock.
    pub async fn availability_calendar(
        &self,
        service_id: Ulid,
        start: Ms,
        end: Ms,
        granularity: Granularity,
    ) -> Result<Calendar, EngineError> {
        let range = validate_window(start, end)?;
        let step = granularity.step_ms();
        if Calendar::slot_count(&range, step) > MAX_CALENDAR_SLOTS {
            return Err(EngineError::LimitExceeded("too many calendar slots"));
        }

        let guard = self.read_service(&service_id).await?;
        let weighted: Vec<(Span, u32)> = guard
            .active_footprints(range, now_ms(), None)
            .map(|(r, fp)| (fp, r.quantity))
            .collect();
        let config = &guard.config;
        Ok(Calendar::new(
            load_profile(&weighted),
            config.capacity,
            !config.allow_simultaneous_bookings,
            range,
            step,
        ))
    }
}
