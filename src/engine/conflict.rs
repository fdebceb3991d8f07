use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::occupancy::{load_profile, peak_load};
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Reject empty, inverted, out-of-range or oversized ranges before any store access.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span { start, end };
    if start >= end {
        return Err(EngineError::InvalidRange {
            span,
            reason: "start must be before end",
        });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidRange {
            span,
            reason: "timestamp out of range",
        });
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("range too wide"));
    }
    Ok(span)
}

pub(crate) fn validate_quantity(quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 {
        return Err(EngineError::InvalidQuantity {
            quantity,
            reason: "must be positive",
        });
    }
    Ok(())
}

/// Checks that need the service configuration.
pub(crate) fn validate_against_service(
    config: &ServiceConfig,
    kind: ReservationType,
    span: &Span,
    quantity: u32,
) -> Result<(), EngineError> {
    if quantity > config.capacity {
        return Err(EngineError::InvalidQuantity {
            quantity,
            reason: "exceeds service capacity",
        });
    }
    if kind.is_rental() && span.duration_ms() < config.min_rental_ms() {
        return Err(EngineError::InvalidRange {
            span: *span,
            reason: "shorter than minimum rental period",
        });
    }
    Ok(())
}

/// Evaluate a prospective reservation against current active footprints.
///
/// `extra` carries reservations whose capacity is not (yet) held in the state
/// but must count, e.g. lapsed siblings revived in the same confirmation.
pub(crate) fn evaluate(
    ss: &ServiceState,
    kind: ReservationType,
    span: &Span,
    quantity: u32,
    now: Ms,
    exclude: Option<Ulid>,
    extra: &[Reservation],
) -> AvailabilityCheck {
    let config = &ss.config;
    let window = footprint(kind, span, config);
    let mut hits: Vec<(&Reservation, Span)> = ss.active_footprints(window, now, exclude).collect();
    hits.extend(
        extra
            .iter()
            .filter(|r| Some(r.id) != exclude)
            .map(|r| (r, r.footprint(config)))
            .filter(|(_, fp)| fp.overlaps(&window)),
    );

    let available_quantity = if !config.allow_simultaneous_bookings {
        if hits.is_empty() { config.capacity } else { 0 }
    } else {
        let weighted: Vec<(Span, u32)> = hits.iter().map(|(r, fp)| (*fp, r.quantity)).collect();
        let profile = load_profile(&weighted);
        config.capacity.saturating_sub(peak_load(&profile, &window))
    };

    let is_available = available_quantity >= quantity;
    let (conflicts, has_more) = if is_available {
        (Vec::new(), false)
    } else {
        let has_more = hits.len() > MAX_CONFLICTS_REPORTED;
        let conflicts = hits
            .into_iter()
            .take(MAX_CONFLICTS_REPORTED)
            .map(|(r, _)| r.clone())
            .collect();
        (conflicts, has_more)
    };

    AvailabilityCheck {
        is_available,
        available_quantity,
        conflicts,
        has_more,
    }
}

/// The authoritative capacity check; the caller holds the service write lock.
pub(crate) fn check_capacity(
    ss: &ServiceState,
    kind: ReservationType,
    span: &Span,
    quantity: u32,
    now: Ms,
    exclude: Option<Ulid>,
    extra: &[Reservation],
) -> Result<(), EngineError> {
    let check = evaluate(ss, kind, span, quantity, now, exclude, extra);
    if check.is_available {
        return Ok(());
    }
    metrics::counter!(crate::observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
    Err(EngineError::CapacityExceeded {
        capacity: ss.config.capacity,
        requested: quantity,
        available: check.available_quantity,
        conflicts: check.conflicts,
        has_more: check.has_more,
    })
}

/// Reject a configuration the live reservations would already violate: more
/// units than `capacity` at some instant, or, for an exclusive service, two
/// reservations at the same instant. Conflicts are the reservations covering
/// the offending segment.
pub(crate) fn check_reconfigure(
    config: &ServiceConfig,
    reservations: &[Reservation],
    now: Ms,
) -> Result<(), EngineError> {
    let active: Vec<(&Reservation, Span)> = reservations
        .iter()
        .filter(|r| r.holds_capacity(now))
        .map(|r| (r, r.footprint(config)))
        .collect();
    let units: Vec<(Span, u32)> = active.iter().map(|(r, fp)| (*fp, r.quantity)).collect();
    let unit_profile = load_profile(&units);

    let over_capacity = unit_profile
        .iter()
        .filter(|s| s.load > config.capacity)
        .max_by_key(|s| s.load)
        .map(|s| s.span);
    let overlapping = || {
        let counts: Vec<(Span, u32)> = active.iter().map(|(_, fp)| (*fp, 1)).collect();
        load_profile(&counts)
            .into_iter()
            .find(|s| s.load > 1)
            .map(|s| s.span)
    };
    let segment = match over_capacity {
        Some(span) => span,
        None if !config.allow_simultaneous_bookings => match overlapping() {
            Some(span) => span,
            None => return Ok(()),
        },
        None => return Ok(()),
    };

    let covering: Vec<&Reservation> = active
        .iter()
        .filter(|(_, fp)| fp.overlaps(&segment))
        .map(|(r, _)| *r)
        .collect();
    metrics::counter!(crate::observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
    Err(EngineError::CapacityExceeded {
        capacity: config.capacity,
        requested: peak_load(&unit_profile, &segment),
        available: 0,
        has_more: covering.len() > MAX_CONFLICTS_REPORTED,
        conflicts: covering
            .into_iter()
            .take(MAX_CONFLICTS_REPORTED)
            .cloned()
            .collect(),
    })
}
