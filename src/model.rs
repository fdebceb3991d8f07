use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds; the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Widen by `before` on the left and `after` on the right.
    pub fn padded(&self, before: Ms, after: Ms) -> Span {
        Span {
            start: self.start - before,
            end: self.end + after,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodUnit {
    Hour,
    Day,
    Week,
    /// Fixed 30 days.
    Month,
}

impl PeriodUnit {
    pub fn as_ms(self) -> Ms {
        match self {
            PeriodUnit::Hour => HOUR_MS,
            PeriodUnit::Day => DAY_MS,
            PeriodUnit::Week => 7 * DAY_MS,
            PeriodUnit::Month => 30 * DAY_MS,
        }
    }
}

/// Local mirror of a rental service from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: Ulid,
    pub name: Option<String>,
    /// Total units that may be reserved at the same instant.
    pub capacity: u32,
    pub period_unit: PeriodUnit,
    pub min_rental_periods: u32,
    pub buffer_before: Ms,
    pub buffer_after: Ms,
    pub allow_simultaneous_bookings: bool,
}

impl ServiceConfig {
    pub fn new(id: Ulid, capacity: u32) -> Self {
        Self {
            id,
            name: None,
            capacity,
            period_unit: PeriodUnit::Day,
            min_rental_periods: 0,
            buffer_before: 0,
            buffer_after: 0,
            allow_simultaneous_bookings: true,
        }
    }

    pub fn min_rental_ms(&self) -> Ms {
        self.period_unit.as_ms() * Ms::from(self.min_rental_periods)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    InUse,
    Completed,
    Cancelled,
    NoShow,
}

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 6] = [
        ReservationStatus::Pending,
        ReservationStatus::Confirmed,
        ReservationStatus::InUse,
        ReservationStatus::Completed,
        ReservationStatus::Cancelled,
        ReservationStatus::NoShow,
    ];

    /// Case-insensitive lookup by name.
    pub fn parse(name: &str) -> Option<ReservationStatus> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(name.trim()))
    }

    /// Active reservations hold capacity.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::InUse
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, InUse)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
                | (InUse, Completed)
                | (InUse, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "Pending",
            ReservationStatus::Confirmed => "Confirmed",
            ReservationStatus::InUse => "InUse",
            ReservationStatus::Completed => "Completed",
            ReservationStatus::Cancelled => "Cancelled",
            ReservationStatus::NoShow => "NoShow",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationType {
    /// Auto-expiring checkout hold.
    SoftHold,
    Booking,
    Maintenance,
    Blocked,
}

impl ReservationType {
    /// Rentals are padded by the service buffers and subject to the minimum period.
    pub fn is_rental(self) -> bool {
        matches!(self, ReservationType::SoftHold | ReservationType::Booking)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub service_id: Ulid,
    pub span: Span,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub kind: ReservationType,
    pub booking_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    /// Only meaningful for `SoftHold`.
    pub expires_at: Option<Ms>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    /// Whether this reservation consumes capacity at `now`.
    /// A soft hold past its expiry stops counting before the sweep cancels it.
    pub fn holds_capacity(&self, now: Ms) -> bool {
        if !self.status.is_active() {
            return false;
        }
        match (self.kind, self.expires_at) {
            (ReservationType::SoftHold, Some(exp)) => exp > now,
            _ => true,
        }
    }

    /// Occupied range including turnaround buffers.
    pub fn footprint(&self, config: &ServiceConfig) -> Span {
        footprint(self.kind, &self.span, config)
    }
}

pub fn footprint(kind: ReservationType, span: &Span, config: &ServiceConfig) -> Span {
    if kind.is_rental() {
        span.padded(config.buffer_before, config.buffer_after)
    } else {
        *span
    }
}

#[derive(Debug, Clone)]
pub struct ServiceState {
    pub config: ServiceConfig,
    /// All reservations (terminal ones included), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ServiceState {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.config.id
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose raw span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Reservations whose buffered footprint overlaps `window` and that hold
    /// capacity at `now`, paired with that footprint.
    pub fn active_footprints<'a>(
        &'a self,
        window: Span,
        now: Ms,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = (&'a Reservation, Span)> + 'a {
        // A raw span can sit up to buffer_after before (or buffer_before after)
        // a footprint that still reaches the window.
        let search = window.padded(self.config.buffer_after, self.config.buffer_before);
        let config = &self.config;
        self.overlapping(search).filter_map(move |r| {
            if Some(r.id) == exclude || !r.holds_capacity(now) {
                return None;
            }
            let fp = r.footprint(config);
            fp.overlaps(&window).then_some((r, fp))
        })
    }

    pub fn active_count(&self, now: Ms) -> usize {
        self.reservations
            .iter()
            .filter(|r| r.holds_capacity(now))
            .count()
    }
}

/// Flat event records, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceRegistered {
        config: ServiceConfig,
    },
    ServiceRemoved {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        id: Ulid,
        service_id: Ulid,
        span: Span,
        quantity: u32,
        notes: Option<String>,
        at: Ms,
    },
    StatusChanged {
        id: Ulid,
        service_id: Ulid,
        status: ReservationStatus,
        at: Ms,
    },
    /// Pending → Confirmed through checkout; promotes a soft hold to a booking.
    BookingConfirmed {
        id: Ulid,
        service_id: Ulid,
        booking_id: Option<Ulid>,
        at: Ms,
    },
}

impl Event {
    pub fn service_id(&self) -> Ulid {
        match self {
            Event::ServiceRegistered { config } => config.id,
            Event::ServiceRemoved { id } => *id,
            Event::ReservationCreated { reservation } => reservation.service_id,
            Event::ReservationUpdated { service_id, .. }
            | Event::StatusChanged { service_id, .. }
            | Event::BookingConfirmed { service_id, .. } => *service_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    Hour,
    #[default]
    Day,
    Week,
}

impl Granularity {
    pub fn step_ms(self) -> Ms {
        match self {
            Granularity::Hour => HOUR_MS,
            Granularity::Day => DAY_MS,
            Granularity::Week => 7 * DAY_MS,
        }
    }
}

/// Derived calendar bucket; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AvailabilitySlot {
    pub span: Span,
    pub total_quantity: u32,
    /// Peak concurrent reserved units inside the slot.
    pub reserved_quantity: u32,
    pub available_quantity: u32,
    pub is_fully_booked: bool,
}

impl AvailabilitySlot {
    /// `exclusive` services admit a single reservation at a time, so any load
    /// leaves nothing free.
    pub fn new(span: Span, total_quantity: u32, reserved_quantity: u32, exclusive: bool) -> Self {
        let available_quantity = if exclusive && reserved_quantity > 0 {
            0
        } else {
            total_quantity.saturating_sub(reserved_quantity)
        };
        Self {
            span,
            total_quantity,
            reserved_quantity,
            available_quantity,
            is_fully_booked: available_quantity == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityCheck {
    pub is_available: bool,
    /// Minimum free units over the requested range.
    pub available_quantity: u32,
    /// Active reservations blocking the request, by start ascending. Empty when available.
    pub conflicts: Vec<Reservation>,
    pub has_more: bool,
}
