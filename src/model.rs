use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub name: String,
    pub capacity_kg: u32,
    pub tyres: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Lookup only; a booking never owns its vehicle.
    pub vehicle_id: Ulid,
    pub origin: String,
    pub destination: String,
    pub start: Ms,
    pub end: Ms,
    pub customer_id: String,
    pub created_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// What a reservation slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    /// Exclusive claim, valid until the slot's `expires_at`.
    Pending,
    /// Linked to a persisted booking; never expires.
    Confirmed { booking_id: Ulid },
}

/// Observed state of a slot at a given instant. Expiry is evaluated lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Confirmed,
    Expired,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Pending => "pending",
            SlotState::Confirmed => "confirmed",
            SlotState::Expired => "expired",
        }
    }

    /// Pending and Confirmed slots occupy their interval; Expired ones are inert.
    pub fn blocks(&self) -> bool {
        !matches!(self, SlotState::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSlot {
    pub id: Ulid,
    pub span: Span,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub kind: SlotKind,
}

impl ReservationSlot {
    /// A pending slot is expired from `expires_at` onwards. Confirmation uses the
    /// same boundary, so an expired claim can never be confirmed after a rival
    /// claim took its interval.
    pub fn state(&self, now: Ms) -> SlotState {
        match self.kind {
            SlotKind::Confirmed { .. } => SlotState::Confirmed,
            SlotKind::Pending if now >= self.expires_at => SlotState::Expired,
            SlotKind::Pending => SlotState::Pending,
        }
    }

    pub fn booking_id(&self) -> Option<Ulid> {
        match self.kind {
            SlotKind::Confirmed { booking_id } => Some(booking_id),
            SlotKind::Pending => None,
        }
    }
}

/// Every reservation slot on one vehicle. This is the unit of locking.
#[derive(Debug, Clone)]
pub struct VehicleSlots {
    pub vehicle_id: Ulid,
    /// All slots, sorted by `span.start`.
    pub slots: Vec<ReservationSlot>,
}

impl VehicleSlots {
    pub fn new(vehicle_id: Ulid) -> Self {
        Self {
            vehicle_id,
            slots: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: ReservationSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<ReservationSlot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: Ulid) -> Option<&ReservationSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: Ulid) -> Option<&mut ReservationSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn slot_for_booking(&self, booking_id: Ulid) -> Option<&ReservationSlot> {
        self.slots
            .iter()
            .find(|s| s.booking_id() == Some(booking_id))
    }

    /// Return only slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ReservationSlot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        id: Ulid,
        name: String,
        capacity_kg: u32,
        tyres: u32,
    },
    SlotClaimed {
        id: Ulid,
        vehicle_id: Ulid,
        span: Span,
        created_at: Ms,
        expires_at: Ms,
    },
    SlotConfirmed {
        id: Ulid,
        vehicle_id: Ulid,
        booking_id: Ulid,
    },
    SlotReleased {
        id: Ulid,
        vehicle_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Removes the booking and, when present, its confirmed slot in one record.
    BookingCancelled {
        id: Ulid,
        vehicle_id: Ulid,
        slot_id: Option<Ulid>,
    },
}

impl Event {
    pub fn vehicle_id(&self) -> Ulid {
        match self {
            Event::VehicleRegistered { id, .. } => *id,
            Event::SlotClaimed { vehicle_id, .. }
            | Event::SlotConfirmed { vehicle_id, .. }
            | Event::SlotReleased { vehicle_id, .. }
            | Event::BookingCancelled { vehicle_id, .. } => *vehicle_id,
            Event::BookingCreated { booking } => booking.vehicle_id,
        }
    }
}

// ── Request / result types ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub origin: String,
    pub destination: String,
    pub start: Ms,
    pub customer_id: String,
}

/// Proof of a successful claim. Hand it back to confirm or release the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationToken {
    pub slot_id: Ulid,
    pub vehicle_id: Ulid,
    pub span: Span,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableVehicle {
    pub vehicle: Vehicle,
    pub estimated_duration_ms: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub booking_id: Option<Ulid>,
    pub state: SlotState,
}
