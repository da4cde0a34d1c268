use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, checked_span, find_conflict};
use super::{Engine, EngineError};

impl Engine {
    /// Whether any live slot on `vehicle_id` overlaps `[start, end)`. Advisory:
    /// the answer may be stale by the time the caller acts on it.
    pub async fn has_conflict(&self, vehicle_id: Ulid, start: Ms, end: Ms) -> Result<bool, EngineError> {
        let span = checked_span(start, end)?;
        let vs = self
            .vehicle_slots(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(find_conflict(&guard, &span, self.now()).is_some())
    }

    /// Atomically check `span` against the vehicle's live slots and, if free,
    /// record a pending claim that expires after the configured TTL.
    ///
    /// Check and insert happen under the vehicle's write lock, so of several
    /// concurrent overlapping claims exactly one succeeds.
    pub async fn claim(&self, vehicle_id: Ulid, span: Span) -> Result<ReservationToken, EngineError> {
        let span = checked_span(span.start, span.end)?;
        let _gate = self.write_gate.read().await;
        let vs = self
            .vehicle_slots(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let mut guard = vs.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many reservation slots on vehicle"));
        }

        let now = self.now();
        if let Err(e) = check_no_conflict(&guard, &span, now) {
            metrics::counter!(observability::CLAIMS_TOTAL, "outcome" => "conflict").increment(1);
            return Err(e);
        }

        let token = ReservationToken {
            slot_id: Ulid::new(),
            vehicle_id,
            span,
            expires_at: now.saturating_add(self.config.slot_ttl_ms),
        };
        let event = Event::SlotClaimed {
            id: token.slot_id,
            vehicle_id,
            span,
            created_at: now,
            expires_at: token.expires_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::CLAIMS_TOTAL, "outcome" => "claimed").increment(1);
        Ok(token)
    }

    /// Turn a pending claim into a permanent slot linked to `booking_id`.
    ///
    /// Fails with `SlotExpired` once `now >= expires_at`, the same boundary the
    /// conflict check uses. Confirming twice for the same booking is a no-op.
    pub async fn confirm(&self, token: &ReservationToken, booking_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let vs = self
            .vehicle_slots(&token.vehicle_id)
            .ok_or(EngineError::SlotNotFound(token.slot_id))?;
        let mut guard = vs.write().await;
        let slot = guard
            .slot(token.slot_id)
            .ok_or(EngineError::SlotNotFound(token.slot_id))?;

        match slot.state(self.now()) {
            SlotState::Expired => return Err(EngineError::SlotExpired(token.slot_id)),
            SlotState::Confirmed if slot.booking_id() == Some(booking_id) => return Ok(()),
            SlotState::Confirmed => {
                return Err(EngineError::Validation(format!(
                    "slot {} is already confirmed for another booking",
                    token.slot_id
                )));
            }
            SlotState::Pending => {}
        }

        let event = Event::SlotConfirmed {
            id: token.slot_id,
            vehicle_id: token.vehicle_id,
            booking_id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Drop a pending claim. Idempotent: a slot that is already gone is not an
    /// error. Confirmed slots are released only through booking cancellation.
    pub async fn release(&self, token: &ReservationToken) -> Result<ReleaseOutcome, EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(vs) = self.vehicle_slots(&token.vehicle_id) else {
            return Ok(ReleaseOutcome::AlreadyGone);
        };
        let mut guard = vs.write().await;
        match guard.slot(token.slot_id) {
            None => return Ok(ReleaseOutcome::AlreadyGone),
            Some(slot) if slot.booking_id().is_some() => {
                return Err(EngineError::Validation(format!(
                    "slot {} belongs to a booking; cancel the booking instead",
                    token.slot_id
                )));
            }
            Some(_) => {}
        }

        let event = Event::SlotReleased {
            id: token.slot_id,
            vehicle_id: token.vehicle_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(ReleaseOutcome::Released)
    }

    /// Remove every expired pending slot. Returns how many were removed.
    /// Correctness never depends on this running; expired slots are already
    /// inert for conflict checks.
    pub async fn reclaim_expired(&self) -> Result<usize, EngineError> {
        let mut reclaimed = 0usize;
        for vs in self.all_vehicle_slots() {
            let _gate = self.write_gate.read().await;
            let mut guard = vs.write().await;
            let now = self.now();
            let expired: Vec<Ulid> = guard
                .slots
                .iter()
                .filter(|s| s.state(now) == SlotState::Expired)
                .map(|s| s.id)
                .collect();
            for id in expired {
                let event = Event::SlotReleased {
                    id,
                    vehicle_id: guard.vehicle_id,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            metrics::counter!(observability::SLOTS_RECLAIMED_TOTAL).increment(reclaimed as u64);
            tracing::debug!("reclaimed {reclaimed} expired slots");
        }
        Ok(reclaimed)
    }

    /// Non-blocking scan for `(slot_id, vehicle_id)` of expired pending slots.
    /// Vehicles whose lock is busy are skipped this round.
    pub fn collect_expired_slots(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for vs in self.all_vehicle_slots() {
            if let Ok(guard) = vs.try_read() {
                for slot in &guard.slots {
                    if slot.state(now) == SlotState::Expired {
                        expired.push((slot.id, guard.vehicle_id));
                    }
                }
            }
        }
        expired
    }

    /// Every slot on `vehicle_id`, ordered by start, with state as of now.
    pub async fn list_slots(&self, vehicle_id: Ulid) -> Result<Vec<SlotInfo>, EngineError> {
        let vs = self
            .vehicle_slots(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        let now = self.now();
        Ok(guard
            .slots
            .iter()
            .map(|s| SlotInfo {
                id: s.id,
                vehicle_id,
                start: s.span.start,
                end: s.span.end,
                created_at: s.created_at,
                expires_at: s.expires_at,
                booking_id: s.booking_id(),
                state: s.state(now),
            })
            .collect())
    }
}
