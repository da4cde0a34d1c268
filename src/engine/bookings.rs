use std::future::Future;
use std::time::Duration;

use dashmap::DashSet;
use ulid::Ulid;

use crate::estimator;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{checked_span, find_conflict};
use super::{Engine, EngineError, ErrorKind};

fn validate_location(field: &str, code: &str) -> Result<(), EngineError> {
    if code.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    if code.len() > MAX_LOCATION_CODE_LEN {
        return Err(EngineError::LimitExceeded("location code too long"));
    }
    Ok(())
}

fn validate_request(req: &BookingRequest) -> Result<(), EngineError> {
    validate_location("origin", &req.origin)?;
    validate_location("destination", &req.destination)?;
    if req.customer_id.trim().is_empty() {
        return Err(EngineError::Validation("customer_id must not be empty".into()));
    }
    if req.customer_id.len() > MAX_CUSTOMER_ID_LEN {
        return Err(EngineError::LimitExceeded("customer_id too long"));
    }
    Ok(())
}

/// Holds a booking id in `bookings_in_flight` until dropped.
struct InFlight<'a> {
    ids: &'a DashSet<Ulid>,
    id: Ulid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}

/// Travel window for a trip leaving at `start`.
fn trip_span(origin: &str, destination: &str, start: Ms) -> Result<Span, EngineError> {
    let duration = estimator::estimate(origin, destination);
    checked_span(start, start.saturating_add(duration))
}

impl Engine {
    /// Book `req.vehicle_id` for the estimated trip window.
    ///
    /// Claim the interval, persist the booking, then confirm the claim. A
    /// failed booking write releases the claim; a claim that lapsed before
    /// confirmation removes the booking again and reports a conflict. If a
    /// compensation step itself keeps failing, the leftover pending claim
    /// lapses on its own at `expires_at`.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        validate_request(&req)?;
        // One attempt per id at a time; the map check covers finished ones.
        if !self.bookings_in_flight.insert(req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let _in_flight = InFlight {
            ids: &self.bookings_in_flight,
            id: req.id,
        };
        if self.bookings.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if !self.vehicles.contains_key(&req.vehicle_id) {
            return Err(EngineError::VehicleNotFound(req.vehicle_id));
        }
        let span = trip_span(&req.origin, &req.destination, req.start)?;
        tracing::debug!(
            "booking {} started: vehicle {} [{}, {})",
            req.id,
            req.vehicle_id,
            span.start,
            span.end
        );

        let token = match self.claim(req.vehicle_id, span).await {
            Ok(token) => token,
            Err(e) => {
                let outcome = if e.is_conflict() { "conflict" } else { "failed" };
                metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
                return Err(e);
            }
        };
        tracing::debug!("booking {}: claimed slot {}", req.id, token.slot_id);

        let booking = Booking {
            id: req.id,
            vehicle_id: req.vehicle_id,
            origin: req.origin,
            destination: req.destination,
            start: span.start,
            end: span.end,
            customer_id: req.customer_id,
            created_at: self.now(),
        };

        if let Err(e) = self.persist_booking(&booking).await {
            tracing::warn!("booking {} write failed, releasing slot {}: {e}", booking.id, token.slot_id);
            let released = self
                .with_compensation_retry("release claim", || async move { self.release(&token).await })
                .await;
            if let Err(release_err) = released {
                tracing::error!(
                    "could not release slot {}; it lapses at {}: {release_err}",
                    token.slot_id,
                    token.expires_at
                );
            }
            metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => "failed").increment(1);
            return Err(e);
        }
        tracing::debug!("booking {}: persisted", booking.id);

        if let Err(e) = self.confirm(&token, booking.id).await {
            tracing::warn!("booking {}: confirm of slot {} failed: {e}", booking.id, token.slot_id);
            let (booking_id, vehicle_id) = (booking.id, booking.vehicle_id);
            let discarded = self
                .with_compensation_retry("discard booking", || async move {
                    self.remove_booking(booking_id, vehicle_id, Some(token.slot_id))
                        .await
                })
                .await;
            if let Err(discard_err) = discarded {
                tracing::error!(
                    "could not discard booking {booking_id}; the orphan sweep will remove it: {discard_err}"
                );
            }
            let err = match e {
                EngineError::SlotExpired(slot_id) | EngineError::SlotNotFound(slot_id) => {
                    EngineError::Conflict { vehicle_id, slot_id }
                }
                other => other,
            };
            let outcome = if err.is_conflict() { "conflict" } else { "failed" };
            metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
            return Err(err);
        }

        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => "created").increment(1);
        tracing::info!(
            "booking {} confirmed: vehicle {} for customer {}",
            booking.id,
            booking.vehicle_id,
            booking.customer_id
        );
        Ok(booking)
    }

    async fn persist_booking(&self, booking: &Booking) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        if self.bookings.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.journal_append(&event).await?;
        self.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    /// Retry a compensation step on transient storage errors with linear
    /// backoff. Other errors are returned at once.
    async fn with_compensation_retry<T, F, Fut>(&self, step: &'static str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let attempts = self.config.compensation_attempts.max(1);
        let mut attempt = 1;
        let result = loop {
            match op().await {
                Err(e) if e.kind() == ErrorKind::TransientStorage && attempt < attempts => {
                    tracing::warn!("{step} failed (attempt {attempt}/{attempts}): {e}");
                    let backoff = self.config.compensation_backoff_ms.saturating_mul(attempt as u64);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                other => break other,
            }
        };
        let outcome = if result.is_ok() { "ok" } else { "failed" };
        metrics::counter!(observability::COMPENSATIONS_TOTAL, "step" => step, "outcome" => outcome)
            .increment(1);
        result
    }

    /// Journal one `BookingCancelled` that drops the booking together with
    /// its slot. `slot_hint` names a not-yet-confirmed slot to drop as well.
    async fn remove_booking(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        slot_hint: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        let vs = self
            .vehicle_slots(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let mut guard = vs.write().await;
        let booking = self
            .bookings
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::BookingNotFound(id))?;
        let slot_id = guard
            .slot_for_booking(id)
            .map(|s| s.id)
            .or_else(|| slot_hint.filter(|sid| guard.slot(*sid).is_some()));

        let event = Event::BookingCancelled {
            id,
            vehicle_id,
            slot_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking)
    }

    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// All bookings, ordered by start then id.
    pub fn list_bookings(&self) -> Vec<Booking> {
        let mut out: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|b| (b.start, b.id));
        out
    }

    pub fn list_bookings_for_vehicle(&self, vehicle_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.vehicles.contains_key(&vehicle_id) {
            return Err(EngineError::VehicleNotFound(vehicle_id));
        }
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().vehicle_id == vehicle_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.start, b.id));
        Ok(out)
    }

    /// Remove a booking and free its interval in one journaled step.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let vehicle_id = self
            .bookings
            .get(&id)
            .map(|e| e.value().vehicle_id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let booking = self.remove_booking(id, vehicle_id, None).await?;
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => "cancelled").increment(1);
        tracing::info!("booking {id} cancelled");
        Ok(booking)
    }

    /// Vehicles with at least `capacity_required` kg whose estimated trip
    /// window starting at `start` is free right now, ordered by id.
    ///
    /// A snapshot: a vehicle listed here can still be taken before the
    /// caller books it, in which case `create_booking` reports a conflict.
    pub async fn search_available(
        &self,
        capacity_required: u32,
        origin: &str,
        destination: &str,
        start: Ms,
    ) -> Result<Vec<AvailableVehicle>, EngineError> {
        if capacity_required == 0 {
            return Err(EngineError::Validation("capacity_required must be positive".into()));
        }
        validate_location("origin", origin)?;
        validate_location("destination", destination)?;
        let span = trip_span(origin, destination, start)?;
        let estimated_duration_ms = span.duration_ms();

        let mut out = Vec::new();
        for vehicle in self.list_vehicles_by_min_capacity(capacity_required) {
            let Some(vs) = self.vehicle_slots(&vehicle.id) else {
                continue;
            };
            let guard = vs.read().await;
            if find_conflict(&guard, &span, self.now()).is_none() {
                out.push(AvailableVehicle {
                    vehicle,
                    estimated_duration_ms,
                });
            }
        }
        Ok(out)
    }

    /// Remove bookings whose claim can no longer be confirmed: older than the
    /// slot TTL with no confirmed slot behind them. These only exist when a
    /// compensation step failed. Returns how many were removed.
    pub async fn discard_orphaned_bookings(&self) -> Result<usize, EngineError> {
        let cutoff = self.now().saturating_sub(self.config.slot_ttl_ms);
        let candidates: Vec<(Ulid, Ulid)> = self
            .bookings
            .iter()
            .filter(|e| e.value().created_at <= cutoff)
            .map(|e| (e.value().id, e.value().vehicle_id))
            .collect();

        let mut discarded = 0usize;
        for (id, vehicle_id) in candidates {
            let Some(vs) = self.vehicle_slots(&vehicle_id) else {
                continue;
            };
            if vs.read().await.slot_for_booking(id).is_some() {
                continue;
            }
            match self.remove_booking(id, vehicle_id, None).await {
                Ok(_) => {
                    tracing::warn!("discarded orphaned booking {id} on vehicle {vehicle_id}");
                    discarded += 1;
                }
                Err(EngineError::BookingNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(discarded)
    }
}
