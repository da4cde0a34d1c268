mod bookings;
mod clock;
mod conflict;
mod error;
mod journal;
mod registry;
mod reservations;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, ErrorKind};
pub use journal::{Journal, MemoryJournal, WalJournal};

use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::wal::Wal;

pub type SharedVehicleSlots = Arc<RwLock<VehicleSlots>>;

/// The booking engine: vehicles, bookings and per-vehicle reservation slots.
///
/// Each vehicle's slots sit behind their own lock, so claims on different
/// vehicles never wait on each other. Every mutation is journaled before it
/// is applied; a failed append leaves the in-memory state untouched.
pub struct Engine {
    pub(super) vehicles: DashMap<Ulid, Vehicle>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    /// Booking ids whose `create_booking` is still running.
    pub(super) bookings_in_flight: DashSet<Ulid>,
    pub(super) slots: DashMap<Ulid, SharedVehicleSlots>,
    /// Reverse lookup: slot id → vehicle id
    pub(super) slot_to_vehicle: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss a concurrent append.
    pub(super) write_gate: RwLock<()>,
    /// Serializes registrations so duplicate ids are caught.
    pub(super) registry_lock: Mutex<()>,
    pub(super) journal: Arc<dyn Journal>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
}

/// Apply a slot-scoped event (no locking — caller holds the vehicle's lock).
fn apply_to_slots(
    vs: &mut VehicleSlots,
    event: &Event,
    slot_index: &DashMap<Ulid, Ulid>,
    bookings: &DashMap<Ulid, Booking>,
) {
    match event {
        Event::SlotClaimed {
            id,
            vehicle_id,
            span,
            created_at,
            expires_at,
        } => {
            vs.insert_slot(ReservationSlot {
                id: *id,
                span: *span,
                created_at: *created_at,
                expires_at: *expires_at,
                kind: SlotKind::Pending,
            });
            slot_index.insert(*id, *vehicle_id);
        }
        Event::SlotConfirmed { id, booking_id, .. } => {
            if let Some(slot) = vs.slot_mut(*id) {
                slot.kind = SlotKind::Confirmed {
                    booking_id: *booking_id,
                };
            }
        }
        Event::SlotReleased { id, .. } => {
            vs.remove_slot(*id);
            slot_index.remove(id);
        }
        Event::BookingCancelled { id, slot_id, .. } => {
            bookings.remove(id);
            if let Some(slot_id) = slot_id {
                vs.remove_slot(*slot_id);
                slot_index.remove(slot_id);
            }
        }
        // Vehicles and new bookings live outside the slot table.
        Event::VehicleRegistered { .. } | Event::BookingCreated { .. } => {}
    }
}

impl Engine {
    /// Replay the log at `wal_path` and start its writer task. Must be called
    /// inside a Tokio runtime.
    pub fn open(wal_path: &Path, config: EngineConfig) -> io::Result<Self> {
        let replay = Wal::replay(wal_path)?;
        if replay.discarded_bytes > 0 {
            tracing::warn!(
                "discarding {} trailing bytes of {} (torn or corrupt tail)",
                replay.discarded_bytes,
                wal_path.display()
            );
        }
        let wal = Wal::open(wal_path, replay.valid_len)?;
        tracing::info!(
            "replayed {} events from {}",
            replay.events.len(),
            wal_path.display()
        );
        let journal = Arc::new(WalJournal::spawn(wal));
        Ok(Self::from_parts(
            &replay.events,
            journal,
            Arc::new(SystemClock),
            config,
        ))
    }

    /// Rebuild state from `history` and journal further changes to `journal`.
    pub fn from_parts(
        history: &[Event],
        journal: Arc<dyn Journal>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let engine = Self {
            vehicles: DashMap::new(),
            bookings: DashMap::new(),
            bookings_in_flight: DashSet::new(),
            slots: DashMap::new(),
            slot_to_vehicle: DashMap::new(),
            write_gate: RwLock::new(()),
            registry_lock: Mutex::new(()),
            journal,
            clock,
            config,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        for event in history {
            match event {
                Event::VehicleRegistered {
                    id,
                    name,
                    capacity_kg,
                    tyres,
                } => engine.insert_vehicle(Vehicle {
                    id: *id,
                    name: name.clone(),
                    capacity_kg: *capacity_kg,
                    tyres: *tyres,
                }),
                Event::BookingCreated { booking } => {
                    engine.bookings.insert(booking.id, booking.clone());
                }
                other => {
                    let Some(vs) = engine.vehicle_slots(&other.vehicle_id()) else {
                        tracing::warn!("replay: event for unknown vehicle {}", other.vehicle_id());
                        continue;
                    };
                    if let Ok(mut guard) = vs.try_write() {
                        apply_to_slots(
                            &mut guard,
                            other,
                            &engine.slot_to_vehicle,
                            &engine.bookings,
                        );
                    }
                }
            }
        }

        engine
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(super) fn insert_vehicle(&self, vehicle: Vehicle) {
        let id = vehicle.id;
        self.slots
            .insert(id, Arc::new(RwLock::new(VehicleSlots::new(id))));
        self.vehicles.insert(id, vehicle);
    }

    pub(super) fn vehicle_slots(&self, vehicle_id: &Ulid) -> Option<SharedVehicleSlots> {
        self.slots.get(vehicle_id).map(|e| e.value().clone())
    }

    /// Snapshot of every slot table, so no map guard is held across an await.
    pub(super) fn all_vehicle_slots(&self) -> Vec<SharedVehicleSlots> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    pub fn vehicle_for_slot(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.slot_to_vehicle.get(slot_id).map(|e| *e.value())
    }

    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.journal.append(event).await.map_err(EngineError::from)
    }

    /// Journal `event`, then apply it to `vs`. Caller holds the write gate
    /// and the vehicle's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        vs: &mut VehicleSlots,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        apply_to_slots(vs, event, &self.slot_to_vehicle, &self.bookings);
        Ok(())
    }

    /// Rewrite the journal with only the events needed to recreate the
    /// current state. Released, cancelled and expired entries are dropped.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let now = self.now();

        let mut vehicles: Vec<Vehicle> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        vehicles.sort_by_key(|v| v.id);
        let mut events: Vec<Event> = vehicles
            .into_iter()
            .map(|v| Event::VehicleRegistered {
                id: v.id,
                name: v.name,
                capacity_kg: v.capacity_kg,
                tyres: v.tyres,
            })
            .collect();

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));

        for vs in self.all_vehicle_slots() {
            let guard = vs.read().await;
            for slot in &guard.slots {
                let state = slot.state(now);
                if state == SlotState::Expired {
                    continue;
                }
                events.push(Event::SlotClaimed {
                    id: slot.id,
                    vehicle_id: guard.vehicle_id,
                    span: slot.span,
                    created_at: slot.created_at,
                    expires_at: slot.expires_at,
                });
                if let SlotKind::Confirmed { booking_id } = slot.kind {
                    events.push(Event::SlotConfirmed {
                        id: slot.id,
                        vehicle_id: guard.vehicle_id,
                        booking_id,
                    });
                }
            }
        }

        let count = events.len();
        self.journal.compact(events).await?;
        tracing::info!("journal compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    /// Flush the journal and stop its writer. Later mutations fail with a
    /// storage error.
    pub async fn close(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        self.journal.close().await?;
        Ok(())
    }
}
