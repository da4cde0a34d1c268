use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn register_vehicle(
        &self,
        id: Ulid,
        name: String,
        capacity_kg: u32,
        tyres: u32,
    ) -> Result<Vehicle, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("vehicle name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("vehicle name too long"));
        }
        if capacity_kg == 0 {
            return Err(EngineError::Validation("capacity_kg must be positive".into()));
        }
        if tyres == 0 {
            return Err(EngineError::Validation("tyres must be positive".into()));
        }

        let _gate = self.write_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.vehicles.len() >= MAX_VEHICLES {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.vehicles.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VehicleRegistered {
            id,
            name: name.clone(),
            capacity_kg,
            tyres,
        };
        self.journal_append(&event).await?;
        let vehicle = Vehicle {
            id,
            name,
            capacity_kg,
            tyres,
        };
        self.insert_vehicle(vehicle.clone());
        tracing::info!("vehicle {id} registered ({}, {capacity_kg} kg)", vehicle.name);
        Ok(vehicle)
    }

    pub fn get_vehicle(&self, id: Ulid) -> Result<Vehicle, EngineError> {
        self.vehicles
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::VehicleNotFound(id))
    }

    /// All vehicles, ordered by id.
    pub fn list_vehicles(&self) -> Vec<Vehicle> {
        let mut out: Vec<Vehicle> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|v| v.id);
        out
    }

    /// Vehicles rated for at least `min_capacity_kg`, ordered by id.
    pub fn list_vehicles_by_min_capacity(&self, min_capacity_kg: u32) -> Vec<Vehicle> {
        let mut out: Vec<Vehicle> = self
            .vehicles
            .iter()
            .filter(|e| e.value().capacity_kg >= min_capacity_kg)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|v| v.id);
        out
    }
}
