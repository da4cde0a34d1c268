use ulid::Ulid;

/// Coarse classification callers use to decide what to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range input. Never retried automatically.
    Validation,
    /// Referenced vehicle, booking or slot does not exist.
    NotFound,
    /// The interval is taken. Expected under contention; retry with another
    /// vehicle or time.
    Conflict,
    /// Journal I/O failed. The whole operation is safe to retry.
    TransientStorage,
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    VehicleNotFound(Ulid),
    BookingNotFound(Ulid),
    SlotNotFound(Ulid),
    AlreadyExists(Ulid),
    /// Claim denied: `slot_id` is the live slot that overlaps.
    Conflict { vehicle_id: Ulid, slot_id: Ulid },
    SlotExpired(Ulid),
    LimitExceeded(&'static str),
    Storage(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::AlreadyExists(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::VehicleNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::SlotNotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict { .. } | EngineError::SlotExpired(_) => ErrorKind::Conflict,
            EngineError::Storage(_) => ErrorKind::TransientStorage,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::VehicleNotFound(id) => write!(f, "vehicle not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::SlotNotFound(id) => write!(f, "reservation slot not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict { vehicle_id, slot_id } => write!(
                f,
                "vehicle {vehicle_id} is already booked for this time slot (held by {slot_id})"
            ),
            EngineError::SlotExpired(id) => write!(f, "reservation slot expired: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
