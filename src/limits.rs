use crate::model::Ms;

pub const MAX_VEHICLES: usize = 100_000;
pub const MAX_SLOTS_PER_VEHICLE: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOCATION_CODE_LEN: usize = 32;
pub const MAX_CUSTOMER_ID_LEN: usize = 256;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_CONNECTIONS: usize = 4096;
