/// Longest license plate accepted by the request layer.
pub const MAX_PLATE_LEN: usize = 20;

/// Longest vehicle-type name.
pub const MAX_NAME_LEN: usize = 50;

pub const MAX_DESCRIPTION_LEN: usize = 255;

pub const MAX_USERNAME_LEN: usize = 64;

pub const MAX_PASSWORD_LEN: usize = 128;

/// Upper bound on staff accounts.
pub const MAX_USERS: usize = 1024;

/// Highest hourly rate the catalog accepts, in currency units.
pub const MAX_HOURLY_RATE: i64 = 1_000_000;

/// Upper bound on catalog size.
pub const MAX_VEHICLE_TYPES: usize = 256;

/// Longest request line, in bytes. Longer lines are rejected without being buffered.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Capacity of the WAL writer's command queue.
pub const WAL_QUEUE_DEPTH: usize = 4096;

/// Capacity of the watcher broadcast channel. Slow watchers past this lag and skip events.
pub const NOTIFY_CHANNEL_CAPACITY: usize = 256;
