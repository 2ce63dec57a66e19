use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since UNIX epoch.
pub type EpochMs = i64;

/// Returns current unix epoch milliseconds.
pub fn now_ms() -> EpochMs {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_millis() as i64
}

/// Generates a task id (UUID v4 as string).
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generates a request trace id (ULID, sorts by time).
pub fn new_request_id() -> String {
    ulid::Ulid::new().to_string()
}
