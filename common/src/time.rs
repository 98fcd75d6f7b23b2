use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type TimestampSeconds = u64;
pub type TimestampMillis = u64;

// Get the current time in seconds since the Unix epoch
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

// Get the current time in milliseconds since the Unix epoch
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}

fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock went backwards before 1970")
}
