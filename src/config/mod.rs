use std::time::Duration;

/// Default number of pages the buffer manager may cache at once.
pub const DEFAULT_BUFFER_CAPACITY: usize = 50;
/// Default interval at which a blocked lock request re-checks grantability.
pub const DEFAULT_LOCK_POLL_MS: u64 = 50;
/// Default wait budget after which a blocked lock request is treated as deadlocked.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2500;

pub struct DbConfig {
    pub buffer_capacity: usize,
    pub lock_poll: Duration,
    pub lock_timeout: Duration,
}

impl DbConfig {
    pub fn new() -> DbConfig {
        // Read environment variables 'FERRODB_*'
        // If not set, use the defaults above
        DbConfig {
            buffer_capacity: env_or("FERRODB_BUFFER_CAPACITY", DEFAULT_BUFFER_CAPACITY),
            lock_poll: Duration::from_millis(env_or("FERRODB_LOCK_POLL_MS", DEFAULT_LOCK_POLL_MS)),
            lock_timeout: Duration::from_millis(env_or(
                "FERRODB_LOCK_TIMEOUT_MS",
                DEFAULT_LOCK_TIMEOUT_MS,
            )),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
