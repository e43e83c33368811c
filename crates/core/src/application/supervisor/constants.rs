// Supervisor constants

/// Inbound command channel bound (transport backpressure point)
pub const COMMAND_CHANNEL_CAPACITY: usize = 128;

/// Persist-retry backoff while the gateway is down (doubles up to the cap)
pub const PERSIST_RETRY_BASE_MS: i64 = 1_000;
pub const PERSIST_RETRY_CAP_MS: i64 = 60_000;

/// Fallback select deadline when no timer is armed (1 hour)
pub const IDLE_TIMER_HORIZON_SECS: u64 = 3_600;
