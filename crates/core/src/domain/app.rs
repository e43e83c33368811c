// App Domain Model

use serde::{Deserialize, Serialize};

use crate::domain::slot::SlotState;
use crate::domain::tenant::TenantId;

/// App identifier, unique within its owning tenant
pub type AppId = String;

/// Composite key identifying an app across tenants
///
/// All supervisor bookkeeping (slot map, timers, output routing) resolves
/// apps by this key; an AppId alone is ambiguous across tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppKey {
    pub tenant: TenantId,
    pub app: AppId,
}

impl AppKey {
    pub fn new(tenant: impl Into<TenantId>, app: impl Into<AppId>) -> Self {
        Self {
            tenant: tenant.into(),
            app: app.into(),
        }
    }
}

impl std::fmt::Display for AppKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant, self.app)
    }
}

/// Submitted program payload handed to the sandbox at spawn time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSource {
    /// File name the sandbox materializes and executes
    pub entry_point: String,
    pub bytes: Vec<u8>,
}

/// Restart policy applied when a run ends without a user-initiated stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartPolicy {
    Auto,
    Never,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Auto => write!(f, "AUTO"),
            RestartPolicy::Never => write!(f, "NEVER"),
        }
    }
}

impl std::str::FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTO" => Ok(RestartPolicy::Auto),
            "NEVER" => Ok(RestartPolicy::Never),
            other => Err(format!("unknown restart policy: {other}")),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStatus {
    /// Process exited with a code
    Code(i32),
    /// Process was killed by a signal
    Signal(i32),
    /// The sandbox never produced a process
    SpawnFailed,
}

impl ExitStatus {
    /// A clean exit: code 0. Everything else counts as abnormal.
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "code({c})"),
            ExitStatus::Signal(s) => write!(f, "signal({s})"),
            ExitStatus::SpawnFailed => write!(f, "spawn-failed"),
        }
    }
}

/// App Entity
///
/// One submitted program owned by exactly one tenant. The app outlives its
/// runs: the ExecutionSlot is runtime-only state, while the app row (and its
/// source, via the persistence gateway) survives supervisor restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub key: AppKey,
    pub entry_point: String,
    pub policy: RestartPolicy,
    pub created_at: i64, // epoch ms

    /// Completed spawn attempts, over the app's lifetime
    pub restart_count: i32,

    /// Consecutive-crash counter driving the backoff ladder.
    /// Persisted so a supervisor restart resumes the ladder instead of
    /// hammering a crash-looping app from the base delay.
    pub crash_backoff: u32,

    pub last_exit: Option<ExitStatus>,

    /// Last slot state checkpointed to the gateway; drives cold-start
    /// recovery (RUNNING/RESTARTING apps are re-admitted on startup)
    pub last_state: SlotState,
}

impl App {
    pub fn new(
        key: AppKey,
        entry_point: impl Into<String>,
        policy: RestartPolicy,
        created_at: i64,
    ) -> Self {
        Self {
            key,
            entry_point: entry_point.into(),
            policy,
            created_at,
            restart_count: 0,
            crash_backoff: 0,
            last_exit: None,
            last_state: SlotState::Pending,
        }
    }
}
