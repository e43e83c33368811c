// ExecutionSlot - runtime instantiation of an App and its state machine

use serde::{Deserialize, Serialize};

use crate::domain::app::AppKey;
use crate::domain::error::{DomainError, Result};

/// Opaque handle to a sandboxed process, owned exclusively by one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Adapter-local identifier (registry key inside the sandbox adapter)
    pub id: u64,
    /// OS process id, informational only; signalling goes through the adapter
    pub pid: i32,
}

/// Slot lifecycle states
///
/// PENDING -> RUNNING -> STOPPING -> EXITED -> RESTARTING -> PENDING,
/// with TERMINATED reachable from anywhere (explicit deletion/admin kill).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    Pending,
    Running,
    Stopping,
    Exited,
    Restarting,
    Terminated,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Pending => write!(f, "PENDING"),
            SlotState::Running => write!(f, "RUNNING"),
            SlotState::Stopping => write!(f, "STOPPING"),
            SlotState::Exited => write!(f, "EXITED"),
            SlotState::Restarting => write!(f, "RESTARTING"),
            SlotState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

impl std::str::FromStr for SlotState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SlotState::Pending),
            "RUNNING" => Ok(SlotState::Running),
            "STOPPING" => Ok(SlotState::Stopping),
            "EXITED" => Ok(SlotState::Exited),
            "RESTARTING" => Ok(SlotState::Restarting),
            "TERMINATED" => Ok(SlotState::Terminated),
            other => Err(format!("unknown slot state: {other}")),
        }
    }
}

/// Why a stop was initiated; decides restart eligibility after the exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// User or admin asked for the stop - never auto-restarted
    User,
    /// Supervisor evicted the slot under resource pressure - re-queued
    /// under the restart policy, the tenant did not ask for this
    Eviction,
}

/// Runtime instantiation of an App
///
/// Exactly one owner: the supervisor's slot map. Pump tasks and the sandbox
/// adapter never touch this struct; they communicate through notifications
/// tagged with `seq`, and the supervisor discards notices whose sequence
/// does not match the current incarnation.
#[derive(Debug)]
pub struct ExecutionSlot {
    pub app: AppKey,
    /// Spawn incarnation number; monotonically increasing per app
    pub seq: u64,
    pub state: SlotState,
    pub handle: Option<SandboxHandle>,
    pub started_at: Option<i64>, // epoch ms
    pub last_active: i64,        // epoch ms, bumped on output
    pub stop_cause: Option<StopCause>,
    /// Set when a user restart is in flight: stop now, respawn on exit
    pub restart_after_exit: bool,
}

impl ExecutionSlot {
    /// Create a freshly admitted slot in PENDING
    pub fn new(app: AppKey, seq: u64, now_millis: i64) -> Self {
        Self {
            app,
            seq,
            state: SlotState::Pending,
            handle: None,
            started_at: None,
            last_active: now_millis,
            stop_cause: None,
            restart_after_exit: false,
        }
    }

    /// Create a slot already queued for restart (cold-start recovery and
    /// backoff waits survive without a live process behind them)
    pub fn queued_restart(app: AppKey, seq: u64, now_millis: i64) -> Self {
        let mut slot = Self::new(app, seq, now_millis);
        slot.state = SlotState::Restarting;
        slot
    }

    fn invalid(&self, to: SlotState) -> DomainError {
        DomainError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    /// PENDING -> RUNNING on successful spawn
    pub fn mark_running(&mut self, handle: SandboxHandle, now_millis: i64) -> Result<()> {
        if self.state != SlotState::Pending {
            return Err(self.invalid(SlotState::Running));
        }
        self.state = SlotState::Running;
        self.handle = Some(handle);
        self.started_at = Some(now_millis);
        self.last_active = now_millis;
        Ok(())
    }

    /// RUNNING -> STOPPING on stop request or eviction
    ///
    /// A second stop on an already-STOPPING slot is a no-op (returns false).
    pub fn mark_stopping(&mut self, cause: StopCause) -> Result<bool> {
        match self.state {
            SlotState::Running => {
                self.state = SlotState::Stopping;
                self.stop_cause = Some(cause);
                Ok(true)
            }
            SlotState::Stopping => Ok(false),
            _ => Err(self.invalid(SlotState::Stopping)),
        }
    }

    /// RUNNING/STOPPING -> EXITED on adapter exit notification,
    /// PENDING -> EXITED on spawn failure. Releases the handle.
    pub fn mark_exited(&mut self) -> Result<()> {
        match self.state {
            SlotState::Pending | SlotState::Running | SlotState::Stopping => {
                self.state = SlotState::Exited;
                self.handle = None;
                Ok(())
            }
            _ => Err(self.invalid(SlotState::Exited)),
        }
    }

    /// EXITED -> RESTARTING while the backoff timer is armed
    pub fn mark_restarting(&mut self) -> Result<()> {
        if self.state != SlotState::Exited {
            return Err(self.invalid(SlotState::Restarting));
        }
        self.state = SlotState::Restarting;
        Ok(())
    }

    /// Any state -> TERMINATED (explicit deletion or admin kill)
    pub fn mark_terminated(&mut self) {
        self.state = SlotState::Terminated;
        self.handle = None;
    }

    /// Live slots hold (or are about to hold) a sandbox process and count
    /// against the tenant quota. Queued RESTARTING slots do not.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            SlotState::Pending | SlotState::Running | SlotState::Stopping
        )
    }

    /// A crash is an abnormal end while RUNNING; an exit that follows a
    /// STOPPING transition is a clean stop regardless of the exit code.
    pub fn exit_is_crash(&self, clean_exit: bool) -> bool {
        self.state == SlotState::Running && !clean_exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> ExecutionSlot {
        ExecutionSlot::new(AppKey::new("tenant-1", "app-a"), 1, 1000)
    }

    fn handle() -> SandboxHandle {
        SandboxHandle { id: 7, pid: 4242 }
    }

    #[test]
    fn full_lifecycle() {
        let mut s = slot();
        assert_eq!(s.state, SlotState::Pending);

        s.mark_running(handle(), 2000).unwrap();
        assert_eq!(s.state, SlotState::Running);
        assert_eq!(s.started_at, Some(2000));

        assert!(s.mark_stopping(StopCause::User).unwrap());
        s.mark_exited().unwrap();
        assert_eq!(s.state, SlotState::Exited);
        assert!(s.handle.is_none());
    }

    #[test]
    fn double_stop_is_noop() {
        let mut s = slot();
        s.mark_running(handle(), 2000).unwrap();
        assert!(s.mark_stopping(StopCause::User).unwrap());
        assert!(!s.mark_stopping(StopCause::User).unwrap());
        assert_eq!(s.stop_cause, Some(StopCause::User));
    }

    #[test]
    fn spawn_failure_exits_from_pending() {
        let mut s = slot();
        s.mark_exited().unwrap();
        assert_eq!(s.state, SlotState::Exited);
    }

    #[test]
    fn cannot_run_twice() {
        let mut s = slot();
        s.mark_running(handle(), 2000).unwrap();
        let err = s.mark_running(handle(), 3000).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidStateTransition { .. }
        ));
    }

    #[test]
    fn crash_classification() {
        let mut s = slot();
        s.mark_running(handle(), 2000).unwrap();
        // abnormal exit while RUNNING is a crash
        assert!(s.exit_is_crash(false));
        // clean exit while RUNNING is not
        assert!(!s.exit_is_crash(true));

        s.mark_stopping(StopCause::User).unwrap();
        // exit after STOPPING is never a crash
        assert!(!s.exit_is_crash(false));
    }

    #[test]
    fn terminated_from_any_state() {
        let mut s = slot();
        s.mark_running(handle(), 2000).unwrap();
        s.mark_terminated();
        assert_eq!(s.state, SlotState::Terminated);
        assert!(!s.is_live());
    }

    #[test]
    fn liveness_by_state() {
        let mut s = slot();
        assert!(s.is_live()); // PENDING counts against quota
        s.mark_running(handle(), 2000).unwrap();
        assert!(s.is_live());
        s.mark_stopping(StopCause::User).unwrap();
        assert!(s.is_live()); // still holds the process
        s.mark_exited().unwrap();
        assert!(!s.is_live());
        s.mark_restarting().unwrap();
        assert!(!s.is_live()); // queued, not counted
    }
}
