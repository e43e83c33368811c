// Per-process usage probe backed by sysinfo

use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::debug;

use hostbay_core::port::UsageSnapshot;

/// Samples one process's resource usage
///
/// Holds a shared System so consecutive samples can derive CPU percentages
/// from the previous refresh.
pub struct ProcessUsageProbe {
    system: Mutex<System>,
}

impl ProcessUsageProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Sample the process; None if it no longer exists
    pub fn sample(&self, pid: i32) -> Option<UsageSnapshot> {
        let mut system = self.system.lock().unwrap();
        let sys_pid = Pid::from_u32(pid as u32);
        system.refresh_process_specifics(sys_pid, ProcessRefreshKind::everything());

        let process = system.process(sys_pid)?;
        let snapshot = UsageSnapshot {
            cpu_usage_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            uptime_secs: process.run_time(),
        };

        debug!(
            pid,
            cpu = snapshot.cpu_usage_percent,
            memory_bytes = snapshot.memory_bytes,
            "Process usage sampled"
        );
        Some(snapshot)
    }
}

impl Default for ProcessUsageProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_own_process() {
        let probe = ProcessUsageProbe::new();
        let snapshot = probe.sample(std::process::id() as i32).unwrap();
        assert!(snapshot.memory_bytes > 0);
    }

    #[test]
    fn unknown_pid_is_none() {
        let probe = ProcessUsageProbe::new();
        // PIDs this large do not exist on any sane system
        assert!(probe.sample(i32::MAX - 1).is_none());
    }
}
