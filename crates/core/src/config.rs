// Supervisor Configuration Surface
//
// Defaults live here; the daemon overrides them from HOSTBAY_* environment
// variables at the composition root.

use std::collections::HashSet;
use std::time::Duration;

use crate::domain::TenantId;
use crate::port::sandbox::ResourceLimits;

/// Everything the supervisor core needs to know, resolved before startup
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Default max simultaneously running apps per tenant
    pub tenant_quota: usize,

    /// Submission rate limit: at most `submit_max` submissions per window
    pub submit_window: Duration,
    pub submit_max: usize,

    /// Per-app resource limits handed to the sandbox at spawn time
    pub limits: ResourceLimits,

    /// Crash-restart backoff ladder: base * 2^n, capped
    pub restart_base_delay_ms: i64,
    pub restart_max_delay_ms: i64,

    /// A run at least this long resets the backoff ladder
    pub clean_run_threshold_ms: i64,

    /// Ceiling on total concurrent slots across all tenants; eviction
    /// kicks in at this point
    pub global_slot_ceiling: usize,

    /// How long a STOPPING slot gets before the forced kill
    pub grace_period: Duration,

    /// Tenants with elevated privilege, supplied by external configuration
    pub admin_tenants: HashSet<TenantId>,

    /// Per-tenant outbound queue bound (events, not bytes)
    pub outbox_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tenant_quota: 6,
            submit_window: Duration::from_secs(60),
            submit_max: 10,
            limits: ResourceLimits::default(),
            restart_base_delay_ms: 1_000,
            restart_max_delay_ms: 8_000,
            clean_run_threshold_ms: 30_000,
            global_slot_ceiling: 64,
            grace_period: Duration::from_secs(5),
            admin_tenants: HashSet::new(),
            outbox_capacity: 256,
        }
    }
}

impl SupervisorConfig {
    pub fn is_admin(&self, tenant: &str) -> bool {
        self.admin_tenants.contains(tenant)
    }
}
