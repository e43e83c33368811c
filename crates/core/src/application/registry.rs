// Tenant Registry - admission control and quota ledger
//
// Advisory gates consulted by the supervisor before every spawn. The
// registry never spawns or kills anything; it only answers "may this tenant
// hold one more slot right now" and keeps the counters that back the answer.
// Decision and counter update happen under one lock acquisition so two
// concurrent admissions for the same tenant cannot both squeeze past the
// quota.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{Tenant, TenantId};
use crate::port::TimeProvider;

/// Admission denial reasons - recoverable, reported to the user, no state change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Concurrency quota exceeded: {live} of {quota} slots in use")]
    QuotaExceeded { live: usize, quota: usize },

    #[error("Rate limited: retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: i64 },

    #[error("Tenant is deactivated")]
    Suspended,
}

struct LedgerEntry {
    quota_override: Option<usize>,
    admin: bool,
    active: bool,
    live_slots: usize,
    submissions: VecDeque<i64>, // epoch ms, pruned to the window
    last_submission_at: i64,
    created_at: i64,
}

impl LedgerEntry {
    fn new(admin: bool, now: i64) -> Self {
        Self {
            quota_override: None,
            admin,
            active: true,
            live_slots: 0,
            submissions: VecDeque::new(),
            last_submission_at: 0,
            created_at: now,
        }
    }
}

/// Per-tenant bookkeeping: live-slot counts and submission timestamps
pub struct TenantRegistry {
    time_provider: Arc<dyn TimeProvider>,
    default_quota: usize,
    submit_window_ms: i64,
    submit_max: usize,
    ledger: Mutex<HashMap<TenantId, LedgerEntry>>,
}

impl TenantRegistry {
    pub fn new(
        time_provider: Arc<dyn TimeProvider>,
        default_quota: usize,
        submit_window_ms: i64,
        submit_max: usize,
    ) -> Self {
        Self {
            time_provider,
            default_quota,
            submit_window_ms,
            submit_max,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    /// Create the tenant's ledger entry on first interaction.
    /// Returns true if the tenant was not known before.
    pub fn ensure_tenant(&self, tenant: &str, admin: bool) -> bool {
        let now = self.time_provider.now_millis();
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(entry) = ledger.get_mut(tenant) {
            // admin set may have changed in configuration between restarts
            entry.admin = admin;
            false
        } else {
            ledger.insert(tenant.to_string(), LedgerEntry::new(admin, now));
            true
        }
    }

    /// Seed a ledger entry from a persisted tenant record
    pub fn import(&self, tenant: &Tenant, admin: bool) {
        let mut ledger = self.ledger.lock().unwrap();
        let entry = ledger
            .entry(tenant.id.clone())
            .or_insert_with(|| LedgerEntry::new(admin, tenant.created_at));
        entry.quota_override = tenant.quota_override;
        entry.active = tenant.active;
        entry.admin = admin || tenant.admin;
    }

    /// Export the tenant's current record for persistence
    pub fn export(&self, tenant: &str) -> Option<Tenant> {
        let ledger = self.ledger.lock().unwrap();
        ledger.get(tenant).map(|e| Tenant {
            id: tenant.to_string(),
            quota_override: e.quota_override,
            admin: e.admin,
            active: e.active,
            created_at: e.created_at,
        })
    }

    pub fn is_admin(&self, tenant: &str) -> bool {
        self.ledger
            .lock()
            .unwrap()
            .get(tenant)
            .map(|e| e.admin)
            .unwrap_or(false)
    }

    /// Deactivate a tenant: denied admission from now on, records kept
    pub fn deactivate(&self, tenant: &str) {
        if let Some(entry) = self.ledger.lock().unwrap().get_mut(tenant) {
            entry.active = false;
        }
    }

    /// Override a tenant's concurrency quota (admin operation)
    pub fn set_quota(&self, tenant: &str, quota: Option<usize>) {
        if let Some(entry) = self.ledger.lock().unwrap().get_mut(tenant) {
            entry.quota_override = quota;
        }
    }

    /// Atomic admission check: one more live slot for this tenant?
    ///
    /// On success the live-slot counter is already incremented when this
    /// returns; the caller owns the slot until it calls `release`.
    pub fn admit(&self, tenant: &str, app: &str) -> Result<(), AdmissionError> {
        let mut ledger = self.ledger.lock().unwrap();
        let entry = ledger
            .entry(tenant.to_string())
            .or_insert_with(|| LedgerEntry::new(false, self.time_provider.now_millis()));

        if !entry.active {
            return Err(AdmissionError::Suspended);
        }

        let quota = entry.quota_override.unwrap_or(self.default_quota);
        if !entry.admin && entry.live_slots >= quota {
            debug!(tenant = %tenant, app = %app, live = entry.live_slots, quota, "Admission denied");
            return Err(AdmissionError::QuotaExceeded {
                live: entry.live_slots,
                quota,
            });
        }

        entry.live_slots += 1;
        Ok(())
    }

    /// Release a slot previously granted by `admit`
    pub fn release(&self, tenant: &str, app: &str) {
        let mut ledger = self.ledger.lock().unwrap();
        match ledger.get_mut(tenant) {
            Some(entry) if entry.live_slots > 0 => entry.live_slots -= 1,
            Some(_) => warn!(tenant = %tenant, app = %app, "Release without matching admit"),
            None => warn!(tenant = %tenant, app = %app, "Release for unknown tenant"),
        }
    }

    /// Sliding-window submission rate limit
    pub fn record_submission(&self, tenant: &str) -> Result<(), AdmissionError> {
        let now = self.time_provider.now_millis();
        let mut ledger = self.ledger.lock().unwrap();
        let entry = ledger
            .entry(tenant.to_string())
            .or_insert_with(|| LedgerEntry::new(false, now));

        if !entry.active {
            return Err(AdmissionError::Suspended);
        }

        let window_start = now - self.submit_window_ms;
        while entry
            .submissions
            .front()
            .is_some_and(|&t| t <= window_start)
        {
            entry.submissions.pop_front();
        }

        if !entry.admin && entry.submissions.len() >= self.submit_max {
            let oldest = *entry.submissions.front().unwrap_or(&now);
            return Err(AdmissionError::RateLimited {
                retry_after_ms: (oldest + self.submit_window_ms - now).max(0),
            });
        }

        entry.submissions.push_back(now);
        entry.last_submission_at = now;
        Ok(())
    }

    pub fn live_slots(&self, tenant: &str) -> usize {
        self.ledger
            .lock()
            .unwrap()
            .get(tenant)
            .map(|e| e.live_slots)
            .unwrap_or(0)
    }

    /// When the tenant last submitted anything (eviction fairness input)
    pub fn last_submission(&self, tenant: &str) -> i64 {
        self.ledger
            .lock()
            .unwrap()
            .get(tenant)
            .map(|e| e.last_submission_at)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::time_provider::mocks::ManualClock;
    use crate::port::time_provider::SystemTimeProvider;

    fn registry(quota: usize, window_ms: i64, max: usize) -> (Arc<TenantRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let reg = Arc::new(TenantRegistry::new(
            clock.clone(),
            quota,
            window_ms,
            max,
        ));
        (reg, clock)
    }

    #[test]
    fn admit_until_quota_then_deny() {
        let (reg, _) = registry(2, 60_000, 100);
        reg.admit("t1", "a").unwrap();
        reg.admit("t1", "b").unwrap();
        let err = reg.admit("t1", "c").unwrap_err();
        assert_eq!(err, AdmissionError::QuotaExceeded { live: 2, quota: 2 });

        reg.release("t1", "a");
        reg.admit("t1", "c").unwrap();
    }

    #[test]
    fn quotas_are_per_tenant() {
        let (reg, _) = registry(1, 60_000, 100);
        reg.admit("t1", "a").unwrap();
        reg.admit("t2", "a").unwrap();
        assert!(reg.admit("t1", "b").is_err());
        assert_eq!(reg.live_slots("t2"), 1);
    }

    #[test]
    fn sliding_window_rate_limit() {
        let (reg, clock) = registry(10, 10_000, 2);
        reg.record_submission("t1").unwrap();
        reg.record_submission("t1").unwrap();
        let err = reg.record_submission("t1").unwrap_err();
        assert!(matches!(err, AdmissionError::RateLimited { .. }));

        // window slides: the first submission ages out
        clock.advance(10_001);
        reg.record_submission("t1").unwrap();
    }

    #[test]
    fn deactivated_tenant_is_suspended() {
        let (reg, _) = registry(2, 60_000, 100);
        reg.ensure_tenant("t1", false);
        reg.deactivate("t1");
        assert_eq!(reg.admit("t1", "a").unwrap_err(), AdmissionError::Suspended);
        assert_eq!(
            reg.record_submission("t1").unwrap_err(),
            AdmissionError::Suspended
        );
    }

    #[test]
    fn admin_bypasses_quota_and_rate_limit() {
        let (reg, _) = registry(1, 10_000, 1);
        reg.ensure_tenant("boss", true);
        reg.admit("boss", "a").unwrap();
        reg.admit("boss", "b").unwrap();
        reg.record_submission("boss").unwrap();
        reg.record_submission("boss").unwrap();
    }

    #[test]
    fn quota_override_wins_over_default() {
        let (reg, _) = registry(1, 60_000, 100);
        reg.ensure_tenant("t1", false);
        reg.set_quota("t1", Some(3));
        reg.admit("t1", "a").unwrap();
        reg.admit("t1", "b").unwrap();
        reg.admit("t1", "c").unwrap();
        assert!(reg.admit("t1", "d").is_err());
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_quota() {
        // Spec property: K concurrent submissions against quota Q admit
        // exactly min(K, Q), never more
        let reg = Arc::new(TenantRegistry::new(
            Arc::new(SystemTimeProvider),
            4,
            60_000,
            1_000,
        ));

        let mut handles = vec![];
        for i in 0..16 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.admit("t1", &format!("app-{i}")).is_ok()
            }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 4);
        assert_eq!(reg.live_slots("t1"), 4);
    }
}
