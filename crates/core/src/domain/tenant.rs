// Tenant Domain Model

use serde::{Deserialize, Serialize};

/// Tenant identity key (chat-layer user id, opaque to the core)
pub type TenantId = String;

/// Tenant Entity
///
/// Created on first interaction; never deleted, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,

    /// Per-tenant concurrency quota; None falls back to the configured default
    pub quota_override: Option<usize>,

    /// Administrative tenants may force-kill any app and bypass quotas
    pub admin: bool,

    /// Deactivated tenants are denied admission but keep their records
    pub active: bool,

    pub created_at: i64, // epoch ms
}

impl Tenant {
    /// Create a new Tenant
    ///
    /// # Arguments
    ///
    /// * `id` - Tenant identity key (injected by the transport layer)
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    pub fn new(id: impl Into<TenantId>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            quota_override: None,
            admin: false,
            active: true,
            created_at,
        }
    }

    /// Effective concurrency quota given the configured default
    pub fn quota(&self, default_quota: usize) -> usize {
        self.quota_override.unwrap_or(default_quota)
    }
}
