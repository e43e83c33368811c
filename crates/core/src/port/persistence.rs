// Persistence Gateway Port
// Durable storage for app metadata and sources, independent of the
// supervisor's own (ephemeral) filesystem. The supervisor tolerates this
// gateway failing: saves are queued and retried, the in-memory state stays
// authoritative.

use async_trait::async_trait;

use crate::domain::{App, AppKey, AppSource, Tenant};
use crate::error::Result;

/// Gateway interface for durable app/tenant state
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Insert or update one app's metadata row
    async fn save_app_meta(&self, app: &App) -> Result<()>;

    /// Load every persisted app (cold-start recovery)
    async fn load_all_app_meta(&self) -> Result<Vec<App>>;

    /// Store the submitted source payload
    async fn save_app_source(&self, key: &AppKey, source: &AppSource) -> Result<()>;

    /// Fetch a source payload; None if never saved or already deleted
    async fn load_app_source(&self, key: &AppKey) -> Result<Option<AppSource>>;

    /// Remove an app's metadata and source (explicit user deletion)
    async fn delete_app(&self, key: &AppKey) -> Result<()>;

    /// Insert or update a tenant record
    async fn save_tenant(&self, tenant: &Tenant) -> Result<()>;

    /// Load every tenant record
    async fn load_all_tenants(&self) -> Result<Vec<Tenant>>;
}

// ============================================================================
// In-Memory Implementation for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryState {
        apps: HashMap<AppKey, App>,
        sources: HashMap<AppKey, AppSource>,
        tenants: HashMap<String, Tenant>,
    }

    /// In-memory gateway for tests
    ///
    /// `set_failing(true)` makes every call error, which is how tests drive
    /// the supervisor's degraded (non-durable) mode and the retry queue.
    pub struct InMemoryGateway {
        state: Mutex<MemoryState>,
        failing: AtomicBool,
        save_count: AtomicU64,
    }

    impl InMemoryGateway {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(MemoryState::default()),
                failing: AtomicBool::new(false),
                save_count: AtomicU64::new(0),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn save_count(&self) -> u64 {
            self.save_count.load(Ordering::SeqCst)
        }

        /// Seed an app row directly (recovery tests)
        pub fn preload_app(&self, app: App, source: AppSource) {
            let mut state = self.state.lock().unwrap();
            state.sources.insert(app.key.clone(), source);
            state.apps.insert(app.key.clone(), app);
        }

        pub fn app_meta(&self, key: &AppKey) -> Option<App> {
            self.state.lock().unwrap().apps.get(key).cloned()
        }

        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(AppError::Persistence("in-memory gateway failing".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl Default for InMemoryGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl PersistenceGateway for InMemoryGateway {
        async fn save_app_meta(&self, app: &App) -> Result<()> {
            self.check()?;
            self.save_count.fetch_add(1, Ordering::SeqCst);
            self.state
                .lock()
                .unwrap()
                .apps
                .insert(app.key.clone(), app.clone());
            Ok(())
        }

        async fn load_all_app_meta(&self) -> Result<Vec<App>> {
            self.check()?;
            Ok(self.state.lock().unwrap().apps.values().cloned().collect())
        }

        async fn save_app_source(&self, key: &AppKey, source: &AppSource) -> Result<()> {
            self.check()?;
            self.state
                .lock()
                .unwrap()
                .sources
                .insert(key.clone(), source.clone());
            Ok(())
        }

        async fn load_app_source(&self, key: &AppKey) -> Result<Option<AppSource>> {
            self.check()?;
            Ok(self.state.lock().unwrap().sources.get(key).cloned())
        }

        async fn delete_app(&self, key: &AppKey) -> Result<()> {
            self.check()?;
            let mut state = self.state.lock().unwrap();
            state.apps.remove(key);
            state.sources.remove(key);
            Ok(())
        }

        async fn save_tenant(&self, tenant: &Tenant) -> Result<()> {
            self.check()?;
            self.state
                .lock()
                .unwrap()
                .tenants
                .insert(tenant.id.clone(), tenant.clone());
            Ok(())
        }

        async fn load_all_tenants(&self) -> Result<Vec<Tenant>> {
            self.check()?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .tenants
                .values()
                .cloned()
                .collect())
        }
    }
}
