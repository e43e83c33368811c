// Supervisor - the orchestration loop
//
// Owns the canonical App -> ExecutionSlot map. Every state transition in
// the system happens on this single task; slot pump tasks and the sandbox
// adapter communicate with it only through notifications, so there is one
// mutation path and no torn reads. Event sources are drained in priority
// order: process exits first, then user commands, then timer expirations.

pub mod constants;
mod shutdown;
mod timers;

pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::backoff::RestartPolicy as BackoffPolicy;
use crate::application::command::{
    AppInfo, Command, CommandEnvelope, OutboundEvent, OutboundKind,
};
use crate::application::registry::{AdmissionError, TenantRegistry};
use crate::application::router::OutputRouter;
use crate::config::SupervisorConfig;
use crate::domain::{
    App, AppId, AppKey, AppSource, ExecutionSlot, ExitStatus, RestartPolicy, SlotState, StopCause,
    TenantId,
};
use crate::error::Result;
use crate::port::sandbox::{ExitResult, SignalKind, SpawnedApp};
use crate::port::{IdProvider, PersistenceGateway, SandboxAdapter, TimeProvider};

use constants::{
    COMMAND_CHANNEL_CAPACITY, IDLE_TIMER_HORIZON_SECS, PERSIST_RETRY_BASE_MS, PERSIST_RETRY_CAP_MS,
};
use timers::{TimerEvent, TimerQueue};

/// Exit notification from a slot pump task, tagged with the spawn
/// incarnation so notices from replaced slots are discarded
struct ExitNotice {
    key: AppKey,
    seq: u64,
    exit: ExitResult,
}

/// Durable writes that failed and wait for the retry timer
#[derive(Debug, Clone, PartialEq, Eq)]
enum PersistRecord {
    AppMeta(AppKey),
    AppSource(AppKey),
    Tenant(TenantId),
    DeleteApp(AppKey),
}

pub struct Supervisor {
    config: SupervisorConfig,
    backoff: BackoffPolicy,
    registry: Arc<TenantRegistry>,
    router: Arc<OutputRouter>,
    sandbox: Arc<dyn SandboxAdapter>,
    gateway: Arc<dyn PersistenceGateway>,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,

    apps: HashMap<AppKey, App>,
    slots: HashMap<AppKey, ExecutionSlot>,
    sources: HashMap<AppKey, AppSource>,
    seq_counter: u64,

    command_rx: Option<mpsc::Receiver<CommandEnvelope>>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    exit_rx: Option<mpsc::UnboundedReceiver<ExitNotice>>,

    timers: TimerQueue,
    /// Restarts that were admission-denied; retried as slots free up
    restart_queue: VecDeque<AppKey>,
    persist_queue: VecDeque<PersistRecord>,
    persist_retry_ms: i64,
    persist_retry_armed: bool,
    degraded: bool,
}

impl Supervisor {
    /// Build a supervisor and the command sender handed to the transport
    pub fn new(
        config: SupervisorConfig,
        sandbox: Arc<dyn SandboxAdapter>,
        gateway: Arc<dyn PersistenceGateway>,
        router: Arc<OutputRouter>,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    ) -> (Self, mpsc::Sender<CommandEnvelope>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(TenantRegistry::new(
            Arc::clone(&time_provider),
            config.tenant_quota,
            config.submit_window.as_millis() as i64,
            config.submit_max,
        ));
        let backoff = BackoffPolicy::new(
            config.restart_base_delay_ms,
            config.restart_max_delay_ms,
            config.clean_run_threshold_ms,
        );

        let supervisor = Self {
            config,
            backoff,
            registry,
            router,
            sandbox,
            gateway,
            time_provider,
            id_provider,
            apps: HashMap::new(),
            slots: HashMap::new(),
            sources: HashMap::new(),
            seq_counter: 0,
            command_rx: Some(command_rx),
            exit_tx,
            exit_rx: Some(exit_rx),
            timers: TimerQueue::new(),
            restart_queue: VecDeque::new(),
            persist_queue: VecDeque::new(),
            persist_retry_ms: PERSIST_RETRY_BASE_MS,
            persist_retry_armed: false,
            degraded: false,
        };
        (supervisor, command_tx)
    }

    pub fn registry(&self) -> Arc<TenantRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run the control loop until shutdown
    pub async fn run(mut self, mut shutdown: ShutdownToken) -> Result<()> {
        info!("Supervisor starting, restoring persisted state");
        self.restore().await;

        let mut exit_rx = self.exit_rx.take().expect("run called twice");
        let mut command_rx = self.command_rx.take().expect("run called twice");

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            let deadline = self
                .timers
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(IDLE_TIMER_HORIZON_SECS));

            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                Some(notice) = exit_rx.recv() => {
                    self.handle_exit(notice).await;
                }
                Some(envelope) = command_rx.recv() => {
                    self.handle_command(envelope).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.fire_due_timers().await;
                }
            }
        }

        info!("Supervisor stopping");
        self.shutdown_all().await;
        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        self.seq_counter += 1;
        self.seq_counter
    }

    // ------------------------------------------------------------------
    // Cold-start recovery
    // ------------------------------------------------------------------

    /// Load persisted tenants and apps; re-admit anything that was live.
    /// The prior slot's liveness cannot be trusted after a supervisor
    /// restart, so revived apps go through the crash backoff ladder.
    async fn restore(&mut self) {
        let tenants = self.gateway.load_all_tenants().await;
        match tenants {
            Ok(tenants) => {
                for tenant in &tenants {
                    self.registry.import(tenant, self.config.is_admin(&tenant.id));
                }
                debug!(count = tenants.len(), "Tenants restored");
            }
            Err(e) => {
                warn!(error = %e, "Tenant restore failed, continuing without persisted tenants");
            }
        }

        let apps = self.gateway.load_all_app_meta().await;
        let apps = match apps {
            Ok(apps) => apps,
            Err(e) => {
                error!(error = %e, "App restore failed; starting empty in degraded mode");
                self.arm_persist_retry();
                return;
            }
        };

        let now = self.time_provider.now_millis();
        let mut revived = 0usize;
        for mut app in apps {
            let key = app.key.clone();
            let mut changed = false;
            match app.last_state {
                SlotState::Running | SlotState::Pending | SlotState::Restarting => {
                    let delay = self.backoff.delay_for(app.crash_backoff);
                    app.crash_backoff += 1;
                    app.last_state = SlotState::Restarting;
                    let seq = self.next_seq();
                    self.slots
                        .insert(key.clone(), ExecutionSlot::queued_restart(key.clone(), seq, now));
                    self.timers.schedule_in(
                        Duration::from_millis(delay as u64),
                        TimerEvent::BackoffExpired { key: key.clone() },
                    );
                    info!(app = %key, delay_ms = delay, "Recovered app scheduled for restart");
                    revived += 1;
                    changed = true;
                }
                SlotState::Stopping => {
                    // a stop was in flight when the supervisor died; honor it
                    app.last_state = SlotState::Exited;
                    changed = true;
                }
                _ => {}
            }
            self.apps.insert(key.clone(), app);
            if changed {
                self.persist_app_meta(&key).await;
            }
        }
        info!(apps = self.apps.len(), revived, "App metadata restored");
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, envelope: CommandEnvelope) {
        let tenant = envelope.tenant;
        if self
            .registry
            .ensure_tenant(&tenant, self.config.is_admin(&tenant))
        {
            self.persist_tenant(&tenant).await;
        }

        match envelope.command {
            Command::Submit {
                app,
                entry_point,
                source,
                policy,
            } => {
                self.handle_submit(tenant, app, entry_point, source, policy)
                    .await;
            }
            Command::Stop { app, owner } => {
                if let Some(key) = self.resolve_target(&tenant, app, owner) {
                    self.handle_stop(key, StopCause::User).await;
                }
            }
            Command::Restart { app, owner } => {
                if let Some(key) = self.resolve_target(&tenant, app, owner) {
                    self.handle_restart(key).await;
                }
            }
            Command::Delete { app, owner } => {
                if let Some(key) = self.resolve_target(&tenant, app, owner) {
                    self.handle_delete(key).await;
                }
            }
            Command::SendInput { app, input } => {
                let key = AppKey::new(tenant, app);
                self.handle_send_input(key, input).await;
            }
            Command::ListApps => self.handle_list(&tenant),
            Command::Inspect { app, owner } => {
                if let Some(key) = self.resolve_target(&tenant, app, owner) {
                    self.handle_inspect(&tenant, key).await;
                }
            }
            Command::StopAll => self.handle_stop_all(&tenant).await,
        }
    }

    /// Resolve a command target, enforcing ownership: only administrators
    /// may address another tenant's app.
    fn resolve_target(
        &self,
        issuer: &TenantId,
        app: AppId,
        owner: Option<TenantId>,
    ) -> Option<AppKey> {
        let owner = match owner {
            Some(o) if o != *issuer => {
                if !self.config.is_admin(issuer) {
                    self.emit_error(issuer, Some(app), "administrator privilege required");
                    return None;
                }
                o
            }
            Some(o) => o,
            None => issuer.clone(),
        };
        let key = AppKey::new(owner, app);
        if !self.apps.contains_key(&key) {
            self.emit_error(issuer, Some(key.app.clone()), &format!("unknown app: {}", key.app));
            return None;
        }
        Some(key)
    }

    async fn handle_submit(
        &mut self,
        tenant: TenantId,
        app: Option<AppId>,
        entry_point: Option<String>,
        source: String,
        policy: RestartPolicy,
    ) {
        // Admission gates first: a denied submission leaves no state behind
        if let Err(e) = self.registry.record_submission(&tenant) {
            self.emit_error(&tenant, app, &e.to_string());
            return;
        }

        let app_id = app.unwrap_or_else(|| self.id_provider.generate_id());
        let key = AppKey::new(tenant.clone(), app_id.clone());
        if self.apps.contains_key(&key) {
            self.emit_error(
                &tenant,
                Some(app_id),
                "app already exists; delete it first or pick another name",
            );
            return;
        }

        self.relieve_pressure().await;

        if let Err(e) = self.registry.admit(&tenant, &app_id) {
            self.emit_error(&tenant, Some(app_id), &e.to_string());
            return;
        }

        let now = self.time_provider.now_millis();
        let entry_point = entry_point.unwrap_or_else(|| format!("{app_id}.py"));
        let app_entity = App::new(key.clone(), entry_point.clone(), policy, now);
        let app_source = AppSource {
            entry_point,
            bytes: source.into_bytes(),
        };
        self.apps.insert(key.clone(), app_entity);
        self.sources.insert(key.clone(), app_source);
        self.persist_source(&key).await;

        info!(app = %key, "App submitted");
        self.spawn_slot(key).await;
    }

    async fn handle_stop(&mut self, key: AppKey, cause: StopCause) {
        let state = match self.slots.get(&key) {
            Some(slot) => slot.state,
            None => {
                self.emit_error(&key.tenant, Some(key.app.clone()), "app is not running");
                return;
            }
        };

        match state {
            SlotState::Running => {
                let (handle, seq) = {
                    let slot = self.slots.get_mut(&key).expect("checked above");
                    if let Err(e) = slot.mark_stopping(cause) {
                        error!(app = %key, error = %e, "Stop transition rejected");
                        return;
                    }
                    (slot.handle.clone(), slot.seq)
                };

                self.emit_state(&key, SlotState::Running, SlotState::Stopping, None);
                if let Some(app) = self.apps.get_mut(&key) {
                    app.last_state = SlotState::Stopping;
                }

                if let Some(handle) = handle {
                    let signalled = self.sandbox.signal(&handle, SignalKind::Terminate).await;
                    if let Err(e) = signalled {
                        warn!(app = %key, error = %e, "Graceful terminate failed, escalating");
                        let _ = self.sandbox.signal(&handle, SignalKind::Kill).await;
                    }
                }

                self.timers.schedule_in(
                    self.config.grace_period,
                    TimerEvent::GraceExpired {
                        key: key.clone(),
                        seq,
                    },
                );
                self.persist_app_meta(&key).await;
            }
            // a second stop on a STOPPING slot is a no-op
            SlotState::Stopping => {}
            SlotState::Restarting => {
                // cancel the queued restart; the backoff timer will fire
                // into nothing
                self.slots.remove(&key);
                if let Some(app) = self.apps.get_mut(&key) {
                    app.last_state = SlotState::Exited;
                }
                self.emit_state(
                    &key,
                    SlotState::Restarting,
                    SlotState::Exited,
                    Some("restart cancelled".to_string()),
                );
                self.persist_app_meta(&key).await;
            }
            _ => {
                self.emit_error(&key.tenant, Some(key.app.clone()), "app is not running");
            }
        }
    }

    async fn handle_restart(&mut self, key: AppKey) {
        match self.slots.get(&key).map(|s| s.state) {
            Some(SlotState::Running) => {
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.restart_after_exit = true;
                }
                self.handle_stop(key, StopCause::User).await;
            }
            Some(SlotState::Stopping) => {
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.restart_after_exit = true;
                }
            }
            Some(SlotState::Restarting) => {
                // skip the remaining backoff wait
                self.timers
                    .schedule_in(Duration::ZERO, TimerEvent::BackoffExpired { key });
            }
            _ => {
                // not running: start fresh; an explicit restart resets the ladder
                if let Err(e) = self.registry.admit(&key.tenant, &key.app) {
                    self.emit_error(&key.tenant, Some(key.app.clone()), &e.to_string());
                    return;
                }
                if let Some(app) = self.apps.get_mut(&key) {
                    app.crash_backoff = 0;
                }
                self.spawn_slot(key).await;
            }
        }
    }

    async fn handle_delete(&mut self, key: AppKey) {
        let prior = self.slots.get(&key).map(|s| s.state);
        if let Some(mut slot) = self.slots.remove(&key) {
            let was_live = slot.is_live();
            let handle = slot.handle.clone();
            slot.mark_terminated();
            if was_live {
                self.registry.release(&key.tenant, &key.app);
                if let Some(handle) = handle {
                    let _ = self.sandbox.signal(&handle, SignalKind::Kill).await;
                }
            }
        }

        self.apps.remove(&key);
        self.sources.remove(&key);
        self.router.forget(&key);

        let deleted = self.gateway.delete_app(&key).await;
        if let Err(e) = deleted {
            warn!(app = %key, error = %e, "Failed to delete persisted app; queuing");
            self.queue_persist(PersistRecord::DeleteApp(key.clone()));
        }

        self.emit_state(
            &key,
            prior.unwrap_or(SlotState::Exited),
            SlotState::Terminated,
            Some("deleted".to_string()),
        );
        info!(app = %key, "App deleted");
        self.drain_restart_queue().await;
    }

    async fn handle_send_input(&mut self, key: AppKey, input: String) {
        if !self.apps.contains_key(&key) {
            self.emit_error(&key.tenant, Some(key.app.clone()), &format!("unknown app: {}", key.app));
            return;
        }
        let handle = match self.slots.get(&key) {
            Some(slot) if slot.state == SlotState::Running => slot.handle.clone(),
            _ => None,
        };
        let Some(handle) = handle else {
            self.emit_error(&key.tenant, Some(key.app.clone()), "app is not running");
            return;
        };

        // chat input arrives line-wise; the process reads lines
        let mut bytes = input.into_bytes();
        if bytes.last() != Some(&b'\n') {
            bytes.push(b'\n');
        }

        let sent = self.sandbox.send_input(&handle, &bytes).await;
        if let Err(e) = sent {
            self.emit_error(&key.tenant, Some(key.app.clone()), &format!("input failed: {e}"));
            return;
        }
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.last_active = self.time_provider.now_millis();
        }
    }

    fn handle_list(&self, tenant: &TenantId) {
        let mut apps: Vec<AppInfo> = self
            .apps
            .values()
            .filter(|a| a.key.tenant == *tenant)
            .map(|a| AppInfo {
                app: a.key.app.clone(),
                state: self
                    .slots
                    .get(&a.key)
                    .map(|s| s.state)
                    .unwrap_or(a.last_state)
                    .to_string(),
                policy: a.policy.to_string(),
                restart_count: a.restart_count,
                created_at: a.created_at,
                last_exit: a.last_exit.map(|e| e.to_string()),
            })
            .collect();
        apps.sort_by(|x, y| x.app.cmp(&y.app));

        self.router.publish(OutboundEvent {
            tenant: tenant.clone(),
            app: None,
            kind: OutboundKind::AppList { apps },
        });
    }

    async fn handle_inspect(&mut self, issuer: &TenantId, key: AppKey) {
        let handle = match self.slots.get(&key) {
            Some(slot) if slot.state == SlotState::Running => slot.handle.clone(),
            _ => None,
        };
        let Some(handle) = handle else {
            self.emit_error(issuer, Some(key.app.clone()), "app is not running");
            return;
        };

        let snapshot = self.sandbox.usage_snapshot(&handle).await;
        match snapshot {
            Ok(usage) => self.router.publish(OutboundEvent {
                tenant: issuer.clone(),
                app: Some(key.app.clone()),
                kind: OutboundKind::AppStats {
                    cpu_usage_percent: usage.cpu_usage_percent,
                    memory_bytes: usage.memory_bytes,
                    uptime_secs: usage.uptime_secs,
                },
            }),
            Err(e) => {
                self.emit_error(issuer, Some(key.app.clone()), &format!("usage unavailable: {e}"));
            }
        }
    }

    async fn handle_stop_all(&mut self, issuer: &TenantId) {
        if !self.config.is_admin(issuer) {
            self.emit_error(issuer, None, "administrator privilege required");
            return;
        }
        let keys: Vec<AppKey> = self
            .slots
            .iter()
            .filter(|(_, s)| s.is_live())
            .map(|(k, _)| k.clone())
            .collect();
        info!(count = keys.len(), admin = %issuer, "Stop-all requested");
        for key in keys {
            self.handle_stop(key, StopCause::User).await;
        }
    }

    // ------------------------------------------------------------------
    // Slot lifecycle
    // ------------------------------------------------------------------

    /// Spawn a slot for an app whose quota admission is already held.
    /// Releases the admission on any failure path.
    async fn spawn_slot(&mut self, key: AppKey) {
        if self.slots.get(&key).is_some_and(|s| s.is_live()) {
            // Invariant: at most one live slot per app. Halt this app's
            // handling, never the supervisor.
            error!(app = %key, "Duplicate execution slot detected, refusing spawn");
            self.registry.release(&key.tenant, &key.app);
            self.emit_error(
                &key.tenant,
                Some(key.app.clone()),
                "internal error: duplicate execution slot",
            );
            return;
        }

        let seq = self.next_seq();
        let now = self.time_provider.now_millis();
        let mut slot = ExecutionSlot::new(key.clone(), seq, now);

        let Some(source) = self.load_source(&key).await else {
            self.fail_spawn(key, "stored source unavailable").await;
            return;
        };

        let spawned = self.sandbox.spawn(&source, &self.config.limits).await;
        let spawned = match spawned {
            Ok(s) => s,
            Err(e) => {
                self.fail_spawn(key, &e.to_string()).await;
                return;
            }
        };

        let pid = spawned.handle.pid;
        if let Err(e) = slot.mark_running(spawned.handle.clone(), now) {
            error!(app = %key, error = %e, "Fresh slot rejected RUNNING transition");
            return;
        }
        self.slots.insert(key.clone(), slot);
        if let Some(app) = self.apps.get_mut(&key) {
            app.restart_count += 1;
            app.last_state = SlotState::Running;
        }

        self.spawn_pump(key.clone(), seq, spawned);
        self.emit_state(
            &key,
            SlotState::Pending,
            SlotState::Running,
            Some(format!("pid {pid}")),
        );
        info!(app = %key, pid, "App running");
        self.persist_app_meta(&key).await;
    }

    /// Spawn failed: EXITED(spawn-failed), no auto-restart
    async fn fail_spawn(&mut self, key: AppKey, reason: &str) {
        warn!(app = %key, reason, "Spawn failed");
        self.registry.release(&key.tenant, &key.app);
        if let Some(app) = self.apps.get_mut(&key) {
            app.last_exit = Some(ExitStatus::SpawnFailed);
            app.last_state = SlotState::Exited;
        }
        self.emit_state(
            &key,
            SlotState::Pending,
            SlotState::Exited,
            Some("spawn-failed".to_string()),
        );
        self.emit_error(
            &key.tenant,
            Some(key.app.clone()),
            &format!("failed to start: {reason}"),
        );
        self.persist_app_meta(&key).await;
    }

    /// Forward output to the router and the exit result back to the loop.
    /// These tasks never touch supervisor state.
    fn spawn_pump(&self, key: AppKey, seq: u64, spawned: SpawnedApp) {
        let router = Arc::clone(&self.router);
        let exit_tx = self.exit_tx.clone();
        let tenant = key.tenant.clone();
        let app = key.app.clone();
        let SpawnedApp {
            mut output, exit, ..
        } = spawned;

        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                router.publish(OutboundEvent {
                    tenant: tenant.clone(),
                    app: Some(app.clone()),
                    kind: OutboundKind::Output {
                        stream: chunk.stream.to_string(),
                        data: String::from_utf8_lossy(&chunk.bytes).into_owned(),
                    },
                });
            }
            // output closed; the exit result follows
            let exit = exit.await.unwrap_or(ExitResult {
                code: None,
                signal: None,
            });
            let _ = exit_tx.send(ExitNotice { key, seq, exit });
        });
    }

    async fn handle_exit(&mut self, notice: ExitNotice) {
        let key = notice.key;
        let Some(slot) = self.slots.get_mut(&key) else {
            debug!(app = %key, "Exit notice for absent slot, ignoring");
            return;
        };
        if slot.seq != notice.seq {
            debug!(app = %key, "Stale exit notice for replaced slot, ignoring");
            return;
        }

        let now = self.time_provider.now_millis();
        let uptime_ms = slot.started_at.map(|s| now - s);
        let prior_state = slot.state;
        let crashed = slot.exit_is_crash(notice.exit.is_clean());
        let user_stop = slot.stop_cause == Some(StopCause::User);
        let restart_requested = slot.restart_after_exit;

        if let Err(e) = slot.mark_exited() {
            error!(app = %key, error = %e, "Invariant violation on exit, dropping slot");
            self.slots.remove(&key);
            self.registry.release(&key.tenant, &key.app);
            return;
        }
        self.registry.release(&key.tenant, &key.app);

        let status = notice.exit.status();
        let Some(app) = self.apps.get_mut(&key) else {
            self.slots.remove(&key);
            return;
        };
        app.last_exit = Some(status);
        let policy = app.policy;
        let delay_ms = self.backoff.on_run_end(app, uptime_ms, crashed);

        if crashed {
            warn!(app = %key, status = %status, uptime_ms = ?uptime_ms, "App crashed");
        } else {
            info!(app = %key, status = %status, "App exited");
        }
        self.emit_state(&key, prior_state, SlotState::Exited, Some(status.to_string()));

        let should_restart = restart_requested || (policy == RestartPolicy::Auto && !user_stop);
        if should_restart {
            let delay = if restart_requested { 0 } else { delay_ms };
            if let Some(slot) = self.slots.get_mut(&key) {
                let _ = slot.mark_restarting();
            }
            if let Some(app) = self.apps.get_mut(&key) {
                app.last_state = SlotState::Restarting;
                if restart_requested {
                    app.crash_backoff = 0;
                }
            }
            self.emit_state(
                &key,
                SlotState::Exited,
                SlotState::Restarting,
                Some(format!("restart in {delay}ms")),
            );
            self.timers.schedule_in(
                Duration::from_millis(delay as u64),
                TimerEvent::BackoffExpired { key: key.clone() },
            );
        } else {
            self.slots.remove(&key);
            if let Some(app) = self.apps.get_mut(&key) {
                app.last_state = SlotState::Exited;
            }
        }

        self.persist_app_meta(&key).await;
        self.drain_restart_queue().await;
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn fire_due_timers(&mut self) {
        for event in self.timers.pop_due() {
            match event {
                TimerEvent::BackoffExpired { key } => self.handle_backoff_expired(key).await,
                TimerEvent::GraceExpired { key, seq } => {
                    self.handle_grace_expired(key, seq).await;
                }
                TimerEvent::PersistRetry => self.flush_persist_queue().await,
            }
        }
    }

    /// Backoff elapsed: re-attempt admission. Quota denial keeps the app
    /// queued (not counted live) until a slot frees.
    async fn handle_backoff_expired(&mut self, key: AppKey) {
        let queued = self
            .slots
            .get(&key)
            .is_some_and(|s| s.state == SlotState::Restarting);
        if !queued {
            return; // cancelled, deleted or already respawned
        }

        match self.registry.admit(&key.tenant, &key.app) {
            Ok(()) => {
                self.slots.remove(&key);
                self.spawn_slot(key).await;
            }
            Err(AdmissionError::QuotaExceeded { .. }) => {
                debug!(app = %key, "Restart deferred, quota full");
                if !self.restart_queue.contains(&key) {
                    self.restart_queue.push_back(key);
                }
            }
            Err(e) => {
                self.slots.remove(&key);
                if let Some(app) = self.apps.get_mut(&key) {
                    app.last_state = SlotState::Exited;
                }
                self.emit_error(&key.tenant, Some(key.app.clone()), &e.to_string());
                self.persist_app_meta(&key).await;
            }
        }
    }

    /// Grace period elapsed for a STOPPING slot: force the kill. The seq
    /// guard makes timers from previous incarnations harmless.
    async fn handle_grace_expired(&mut self, key: AppKey, seq: u64) {
        let handle = match self.slots.get(&key) {
            Some(slot) if slot.seq == seq && slot.state == SlotState::Stopping => {
                slot.handle.clone()
            }
            _ => return,
        };
        if let Some(handle) = handle {
            warn!(app = %key, "Grace period elapsed, force killing");
            let _ = self.sandbox.signal(&handle, SignalKind::Kill).await;
        }
    }

    /// Retry admission for restarts that were deferred on a full quota
    async fn drain_restart_queue(&mut self) {
        let mut attempts = self.restart_queue.len();
        while attempts > 0 {
            attempts -= 1;
            let Some(key) = self.restart_queue.pop_front() else {
                break;
            };
            let queued = self
                .slots
                .get(&key)
                .is_some_and(|s| s.state == SlotState::Restarting);
            if !queued {
                continue;
            }
            match self.registry.admit(&key.tenant, &key.app) {
                Ok(()) => {
                    self.slots.remove(&key);
                    self.spawn_slot(key).await;
                }
                Err(AdmissionError::QuotaExceeded { .. }) => {
                    self.restart_queue.push_back(key);
                }
                Err(e) => {
                    self.slots.remove(&key);
                    if let Some(app) = self.apps.get_mut(&key) {
                        app.last_state = SlotState::Exited;
                    }
                    self.emit_error(&key.tenant, Some(key.app.clone()), &e.to_string());
                    self.persist_app_meta(&key).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Resource pressure
    // ------------------------------------------------------------------

    /// Global ceiling reached: evict the least-recently-active slot of the
    /// least-recently-submitting tenant. The eviction overlaps the new
    /// admission (live count may transiently exceed the ceiling by the
    /// number of in-flight stops).
    async fn relieve_pressure(&mut self) {
        let live = self.slots.values().filter(|s| s.is_live()).count();
        if live < self.config.global_slot_ceiling {
            return;
        }
        let Some(victim) = self.pick_eviction_victim() else {
            return;
        };
        warn!(victim = %victim, live, "Global slot ceiling reached, evicting");
        self.emit_error(
            &victim.tenant,
            Some(victim.app.clone()),
            "evicted under host resource pressure",
        );
        self.handle_stop(victim, StopCause::Eviction).await;
    }

    fn pick_eviction_victim(&self) -> Option<AppKey> {
        let mut by_tenant: HashMap<&TenantId, Vec<&ExecutionSlot>> = HashMap::new();
        for slot in self
            .slots
            .values()
            .filter(|s| s.state == SlotState::Running)
        {
            by_tenant.entry(&slot.app.tenant).or_default().push(slot);
        }

        let tenant = by_tenant
            .keys()
            .min_by_key(|t| self.registry.last_submission(t.as_str()))
            .copied()?;
        by_tenant[tenant]
            .iter()
            .min_by_key(|s| self.activity_of(s))
            .map(|s| s.app.clone())
    }

    fn activity_of(&self, slot: &ExecutionSlot) -> i64 {
        self.router.last_activity(&slot.app).max(slot.last_active)
    }

    // ------------------------------------------------------------------
    // Persistence (degraded-mode tolerant)
    // ------------------------------------------------------------------

    async fn load_source(&mut self, key: &AppKey) -> Option<AppSource> {
        if let Some(source) = self.sources.get(key) {
            return Some(source.clone());
        }
        let loaded = self.gateway.load_app_source(key).await;
        match loaded {
            Ok(Some(source)) => {
                self.sources.insert(key.clone(), source.clone());
                Some(source)
            }
            Ok(None) => {
                warn!(app = %key, "No stored source for app");
                None
            }
            Err(e) => {
                warn!(app = %key, error = %e, "Failed to load app source");
                None
            }
        }
    }

    async fn persist_app_meta(&mut self, key: &AppKey) {
        let Some(app) = self.apps.get(key).cloned() else {
            return;
        };
        let saved = self.gateway.save_app_meta(&app).await;
        if let Err(e) = saved {
            warn!(app = %key, error = %e, "Failed to persist app metadata, queuing");
            self.queue_persist(PersistRecord::AppMeta(key.clone()));
        }
    }

    async fn persist_source(&mut self, key: &AppKey) {
        let Some(source) = self.sources.get(key).cloned() else {
            return;
        };
        let saved = self.gateway.save_app_source(key, &source).await;
        if let Err(e) = saved {
            warn!(app = %key, error = %e, "Failed to persist app source, queuing");
            self.queue_persist(PersistRecord::AppSource(key.clone()));
        }
    }

    async fn persist_tenant(&mut self, tenant: &TenantId) {
        let Some(record) = self.registry.export(tenant) else {
            return;
        };
        let saved = self.gateway.save_tenant(&record).await;
        if let Err(e) = saved {
            warn!(tenant = %tenant, error = %e, "Failed to persist tenant, queuing");
            self.queue_persist(PersistRecord::Tenant(tenant.clone()));
        }
    }

    fn queue_persist(&mut self, record: PersistRecord) {
        if !self.persist_queue.contains(&record) {
            self.persist_queue.push_back(record);
        }
        if !self.degraded {
            self.degraded = true;
            warn!("Persistence unavailable, supervisor running in degraded (non-durable) mode");
        }
        self.arm_persist_retry();
    }

    fn arm_persist_retry(&mut self) {
        if self.persist_retry_armed {
            return;
        }
        self.persist_retry_armed = true;
        self.timers.schedule_in(
            Duration::from_millis(self.persist_retry_ms as u64),
            TimerEvent::PersistRetry,
        );
    }

    async fn flush_persist_queue(&mut self) {
        self.persist_retry_armed = false;
        let mut pending = std::mem::take(&mut self.persist_queue);
        let mut failed = VecDeque::new();

        while let Some(record) = pending.pop_front() {
            let result = match &record {
                PersistRecord::AppMeta(key) => match self.apps.get(key).cloned() {
                    Some(app) => self.gateway.save_app_meta(&app).await,
                    None => Ok(()),
                },
                PersistRecord::AppSource(key) => match self.sources.get(key).cloned() {
                    Some(source) => self.gateway.save_app_source(key, &source).await,
                    None => Ok(()),
                },
                PersistRecord::Tenant(id) => match self.registry.export(id) {
                    Some(tenant) => self.gateway.save_tenant(&tenant).await,
                    None => Ok(()),
                },
                PersistRecord::DeleteApp(key) => self.gateway.delete_app(key).await,
            };

            if let Err(e) = result {
                debug!(error = %e, "Persist retry failed, backing off");
                failed.push_back(record);
                failed.extend(pending.drain(..));
                break;
            }
        }

        if failed.is_empty() {
            if self.degraded {
                info!("Persistence recovered, leaving degraded mode");
                self.degraded = false;
            }
            self.persist_retry_ms = PERSIST_RETRY_BASE_MS;
        } else {
            self.persist_queue = failed;
            self.persist_retry_ms = (self.persist_retry_ms * 2).min(PERSIST_RETRY_CAP_MS);
            self.arm_persist_retry();
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Terminate live processes but keep their persisted state RUNNING so
    /// the next boot revives them (cold-start recovery).
    async fn shutdown_all(&mut self) {
        let handles: Vec<(AppKey, crate::domain::slot::SandboxHandle)> = self
            .slots
            .values()
            .filter(|s| s.is_live())
            .filter_map(|s| s.handle.clone().map(|h| (s.app.clone(), h)))
            .collect();

        for (key, handle) in &handles {
            let signalled = self.sandbox.signal(handle, SignalKind::Terminate).await;
            if let Err(e) = signalled {
                debug!(app = %key, error = %e, "Terminate on shutdown failed");
            }
        }
        if !handles.is_empty() {
            tokio::time::sleep(self.config.grace_period).await;
            for (_, handle) in &handles {
                let _ = self.sandbox.signal(handle, SignalKind::Kill).await;
            }
        }
        self.flush_persist_queue().await;
    }

    // ------------------------------------------------------------------
    // Outbound events
    // ------------------------------------------------------------------

    fn emit_state(&self, key: &AppKey, from: SlotState, to: SlotState, detail: Option<String>) {
        self.router.publish(OutboundEvent {
            tenant: key.tenant.clone(),
            app: Some(key.app.clone()),
            kind: OutboundKind::StateChanged {
                from: from.to_string(),
                to: to.to_string(),
                detail,
            },
        });
    }

    fn emit_error(&self, tenant: &str, app: Option<AppId>, message: &str) {
        self.router.publish(OutboundEvent {
            tenant: tenant.to_string(),
            app,
            kind: OutboundKind::Error {
                message: message.to_string(),
            },
        });
    }
}
