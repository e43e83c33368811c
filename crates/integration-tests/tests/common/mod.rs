// Shared test harness: real supervisor loop, mock sandbox, in-memory gateway
// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hostbay_core::application::supervisor::{shutdown_channel, ShutdownSender};
use hostbay_core::application::{
    Command, CommandEnvelope, OutboundEvent, OutboundKind, OutputRouter, OutputSubscription,
    Supervisor,
};
use hostbay_core::config::SupervisorConfig;
use hostbay_core::port::id_provider::UuidProvider;
use hostbay_core::port::persistence::mocks::InMemoryGateway;
use hostbay_core::port::sandbox::mocks::MockSandbox;
use hostbay_core::port::time_provider::SystemTimeProvider;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Harness {
    pub command_tx: mpsc::Sender<CommandEnvelope>,
    pub router: Arc<OutputRouter>,
    pub sandbox: Arc<MockSandbox>,
    pub gateway: Arc<InMemoryGateway>,
    pub shutdown: ShutdownSender,
    pub supervisor: JoinHandle<()>,
}

/// Fast timings so backoff/grace scenarios finish in milliseconds
pub fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        restart_base_delay_ms: 40,
        restart_max_delay_ms: 320,
        clean_run_threshold_ms: 10_000,
        grace_period: Duration::from_millis(150),
        ..SupervisorConfig::default()
    }
}

pub fn start(config: SupervisorConfig) -> Harness {
    start_with_gateway(config, Arc::new(InMemoryGateway::new()))
}

pub fn start_with_gateway(config: SupervisorConfig, gateway: Arc<InMemoryGateway>) -> Harness {
    let time_provider = Arc::new(SystemTimeProvider);
    let sandbox = Arc::new(MockSandbox::new());
    let router = Arc::new(OutputRouter::new(
        config.outbox_capacity,
        time_provider.clone(),
    ));

    let (supervisor, command_tx) = Supervisor::new(
        config,
        sandbox.clone(),
        gateway.clone(),
        Arc::clone(&router),
        time_provider,
        Arc::new(UuidProvider),
    );

    let (shutdown, shutdown_rx) = shutdown_channel();
    let handle = tokio::spawn(async move {
        supervisor.run(shutdown_rx).await.unwrap();
    });

    Harness {
        command_tx,
        router,
        sandbox,
        gateway,
        shutdown,
        supervisor: handle,
    }
}

pub async fn send(harness: &Harness, tenant: &str, command: Command) {
    harness
        .command_tx
        .send(CommandEnvelope {
            tenant: tenant.to_string(),
            command,
        })
        .await
        .expect("supervisor alive");
}

pub fn submit(app: &str, source: &str) -> Command {
    Command::Submit {
        app: Some(app.to_string()),
        entry_point: None,
        source: source.to_string(),
        policy: hostbay_core::domain::RestartPolicy::Auto,
    }
}

pub async fn next_event(sub: &mut OutputSubscription) -> OutboundEvent {
    tokio::time::timeout(EVENT_TIMEOUT, sub.recv())
        .await
        .expect("expected an outbound event")
}

/// Skip events until a StateChanged with the given target state arrives
pub async fn wait_for_state(sub: &mut OutputSubscription, target: &str) -> OutboundEvent {
    loop {
        let event = next_event(sub).await;
        if let OutboundKind::StateChanged { to, .. } = &event.kind {
            if to == target {
                return event;
            }
        }
    }
}

/// Skip events until an Error event arrives
pub async fn wait_for_error(sub: &mut OutputSubscription) -> String {
    loop {
        let event = next_event(sub).await;
        if let OutboundKind::Error { message } = event.kind {
            return message;
        }
    }
}
