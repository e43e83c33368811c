//! Line-delimited JSON transport shim
//!
//! Stands in for the chat layer at the transport boundary: every stdin line
//! is parsed as a CommandEnvelope and forwarded to the supervisor; each
//! tenant's outbound stream is drained to stdout as one JSON object per
//! line. A real chat frontend replaces this file, nothing else.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use hostbay_core::application::supervisor::ShutdownToken;
use hostbay_core::application::{CommandEnvelope, OutputRouter};

/// Read commands from stdin until EOF or shutdown
pub async fn run(
    command_tx: mpsc::Sender<CommandEnvelope>,
    router: Arc<OutputRouter>,
    mut shutdown: ShutdownToken,
) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.wait() => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Transport stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Transport read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Discarding malformed command line");
                continue;
            }
        };

        // lazily attach an outbound drain per tenant
        if subscribed.insert(envelope.tenant.clone()) {
            spawn_drain(&router, &envelope.tenant);
        }

        if command_tx.send(envelope).await.is_err() {
            warn!("Supervisor command channel closed, stopping transport");
            break;
        }
    }
}

fn spawn_drain(router: &Arc<OutputRouter>, tenant: &str) {
    let mut subscription = router.subscribe(tenant);
    tokio::spawn(async move {
        loop {
            let event = subscription.recv().await;
            match serde_json::to_string(&event) {
                // stdout is the event stream; logs go to stderr
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "Failed to serialize outbound event"),
            }
        }
    });
}
