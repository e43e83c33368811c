// Transport Boundary Types
//
// The chat layer (out of scope here) talks to the core exclusively through
// these two shapes: CommandEnvelope in, OutboundEvent out. Sources and
// input travel as text because the boundary is a chat surface; the port
// layer below works in bytes.

use serde::{Deserialize, Serialize};

use crate::domain::{AppId, RestartPolicy, TenantId};

fn default_policy() -> RestartPolicy {
    RestartPolicy::Auto
}

/// Control commands a tenant may issue
///
/// `owner` on targeting commands names the app's owning tenant when it
/// differs from the issuer; only administrators may set it (force-kill /
/// cross-tenant control).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Submit {
        /// App name, unique within the tenant; generated when omitted
        app: Option<AppId>,
        /// Entry file name; defaults to the app name + ".py" convention
        /// applied by the supervisor when omitted
        entry_point: Option<String>,
        source: String,
        #[serde(default = "default_policy")]
        policy: RestartPolicy,
    },
    Stop {
        app: AppId,
        owner: Option<TenantId>,
    },
    Restart {
        app: AppId,
        owner: Option<TenantId>,
    },
    Delete {
        app: AppId,
        owner: Option<TenantId>,
    },
    SendInput {
        app: AppId,
        input: String,
    },
    ListApps,
    /// Resource usage snapshot of a running app
    Inspect {
        app: AppId,
        owner: Option<TenantId>,
    },
    /// Admin: gracefully stop every live slot on the host
    StopAll,
}

/// One inbound event from the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub tenant: TenantId,
    #[serde(flatten)]
    pub command: Command,
}

/// Summary row for ListApps replies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInfo {
    pub app: AppId,
    pub state: String,
    pub policy: String,
    pub restart_count: i32,
    pub created_at: i64,
    pub last_exit: Option<String>,
}

/// Outbound event payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundKind {
    /// Captured process output, tagged with its stream
    Output { stream: String, data: String },
    /// Slot state transition
    StateChanged {
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Error { message: String },
    /// Synthetic marker: older events were dropped under backpressure
    Truncated,
    AppList { apps: Vec<AppInfo> },
    AppStats {
        cpu_usage_percent: f32,
        memory_bytes: u64,
        uptime_secs: u64,
    },
}

/// One outbound event to the transport, tagged for demultiplexing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub tenant: TenantId,
    /// None for tenant-level replies (e.g. the app listing)
    pub app: Option<AppId>,
    #[serde(flatten)]
    pub kind: OutboundKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_round_trips_with_default_policy() {
        let json = r#"{"tenant":"u1","command":"submit","source":"print('hi')","app":"bot"}"#;
        let envelope: CommandEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.tenant, "u1");
        match envelope.command {
            Command::Submit { app, policy, entry_point, .. } => {
                assert_eq!(app.as_deref(), Some("bot"));
                assert_eq!(policy, RestartPolicy::Auto);
                assert!(entry_point.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn outbound_event_serializes_flat() {
        let event = OutboundEvent {
            tenant: "u1".to_string(),
            app: Some("bot".to_string()),
            kind: OutboundKind::StateChanged {
                from: "RUNNING".to_string(),
                to: "EXITED".to_string(),
                detail: Some("code(0)".to_string()),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "state_changed");
        assert_eq!(json["tenant"], "u1");
        assert_eq!(json["from"], "RUNNING");
    }
}
