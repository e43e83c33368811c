// Application Layer - supervision services

pub mod backoff;
pub mod command;
pub mod registry;
pub mod router;
pub mod supervisor;

// Re-exports
pub use backoff::RestartPolicy;
pub use command::{AppInfo, Command, CommandEnvelope, OutboundEvent, OutboundKind};
pub use registry::{AdmissionError, TenantRegistry};
pub use router::{OutputRouter, OutputSubscription};
pub use supervisor::{shutdown_channel, ShutdownSender, ShutdownToken, Supervisor};
