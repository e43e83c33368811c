// Port Layer - Interfaces for external dependencies

pub mod id_provider;
pub mod persistence;
pub mod sandbox;
pub mod time_provider;

// Re-exports
pub use id_provider::IdProvider;
pub use persistence::PersistenceGateway;
pub use sandbox::{
    ExitResult, OutputChunk, OutputStream, ResourceLimits, SandboxAdapter, SandboxError,
    SignalKind, SpawnedApp, UsageSnapshot,
};
pub use time_provider::TimeProvider;
