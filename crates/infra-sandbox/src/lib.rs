// Hostbay Infrastructure - Sandbox Adapter
// Implements: SandboxAdapter on plain OS processes (setsid groups + rlimits)

pub mod process_sandbox;
pub mod usage;

pub use process_sandbox::{ProcessSandbox, ProcessSandboxConfig};
pub use usage::ProcessUsageProbe;
