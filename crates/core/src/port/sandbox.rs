// Sandbox Adapter Port
// Abstraction over the isolation mechanism that runs untrusted tenant code.
// The core never assumes shared memory or filesystem visibility between
// slots; resource limits are enforced by the adapter, not recomputed here.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::domain::app::{AppSource, ExitStatus};
use crate::domain::slot::SandboxHandle;

/// Per-app resource limits passed at spawn time
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    pub max_cpu_secs: u64,
    /// None means no wall-clock bound (long-lived bots are the common case)
    pub wall_clock: Option<Duration>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 256 * 1024 * 1024,
            max_cpu_secs: 300,
            wall_clock: None,
        }
    }
}

/// Which pipe a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured slice of process output, in production order per stream
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

/// Exit notification delivered once per spawned process
#[derive(Debug, Clone, Copy)]
pub struct ExitResult {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitResult {
    pub fn status(&self) -> ExitStatus {
        match (self.code, self.signal) {
            (Some(c), _) => ExitStatus::Code(c),
            (None, Some(s)) => ExitStatus::Signal(s),
            // Neither code nor signal should not happen; treat as abnormal
            (None, None) => ExitStatus::Signal(-1),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Signals the supervisor may send through the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Graceful terminate (SIGTERM-equivalent), starts the grace period
    Terminate,
    /// Hard kill (SIGKILL-equivalent), end of the grace period
    Kill,
}

/// Point-in-time resource usage of one sandboxed process
#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    pub cpu_usage_percent: f32,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

/// Everything a successful spawn hands back to the supervisor.
///
/// `output` yields chunks as the process writes them; `exit` resolves once,
/// when the process ends (the async form of `wait`). Both channels belong
/// to exactly one slot incarnation.
pub struct SpawnedApp {
    pub handle: SandboxHandle,
    pub output: mpsc::Receiver<OutputChunk>,
    pub exit: oneshot::Receiver<ExitResult>,
}

/// Sandbox adapter errors
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Input delivery failed: {0}")]
    InputFailed(String),

    #[error("Signal delivery failed: {0}")]
    SignalFailed(String),

    #[error("Unknown sandbox handle: {0}")]
    UnknownHandle(u64),

    #[error("IO error: {0}")]
    Io(String),
}

/// Sandbox Adapter trait
///
/// Implementations:
/// - ProcessSandbox (infra-sandbox): setsid process groups + rlimits
/// - MockSandbox (below): scripted processes for tests
#[async_trait]
pub trait SandboxAdapter: Send + Sync {
    /// Start an isolated process for the given source
    ///
    /// # Errors
    /// - SandboxError::SpawnFailed if no process could be produced; the
    ///   caller maps this to an EXITED(spawn-failed) slot
    async fn spawn(
        &self,
        source: &AppSource,
        limits: &ResourceLimits,
    ) -> Result<SpawnedApp, SandboxError>;

    /// Write bytes to the process's stdin
    async fn send_input(&self, handle: &SandboxHandle, bytes: &[u8]) -> Result<(), SandboxError>;

    /// Deliver a signal to the process (group)
    async fn signal(&self, handle: &SandboxHandle, kind: SignalKind) -> Result<(), SandboxError>;

    /// Sample current resource usage of the process
    async fn usage_snapshot(&self, handle: &SandboxHandle) -> Result<UsageSnapshot, SandboxError>;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    const MOCK_OUTPUT_CAPACITY: usize = 64;

    struct MockProc {
        output_tx: mpsc::Sender<OutputChunk>,
        exit_tx: Option<oneshot::Sender<ExitResult>>,
    }

    /// Mock Sandbox for testing
    ///
    /// Spawns "processes" that are driven entirely by the test: push output
    /// with `emit_output`, end them with `complete`. Graceful terminate
    /// finishes the process unless `ignore_terminate` is set, which lets
    /// tests exercise the grace-period/forced-kill path.
    pub struct MockSandbox {
        next_id: AtomicU64,
        fail_next_spawn: AtomicBool,
        ignore_terminate: AtomicBool,
        procs: Mutex<HashMap<u64, MockProc>>,
        spawn_count: AtomicU64,
    }

    impl MockSandbox {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                fail_next_spawn: AtomicBool::new(false),
                ignore_terminate: AtomicBool::new(false),
                procs: Mutex::new(HashMap::new()),
                spawn_count: AtomicU64::new(0),
            }
        }

        /// Make the next spawn return SpawnFailed
        pub fn fail_next_spawn(&self) {
            self.fail_next_spawn.store(true, Ordering::SeqCst);
        }

        /// Simulate a process that ignores SIGTERM (forces the hard kill)
        pub fn set_ignore_terminate(&self, ignore: bool) {
            self.ignore_terminate.store(ignore, Ordering::SeqCst);
        }

        pub fn spawn_count(&self) -> u64 {
            self.spawn_count.load(Ordering::SeqCst)
        }

        pub fn alive_count(&self) -> usize {
            self.procs.lock().unwrap().len()
        }

        /// Push output as if the process wrote it
        pub fn emit_output(&self, handle_id: u64, stream: OutputStream, bytes: &[u8]) {
            let procs = self.procs.lock().unwrap();
            if let Some(p) = procs.get(&handle_id) {
                let _ = p.output_tx.try_send(OutputChunk {
                    stream,
                    bytes: bytes.to_vec(),
                });
            }
        }

        /// End the process with the given exit result
        pub fn complete(&self, handle_id: u64, exit: ExitResult) {
            let mut procs = self.procs.lock().unwrap();
            if let Some(mut p) = procs.remove(&handle_id) {
                if let Some(tx) = p.exit_tx.take() {
                    let _ = tx.send(exit);
                }
            }
        }
    }

    impl Default for MockSandbox {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl SandboxAdapter for MockSandbox {
        async fn spawn(
            &self,
            _source: &AppSource,
            _limits: &ResourceLimits,
        ) -> Result<SpawnedApp, SandboxError> {
            if self.fail_next_spawn.swap(false, Ordering::SeqCst) {
                return Err(SandboxError::SpawnFailed("mock spawn failure".to_string()));
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.spawn_count.fetch_add(1, Ordering::SeqCst);

            let (output_tx, output_rx) = mpsc::channel(MOCK_OUTPUT_CAPACITY);
            let (exit_tx, exit_rx) = oneshot::channel();

            self.procs.lock().unwrap().insert(
                id,
                MockProc {
                    output_tx,
                    exit_tx: Some(exit_tx),
                },
            );

            Ok(SpawnedApp {
                handle: SandboxHandle {
                    id,
                    pid: 10_000 + id as i32,
                },
                output: output_rx,
                exit: exit_rx,
            })
        }

        async fn send_input(
            &self,
            handle: &SandboxHandle,
            _bytes: &[u8],
        ) -> Result<(), SandboxError> {
            let procs = self.procs.lock().unwrap();
            if procs.contains_key(&handle.id) {
                Ok(())
            } else {
                Err(SandboxError::UnknownHandle(handle.id))
            }
        }

        async fn signal(&self, handle: &SandboxHandle, kind: SignalKind) -> Result<(), SandboxError> {
            let exists = self.procs.lock().unwrap().contains_key(&handle.id);
            if !exists {
                return Err(SandboxError::UnknownHandle(handle.id));
            }
            match kind {
                SignalKind::Terminate => {
                    if !self.ignore_terminate.load(Ordering::SeqCst) {
                        self.complete(
                            handle.id,
                            ExitResult {
                                code: None,
                                signal: Some(15),
                            },
                        );
                    }
                }
                SignalKind::Kill => {
                    self.complete(
                        handle.id,
                        ExitResult {
                            code: None,
                            signal: Some(9),
                        },
                    );
                }
            }
            Ok(())
        }

        async fn usage_snapshot(
            &self,
            handle: &SandboxHandle,
        ) -> Result<UsageSnapshot, SandboxError> {
            let procs = self.procs.lock().unwrap();
            if procs.contains_key(&handle.id) {
                Ok(UsageSnapshot {
                    cpu_usage_percent: 1.5,
                    memory_bytes: 12 * 1024 * 1024,
                    uptime_secs: 1,
                })
            } else {
                Err(SandboxError::UnknownHandle(handle.id))
            }
        }
    }
}
