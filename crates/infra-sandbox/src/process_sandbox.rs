// Process-based sandbox adapter
//
// Each slot gets a private working directory under the configured root, its
// own session (setsid) so signals address the whole process group, an
// allowlisted environment, and RLIMIT_AS / RLIMIT_CPU applied between fork
// and exec. Wall-clock enforcement is a watchdog task that kills the group.
// Stronger isolation mechanisms can replace this behind the same port.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use hostbay_core::domain::slot::SandboxHandle;
use hostbay_core::domain::AppSource;
use hostbay_core::port::sandbox::{
    ExitResult, OutputChunk, OutputStream, ResourceLimits, SandboxAdapter, SandboxError,
    SignalKind, SpawnedApp, UsageSnapshot,
};

use crate::usage::ProcessUsageProbe;

const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const READ_BUF_SIZE: usize = 4096;

/// Sandbox adapter configuration
#[derive(Debug, Clone)]
pub struct ProcessSandboxConfig {
    /// Root under which per-slot working directories are created
    pub root: PathBuf,
    /// Interpreter for submitted sources
    pub interpreter: String,
    /// Arguments before the entry file (unbuffered output by default)
    pub interpreter_args: Vec<String>,
    /// Environment variables allowed through to the child
    pub env_allowlist: Vec<String>,
}

impl Default for ProcessSandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/hostbay"),
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-u".to_string()],
            env_allowlist: vec![
                "PATH".to_string(),
                "HOME".to_string(),
                "LANG".to_string(),
            ],
        }
    }
}

struct ProcEntry {
    pid: i32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

/// SandboxAdapter implementation on plain OS processes
pub struct ProcessSandbox {
    config: ProcessSandboxConfig,
    next_id: AtomicU64,
    procs: Arc<Mutex<HashMap<u64, Arc<ProcEntry>>>>,
    usage: ProcessUsageProbe,
}

impl ProcessSandbox {
    pub fn new(config: ProcessSandboxConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            procs: Arc::new(Mutex::new(HashMap::new())),
            usage: ProcessUsageProbe::new(),
        }
    }

    fn allowed_env(&self) -> Vec<(String, String)> {
        std::env::vars()
            .filter(|(k, _)| self.config.env_allowlist.contains(k))
            .collect()
    }

    fn entry(&self, id: u64) -> Result<Arc<ProcEntry>, SandboxError> {
        self.procs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(SandboxError::UnknownHandle(id))
    }
}

/// Keep only the file name: submitted entry points must not escape the
/// slot's working directory.
fn sanitize_entry(entry: &str) -> Result<String, SandboxError> {
    match Path::new(entry).file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() && name != ".." => Ok(name.to_string()),
        _ => Err(SandboxError::SpawnFailed(format!(
            "invalid entry point: {entry}"
        ))),
    }
}

#[cfg(unix)]
fn kill_group(pid: i32, signal: nix::sys::signal::Signal) -> Result<(), SandboxError> {
    // negative pid addresses the process group created by setsid
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(-pid), signal)
        .map_err(|e| SandboxError::SignalFailed(format!("kill {signal} -> pgid {pid}: {e}")))
}

#[cfg(unix)]
fn errno_to_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

fn spawn_reader<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        stream,
                        bytes: buf[..n].to_vec(),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, stream = %stream, "Output read failed");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl SandboxAdapter for ProcessSandbox {
    async fn spawn(
        &self,
        source: &AppSource,
        limits: &ResourceLimits,
    ) -> Result<SpawnedApp, SandboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = sanitize_entry(&source.entry_point)?;

        let workdir = self.config.root.join(format!("slot-{id}"));
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| SandboxError::SpawnFailed(format!("workdir: {e}")))?;
        tokio::fs::write(workdir.join(&entry), &source.bytes)
            .await
            .map_err(|e| SandboxError::SpawnFailed(format!("materialize source: {e}")))?;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(&entry)
            .current_dir(&workdir)
            .env_clear()
            .envs(self.allowed_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            use nix::sys::resource::{setrlimit, Resource};

            let max_memory = limits.max_memory_bytes;
            let max_cpu = limits.max_cpu_secs;
            unsafe {
                cmd.pre_exec(move || {
                    nix::unistd::setsid().map_err(errno_to_io)?;
                    setrlimit(Resource::RLIMIT_AS, max_memory, max_memory)
                        .map_err(errno_to_io)?;
                    setrlimit(Resource::RLIMIT_CPU, max_cpu, max_cpu).map_err(errno_to_io)?;
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::SpawnFailed("process gone before pid capture".to_string()))?
            as i32;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed("stderr not captured".to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        spawn_reader(stdout, OutputStream::Stdout, output_tx.clone());
        spawn_reader(stderr, OutputStream::Stderr, output_tx);

        self.procs.lock().unwrap().insert(
            id,
            Arc::new(ProcEntry {
                pid,
                stdin: tokio::sync::Mutex::new(stdin),
            }),
        );

        let (exit_tx, exit_rx) = oneshot::channel();
        let procs = Arc::clone(&self.procs);
        let wall_clock = limits.wall_clock;
        tokio::spawn(async move {
            let status = match wall_clock {
                Some(limit) => match timeout(limit, child.wait()).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(pid, "Wall-clock limit exceeded, killing process group");
                        #[cfg(unix)]
                        let _ = kill_group(pid, nix::sys::signal::Signal::SIGKILL);
                        child.wait().await
                    }
                },
                None => child.wait().await,
            };

            let exit = match status {
                Ok(st) => {
                    #[cfg(unix)]
                    let signal = std::os::unix::process::ExitStatusExt::signal(&st);
                    #[cfg(not(unix))]
                    let signal = None;
                    ExitResult {
                        code: st.code(),
                        signal,
                    }
                }
                Err(e) => {
                    warn!(pid, error = %e, "Wait failed");
                    ExitResult {
                        code: None,
                        signal: None,
                    }
                }
            };

            procs.lock().unwrap().remove(&id);
            let _ = tokio::fs::remove_dir_all(&workdir).await;
            debug!(pid, code = ?exit.code, signal = ?exit.signal, "Sandboxed process exited");
            let _ = exit_tx.send(exit);
        });

        info!(id, pid, "Sandboxed process started");
        Ok(SpawnedApp {
            handle: SandboxHandle { id, pid },
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn send_input(&self, handle: &SandboxHandle, bytes: &[u8]) -> Result<(), SandboxError> {
        let entry = self.entry(handle.id)?;
        let mut stdin = entry.stdin.lock().await;
        match stdin.as_mut() {
            Some(writer) => {
                writer
                    .write_all(bytes)
                    .await
                    .map_err(|e| SandboxError::InputFailed(e.to_string()))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| SandboxError::InputFailed(e.to_string()))
            }
            None => Err(SandboxError::InputFailed("stdin closed".to_string())),
        }
    }

    async fn signal(&self, handle: &SandboxHandle, kind: SignalKind) -> Result<(), SandboxError> {
        let entry = self.entry(handle.id)?;

        #[cfg(unix)]
        {
            let signal = match kind {
                SignalKind::Terminate => nix::sys::signal::Signal::SIGTERM,
                SignalKind::Kill => nix::sys::signal::Signal::SIGKILL,
            };
            debug!(pid = entry.pid, signal = %signal, "Signalling process group");
            kill_group(entry.pid, signal)
        }

        #[cfg(not(unix))]
        {
            let _ = (entry, kind);
            Err(SandboxError::SignalFailed(
                "signals unsupported on this platform".to_string(),
            ))
        }
    }

    async fn usage_snapshot(&self, handle: &SandboxHandle) -> Result<UsageSnapshot, SandboxError> {
        let entry = self.entry(handle.id)?;
        self.usage
            .sample(entry.pid)
            .ok_or(SandboxError::UnknownHandle(handle.id))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sandbox(root: &Path) -> ProcessSandbox {
        ProcessSandbox::new(ProcessSandboxConfig {
            root: root.to_path_buf(),
            interpreter: "sh".to_string(),
            interpreter_args: vec![],
            env_allowlist: vec!["PATH".to_string()],
        })
    }

    fn source(script: &str) -> AppSource {
        AppSource {
            entry_point: "main.sh".to_string(),
            bytes: script.as_bytes().to_vec(),
        }
    }

    async fn drain_output(mut rx: mpsc::Receiver<OutputChunk>) -> String {
        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&String::from_utf8_lossy(&chunk.bytes));
        }
        collected
    }

    #[tokio::test]
    async fn spawn_captures_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let spawned = sandbox
            .spawn(&source("echo hello-from-slot"), &ResourceLimits::default())
            .await
            .unwrap();

        let output = drain_output(spawned.output).await;
        assert!(output.contains("hello-from-slot"));

        let exit = spawned.exit.await.unwrap();
        assert_eq!(exit.code, Some(0));
        assert!(exit.is_clean());
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let spawned = sandbox
            .spawn(&source("exit 3"), &ResourceLimits::default())
            .await
            .unwrap();
        drop(spawned.output);

        let exit = spawned.exit.await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.is_clean());
    }

    #[tokio::test]
    async fn terminate_signals_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let spawned = sandbox
            .spawn(&source("sleep 30"), &ResourceLimits::default())
            .await
            .unwrap();
        drop(spawned.output);

        // give the shell a moment to exec
        tokio::time::sleep(Duration::from_millis(100)).await;
        sandbox
            .signal(&spawned.handle, SignalKind::Terminate)
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .expect("process should die on SIGTERM")
            .unwrap();
        assert_eq!(exit.signal, Some(15));
    }

    #[tokio::test]
    async fn stdin_reaches_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let spawned = sandbox
            .spawn(
                &source("read line; echo \"got:$line\""),
                &ResourceLimits::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        sandbox
            .send_input(&spawned.handle, b"ping\n")
            .await
            .unwrap();

        let output = drain_output(spawned.output).await;
        assert!(output.contains("got:ping"));
    }

    #[tokio::test]
    async fn wall_clock_limit_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let limits = ResourceLimits {
            wall_clock: Some(Duration::from_millis(200)),
            ..ResourceLimits::default()
        };
        let spawned = sandbox.spawn(&source("sleep 30"), &limits).await.unwrap();
        drop(spawned.output);

        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .expect("watchdog should fire")
            .unwrap();
        assert_eq!(exit.signal, Some(9));
    }

    #[tokio::test]
    async fn signalling_after_exit_is_unknown_handle() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let spawned = sandbox
            .spawn(&source("true"), &ResourceLimits::default())
            .await
            .unwrap();
        drop(spawned.output);
        let _ = spawned.exit.await;

        let err = sandbox
            .signal(&spawned.handle, SignalKind::Kill)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownHandle(_)));
    }

    #[test]
    fn entry_points_cannot_escape_the_workdir() {
        assert_eq!(sanitize_entry("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_entry("bot.py").unwrap(), "bot.py");
        assert!(sanitize_entry("..").is_err());
        assert!(sanitize_entry("").is_err());
    }
}
