//! Process Registry - child processes spawned on behalf of jobs
//!
//! Cancelling a job must stop the work, not just flag it. Every child a tool
//! spawns is handed to the registry, which owns it from then on:
//!
//! ```text
//! tool ──spawn──► Child ──register_job_process(job)──► watcher task
//!                                                         │
//!      TrackedChild::wait() ◄── exit status ◄─────────────┤ child exits
//!                                                         │   (entry removed)
//! JobManager::cancel ──kill_job_processes(job)──► SIGKILL ┘
//! ```

use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::process::Child;
use tokio::sync::oneshot;
use uuid::Uuid;

struct TrackedProcess {
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
}

type Table = HashMap<Uuid, HashMap<u64, TrackedProcess>>;

/// Environment variables passed through to spawned children.
const SAFE_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "SHELL",
    "TMPDIR",
    "TMP",
    "TEMP",
    "XDG_RUNTIME_DIR",
    "XDG_DATA_HOME",
    "XDG_CONFIG_HOME",
    "XDG_CACHE_HOME",
];

/// The subset of this process's environment children may inherit. Pair with
/// `Command::env_clear()` so API keys never leak into tools.
pub fn safe_env() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(k, _)| SAFE_ENV_KEYS.contains(&k.as_str()))
        .collect()
}

/// Per-job set of live child processes.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    table: Arc<Mutex<Table>>,
    next_key: Arc<AtomicU64>,
}

/// Caller-side view of a registered child.
pub struct TrackedChild {
    pid: Option<u32>,
    exit: oneshot::Receiver<io::Result<ExitStatus>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `child` and track it under `job_id`.
    ///
    /// Take stdout/stderr out of the child before registering; the registry
    /// only waits on and kills the process. The entry removes itself when the
    /// process exits for any reason.
    pub fn register_job_process(&self, job_id: Uuid, mut child: Child) -> TrackedChild {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Ok(mut table) = self.table.lock() {
            table
                .entry(job_id)
                .or_default()
                .insert(key, TrackedProcess { pid, kill: kill_tx });
        }
        tracing::debug!(job_id = %job_id, pid = ?pid, "tracking job process");

        let registry = self.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(pid = ?pid, error = %e, "start_kill failed");
                    }
                    child.wait().await
                }
            };
            registry.forget(job_id, key);
            let _ = exit_tx.send(status);
        });

        TrackedChild { pid, exit: exit_rx }
    }

    /// Force-kill every process tracked for `job_id` and clear its set.
    ///
    /// Returns how many processes were signalled.
    pub fn kill_job_processes(&self, job_id: Uuid) -> usize {
        let tracked = match self.table.lock() {
            Ok(mut table) => table.remove(&job_id).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };

        let count = tracked.len();
        for (_, process) in tracked {
            if let Some(pid) = process.pid {
                kill_process_group(pid);
            }
            let _ = process.kill.send(());
        }
        if count > 0 {
            tracing::info!(job_id = %job_id, count, "killed job processes");
        }
        count
    }

    /// Number of live processes tracked for `job_id`.
    pub fn count(&self, job_id: Uuid) -> usize {
        self.table
            .lock()
            .map(|t| t.get(&job_id).map(|m| m.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn forget(&self, job_id: Uuid, key: u64) {
        if let Ok(mut table) = self.table.lock() {
            if let Some(set) = table.get_mut(&job_id) {
                set.remove(&key);
                if set.is_empty() {
                    table.remove(&job_id);
                }
            }
        }
    }
}

/// SIGKILL the whole process group when the child leads one, so grandchildren
/// started by `sh -c` die with it.
pub(crate) fn kill_process_group(pid: u32) {
    let pid = Pid::from_raw(pid as i32);
    if matches!(getpgid(Some(pid)), Ok(pgid) if pgid == pid) {
        if let Err(e) = killpg(pid, Signal::SIGKILL) {
            tracing::debug!(pid = %pid, error = %e, "killpg failed");
        }
    }
}

impl TrackedChild {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to exit (normally or by kill).
    pub async fn wait(self) -> io::Result<ExitStatus> {
        self.exit
            .await
            .unwrap_or_else(|_| Err(io::Error::other("process watcher dropped")))
    }
}
