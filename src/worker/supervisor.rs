//! # Worker Pool Supervisor
//!
//! Spawns the configured number of worker OS processes and keeps them alive.
//! A monitor loop respawns any worker that exits; shutdown sends SIGTERM,
//! waits out a grace period, then kills whatever is left.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// How often the monitor checks for dead workers.
const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Command line used to (re)spawn one worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: std::path::PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    fn spawn(&self, index: usize) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .env("WORKER_INDEX", index.to_string())
            .stdin(Stdio::null())
            .spawn()
    }
}

/// A supervised pool of worker processes.
#[derive(Clone)]
pub struct WorkerPool {
    command: WorkerCommand,
    children: Arc<Mutex<Vec<Option<Child>>>>,
    shutting_down: Arc<AtomicBool>,
    grace: Duration,
}

impl WorkerPool {
    /// Spawn `count` workers. Fails if any initial spawn fails.
    pub fn spawn(command: WorkerCommand, count: usize, grace: Duration) -> anyhow::Result<Self> {
        let mut children = Vec::with_capacity(count);
        for index in 0..count {
            let child = command.spawn(index)?;
            info!(worker = index, pid = child.id(), "worker spawned");
            children.push(Some(child));
        }
        Ok(Self {
            command,
            children: Arc::new(Mutex::new(children)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            grace,
        })
    }

    /// Monitor loop. Respawns dead workers in place until shutdown begins.
    pub async fn monitor(&self) {
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let mut children = self.children.lock().await;
            for (index, slot) in children.iter_mut().enumerate() {
                let dead = match slot {
                    Some(child) => {
                        // The pid is gone once the child has been reaped, so
                        // grab it before polling.
                        let pid = child.id();
                        match child.try_wait() {
                            Ok(Some(status)) => {
                                warn!(worker = index, pid, %status, "worker exited");
                                Some(pid)
                            }
                            Ok(None) => None,
                            Err(err) => {
                                error!(worker = index, error = %err, "could not poll worker");
                                None
                            }
                        }
                    }
                    None => Some(None),
                };
                let Some(old_pid) = dead else { continue };
                // Re-check the flag so shutdown never races a respawn.
                if self.shutting_down.load(Ordering::SeqCst) {
                    continue;
                }
                match self.command.spawn(index) {
                    Ok(child) => {
                        info!(
                            worker = index,
                            old_pid,
                            new_pid = child.id(),
                            "worker respawned"
                        );
                        *slot = Some(child);
                    }
                    Err(err) => {
                        error!(worker = index, error = %err, "respawn failed");
                        *slot = None;
                    }
                }
            }
        }
    }

    /// Two-phase shutdown: SIGTERM everyone, wait out the grace period, then
    /// SIGKILL stragglers. Idempotent.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut children = self.children.lock().await;

        for (index, slot) in children.iter_mut().enumerate() {
            if let Some(child) = slot {
                if let Some(pid) = child.id() {
                    info!(worker = index, pid, "sending SIGTERM");
                    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        warn!(worker = index, pid, error = %err, "SIGTERM failed");
                    }
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        for (index, slot) in children.iter_mut().enumerate() {
            let Some(child) = slot else { continue };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, child.wait()).await {
                Ok(Ok(status)) => info!(worker = index, %status, "worker stopped"),
                Ok(Err(err)) => warn!(worker = index, error = %err, "wait failed"),
                Err(_) => {
                    warn!(worker = index, "grace period expired, killing worker");
                    if let Err(err) = child.kill().await {
                        error!(worker = index, error = %err, "kill failed");
                    }
                }
            }
            *slot = None;
        }
        info!("worker pool stopped");
    }

    /// Number of currently live workers, for /metrics.
    pub async fn live_workers(&self) -> usize {
        let mut children = self.children.lock().await;
        let mut live = 0;
        for slot in children.iter_mut() {
            if let Some(child) = slot {
                if matches!(child.try_wait(), Ok(None)) {
                    live += 1;
                }
            }
        }
        live
    }

    /// Pids by worker index. A `None` entry means the slot is empty or the
    /// child already exited.
    pub async fn worker_pids(&self) -> Vec<Option<u32>> {
        self.children
            .lock()
            .await
            .iter()
            .map(|slot| slot.as_ref().and_then(|child| child.id()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(secs: &str) -> WorkerCommand {
        WorkerCommand {
            program: "/bin/sleep".into(),
            args: vec![secs.to_string()],
        }
    }

    #[tokio::test]
    async fn spawns_and_counts_workers() {
        let pool = WorkerPool::spawn(sleeper("30"), 2, Duration::from_secs(1)).unwrap();
        assert_eq!(pool.live_workers().await, 2);
        pool.shutdown().await;
        assert_eq!(pool.live_workers().await, 0);
    }

    #[tokio::test]
    async fn shutdown_kills_sigterm_ignoring_workers_after_grace() {
        // sleep(1) exits on SIGTERM; this just exercises the full path with a
        // short grace window.
        let pool = WorkerPool::spawn(sleeper("30"), 1, Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        pool.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.live_workers().await, 0);
    }

    #[tokio::test]
    async fn monitor_respawns_killed_worker_at_same_index() {
        let pool = WorkerPool::spawn(sleeper("30"), 2, Duration::from_millis(200)).unwrap();
        let before = pool.worker_pids().await;
        let victim = before[0].unwrap();
        signal::kill(Pid::from_raw(victim as i32), Signal::SIGKILL).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // First monitor tick fires immediately and reaps the dead child.
        let monitor = tokio::spawn({
            let pool = pool.clone();
            async move { pool.monitor().await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.abort();

        let after = pool.worker_pids().await;
        assert_eq!(pool.live_workers().await, 2);
        assert!(after[0].is_some());
        assert_ne!(after[0], Some(victim));
        assert_eq!(after[1], before[1]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = WorkerPool::spawn(sleeper("30"), 1, Duration::from_millis(200)).unwrap();
        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(pool.live_workers().await, 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let bad = WorkerCommand {
            program: "/nonexistent/worker-binary".into(),
            args: vec![],
        };
        assert!(WorkerPool::spawn(bad, 1, Duration::from_secs(1)).is_err());
    }
}
