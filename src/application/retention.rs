//! Deferred deletion of job workspaces after the retention grace period.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use metrics::counter;
use tokio::{
    fs,
    sync::{Notify, oneshot},
    task::{AbortHandle, JoinHandle},
};
use tracing::{error, info, warn};

const SOURCE: &str = "application::retention";

/// How a scheduled deletion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapResult {
    Removed,
    AlreadyGone,
    Failed,
}

impl ReapResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ReapResult::Removed => "removed",
            ReapResult::AlreadyGone => "already_gone",
            ReapResult::Failed => "failed",
        }
    }
}

#[derive(Debug)]
struct PendingReap {
    path: PathBuf,
    abort: AbortHandle,
}

/// Owns every pending workspace deletion, and every workspace whose render
/// has not finished yet.
///
/// Timers are independent: fetching never cancels them and failures are
/// logged once, never retried. Only [`RetentionReaper::shutdown`] cancels a
/// timer, and it deletes the workspace on the spot instead.
#[derive(Debug, Clone, Default)]
pub struct RetentionReaper {
    pending: Arc<DashMap<u64, PendingReap>>,
    rendering: Arc<DashMap<u64, PathBuf>>,
    idle: Arc<Notify>,
    next_id: Arc<AtomicU64>,
}

/// Keeps a workspace on the reaper's books while its render runs.
#[must_use = "dropping the hold releases the workspace"]
#[derive(Debug)]
pub struct RenderHold {
    id: u64,
    rendering: Arc<DashMap<u64, PathBuf>>,
    idle: Arc<Notify>,
}

impl Drop for RenderHold {
    fn drop(&mut self) {
        self.rendering.remove(&self.id);
        if self.rendering.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Handle to one scheduled deletion.
#[derive(Debug)]
pub struct RetentionTimer {
    path: PathBuf,
    delay: Duration,
    handle: JoinHandle<ReapResult>,
}

impl RetentionTimer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait for the deletion. `None` when the timer was cancelled by shutdown.
    pub async fn wait(self) -> Option<ReapResult> {
        self.handle.await.ok()
    }
}

impl RetentionReaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete `path` recursively once `delay` has elapsed.
    pub fn schedule(&self, path: PathBuf, delay: Duration) -> RetentionTimer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let target = path.clone();
        // The timer starts only once its entry is registered.
        let (armed, armed_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = armed_rx.await;
            tokio::time::sleep(delay).await;
            pending.remove(&id);
            remove_workspace(&target).await
        });

        self.pending.insert(
            id,
            PendingReap {
                path: path.clone(),
                abort: handle.abort_handle(),
            },
        );
        let _ = armed.send(());

        info!(
            target = SOURCE,
            path = %path.display(),
            delay_secs = delay.as_secs_f64(),
            "scheduled workspace deletion"
        );
        RetentionTimer {
            path,
            delay,
            handle,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Register a workspace whose render is about to start. Shutdown deletes
    /// it even if the render never reaches its retention timer.
    pub fn hold(&self, path: PathBuf) -> RenderHold {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rendering.insert(id, path);
        RenderHold {
            id,
            rendering: Arc::clone(&self.rendering),
            idle: Arc::clone(&self.idle),
        }
    }

    pub fn rendering(&self) -> usize {
        self.rendering.len()
    }

    /// Resolve once no render holds a workspace.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.rendering.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel every pending timer and delete its workspace immediately, along
    /// with the workspaces of renders still in progress.
    pub async fn shutdown(&self) -> usize {
        let rendering: Vec<PathBuf> = self
            .rendering
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut removed = 0;
        for path in rendering {
            warn!(
                target = SOURCE,
                path = %path.display(),
                "render still in progress at shutdown; deleting its workspace"
            );
            if remove_workspace(&path).await == ReapResult::Removed {
                removed += 1;
            }
        }

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let Some((_, reap)) = self.pending.remove(&id) else {
                continue;
            };
            reap.abort.abort();
            if remove_workspace(&reap.path).await == ReapResult::Removed {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(
                target = SOURCE,
                removed,
                "deleted pending workspaces during shutdown"
            );
        }
        removed
    }
}

async fn remove_workspace(path: &Path) -> ReapResult {
    let result = match fs::remove_dir_all(path).await {
        Ok(()) => {
            info!(target = SOURCE, path = %path.display(), "deleted workspace");
            ReapResult::Removed
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(
                target = SOURCE,
                path = %path.display(),
                "workspace already removed"
            );
            ReapResult::AlreadyGone
        }
        Err(err) => {
            error!(
                target = SOURCE,
                path = %path.display(),
                error = %err,
                "an error occurred while removing workspace"
            );
            ReapResult::Failed
        }
    };
    counter!("md2pdf_reaped_total", "result" => result.as_str()).increment(1);
    result
}
