//! Phase workers and the loop plumbing they share.

pub mod phase1;
pub mod phase2;
pub mod phase3;
pub mod phase4;

use std::{fs, path::PathBuf, time::Duration};

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};
use crate::monitor::ResourceSnapshot;
use crate::store::WorkStore;

/// A worker exits with code 3 after this many consecutive filesystem
/// failures; isolated fs errors only release the claim and move on.
const MAX_CONSECUTIVE_FS_ERRORS: u32 = 3;

/// Everything a phase worker loop needs besides its inputs.
pub struct WorkerCtx {
    pub store: WorkStore,
    pub machine: String,
    pub instance: usize,
    pub host: String,
    pub stale_lock_ttl: Duration,
    pub throttle: watch::Receiver<ResourceSnapshot>,
    pub shutdown: CancellationToken,
}

impl WorkerCtx {
    /// Inter-item checkpoint: wait while the throttle signal is raised.
    /// Returns false when shutdown was requested instead.
    pub async fn checkpoint(&mut self) -> bool {
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if !self.throttle.borrow().throttled {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                result = self.throttle.changed() => {
                    if result.is_err() {
                        // Monitor gone; run unthrottled.
                        return true;
                    }
                }
            }
        }
    }
}

/// Tracks repeated filesystem failures across a worker loop.
#[derive(Default)]
pub struct FsErrorStreak(u32);

impl FsErrorStreak {
    pub fn record(&mut self, item_id: &str, error: &PipelineError) -> PipelineResult<()> {
        self.0 += 1;
        tracing::error!("fs error on {item_id}: {error} (streak {})", self.0);
        if self.0 >= MAX_CONSECUTIVE_FS_ERRORS {
            return Err(PipelineError::Aborted(format!(
                "{MAX_CONSECUTIVE_FS_ERRORS} consecutive filesystem errors"
            )));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Per-instance counters, persisted next to the pidfiles so `status` can
/// aggregate them.
#[derive(Debug, Default, Serialize)]
pub struct PhaseStats {
    pub phase: u8,
    pub instance: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub by_kind: HashMap<String, u64>,
}

impl PhaseStats {
    pub fn new(phase: u8, instance: usize) -> Self {
        PhaseStats {
            phase,
            instance,
            ..Default::default()
        }
    }

    pub fn count_kind(&mut self, kind: impl ToString) {
        *self.by_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn save(&self, ctx: &WorkerCtx) -> std::io::Result<PathBuf> {
        let dir = ctx.store.run_dir(&ctx.machine);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("phase{}-{}.stats.json", self.phase, self.instance));
        fs::write(&path, serde_json::to_vec_pretty(self).unwrap_or_default())?;
        Ok(path)
    }

    pub fn log_summary(&self) {
        tracing::info!(
            "phase {} instance {}: processed {} succeeded {} failed {} skipped {} deferred {}",
            self.phase,
            self.instance,
            self.processed,
            self.succeeded,
            self.failed,
            self.skipped,
            self.deferred,
        );
        for (kind, count) in &self.by_kind {
            tracing::info!("  {kind}: {count}");
        }
    }

    /// Exit code for the worker process: partial completion when anything
    /// failed, success otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            2
        } else {
            0
        }
    }
}
