//! Removal of legacy folders whose contents have been handed to the engine.
//!
//! Only empty folders are removed. Anything the engine did not take stays on
//! disk and the removal failure is reported, never retried.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use super::paths::RESIDUE_FILE;
use super::report::{CleanupFailure, CleanupSummary};
use crate::migration_log;
use crate::AppError;

#[derive(Debug, Clone, Default)]
pub struct CleanupPlan {
    folders: Vec<PathBuf>,
    roots: Vec<PathBuf>,
}

impl CleanupPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a migrated account folder.
    pub fn push_folder(&mut self, path: PathBuf) {
        self.folders.push(path);
    }

    /// Schedule a container swept after every folder, such as the staged tree.
    pub fn push_root(&mut self, path: PathBuf) {
        self.roots.push(path);
    }
}

pub async fn sweep(plan: CleanupPlan) -> CleanupSummary {
    let mut summary = CleanupSummary::default();
    for folder in plan.folders {
        sweep_one(folder, false, &mut summary).await;
    }
    for root in plan.roots {
        sweep_one(root, true, &mut summary).await;
    }
    summary
}

async fn sweep_one(path: PathBuf, is_root: bool, summary: &mut CleanupSummary) {
    let _ = fs::remove_file(path.join(RESIDUE_FILE)).await;
    match fs::remove_dir(&path).await {
        Ok(()) => {
            migration_log!(
                level: debug,
                event: "cleanup_folder",
                outcome: "removed",
                path = &path,
            );
            summary.removed.push(path);
        }
        Err(err) => {
            report_failure(&path, &err, is_root);
            summary.failures.push(CleanupFailure {
                error: AppError::io(err, "cleanup_remove_dir", &path),
                path,
            });
        }
    }
}

fn report_failure(path: &Path, err: &io::Error, is_root: bool) {
    if is_root {
        migration_log!(
            level: warn,
            event: "cleanup_staged_root",
            outcome: "kept",
            path = path,
            error = tracing::field::display(err),
        );
    } else {
        migration_log!(
            level: error,
            event: "cleanup_folder",
            outcome: "error",
            path = path,
            error = tracing::field::display(err),
        );
    }
}
