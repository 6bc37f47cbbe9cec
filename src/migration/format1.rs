//! Per-folder legacy accounts: sibling directories of the accounts directory
//! that each hold one `db.sqlite`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::paths::{legacy_blobs_path, legacy_db_path};
use super::report::{LegacyFormat, StickerOutcome};
use super::{CandidateOutcome, LegacyMigrator};
use crate::engine::AccountEngine;
use crate::migration_log;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAccountFolder {
    pub name: String,
    pub path: PathBuf,
    pub db_path: PathBuf,
    pub blobs_path: PathBuf,
}

impl LegacyAccountFolder {
    pub fn new(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            path: path.to_path_buf(),
            db_path: legacy_db_path(path),
            blobs_path: legacy_blobs_path(path),
        }
    }
}

/// Create the blob directory the engine expects next to a legacy database.
pub async fn ensure_blobs_dir(blobs: &Path) -> AppResult<()> {
    fs::create_dir_all(blobs)
        .await
        .map_err(|err| AppError::io(err, "ensure_blobs_dir", blobs))
}

/// Migrates the folders found by layout detection.
pub struct Format1Migrator {
    parent: PathBuf,
    folders: Vec<LegacyAccountFolder>,
}

impl Format1Migrator {
    pub fn new(parent: impl Into<PathBuf>, folders: Vec<LegacyAccountFolder>) -> Self {
        Self {
            parent: parent.into(),
            folders,
        }
    }
}

#[async_trait]
impl LegacyMigrator for Format1Migrator {
    type Candidate = LegacyAccountFolder;

    fn format(&self) -> LegacyFormat {
        LegacyFormat::Format1
    }

    fn root(&self) -> &Path {
        &self.parent
    }

    async fn detect(&self) -> AppResult<Vec<LegacyAccountFolder>> {
        Ok(self.folders.clone())
    }

    fn source_path<'a>(&self, candidate: &'a LegacyAccountFolder) -> &'a Path {
        &candidate.path
    }

    async fn migrate_one(
        &self,
        engine: &dyn AccountEngine,
        folder: LegacyAccountFolder,
    ) -> AppResult<CandidateOutcome> {
        ensure_blobs_dir(&folder.blobs_path).await?;
        let account_id = engine.migrate_account(&folder.db_path).await?;
        migration_log!(
            level: info,
            event: "migrate_account",
            outcome: "ok",
            path = &folder.path,
            format = "format1",
            account_id = account_id,
        );
        Ok(CandidateOutcome::Migrated {
            cleanup: folder.path,
            account_id,
            stickers: StickerOutcome::NotPresent,
        })
    }
}
