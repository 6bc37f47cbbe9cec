//! The flat legacy tree: `accounts/<entry>/db.sqlite` without a manifest.
//!
//! The tree is staged to `accounts_old` before the engine starts so that the
//! engine can own a fresh `accounts` directory. Entries are read from there.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::detect::{probe_account_folder, FolderProbe, ProbeReason};
use super::format1::ensure_blobs_dir;
use super::paths::{legacy_blobs_path, legacy_db_path, legacy_stickers_path, sticker_target_for};
use super::report::{LegacyFormat, StickerOutcome};
use super::{CandidateOutcome, LegacyMigrator, ERR_BLOBDIR_MISSING};
use crate::engine::{AccountEngine, AccountId};
use crate::migration_log;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAccountEntry {
    pub name: String,
    pub path: PathBuf,
    pub db_path: PathBuf,
    pub blobs_path: PathBuf,
    pub stickers_path: PathBuf,
    pub probe: FolderProbe,
}

impl LegacyAccountEntry {
    pub async fn inspect(path: PathBuf) -> Self {
        let probe = probe_account_folder(&path).await;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            db_path: legacy_db_path(&path),
            blobs_path: legacy_blobs_path(&path),
            stickers_path: legacy_stickers_path(&path),
            probe,
            path,
        }
    }
}

pub struct Format2Migrator {
    staged_dir: PathBuf,
}

impl Format2Migrator {
    pub fn new(staged_dir: impl Into<PathBuf>) -> Self {
        Self {
            staged_dir: staged_dir.into(),
        }
    }

    async fn relocate_stickers(
        &self,
        engine: &dyn AccountEngine,
        entry: &LegacyAccountEntry,
        account_id: AccountId,
    ) -> AppResult<StickerOutcome> {
        let present = fs::metadata(&entry.stickers_path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !present {
            return Ok(StickerOutcome::NotPresent);
        }

        let blob_dir = engine.get_blob_dir(account_id).await?;
        let target = blob_dir
            .as_deref()
            .and_then(sticker_target_for)
            .ok_or_else(|| {
                AppError::new(
                    ERR_BLOBDIR_MISSING,
                    "Engine did not report a blob directory for the migrated account.",
                )
                .with_context("account_id", account_id.to_string())
                .with_context("path", entry.path.display().to_string())
            })?;

        match fs::rename(&entry.stickers_path, &target).await {
            Ok(()) => {
                migration_log!(
                    level: debug,
                    event: "relocate_stickers",
                    outcome: "ok",
                    path = &entry.stickers_path,
                    target = tracing::field::display(target.display()),
                );
                Ok(StickerOutcome::Relocated { target })
            }
            Err(err) => {
                migration_log!(
                    level: warn,
                    event: "relocate_stickers",
                    outcome: "error",
                    path = &entry.stickers_path,
                    target = tracing::field::display(target.display()),
                    error = tracing::field::display(&err),
                );
                let code = AppError::from(err).code;
                Ok(StickerOutcome::Failed { code })
            }
        }
    }
}

#[async_trait]
impl LegacyMigrator for Format2Migrator {
    type Candidate = LegacyAccountEntry;

    fn format(&self) -> LegacyFormat {
        LegacyFormat::Format2
    }

    fn root(&self) -> &Path {
        &self.staged_dir
    }

    async fn detect(&self) -> AppResult<Vec<LegacyAccountEntry>> {
        let list_err = |err: io::Error| AppError::io(err, "list_staged_dir", &self.staged_dir);
        let mut entries = match fs::read_dir(&self.staged_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(list_err(err)),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            paths.push(entry.path());
        }
        paths.sort();

        let mut candidates = Vec::with_capacity(paths.len());
        for path in paths {
            candidates.push(LegacyAccountEntry::inspect(path).await);
        }
        Ok(candidates)
    }

    fn source_path<'a>(&self, candidate: &'a LegacyAccountEntry) -> &'a Path {
        &candidate.path
    }

    async fn migrate_one(
        &self,
        engine: &dyn AccountEngine,
        entry: LegacyAccountEntry,
    ) -> AppResult<CandidateOutcome> {
        match entry.probe.reason {
            ProbeReason::AccountFolder => {}
            ProbeReason::NotADirectory | ProbeReason::SymbolicLink => {
                return Ok(CandidateOutcome::Skipped {
                    reason: entry.probe.reason.as_str().to_string(),
                });
            }
            ProbeReason::MissingDatabase
            | ProbeReason::DatabaseNotAFile
            | ProbeReason::DatabaseSymlink => {
                migration_log!(
                    level: warn,
                    event: "migrate_account",
                    outcome: "skipped",
                    path = &entry.path,
                    format = "format2",
                    reason = entry.probe.reason.as_str(),
                );
                return Ok(CandidateOutcome::Skipped {
                    reason: entry.probe.reason.as_str().to_string(),
                });
            }
            ProbeReason::ProbeFailed(kind) => {
                return Err(AppError::io(
                    io::Error::from(kind),
                    "stat_staged_entry",
                    &entry.path,
                ));
            }
        }

        ensure_blobs_dir(&entry.blobs_path).await?;
        let account_id = engine.migrate_account(&entry.db_path).await?;
        let stickers = self
            .relocate_stickers(engine, &entry, account_id)
            .await
            .map_err(|err| err.with_context("account_id", account_id.to_string()))?;

        migration_log!(
            level: info,
            event: "migrate_account",
            outcome: "ok",
            path = &entry.path,
            format = "format2",
            account_id = account_id,
        );
        Ok(CandidateOutcome::Migrated {
            cleanup: entry.path,
            account_id,
            stickers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn detect_lists_staged_entries_in_name_order() {
        let dir = tempdir().expect("tempdir");
        let staged = dir.path().join("accounts_old");
        for name in ["b", "a"] {
            let entry = staged.join(name);
            std::fs::create_dir_all(&entry).expect("mkdir");
            std::fs::write(entry.join("db.sqlite"), b"x").expect("db");
        }
        std::fs::write(staged.join("stray.txt"), b"x").expect("file");

        let migrator = Format2Migrator::new(&staged);
        let entries = migrator.detect().await.expect("detect");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "stray.txt"]);
        assert!(entries[0].probe.is_account_folder);
        assert_eq!(entries[2].probe.reason, ProbeReason::NotADirectory);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn linked_entries_are_skipped_without_touching_the_engine() {
        use crate::engine::LocalAccountEngine;

        let dir = tempdir().expect("tempdir");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(outside.join("db.sqlite-blobs")).expect("mkdir");
        std::fs::write(outside.join("db.sqlite"), b"x").expect("db");
        let staged = dir.path().join("accounts_old");
        std::fs::create_dir_all(staged.join("linked_db")).expect("mkdir");
        std::os::unix::fs::symlink(&outside, staged.join("linked_dir")).expect("symlink");
        std::os::unix::fs::symlink(outside.join("db.sqlite"), staged.join("linked_db/db.sqlite"))
            .expect("symlink");

        let engine = LocalAccountEngine::open(dir.path().join("accounts"))
            .await
            .expect("open");
        let migrator = Format2Migrator::new(&staged);
        let mut reasons = Vec::new();
        for entry in migrator.detect().await.expect("detect") {
            match migrator.migrate_one(&engine, entry).await.expect("migrate") {
                CandidateOutcome::Skipped { reason } => reasons.push(reason),
                CandidateOutcome::Migrated { .. } => panic!("linked entry was migrated"),
            }
        }

        assert_eq!(reasons, vec!["database_symlink", "symbolic_link"]);
        assert!(engine.get_all_account_ids().await.expect("ids").is_empty());
        assert!(outside.join("db.sqlite").is_file());
    }

    #[tokio::test]
    async fn detect_on_missing_stage_is_empty() {
        let dir = tempdir().expect("tempdir");
        let migrator = Format2Migrator::new(dir.path().join("accounts_old"));
        assert!(migrator.detect().await.expect("detect").is_empty());
    }
}
