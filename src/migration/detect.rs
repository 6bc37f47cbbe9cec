//! Layout detection.
//!
//! Detection only reads the filesystem. Every run derives the layout afresh,
//! which is what makes the migration safe to call on every start.

use std::io;
use std::path::Path;

use serde::Serialize;
use tokio::fs;

use super::format1::LegacyAccountFolder;
use super::paths::{legacy_db_path, AccountPaths};
use super::ERR_PARENT_UNREADABLE;
use crate::migration_log;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutVersion {
    Current,
    LegacyFormat1,
    LegacyFormat2,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReason {
    AccountFolder,
    NotADirectory,
    SymbolicLink,
    MissingDatabase,
    DatabaseNotAFile,
    DatabaseSymlink,
    ProbeFailed(io::ErrorKind),
}

impl ProbeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeReason::AccountFolder => "account_folder",
            ProbeReason::NotADirectory => "not_a_directory",
            ProbeReason::SymbolicLink => "symbolic_link",
            ProbeReason::MissingDatabase => "missing_database",
            ProbeReason::DatabaseNotAFile => "database_not_a_file",
            ProbeReason::DatabaseSymlink => "database_symlink",
            ProbeReason::ProbeFailed(_) => "probe_failed",
        }
    }
}

/// Result of inspecting one candidate folder. Probing never fails: any I/O
/// error becomes [`ProbeReason::ProbeFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderProbe {
    pub is_account_folder: bool,
    pub reason: ProbeReason,
}

impl FolderProbe {
    fn rejected(reason: ProbeReason) -> Self {
        Self {
            is_account_folder: false,
            reason,
        }
    }
}

pub async fn probe_account_folder(path: &Path) -> FolderProbe {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) => return probe_failed(path, err),
    };
    if meta.file_type().is_symlink() {
        return FolderProbe::rejected(ProbeReason::SymbolicLink);
    }
    if !meta.is_dir() {
        return FolderProbe::rejected(ProbeReason::NotADirectory);
    }

    let db = legacy_db_path(path);
    // Links are rejected even when they point at a regular file.
    match fs::symlink_metadata(&db).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            FolderProbe::rejected(ProbeReason::DatabaseSymlink)
        }
        Ok(meta) if meta.is_file() => FolderProbe {
            is_account_folder: true,
            reason: ProbeReason::AccountFolder,
        },
        Ok(_) => FolderProbe::rejected(ProbeReason::DatabaseNotAFile),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            FolderProbe::rejected(ProbeReason::MissingDatabase)
        }
        Err(err) => probe_failed(&db, err),
    }
}

fn probe_failed(path: &Path, err: io::Error) -> FolderProbe {
    migration_log!(
        level: debug,
        event: "probe_account_folder",
        outcome: "error",
        path = path,
        error = tracing::field::display(&err),
    );
    FolderProbe::rejected(ProbeReason::ProbeFailed(err.kind()))
}

/// Where the Format 2 tree is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format2Source {
    /// Still in the working directory; must be staged before the engine starts.
    WorkingDir,
    /// Already staged by an earlier, interrupted run.
    Staged,
}

#[derive(Debug, Clone, Default)]
pub struct LayoutDetection {
    pub versions: Vec<LayoutVersion>,
    pub format1: Vec<LegacyAccountFolder>,
    pub format2: Option<Format2Source>,
}

impl LayoutDetection {
    pub fn is_current(&self) -> bool {
        self.versions.contains(&LayoutVersion::Current)
    }

    pub fn needs_migration(&self) -> bool {
        !self.is_current() && (!self.format1.is_empty() || self.format2.is_some())
    }
}

pub async fn detect_layout(paths: &AccountPaths) -> AppResult<LayoutDetection> {
    if fs::try_exists(paths.manifest()).await.unwrap_or(false) {
        migration_log!(
            level: debug,
            event: "detect_layout",
            outcome: "current",
            path = paths.manifest(),
        );
        return Ok(LayoutDetection {
            versions: vec![LayoutVersion::Current],
            ..LayoutDetection::default()
        });
    }

    let mut detection = LayoutDetection {
        format1: scan_format1(paths).await?,
        format2: detect_format2(paths).await?,
        ..LayoutDetection::default()
    };
    if !detection.format1.is_empty() {
        detection.versions.push(LayoutVersion::LegacyFormat1);
    }
    if detection.format2.is_some() {
        detection.versions.push(LayoutVersion::LegacyFormat2);
    }
    if detection.versions.is_empty() {
        detection.versions.push(LayoutVersion::None);
    }

    migration_log!(
        level: debug,
        event: "detect_layout",
        outcome: "detected",
        path = paths.working_dir(),
        format1_candidates = detection.format1.len(),
        format2 = detection.format2.is_some(),
    );
    Ok(detection)
}

async fn scan_format1(paths: &AccountPaths) -> AppResult<Vec<LegacyAccountFolder>> {
    let parent = paths.parent();
    let mut entries = match fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(parent_unreadable(err, parent)),
    };

    let mut candidates = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => return Err(parent_unreadable(err, parent)),
        };
        let name = entry.file_name();
        if paths.is_reserved_name(&name) {
            continue;
        }
        let path = entry.path();
        let probe = probe_account_folder(&path).await;
        if probe.is_account_folder {
            candidates.push(LegacyAccountFolder::new(&path));
        } else {
            migration_log!(
                level: trace,
                event: "probe_account_folder",
                outcome: "rejected",
                path = &path,
                reason = probe.reason.as_str(),
            );
        }
    }
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(candidates)
}

async fn detect_format2(paths: &AccountPaths) -> AppResult<Option<Format2Source>> {
    let working = paths.working_dir();
    let staged = paths.staged_dir();
    let working_is_dir = is_dir(working).await;
    let staged_is_dir = is_dir(&staged).await;

    if working_is_dir && !dir_is_empty(working).await? {
        return Ok(Some(Format2Source::WorkingDir));
    }
    if staged_is_dir {
        return Ok(Some(Format2Source::Staged));
    }
    if working_is_dir {
        return Ok(Some(Format2Source::WorkingDir));
    }
    Ok(None)
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

async fn dir_is_empty(path: &Path) -> AppResult<bool> {
    let mut entries = fs::read_dir(path)
        .await
        .map_err(|err| AppError::io(err, "detect_list_working_dir", path))?;
    let first = entries
        .next_entry()
        .await
        .map_err(|err| AppError::io(err, "detect_list_working_dir", path))?;
    Ok(first.is_none())
}

fn parent_unreadable(err: io::Error, parent: &Path) -> AppError {
    AppError::new(
        ERR_PARENT_UNREADABLE,
        "Could not list the directory that holds the accounts directory.",
    )
    .with_context("path", parent.display().to_string())
    .with_cause(AppError::io(err, "detect_list_parent", parent))
}
