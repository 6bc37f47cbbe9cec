//! Account storage migration.
//!
//! Runs before any account is opened. Detects whether the data directory is
//! still in one of the legacy layouts and hands every legacy account to a
//! transient engine rooted at the accounts directory. Once the engine has
//! written `accounts.toml` every later run is a no-op.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;

use crate::engine::{AccountEngine, AccountId, EngineEvent, EngineLauncher, EventListener};
use crate::migration_log;
use crate::{AppError, AppResult};

pub mod cleanup;
pub mod detect;
pub mod format1;
pub mod format2;
pub mod logging;
pub mod paths;
pub mod report;

use cleanup::CleanupPlan;
use detect::{detect_layout, Format2Source, LayoutDetection};
use format1::Format1Migrator;
use format2::Format2Migrator;
use paths::AccountPaths;
use report::{LegacyFormat, MigratedAccount, SkippedCandidate, StickerOutcome};

pub use detect::LayoutVersion;
pub use report::MigrationReport;

pub const ERR_PARENT_UNREADABLE: &str = "MIGRATION/PARENT_UNREADABLE";
pub const ERR_STAGE_RENAME: &str = "MIGRATION/STAGE_RENAME";
pub const ERR_STAGE_EXISTS: &str = "MIGRATION/STAGE_EXISTS";
pub const ERR_ENGINE_START: &str = "MIGRATION/ENGINE_START";
pub const ERR_BLOBDIR_MISSING: &str = "MIGRATION/BLOBDIR_MISSING";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Abort on the first per-account failure instead of skipping the account.
    pub strict: bool,
}

impl MigrationOptions {
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Migrated {
        cleanup: PathBuf,
        account_id: AccountId,
        stickers: StickerOutcome,
    },
    Skipped {
        reason: String,
    },
}

/// One legacy layout. Both layouts are driven through the same loop.
#[async_trait]
pub trait LegacyMigrator: Send + Sync {
    type Candidate: Send + 'static;

    fn format(&self) -> LegacyFormat;

    /// Directory the candidates are read from.
    fn root(&self) -> &Path;

    async fn detect(&self) -> AppResult<Vec<Self::Candidate>>;

    fn source_path<'a>(&self, candidate: &'a Self::Candidate) -> &'a Path;

    async fn migrate_one(
        &self,
        engine: &dyn AccountEngine,
        candidate: Self::Candidate,
    ) -> AppResult<CandidateOutcome>;
}

/// Migrate legacy accounts under `working_dir` if any exist.
///
/// Returns whether migration work was performed.
pub async fn migrate_accounts_if_needed(
    launcher: &dyn EngineLauncher,
    working_dir: &Path,
    options: MigrationOptions,
) -> AppResult<bool> {
    let report = migrate_accounts(launcher, working_dir, options).await?;
    Ok(report.performed)
}

pub async fn migrate_accounts(
    launcher: &dyn EngineLauncher,
    working_dir: &Path,
    options: MigrationOptions,
) -> AppResult<MigrationReport> {
    let paths = AccountPaths::new(working_dir);
    let detection = detect_layout(&paths).await?;
    if !detection.needs_migration() {
        migration_log!(
            level: debug,
            event: "migrate_accounts",
            outcome: "not_needed",
            path = paths.working_dir(),
        );
        return Ok(MigrationReport::not_performed(detection.versions));
    }

    migration_log!(
        level: info,
        event: "migrate_accounts",
        outcome: "started",
        path = paths.working_dir(),
        format1_candidates = detection.format1.len(),
        format2 = detection.format2.is_some(),
        strict = options.strict,
    );

    if detection.format2 == Some(Format2Source::WorkingDir) {
        stage_working_dir(&paths).await?;
    }

    let engine = launcher.start(paths.working_dir()).await.map_err(|err| {
        AppError::new(ERR_ENGINE_START, "Could not start the account engine.")
            .with_context("path", paths.working_dir().display().to_string())
            .with_cause(err)
    })?;
    let listener: EventListener = Arc::new(log_engine_event);
    let listener_id = engine.on_event(listener);

    let mut report = MigrationReport {
        performed: true,
        layout: detection.versions.clone(),
        ..MigrationReport::default()
    };
    let mut plan = CleanupPlan::new();
    let result = run_migrators(
        engine.as_ref(),
        &paths,
        &detection,
        options,
        &mut report,
        &mut plan,
    )
    .await;

    engine.off_event(listener_id);
    if let Err(err) = engine.close().await {
        migration_log!(
            level: warn,
            event: "engine_close",
            outcome: "error",
            path = paths.working_dir(),
            error = tracing::field::display(&err),
        );
    }
    drop(engine);

    if let Err(err) = result {
        migration_log!(
            level: error,
            event: "migrate_accounts",
            outcome: "aborted",
            path = paths.working_dir(),
            error = tracing::field::display(&err),
        );
        return Err(err);
    }

    report.cleanup = cleanup::sweep(plan).await;
    migration_log!(
        level: info,
        event: "migrate_accounts",
        outcome: "finished",
        path = paths.working_dir(),
        migrated = report.migrated.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        cleanup_failures = report.cleanup.failures.len(),
    );
    Ok(report)
}

async fn stage_working_dir(paths: &AccountPaths) -> AppResult<()> {
    let working = paths.working_dir();
    let staged = paths.staged_dir();
    match fs::symlink_metadata(&staged).await {
        Ok(_) => {
            return Err(AppError::new(
                ERR_STAGE_EXISTS,
                "Both the accounts directory and a staged legacy tree exist.",
            )
            .with_context("path", working.display().to_string())
            .with_context("staged", staged.display().to_string()));
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(AppError::io(err, "stage_probe", &staged)),
    }

    fs::rename(working, &staged).await.map_err(|err| {
        AppError::new(
            ERR_STAGE_RENAME,
            "Could not move the legacy accounts directory aside.",
        )
        .with_context("path", working.display().to_string())
        .with_context("staged", staged.display().to_string())
        .with_cause(AppError::io(err, "stage_rename", working))
    })?;
    migration_log!(
        level: info,
        event: "stage_legacy_tree",
        outcome: "ok",
        path = working,
        staged = tracing::field::display(staged.display()),
    );
    Ok(())
}

async fn run_migrators(
    engine: &dyn AccountEngine,
    paths: &AccountPaths,
    detection: &LayoutDetection,
    options: MigrationOptions,
    report: &mut MigrationReport,
    plan: &mut CleanupPlan,
) -> AppResult<()> {
    let format1 = Format1Migrator::new(paths.parent(), detection.format1.clone());
    drive(&format1, engine, options, report, plan).await?;

    if detection.format2.is_some() {
        let format2 = Format2Migrator::new(paths.staged_dir());
        drive(&format2, engine, options, report, plan).await?;
        plan.push_root(paths.staged_dir());
    }
    Ok(())
}

async fn drive<M>(
    migrator: &M,
    engine: &dyn AccountEngine,
    options: MigrationOptions,
    report: &mut MigrationReport,
    plan: &mut CleanupPlan,
) -> AppResult<()>
where
    M: LegacyMigrator + ?Sized,
{
    let format = migrator.format();
    let candidates = match migrator.detect().await {
        Ok(candidates) => candidates,
        Err(err) => {
            record_failure(report, format, migrator.root(), &err);
            return if options.strict { Err(err) } else { Ok(()) };
        }
    };

    for candidate in candidates {
        let source = migrator.source_path(&candidate).to_path_buf();
        match migrator.migrate_one(engine, candidate).await {
            Ok(CandidateOutcome::Migrated {
                cleanup,
                account_id,
                stickers,
            }) => {
                plan.push_folder(cleanup);
                report.record_migrated(MigratedAccount {
                    format,
                    source,
                    account_id,
                    stickers,
                });
            }
            Ok(CandidateOutcome::Skipped { reason }) => {
                report.record_skip(SkippedCandidate {
                    format,
                    source,
                    reason,
                    error: None,
                });
            }
            Err(err) => {
                record_failure(report, format, &source, &err);
                if options.strict {
                    return Err(err);
                }
            }
        }
    }
    Ok(())
}

fn record_failure(report: &mut MigrationReport, format: LegacyFormat, source: &Path, err: &AppError) {
    migration_log!(
        level: error,
        event: "migrate_account",
        outcome: "error",
        path = source,
        format = format.as_str(),
        code = err.code(),
        error = tracing::field::display(err),
    );
    report.record_failure(SkippedCandidate {
        format,
        source: source.to_path_buf(),
        reason: err.code().to_string(),
        error: Some(err.clone()),
    });
}

fn log_engine_event(event: &EngineEvent) {
    tracing::debug!(
        target: logging::LOG_TARGET,
        event = "engine_event",
        kind = event.kind.label(),
        account_id = ?event.account_id,
        detail = event.kind.detail().unwrap_or_default(),
    );
}
