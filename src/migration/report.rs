use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use super::detect::LayoutVersion;
use crate::engine::AccountId;
use crate::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyFormat {
    Format1,
    Format2,
}

impl LegacyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyFormat::Format1 => "format1",
            LegacyFormat::Format2 => "format2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StickerOutcome {
    NotPresent,
    Relocated { target: PathBuf },
    /// The move failed; the account is migrated regardless.
    Failed { code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigratedAccount {
    pub format: LegacyFormat,
    pub source: PathBuf,
    pub account_id: AccountId,
    pub stickers: StickerOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCandidate {
    pub format: LegacyFormat,
    pub source: PathBuf,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: AppError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<CleanupFailure>,
}

/// What a migration run did. `performed` is false when nothing needed doing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub performed: bool,
    pub layout: Vec<LayoutVersion>,
    pub migrated: Vec<MigratedAccount>,
    pub skipped: Vec<SkippedCandidate>,
    pub failed: Vec<SkippedCandidate>,
    pub cleanup: CleanupSummary,
    pub skipped_reasons: BTreeMap<String, u64>,
}

impl MigrationReport {
    pub(crate) fn not_performed(layout: Vec<LayoutVersion>) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    pub(crate) fn record_migrated(&mut self, account: MigratedAccount) {
        self.migrated.push(account);
    }

    pub(crate) fn record_skip(&mut self, candidate: SkippedCandidate) {
        *self
            .skipped_reasons
            .entry(candidate.reason.clone())
            .or_insert(0) += 1;
        self.skipped.push(candidate);
    }

    pub(crate) fn record_failure(&mut self, candidate: SkippedCandidate) {
        *self
            .skipped_reasons
            .entry(candidate.reason.clone())
            .or_insert(0) += 1;
        self.failed.push(candidate);
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        self.migrated.iter().map(|a| a.account_id).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.cleanup.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_and_failure_reasons_are_counted_together() {
        let mut report = MigrationReport::default();
        report.record_skip(SkippedCandidate {
            format: LegacyFormat::Format2,
            source: PathBuf::from("/a/accounts_old/x"),
            reason: "missing_database".into(),
            error: None,
        });
        report.record_failure(SkippedCandidate {
            format: LegacyFormat::Format1,
            source: PathBuf::from("/a/userA"),
            reason: "ENGINE/NOT_A_DATABASE".into(),
            error: Some(AppError::new("ENGINE/NOT_A_DATABASE", "bad")),
        });
        report.record_skip(SkippedCandidate {
            format: LegacyFormat::Format2,
            source: PathBuf::from("/a/accounts_old/y"),
            reason: "missing_database".into(),
            error: None,
        });

        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped_reasons.get("missing_database"), Some(&2));
        assert!(!report.is_clean());
    }

    #[test]
    fn serializes_sticker_outcome_with_status_tag() {
        let value = serde_json::to_value(StickerOutcome::Relocated {
            target: PathBuf::from("/s/stickers"),
        })
        .expect("serialize");
        assert_eq!(value["status"], "relocated");
        assert_eq!(value["target"], "/s/stickers");
    }
}
