use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AccountId;
use crate::AppError;

pub const MANIFEST_FILE_NAME: &str = "accounts.toml";
pub const ERR_MANIFEST: &str = "ENGINE/MANIFEST";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse accounts manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode accounts manifest: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("accounts manifest {path} lists account {id} twice")]
    DuplicateId { path: String, id: AccountId },
}

impl From<ManifestError> for AppError {
    fn from(error: ManifestError) -> Self {
        let app_error = AppError::new(ERR_MANIFEST, error.to_string());
        match &error {
            ManifestError::Parse { path, .. } | ManifestError::DuplicateId { path, .. } => {
                app_error.with_context("path", path.clone())
            }
            ManifestError::Encode(_) => app_error,
        }
    }
}

/// One registered account. `dir` is relative to the accounts directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub dir: String,
    pub uuid: Uuid,
}

/// Contents of `accounts.toml`, the marker of the unified layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountsManifest {
    /// Zero means no account is selected.
    pub selected_account: AccountId,
    pub next_id: AccountId,
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
}

impl Default for AccountsManifest {
    fn default() -> Self {
        Self {
            selected_account: 0,
            next_id: 1,
            accounts: Vec::new(),
        }
    }
}

impl AccountsManifest {
    pub fn parse(path: &str, data: &str) -> Result<Self, ManifestError> {
        let manifest: AccountsManifest =
            toml::from_str(data).map_err(|source| ManifestError::Parse {
                path: path.to_string(),
                source,
            })?;
        let mut ids: Vec<AccountId> = manifest.accounts.iter().map(|a| a.id).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ManifestError::DuplicateId {
                path: path.to_string(),
                id: pair[0],
            });
        }
        Ok(manifest)
    }

    pub fn to_toml(&self) -> Result<String, ManifestError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn account(&self, id: AccountId) -> Option<&AccountRecord> {
        self.accounts.iter().find(|record| record.id == id)
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.iter().map(|record| record.id).collect()
    }

    /// Register a new account directory and return its id. The first account
    /// registered becomes the selected one.
    pub fn add_account(&mut self, dir: impl Into<String>, uuid: Uuid) -> AccountId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.accounts.push(AccountRecord {
            id,
            dir: dir.into(),
            uuid,
        });
        if self.selected_account == 0 {
            self.selected_account = id;
        }
        id
    }

    pub fn remove_account(&mut self, id: AccountId) -> Option<AccountRecord> {
        let index = self.accounts.iter().position(|record| record.id == id)?;
        let removed = self.accounts.remove(index);
        if self.selected_account == id {
            self.selected_account = self.accounts.first().map(|r| r.id).unwrap_or(0);
        }
        Some(removed)
    }
}
