//! The account engine seam.
//!
//! The migration engine never touches account databases itself. It starts a
//! transient engine through an [`EngineLauncher`], hands it legacy database
//! files and asks where the migrated account keeps its blobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::AppResult;

pub mod local;
pub mod manifest;

pub use local::{LocalAccountEngine, LocalEngineLauncher};

pub type AccountId = u32;

pub const ERR_ENGINE_CLOSED: &str = "ENGINE/CLOSED";
pub const ERR_UNKNOWN_ACCOUNT: &str = "ENGINE/UNKNOWN_ACCOUNT";
pub const ERR_NOT_A_DATABASE: &str = "ENGINE/NOT_A_DATABASE";
pub const ERR_BLOBS_MISSING: &str = "ENGINE/BLOBS_MISSING";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum EngineEventKind {
    Info(String),
    Warning(String),
    Error(String),
    AccountsChanged,
}

impl EngineEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EngineEventKind::Info(_) => "info",
            EngineEventKind::Warning(_) => "warning",
            EngineEventKind::Error(_) => "error",
            EngineEventKind::AccountsChanged => "accounts_changed",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            EngineEventKind::Info(msg)
            | EngineEventKind::Warning(msg)
            | EngineEventKind::Error(msg) => Some(msg.as_str()),
            EngineEventKind::AccountsChanged => None,
        }
    }
}

/// A lifecycle event emitted by an engine. Store-level events carry no account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub account_id: Option<AccountId>,
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn new(account_id: Option<AccountId>, kind: EngineEventKind) -> Self {
        Self { account_id, kind }
    }
}

pub type EventListener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Listener registry shared by engine implementations.
#[derive(Default)]
pub struct EventListeners {
    next_id: AtomicU64,
    inner: Mutex<BTreeMap<ListenerId, EventListener>>,
}

impl EventListeners {
    pub fn add(&self, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.insert(id, listener);
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.remove(&id).is_some()
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.clear();
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener. Listeners run outside the registry lock
    /// so they may attach or detach listeners themselves.
    pub fn emit(&self, event: &EngineEvent) {
        let listeners: Vec<EventListener> = {
            let guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            guard.values().cloned().collect()
        };
        for listener in listeners {
            listener(event);
        }
    }
}

/// Operations the migration engine needs from a running account engine.
#[async_trait]
pub trait AccountEngine: Send + Sync {
    /// Take ownership of a legacy database file and register it as a new account.
    async fn migrate_account(&self, db_path: &Path) -> AppResult<AccountId>;

    /// The engine-owned blob directory of `account_id`, if the engine knows it.
    async fn get_blob_dir(&self, account_id: AccountId) -> AppResult<Option<PathBuf>>;

    async fn get_all_account_ids(&self) -> AppResult<Vec<AccountId>>;

    async fn get_config(&self, account_id: AccountId, key: &str) -> AppResult<Option<String>>;

    /// Set or, with `None`, clear a config key.
    async fn set_config(
        &self,
        account_id: AccountId,
        key: &str,
        value: Option<&str>,
    ) -> AppResult<()>;

    fn on_event(&self, listener: EventListener) -> ListenerId;

    fn off_event(&self, id: ListenerId);

    /// Release the engine. Every later call fails with [`ERR_ENGINE_CLOSED`].
    async fn close(&self) -> AppResult<()>;
}

/// Starts engines rooted at an accounts directory.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn start(&self, accounts_dir: &Path) -> AppResult<Box<dyn AccountEngine>>;
}
