#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use account_migrate_lib::engine::manifest::{AccountsManifest, MANIFEST_FILE_NAME};
use account_migrate_lib::engine::{
    AccountEngine, AccountId, EngineLauncher, EventListener, ListenerId, LocalAccountEngine,
};
use account_migrate_lib::{AppError, AppResult};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use tempfile::TempDir;
use walkdir::WalkDir;

pub const INJECTED_CODE: &str = "TEST/INJECTED";
pub const START_FAILED_CODE: &str = "TEST/START";

/// Temp data dir shaped like `<tmp>/DeltaChat/accounts`.
pub struct Fixture {
    _tmp: TempDir,
    pub parent: PathBuf,
    pub working: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let parent = tmp.path().join("DeltaChat");
        std::fs::create_dir_all(&parent).expect("create parent");
        let working = parent.join("accounts");
        Self {
            _tmp: tmp,
            parent,
            working,
        }
    }

    pub fn staged(&self) -> PathBuf {
        self.parent.join("accounts_old")
    }

    pub fn manifest(&self) -> AccountsManifest {
        let path = self.working.join(MANIFEST_FILE_NAME);
        let data = std::fs::read_to_string(&path).expect("read accounts.toml");
        AccountsManifest::parse(&path.display().to_string(), &data).expect("parse accounts.toml")
    }

    pub fn account_dir(&self, id: AccountId) -> PathBuf {
        let manifest = self.manifest();
        let record = manifest.account(id).expect("account registered");
        self.working.join(&record.dir)
    }
}

/// Create a legacy SQLite database with the `config` table and an `addr` row.
pub async fn write_legacy_db(path: &Path, addr: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .connect()
        .await?;
    sqlx::query(
        "CREATE TABLE config (id INTEGER PRIMARY KEY, keyname TEXT UNIQUE, value TEXT)",
    )
    .execute(&mut conn)
    .await?;
    sqlx::query("INSERT INTO config (keyname, value) VALUES ('addr', ?1)")
        .bind(addr)
        .execute(&mut conn)
        .await?;
    conn.close().await?;
    Ok(())
}

/// Lay out `folder/{db.sqlite, db.sqlite-blobs/<blob>}`.
pub async fn seed_account_folder(folder: &Path, addr: &str) -> anyhow::Result<()> {
    write_legacy_db(&folder.join("db.sqlite"), addr).await?;
    let blobs = folder.join("db.sqlite-blobs");
    std::fs::create_dir_all(&blobs)?;
    std::fs::write(blobs.join("avatar.png"), addr.as_bytes())?;
    Ok(())
}

pub fn write_garbage_db(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    let garbage = b"this is not a sqlite database\n".repeat(160);
    std::fs::write(path, garbage).expect("write garbage");
}

pub async fn read_config(db: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let mut conn = SqliteConnectOptions::new()
        .filename(db)
        .create_if_missing(false)
        .connect()
        .await?;
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM config WHERE keyname = ?1")
            .bind(key)
            .fetch_optional(&mut conn)
            .await?;
    conn.close().await?;
    Ok(value.flatten())
}

/// Sorted relative paths of everything under `root`.
pub fn tree_snapshot(root: &Path) -> Vec<String> {
    let mut entries: Vec<String> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .expect("inside root")
                .display()
                .to_string()
        })
        .collect();
    entries.sort();
    entries
}

/// Failure injection for [`ScriptedLauncher`].
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// `migrate_account` fails for database paths containing any of these.
    pub fail_migrate_containing: Vec<String>,
    pub fail_start: bool,
    /// `get_blob_dir` answers `None` for every account.
    pub hide_blob_dirs: bool,
    /// `get_blob_dir` answers a path whose parent does not exist.
    pub detached_blob_dirs: bool,
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub starts: AtomicUsize,
    pub closes: AtomicUsize,
    pub migrated: Mutex<Vec<PathBuf>>,
}

impl Recorder {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn migrate_calls(&self) -> Vec<PathBuf> {
        self.migrated.lock().unwrap().clone()
    }
}

/// Launches a real local store wrapped in a recording, failure-injecting engine.
#[derive(Default)]
pub struct ScriptedLauncher {
    pub script: Script,
    pub recorder: Arc<Recorder>,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            recorder: Arc::new(Recorder::default()),
        }
    }

    pub fn failing_on(fragment: &str) -> Self {
        Self::new(Script {
            fail_migrate_containing: vec![fragment.to_string()],
            ..Script::default()
        })
    }
}

#[async_trait]
impl EngineLauncher for ScriptedLauncher {
    async fn start(&self, accounts_dir: &Path) -> AppResult<Box<dyn AccountEngine>> {
        self.recorder.starts.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_start {
            return Err(AppError::new(START_FAILED_CODE, "scripted start failure"));
        }
        let inner = LocalAccountEngine::open(accounts_dir).await?;
        Ok(Box::new(ScriptedEngine {
            inner,
            script: self.script.clone(),
            recorder: self.recorder.clone(),
        }))
    }
}

pub struct ScriptedEngine {
    inner: LocalAccountEngine,
    script: Script,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl AccountEngine for ScriptedEngine {
    async fn migrate_account(&self, db_path: &Path) -> AppResult<AccountId> {
        self.recorder
            .migrated
            .lock()
            .unwrap()
            .push(db_path.to_path_buf());
        let text = db_path.display().to_string();
        if self
            .script
            .fail_migrate_containing
            .iter()
            .any(|fragment| text.contains(fragment.as_str()))
        {
            return Err(AppError::new(INJECTED_CODE, "scripted migrate failure")
                .with_context("path", text));
        }
        self.inner.migrate_account(db_path).await
    }

    async fn get_blob_dir(&self, account_id: AccountId) -> AppResult<Option<PathBuf>> {
        if self.script.hide_blob_dirs {
            return Ok(None);
        }
        if self.script.detached_blob_dirs {
            return Ok(Some(
                self.inner
                    .root()
                    .join("detached")
                    .join(account_id.to_string())
                    .join("dc.db-blobs"),
            ));
        }
        self.inner.get_blob_dir(account_id).await
    }

    async fn get_all_account_ids(&self) -> AppResult<Vec<AccountId>> {
        self.inner.get_all_account_ids().await
    }

    async fn get_config(&self, account_id: AccountId, key: &str) -> AppResult<Option<String>> {
        self.inner.get_config(account_id, key).await
    }

    async fn set_config(
        &self,
        account_id: AccountId,
        key: &str,
        value: Option<&str>,
    ) -> AppResult<()> {
        self.inner.set_config(account_id, key, value).await
    }

    fn on_event(&self, listener: EventListener) -> ListenerId {
        self.inner.on_event(listener)
    }

    fn off_event(&self, id: ListenerId) {
        self.inner.off_event(id)
    }

    async fn close(&self) -> AppResult<()> {
        self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}
