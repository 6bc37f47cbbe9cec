//! File-backed account store that owns the unified layout.
//!
//! Layout under the accounts directory:
//!
//! ```text
//! accounts.toml
//! <uuid>/dc.db
//! <uuid>/dc.db-blobs/
//! ```

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::manifest::{AccountsManifest, MANIFEST_FILE_NAME};
use super::{
    AccountEngine, AccountId, EngineEvent, EngineEventKind, EngineLauncher, EventListener,
    EventListeners, ListenerId, ERR_BLOBS_MISSING, ERR_ENGINE_CLOSED, ERR_NOT_A_DATABASE,
    ERR_UNKNOWN_ACCOUNT,
};
use crate::migration::logging::LOG_TARGET;
use crate::{AppError, AppResult};

pub const ACCOUNT_DB_FILE: &str = "dc.db";
pub const ACCOUNT_BLOBS_DIR: &str = "dc.db-blobs";
const SQLITE_SIDECARS: &[&str] = &["-wal", "-shm"];

/// Starts [`LocalAccountEngine`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEngineLauncher;

#[async_trait]
impl EngineLauncher for LocalEngineLauncher {
    async fn start(&self, accounts_dir: &Path) -> AppResult<Box<dyn AccountEngine>> {
        let engine = LocalAccountEngine::open(accounts_dir).await?;
        Ok(Box::new(engine))
    }
}

pub struct LocalAccountEngine {
    root: PathBuf,
    manifest: Mutex<AccountsManifest>,
    listeners: EventListeners,
    closed: AtomicBool,
}

impl LocalAccountEngine {
    /// Open the store at `root`, creating the directory and an empty manifest
    /// when they do not exist yet.
    pub async fn open(root: impl AsRef<Path>) -> AppResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|err| AppError::io(err, "engine_create_root", &root))?;

        let manifest_path = root.join(MANIFEST_FILE_NAME);
        let manifest = match fs::read_to_string(&manifest_path).await {
            Ok(data) => AccountsManifest::parse(&manifest_path.display().to_string(), &data)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let manifest = AccountsManifest::default();
                write_manifest(&manifest_path, &manifest).await?;
                manifest
            }
            Err(err) => return Err(AppError::io(err, "engine_read_manifest", &manifest_path)),
        };

        tracing::debug!(
            target: LOG_TARGET,
            event = "engine_opened",
            root = %root.display(),
            accounts = manifest.accounts.len(),
        );

        Ok(Self {
            root,
            manifest: Mutex::new(manifest),
            listeners: EventListeners::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::new(ERR_ENGINE_CLOSED, "Account engine is closed.")
                .with_context("root", self.root.display().to_string()));
        }
        Ok(())
    }

    fn emit(&self, account_id: Option<AccountId>, kind: EngineEventKind) {
        self.listeners.emit(&EngineEvent::new(account_id, kind));
    }

    async fn account_dir(&self, account_id: AccountId) -> AppResult<PathBuf> {
        let manifest = self.manifest.lock().await;
        manifest
            .account(account_id)
            .map(|record| self.root.join(&record.dir))
            .ok_or_else(|| unknown_account(account_id))
    }

    async fn account_db(&self, account_id: AccountId) -> AppResult<PathBuf> {
        Ok(self.account_dir(account_id).await?.join(ACCOUNT_DB_FILE))
    }
}

#[async_trait]
impl AccountEngine for LocalAccountEngine {
    async fn migrate_account(&self, db_path: &Path) -> AppResult<AccountId> {
        self.ensure_open()?;

        let meta = fs::symlink_metadata(db_path)
            .await
            .map_err(|err| AppError::io(err, "engine_migrate_stat_db", db_path))?;
        if !meta.is_file() {
            return Err(
                AppError::new(ERR_NOT_A_DATABASE, "Legacy database is not a regular file.")
                    .with_context("path", db_path.display().to_string()),
            );
        }
        verify_database(db_path).await?;

        let legacy_blobs = sidecar_path(db_path, "-blobs");
        let blobs_is_dir = fs::metadata(&legacy_blobs)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !blobs_is_dir {
            return Err(AppError::new(
                ERR_BLOBS_MISSING,
                "Legacy blob directory is missing next to the database.",
            )
            .with_context("path", legacy_blobs.display().to_string()));
        }

        let uuid = Uuid::new_v4();
        let dir_name = uuid.to_string();
        let account_dir = self.root.join(&dir_name);
        fs::create_dir(&account_dir)
            .await
            .map_err(|err| AppError::io(err, "engine_create_account_dir", &account_dir))?;

        let new_db = account_dir.join(ACCOUNT_DB_FILE);
        let new_blobs = account_dir.join(ACCOUNT_BLOBS_DIR);
        let mut moved: Vec<MovedPath> = Vec::new();

        if let Err(err) = fs::rename(db_path, &new_db).await {
            roll_back_account(&account_dir, &moved).await;
            return Err(AppError::io(err, "engine_move_db", db_path)
                .with_context("to", new_db.display().to_string()));
        }
        moved.push(MovedPath::new(db_path, &new_db));
        if let Err(err) = fs::rename(&legacy_blobs, &new_blobs).await {
            roll_back_account(&account_dir, &moved).await;
            return Err(AppError::io(err, "engine_move_blobs", &legacy_blobs)
                .with_context("to", new_blobs.display().to_string()));
        }
        moved.push(MovedPath::new(&legacy_blobs, &new_blobs));
        moved.extend(move_sidecars(db_path, &new_db).await);

        let mut manifest = self.manifest.lock().await;
        let account_id = manifest.add_account(dir_name, uuid);
        if let Err(err) = write_manifest(&self.manifest_path(), &manifest).await {
            manifest.remove_account(account_id);
            drop(manifest);
            roll_back_account(&account_dir, &moved).await;
            return Err(err);
        }
        drop(manifest);

        self.emit(
            Some(account_id),
            EngineEventKind::Info(format!("migrated account from {}", db_path.display())),
        );
        self.emit(None, EngineEventKind::AccountsChanged);
        Ok(account_id)
    }

    async fn get_blob_dir(&self, account_id: AccountId) -> AppResult<Option<PathBuf>> {
        self.ensure_open()?;
        let manifest = self.manifest.lock().await;
        Ok(manifest
            .account(account_id)
            .map(|record| self.root.join(&record.dir).join(ACCOUNT_BLOBS_DIR)))
    }

    async fn get_all_account_ids(&self) -> AppResult<Vec<AccountId>> {
        self.ensure_open()?;
        Ok(self.manifest.lock().await.account_ids())
    }

    async fn get_config(&self, account_id: AccountId, key: &str) -> AppResult<Option<String>> {
        self.ensure_open()?;
        let db = self.account_db(account_id).await?;
        let mut conn = open_account_db(&db).await?;
        let result = sqlx::query_scalar::<_, Option<String>>(
            "SELECT value FROM config WHERE keyname = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&mut conn)
        .await;
        let _ = conn.close().await;
        let value = result.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "engine_get_config")
                .with_context("account_id", account_id.to_string())
                .with_context("key", key.to_string())
        })?;
        Ok(value.flatten())
    }

    async fn set_config(
        &self,
        account_id: AccountId,
        key: &str,
        value: Option<&str>,
    ) -> AppResult<()> {
        self.ensure_open()?;
        let db = self.account_db(account_id).await?;
        let mut conn = open_account_db(&db).await?;
        let result = write_config(&mut conn, key, value).await;
        let _ = conn.close().await;
        result.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "engine_set_config")
                .with_context("account_id", account_id.to_string())
                .with_context("key", key.to_string())
        })?;
        self.emit(
            Some(account_id),
            EngineEventKind::Info(format!("config key {key} updated")),
        );
        Ok(())
    }

    fn on_event(&self, listener: EventListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn off_event(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    async fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.listeners.clear();
        tracing::debug!(
            target: LOG_TARGET,
            event = "engine_closed",
            root = %self.root.display(),
        );
        Ok(())
    }
}

fn unknown_account(account_id: AccountId) -> AppError {
    AppError::new(ERR_UNKNOWN_ACCOUNT, "Account is not registered in this store.")
        .with_context("account_id", account_id.to_string())
}

fn sidecar_path(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

/// A path moved into the store, remembered so a failed migration can put it
/// back.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MovedPath {
    from: PathBuf,
    to: PathBuf,
}

impl MovedPath {
    fn new(from: &Path, to: &Path) -> Self {
        Self {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }
    }
}

async fn move_sidecars(from_db: &Path, to_db: &Path) -> Vec<MovedPath> {
    let mut moved = Vec::new();
    for suffix in SQLITE_SIDECARS {
        let source = sidecar_path(from_db, suffix);
        if fs::symlink_metadata(&source).await.is_err() {
            continue;
        }
        let target = sidecar_path(to_db, suffix);
        match fs::rename(&source, &target).await {
            Ok(()) => moved.push(MovedPath::new(&source, &target)),
            Err(err) => tracing::warn!(
                target: LOG_TARGET,
                event = "engine_sidecar_move_failed",
                path = %source.display(),
                error = %err,
            ),
        }
    }
    moved
}

/// Move everything in `moved` back to where it came from, newest first.
/// The account directory is removed only when every path made it back;
/// otherwise it stays with whatever it still holds.
async fn roll_back_account(account_dir: &Path, moved: &[MovedPath]) -> bool {
    let mut restored = true;
    for path in moved.iter().rev() {
        if let Err(err) = fs::rename(&path.to, &path.from).await {
            restored = false;
            tracing::error!(
                target: LOG_TARGET,
                event = "engine_rollback",
                outcome = "error",
                path = %path.to.display(),
                to = %path.from.display(),
                error = %err,
            );
        }
    }

    if !restored {
        tracing::error!(
            target: LOG_TARGET,
            event = "engine_rollback",
            outcome = "kept_account_dir",
            path = %account_dir.display(),
        );
        return false;
    }
    if let Err(err) = fs::remove_dir(account_dir).await {
        tracing::warn!(
            target: LOG_TARGET,
            event = "engine_rollback",
            outcome = "account_dir_not_removed",
            path = %account_dir.display(),
            error = %err,
        );
    }
    true
}

async fn write_manifest(path: &Path, manifest: &AccountsManifest) -> AppResult<()> {
    let text = manifest.to_toml()?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, text.as_bytes())
        .await
        .map_err(|err| AppError::io(err, "engine_write_manifest_tmp", &tmp))?;
    let file = fs::File::open(&tmp)
        .await
        .map_err(|err| AppError::io(err, "engine_open_manifest_tmp", &tmp))?;
    file.sync_all()
        .await
        .map_err(|err| AppError::io(err, "engine_sync_manifest_tmp", &tmp))?;
    drop(file);
    fs::rename(&tmp, path).await.map_err(|err| {
        AppError::io(err, "engine_rename_manifest", &tmp)
            .with_context("to", path.display().to_string())
    })?;
    Ok(())
}

async fn open_account_db(path: &Path) -> AppResult<SqliteConnection> {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Delete)
        .log_statements(log::LevelFilter::Off)
        .connect()
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "engine_open_db")
                .with_context("path", path.display().to_string())
        })
}

/// Reject files SQLite cannot read before anything is moved. The legacy file
/// is opened read-only and keeps whatever journal mode it was written with.
async fn verify_database(path: &Path) -> AppResult<()> {
    let not_a_database = |cause: AppError| {
        AppError::new(ERR_NOT_A_DATABASE, "Legacy database could not be opened.")
            .with_context("path", path.display().to_string())
            .with_cause(cause)
    };
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .create_if_missing(false)
        .log_statements(log::LevelFilter::Off)
        .connect()
        .await
        .map_err(|err| {
            not_a_database(AppError::from(err).with_context("operation", "engine_verify_db"))
        })?;
    let result = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sqlite_master")
        .fetch_one(&mut conn)
        .await;
    let _ = conn.close().await;
    result.map_err(|err| not_a_database(AppError::from(err)))?;
    Ok(())
}

async fn write_config(
    conn: &mut SqliteConnection,
    key: &str,
    value: Option<&str>,
) -> Result<(), sqlx::Error> {
    match value {
        None => {
            sqlx::query("DELETE FROM config WHERE keyname = ?1")
                .bind(key)
                .execute(&mut *conn)
                .await?;
        }
        Some(value) => {
            let updated = sqlx::query("UPDATE config SET value = ?2 WHERE keyname = ?1")
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await?;
            if updated.rows_affected() == 0 {
                sqlx::query("INSERT INTO config (keyname, value) VALUES (?1, ?2)")
                    .bind(key)
                    .bind(value)
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }
    Ok(())
}
