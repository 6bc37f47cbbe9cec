use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub use crate::engine::manifest::MANIFEST_FILE_NAME as MANIFEST_FILE;

pub const LEGACY_DB_FILE: &str = "db.sqlite";
pub const LEGACY_BLOBS_DIR: &str = "db.sqlite-blobs";
pub const STICKERS_DIR: &str = "stickers";
pub const STAGED_DIR_NAME: &str = "accounts_old";
/// Finder metadata left behind in otherwise empty folders on macOS.
pub const RESIDUE_FILE: &str = ".DS_Store";

/// Every path the migration touches, derived from the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPaths {
    working_dir: PathBuf,
    parent: PathBuf,
}

impl AccountPaths {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let working_dir = working_dir.into();
        let parent = working_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            working_dir,
            parent,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Directory whose entries are probed for per-folder legacy accounts.
    pub fn parent(&self) -> &Path {
        &self.parent
    }

    pub fn manifest(&self) -> PathBuf {
        self.working_dir.join(MANIFEST_FILE)
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.parent.join(STAGED_DIR_NAME)
    }

    /// Names under the parent that belong to the layout itself and are never
    /// treated as legacy account folders.
    pub fn is_reserved_name(&self, name: &OsStr) -> bool {
        self.working_dir.file_name() == Some(name) || name == OsStr::new(STAGED_DIR_NAME)
    }
}

/// Paths of a legacy account folder holding `db.sqlite`.
pub fn legacy_db_path(folder: &Path) -> PathBuf {
    folder.join(LEGACY_DB_FILE)
}

pub fn legacy_blobs_path(folder: &Path) -> PathBuf {
    folder.join(LEGACY_BLOBS_DIR)
}

pub fn legacy_stickers_path(folder: &Path) -> PathBuf {
    folder.join(STICKERS_DIR)
}

/// Stickers live next to the engine's blob directory, not inside it.
pub fn sticker_target_for(blob_dir: &Path) -> Option<PathBuf> {
    blob_dir.parent().map(|parent| parent.join(STICKERS_DIR))
}
