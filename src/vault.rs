//! Local persistence for custody state.
//!
//! The custodian only needs named text values: get, set, remove, list.
//! Implementations:
//!
//! - [`MemoryVault`]: process-local, for tests and ephemeral custodians
//! - [`FileVault`]: one file per name under a directory, written atomically
//!   (temp file + rename) with owner-only permissions on unix
//!
//! A `FileVault` holds an exclusive advisory lock on its directory for as
//! long as it (or any clone) is alive. Each custodian writes its whole key
//! store on every change, so two custodians over one directory would
//! silently drop each other's keys.
//!
//! No multi-key transactions are offered; the custodian writes the whole
//! key store under a single name so its active-pointer invariant is
//! persisted in one step.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{CustodyError, Result};

/// Named text storage injected into the custodian.
pub trait Vault: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    /// Stored names, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

/// Reject names that could escape a vault directory.
fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(CustodyError::Storage(format!("invalid vault entry name: {name:?}")))
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryVault {
    entries: DashMap<String, String>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vault for MemoryVault {
    fn get(&self, name: &str) -> Result<Option<String>> {
        check_name(name)?;
        Ok(self.entries.get(name).map(|v| v.value().clone()))
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        check_name(name)?;
        self.entries.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.entries.remove(name);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }
}

// =============================================================================
// File-backed
// =============================================================================

/// Lock file inside a vault directory. Never listed as an entry.
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone)]
pub struct FileVault {
    dir: PathBuf,
    /// Released when the last clone drops.
    _lock: Arc<File>,
}

impl FileVault {
    /// Open (creating if needed) a vault directory and lock it.
    ///
    /// # Errors
    /// - `VaultBusy` if another `FileVault`, in this process or another,
    ///   already holds the directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let lock = options.open(dir.join(LOCK_FILE))?;
        if !try_lock_exclusive(&lock)? {
            return Err(CustodyError::VaultBusy(dir));
        }

        debug!(dir = %dir.display(), "Vault opened");
        Ok(Self {
            dir,
            _lock: Arc::new(lock),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.dir.join(name))
    }
}

impl Vault for FileVault {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let path = self.path_for(name)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let path = self.path_for(name)?;
        let tmp = self.dir.join(format!(".{name}.tmp"));

        write_owner_only(&tmp, value.as_bytes())?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if check_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Write `contents` to a file only its owner can read.
///
/// New files are created with mode 0600. An existing file is narrowed to
/// 0600 before anything is written to it.
pub fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents)?;
    file.sync_all()
}

// =============================================================================
// Directory lock
// =============================================================================

/// Non-blocking exclusive `flock`. `Ok(false)` if someone else holds it.
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

// TODO: LockFileEx on Windows; until then vaults there are unlocked.
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}
