// src/item.rs

//! Staging and commit lifecycle of one converted backup
//!
//! A [`BackupItem`] owns a hidden staging directory next to the canonical
//! backup directory of its identity. Every artifact is written into the
//! staging directory; [`BackupItem::commit`] swaps it into place with
//! renames inside the same parent, so readers see either the previous backup
//! or the new one and never a partial mix.
//!
//! # Layout
//!
//! ```text
//! <backup_root>/<package>/
//!   0_Example/            canonical (committed) backup
//!   .0_Example/           staging directory while converting
//!   .0_Example.lock       per-identity lock file
//! ```

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Identity of a backup: at most one conversion may target it at a time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupIdentity {
    pub package: String,
    pub user_id: u32,
    /// Label of the source the backup came from
    pub label: String,
}

impl BackupIdentity {
    pub fn new(package: impl Into<String>, user_id: u32, label: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            user_id,
            label: label.into(),
        }
    }

    /// Directory name of the backup below the package directory
    pub fn backup_name(&self) -> String {
        format!("{}_{}", self.user_id, sanitize_component(&self.label))
    }
}

impl fmt::Display for BackupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.backup_name())
    }
}

/// Make `name` safe as a single path component
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "backup".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lifecycle state of a [`BackupItem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Writable, not yet visible at the canonical location
    Staged,
    /// Swapped into the canonical location (terminal)
    Committed,
    /// Staging removed after failure or cancellation (terminal)
    Abandoned,
}

/// Exclusive per-identity lock, released on drop
struct IdentityLock {
    file: File,
    path: PathBuf,
}

impl IdentityLock {
    /// Acquire the lock, waiting for any other holder to finish
    fn acquire(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Backup lock {} is held, waiting", path.display());
                file.lock_exclusive()?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!("Acquired backup lock {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for IdentityLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release backup lock {}: {}", self.path.display(), e);
        }
    }
}

/// One converted backup on its way to the canonical location
pub struct BackupItem {
    identity: BackupIdentity,
    staging: PathBuf,
    canonical: PathBuf,
    state: ItemState,
    lock: Option<IdentityLock>,
}

impl BackupItem {
    /// Allocate a fresh staging directory for `identity` under `backup_root`
    ///
    /// Blocks while another conversion holds the same identity.
    pub fn create(backup_root: &Path, identity: BackupIdentity) -> Result<Self> {
        let package_dir = backup_root.join(sanitize_component(&identity.package));
        fs::create_dir_all(&package_dir)?;

        let name = identity.backup_name();
        let lock = IdentityLock::acquire(package_dir.join(format!(".{}.lock", name)))?;

        let canonical = package_dir.join(&name);
        let staging = allocate_staging(&package_dir, &name)?;

        info!("Staging backup {} in {}", identity, staging.display());

        Ok(Self {
            identity,
            staging,
            canonical,
            state: ItemState::Staged,
            lock: Some(lock),
        })
    }

    pub fn identity(&self) -> &BackupIdentity {
        &self.identity
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Directory all artifacts are written to before commit
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Final location of the backup
    pub fn canonical_path(&self) -> &Path {
        &self.canonical
    }

    /// Replace the canonical directory with the staging directory
    ///
    /// On failure the canonical directory is left as it was and the item
    /// stays staged, so [`BackupItem::cleanup`] can still remove the staging
    /// directory. If the previous backup was already moved aside and cannot
    /// be moved back, [`Error::CommitStranded`] names where it now lives.
    pub fn commit(&mut self) -> Result<&Path> {
        if self.state != ItemState::Staged {
            return Err(Error::InvalidState(format!(
                "Cannot commit backup {} in state {:?}",
                self.identity, self.state
            )));
        }

        let commit_err = |path: &Path, source: io::Error| Error::Commit {
            path: path.to_path_buf(),
            source,
        };

        let aside = if self.canonical.exists() {
            let parent = self.canonical.parent().unwrap_or(Path::new("."));
            let aside = unique_path(parent, &format!(".{}.old", self.identity.backup_name()));
            fs::rename(&self.canonical, &aside).map_err(|e| commit_err(&self.canonical, e))?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = fs::rename(&self.staging, &self.canonical) {
            return Err(match &aside {
                Some(aside) => restore_previous(aside, &self.canonical, e),
                None => commit_err(&self.canonical, e),
            });
        }

        if let Some(parent) = self.canonical.parent()
            && let Ok(dir) = File::open(parent)
        {
            // Not every filesystem supports fsync on directories
            let _ = dir.sync_all();
        }

        if let Some(aside) = aside
            && let Err(e) = fs::remove_dir_all(&aside)
        {
            warn!("Failed to remove previous backup {}: {}", aside.display(), e);
        }

        self.state = ItemState::Committed;
        self.lock = None;
        info!("Committed backup {} to {}", self.identity, self.canonical.display());
        Ok(&self.canonical)
    }

    /// Remove the staging directory
    ///
    /// Safe from any state and idempotent. A committed item's canonical
    /// directory is never touched; a staged item becomes abandoned.
    pub fn cleanup(&mut self) {
        if self.state != ItemState::Committed {
            match fs::remove_dir_all(&self.staging) {
                Ok(()) => debug!("Removed staging directory {}", self.staging.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "Failed to remove staging directory {}: {}",
                    self.staging.display(),
                    e
                ),
            }
            self.state = ItemState::Abandoned;
        }
        self.lock = None;
    }
}

impl Drop for BackupItem {
    fn drop(&mut self) {
        if self.state == ItemState::Staged {
            warn!("Backup {} dropped while staged, abandoning", self.identity);
            self.cleanup();
        }
    }
}

/// Move the previous backup back after a failed commit rename
///
/// The returned error names `aside` when the previous backup is stuck there.
fn restore_previous(aside: &Path, canonical: &Path, cause: io::Error) -> Error {
    match fs::rename(aside, canonical) {
        Ok(()) => Error::Commit {
            path: canonical.to_path_buf(),
            source: cause,
        },
        Err(restore) => {
            error!(
                "Failed to restore previous backup from {}: {}",
                aside.display(),
                restore
            );
            Error::CommitStranded {
                path: canonical.to_path_buf(),
                previous: aside.to_path_buf(),
                source: cause,
            }
        }
    }
}

/// Create `.<name>` after clearing staging leftovers of crashed runs
///
/// Must be called with the identity lock held. Only `.<name>` and
/// `.<name>_<n>` directories are removed; the lock file and any `.old`
/// copy of a previous backup stay. If a leftover cannot be removed a
/// suffixed name is used instead.
fn allocate_staging(package_dir: &Path, name: &str) -> Result<PathBuf> {
    remove_stale_staging(package_dir, name)?;

    let mut suffix = 0u32;
    loop {
        let candidate = if suffix == 0 {
            package_dir.join(format!(".{}", name))
        } else {
            package_dir.join(format!(".{}_{}", name, suffix))
        };
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_staging_name(file_name: &str, name: &str) -> bool {
    let Some(rest) = file_name.strip_prefix('.').and_then(|f| f.strip_prefix(name)) else {
        return false;
    };
    match rest.strip_prefix('_') {
        Some(n) => !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()),
        None => rest.is_empty(),
    }
}

fn remove_stale_staging(package_dir: &Path, name: &str) -> Result<()> {
    for entry in fs::read_dir(package_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if !is_staging_name(file_name, name) || !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => info!("Removed stale staging directory {}", path.display()),
            Err(e) => warn!("Failed to remove stale staging directory {}: {}", path.display(), e),
        }
    }
    Ok(())
}

fn unique_path(parent: &Path, base: &str) -> PathBuf {
    let mut candidate = parent.join(base);
    let mut n = 1u32;
    while candidate.exists() {
        candidate = parent.join(format!("{}_{}", base, n));
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> BackupIdentity {
        BackupIdentity::new("org.example.app", 0, "OAndBackup")
    }

    fn list(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_backup_name_sanitized() {
        let id = BackupIdentity::new("p", 10, "../evil/label");
        assert_eq!(id.backup_name(), "10____evil_label");
    }

    #[test]
    fn test_commit_moves_staging() {
        let root = TempDir::new().unwrap();
        let mut item = BackupItem::create(root.path(), identity()).unwrap();
        fs::write(item.staging_path().join("meta.am.v1"), b"{}").unwrap();

        let canonical = item.commit().unwrap().to_path_buf();
        assert_eq!(item.state(), ItemState::Committed);
        assert!(canonical.join("meta.am.v1").exists());
        assert!(!item.staging_path().exists());
    }

    #[test]
    fn test_commit_replaces_previous_backup() {
        let root = TempDir::new().unwrap();
        let mut first = BackupItem::create(root.path(), identity()).unwrap();
        fs::write(first.staging_path().join("old"), b"1").unwrap();
        first.commit().unwrap();

        let mut second = BackupItem::create(root.path(), identity()).unwrap();
        fs::write(second.staging_path().join("new"), b"2").unwrap();
        let canonical = second.commit().unwrap().to_path_buf();

        assert_eq!(list(&canonical), vec!["new".to_string()]);
        assert_eq!(
            list(&root.path().join("org.example.app")),
            vec![".0_OAndBackup.lock".to_string(), "0_OAndBackup".to_string()]
        );
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let root = TempDir::new().unwrap();
        let mut item = BackupItem::create(root.path(), identity()).unwrap();
        fs::write(item.staging_path().join("partial"), b"x").unwrap();
        let package_dir = root.path().join("org.example.app");

        item.cleanup();
        let after_first = list(&package_dir);
        item.cleanup();
        assert_eq!(list(&package_dir), after_first);
        assert_eq!(item.state(), ItemState::Abandoned);
        assert!(!item.staging_path().exists());
    }

    #[test]
    fn test_cleanup_after_commit_keeps_canonical() {
        let root = TempDir::new().unwrap();
        let mut item = BackupItem::create(root.path(), identity()).unwrap();
        fs::write(item.staging_path().join("data"), b"x").unwrap();
        item.commit().unwrap();

        item.cleanup();
        assert_eq!(item.state(), ItemState::Committed);
        assert!(item.canonical_path().join("data").exists());
    }

    #[test]
    fn test_commit_twice_is_invalid() {
        let root = TempDir::new().unwrap();
        let mut item = BackupItem::create(root.path(), identity()).unwrap();
        item.commit().unwrap();
        assert!(matches!(item.commit(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_stale_staging_is_removed() {
        let root = TempDir::new().unwrap();
        let package_dir = root.path().join("org.example.app");
        fs::create_dir_all(package_dir.join(".0_OAndBackup")).unwrap();
        fs::write(package_dir.join(".0_OAndBackup/partial.tar.gz.0"), b"x").unwrap();
        fs::create_dir_all(package_dir.join(".0_OAndBackup_3")).unwrap();
        fs::create_dir_all(package_dir.join(".0_OAndBackup.old")).unwrap();
        fs::create_dir_all(package_dir.join(".0_TB")).unwrap();

        let item = BackupItem::create(root.path(), identity()).unwrap();
        assert_eq!(item.staging_path(), package_dir.join(".0_OAndBackup"));
        assert!(list(item.staging_path()).is_empty());
        assert_eq!(
            list(&package_dir),
            vec![
                ".0_OAndBackup".to_string(),
                ".0_OAndBackup.lock".to_string(),
                ".0_OAndBackup.old".to_string(),
                ".0_TB".to_string(),
            ]
        );
    }

    #[test]
    fn test_staging_name_matching() {
        assert!(is_staging_name(".0_SB", "0_SB"));
        assert!(is_staging_name(".0_SB_12", "0_SB"));
        assert!(!is_staging_name(".0_SB.lock", "0_SB"));
        assert!(!is_staging_name(".0_SB.old_1", "0_SB"));
        assert!(!is_staging_name(".0_SB_", "0_SB"));
        assert!(!is_staging_name(".0_SBx", "0_SB"));
        assert!(!is_staging_name("0_SB", "0_SB"));
    }

    #[test]
    fn test_failed_commit_restores_previous_backup() {
        let root = TempDir::new().unwrap();
        let mut first = BackupItem::create(root.path(), identity()).unwrap();
        fs::write(first.staging_path().join("old"), b"1").unwrap();
        first.commit().unwrap();

        let mut second = BackupItem::create(root.path(), identity()).unwrap();
        fs::remove_dir_all(second.staging_path()).unwrap();
        let err = second.commit().unwrap_err();
        assert!(matches!(err, Error::Commit { .. }));
        assert_eq!(second.state(), ItemState::Staged);
        assert_eq!(list(second.canonical_path()), vec!["old".to_string()]);
    }

    #[test]
    fn test_unrestorable_previous_backup_is_reported() {
        let root = TempDir::new().unwrap();
        let aside = root.path().join(".0_OAndBackup.old");
        let canonical = root.path().join("0_OAndBackup");
        fs::create_dir_all(&aside).unwrap();
        fs::write(aside.join("old"), b"1").unwrap();
        // A non-empty directory in the way makes the restore rename fail
        fs::create_dir_all(&canonical).unwrap();
        fs::write(canonical.join("blocker"), b"2").unwrap();

        let cause = io::Error::other("rename failed");
        match restore_previous(&aside, &canonical, cause) {
            Error::CommitStranded { path, previous, .. } => {
                assert_eq!(path, canonical);
                assert_eq!(previous, aside);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(list(&aside), vec!["old".to_string()]);
    }

    #[test]
    fn test_drop_abandons_staged_item() {
        let root = TempDir::new().unwrap();
        let staging = {
            let item = BackupItem::create(root.path(), identity()).unwrap();
            item.staging_path().to_path_buf()
        };
        assert!(!staging.exists());
    }

    #[test]
    fn test_identity_lock_serializes_threads() {
        use std::sync::{Arc, Mutex};

        let root = TempDir::new().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut first = BackupItem::create(root.path(), identity()).unwrap();

        let handle = {
            let root = root.path().to_path_buf();
            let events = Arc::clone(&events);
            std::thread::spawn(move || {
                let mut second = BackupItem::create(&root, identity()).unwrap();
                events.lock().unwrap().push("second");
                second.cleanup();
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(100));
        events.lock().unwrap().push("first");
        first.cleanup();
        handle.join().unwrap();

        assert_eq!(*events.lock().unwrap(), vec!["first", "second"]);
    }
}
