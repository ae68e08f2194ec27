use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::job::JobId;

const STAGING_PREFIX: &str = "poc-";
const STAGING_ROOT_PERMISSIONS: u32 = 0o700;
const SOURCE_PERMISSIONS: u32 = 0o755;
const RESTORED_DIR_PERMISSIONS: u32 = 0o700;

/// Default location for staging directories, under the user cache dir
pub fn default_staging_root() -> Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "pocrun")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    Ok(proj_dirs.cache_dir().join("staging"))
}

/// Creates the staging root if needed, restricted to the engine's user
pub fn prepare_root(root: &Path) -> Result<()> {
    fs::create_dir_all(root)?;
    fs::set_permissions(root, fs::Permissions::from_mode(STAGING_ROOT_PERMISSIONS))?;
    Ok(())
}

/// Removes staging directories left behind by a previous process
///
/// Only call this before any job has started.
pub fn sweep_stale(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(STAGING_PREFIX) || !entry.file_type()?.is_dir() {
            continue;
        }
        match remove_tree(&entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!(
                "Failed to remove stale staging dir {}: {e}",
                entry.path().display()
            ),
        }
    }

    if removed > 0 {
        log::info!("Removed {removed} stale staging directories from {}", root.display());
    }
    Ok(removed)
}

/// Ephemeral working directory owned by exactly one job
///
/// Removed by `close`, or on drop if the owning job never got that far.
#[derive(Debug)]
pub struct StagingDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl StagingDir {
    pub fn create(root: &Path, job_id: JobId) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{STAGING_PREFIX}{}-", job_id.short()))
            .tempdir_in(root)
            .map_err(|e| anyhow!("Failed to create staging dir in {}: {e}", root.display()))?;
        let path = dir.path().to_path_buf();

        log::debug!("Created staging dir {} for job {job_id}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the job's source file, executable so scripts can be invoked directly
    pub fn write_source(&self, file_name: &str, source: &str) -> Result<PathBuf> {
        let source_path = self.path.join(file_name);
        // An archive may have shipped a read-only file under the same name
        if fs::symlink_metadata(&source_path).is_ok_and(|m| m.is_file()) {
            fs::remove_file(&source_path)
                .with_context(|| format!("Failed to replace {}", source_path.display()))?;
        }
        fs::write(&source_path, source)
            .with_context(|| format!("Failed to write {}", source_path.display()))?;
        fs::set_permissions(&source_path, fs::Permissions::from_mode(SOURCE_PERMISSIONS))
            .with_context(|| format!("Failed to set permissions on {}", source_path.display()))?;
        Ok(source_path)
    }

    /// Removes the directory and everything the job wrote into it
    pub fn close(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close().or_else(|_| remove_tree(&self.path)),
            None => Ok(()),
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close().or_else(|_| remove_tree(&self.path)) {
                log::error!("Failed to remove staging dir {}: {e}", self.path.display());
            }
        }
    }
}

/// Removes `path` recursively, even when a job locked its owner out of subdirectories
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(_) => {
            restore_access(path)?;
            fs::remove_dir_all(path)
        }
    }
}

/// Gives the owner `rwx` back on every directory below `dir`; symlinks are not followed
fn restore_access(dir: &Path) -> io::Result<()> {
    fs::set_permissions(dir, fs::Permissions::from_mode(RESTORED_DIR_PERMISSIONS))?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            restore_access(&entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_close() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingDir::create(root.path(), JobId::new()).unwrap();
        let path = staging.path().to_path_buf();

        let source = staging.write_source("poc.sh", "echo hi\n").unwrap();
        assert_eq!(fs::read_to_string(&source).unwrap(), "echo hi\n");
        let mode = fs::metadata(&source).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOURCE_PERMISSIONS);

        fs::create_dir(path.join("artifacts")).unwrap();
        fs::write(path.join("artifacts/out"), b"x").unwrap();

        staging.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_close_removes_locked_down_tree() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingDir::create(root.path(), JobId::new()).unwrap();
        let path = staging.path().to_path_buf();

        let locked = path.join("d/e");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("f"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        fs::set_permissions(path.join("d"), fs::Permissions::from_mode(0o500)).unwrap();

        staging.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_sweep_stale_removes_locked_down_tree() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("poc-deadbeef-xyz");
        fs::create_dir_all(stale.join("d")).unwrap();
        fs::write(stale.join("d/f"), b"x").unwrap();
        fs::set_permissions(stale.join("d"), fs::Permissions::from_mode(0o000)).unwrap();

        assert_eq!(sweep_stale(root.path()).unwrap(), 1);
        assert!(!stale.exists());
    }

    #[test]
    fn test_write_source_replaces_read_only_file() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingDir::create(root.path(), JobId::new()).unwrap();
        let existing = staging.path().join("poc.sh");
        fs::write(&existing, b"from archive").unwrap();
        fs::set_permissions(&existing, fs::Permissions::from_mode(0o444)).unwrap();

        staging.write_source("poc.sh", "echo source\n").unwrap();
        assert_eq!(fs::read_to_string(&existing).unwrap(), "echo source\n");
    }

    #[test]
    fn test_write_source_error_names_the_path() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingDir::create(root.path(), JobId::new()).unwrap();
        fs::create_dir(staging.path().join("poc.sh")).unwrap();

        let err = staging.write_source("poc.sh", "echo hi").unwrap_err();
        assert!(format!("{err:#}").contains("poc.sh"), "{err:#}");
    }

    #[test]
    fn test_drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let staging = StagingDir::create(root.path(), JobId::new()).unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_directories_are_unique_per_job() {
        let root = tempfile::tempdir().unwrap();
        let id = JobId::new();
        let a = StagingDir::create(root.path(), id).unwrap();
        let b = StagingDir::create(root.path(), id).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_sweep_stale_only_touches_staging_dirs() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("poc-deadbeef-abc")).unwrap();
        fs::write(root.path().join("poc-deadbeef-abc/poc.py"), b"x").unwrap();
        fs::create_dir(root.path().join("unrelated")).unwrap();

        assert_eq!(sweep_stale(root.path()).unwrap(), 1);
        assert!(!root.path().join("poc-deadbeef-abc").exists());
        assert!(root.path().join("unrelated").exists());
    }

    #[test]
    fn test_prepare_root_restricts_permissions() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("a/b/staging");
        prepare_root(&root).unwrap();
        let mode = fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, STAGING_ROOT_PERMISSIONS);
    }
}
