use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::error::ArchiveError;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;
// Keep the rwx bits only: no setuid, setgid or sticky
const MODE_MASK: u32 = 0o777;
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Zip-bomb bounds applied to every archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_total_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub dirs: usize,
    pub bytes: u64,
}

/// A validated entry, ready to be written
struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    is_dir: bool,
    mode: u32,
}

/// Extracts `archive` into the empty directory `dest`
///
/// Every entry is validated before anything is written, so a rejected archive
/// leaves `dest` untouched. `None` is a no-op. `source_name` is where the job's
/// source file goes afterwards; a plain file of that name is overwritten
/// later, but a directory in its place is rejected.
pub fn extract(
    archive: Option<&Path>,
    dest: &Path,
    limits: &ArchiveLimits,
    source_name: &str,
) -> Result<ExtractSummary, ArchiveError> {
    let Some(archive_path) = archive else {
        return Ok(ExtractSummary::default());
    };

    ensure_empty(dest)?;

    let file = fs::File::open(archive_path).map_err(|e| {
        ArchiveError::Corrupt(format!("cannot open {}: {e}", archive_path.display()))
    })?;
    let mut zip = ZipArchive::new(file).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

    let plan = plan_entries(&mut zip, limits, source_name)?;
    let summary = write_entries(&mut zip, &plan, dest, limits)?;

    log::debug!(
        "Extracted {} files, {} dirs ({} bytes) from {} into {}",
        summary.files,
        summary.dirs,
        summary.bytes,
        archive_path.display(),
        dest.display()
    );
    Ok(summary)
}

fn ensure_empty(dest: &Path) -> Result<(), ArchiveError> {
    let mut entries = fs::read_dir(dest).map_err(|e| {
        ArchiveError::Corrupt(format!("cannot read destination {}: {e}", dest.display()))
    })?;
    if entries.next().is_some() {
        return Err(ArchiveError::Unsafe {
            entry: dest.display().to_string(),
            reason: "destination directory is not empty",
        });
    }
    Ok(())
}

fn plan_entries<R: Read + io::Seek>(
    zip: &mut ZipArchive<R>,
    limits: &ArchiveLimits,
    source_name: &str,
) -> Result<Vec<PlannedEntry>, ArchiveError> {
    if zip.len() > limits.max_entries {
        return Err(ArchiveError::Unsafe {
            entry: format!("{} entries", zip.len()),
            reason: "too many entries",
        });
    }

    let mut declared_total: u64 = 0;
    let mut plan = Vec::with_capacity(zip.len());

    for index in 0..zip.len() {
        let entry = zip
            .by_index_raw(index)
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        let name = entry.name().to_string();

        let relative = sanitize_entry_name(&name)?;
        let is_dir = entry.is_dir();
        if shadows_source(&relative, is_dir, source_name) {
            return Err(ArchiveError::Unsafe {
                entry: name,
                reason: "would turn the source file path into a directory",
            });
        }

        let mode = entry.unix_mode();
        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            return Err(ArchiveError::Unsafe {
                entry: name,
                reason: "symbolic links are not allowed",
            });
        }

        declared_total = declared_total.saturating_add(entry.size());
        if declared_total > limits.max_total_bytes {
            return Err(ArchiveError::Unsafe {
                entry: name,
                reason: "uncompressed size exceeds the limit",
            });
        }

        plan.push(PlannedEntry {
            index,
            relative,
            is_dir,
            mode: mode.map_or(DEFAULT_FILE_MODE, |m| m & MODE_MASK),
        });
    }

    Ok(plan)
}

fn shadows_source(relative: &Path, is_dir: bool, source_name: &str) -> bool {
    let mut components = relative.components();
    let at_source = components
        .next()
        .is_some_and(|first| first.as_os_str() == source_name);
    at_source && (is_dir || components.next().is_some())
}

/// Turns an entry name into a path that stays inside the destination
fn sanitize_entry_name(name: &str) -> Result<PathBuf, ArchiveError> {
    let unsafe_entry = |reason| ArchiveError::Unsafe {
        entry: name.to_string(),
        reason,
    };

    if name.contains('\0') {
        return Err(unsafe_entry("NUL byte in entry name"));
    }
    // Windows-built archives may use backslashes; `..\..\x` must not slip through
    let normalized = name.replace('\\', "/");

    let mut relative = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(unsafe_entry("parent directory traversal")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_entry("absolute path"));
            }
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(unsafe_entry("empty entry name"));
    }
    Ok(relative)
}

fn write_entries<R: Read + io::Seek>(
    zip: &mut ZipArchive<R>,
    plan: &[PlannedEntry],
    dest: &Path,
    limits: &ArchiveLimits,
) -> Result<ExtractSummary, ArchiveError> {
    let io_error = |path: &Path, e: io::Error| {
        ArchiveError::Corrupt(format!("cannot write {}: {e}", path.display()))
    };
    let mut summary = ExtractSummary::default();

    for planned in plan {
        let target = dest.join(&planned.relative);

        if planned.is_dir {
            fs::create_dir_all(&target).map_err(|e| io_error(&target, e))?;
            fs::set_permissions(&target, fs::Permissions::from_mode(DIR_MODE))
                .map_err(|e| io_error(&target, e))?;
            summary.dirs += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let entry = zip
            .by_index(planned.index)
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

        // Declared sizes can lie; bound the bytes actually inflated
        let remaining = limits.max_total_bytes - summary.bytes;
        let mut bounded = entry.take(remaining + 1);
        let mut out = fs::File::create(&target).map_err(|e| io_error(&target, e))?;
        let written = io::copy(&mut bounded, &mut out).map_err(|e| {
            ArchiveError::Corrupt(format!("cannot inflate {}: {e}", planned.relative.display()))
        })?;
        if written > remaining {
            return Err(ArchiveError::Unsafe {
                entry: planned.relative.display().to_string(),
                reason: "uncompressed size exceeds the limit",
            });
        }

        let mode = if planned.mode == 0 {
            DEFAULT_FILE_MODE
        } else {
            planned.mode
        };
        fs::set_permissions(&target, fs::Permissions::from_mode(mode))
            .map_err(|e| io_error(&target, e))?;

        summary.files += 1;
        summary.bytes += written;
    }

    Ok(summary)
}
