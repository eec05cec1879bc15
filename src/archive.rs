//! Retained per-build copies of the generated Sonargraph report.
//!
//! Layout below the history root:
//!
//! ```text
//! sonargraphReportHistory/
//!   sonargraph-report-build-41.xml
//!   sonargraph-report-build-42.xml
//!   sonargraph-report-build-42/      (HTML report directory, when present)
//! ```
//!
//! Entries are staged under a hidden temp name inside the history root and
//! renamed into place, so a reader never sees a half-copied entry under its
//! final name.

use crate::action::JobContext;
use crate::config::{ConfigKey, ConfigLookup};
use crate::error::{Error, Result};
use crate::model::BuildNumber;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Shared by file entries (`<prefix><build>.xml`) and directory entries (`<prefix><build>`).
pub const REPORT_NAME_PREFIX: &str = "sonargraph-report-build-";
const REPORT_FILE_EXTENSION: &str = ".xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    File,
    Directory,
}

/// One retained report of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub build_number: BuildNumber,
    pub kind: EntryKind,
    pub path: PathBuf,
}

fn parse_entry_name(name: &str, is_dir: bool) -> Option<(BuildNumber, EntryKind)> {
    if is_dir {
        let rest = name.strip_prefix(REPORT_NAME_PREFIX)?;
        parse_build_number(rest).map(|n| (n, EntryKind::Directory))
    } else {
        let rest = name
            .strip_prefix(REPORT_NAME_PREFIX)?
            .strip_suffix(REPORT_FILE_EXTENSION)?;
        parse_build_number(rest).map(|n| (n, EntryKind::File))
    }
}

fn parse_build_number(text: &str) -> Option<BuildNumber> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn not_found(what: &str, path: &Path) -> Error {
    Error::io(
        format!("{what} {}", path.display()),
        io::Error::new(io::ErrorKind::NotFound, "does not exist"),
    )
}

fn copy_dir_recursive(source: &Path, target: &Path) -> Result<u64> {
    let read_error = |path: &Path, e| Error::io(format!("read {}", path.display()), e);
    let mut copied = 0;
    for entry in fs::read_dir(source).map_err(|e| read_error(source, e))? {
        let entry = entry.map_err(|e| read_error(source, e))?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        let mut file_type = entry.file_type().map_err(|e| read_error(&from, e))?;
        if file_type.is_symlink() {
            file_type = match fs::metadata(&from) {
                Ok(metadata) => metadata.file_type(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(path = %from.display(), "Skipping dangling symlink in report");
                    continue;
                }
                Err(e) => return Err(Error::io(format!("resolve {}", from.display()), e)),
            };
            if file_type.is_dir() {
                tracing::warn!(path = %from.display(), "Skipping symlinked directory in report");
                continue;
            }
        }
        if file_type.is_dir() {
            fs::create_dir(&to).map_err(|e| Error::io(format!("create {}", to.display()), e))?;
            copied += copy_dir_recursive(&from, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to).map_err(|e| Error::io(format!("copy {}", from.display()), e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

pub struct ReportHistoryArchive {
    history_root: PathBuf,
}

impl ReportHistoryArchive {
    /// Archive rooted at `<job_root>/<folder>`.
    pub fn new(job_root: impl AsRef<Path>, folder: &str) -> Self {
        Self {
            history_root: job_root.as_ref().join(folder),
        }
    }

    pub fn for_job(job: &dyn JobContext, config: &dyn ConfigLookup) -> Self {
        Self::new(job.root_dir(), config.value(ConfigKey::ReportHistoryFolder))
    }

    /// The history root, created if it does not exist yet.
    pub fn report_history_directory(&self) -> Result<&Path> {
        fs::create_dir_all(&self.history_root).map_err(|e| {
            Error::io(
                format!("create report history directory {}", self.history_root.display()),
                e,
            )
        })?;
        Ok(&self.history_root)
    }

    pub fn report_file_path(&self, build_number: BuildNumber) -> PathBuf {
        self.history_root.join(format!(
            "{REPORT_NAME_PREFIX}{build_number}{REPORT_FILE_EXTENSION}"
        ))
    }

    pub fn report_directory_path(&self, build_number: BuildNumber) -> PathBuf {
        self.history_root
            .join(format!("{REPORT_NAME_PREFIX}{build_number}"))
    }

    /// Copy a build's XML report into the history, replacing an earlier copy.
    pub fn store_report(&self, source: &Path, build_number: BuildNumber) -> Result<PathBuf> {
        if !source.is_file() {
            return Err(not_found("report file", source));
        }
        let root = self.report_history_directory()?;
        let target = self.report_file_path(build_number);

        let mut input = fs::File::open(source)
            .map_err(|e| Error::io(format!("open report {}", source.display()), e))?;
        let mut temp_file = tempfile::Builder::new()
            .prefix(".sonargraph-report-")
            .tempfile_in(root)
            .map_err(|e| Error::io("create temp report file", e))?;
        let bytes = io::copy(&mut input, &mut temp_file)
            .and_then(|bytes| temp_file.as_file().sync_all().map(|()| bytes))
            .map_err(|e| Error::io(format!("copy report {}", source.display()), e))?;

        // Persist (atomic rename)
        temp_file
            .persist(&target)
            .map_err(|e| Error::io(format!("store report {}", target.display()), e.error))?;

        tracing::info!(
            build_number,
            bytes,
            source = %source.display(),
            destination = %target.display(),
            "Stored Sonargraph report"
        );
        Ok(target)
    }

    /// Recursively copy a build's report directory into the history.
    ///
    /// An earlier entry for the same build is replaced only once the new copy
    /// is complete, and restored if publishing the new copy fails.
    pub fn store_report_directory(
        &self,
        source_dir: &Path,
        build_number: BuildNumber,
    ) -> Result<PathBuf> {
        if !source_dir.is_dir() {
            return Err(not_found("report directory", source_dir));
        }
        let root = self.report_history_directory()?;
        self.reject_nested_source(source_dir)?;
        let target = self.report_directory_path(build_number);

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(root)
            .map_err(|e| Error::io("create staging directory", e))?;
        let files = copy_dir_recursive(source_dir, staging.path())?;

        let retired = if fs::symlink_metadata(&target).is_ok() {
            let retired = tempfile::Builder::new()
                .prefix(".retired-")
                .tempdir_in(root)
                .map_err(|e| Error::io("create retirement directory", e))?;
            let previous = retired.path().join("previous");
            fs::rename(&target, &previous).map_err(|e| {
                Error::io(format!("move aside {}", target.display()), e)
            })?;
            Some((retired, previous))
        } else {
            None
        };

        if let Err(err) = fs::rename(staging.path(), &target) {
            if let Some((_, previous)) = &retired {
                if let Err(restore) = fs::rename(previous, &target) {
                    tracing::error!(
                        destination = %target.display(),
                        error = %restore,
                        "Failed to restore previous report directory"
                    );
                }
            }
            return Err(Error::io(format!("publish {}", target.display()), err));
        }
        // Dropping `staging` is now a no-op; dropping `retired` removes the old copy.
        drop(retired);

        tracing::info!(
            build_number,
            files,
            source = %source_dir.display(),
            destination = %target.display(),
            "Stored Sonargraph report directory"
        );
        Ok(target)
    }

    /// Retained entries ordered by build number, files before directories.
    pub fn entries(&self) -> Result<Vec<ArchiveEntry>> {
        let read_dir = match fs::read_dir(&self.history_root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::io(
                    format!("list report history {}", self.history_root.display()),
                    e,
                ));
            }
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| Error::io("read report history entry", e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| Error::io("read report history entry", e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some((build_number, kind)) = parse_entry_name(&name, file_type.is_dir()) {
                entries.push(ArchiveEntry {
                    build_number,
                    kind,
                    path: entry.path(),
                });
            }
        }
        entries.sort_by_key(|e| (e.build_number, e.kind));
        Ok(entries)
    }

    /// Delete everything retained for one build. Returns the number of entries removed.
    pub fn remove_entry(&self, build_number: BuildNumber) -> Result<usize> {
        let mut removed = 0;
        let file = self.report_file_path(build_number);
        match fs::remove_file(&file) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(format!("remove {}", file.display()), e)),
        }
        let dir = self.report_directory_path(build_number);
        match fs::remove_dir_all(&dir) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(format!("remove {}", dir.display()), e)),
        }
        if removed > 0 {
            tracing::debug!(build_number, removed, "Removed retained report");
        }
        Ok(removed)
    }

    fn reject_nested_source(&self, source_dir: &Path) -> Result<()> {
        let source = fs::canonicalize(source_dir)
            .map_err(|e| Error::io(format!("resolve {}", source_dir.display()), e))?;
        let root = fs::canonicalize(&self.history_root)
            .map_err(|e| Error::io(format!("resolve {}", self.history_root.display()), e))?;
        if root.starts_with(&source) {
            return Err(Error::validation(format!(
                "Report directory {} contains the report history {}",
                source_dir.display(),
                self.history_root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry_name() {
        assert_eq!(
            parse_entry_name("sonargraph-report-build-12.xml", false),
            Some((12, EntryKind::File))
        );
        assert_eq!(
            parse_entry_name("sonargraph-report-build-12", true),
            Some((12, EntryKind::Directory))
        );
        assert_eq!(parse_entry_name("sonargraph-report-build-12", false), None);
        assert_eq!(parse_entry_name("sonargraph-report-build-.xml", false), None);
        assert_eq!(parse_entry_name("sonargraph-report-build-+1", true), None);
        assert_eq!(parse_entry_name(".staging-abc", true), None);
    }

    #[test]
    fn test_paths() {
        let archive = ReportHistoryArchive::new("/jobs/demo", "sonargraphReportHistory");
        assert_eq!(
            archive.report_file_path(7),
            PathBuf::from("/jobs/demo/sonargraphReportHistory/sonargraph-report-build-7.xml")
        );
        assert_eq!(
            archive.report_directory_path(7),
            PathBuf::from("/jobs/demo/sonargraphReportHistory/sonargraph-report-build-7")
        );
    }

    #[test]
    fn test_missing_sources_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = ReportHistoryArchive::new(dir.path(), "history");
        let missing = dir.path().join("missing.xml");
        assert!(matches!(
            archive.store_report(&missing, 1),
            Err(Error::Io { .. })
        ));
        assert!(matches!(
            archive.store_report_directory(&missing, 1),
            Err(Error::Io { .. })
        ));
        assert!(archive.entries().expect("entries").is_empty());
    }

    #[test]
    fn test_source_containing_history_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = ReportHistoryArchive::new(dir.path(), "history");
        let err = archive.store_report_directory(dir.path(), 1).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err}");
    }
}
