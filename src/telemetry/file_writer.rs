//! JSON-lines file writer with size-based rotation.
//!
//! Used by the telemetry file sink and by the diagnostics exporter. When the
//! file grows past its size limit it is renamed to
//! `<name>.<unix_secs>[.<n>]` and a fresh file is started; only the newest
//! backups are retained.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Default size limit before rotation (10 MB).
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of rotated files kept.
pub const DEFAULT_MAX_BACKUP_FILES: usize = 3;

/// Thread-safe rotating writer.
///
/// The file is opened lazily on first write, creating missing parent
/// directories.
pub struct FileWriter {
    file_path: PathBuf,
    max_size: u64,
    max_backups: usize,
    file: Mutex<Option<File>>,
}

impl FileWriter {
    /// Creates a writer with the default limits.
    #[must_use]
    pub const fn new(file_path: PathBuf) -> Self {
        Self::with_limits(file_path, DEFAULT_MAX_FILE_SIZE_BYTES, DEFAULT_MAX_BACKUP_FILES)
    }

    /// Creates a writer rotating past `max_size` bytes and keeping
    /// `max_backups` rotated files.
    #[must_use]
    pub const fn with_limits(file_path: PathBuf, max_size: u64, max_backups: usize) -> Self {
        Self {
            file_path,
            max_size,
            max_backups,
            file: Mutex::new(None),
        }
    }

    /// Path of the live file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Appends `line` plus a newline, rotating first if the file is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, rotated or written, or if
    /// the lock is poisoned.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("file writer lock poisoned: {e}")))?;

        self.rotate_if_full(&mut file)?;

        if file.is_none() {
            *file = Some(self.open()?);
        }
        let Some(handle) = file.as_mut() else {
            return Err(io::Error::other("telemetry file is not open"));
        };

        writeln!(handle, "{line}")?;
        handle.flush()
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
    }

    fn rotate_if_full(&self, file: &mut Option<File>) -> io::Result<()> {
        let Ok(metadata) = fs::metadata(&self.file_path) else {
            return Ok(());
        };
        if metadata.len() < self.max_size {
            return Ok(());
        }

        *file = None;
        fs::rename(&self.file_path, self.backup_path())?;
        self.remove_old_backups()
    }

    fn backup_path(&self) -> PathBuf {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let base = format!("{}.{secs}", self.file_path.display());
        let mut candidate = PathBuf::from(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = PathBuf::from(format!("{base}.{n}"));
            n += 1;
        }
        candidate
    }

    fn backups(&self) -> io::Result<Vec<PathBuf>> {
        let dir = match self.file_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let Some(file_name) = self.file_path.file_name().and_then(|n| n.to_str()) else {
            return Err(io::Error::other("telemetry file name is not valid UTF-8"));
        };
        let prefix = format!("{file_name}.");

        Ok(fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix))
            })
            .collect())
    }

    fn remove_old_backups(&self) -> io::Result<()> {
        let mut backups = self.backups()?;
        backups.sort_by_key(|path| {
            std::cmp::Reverse(fs::metadata(path).and_then(|m| m.modified()).ok())
        });

        for stale in backups.iter().skip(self.max_backups) {
            if let Err(e) = fs::remove_file(stale) {
                tracing::debug!(
                    path = %stale.display(),
                    error = %e,
                    "failed to remove old telemetry backup"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("file_path", &self.file_path)
            .field("max_size", &self.max_size)
            .field("max_backups", &self.max_backups)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_parent_dirs_and_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        let writer = FileWriter::new(path.clone());

        writer.write_line("{\"a\":1}").unwrap();
        writer.write_line("{\"b\":2}").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n");
    }

    #[test]
    fn rotates_and_keeps_limited_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let writer = FileWriter::with_limits(path.clone(), 8, 2);

        for i in 0..6 {
            writer.write_line(&format!("line-{i:04}")).unwrap();
        }

        let backups = writer.backups().unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "line-0005\n");
    }
}
