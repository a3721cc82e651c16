//! Pid file with an exclusive lock
//!
//! The lock, not the file's existence, decides whether another instance is
//! running: a crashed daemon leaves the file behind but the OS drops its lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::debug;

pub const PID_FILE_NAME: &str = "gpsstatsd.pid";

/// `$XDG_RUNTIME_DIR/gpsstatsd.pid`, or the temp dir when there is none
pub fn default_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(PID_FILE_NAME)
}

/// Holds the lock until dropped, then removes the file
pub struct PidFile {
    file: File,
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();

        // No truncation before the lock is ours
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "another gpsstatsd instance holds the lock",
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(&file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // May fail after a privilege drop; the stale file is harmless
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Pid file {} not removed: {}", self.path.display(), e);
        }
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_pid_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);

        let pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(pid_file.path(), path);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_instance_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);

        let _first = PidFile::acquire(&path).unwrap();
        let err = PidFile::acquire(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_stale_file_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        fs::write(&path, "999999\nleftover\n").unwrap();

        let _pid_file = PidFile::acquire(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("{}\n", std::process::id()));
    }

    #[test]
    fn test_default_path_name() {
        assert!(default_path().ends_with(PID_FILE_NAME));
    }
}
