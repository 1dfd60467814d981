//! Size-based rotating log writer.
//!
//! Appends lines to a log file, rotating at a byte threshold with numbered
//! backups (`.log` → `.log.1` → `.log.2` → `.log.3`). Rotation is owned by
//! the writing process only; lines are written whole so OS-level append
//! atomicity keeps concurrent readers sane.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

pub struct RotatingLog {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: Option<File>,
    written: u64,
}

impl RotatingLog {
    pub fn new(path: PathBuf, max_bytes: u64, backups: usize) -> Self {
        Self {
            path,
            max_bytes,
            backups,
            file: None,
            written: 0,
        }
    }

    /// The conventional 8 MiB / 3 backup configuration.
    pub fn standard(path: PathBuf) -> Self {
        Self::new(path, 8 * 1024 * 1024, 3)
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if self.file.is_none() {
            self.open()?;
        }
        let needed = line.len() as u64 + 1;
        if self.written + needed > self.max_bytes && self.written > 0 {
            self.rotate()?;
        }
        if let Some(file) = &mut self.file {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            self.written += needed;
        }
        Ok(())
    }

    fn open(&mut self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;

        let backup = |n: usize| -> PathBuf {
            PathBuf::from(format!("{}.{n}", self.path.display()))
        };
        let _ = std::fs::remove_file(backup(self.backups));
        for n in (1..self.backups).rev() {
            let _ = std::fs::rename(backup(n), backup(n + 1));
        }
        if self.path.exists() {
            std::fs::rename(&self.path, backup(1))?;
        }

        self.written = 0;
        self.open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/server.log");
        let mut log = RotatingLog::new(path.clone(), 1024, 3);
        log.write_line("first").unwrap();
        log.write_line("second").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn rotates_at_threshold_with_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut log = RotatingLog::new(path.clone(), 24, 3);

        // Each line is 11 bytes on disk; two fit, the third rotates.
        for i in 0..3 {
            log.write_line(&format!("line-{i:04}")).unwrap();
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("server.log.1")).unwrap(),
            "line-0000\nline-0001\n"
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line-0002\n");
    }

    #[test]
    fn oldest_backup_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut log = RotatingLog::new(path.clone(), 12, 2);

        for i in 0..8 {
            log.write_line(&format!("line-{i:04}")).unwrap();
        }
        // Only .1 and .2 exist; nothing beyond the backup count.
        assert!(dir.path().join("server.log.1").exists());
        assert!(dir.path().join("server.log.2").exists());
        assert!(!dir.path().join("server.log.3").exists());
    }

    #[test]
    fn reopens_existing_file_and_counts_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, "existing\n").unwrap();
        let mut log = RotatingLog::new(path.clone(), 1024, 3);
        log.write_line("appended").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "existing\nappended\n");
    }
}
