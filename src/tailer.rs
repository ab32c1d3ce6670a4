// Follows a single append-only log file, tolerant of truncation and of
// log-rotation schemes that replace the path with a fresh inode
// (copytruncate is instead handled by the size-shrink check so a rotator
// that truncates in place doesn't need a reopen at all).

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Persisted position a Tailer can be restored from across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailerState {
    pub inode: Option<u64>,
    pub offset: u64,
}

pub struct Tailer {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    inode: Option<u64>,
    offset: u64,
}

impl Tailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            inode: None,
            offset: 0,
        }
    }

    /// Restores the tailer's position, e.g. from `collector_state`. Applied
    /// lazily: it only takes effect the next time the file is (re)opened.
    pub fn set_state(&mut self, state: TailerState) {
        self.inode = state.inode;
        self.offset = state.offset;
        self.reader = None;
    }

    pub fn state(&self) -> TailerState {
        TailerState {
            inode: self.inode,
            offset: self.offset,
        }
    }

    pub fn close(&mut self) {
        self.reader = None;
    }

    fn open(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let file =
            File::open(&self.path).with_context(|| format!("opening {}", self.path.display()))?;
        let meta = file.metadata()?;
        let ino = meta.ino();

        // A previous run's offset may point past the file's current size
        // (e.g. the file was truncated while we were down); start fresh.
        if meta.size() < self.offset {
            self.offset = 0;
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;
        self.reader = Some(reader);
        self.inode = Some(ino);
        Ok(())
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.reader.is_none() {
            self.open()?;
        }
        Ok(())
    }

    /// Detects rotation (inode changed) or truncation (size shrank below
    /// our offset) and reopens the file from the appropriate position.
    fn check_rotation_or_truncate(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let meta = std::fs::metadata(&self.path)?;
        let current_ino = meta.ino();

        if self.inode.is_some() && self.inode != Some(current_ino) {
            self.reader = None;
            self.offset = 0;
            self.open()?;
            return Ok(());
        }

        if meta.size() < self.offset {
            self.offset = 0;
            if let Some(reader) = self.reader.as_mut() {
                reader.seek(SeekFrom::Start(0))?;
            } else {
                self.open()?;
            }
        }
        Ok(())
    }

    /// Reads up to `max_lines` newline-terminated lines newly appended to
    /// the file, advancing `offset` by the bytes consumed. Returns an empty
    /// vec (not an error) when the file doesn't exist yet or has nothing
    /// new to read.
    pub fn read_new_lines(&mut self, max_lines: usize) -> Result<Vec<String>> {
        self.ensure_open()?;
        if self.reader.is_none() {
            return Ok(Vec::new());
        }

        let mut lines = Vec::new();
        loop {
            if lines.len() >= max_lines {
                break;
            }
            let mut buf = String::new();
            let bytes_read = {
                let reader = self.reader.as_mut().unwrap();
                reader.read_line(&mut buf)?
            };
            if bytes_read == 0 {
                break;
            }
            self.offset += bytes_read as u64;
            if buf.ends_with('\n') {
                lines.push(buf);
            } else {
                // Partial line at EOF: rewind so the next read sees it whole.
                self.offset -= bytes_read as u64;
                if let Some(reader) = self.reader.as_mut() {
                    reader.seek(SeekFrom::Start(self.offset))?;
                }
                break;
            }
        }

        if lines.is_empty() {
            self.check_rotation_or_truncate()?;
        }

        Ok(lines)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_all(path: &Path, content: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn reads_lines_appended_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        write_all(&path, "line one\n");

        let mut tailer = Tailer::new(&path);
        let lines = tailer.read_new_lines(4096).unwrap();
        assert_eq!(lines, vec!["line one\n"]);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"line two\n").unwrap();

        let lines = tailer.read_new_lines(4096).unwrap();
        assert_eq!(lines, vec!["line two\n"]);
    }

    #[test]
    fn holds_back_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        write_all(&path, "complete\npartial");

        let mut tailer = Tailer::new(&path);
        let lines = tailer.read_new_lines(4096).unwrap();
        assert_eq!(lines, vec!["complete\n"]);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b" line\n").unwrap();

        let lines = tailer.read_new_lines(4096).unwrap();
        assert_eq!(lines, vec!["partial line\n"]);
    }

    #[test]
    fn detects_truncate_and_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        write_all(&path, "aaaaaaaaaa\n");

        let mut tailer = Tailer::new(&path);
        tailer.read_new_lines(4096).unwrap();

        // truncate in place (copytruncate-style rotation)
        write_all(&path, "short\n");
        let lines = tailer.read_new_lines(4096).unwrap();
        assert_eq!(lines, vec!["short\n"]);
    }

    #[test]
    fn detects_inode_change_on_rename_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        write_all(&path, "old content\n");

        let mut tailer = Tailer::new(&path);
        tailer.read_new_lines(4096).unwrap();

        let rotated = dir.path().join("access.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        write_all(&path, "new content\n");

        let lines = tailer.read_new_lines(4096).unwrap();
        assert_eq!(lines, vec!["new content\n"]);
    }

    #[test]
    fn missing_file_returns_empty_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.log");
        let mut tailer = Tailer::new(&path);
        let lines = tailer.read_new_lines(4096).unwrap();
        assert!(lines.is_empty());
    }
}
