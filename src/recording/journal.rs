//! Append-only journal of interactions, one JSON line per ordinal.
//!
//! Long record sessions spill here instead of holding every body in memory.
//! The journal is an intermediate artifact: it is read back in full when the
//! session stops and removed once the final recording has been written.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::format::EntryDocument;
use super::interaction::Interaction;
use super::RecordingError;

/// Append-only interaction journal.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl Journal {
    /// Creates (or truncates) a journal at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, RecordingError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|source| RecordingError::io("create", parent, source))?;
        }
        let file =
            File::create(&path).map_err(|source| RecordingError::io("create", &path, source))?;
        Ok(Self { path, file, len: 0 })
    }

    /// Reopens an existing journal for further appends, validating what is already there.
    ///
    /// # Errors
    ///
    /// Returns [`RecordingError::Corrupt`] if the existing lines are not
    /// contiguous from ordinal 0, or an I/O error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RecordingError> {
        let path = path.into();
        let existing = read_lines(&path)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| RecordingError::io("open", &path, source))?;
        Ok(Self { path, file, len: existing.len() as u64 })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of journaled interactions.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the journal is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one interaction. Its ordinal must be the next one in sequence.
    ///
    /// # Errors
    ///
    /// Returns an error on an out-of-sequence ordinal or a failed write.
    pub fn append(&mut self, interaction: &Interaction) -> Result<(), RecordingError> {
        if interaction.ordinal != self.len {
            return Err(RecordingError::corrupt(
                &self.path,
                format!("journal expected ordinal {}, got {}", self.len, interaction.ordinal),
            ));
        }
        let mut line = serde_json::to_vec(&EntryDocument::from_interaction(interaction))
            .map_err(|err| RecordingError::corrupt(&self.path, err.to_string()))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .map_err(|source| RecordingError::io("append to", &self.path, source))?;
        self.len += 1;
        Ok(())
    }

    /// Reads every journaled interaction in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or is corrupt.
    pub fn read_all(&self) -> Result<Vec<Interaction>, RecordingError> {
        read_lines(&self.path)
    }

    /// Finds one interaction by ordinal, scanning the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or is corrupt.
    pub fn find(&self, ordinal: u64) -> Result<Option<Interaction>, RecordingError> {
        if ordinal >= self.len {
            return Ok(None);
        }
        Ok(read_lines(&self.path)?.into_iter().find(|i| i.ordinal == ordinal))
    }

    /// Deletes the journal file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(self) -> Result<(), RecordingError> {
        drop(self.file);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RecordingError::io("remove", &self.path, source)),
        }
    }
}

fn read_lines(path: &Path) -> Result<Vec<Interaction>, RecordingError> {
    let file = File::open(path).map_err(|source| RecordingError::io("open", path, source))?;
    let mut interactions = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| RecordingError::io("read", path, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: EntryDocument = serde_json::from_str(&line)
            .map_err(|err| RecordingError::corrupt(path, format!("line {}: {err}", index + 1)))?;
        let expected = interactions.len() as u64;
        if entry.ordinal != Some(expected) {
            return Err(RecordingError::corrupt(
                path,
                format!("journal line {} is not ordinal {expected}", index + 1),
            ));
        }
        let interaction = entry
            .into_interaction(expected)
            .map_err(|reason| RecordingError::corrupt(path, reason))?;
        interactions.push(interaction);
    }
    Ok(interactions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::interaction::{Headers, RequestRecord, ResponseRecord};

    fn interaction(ordinal: u64) -> Interaction {
        Interaction {
            ordinal,
            request: RequestRecord {
                method: "GET".into(),
                uri: format!("https://example.test/items/{ordinal}"),
                headers: Headers::new(),
                body: None,
            },
            response: ResponseRecord {
                status: 200,
                headers: Headers::new(),
                body: Some(b"ok".to_vec()),
            },
            duration: None,
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path().join("session.journal")).unwrap();
        journal.append(&interaction(0)).unwrap();
        journal.append(&interaction(1)).unwrap();

        let all = journal.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].request.uri, "https://example.test/items/1");
        assert_eq!(journal.find(1).unwrap().map(|i| i.ordinal), Some(1));
        assert!(journal.find(2).unwrap().is_none());
    }

    #[test]
    fn rejects_out_of_sequence_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path().join("j")).unwrap();
        assert!(matches!(journal.append(&interaction(3)), Err(RecordingError::Corrupt { .. })));
        assert!(journal.is_empty());
    }

    #[test]
    fn reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j");
        let mut journal = Journal::create(&path).unwrap();
        journal.append(&interaction(0)).unwrap();
        drop(journal);

        let mut reopened = Journal::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        reopened.append(&interaction(1)).unwrap();
        assert_eq!(reopened.read_all().unwrap().len(), 2);
        reopened.remove().unwrap();
        assert!(!path.exists());
    }
}
