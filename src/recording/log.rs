//! Appending to, flushing, and loading recordings.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::format::RecordingDocument;
use super::interaction::{Exchange, Interaction, Recording};
use super::journal::Journal;
use super::RecordingError;

/// Accumulates interactions for a record session and hands out ordinals.
#[derive(Debug)]
pub struct InteractionLog {
    storage: Storage,
}

#[derive(Debug)]
enum Storage {
    Memory(Vec<Interaction>),
    Journal(Journal),
}

impl InteractionLog {
    /// A log held entirely in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { storage: Storage::Memory(Vec::new()) }
    }

    /// A log that spills every interaction to an append-only journal at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal file cannot be created.
    pub fn journaled(path: impl Into<PathBuf>) -> Result<Self, RecordingError> {
        Ok(Self { storage: Storage::Journal(Journal::create(path)?) })
    }

    /// Number of interactions appended so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        match &self.storage {
            Storage::Memory(items) => items.len() as u64,
            Storage::Journal(journal) => journal.len(),
        }
    }

    /// Whether nothing has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an exchange, assigning it the next ordinal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn append(&mut self, exchange: Exchange) -> Result<u64, RecordingError> {
        let ordinal = self.len();
        let interaction = Interaction::from_exchange(ordinal, exchange);
        match &mut self.storage {
            Storage::Memory(items) => items.push(interaction),
            Storage::Journal(journal) => journal.append(&interaction)?,
        }
        Ok(ordinal)
    }

    /// Looks up an appended interaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a journal-backed log cannot be read.
    pub fn find_by_ordinal(&self, ordinal: u64) -> Result<Option<Interaction>, RecordingError> {
        match &self.storage {
            Storage::Memory(items) => {
                Ok(usize::try_from(ordinal).ok().and_then(|i| items.get(i)).cloned())
            }
            Storage::Journal(journal) => journal.find(ordinal),
        }
    }

    /// Copies the current contents into a [`Recording`] without consuming the log.
    ///
    /// # Errors
    ///
    /// Returns an error if a journal-backed log cannot be read.
    pub fn snapshot(
        &self,
        session_file_id: impl Into<String>,
        variables: BTreeMap<String, String>,
    ) -> Result<Recording, RecordingError> {
        let interactions = match &self.storage {
            Storage::Memory(items) => items.clone(),
            Storage::Journal(journal) => journal.read_all()?,
        };
        Ok(Recording { session_file_id: session_file_id.into(), interactions, variables })
    }

    /// Drops the log, deleting any journal file.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be removed.
    pub fn discard(self) -> Result<(), RecordingError> {
        match self.storage {
            Storage::Memory(_) => Ok(()),
            Storage::Journal(journal) => journal.remove(),
        }
    }
}

/// Serializes a recording to its on-disk bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(recording: &Recording) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(&RecordingDocument::from_recording(recording))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parses recording bytes read from `path`.
///
/// # Errors
///
/// Returns [`RecordingError::Corrupt`] for malformed documents, non-contiguous
/// ordinals, or missing bodies.
pub fn decode(bytes: &[u8], path: &Path) -> Result<Recording, RecordingError> {
    let document: RecordingDocument = serde_json::from_slice(bytes)
        .map_err(|err| RecordingError::corrupt(path, err.to_string()))?;
    document
        .into_recording(session_file_id(path))
        .map_err(|reason| RecordingError::corrupt(path, reason))
}

/// Loads a recording from disk.
///
/// # Errors
///
/// Returns [`RecordingError::NotFound`] if the file is absent,
/// [`RecordingError::Corrupt`] if it is invalid, or an I/O error.
pub fn load(path: &Path) -> Result<Recording, RecordingError> {
    let bytes = std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            RecordingError::NotFound { path: path.to_path_buf() }
        } else {
            RecordingError::io("read", path, source)
        }
    })?;
    decode(&bytes, path)
}

/// Writes a recording atomically: a temp file in the target directory is
/// fully written and synced, then renamed over `path`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the write fails;
/// the previous file at `path`, if any, is left untouched in that case.
pub fn flush(path: &Path, recording: &Recording) -> Result<(), RecordingError> {
    let bytes = encode(recording).map_err(|err| RecordingError::corrupt(path, err.to_string()))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|source| RecordingError::io("create", parent, source))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|source| RecordingError::io("create temp file in", parent, source))?;
    temp.write_all(&bytes)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|source| RecordingError::io("write", temp.path(), source))?;
    temp.persist(path).map_err(|err| RecordingError::io("rename into", path, err.error))?;
    Ok(())
}

fn session_file_id(path: &Path) -> String {
    path.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::interaction::{Headers, RequestRecord, ResponseRecord};

    fn exchange(path: &str, body: &str) -> Exchange {
        let mut response_headers = Headers::new();
        response_headers.insert("content-type".into(), vec!["application/json".into()]);
        Exchange {
            request: RequestRecord {
                method: "GET".into(),
                uri: format!("https://example.test{path}"),
                headers: Headers::new(),
                body: None,
            },
            response: ResponseRecord {
                status: 200,
                headers: response_headers,
                body: Some(body.as_bytes().to_vec()),
            },
            duration: None,
        }
    }

    #[test]
    fn append_assigns_contiguous_ordinals() {
        let mut log = InteractionLog::in_memory();
        assert_eq!(log.append(exchange("/a", "{}")).unwrap(), 0);
        assert_eq!(log.append(exchange("/b", "{}")).unwrap(), 1);
        assert_eq!(log.len(), 2);
        let found = log.find_by_ordinal(1).unwrap().unwrap();
        assert!(found.request.uri.ends_with("/b"));
    }

    #[test]
    fn flush_then_load_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("items.json");

        let mut log = InteractionLog::in_memory();
        log.append(exchange("/items/1", r#"{"id":1}"#)).unwrap();
        log.append(exchange("/items/2", "{ \"id\": 2 }")).unwrap();
        let mut variables = BTreeMap::new();
        variables.insert("seed".to_string(), "42".to_string());
        let recording = log.snapshot("items", variables).unwrap();

        flush(&path, &recording).unwrap();
        let first = std::fs::read(&path).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, recording);

        flush(&path, &loaded).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second, "load -> flush must not change a single byte");
    }

    #[test]
    fn journaled_log_matches_memory_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = InteractionLog::journaled(dir.path().join("items.json.journal")).unwrap();
        log.append(exchange("/items/1", r#"{"id":1}"#)).unwrap();
        log.append(exchange("/items/2", r#"{"id":2}"#)).unwrap();

        let recording = log.snapshot("items", BTreeMap::new()).unwrap();
        assert_eq!(recording.len(), 2);
        assert_eq!(recording.interactions[1].ordinal, 1);
        log.discard().unwrap();
        assert!(!dir.path().join("items.json.journal").exists());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, RecordingError::NotFound { .. }));
    }

    #[test]
    fn load_rejects_gapped_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gap.json");
        let doc = serde_json::json!({
            "Entries": [{
                "Ordinal": 1,
                "RequestUri": "https://example.test/",
                "RequestMethod": "GET",
                "RequestHeaders": {},
                "RequestBody": null,
                "StatusCode": 200,
                "ResponseHeaders": {},
                "ResponseBody": null
            }],
            "Variables": {}
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(matches!(load(&path), Err(RecordingError::Corrupt { .. })));
    }

    #[test]
    fn failed_flush_leaves_previous_file_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.json");
        let recording = Recording::new("keep");
        flush(&path, &recording).unwrap();
        let before = std::fs::read(&path).unwrap();

        // A directory squatting on the temp location's target name makes the rename fail.
        let blocked = dir.path().join("blocked.json");
        std::fs::create_dir_all(blocked.join("child")).unwrap();
        assert!(flush(&blocked, &recording).is_err());

        assert_eq!(std::fs::read(&path).unwrap(), before);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files must not survive a failed flush");
    }
}
