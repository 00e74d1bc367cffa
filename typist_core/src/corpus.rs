use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can arise while persisting corpus entries, crashes or the manifest.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An I/O error occurred while reading or writing a file in the output tree.
    #[error("Storage I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest could not be encoded or decoded.
    #[error("Manifest serialization error at {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A file with the target name already exists; names are never reused.
    #[error("Refusing to overwrite existing entry {0:?}")]
    AlreadyExists(PathBuf),
}

/// Sequence number of a corpus entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number of a crash. Crash ids are allocated independently of entry ids.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct CrashId(pub u64);

impl fmt::Display for CrashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An input retained in the corpus. Entries are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub id: EntryId,
    /// The entry this one was mutated from; `None` for seeds.
    pub parent: Option<EntryId>,
    pub path: PathBuf,
}

impl CorpusEntry {
    /// File name under the queue directory: `id-<N>` or `id-<N>-from-<P>`.
    pub fn file_name(id: EntryId, parent: Option<EntryId>) -> String {
        match parent {
            Some(parent) => format!("id-{id}-from-{parent}"),
            None => format!("id-{id}"),
        }
    }
}

/// A crashing input, attributed to the corpus entry that was being fuzzed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashRecord {
    pub id: CrashId,
    pub source: EntryId,
    pub path: PathBuf,
}

impl CrashRecord {
    /// File name under the crashes directory: `crash-<N>-from-<S>`.
    pub fn file_name(id: CrashId, source: EntryId) -> String {
        format!("crash-{id}-from-{source}")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    Seed,
    Discovered,
    Crash,
}

/// One line of lineage, stored in the manifest so identifiers never have to be
/// parsed back out of file names.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub kind: RecordKind,
    pub name: String,
    /// Entry id for seeds and discoveries, crash id for crashes.
    pub id: u64,
    /// Parent entry for discoveries, source entry for crashes.
    pub parent: Option<EntryId>,
    pub size: usize,
    /// MD5 hex digest of the persisted bytes.
    pub md5: String,
}

/// Layout of a run's output tree.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub queue_dir: PathBuf,
    pub crashes_dir: PathBuf,
}

impl OutputLayout {
    pub const QUEUE_DIR: &'static str = "queue";
    pub const CRASHES_DIR: &'static str = "crashes";

    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            queue_dir: root.join(Self::QUEUE_DIR),
            crashes_dir: root.join(Self::CRASHES_DIR),
        }
    }
}

/// Persists queue entries and crashes as individual files and keeps a JSON
/// manifest of their lineage next to them.
///
/// The store only ever creates files: existing names are rejected, which keeps
/// identifiers unique on disk as well as in memory.
#[derive(Debug)]
pub struct CorpusStore {
    layout: OutputLayout,
    manifest_path: PathBuf,
    records: Vec<ManifestRecord>,
}

impl CorpusStore {
    /// Default filename for the manifest, written to the output root.
    pub const MANIFEST_FILENAME: &'static str = "manifest.json";

    /// Opens a store over an already prepared layout. Queue and crash
    /// directories are created if they do not exist yet.
    pub fn new(layout: OutputLayout) -> Result<Self, StorageError> {
        for dir in [&layout.queue_dir, &layout.crashes_dir] {
            fs::create_dir_all(dir).map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        let manifest_path = layout.root.join(Self::MANIFEST_FILENAME);
        let store = Self {
            layout,
            manifest_path,
            records: Vec::new(),
        };
        store.save_manifest()?;
        Ok(store)
    }

    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Stores a seed input as `id-<N>`.
    pub fn save_seed(&mut self, id: EntryId, bytes: &[u8]) -> Result<CorpusEntry, StorageError> {
        let name = CorpusEntry::file_name(id, None);
        let path = self.write_new(&self.layout.queue_dir.join(&name), bytes)?;
        self.append_record(RecordKind::Seed, name, id.0, None, bytes)?;
        Ok(CorpusEntry {
            id,
            parent: None,
            path,
        })
    }

    /// Stores a coverage-increasing input as `id-<N>-from-<P>`.
    pub fn save_discovery(
        &mut self,
        id: EntryId,
        parent: EntryId,
        bytes: &[u8],
    ) -> Result<CorpusEntry, StorageError> {
        let name = CorpusEntry::file_name(id, Some(parent));
        let path = self.write_new(&self.layout.queue_dir.join(&name), bytes)?;
        self.append_record(RecordKind::Discovered, name, id.0, Some(parent), bytes)?;
        Ok(CorpusEntry {
            id,
            parent: Some(parent),
            path,
        })
    }

    /// Stores a crashing input as `crash-<N>-from-<S>`.
    pub fn save_crash(
        &mut self,
        id: CrashId,
        source: EntryId,
        bytes: &[u8],
    ) -> Result<CrashRecord, StorageError> {
        let name = CrashRecord::file_name(id, source);
        let path = self.write_new(&self.layout.crashes_dir.join(&name), bytes)?;
        self.append_record(RecordKind::Crash, name, id.0, Some(source), bytes)?;
        info!(crash_id = %id, path = %path.display(), "crash saved");
        Ok(CrashRecord { id, source, path })
    }

    /// Loads a manifest previously written by a store.
    pub fn load_manifest(path: &Path) -> Result<Vec<ManifestRecord>, StorageError> {
        let file = File::open(path).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| StorageError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_new(&self, path: &Path, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        if path.exists() {
            return Err(StorageError::AlreadyExists(path.to_path_buf()));
        }
        fs::write(path, bytes).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), size = bytes.len(), "wrote entry");
        Ok(path.to_path_buf())
    }

    fn append_record(
        &mut self,
        kind: RecordKind,
        name: String,
        id: u64,
        parent: Option<EntryId>,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.records.push(ManifestRecord {
            kind,
            name,
            id,
            parent,
            size: bytes.len(),
            md5: format!("{:x}", md5::compute(bytes)),
        });
        self.save_manifest()
    }

    /// Rewrites the whole manifest. Finds are rare next to executions, so a
    /// full rewrite per record is cheap enough.
    fn save_manifest(&self) -> Result<(), StorageError> {
        let file = File::create(&self.manifest_path).map_err(|source| StorageError::Io {
            path: self.manifest_path.clone(),
            source,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.records).map_err(|source| {
            StorageError::Manifest {
                path: self.manifest_path.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, CorpusStore) {
        let out = TempDir::new().unwrap();
        let store = CorpusStore::new(OutputLayout::under(out.path())).unwrap();
        (out, store)
    }

    #[test]
    fn file_names_follow_naming_scheme() {
        assert_eq!(CorpusEntry::file_name(EntryId(0), None), "id-0");
        assert_eq!(CorpusEntry::file_name(EntryId(12), Some(EntryId(3))), "id-12-from-3");
        assert_eq!(CrashRecord::file_name(CrashId(4), EntryId(9)), "crash-4-from-9");
    }

    #[test]
    fn new_store_creates_directories_and_empty_manifest() {
        let (out, store) = open_store();
        assert!(out.path().join(OutputLayout::QUEUE_DIR).is_dir());
        assert!(out.path().join(OutputLayout::CRASHES_DIR).is_dir());
        assert!(CorpusStore::load_manifest(store.manifest_path()).unwrap().is_empty());
    }

    #[test]
    fn saved_entries_land_in_their_directories() {
        let (out, mut store) = open_store();

        let seed = store.save_seed(EntryId(0), b"GOOD").unwrap();
        assert_eq!(seed.path, out.path().join("queue").join("id-0"));
        assert_eq!(fs::read(&seed.path).unwrap(), b"GOOD");

        let child = store.save_discovery(EntryId(1), seed.id, b"GOOF").unwrap();
        assert_eq!(child.parent, Some(EntryId(0)));
        assert_eq!(child.path, out.path().join("queue").join("id-1-from-0"));

        let crash = store.save_crash(CrashId(0), child.id, b"BOOM").unwrap();
        assert_eq!(crash.path, out.path().join("crashes").join("crash-0-from-1"));
        assert_eq!(fs::read(&crash.path).unwrap(), b"BOOM");
    }

    #[test]
    fn manifest_records_lineage_and_digest() {
        let (_out, mut store) = open_store();
        store.save_seed(EntryId(0), b"GOOD").unwrap();
        store.save_discovery(EntryId(1), EntryId(0), b"GOOF").unwrap();
        store.save_crash(CrashId(0), EntryId(1), b"BOOM").unwrap();

        let records = CorpusStore::load_manifest(store.manifest_path()).unwrap();
        assert_eq!(records, store.records());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, RecordKind::Seed);
        assert_eq!(records[0].parent, None);
        assert_eq!(records[1].kind, RecordKind::Discovered);
        assert_eq!(records[1].parent, Some(EntryId(0)));
        assert_eq!(records[2].kind, RecordKind::Crash);
        assert_eq!(records[2].parent, Some(EntryId(1)));
        assert_eq!(records[2].md5, format!("{:x}", md5::compute(b"BOOM")));
        assert_eq!(records[2].size, 4);
    }

    #[test]
    fn existing_names_are_never_overwritten() {
        let (_out, mut store) = open_store();
        store.save_seed(EntryId(0), b"first").unwrap();
        let err = store.save_seed(EntryId(0), b"second").unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert_eq!(store.records().len(), 1);
    }
}
