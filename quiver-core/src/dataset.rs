//! Dataset heads: the only mutable state.
//!
//! A dataset is a name bound to a commit ref. Bindings only move through
//! [`DatasetStore::compare_and_set`], so concurrent writers race on a single
//! atomic step and losers find out instead of overwriting the winner.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hash::Ref;

/// Storage of dataset heads.
pub trait DatasetStore: Send + Sync {
    /// Current head of a dataset, `None` if unbound.
    fn head(&self, name: &str) -> Result<Option<Ref>>;

    /// Point `name` at `new` if it currently points at `expected`
    /// (`None` = unbound). Returns false, changing nothing, otherwise.
    fn compare_and_set(&self, name: &str, expected: Option<&Ref>, new: &Ref) -> Result<bool>;

    /// Remove a binding. Administrative; returns false if it did not exist.
    fn remove(&self, name: &str) -> Result<bool>;

    /// Snapshot of every binding.
    fn list(&self) -> Result<BTreeMap<String, Ref>>;
}

/// In-memory dataset store
#[derive(Clone, Default)]
pub struct MemoryDatasetStore {
    heads: Arc<Mutex<HashMap<String, Ref>>>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Default::default()
    }
}

impl DatasetStore for MemoryDatasetStore {
    fn head(&self, name: &str) -> Result<Option<Ref>> {
        Ok(self.heads.lock()?.get(name).copied())
    }

    fn compare_and_set(&self, name: &str, expected: Option<&Ref>, new: &Ref) -> Result<bool> {
        let mut heads = self.heads.lock()?;
        if heads.get(name) != expected {
            return Ok(false);
        }
        heads.insert(name.to_string(), *new);
        Ok(true)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.heads.lock()?.remove(name).is_some())
    }

    fn list(&self) -> Result<BTreeMap<String, Ref>> {
        Ok(self
            .heads
            .lock()?
            .iter()
            .map(|(name, head)| (name.clone(), *head))
            .collect())
    }
}

/// Dataset heads kept in a JSON file.
///
/// Every change rewrites the whole table through a temp file and a rename, so
/// the file is never half written. Access is serialised within one process
/// only; two processes sharing the file can lose updates.
pub struct FileDatasetStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileDatasetStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(FileDatasetStore {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<BTreeMap<String, Ref>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let table: BTreeMap<String, String> = serde_json::from_str(&text)?;
        table
            .into_iter()
            .map(|(name, head)| Ok((name, head.parse::<Ref>()?)))
            .collect()
    }

    fn write_table(&self, table: &BTreeMap<String, Ref>) -> Result<()> {
        let encoded: BTreeMap<&str, String> = table
            .iter()
            .map(|(name, head)| (name.as_str(), head.to_hex()))
            .collect();
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, &encoded)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| Error::from(e.error))?;
        Ok(())
    }
}

impl DatasetStore for FileDatasetStore {
    fn head(&self, name: &str) -> Result<Option<Ref>> {
        let _guard = self.lock.lock()?;
        Ok(self.read_table()?.get(name).copied())
    }

    fn compare_and_set(&self, name: &str, expected: Option<&Ref>, new: &Ref) -> Result<bool> {
        let _guard = self.lock.lock()?;
        let mut table = self.read_table()?;
        if table.get(name) != expected {
            return Ok(false);
        }
        table.insert(name.to_string(), *new);
        self.write_table(&table)?;
        debug!(dataset = name, head = %new.short(), path = %self.path.display(), "wrote dataset table");
        Ok(true)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        let _guard = self.lock.lock()?;
        let mut table = self.read_table()?;
        if table.remove(name).is_none() {
            return Ok(false);
        }
        self.write_table(&table)?;
        Ok(true)
    }

    fn list(&self) -> Result<BTreeMap<String, Ref>> {
        let _guard = self.lock.lock()?;
        self.read_table()
    }
}

/// Create a dataset store from a specification string.
///
/// `:memory:` or `file:///path/to/datasets.json`
pub fn create_dataset_store_from_spec(spec: &str) -> Result<Arc<dyn DatasetStore>> {
    if spec == ":memory:" {
        return Ok(Arc::new(MemoryDatasetStore::new()));
    }
    if let Some(path) = spec.strip_prefix("file://") {
        info!(path, "opening dataset table");
        return Ok(Arc::new(FileDatasetStore::new(path)?));
    }
    Err(Error::Config(format!("unknown dataset store spec: {}", spec)))
}
