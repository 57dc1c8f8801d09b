//! Caller-facing database handle.
//!
//! Ties a chunk store, a dataset table and a configuration together and
//! exposes values, collections, commits, diffs, merges, pulls and garbage
//! collection through one type.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::collection::{CollectionEdits, ListEdit, MapEdit, SetEdit};
use crate::commit::{Commit, CommitMeta};
use crate::config::Config;
use crate::dataset::{create_dataset_store_from_spec, DatasetStore, MemoryDatasetStore};
use crate::diff::{diff_values, DiffResume, ValueDiff};
use crate::error::{Error, Result};
use crate::gc::{collect_garbage, GcStats};
use crate::graph::{self, update_dataset_with_retry, Ancestors};
use crate::hash::Ref;
use crate::merge::{merge_commits, merge_values, ConflictPolicy, MergeResult};
use crate::pull::pull;
use crate::store::{create_store_from_spec, ChunkStore, MemoryChunkStore};
use crate::value::{Kind, List, Map, Set, Value};
use crate::value_store::ValueStore;

/// A named head as seen when it was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub head: Option<Ref>,
}

#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// Explicit parents. When `None` the dataset's current head is the only
    /// parent, and a head that moves during the commit is merged in.
    pub parents: Option<Vec<Ref>>,
    /// Head the value was derived from, used as the merge base when the head
    /// has moved since. Defaults to the head read when the commit starts.
    pub base: Option<Ref>,
    pub meta: CommitMeta,
}

impl CommitOptions {
    pub fn new(meta: CommitMeta) -> Self {
        CommitOptions {
            parents: None,
            base: None,
            meta,
        }
    }

    pub fn based_on(mut self, head: Ref) -> Self {
        self.base = Some(head);
        self
    }

    pub fn with_parents(mut self, parents: Vec<Ref>) -> Self {
        self.parents = Some(parents);
        self
    }
}

pub struct Database {
    vs: ValueStore,
    datasets: Arc<dyn DatasetStore>,
    config: Config,
}

impl Database {
    /// Open the stores named by `config`.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let chunks = create_store_from_spec(&config.store.spec, config.store.cache_size)?;
        let datasets = create_dataset_store_from_spec(&config.datasets.spec)?;
        info!(store = %config.store.spec, datasets = %config.datasets.spec, "opened database");
        Ok(Database::with_stores(chunks, datasets, config))
    }

    pub fn in_memory() -> Self {
        Database::with_stores(
            Arc::new(MemoryChunkStore::new()),
            Arc::new(MemoryDatasetStore::new()),
            Config::default(),
        )
    }

    pub fn with_stores(chunks: Arc<dyn ChunkStore>, datasets: Arc<dyn DatasetStore>, config: Config) -> Self {
        Database {
            vs: ValueStore::new(chunks, config.chunking.clone()),
            datasets,
            config,
        }
    }

    pub fn value_store(&self) -> &ValueStore {
        &self.vs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn open_dataset(&self, name: &str) -> Result<Dataset> {
        Ok(Dataset {
            name: name.to_string(),
            head: self.datasets.head(name)?,
        })
    }

    pub fn datasets(&self) -> Result<BTreeMap<String, Ref>> {
        self.datasets.list()
    }

    /// Unbind a dataset. Its history stays until the next garbage collection.
    pub fn delete_dataset(&self, name: &str) -> Result<bool> {
        let removed = self.datasets.remove(name)?;
        if removed {
            info!(dataset = name, "deleted dataset");
        }
        Ok(removed)
    }

    // Values

    pub fn read_value(&self, hash: &Ref) -> Result<Value> {
        self.vs.read_value(hash)
    }

    pub fn read_value_as(&self, hash: &Ref, kind: Kind) -> Result<Value> {
        self.vs.read_value_as(hash, kind)
    }

    pub fn write_value(&self, value: &Value) -> Result<Ref> {
        self.vs.write_value(value)
    }

    pub fn new_map(&self, entries: impl IntoIterator<Item = (Value, Value)>) -> Result<Ref> {
        self.write_value(&Value::Map(Map::from_entries(&self.vs, entries)?))
    }

    pub fn new_list(&self, values: impl IntoIterator<Item = Value>) -> Result<Ref> {
        self.write_value(&Value::List(List::from_values(&self.vs, values)?))
    }

    pub fn new_set(&self, members: impl IntoIterator<Item = Value>) -> Result<Ref> {
        self.write_value(&Value::Set(Set::from_members(&self.vs, members)?))
    }

    /// Apply a batch of edits to the collection stored at `hash` and store the
    /// result.
    pub fn edit_collection(&self, hash: &Ref, edits: CollectionEdits) -> Result<Ref> {
        let current = self.read_value_as(hash, edits.kind())?;
        let edited = edits.apply(&self.vs, &current)?;
        self.write_value(&edited)
    }

    pub fn edit_map(&self, hash: &Ref, edits: Vec<MapEdit>) -> Result<Ref> {
        self.edit_collection(hash, CollectionEdits::Map(edits))
    }

    pub fn edit_list(&self, hash: &Ref, edits: Vec<ListEdit>) -> Result<Ref> {
        self.edit_collection(hash, CollectionEdits::List(edits))
    }

    pub fn edit_set(&self, hash: &Ref, edits: Vec<SetEdit>) -> Result<Ref> {
        self.edit_collection(hash, CollectionEdits::Set(edits))
    }

    /// Lazily diff the values stored at two refs.
    pub fn diff(&self, old: &Ref, new: &Ref) -> Result<ValueDiff<'_>> {
        let old = self.read_value(old)?;
        let new = self.read_value(new)?;
        diff_values(&self.vs, &old, &new)
    }

    /// Resume a diff of the same two refs after the point `resume` names.
    pub fn diff_starting_after(&self, old: &Ref, new: &Ref, resume: &DiffResume) -> Result<ValueDiff<'_>> {
        let old = self.read_value(old)?;
        let new = self.read_value(new)?;
        ValueDiff::starting_after(&self.vs, &old, &new, resume)
    }

    // Commits

    /// Commit `value` to `dataset` and move its head.
    ///
    /// Returns the new commit. Fails with [`Error::MergeNeeded`] if the parents
    /// do not descend from the current head, and with [`Error::MergeConflict`]
    /// if a concurrent writer's changes cannot be merged automatically.
    pub fn commit(&self, dataset: &str, value: &Value, options: CommitOptions) -> Result<Ref> {
        let CommitOptions { parents, base, meta } = options;
        let value_ref = self.vs.write_value(value)?;
        let started_from = match base {
            Some(base) => Some(base),
            None => self.datasets.head(dataset)?,
        };

        update_dataset_with_retry(
            self.datasets.as_ref(),
            dataset,
            self.config.commit.max_retries,
            |head| {
                let (value_ref, parents) = match (&parents, head) {
                    (Some(explicit), _) => (value_ref, explicit.clone()),
                    (None, None) => (value_ref, Vec::new()),
                    (None, Some(head)) if started_from.as_ref() == Some(head) => (value_ref, vec![*head]),
                    (None, Some(head)) => {
                        let rebased = self.rebase(dataset, started_from.as_ref(), value, head)?;
                        (rebased, vec![*head])
                    }
                };
                self.check_descends(dataset, head, &parents)?;
                graph::commit(&self.vs, &value_ref, &parents, meta.clone())
            },
        )
    }

    /// Merge our pending value into a head that moved underneath us.
    fn rebase(&self, dataset: &str, base: Option<&Ref>, ours: &Value, head: &Ref) -> Result<Ref> {
        let base_value = match base {
            Some(base) => Some(self.read_value(&self.read_commit(base)?.value)?),
            None => None,
        };
        let theirs = self.read_value(&self.read_commit(head)?.value)?;
        let (merged, conflicts) =
            merge_values(&self.vs, base_value.as_ref(), ours, &theirs, ConflictPolicy::Report)?;
        if !conflicts.is_empty() {
            return Err(Error::MergeConflict {
                dataset: dataset.to_string(),
                conflicts,
            });
        }
        info!(dataset, onto = %head.short(), "rebased commit onto moved head");
        self.write_value(&merged)
    }

    fn check_descends(&self, dataset: &str, head: Option<&Ref>, parents: &[Ref]) -> Result<()> {
        let head = match head {
            None => return Ok(()),
            Some(head) => head,
        };
        if parents.contains(head) {
            return Ok(());
        }
        for parent in parents {
            if graph::is_ancestor(&self.vs, head, parent)? {
                return Ok(());
            }
        }
        Err(Error::MergeNeeded {
            dataset: dataset.to_string(),
        })
    }

    pub fn read_commit(&self, hash: &Ref) -> Result<Commit> {
        graph::read_commit(&self.vs, hash)
    }

    /// Value committed at the head of `dataset`, if it has one.
    pub fn head_value(&self, dataset: &str) -> Result<Option<Value>> {
        match self.datasets.head(dataset)? {
            Some(head) => Ok(Some(self.read_value(&self.read_commit(&head)?.value)?)),
            None => Ok(None),
        }
    }

    pub fn ancestors(&self, hash: &Ref) -> Result<Ancestors<'_>> {
        graph::ancestors(&self.vs, hash)
    }

    /// History of a dataset, newest first, at most `limit` commits.
    pub fn log(&self, dataset: &str, limit: usize) -> Result<Vec<(Ref, Commit)>> {
        match self.datasets.head(dataset)? {
            Some(head) => self.ancestors(&head)?.take(limit).collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Three-way merge of two commits against their common ancestor,
    /// reporting conflicts.
    pub fn merge(&self, ours: &Ref, theirs: &Ref) -> Result<MergeResult> {
        self.merge_with_policy(ours, theirs, ConflictPolicy::Report)
    }

    pub fn merge_with_policy(&self, ours: &Ref, theirs: &Ref, policy: ConflictPolicy) -> Result<MergeResult> {
        merge_commits(&self.vs, ours, theirs, None, policy)
    }

    /// Copy `dataset` from `source` and fast-forward it here.
    ///
    /// Only chunks this database lacks are copied. Returns the new head, or
    /// `None` if `source` has no such dataset. Fails with
    /// [`Error::MergeNeeded`] if the local head is not an ancestor of the
    /// pulled one.
    pub fn pull(&self, source: &Database, dataset: &str) -> Result<Option<Ref>> {
        let head = match source.datasets.head(dataset)? {
            Some(head) => head,
            None => return Ok(None),
        };
        pull(source.vs.chunks().as_ref(), self.vs.chunks().as_ref(), &head)?;

        let moved = update_dataset_with_retry(
            self.datasets.as_ref(),
            dataset,
            self.config.commit.max_retries,
            |current| match current {
                Some(current) if *current != head && !graph::is_ancestor(&self.vs, current, &head)? => {
                    Err(Error::MergeNeeded {
                        dataset: dataset.to_string(),
                    })
                }
                _ => Ok(head),
            },
        )?;
        Ok(Some(moved))
    }

    pub fn gc(&self, dry_run: bool) -> Result<GcStats> {
        collect_garbage(self.vs.chunks().as_ref(), self.datasets.as_ref(), dry_run)
    }
}
