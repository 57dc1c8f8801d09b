//! Three-way merge of values and commits.
//!
//! Maps and sets are merged by walking the diffs `base -> ours` and
//! `base -> theirs` side by side and applying the union of the changes to the
//! base as one batch, so the cost follows the size of the changes. Lists merge
//! the splices each side made to the base list: splices touching separate
//! ranges of the base are both applied, so an insert at the front on one side
//! and an edit further down on the other merge cleanly. Structs with the same
//! name merge field by field. Wherever both sides changed
//! the same slot differently and the change cannot be merged further down, a
//! [`Conflict`] is produced and the [`ConflictPolicy`] decides what goes into
//! the result.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::iter::Peekable;
use std::vec;

use tracing::{debug, info};

use crate::codec::{decode_item, encode_item};
use crate::collection::{edit_keyed, splice_indexed};
use crate::diff::{diff_lists, diff_sequences, DiffEvent, DiffIterator, Splice};
use crate::error::{Error, Result};
use crate::graph::{common_ancestor, read_commit};
use crate::hash::Ref;
use crate::tree::{Edit, ListSplice};
use crate::value::{List, Map, Sequence, Set, Struct, Value};
use crate::value_store::ValueStore;

/// What to put in the result when both sides changed the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Keep the base value and report the conflict.
    #[default]
    Report,
    /// Take our side silently.
    Ours,
    /// Take their side silently.
    Theirs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both sides wrote different values of the same shape.
    Value,
    /// The sides disagree on the kind of value (or struct name).
    Schema,
}

/// One step from the merged root value down to a conflicting slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(Value),
    Index(u64),
    Field(String),
}

/// A slot both sides changed incompatibly. `None` means absent on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub path: Vec<PathSegment>,
    pub base: Option<Value>,
    pub ours: Option<Value>,
    pub theirs: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// Ref of the merged value, already written.
    pub value: Ref,
    pub conflicts: Vec<Conflict>,
    /// Commit the merge was computed against.
    pub base: Option<Ref>,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Merge two values that both descend from `base`.
///
/// Returns the merged value and the conflicts left in it. With
/// [`ConflictPolicy::Report`] every conflicting slot keeps its base value;
/// the other policies resolve silently and never report.
pub fn merge_values(
    vs: &ValueStore,
    base: Option<&Value>,
    ours: &Value,
    theirs: &Value,
    policy: ConflictPolicy,
) -> Result<(Value, Vec<Conflict>)> {
    let mut merger = Merger {
        vs,
        policy,
        conflicts: Vec::new(),
    };
    let merged = merger.merge_slot(base, Some(ours), Some(theirs), &mut Vec::new())?;
    // A conflict at the root with no base has nothing to fall back to.
    Ok((merged.unwrap_or_else(|| ours.clone()), merger.conflicts))
}

/// Merge the values of two commits.
///
/// `base` defaults to their common ancestor; commits with unrelated histories
/// fail with [`Error::NoCommonAncestor`]. The merged value is written to the
/// store but no commit is created.
pub fn merge_commits(
    vs: &ValueStore,
    ours: &Ref,
    theirs: &Ref,
    base: Option<&Ref>,
    policy: ConflictPolicy,
) -> Result<MergeResult> {
    let base = match base {
        Some(base) => *base,
        None => common_ancestor(vs, ours, theirs)?.ok_or(Error::NoCommonAncestor(*ours, *theirs))?,
    };

    let ours_commit = read_commit(vs, ours)?;
    let theirs_commit = read_commit(vs, theirs)?;
    if ours_commit.value == theirs_commit.value {
        return Ok(MergeResult {
            value: ours_commit.value,
            conflicts: Vec::new(),
            base: Some(base),
        });
    }

    let base_value = vs.read_value(&read_commit(vs, &base)?.value)?;
    let ours_value = vs.read_value(&ours_commit.value)?;
    let theirs_value = vs.read_value(&theirs_commit.value)?;

    let (merged, conflicts) = merge_values(vs, Some(&base_value), &ours_value, &theirs_value, policy)?;
    let value = vs.write_value(&merged)?;
    info!(
        ours = %ours.short(),
        theirs = %theirs.short(),
        base = %base.short(),
        merged = %value.short(),
        conflicts = conflicts.len(),
        "merged commits"
    );
    Ok(MergeResult {
        value,
        conflicts,
        base: Some(base),
    })
}

struct Merger<'a> {
    vs: &'a ValueStore,
    policy: ConflictPolicy,
    conflicts: Vec<Conflict>,
}

impl<'a> Merger<'a> {
    /// Merge one slot. `None` in the result means the slot is absent.
    fn merge_slot(
        &mut self,
        base: Option<&Value>,
        ours: Option<&Value>,
        theirs: Option<&Value>,
        path: &mut Vec<PathSegment>,
    ) -> Result<Option<Value>> {
        if ours == theirs || theirs == base {
            return Ok(ours.cloned());
        }
        if ours == base {
            return Ok(theirs.cloned());
        }
        match (ours, theirs) {
            (Some(ours), Some(theirs)) => self.merge_present(base, ours, theirs, path),
            _ => Ok(self.conflict(ConflictKind::Value, base, ours, theirs, path)),
        }
    }

    fn merge_present(
        &mut self,
        base: Option<&Value>,
        ours: &Value,
        theirs: &Value,
        path: &mut Vec<PathSegment>,
    ) -> Result<Option<Value>> {
        let merged = match (ours, theirs) {
            (Value::Map(a), Value::Map(b)) => {
                let base = base
                    .and_then(Value::as_map)
                    .map(|m| m.sequence().clone())
                    .unwrap_or_else(|| Map::empty().sequence().clone());
                Value::Map(Map(self.merge_keyed(&base, a.sequence(), b.sequence(), path)?))
            }
            (Value::Set(a), Value::Set(b)) => {
                let base = base
                    .and_then(Value::as_set)
                    .map(|s| s.sequence().clone())
                    .unwrap_or_else(|| Set::empty().sequence().clone());
                Value::Set(Set(self.merge_keyed(&base, a.sequence(), b.sequence(), path)?))
            }
            (Value::List(a), Value::List(b)) => {
                let base = base
                    .and_then(Value::as_list)
                    .map(|l| l.sequence().clone())
                    .unwrap_or_else(|| List::empty().sequence().clone());
                Value::List(List(self.merge_list(&base, a.sequence(), b.sequence(), path)?))
            }
            (Value::Struct(a), Value::Struct(b)) if a.name == b.name => {
                let base = base.and_then(Value::as_struct).filter(|s| s.name == a.name);
                Value::Struct(self.merge_struct(base, a, b, path)?)
            }
            (Value::Struct(_), Value::Struct(_)) => {
                return Ok(self.conflict(ConflictKind::Schema, base, Some(ours), Some(theirs), path));
            }
            _ if ours.kind() == theirs.kind() => {
                return Ok(self.conflict(ConflictKind::Value, base, Some(ours), Some(theirs), path));
            }
            _ => {
                return Ok(self.conflict(ConflictKind::Schema, base, Some(ours), Some(theirs), path));
            }
        };
        Ok(Some(merged))
    }

    fn conflict(
        &mut self,
        kind: ConflictKind,
        base: Option<&Value>,
        ours: Option<&Value>,
        theirs: Option<&Value>,
        path: &[PathSegment],
    ) -> Option<Value> {
        match self.policy {
            ConflictPolicy::Ours => ours.cloned(),
            ConflictPolicy::Theirs => theirs.cloned(),
            ConflictPolicy::Report => {
                debug!(?kind, ?path, "merge conflict");
                self.conflicts.push(Conflict {
                    kind,
                    path: path.to_vec(),
                    base: base.cloned(),
                    ours: ours.cloned(),
                    theirs: theirs.cloned(),
                });
                base.cloned()
            }
        }
    }

    fn merge_keyed(
        &mut self,
        base: &Sequence,
        ours: &Sequence,
        theirs: &Sequence,
        path: &mut Vec<PathSegment>,
    ) -> Result<Sequence> {
        let vs = self.vs;
        let mut ours_diff = diff_sequences(vs, base, ours)?;
        let mut theirs_diff = diff_sequences(vs, base, theirs)?;
        let mut ours_next = next_event(&mut ours_diff)?;
        let mut theirs_next = next_event(&mut theirs_diff)?;
        let mut edits = Vec::new();

        loop {
            let order = match (&ours_next, &theirs_next) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(o), Some(t)) => o.key().cmp(t.key()),
            };
            match order {
                Ordering::Less => {
                    if let Some(event) = ours_next.take() {
                        edits.push(edit_for(&event));
                    }
                    ours_next = next_event(&mut ours_diff)?;
                }
                Ordering::Greater => {
                    if let Some(event) = theirs_next.take() {
                        edits.push(edit_for(&event));
                    }
                    theirs_next = next_event(&mut theirs_diff)?;
                }
                Ordering::Equal => {
                    if let (Some(o), Some(t)) = (ours_next.take(), theirs_next.take()) {
                        if let Some(edit) = self.merge_entry(&o, &t, path)? {
                            edits.push(edit);
                        }
                    }
                    ours_next = next_event(&mut ours_diff)?;
                    theirs_next = next_event(&mut theirs_diff)?;
                }
            }
        }

        debug!(edits = edits.len(), "merged keyed sequence");
        edit_keyed(vs, base, edits)
    }

    /// Both sides changed the entry at the same key.
    fn merge_entry(
        &mut self,
        ours: &DiffEvent,
        theirs: &DiffEvent,
        path: &mut Vec<PathSegment>,
    ) -> Result<Option<Edit>> {
        if ours.new_value() == theirs.new_value() {
            return Ok(Some(edit_for(ours)));
        }
        let base = ours.old_value().map(decode_item).transpose()?;
        let ours_value = ours.new_value().map(decode_item).transpose()?;
        let theirs_value = theirs.new_value().map(decode_item).transpose()?;

        path.push(PathSegment::Key(decode_item(ours.key())?));
        let merged = self.merge_slot(base.as_ref(), ours_value.as_ref(), theirs_value.as_ref(), path);
        path.pop();

        let key = ours.key().to_vec();
        Ok(match (merged?, base) {
            (Some(value), _) => Some(Edit::Insert(key, encode_item(&value)?)),
            (None, Some(_)) => Some(Edit::Delete(key)),
            (None, None) => None,
        })
    }

    fn merge_list(
        &mut self,
        base: &Sequence,
        ours: &Sequence,
        theirs: &Sequence,
        path: &mut Vec<PathSegment>,
    ) -> Result<Sequence> {
        let vs = self.vs;
        let mut ours_splices = diff_lists(vs, base, ours)?.collect::<Result<Vec<_>>>()?.into_iter().peekable();
        let mut theirs_splices = diff_lists(vs, base, theirs)?.collect::<Result<Vec<_>>>()?.into_iter().peekable();
        let mut splices = Vec::new();

        loop {
            let next = match (ours_splices.peek(), theirs_splices.peek()) {
                (None, None) => break,
                (Some(o), Some(t)) if overlaps(o, t) => Ordering::Equal,
                (Some(o), Some(t)) => splice_order(o).cmp(&splice_order(t)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
            };
            match next {
                Ordering::Less => splices.extend(ours_splices.next().map(list_splice)),
                Ordering::Greater => splices.extend(theirs_splices.next().map(list_splice)),
                Ordering::Equal => {
                    let (ours_group, theirs_group) = take_overlapping(&mut ours_splices, &mut theirs_splices);
                    splices.extend(self.merge_overlap(base, ours_group, theirs_group, path)?);
                }
            }
        }

        debug!(splices = splices.len(), "merged list");
        splice_indexed(vs, base, splices)
    }

    /// Both sides spliced overlapping ranges of the base list.
    fn merge_overlap(
        &mut self,
        base: &Sequence,
        ours: Vec<Splice>,
        theirs: Vec<Splice>,
        path: &mut Vec<PathSegment>,
    ) -> Result<Vec<ListSplice>> {
        if same_edits(&ours, &theirs) {
            return Ok(ours.into_iter().map(list_splice).collect());
        }
        if let ([o], [t]) = (ours.as_slice(), theirs.as_slice()) {
            if o.at == t.at && replaces_one(o) && replaces_one(t) {
                // Both replaced the same element: merge the element itself.
                let base_value = decode_item(&o.removed[0])?;
                let ours_value = decode_item(&o.added[0])?;
                let theirs_value = decode_item(&t.added[0])?;
                path.push(PathSegment::Index(o.at));
                let merged = self.merge_slot(Some(&base_value), Some(&ours_value), Some(&theirs_value), path);
                path.pop();
                let insert = match merged? {
                    Some(value) if value == base_value => return Ok(Vec::new()),
                    Some(value) => vec![encode_item(&value)?],
                    None => Vec::new(),
                };
                return Ok(vec![ListSplice {
                    index: o.at,
                    remove: 1,
                    insert,
                }]);
            }
        }

        let start = ours.iter().chain(&theirs).map(|s| s.at).min().unwrap_or(0);
        let end = ours.iter().chain(&theirs).map(Splice::old_end).max().unwrap_or(start);
        let base_items = read_range(self.vs, base, start, end)?;
        let base_value = if base_items.is_empty() {
            None
        } else {
            Some(list_value(self.vs, &base_items)?)
        };
        let ours_value = list_value(self.vs, &apply_within(&base_items, start, &ours))?;
        let theirs_value = list_value(self.vs, &apply_within(&base_items, start, &theirs))?;

        path.push(PathSegment::Index(start));
        self.conflict(
            ConflictKind::Value,
            base_value.as_ref(),
            Some(&ours_value),
            Some(&theirs_value),
            path,
        );
        path.pop();
        Ok(match self.policy {
            ConflictPolicy::Report => Vec::new(),
            ConflictPolicy::Ours => ours.into_iter().map(list_splice).collect(),
            ConflictPolicy::Theirs => theirs.into_iter().map(list_splice).collect(),
        })
    }

    fn merge_struct(
        &mut self,
        base: Option<&Struct>,
        ours: &Struct,
        theirs: &Struct,
        path: &mut Vec<PathSegment>,
    ) -> Result<Struct> {
        let names: BTreeSet<&String> = ours
            .fields
            .keys()
            .chain(theirs.fields.keys())
            .chain(base.into_iter().flat_map(|s| s.fields.keys()))
            .collect();

        let mut merged = Struct::new(ours.name.clone());
        for name in names {
            path.push(PathSegment::Field(name.clone()));
            let value = self.merge_slot(
                base.and_then(|s| s.get(name)),
                ours.get(name),
                theirs.get(name),
                path,
            );
            path.pop();
            if let Some(value) = value? {
                merged.fields.insert(name.clone(), value);
            }
        }
        Ok(merged)
    }
}

fn next_event(diff: &mut DiffIterator<'_>) -> Result<Option<DiffEvent>> {
    diff.next().transpose()
}

fn edit_for(event: &DiffEvent) -> Edit {
    match event.new_value() {
        Some(value) => Edit::Insert(event.key().to_vec(), value.to_vec()),
        None => Edit::Delete(event.key().to_vec()),
    }
}

type Splices = Peekable<vec::IntoIter<Splice>>;

/// Whether two splices of the same base list touch the same base range. Two
/// inserts overlap only at the same index; an insert overlaps a removal only
/// strictly inside it.
fn overlaps(a: &Splice, b: &Splice) -> bool {
    match (a.removed.is_empty(), b.removed.is_empty()) {
        (true, true) => a.at == b.at,
        (true, false) => b.at < a.at && a.at < b.old_end(),
        (false, true) => a.at < b.at && b.at < a.old_end(),
        (false, false) => a.at < b.old_end() && b.at < a.old_end(),
    }
}

/// Inserts go before a removal starting at the same index.
fn splice_order(splice: &Splice) -> (u64, bool) {
    (splice.at, !splice.removed.is_empty())
}

/// Take the next overlapping pair and every splice chained to it through
/// further overlaps.
fn take_overlapping(ours: &mut Splices, theirs: &mut Splices) -> (Vec<Splice>, Vec<Splice>) {
    let mut ours_group: Vec<Splice> = ours.next().into_iter().collect();
    let mut theirs_group: Vec<Splice> = theirs.next().into_iter().collect();
    loop {
        if let Some(next) = ours.next_if(|s| theirs_group.iter().any(|t| overlaps(s, t))) {
            ours_group.push(next);
        } else if let Some(next) = theirs.next_if(|s| ours_group.iter().any(|o| overlaps(s, o))) {
            theirs_group.push(next);
        } else {
            return (ours_group, theirs_group);
        }
    }
}

/// Same base ranges replaced by the same items. New-side indices may differ.
fn same_edits(ours: &[Splice], theirs: &[Splice]) -> bool {
    ours.len() == theirs.len()
        && ours
            .iter()
            .zip(theirs)
            .all(|(o, t)| o.at == t.at && o.removed == t.removed && o.added == t.added)
}

fn replaces_one(splice: &Splice) -> bool {
    splice.removed.len() == 1 && splice.added.len() == 1
}

fn list_splice(splice: Splice) -> ListSplice {
    ListSplice {
        index: splice.at,
        remove: splice.removed.len() as u64,
        insert: splice.added,
    }
}

/// Encoded base items in `[start, end)`.
fn read_range(vs: &ValueStore, base: &Sequence, start: u64, end: u64) -> Result<Vec<Vec<u8>>> {
    let mut cursor = vs.cursor_at_index(base, start)?;
    let mut items = Vec::new();
    for _ in start..end {
        match cursor.current_value() {
            Some(value) => items.push(value.to_vec()),
            None => break,
        }
        cursor.advance()?;
    }
    Ok(items)
}

/// `base_items` (starting at base index `start`) with `splices` applied.
fn apply_within(base_items: &[Vec<u8>], start: u64, splices: &[Splice]) -> Vec<Vec<u8>> {
    let offset = |index: u64| ((index - start) as usize).min(base_items.len());
    let mut items = Vec::new();
    let mut pos = start;
    for splice in splices {
        items.extend_from_slice(&base_items[offset(pos)..offset(splice.at)]);
        items.extend(splice.added.iter().cloned());
        pos = splice.old_end();
    }
    items.extend_from_slice(&base_items[offset(pos)..]);
    items
}

fn list_value(vs: &ValueStore, items: &[Vec<u8>]) -> Result<Value> {
    let values = items.iter().map(|item| decode_item(item)).collect::<Result<Vec<_>>>()?;
    Ok(Value::List(List::from_values(vs, values)?))
}
