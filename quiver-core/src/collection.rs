//! Map, Set and List operations.
//!
//! Keys, set members and list elements are stored as encoded values
//! ([`codec::encode_item`]), so maps and sets are ordered byte-lexicographically
//! by the canonical encoding of their keys. Small collections are edited in
//! memory; chunked ones go through [`crate::tree::ProllyTree`]. Either way the
//! result's representation is chosen from its content alone.

use std::collections::BTreeMap;

use crate::codec::{decode_item, encode_item};
use crate::cursor::SequenceIter;
use crate::error::{Error, Result};
use crate::node::{Item, Node};
use crate::tree::{check_splices, normalize_edits, Edit, ListSplice};
use crate::value::{Kind, List, Map, Sequence, Set, Value};
use crate::value_store::ValueStore;

#[derive(Debug, Clone, PartialEq)]
pub enum MapEdit {
    /// Insert or overwrite
    Insert(Value, Value),
    /// Overwrite an existing key
    Update(Value, Value),
    /// Remove an existing key
    Remove(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetEdit {
    Insert(Value),
    /// Remove an existing member
    Remove(Value),
}

/// Remove `remove` elements at `index` and insert `insert` in their place.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEdit {
    pub index: u64,
    pub remove: u64,
    pub insert: Vec<Value>,
}

impl ListEdit {
    pub fn insert(index: u64, values: Vec<Value>) -> Self {
        ListEdit {
            index,
            remove: 0,
            insert: values,
        }
    }

    pub fn remove(index: u64, count: u64) -> Self {
        ListEdit {
            index,
            remove: count,
            insert: Vec::new(),
        }
    }

    pub fn set(index: u64, value: Value) -> Self {
        ListEdit {
            index,
            remove: 1,
            insert: vec![value],
        }
    }
}

/// A batch of edits for one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEdits {
    Map(Vec<MapEdit>),
    List(Vec<ListEdit>),
    Set(Vec<SetEdit>),
}

impl CollectionEdits {
    /// Kind of collection these edits apply to.
    pub fn kind(&self) -> Kind {
        match self {
            CollectionEdits::Map(_) => Kind::Map,
            CollectionEdits::List(_) => Kind::List,
            CollectionEdits::Set(_) => Kind::Set,
        }
    }

    /// Apply the edits to `value`, which must be a collection of the same kind.
    pub fn apply(self, vs: &ValueStore, value: &Value) -> Result<Value> {
        match (self, value) {
            (CollectionEdits::Map(edits), Value::Map(map)) => Ok(Value::Map(map.edit(vs, edits)?)),
            (CollectionEdits::List(edits), Value::List(list)) => Ok(Value::List(list.edit(vs, edits)?)),
            (CollectionEdits::Set(edits), Value::Set(set)) => Ok(Value::Set(set.edit(vs, edits)?)),
            (edits, value) => Err(Error::TypeMismatch {
                expected: edits.kind(),
                found: value.kind(),
            }),
        }
    }
}

fn empty_sequence() -> Sequence {
    Sequence::Inline(Node::new_leaf())
}

/// Apply keyed edits to a sequence.
pub(crate) fn edit_keyed(vs: &ValueStore, sequence: &Sequence, edits: Vec<Edit>) -> Result<Sequence> {
    if edits.is_empty() {
        return Ok(sequence.clone());
    }
    match sequence {
        Sequence::Inline(node) => {
            let mut entries: BTreeMap<Vec<u8>, Vec<u8>> = (0..node.len())
                .map(|i| (node.key(i).to_vec(), node.value(i).to_vec()))
                .collect();
            for edit in normalize_edits(edits) {
                match edit {
                    Edit::Insert(k, v) => {
                        entries.insert(k, v);
                    }
                    Edit::Update(k, v) => match entries.get_mut(&k) {
                        Some(slot) => *slot = v,
                        None => return Err(Error::KeyNotFound(hex::encode(k))),
                    },
                    Edit::Delete(k) => {
                        if entries.remove(&k).is_none() {
                            return Err(Error::KeyNotFound(hex::encode(k)));
                        }
                    }
                }
            }
            let items = entries.into_iter().map(|(k, v)| Item::leaf(k, v)).collect();
            vs.sequence_from_items(items, true)
        }
        Sequence::Chunked { root, .. } => {
            let new_root = vs.tree().edit(root, edits)?;
            vs.sequence_from_root(new_root)
        }
    }
}

/// Apply positional splices to a sequence.
pub(crate) fn splice_indexed(
    vs: &ValueStore,
    sequence: &Sequence,
    splices: Vec<ListSplice>,
) -> Result<Sequence> {
    if splices.is_empty() {
        return Ok(sequence.clone());
    }
    match sequence {
        Sequence::Inline(node) => {
            check_splices(&splices, node.len() as u64)?;
            let mut values = node.values.clone();
            for splice in splices.into_iter().rev() {
                let start = splice.index as usize;
                let end = start + splice.remove as usize;
                values.splice(start..end, splice.insert);
            }
            let items = values.into_iter().map(|v| Item::leaf(Vec::new(), v)).collect();
            vs.sequence_from_items(items, false)
        }
        Sequence::Chunked { root, .. } => {
            let new_root = vs.tree().splice(root, splices)?;
            vs.sequence_from_root(new_root)
        }
    }
}

fn get_keyed(vs: &ValueStore, sequence: &Sequence, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let cursor = vs.cursor_at_key(sequence, key)?;
    Ok(match cursor.current_key() {
        Some(found) if found == key => cursor.current_value().map(|v| v.to_vec()),
        _ => None,
    })
}

fn keyed_items(mut pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<Item> {
    // Later duplicates win.
    pairs.reverse();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs.dedup_by(|later, earlier| later.0 == earlier.0);
    pairs.into_iter().map(|(k, v)| Item::leaf(k, v)).collect()
}

impl Map {
    pub fn empty() -> Map {
        Map(empty_sequence())
    }

    /// Build a map. For repeated keys the last entry wins.
    pub fn from_entries(vs: &ValueStore, entries: impl IntoIterator<Item = (Value, Value)>) -> Result<Map> {
        let pairs = entries
            .into_iter()
            .map(|(k, v)| Ok((encode_item(&k)?, encode_item(&v)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Map(vs.sequence_from_items(keyed_items(pairs), true)?))
    }

    pub fn get(&self, vs: &ValueStore, key: &Value) -> Result<Option<Value>> {
        get_keyed(vs, &self.0, &encode_item(key)?)?
            .map(|bytes| decode_item(&bytes))
            .transpose()
    }

    pub fn contains_key(&self, vs: &ValueStore, key: &Value) -> Result<bool> {
        Ok(get_keyed(vs, &self.0, &encode_item(key)?)?.is_some())
    }

    /// Entries in key order.
    pub fn iter<'a>(&self, vs: &'a ValueStore) -> Result<MapIter<'a>> {
        Ok(MapIter(SequenceIter::new(vs.cursor(&self.0)?, None)))
    }

    /// Entries with keys `>= from` (in encoded order).
    pub fn iter_from<'a>(&self, vs: &'a ValueStore, from: &Value) -> Result<MapIter<'a>> {
        let cursor = vs.cursor_at_key(&self.0, &encode_item(from)?)?;
        Ok(MapIter(SequenceIter::new(cursor, None)))
    }

    pub fn edit(&self, vs: &ValueStore, edits: Vec<MapEdit>) -> Result<Map> {
        let edits = edits
            .into_iter()
            .map(|edit| {
                Ok(match edit {
                    MapEdit::Insert(k, v) => Edit::Insert(encode_item(&k)?, encode_item(&v)?),
                    MapEdit::Update(k, v) => Edit::Update(encode_item(&k)?, encode_item(&v)?),
                    MapEdit::Remove(k) => Edit::Delete(encode_item(&k)?),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Map(edit_keyed(vs, &self.0, edits)?))
    }
}

impl Set {
    pub fn empty() -> Set {
        Set(empty_sequence())
    }

    pub fn from_members(vs: &ValueStore, members: impl IntoIterator<Item = Value>) -> Result<Set> {
        let pairs = members
            .into_iter()
            .map(|m| Ok((encode_item(&m)?, Vec::new())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Set(vs.sequence_from_items(keyed_items(pairs), true)?))
    }

    pub fn contains(&self, vs: &ValueStore, member: &Value) -> Result<bool> {
        Ok(get_keyed(vs, &self.0, &encode_item(member)?)?.is_some())
    }

    pub fn iter<'a>(&self, vs: &'a ValueStore) -> Result<SetIter<'a>> {
        Ok(SetIter(SequenceIter::new(vs.cursor(&self.0)?, None)))
    }

    pub fn edit(&self, vs: &ValueStore, edits: Vec<SetEdit>) -> Result<Set> {
        let edits = edits
            .into_iter()
            .map(|edit| {
                Ok(match edit {
                    SetEdit::Insert(m) => Edit::Insert(encode_item(&m)?, Vec::new()),
                    SetEdit::Remove(m) => Edit::Delete(encode_item(&m)?),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Set(edit_keyed(vs, &self.0, edits)?))
    }
}

impl List {
    pub fn empty() -> List {
        List(empty_sequence())
    }

    pub fn from_values(vs: &ValueStore, values: impl IntoIterator<Item = Value>) -> Result<List> {
        let items = values
            .into_iter()
            .map(|v| Ok(Item::leaf(Vec::new(), encode_item(&v)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(List(vs.sequence_from_items(items, false)?))
    }

    pub fn get(&self, vs: &ValueStore, index: u64) -> Result<Option<Value>> {
        if index >= self.len() {
            return Ok(None);
        }
        let cursor = vs.cursor_at_index(&self.0, index)?;
        cursor.current_value().map(decode_item).transpose()
    }

    pub fn iter<'a>(&self, vs: &'a ValueStore) -> Result<ListIter<'a>> {
        Ok(ListIter(SequenceIter::new(vs.cursor(&self.0)?, None)))
    }

    /// Elements from `index` on.
    pub fn iter_from<'a>(&self, vs: &'a ValueStore, index: u64) -> Result<ListIter<'a>> {
        let cursor = vs.cursor_at_index(&self.0, index)?;
        Ok(ListIter(SequenceIter::new(cursor, None)))
    }

    /// Apply splices given against the current indices, ordered and disjoint.
    pub fn edit(&self, vs: &ValueStore, edits: Vec<ListEdit>) -> Result<List> {
        let splices = edits
            .into_iter()
            .map(|edit| {
                Ok(ListSplice {
                    index: edit.index,
                    remove: edit.remove,
                    insert: edit
                        .insert
                        .iter()
                        .map(encode_item)
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(List(splice_indexed(vs, &self.0, splices)?))
    }

    pub fn append(&self, vs: &ValueStore, values: Vec<Value>) -> Result<List> {
        self.edit(vs, vec![ListEdit::insert(self.len(), values)])
    }
}

/// Map entries in key order.
pub struct MapIter<'a>(SequenceIter<'a>);

impl<'a> Iterator for MapIter<'a> {
    type Item = Result<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.0.next()?;
        Some(item.and_then(|item| Ok((decode_item(&item.key)?, decode_item(&item.value)?))))
    }
}

pub struct SetIter<'a>(SequenceIter<'a>);

impl<'a> Iterator for SetIter<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.0.next()?;
        Some(item.and_then(|item| decode_item(&item.key)))
    }
}

pub struct ListIter<'a>(SequenceIter<'a>);

impl<'a> Iterator for ListIter<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.0.next()?;
        Some(item.and_then(|item| decode_item(&item.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkConfig;
    use crate::store::MemoryChunkStore;
    use std::sync::Arc;

    fn value_store() -> ValueStore {
        ValueStore::new(Arc::new(MemoryChunkStore::new()), ChunkConfig::with_pattern(0.05))
    }

    fn numbered(n: u64) -> Vec<(Value, Value)> {
        (0..n)
            .map(|i| (Value::from(format!("key{:05}", i)), Value::from(i)))
            .collect()
    }

    #[test]
    fn test_map_basic() {
        let vs = value_store();
        let map = Map::from_entries(&vs, vec![(Value::from("a"), Value::from(1i64))]).unwrap();
        assert!(!map.sequence().is_chunked());
        assert_eq!(map.get(&vs, &Value::from("a")).unwrap(), Some(Value::from(1i64)));
        assert_eq!(map.get(&vs, &Value::from("b")).unwrap(), None);
        assert!(map.contains_key(&vs, &Value::from("a")).unwrap());
    }

    #[test]
    fn test_map_equality_is_logical() {
        let vs = value_store();
        let mut entries = numbered(500);
        let a = Map::from_entries(&vs, entries.clone()).unwrap();
        entries.reverse();
        let b = Map::from_entries(&vs, entries).unwrap();
        assert!(a.sequence().is_chunked());
        assert_eq!(a, b);
    }

    #[test]
    fn test_map_edit_inline_and_chunked_agree() {
        let vs = value_store();
        let small = Map::from_entries(&vs, numbered(3)).unwrap();
        let grown = small
            .edit(
                &vs,
                numbered(600)
                    .into_iter()
                    .skip(3)
                    .map(|(k, v)| MapEdit::Insert(k, v))
                    .collect(),
            )
            .unwrap();
        assert_eq!(grown, Map::from_entries(&vs, numbered(600)).unwrap());

        let shrunk = grown
            .edit(
                &vs,
                numbered(600)
                    .into_iter()
                    .skip(2)
                    .map(|(k, _)| MapEdit::Remove(k))
                    .collect(),
            )
            .unwrap();
        assert_eq!(shrunk, Map::from_entries(&vs, numbered(2)).unwrap());
        assert!(!shrunk.sequence().is_chunked());
    }

    #[test]
    fn test_map_edit_errors() {
        let vs = value_store();
        let map = Map::from_entries(&vs, numbered(2)).unwrap();
        assert!(matches!(
            map.edit(&vs, vec![MapEdit::Remove(Value::from("zzz"))]),
            Err(Error::KeyNotFound(_))
        ));
        assert!(matches!(
            map.edit(&vs, vec![MapEdit::Update(Value::from("zzz"), Value::from(1i64))]),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_map_iter_is_sorted() {
        let vs = value_store();
        let map = Map::from_entries(&vs, numbered(300)).unwrap();
        let entries: Vec<(Value, Value)> = map.iter(&vs).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries, numbered(300));

        let tail: Vec<(Value, Value)> = map
            .iter_from(&vs, &Value::from("key00290"))
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(tail.len(), 10);
    }

    #[test]
    fn test_set() {
        let vs = value_store();
        let set = Set::from_members(&vs, vec![Value::from("x"), Value::from("y"), Value::from("x")]).unwrap();
        assert_eq!(set.len(), 2);
        let set = set
            .edit(&vs, vec![SetEdit::Insert(Value::from("z")), SetEdit::Remove(Value::from("x"))])
            .unwrap();
        assert!(!set.contains(&vs, &Value::from("x")).unwrap());
        assert!(set.contains(&vs, &Value::from("z")).unwrap());
        let members: Vec<Value> = set.iter(&vs).unwrap().map(|m| m.unwrap()).collect();
        assert_eq!(members, vec![Value::from("y"), Value::from("z")]);
    }

    #[test]
    fn test_list() {
        let vs = value_store();
        let list = List::from_values(&vs, (0..1000u64).map(Value::from)).unwrap();
        assert!(list.sequence().is_chunked());
        assert_eq!(list.get(&vs, 999).unwrap(), Some(Value::from(999u64)));
        assert_eq!(list.get(&vs, 1000).unwrap(), None);

        let edited = list
            .edit(
                &vs,
                vec![ListEdit::set(0, Value::from("first")), ListEdit::remove(10, 990)],
            )
            .unwrap();
        let values: Vec<Value> = edited.iter(&vs).unwrap().map(|v| v.unwrap()).collect();
        let mut expected = vec![Value::from("first")];
        expected.extend((1..10u64).map(Value::from));
        assert_eq!(values, expected);
        assert_eq!(edited, List::from_values(&vs, expected).unwrap());

        let appended = edited.append(&vs, vec![Value::from(true)]).unwrap();
        assert_eq!(appended.len(), 11);
        assert_eq!(appended.get(&vs, 10).unwrap(), Some(Value::from(true)));
    }

    #[test]
    fn test_list_edit_out_of_range() {
        let vs = value_store();
        let list = List::from_values(&vs, vec![Value::from(1i64)]).unwrap();
        assert!(matches!(
            list.edit(&vs, vec![ListEdit::remove(0, 2)]),
            Err(Error::IndexOutOfRange { index: 2, len: 1 })
        ));
    }

    #[test]
    fn test_collection_edits_kind_check() {
        let vs = value_store();
        let list = Value::List(List::empty());
        assert!(matches!(
            CollectionEdits::Map(Vec::new()).apply(&vs, &list),
            Err(Error::TypeMismatch {
                expected: Kind::Map,
                found: Kind::List
            })
        ));
    }
}
