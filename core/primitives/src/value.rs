//! The noms value model.
//!
//! A value is either a primitive (bool, number, string) or a compound
//! backed by shared, immutable storage. Every value has a content hash equal
//! to the hash of its encoded chunk; compounds memoize it on first access,
//! primitives encode on demand. Two values are equal iff their hashes are
//! equal, so equality and ordering below go through `Value::hash`.

use crate::codec;
use crate::hash::Hash;
use crate::types::{self, TypeRef};
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, OnceLock};

#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
    Blob(Blob),
    List(List),
    Set(Set),
    Map(Map),
    Ref(Ref),
    Struct(Struct),
    Type(TypeRef),
}

impl Value {
    /// The content hash: the hash of this value's encoded chunk.
    pub fn hash(&self) -> Hash {
        match self {
            Value::Blob(b) => b.hash(),
            Value::List(l) => l.hash(),
            Value::Set(s) => s.hash(),
            Value::Map(m) => m.hash(),
            Value::Struct(s) => s.hash(),
            // Primitives, refs and types are cheap to encode on demand.
            _ => Hash::of(&codec::encode_value(self)),
        }
    }

    /// The noms type of this value.
    pub fn type_of(&self) -> TypeRef {
        match self {
            Value::Bool(_) => types::bool_type(),
            Value::Number(_) => types::number_type(),
            Value::String(_) => types::string_type(),
            Value::Blob(_) => types::blob_type(),
            Value::List(l) => {
                types::list_type(types::union_type(&element_types(l.iter())))
            }
            Value::Set(s) => types::set_type(types::union_type(&element_types(s.iter()))),
            Value::Map(m) => {
                let keys = element_types(m.iter().map(|(k, _)| k));
                let values = element_types(m.iter().map(|(_, v)| v));
                types::map_type(types::union_type(&keys), types::union_type(&values))
            }
            Value::Ref(r) => types::ref_type(r.target_type()),
            Value::Struct(s) => types::struct_type(
                s.name(),
                s.iter()
                    .map(|(name, v)| types::field(name, v.type_of(), false))
                    .collect(),
            ),
            Value::Type(_) => types::type_type(),
        }
    }

    /// Hashes of the chunks reachable exactly one level below this value:
    /// the targets of refs contained in it, not crossing other refs.
    pub fn child_hashes(&self) -> Vec<Hash> {
        let mut out = Vec::new();
        self.walk_refs(&mut |r| out.push(r.target()));
        out
    }

    /// Height of a ref to this value: one more than the tallest ref it
    /// contains, or 1 for a leaf.
    pub fn ref_height(&self) -> u64 {
        let mut max = 0;
        self.walk_refs(&mut |r| max = max.max(r.height()));
        max + 1
    }

    fn walk_refs(&self, visit: &mut dyn FnMut(&Ref)) {
        match self {
            Value::Ref(r) => visit(r),
            Value::List(l) => l.iter().for_each(|v| v.walk_refs(visit)),
            Value::Set(s) => s.iter().for_each(|v| v.walk_refs(visit)),
            Value::Map(m) => m.iter().for_each(|(k, v)| {
                k.walk_refs(visit);
                v.walk_refs(visit);
            }),
            Value::Struct(s) => s.iter().for_each(|(_, v)| v.walk_refs(visit)),
            _ => {}
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(self.hash().as_bytes());
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Blob(b) => write!(f, "Blob({} bytes)", b.len()),
            Value::List(l) => f.debug_tuple("List").field(&l.0.values).finish(),
            Value::Set(s) => f.debug_tuple("Set").field(&s.0.values).finish(),
            Value::Map(m) => f.debug_tuple("Map").field(&m.0.entries).finish(),
            Value::Ref(r) => write!(f, "Ref({}, height {})", r.target(), r.height()),
            Value::Struct(s) => {
                f.debug_struct(&format!("Struct {}", s.name())).finish_non_exhaustive()
            }
            Value::Type(t) => write!(f, "Type({t:?})"),
        }
    }
}

fn element_types<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<TypeRef> {
    values.map(Value::type_of).collect()
}

/// Raw byte sequence value.
#[derive(Clone)]
pub struct Blob(Arc<BlobInner>);

struct BlobInner {
    bytes: Bytes,
    hash: OnceLock<Hash>,
}

impl Blob {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Blob(Arc::new(BlobInner { bytes: bytes.into(), hash: OnceLock::new() }))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }

    fn hash(&self) -> Hash {
        *self
            .0
            .hash
            .get_or_init(|| Hash::of(&codec::encode_value(&Value::Blob(self.clone()))))
    }
}

/// Ordered sequence of values.
#[derive(Clone)]
pub struct List(Arc<SeqInner>);

struct SeqInner {
    values: Vec<Value>,
    hash: OnceLock<Hash>,
}

impl List {
    pub fn new(values: Vec<Value>) -> Self {
        List(Arc::new(SeqInner { values, hash: OnceLock::new() }))
    }

    pub fn len(&self) -> usize {
        self.0.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values.is_empty()
    }

    pub fn get(&self, at: usize) -> Option<&Value> {
        self.0.values.get(at)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.values.iter()
    }

    fn hash(&self) -> Hash {
        *self
            .0
            .hash
            .get_or_init(|| Hash::of(&codec::encode_value(&Value::List(self.clone()))))
    }
}

/// Unordered collection of distinct values. Elements are held sorted by
/// content hash, which makes the encoding canonical.
#[derive(Clone)]
pub struct Set(Arc<SeqInner>);

impl Set {
    pub fn new(mut values: Vec<Value>) -> Self {
        values.sort_by_cached_key(Value::hash);
        values.dedup_by_key(|v| v.hash());
        Set(Arc::new(SeqInner { values, hash: OnceLock::new() }))
    }

    pub fn len(&self) -> usize {
        self.0.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values.is_empty()
    }

    pub fn contains(&self, v: &Value) -> bool {
        let h = v.hash();
        self.0.values.binary_search_by_key(&h, Value::hash).is_ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.values.iter()
    }

    fn hash(&self) -> Hash {
        *self
            .0
            .hash
            .get_or_init(|| Hash::of(&codec::encode_value(&Value::Set(self.clone()))))
    }
}

/// Keyed collection. Entries are held sorted by key hash; a duplicated key
/// keeps the last entry given.
#[derive(Clone)]
pub struct Map(Arc<MapInner>);

struct MapInner {
    entries: Vec<(Value, Value)>,
    hash: OnceLock<Hash>,
}

impl Map {
    pub fn new(mut entries: Vec<(Value, Value)>) -> Self {
        // Stable sort, then keep the last entry per key.
        entries.sort_by_cached_key(|(k, _)| k.hash());
        let mut deduped: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
        for entry in entries {
            let replace =
                deduped.last().is_some_and(|(last, _)| last.hash() == entry.0.hash());
            if replace {
                *deduped.last_mut().unwrap() = entry;
            } else {
                deduped.push(entry);
            }
        }
        Map(Arc::new(MapInner { entries: deduped, hash: OnceLock::new() }))
    }

    pub fn len(&self) -> usize {
        self.0.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        let h = key.hash();
        self.0
            .entries
            .binary_search_by_key(&h, |(k, _)| k.hash())
            .ok()
            .map(|at| &self.0.entries[at].1)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (Value, Value)> {
        self.0.entries.iter()
    }

    /// A copy of this map with `key` set to `value`.
    pub fn set(&self, key: Value, value: Value) -> Map {
        let mut entries = self.0.entries.clone();
        entries.push((key, value));
        Map::new(entries)
    }

    /// A copy of this map without `key`.
    pub fn remove(&self, key: &Value) -> Map {
        let h = key.hash();
        let entries =
            self.0.entries.iter().filter(|(k, _)| k.hash() != h).cloned().collect();
        Map::new(entries)
    }

    fn hash(&self) -> Hash {
        *self
            .0
            .hash
            .get_or_init(|| Hash::of(&codec::encode_value(&Value::Map(self.clone()))))
    }
}

/// A typed hash: the address of a chunk, the type of the value it decodes
/// to, and the height of the DAG beneath it (leaf = 1).
#[derive(Clone)]
pub struct Ref {
    target: Hash,
    target_type: TypeRef,
    height: u64,
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({}, height {})", self.target(), self.height())
    }
}

impl Ref {
    pub fn new(target: Hash, target_type: TypeRef, height: u64) -> Self {
        Ref { target, target_type, height }
    }

    pub fn target(&self) -> Hash {
        self.target
    }

    pub fn target_type(&self) -> TypeRef {
        self.target_type
    }

    pub fn height(&self) -> u64 {
        self.height
    }
}

/// Named record value with name-ordered fields.
#[derive(Clone)]
pub struct Struct(Arc<StructInner>);

struct StructInner {
    name: String,
    fields: Vec<(String, Value)>,
    hash: OnceLock<Hash>,
}

impl fmt::Debug for Struct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(&format!("Struct {}", self.name())).finish_non_exhaustive()
    }
}

impl Struct {
    pub fn new(name: &str, mut fields: Vec<(String, Value)>) -> Self {
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        fields.dedup_by(|a, b| a.0 == b.0);
        Struct(Arc::new(StructInner {
            name: name.to_string(),
            fields,
            hash: OnceLock::new(),
        }))
    }

    /// The empty, nameless struct; the default commit meta.
    pub fn empty() -> Self {
        Struct::new("", vec![])
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn len(&self) -> usize {
        self.0.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0
            .fields
            .binary_search_by(|(name, _)| name.as_str().cmp(field))
            .ok()
            .map(|at| &self.0.fields[at].1)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, Value)> {
        self.0.fields.iter()
    }

    fn hash(&self) -> Hash {
        *self
            .0
            .hash
            .get_or_init(|| Hash::of(&codec::encode_value(&Value::Struct(self.clone()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_encodings_mean_equal_hashes() {
        let a = Value::List(List::new(vec![Value::Number(1.0), Value::Bool(true)]));
        let b = Value::List(List::new(vec![Value::Number(1.0), Value::Bool(true)]));
        assert_eq!(codec::encode_value(&a), codec::encode_value(&b));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
        let c = Value::List(List::new(vec![Value::Bool(true), Value::Number(1.0)]));
        assert_ne!(a, c);
    }

    #[test]
    fn set_is_canonical() {
        let a = Value::Set(Set::new(vec![Value::Number(2.0), Value::Number(1.0)]));
        let b = Value::Set(Set::new(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(1.0),
        ]));
        assert_eq!(a, b);
        let Value::Set(s) = &a else { unreachable!() };
        assert_eq!(s.len(), 2);
        assert!(s.contains(&Value::Number(1.0)));
        assert!(!s.contains(&Value::Number(3.0)));
    }

    #[test]
    fn map_last_write_wins() {
        let m = Map::new(vec![
            (Value::String("a".into()), Value::Number(1.0)),
            (Value::String("a".into()), Value::Number(2.0)),
        ]);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&Value::String("a".into())), Some(&Value::Number(2.0)));
        let removed = m.remove(&Value::String("a".into()));
        assert!(removed.is_empty());
    }

    #[test]
    fn struct_field_lookup() {
        let s = Struct::new(
            "Point",
            vec![("y".to_string(), Value::Number(2.0)), ("x".to_string(), Value::Number(1.0))],
        );
        assert_eq!(s.get("x"), Some(&Value::Number(1.0)));
        assert_eq!(s.get("y"), Some(&Value::Number(2.0)));
        assert_eq!(s.get("z"), None);
        // Fields are name-ordered regardless of construction order.
        let names: Vec<_> = s.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["x", "y"]);
    }

    #[test]
    fn child_hashes_stop_at_refs() {
        let inner = Ref::new(Hash::of(b"inner"), types::value_type(), 2);
        let v = Value::Struct(Struct::new(
            "Wrapper",
            vec![
                ("direct".to_string(), Value::Ref(inner.clone())),
                (
                    "nested".to_string(),
                    Value::List(List::new(vec![Value::Ref(Ref::new(
                        Hash::of(b"deep"),
                        types::value_type(),
                        1,
                    ))])),
                ),
                ("plain".to_string(), Value::Number(5.0)),
            ],
        ));
        let mut children = v.child_hashes();
        children.sort();
        let mut expected = vec![Hash::of(b"inner"), Hash::of(b"deep")];
        expected.sort();
        assert_eq!(children, expected);
        assert_eq!(v.ref_height(), 3);
        assert_eq!(Value::Number(1.0).ref_height(), 1);
    }

    #[test]
    fn type_of_collections() {
        let l = Value::List(List::new(vec![Value::Number(1.0), Value::String("s".into())]));
        assert_eq!(
            l.type_of(),
            types::list_type(types::union_type(&[types::number_type(), types::string_type()]))
        );
        let empty = Value::List(List::new(vec![]));
        assert_eq!(empty.type_of(), types::list_type(types::union_type(&[])));
    }
}
