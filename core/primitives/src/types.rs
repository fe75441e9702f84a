//! Structural types for noms values.
//!
//! Types are interned: equal structures share a single `TypeRef` handle into
//! a process-global arena, so type equality is handle equality and recursive
//! structs (via the `Cycle` back-edge kind) serialize without a union-find.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// The kinds a noms type can have.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Kind {
    Bool,
    Number,
    String,
    Blob,
    Value,
    List,
    Map,
    Ref,
    Set,
    Struct,
    Type,
    Cycle,
    Union,
}

/// One field of a struct type. Optional fields may be absent from a value of
/// the struct's type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StructField {
    pub name: String,
    pub type_ref: TypeRef,
    pub optional: bool,
}

/// The shape of one interned type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeDesc {
    /// Bool, Number, String, Blob, Value and Type carry no element types.
    Primitive(Kind),
    /// List/Set/Ref carry one element type, Map two, Union zero or more.
    Compound(Kind, Vec<TypeRef>),
    /// Name plus name-ordered field list.
    Struct { name: String, fields: Vec<StructField> },
    /// Back-edge to the n-th enclosing struct; level 0 is the innermost.
    Cycle(u32),
}

impl TypeDesc {
    pub fn kind(&self) -> Kind {
        match self {
            TypeDesc::Primitive(k) | TypeDesc::Compound(k, _) => *k,
            TypeDesc::Struct { .. } => Kind::Struct,
            TypeDesc::Cycle(_) => Kind::Cycle,
        }
    }
}

/// Handle to an interned type. Copyable; equality is structural identity.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TypeRef(u32);

impl TypeRef {
    pub fn desc(self) -> TypeDesc {
        CACHE.read().arena[self.0 as usize].clone()
    }

    pub fn kind(self) -> Kind {
        CACHE.read().arena[self.0 as usize].kind()
    }
}

struct TypeCache {
    arena: Vec<TypeDesc>,
    interned: HashMap<TypeDesc, TypeRef>,
}

static CACHE: Lazy<RwLock<TypeCache>> =
    Lazy::new(|| RwLock::new(TypeCache { arena: Vec::new(), interned: HashMap::new() }));

fn intern(desc: TypeDesc) -> TypeRef {
    if let Some(&t) = CACHE.read().interned.get(&desc) {
        return t;
    }
    let mut cache = CACHE.write();
    if let Some(&t) = cache.interned.get(&desc) {
        return t;
    }
    let t = TypeRef(cache.arena.len() as u32);
    cache.arena.push(desc.clone());
    cache.interned.insert(desc, t);
    t
}

pub fn bool_type() -> TypeRef {
    intern(TypeDesc::Primitive(Kind::Bool))
}

pub fn number_type() -> TypeRef {
    intern(TypeDesc::Primitive(Kind::Number))
}

pub fn string_type() -> TypeRef {
    intern(TypeDesc::Primitive(Kind::String))
}

pub fn blob_type() -> TypeRef {
    intern(TypeDesc::Primitive(Kind::Blob))
}

/// The top type: every value is assignable to it.
pub fn value_type() -> TypeRef {
    intern(TypeDesc::Primitive(Kind::Value))
}

pub fn type_type() -> TypeRef {
    intern(TypeDesc::Primitive(Kind::Type))
}

pub fn list_type(elem: TypeRef) -> TypeRef {
    intern(TypeDesc::Compound(Kind::List, vec![elem]))
}

pub fn set_type(elem: TypeRef) -> TypeRef {
    intern(TypeDesc::Compound(Kind::Set, vec![elem]))
}

pub fn ref_type(target: TypeRef) -> TypeRef {
    intern(TypeDesc::Compound(Kind::Ref, vec![target]))
}

pub fn map_type(key: TypeRef, value: TypeRef) -> TypeRef {
    intern(TypeDesc::Compound(Kind::Map, vec![key, value]))
}

pub fn cycle_type(level: u32) -> TypeRef {
    intern(TypeDesc::Cycle(level))
}

/// Builds a union. Nested unions are flattened, duplicates dropped, and the
/// members put in canonical (encoded-bytes) order so that equal unions intern
/// to the same handle regardless of construction order. A single-member
/// union is that member; the empty union is the uninhabited bottom type.
pub fn union_type(members: &[TypeRef]) -> TypeRef {
    let mut flat = Vec::new();
    flatten_union(members, &mut flat);
    flat.sort_by_cached_key(|&t| crate::codec::encode_type(t));
    flat.dedup();
    if flat.len() == 1 {
        return flat[0];
    }
    intern(TypeDesc::Compound(Kind::Union, flat))
}

fn flatten_union(members: &[TypeRef], out: &mut Vec<TypeRef>) {
    for &m in members {
        match m.desc() {
            TypeDesc::Compound(Kind::Union, inner) => flatten_union(&inner, out),
            _ => out.push(m),
        }
    }
}

/// Builds a struct type. Fields are stored sorted by name.
pub fn struct_type(name: &str, mut fields: Vec<StructField>) -> TypeRef {
    fields.sort_by(|a, b| a.name.cmp(&b.name));
    intern(TypeDesc::Struct { name: name.to_string(), fields })
}

pub fn field(name: &str, type_ref: TypeRef, optional: bool) -> StructField {
    StructField { name: name.to_string(), type_ref, optional }
}

/// The commit type every concrete commit type must be assignable to:
/// `Struct Commit { meta: Struct {}, parents: Set<Ref<Cycle<0>>>, value: Value }`.
pub fn canonical_commit_type() -> TypeRef {
    struct_type(
        "Commit",
        vec![
            field("meta", struct_type("", vec![]), false),
            field("parents", set_type(ref_type(cycle_type(0))), false),
            field("value", value_type(), false),
        ],
    )
}

/// Constructs the type of a commit with the given value and meta types whose
/// direct parents have the given value and meta types.
///
/// When every parent's value and meta type already matches the commit's own,
/// the parent set is self-referential (`Set<Ref<Cycle<0>>>`). Otherwise the
/// parent element is a widened commit struct carrying the unions, so that
/// any descendant commit remains assignable to its ancestor's parent set.
pub fn make_commit_type(
    value_type_: TypeRef,
    meta_type: TypeRef,
    parent_value_types: &[TypeRef],
    parent_meta_types: &[TypeRef],
) -> TypeRef {
    let mut value_members = parent_value_types.to_vec();
    value_members.push(value_type_);
    let value_union = union_type(&value_members);

    let mut meta_members = parent_meta_types.to_vec();
    meta_members.push(meta_type);
    let meta_union = union_type(&meta_members);

    let parents_elem = if value_union == value_type_ && meta_union == meta_type {
        cycle_type(0)
    } else {
        struct_type(
            "Commit",
            vec![
                field("meta", meta_union, false),
                field("parents", set_type(ref_type(cycle_type(0))), false),
                field("value", value_union, false),
            ],
        )
    };
    struct_type(
        "Commit",
        vec![
            field("meta", meta_type, false),
            field("parents", set_type(ref_type(parents_elem)), false),
            field("value", value_type_, false),
        ],
    )
}

/// True iff `t` may legally be the type of a commit.
pub fn is_commit_type(t: TypeRef) -> bool {
    is_subtype(canonical_commit_type(), t)
}

/// Structural subtype check: is a value of type `concrete` assignable where
/// `required` is expected?
///
/// Covariant in compound element types; structs compare field-by-field with
/// optionality-aware lookup; cycles compare by level, and a cycle meeting an
/// unrolled struct is resolved against its enclosing struct stack with a
/// coinductive in-progress set closing the recursion.
pub fn is_subtype(required: TypeRef, concrete: TypeRef) -> bool {
    let mut check = SubtypeCheck::default();
    check.run(required, concrete)
}

#[derive(Default)]
struct SubtypeCheck {
    /// Enclosing structs of the required / concrete trees, innermost last.
    required_stack: Vec<TypeRef>,
    concrete_stack: Vec<TypeRef>,
    /// Pairs currently assumed true while being checked.
    in_progress: HashSet<(TypeRef, TypeRef)>,
}

impl SubtypeCheck {
    fn run(&mut self, required: TypeRef, concrete: TypeRef) -> bool {
        if required == concrete {
            return true;
        }
        let req = required.desc();
        // Value is the top type.
        if matches!(req, TypeDesc::Primitive(Kind::Value)) {
            return true;
        }
        let conc = concrete.desc();

        // Resolve back-edges by position first: two cycles match iff their
        // levels match; otherwise compare through the enclosing struct.
        if let TypeDesc::Cycle(r_level) = req {
            if let TypeDesc::Cycle(c_level) = conc {
                return r_level == c_level;
            }
            let Some(resolved) = resolve_cycle(r_level, &self.required_stack) else {
                return false;
            };
            return self.run_guarded(resolved, concrete);
        }
        if let TypeDesc::Cycle(c_level) = conc {
            let Some(resolved) = resolve_cycle(c_level, &self.concrete_stack) else {
                return false;
            };
            return self.run_guarded(required, resolved);
        }

        // A union on the concrete side must be wholly assignable; a union on
        // the required side must have some arm accepting the concrete type.
        if let TypeDesc::Compound(Kind::Union, arms) = &conc {
            return arms.iter().all(|&arm| self.run(required, arm));
        }
        if let TypeDesc::Compound(Kind::Union, arms) = &req {
            return arms.iter().any(|&arm| self.run(arm, concrete));
        }

        match (&req, &conc) {
            (TypeDesc::Primitive(r), TypeDesc::Primitive(c)) => r == c,
            (TypeDesc::Compound(rk, relems), TypeDesc::Compound(ck, celems)) => {
                rk == ck
                    && relems.len() == celems.len()
                    && relems.iter().zip(celems).all(|(&r, &c)| self.run(r, c))
            }
            (
                TypeDesc::Struct { name: rname, fields: rfields },
                TypeDesc::Struct { name: cname, .. },
            ) => {
                if !rname.is_empty() && rname != cname {
                    return false;
                }
                self.required_stack.push(required);
                self.concrete_stack.push(concrete);
                let ok = rfields.iter().all(|rf| {
                    match lookup_field(&conc, &rf.name) {
                        Some(cf) => {
                            // A field the concrete type may omit satisfies
                            // only an optional requirement.
                            (!cf.optional || rf.optional) && self.run(rf.type_ref, cf.type_ref)
                        }
                        None => rf.optional,
                    }
                });
                self.required_stack.pop();
                self.concrete_stack.pop();
                ok
            }
            _ => false,
        }
    }

    fn run_guarded(&mut self, required: TypeRef, concrete: TypeRef) -> bool {
        if !self.in_progress.insert((required, concrete)) {
            return true;
        }
        let ok = self.run(required, concrete);
        self.in_progress.remove(&(required, concrete));
        ok
    }
}

fn resolve_cycle(level: u32, stack: &[TypeRef]) -> Option<TypeRef> {
    stack.iter().rev().nth(level as usize).copied()
}

fn lookup_field<'a>(desc: &'a TypeDesc, name: &str) -> Option<&'a StructField> {
    match desc {
        TypeDesc::Struct { fields, .. } => fields.iter().find(|f| f.name == name),
        _ => None,
    }
}
