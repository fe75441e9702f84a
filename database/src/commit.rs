//! Commit values: the unit of dataset history.
//!
//! A commit is a struct named `Commit` with exactly the fields
//! `meta: Struct`, `parents: Set<Ref<Commit>>` and `value: T`. Its type is
//! cycle-aware (see [`noms_primitives::types::make_commit_type`]): parent
//! refs of a descendant commit stay assignable to the ancestor's parent set.

use crate::Error;
use noms_primitives::types::{self, TypeDesc, TypeRef};
use noms_primitives::value::{Ref, Set, Struct, Value};

pub const COMMIT_NAME: &str = "Commit";
pub const META_FIELD: &str = "meta";
pub const PARENTS_FIELD: &str = "parents";
pub const VALUE_FIELD: &str = "value";

/// Builds the commit struct for `value` on top of `parents` and the
/// commit's cycle-aware type.
pub fn new_commit(
    value: Value,
    parents: Vec<Ref>,
    meta: Struct,
) -> Result<(Struct, TypeRef), Error> {
    let mut parent_value_types = Vec::with_capacity(parents.len());
    let mut parent_meta_types = Vec::with_capacity(parents.len());
    for parent in &parents {
        let (value_type, meta_type) = commit_field_types(parent.target_type())?;
        parent_value_types.push(value_type);
        parent_meta_types.push(meta_type);
    }
    let commit_type = types::make_commit_type(
        value.type_of(),
        Value::Struct(meta.clone()).type_of(),
        &parent_value_types,
        &parent_meta_types,
    );
    let commit = Struct::new(
        COMMIT_NAME,
        vec![
            (META_FIELD.to_string(), Value::Struct(meta)),
            (
                PARENTS_FIELD.to_string(),
                Value::Set(Set::new(parents.into_iter().map(Value::Ref).collect())),
            ),
            (VALUE_FIELD.to_string(), value),
        ],
    );
    Ok((commit, commit_type))
}

/// The `value` and `meta` types of a commit type.
fn commit_field_types(commit_type: TypeRef) -> Result<(TypeRef, TypeRef), Error> {
    let TypeDesc::Struct { fields, .. } = commit_type.desc() else {
        return Err(Error::TypeMismatch(format!("parent target is a {:?}", commit_type.kind())));
    };
    let field = |name: &str| {
        fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.type_ref)
            .ok_or_else(|| Error::TypeMismatch(format!("commit type lacks field {name:?}")))
    };
    Ok((field(VALUE_FIELD)?, field(META_FIELD)?))
}

/// Checks that a decoded value is a legal commit and returns it as a struct.
pub fn as_commit(v: Value) -> Result<Struct, Error> {
    let t = v.type_of();
    if !types::is_commit_type(t) {
        return Err(Error::TypeMismatch(format!("value of type {:?}", t.kind())));
    }
    match v {
        Value::Struct(s) => Ok(s),
        // is_commit_type only accepts structs.
        _ => Err(Error::TypeMismatch("not a struct".to_string())),
    }
}

/// The parent refs of a commit struct.
pub fn parents(commit: &Struct) -> Vec<Ref> {
    match commit.get(PARENTS_FIELD) {
        Some(Value::Set(set)) => set
            .iter()
            .filter_map(|v| match v {
                Value::Ref(r) => Some(r.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
