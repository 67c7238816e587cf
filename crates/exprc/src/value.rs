use std::fmt;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::routine::BoundRoutine;
use crate::shared::{Shared, SharedCell};
use crate::symbols::TypeId;
use crate::types::Ty;

/// A runtime value flowing through the operand stack, arguments and locals.
///
/// Aggregates are shared handles, so assignment and capture alias the same
/// storage, and compiled routines can hand them across threads.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(SmolStr),
    Array(Shared<SharedCell<ArrayData>>),
    Dict(Shared<SharedCell<DictData>>),
    Obj(Shared<SharedCell<Object>>),
    Routine(Shared<BoundRoutine>),
    /// A location produced by by-reference evaluation of an assignable node.
    Ref(Place),
}

/// A rectangular array, multi-dimensional arrays stored flattened row-major.
#[derive(Debug, Clone)]
pub struct ArrayData {
    pub elem: Ty,
    pub dims: SmallVec<[u32; 2]>,
    pub items: Vec<Value>,
}

impl ArrayData {
    pub fn with_dims(elem: Ty, dims: SmallVec<[u32; 2]>) -> Self {
        let len = dims.iter().map(|d| *d as usize).product();
        let items = vec![elem.default_value(); len];
        ArrayData { elem, dims, items }
    }

    pub fn from_items(elem: Ty, items: Vec<Value>) -> Self {
        let dims = smallvec::smallvec![items.len() as u32];
        ArrayData { elem, dims, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Row-major flattening of one index per dimension, `None` when any index
    /// falls outside its dimension.
    pub fn flatten(&self, indexes: &[i32]) -> Option<usize> {
        if indexes.len() != self.dims.len() {
            return None;
        }
        let mut flat = 0usize;
        for (index, dim) in indexes.iter().zip(self.dims.iter()) {
            if *index < 0 || *index as u32 >= *dim {
                return None;
            }
            flat = flat * (*dim as usize) + *index as usize;
        }
        Some(flat)
    }
}

/// String-keyed indexer collection.
pub type DictData = FxHashMap<SmolStr, Value>;

/// An instance of a registered record type. Field order matches the layout
/// registered in [`crate::symbols::Symbols`].
#[derive(Debug, Clone)]
pub struct Object {
    pub ty: TypeId,
    pub fields: Vec<Value>,
}

/// A storage location. By-reference result shapes evaluate an assignable
/// node to one of these instead of to its value; `LoadRef`/`StoreRef` then
/// read or write through it.
#[derive(Debug, Clone)]
pub enum Place {
    Arg(u16),
    Local(u16),
    Field(Shared<SharedCell<Object>>, u16),
    Static(u32),
    Elem(Shared<SharedCell<ArrayData>>, u32),
    Entry(Shared<SharedCell<DictData>>, SmolStr),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Obj(_) => "object",
            Value::Routine(_) => "routine",
            Value::Ref(_) => "ref",
        }
    }
}

impl fmt::Display for Value {
    /// Scalars print as literals, strings quoted, aggregates by kind.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}i64"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            other => write!(f, "<{}>", other.kind_name()),
        }
    }
}

impl PartialEq for Value {
    /// Structural for scalars and strings, identity for aggregates.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Shared::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Shared::ptr_eq(a, b),
            (Value::Obj(a), Value::Obj(b)) => Shared::ptr_eq(a, b),
            (Value::Routine(a), Value::Routine(b)) => Shared::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(SmolStr::new(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[2, 3], &[0, 0], Some(0))]
    #[case(&[2, 3], &[1, 2], Some(5))]
    #[case(&[2, 3], &[0, 2], Some(2))]
    #[case(&[2, 3], &[2, 0], None)]
    #[case(&[2, 3], &[0, 3], None)]
    #[case(&[2, 3], &[-1, 0], None)]
    #[case(&[2, 3], &[0], None)]
    fn test_flatten(#[case] dims: &[u32], #[case] indexes: &[i32], #[case] expected: Option<usize>) {
        let array = ArrayData::with_dims(Ty::I32, dims.iter().copied().collect());
        assert_eq!(array.flatten(indexes), expected);
    }

    #[rstest]
    #[case(Value::Null, "null")]
    #[case(Value::Bool(true), "true")]
    #[case(Value::I32(-7), "-7")]
    #[case(Value::I64(7), "7i64")]
    #[case(Value::F64(1.5), "1.5")]
    #[case(Value::from("hi"), "\"hi\"")]
    fn test_display(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(value.to_string(), expected);
    }

    #[test]
    fn test_aggregate_equality_is_identity() {
        let a = crate::shared::shared_cell(ArrayData::from_items(Ty::I32, vec![Value::I32(1)]));
        let b = crate::shared::shared_cell(ArrayData::from_items(Ty::I32, vec![Value::I32(1)]));
        assert_eq!(Value::Array(a.clone()), Value::Array(a.clone()));
        assert_ne!(Value::Array(a), Value::Array(b));
    }
}
