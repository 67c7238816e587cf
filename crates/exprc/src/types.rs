use std::fmt;

use crate::symbols::{SigId, TypeId};
use crate::value::Value;

/// Resolved static type of a tree node.
///
/// Every node carries one of these; the emitter trusts them and never
/// re-infers. `Nullable` wraps value kinds only, reference kinds
/// (`Str`, `Array`, `Object`, `Func`, `Dict`) admit null as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    Unit,
    Bool,
    I32,
    I64,
    F64,
    Str,
    Nullable(Box<Ty>),
    Array { elem: Box<Ty>, rank: u8 },
    /// String-keyed indexer collection.
    Dict(Box<Ty>),
    Object(TypeId),
    Func(SigId),
}

impl Ty {
    pub fn nullable(inner: Ty) -> Ty {
        Ty::Nullable(Box::new(inner))
    }

    pub fn array(elem: Ty) -> Ty {
        Ty::Array {
            elem: Box::new(elem),
            rank: 1,
        }
    }

    pub fn array_of_rank(elem: Ty, rank: u8) -> Ty {
        Ty::Array {
            elem: Box::new(elem),
            rank,
        }
    }

    pub fn dict(value: Ty) -> Ty {
        Ty::Dict(Box::new(value))
    }

    /// Value kinds have a non-null default and need `Nullable` to admit null.
    pub fn is_value_kind(&self) -> bool {
        matches!(self, Ty::Unit | Ty::Bool | Ty::I32 | Ty::I64 | Ty::F64)
    }

    /// Whether a value of this type may hold null.
    pub fn is_nullable(&self) -> bool {
        !self.is_value_kind()
    }

    /// The type with nullability stripped: `i32?` -> `i32`, others unchanged.
    pub fn unlifted(&self) -> &Ty {
        match self {
            Ty::Nullable(inner) => inner,
            other => other,
        }
    }

    /// The nullable counterpart of this type. Reference kinds already admit
    /// null and are returned unchanged.
    pub fn lifted(self) -> Ty {
        if self.is_value_kind() && !matches!(self, Ty::Unit) {
            Ty::nullable(self)
        } else {
            self
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::I32 | Ty::I64 | Ty::F64)
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, Ty::I32 | Ty::I64)
    }

    /// The value a routine returns when a guarded operation escapes, and the
    /// value of a `Default` node.
    pub fn default_value(&self) -> Value {
        match self {
            Ty::Unit => Value::Null,
            Ty::Bool => Value::Bool(false),
            Ty::I32 => Value::I32(0),
            Ty::I64 => Value::I64(0),
            Ty::F64 => Value::F64(0.0),
            Ty::Str
            | Ty::Nullable(_)
            | Ty::Array { .. }
            | Ty::Dict(_)
            | Ty::Object(_)
            | Ty::Func(_) => Value::Null,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Unit => write!(f, "unit"),
            Ty::Bool => write!(f, "bool"),
            Ty::I32 => write!(f, "i32"),
            Ty::I64 => write!(f, "i64"),
            Ty::F64 => write!(f, "f64"),
            Ty::Str => write!(f, "str"),
            Ty::Nullable(inner) => write!(f, "{inner}?"),
            Ty::Array { elem, rank: 1 } => write!(f, "[{elem}]"),
            Ty::Array { elem, rank } => write!(f, "[{elem}; rank {rank}]"),
            Ty::Dict(value) => write!(f, "{{str: {value}}}"),
            Ty::Object(id) => write!(f, "object#{id}"),
            Ty::Func(id) => write!(f, "fn#{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Ty::I32, false)]
    #[case(Ty::nullable(Ty::I32), true)]
    #[case(Ty::Str, true)]
    #[case(Ty::array(Ty::I32), true)]
    #[case(Ty::Bool, false)]
    fn test_is_nullable(#[case] ty: Ty, #[case] expected: bool) {
        assert_eq!(ty.is_nullable(), expected);
    }

    #[rstest]
    #[case(Ty::I32, Value::I32(0))]
    #[case(Ty::Bool, Value::Bool(false))]
    #[case(Ty::nullable(Ty::I64), Value::Null)]
    #[case(Ty::Str, Value::Null)]
    fn test_default_value(#[case] ty: Ty, #[case] expected: Value) {
        assert_eq!(ty.default_value(), expected);
    }

    #[test]
    fn test_lift_round_trip() {
        let lifted = Ty::I32.lifted();
        assert_eq!(lifted, Ty::nullable(Ty::I32));
        assert_eq!(lifted.unlifted(), &Ty::I32);
        assert_eq!(Ty::Str.lifted(), Ty::Str);
    }
}
