use std::fmt;

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::error::Fault;
use crate::shared::{Shared, SharedCell};
use crate::types::Ty;
use crate::value::Value;

/// Handle of a registered record type.
pub type TypeId = u32;
/// Handle of a registered function signature, the payload of [`Ty::Func`].
pub type SigId = u32;
/// Handle of a field descriptor. Two nodes reference the same field exactly
/// when their ids are equal.
pub type FieldId = u32;
/// Handle of a registered host function.
pub type FuncId = u32;
/// Handle of a static field's storage slot.
pub type StaticId = u32;

/// A host function callable from compiled routines. Receives the receiver
/// (if any) followed by the arguments.
pub type HostFn = Shared<dyn Fn(&[Value]) -> Result<Value, Fault> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub owner: TypeId,
    pub name: SmolStr,
    pub ty: Ty,
    /// Position within the owner's field layout.
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticDef {
    pub name: SmolStr,
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeLayout {
    pub name: SmolStr,
    pub fields: Vec<FieldId>,
    /// Instances of exception types may be thrown and matched by catch
    /// handlers.
    pub exception: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnSig {
    pub params: Vec<Ty>,
    pub ret: Ty,
}

#[derive(Clone)]
pub struct FuncDef {
    pub name: SmolStr,
    pub sig: FnSig,
    pub body: HostFn,
}

impl fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncDef")
            .field("name", &self.name)
            .field("sig", &self.sig)
            .finish_non_exhaustive()
    }
}

/// The process-local symbol table trees are built against.
///
/// Record types, fields, statics and host functions are registered by
/// handle; descriptor equality is integer equality. Every table sits behind
/// a lock so registration (the compiler synthesizes closure and constants
/// records mid-compile) and lookup work through a shared reference, and
/// compiled routines can hold the table across threads.
#[derive(Debug, Default)]
pub struct Symbols {
    types: SharedCell<Vec<TypeLayout>>,
    fields: SharedCell<Vec<FieldDef>>,
    statics: SharedCell<Vec<StaticDef>>,
    static_values: SharedCell<Vec<Value>>,
    funcs: SharedCell<Vec<FuncDef>>,
    sigs: SharedCell<Vec<FnSig>>,
    type_names: SharedCell<FxHashMap<SmolStr, TypeId>>,
}

impl Symbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_record<S: Into<SmolStr>>(&self, name: S, fields: &[(&str, Ty)]) -> TypeId {
        self.register_type(name.into(), fields, false)
    }

    pub fn register_exception<S: Into<SmolStr>>(&self, name: S, fields: &[(&str, Ty)]) -> TypeId {
        self.register_type(name.into(), fields, true)
    }

    fn register_type(&self, name: SmolStr, fields: &[(&str, Ty)], exception: bool) -> TypeId {
        let mut types = self.types.write();
        let mut all_fields = self.fields.write();
        let ty = types.len() as TypeId;
        let mut field_ids = Vec::with_capacity(fields.len());
        for (index, (field_name, field_ty)) in fields.iter().enumerate() {
            let id = all_fields.len() as FieldId;
            all_fields.push(FieldDef {
                owner: ty,
                name: SmolStr::new(field_name),
                ty: field_ty.clone(),
                index: index as u16,
            });
            field_ids.push(id);
        }
        types.push(TypeLayout {
            name: name.clone(),
            fields: field_ids,
            exception,
        });
        self.type_names.write().insert(name, ty);
        ty
    }

    pub fn type_layout(&self, ty: TypeId) -> TypeLayout {
        self.types.read()[ty as usize].clone()
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.type_names.read().get(name).copied()
    }

    pub fn is_exception(&self, ty: TypeId) -> bool {
        self.types
            .read()
            .get(ty as usize)
            .map(|layout| layout.exception)
            .unwrap_or(false)
    }

    pub fn field(&self, ty: TypeId, name: &str) -> Option<FieldId> {
        let fields = self.fields.read();
        self.types.read()[ty as usize]
            .fields
            .iter()
            .copied()
            .find(|id| fields[*id as usize].name == name)
    }

    pub fn field_def(&self, field: FieldId) -> FieldDef {
        self.fields.read()[field as usize].clone()
    }

    pub fn field_count(&self, ty: TypeId) -> usize {
        self.types.read()[ty as usize].fields.len()
    }

    /// Default field values for a fresh instance, layout order.
    pub fn default_fields(&self, ty: TypeId) -> Vec<Value> {
        let fields = self.fields.read();
        self.types.read()[ty as usize]
            .fields
            .iter()
            .map(|id| fields[*id as usize].ty.default_value())
            .collect()
    }

    pub fn register_static<S: Into<SmolStr>>(&self, name: S, ty: Ty, initial: Value) -> StaticId {
        let mut statics = self.statics.write();
        let id = statics.len() as StaticId;
        statics.push(StaticDef {
            name: name.into(),
            ty,
        });
        self.static_values.write().push(initial);
        id
    }

    pub fn static_def(&self, id: StaticId) -> StaticDef {
        self.statics.read()[id as usize].clone()
    }

    pub fn load_static(&self, id: StaticId) -> Value {
        self.static_values.read()[id as usize].clone()
    }

    pub fn store_static(&self, id: StaticId, value: Value) {
        self.static_values.write()[id as usize] = value;
    }

    pub fn register_func<S, F>(&self, name: S, params: Vec<Ty>, ret: Ty, body: F) -> FuncId
    where
        S: Into<SmolStr>,
        F: Fn(&[Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        let mut funcs = self.funcs.write();
        let id = funcs.len() as FuncId;
        funcs.push(FuncDef {
            name: name.into(),
            sig: FnSig { params, ret },
            body: Shared::new(body),
        });
        id
    }

    pub fn func_def(&self, id: FuncId) -> FuncDef {
        self.funcs.read()[id as usize].clone()
    }

    pub fn register_sig(&self, params: Vec<Ty>, ret: Ty) -> SigId {
        let mut sigs = self.sigs.write();
        if let Some(existing) = sigs
            .iter()
            .position(|sig| sig.params == params && sig.ret == ret)
        {
            return existing as SigId;
        }
        let id = sigs.len() as SigId;
        sigs.push(FnSig { params, ret });
        id
    }

    pub fn sig(&self, id: SigId) -> FnSig {
        self.sigs.read()[id as usize].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn symbols_with_point() -> (Symbols, TypeId) {
        let symbols = Symbols::new();
        let point = symbols.register_record("Point", &[("x", Ty::I32), ("y", Ty::I32)]);
        (symbols, point)
    }

    #[rstest]
    #[case("x", true)]
    #[case("y", true)]
    #[case("z", false)]
    fn test_field_lookup(#[case] name: &str, #[case] found: bool) {
        let (symbols, point) = symbols_with_point();
        assert_eq!(symbols.field(point, name).is_some(), found);
    }

    #[test]
    fn test_field_descriptors() {
        let (symbols, point) = symbols_with_point();
        let y = symbols.field(point, "y").unwrap();
        let def = symbols.field_def(y);
        assert_eq!(def.owner, point);
        assert_eq!(def.index, 1);
        assert_eq!(def.ty, Ty::I32);
        assert_eq!(symbols.default_fields(point), vec![Value::I32(0); 2]);
    }

    #[test]
    fn test_statics_round_trip() {
        let symbols = Symbols::new();
        let counter = symbols.register_static("counter", Ty::I32, Value::I32(7));
        assert_eq!(symbols.load_static(counter), Value::I32(7));
        symbols.store_static(counter, Value::I32(8));
        assert_eq!(symbols.load_static(counter), Value::I32(8));
    }

    #[test]
    fn test_sig_interning() {
        let symbols = Symbols::new();
        let a = symbols.register_sig(vec![Ty::I32], Ty::I32);
        let b = symbols.register_sig(vec![Ty::I32], Ty::I32);
        let c = symbols.register_sig(vec![Ty::I64], Ty::I32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_exception_flag() {
        let symbols = Symbols::new();
        let err = symbols.register_exception("ParseError", &[("message", Ty::Str)]);
        let rec = symbols.register_record("Point", &[]);
        assert!(symbols.is_exception(err));
        assert!(!symbols.is_exception(rec));
    }
}
