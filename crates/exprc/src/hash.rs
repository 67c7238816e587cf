use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};

use crate::error::{CompileError, FaultKind};
use crate::tree::node::{BinOp, CatchFilter, GotoKind, NewArrayKind, UnOp};
use crate::tree::{ExprTree, LabelId, NodeId, NodeKind};
use crate::types::Ty;
use crate::value::Value;

/// Prime multiplier of the Horner fold.
const X: u32 = 1084996987;

/// 32-bit structural fingerprint of the subtree at `root`.
///
/// Non-strict mode alpha-renames parameters: each parameter is replaced by
/// its first-occurrence index within the parameters of the same type, with
/// scopes pushed at lambda and block boundaries, so `x => x + 1` and
/// `y => y + 1` agree. Strict mode hashes parameter names, so they differ.
pub fn fingerprint(tree: &ExprTree, root: NodeId, strict: bool) -> Result<u32, CompileError> {
    let codes = collect(tree, root, strict, false)?;
    Ok(fold32(&codes))
}

/// 128-bit collision-resistant fingerprint. Always non-strict; constants
/// are decomposed by value, and constants that cannot be decomposed
/// (floats, opaque objects) are rejected.
pub fn fingerprint_strong(tree: &ExprTree, root: NodeId) -> Result<u128, CompileError> {
    let codes = collect(tree, root, false, true)?;
    Ok(fold128(&codes))
}

fn fold32(codes: &[i32]) -> u32 {
    codes
        .iter()
        .fold(0u32, |acc, code| acc.wrapping_mul(X).wrapping_add(*code as u32))
}

fn fold128(codes: &[i32]) -> u128 {
    // Codes enter as unsigned 32-bit limbs, no sign extension.
    codes.iter().fold(0u128, |acc, code| {
        acc.wrapping_mul(X as u128)
            .wrapping_add(*code as u32 as u128)
    })
}

fn collect(
    tree: &ExprTree,
    root: NodeId,
    strict: bool,
    hard: bool,
) -> Result<Vec<i32>, CompileError> {
    let mut ctx = HashContext {
        strict,
        hard,
        codes: Vec::with_capacity(tree.len() * 4),
        params: FxHashMap::default(),
        labels: FxHashMap::default(),
    };
    ctx.hash_node(tree, Some(root))?;
    Ok(ctx.codes)
}

/// Code for one runtime value, shared with the switch dispatch tables so a
/// case key computed at emission matches the key computed from the scrutinee
/// at run time. Identity-hashes aggregates.
pub(crate) fn value_code(value: &Value) -> i32 {
    match value {
        Value::Null => 0,
        Value::Bool(b) => *b as i32,
        Value::I32(v) => *v,
        Value::I64(v) => (*v as u64 >> 32) as i32 ^ *v as i32,
        Value::F64(v) => {
            let bits = v.to_bits();
            (bits >> 32) as i32 ^ bits as i32
        }
        Value::Str(s) => {
            let mut hasher = FxHasher::default();
            s.as_str().hash(&mut hasher);
            hasher.finish() as i32
        }
        Value::Array(a) => std::sync::Arc::as_ptr(a) as usize as i32,
        Value::Dict(d) => std::sync::Arc::as_ptr(d) as usize as i32,
        Value::Obj(o) => std::sync::Arc::as_ptr(o) as usize as i32,
        Value::Routine(r) => std::sync::Arc::as_ptr(r) as usize as i32,
        Value::Ref(_) => 0,
    }
}

struct HashContext {
    strict: bool,
    hard: bool,
    codes: Vec<i32>,
    /// Per-type alpha-renaming scopes: type -> parameter -> index.
    params: FxHashMap<Ty, FxHashMap<NodeId, i32>>,
    labels: FxHashMap<LabelId, i32>,
}

impl HashContext {
    fn push(&mut self, code: i32) {
        self.codes.push(code);
    }

    fn hash_node(&mut self, tree: &ExprTree, node: Option<NodeId>) -> Result<(), CompileError> {
        let Some(id) = node else {
            self.push(0);
            return Ok(());
        };
        let node = tree.node(id);
        self.push(kind_code(&node.kind));
        self.hash_ty(&node.ty);
        match &node.kind {
            NodeKind::Constant(value) => self.hash_value(value)?,
            NodeKind::Default => {}
            NodeKind::Parameter { .. } => self.hash_parameter(tree, id),
            NodeKind::Binary { left, right, .. } => {
                self.hash_node(tree, Some(*left))?;
                self.hash_node(tree, Some(*right))?;
            }
            NodeKind::Unary { operand, .. } => self.hash_node(tree, Some(*operand))?,
            NodeKind::Member { target, field } => {
                self.push(*field as i32);
                self.hash_node(tree, Some(*target))?;
            }
            NodeKind::StaticMember { field } => {
                self.push(*field as i32);
                self.push(0);
            }
            NodeKind::Index { target, key } => {
                self.hash_node(tree, Some(*target))?;
                self.hash_node(tree, Some(*key))?;
            }
            NodeKind::ArrayIndex { target, indexes } => {
                self.hash_node(tree, Some(*target))?;
                for index in indexes {
                    self.hash_node(tree, Some(*index))?;
                }
            }
            NodeKind::Call { func, target, args } => {
                self.push(*func as i32);
                self.hash_node(tree, *target)?;
                for arg in args {
                    self.hash_node(tree, Some(*arg))?;
                }
            }
            NodeKind::Invoke { target, args } => {
                self.hash_node(tree, Some(*target))?;
                for arg in args {
                    self.hash_node(tree, Some(*arg))?;
                }
            }
            NodeKind::New { ty, args } => {
                self.push(*ty as i32);
                for arg in args {
                    self.hash_node(tree, Some(*arg))?;
                }
            }
            NodeKind::NewArray { items, .. } => {
                for item in items {
                    self.hash_node(tree, Some(*item))?;
                }
            }
            NodeKind::Conditional {
                test,
                then,
                otherwise,
            } => {
                self.hash_node(tree, Some(*test))?;
                self.hash_node(tree, Some(*then))?;
                self.hash_node(tree, Some(*otherwise))?;
            }
            NodeKind::Block { vars, body } => {
                if self.strict {
                    for var in vars {
                        self.hash_parameter(tree, *var);
                    }
                } else {
                    for var in vars {
                        self.bind_param(tree, *var);
                    }
                }
                for expr in body {
                    self.hash_node(tree, Some(*expr))?;
                }
                if !self.strict {
                    for var in vars {
                        self.unbind_param(tree, *var);
                    }
                }
            }
            NodeKind::Assign { target, value, .. } => {
                self.hash_node(tree, Some(*target))?;
                self.hash_node(tree, Some(*value))?;
            }
            NodeKind::Loop {
                body,
                break_label,
                continue_label,
            } => {
                self.hash_node(tree, Some(*body))?;
                self.hash_label_opt(*continue_label);
                self.hash_label_opt(*break_label);
            }
            NodeKind::Goto {
                kind,
                target,
                value,
            } => {
                self.push(goto_code(*kind));
                self.hash_label(*target);
                self.hash_node(tree, *value)?;
            }
            NodeKind::Label { label, default } => {
                self.hash_label(*label);
                self.hash_node(tree, *default)?;
            }
            NodeKind::Switch {
                value,
                cases,
                default,
            } => {
                for case in cases {
                    self.hash_node(tree, Some(case.body))?;
                    for test in &case.tests {
                        self.hash_node(tree, Some(*test))?;
                    }
                }
                self.hash_node(tree, *default)?;
                self.hash_node(tree, Some(*value))?;
            }
            NodeKind::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                self.hash_node(tree, Some(*body))?;
                self.hash_node(tree, *fault)?;
                self.hash_node(tree, *finally)?;
                for handler in handlers {
                    self.hash_node(tree, Some(handler.body))?;
                    self.hash_filter(&handler.filter);
                    match handler.var {
                        Some(var) => self.hash_parameter(tree, var),
                        None => self.push(0),
                    }
                }
            }
            NodeKind::Throw { value } => self.hash_node(tree, *value)?,
            NodeKind::Lambda { params, body, .. } => {
                if !self.strict {
                    for param in params {
                        self.bind_param(tree, *param);
                    }
                }
                self.hash_node(tree, Some(*body))?;
                if !self.strict {
                    for param in params {
                        self.unbind_param(tree, *param);
                    }
                }
            }
            NodeKind::MemberInit { new, bindings } => {
                self.hash_node(tree, Some(*new))?;
                if self.strict {
                    for (field, value) in bindings {
                        self.push(*field as i32);
                        self.hash_node(tree, Some(*value))?;
                    }
                } else {
                    // Field descriptors are order-normalized so binding order
                    // does not change the fingerprint.
                    let mut sorted = bindings.clone();
                    sorted.sort_by_key(|(field, _)| *field);
                    for (field, value) in &sorted {
                        self.push(*field as i32);
                        self.hash_node(tree, Some(*value))?;
                    }
                }
            }
            NodeKind::ListInit { new, items } => {
                self.hash_node(tree, Some(*new))?;
                for item in items {
                    self.hash_node(tree, Some(*item))?;
                }
            }
            NodeKind::DebugInfo { .. } | NodeKind::RuntimeVariables { .. } => {
                return Err(CompileError::NotSupportedNodeKind(node.kind.name()));
            }
        }
        Ok(())
    }

    fn hash_parameter(&mut self, tree: &ExprTree, id: NodeId) {
        let node = tree.node(id);
        self.hash_ty(&node.ty);
        if self.strict {
            let NodeKind::Parameter { name } = &node.kind else {
                return;
            };
            let mut hasher = FxHasher::default();
            name.as_str().hash(&mut hasher);
            self.push(hasher.finish() as i32);
        } else {
            let ty = node.ty.clone();
            let scope = self.params.entry(ty).or_default();
            let next = scope.len() as i32;
            let index = *scope.entry(id).or_insert(next);
            self.push(index);
        }
    }

    fn bind_param(&mut self, tree: &ExprTree, id: NodeId) {
        let ty = tree.ty(id).clone();
        let scope = self.params.entry(ty).or_default();
        let index = scope.len() as i32;
        scope.insert(id, index);
    }

    fn unbind_param(&mut self, tree: &ExprTree, id: NodeId) {
        if let Some(scope) = self.params.get_mut(tree.ty(id)) {
            scope.remove(&id);
        }
    }

    fn hash_label(&mut self, label: LabelId) {
        let next = self.labels.len() as i32;
        let index = *self.labels.entry(label).or_insert(next);
        self.push(index);
    }

    fn hash_label_opt(&mut self, label: Option<LabelId>) {
        match label {
            Some(label) => self.hash_label(label),
            None => self.push(0),
        }
    }

    fn hash_filter(&mut self, filter: &CatchFilter) {
        match filter {
            CatchFilter::Any => self.push(0),
            CatchFilter::Type(ty) => {
                self.push(1);
                self.push(*ty as i32);
            }
            CatchFilter::Fault(kind) => {
                self.push(2);
                self.push(fault_code(*kind));
            }
        }
    }

    fn hash_ty(&mut self, ty: &Ty) {
        match ty {
            Ty::Unit => self.push(0),
            Ty::Bool => self.push(1),
            Ty::I32 => self.push(2),
            Ty::I64 => self.push(3),
            Ty::F64 => self.push(4),
            Ty::Str => self.push(5),
            Ty::Nullable(inner) => {
                self.push(6);
                self.hash_ty(inner);
            }
            Ty::Array { elem, rank } => {
                self.push(7);
                self.push(*rank as i32);
                self.hash_ty(elem);
            }
            Ty::Dict(value) => {
                self.push(8);
                self.hash_ty(value);
            }
            Ty::Object(id) => {
                self.push(9);
                self.push(*id as i32);
            }
            Ty::Func(id) => {
                self.push(10);
                self.push(*id as i32);
            }
        }
    }

    fn hash_value(&mut self, value: &Value) -> Result<(), CompileError> {
        if !self.hard {
            self.push(value_code(value));
            return Ok(());
        }
        match value {
            Value::Null => self.push(0),
            Value::Bool(b) => self.push(*b as i32),
            Value::I32(v) => self.push(*v),
            Value::I64(v) => {
                self.push((*v as u64 >> 32) as i32);
                self.push(*v as i32);
            }
            Value::Str(s) => {
                // UTF-16 code units packed in pairs, trailing unit padded.
                let units = s.as_str().encode_utf16().collect::<Vec<_>>();
                for pair in units.chunks(2) {
                    let high = pair[0] as i32;
                    let low = pair.get(1).copied().unwrap_or(0) as i32;
                    self.push((high << 16) + low);
                }
            }
            other => return Err(CompileError::UnhashableConstant(other.kind_name())),
        }
        Ok(())
    }
}

fn kind_code(kind: &NodeKind) -> i32 {
    match kind {
        NodeKind::Constant(_) => 1,
        NodeKind::Default => 2,
        NodeKind::Parameter { .. } => 3,
        NodeKind::Binary { op, .. } => 10 + bin_code(*op),
        NodeKind::Unary { op, .. } => 40 + un_code(*op),
        NodeKind::Member { .. } => 50,
        NodeKind::StaticMember { .. } => 51,
        NodeKind::Index { .. } => 52,
        NodeKind::ArrayIndex { .. } => 53,
        NodeKind::Call { .. } => 54,
        NodeKind::Invoke { .. } => 55,
        NodeKind::New { .. } => 56,
        NodeKind::NewArray {
            kind: NewArrayKind::Bounds,
            ..
        } => 57,
        NodeKind::NewArray {
            kind: NewArrayKind::Init,
            ..
        } => 58,
        NodeKind::Conditional { .. } => 59,
        NodeKind::Block { .. } => 60,
        NodeKind::Assign { op: None, .. } => 61,
        NodeKind::Assign { op: Some(op), .. } => 62 + bin_code(*op),
        NodeKind::Loop { .. } => 90,
        NodeKind::Goto { .. } => 91,
        NodeKind::Label { .. } => 92,
        NodeKind::Switch { .. } => 93,
        NodeKind::Try { .. } => 94,
        NodeKind::Throw { .. } => 95,
        NodeKind::Lambda { .. } => 96,
        NodeKind::MemberInit { .. } => 97,
        NodeKind::ListInit { .. } => 98,
        NodeKind::DebugInfo { .. } => 99,
        NodeKind::RuntimeVariables { .. } => 100,
    }
}

fn bin_code(op: BinOp) -> i32 {
    match op {
        BinOp::Add => 0,
        BinOp::AddChecked => 1,
        BinOp::Sub => 2,
        BinOp::SubChecked => 3,
        BinOp::Mul => 4,
        BinOp::MulChecked => 5,
        BinOp::Div => 6,
        BinOp::Rem => 7,
        BinOp::And => 8,
        BinOp::Or => 9,
        BinOp::Xor => 10,
        BinOp::Shl => 11,
        BinOp::Shr => 12,
        BinOp::Lt => 13,
        BinOp::Le => 14,
        BinOp::Gt => 15,
        BinOp::Ge => 16,
        BinOp::Eq => 17,
        BinOp::Ne => 18,
        BinOp::AndAlso => 19,
        BinOp::OrElse => 20,
        BinOp::Coalesce => 21,
    }
}

fn un_code(op: UnOp) -> i32 {
    match op {
        UnOp::Negate => 0,
        UnOp::NegateChecked => 1,
        UnOp::Not => 2,
        UnOp::BitNot => 3,
        UnOp::UnaryPlus => 4,
        UnOp::Convert => 5,
        UnOp::ConvertChecked => 6,
        UnOp::ArrayLength => 7,
        UnOp::HasValue => 8,
        UnOp::GetValue => 9,
    }
}

fn goto_code(kind: GotoKind) -> i32 {
    match kind {
        GotoKind::Goto => 0,
        GotoKind::Return => 1,
        GotoKind::Break => 2,
        GotoKind::Continue => 3,
    }
}

fn fault_code(kind: FaultKind) -> i32 {
    match kind {
        FaultKind::NullReference => 0,
        FaultKind::IndexOutOfBounds => 1,
        FaultKind::KeyNotFound => 2,
        FaultKind::Overflow => 3,
        FaultKind::DivisionByZero => 4,
        FaultKind::InvalidConversion => 5,
        FaultKind::CallDepthExceeded => 6,
        FaultKind::Arity => 7,
        FaultKind::Host => 8,
        FaultKind::Uncaught => 9,
    }
}
