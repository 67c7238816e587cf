use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::symbols::{FieldId, FuncId, StaticId, Symbols, TypeId};
use crate::types::Ty;
use crate::value::Value;

use super::node::{
    BinOp, CatchHandler, GotoKind, LabelId, NewArrayKind, Node, NodeId, NodeKind, SwitchCase, UnOp,
};
use super::ExprTree;

/// Convenience constructor for typed trees.
///
/// Derives node types from operands and the symbol table so call sites stay
/// short. Construction is infallible for well-typed input; handing it an
/// ill-typed combination (say, invoking a non-lambda) panics, since that is
/// a bug in the caller, not a compilable tree.
pub struct TreeBuilder<'s> {
    tree: ExprTree,
    symbols: &'s Symbols,
    next_label: LabelId,
}

impl<'s> TreeBuilder<'s> {
    pub fn new(symbols: &'s Symbols) -> Self {
        Self {
            tree: ExprTree::new(),
            symbols,
            next_label: 0,
        }
    }

    pub fn finish(self) -> ExprTree {
        self.tree
    }

    pub fn tree(&self) -> &ExprTree {
        &self.tree
    }

    fn alloc(&mut self, kind: NodeKind, ty: Ty) -> NodeId {
        self.tree.alloc(Node { kind, ty })
    }

    pub fn fresh_label(&mut self) -> LabelId {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    // --- leaves ---

    pub fn constant(&mut self, value: Value, ty: Ty) -> NodeId {
        self.alloc(NodeKind::Constant(value), ty)
    }

    pub fn i32(&mut self, value: i32) -> NodeId {
        self.constant(Value::I32(value), Ty::I32)
    }

    pub fn i64(&mut self, value: i64) -> NodeId {
        self.constant(Value::I64(value), Ty::I64)
    }

    pub fn f64(&mut self, value: f64) -> NodeId {
        self.constant(Value::F64(value), Ty::F64)
    }

    pub fn bool(&mut self, value: bool) -> NodeId {
        self.constant(Value::Bool(value), Ty::Bool)
    }

    pub fn str(&mut self, value: &str) -> NodeId {
        self.constant(Value::from(value), Ty::Str)
    }

    pub fn null(&mut self, ty: Ty) -> NodeId {
        self.constant(Value::Null, ty)
    }

    pub fn default(&mut self, ty: Ty) -> NodeId {
        self.alloc(NodeKind::Default, ty)
    }

    /// A `Default` node of unit type, the canonical "no value here" node.
    pub fn empty(&mut self) -> NodeId {
        self.default(Ty::Unit)
    }

    pub fn param<S: Into<SmolStr>>(&mut self, name: S, ty: Ty) -> NodeId {
        self.alloc(NodeKind::Parameter { name: name.into() }, ty)
    }

    /// A block-scoped variable; same node shape as a parameter.
    pub fn var<S: Into<SmolStr>>(&mut self, name: S, ty: Ty) -> NodeId {
        self.param(name, ty)
    }

    // --- operators ---

    pub fn binary(&mut self, op: BinOp, left: NodeId, right: NodeId) -> NodeId {
        let ty = self.binary_ty(op, left, right);
        self.alloc(NodeKind::Binary { op, left, right }, ty)
    }

    fn binary_ty(&self, op: BinOp, left: NodeId, right: NodeId) -> Ty {
        let left_ty = self.tree.ty(left);
        let right_ty = self.tree.ty(right);
        let either_nullable = left_ty.is_nullable() || right_ty.is_nullable();
        match op {
            BinOp::Coalesce => {
                if right_ty.is_nullable() {
                    left_ty.clone()
                } else {
                    right_ty.clone()
                }
            }
            op if op.is_comparison() || op.is_short_circuit() => {
                if either_nullable {
                    Ty::nullable(Ty::Bool)
                } else {
                    Ty::Bool
                }
            }
            _ => {
                let base = left_ty.unlifted().clone();
                if either_nullable { Ty::nullable(base) } else { base }
            }
        }
    }

    pub fn unary(&mut self, op: UnOp, operand: NodeId) -> NodeId {
        let ty = match op {
            UnOp::ArrayLength => Ty::I32,
            UnOp::HasValue => Ty::Bool,
            UnOp::GetValue => self.tree.ty(operand).unlifted().clone(),
            UnOp::Not | UnOp::Negate | UnOp::NegateChecked | UnOp::BitNot | UnOp::UnaryPlus => {
                self.tree.ty(operand).clone()
            }
            UnOp::Convert | UnOp::ConvertChecked => {
                panic!("use TreeBuilder::convert for conversions")
            }
        };
        self.alloc(NodeKind::Unary { op, operand }, ty)
    }

    /// `x.HasValue`: present/absent test on a nullable value, plain `Bool`.
    pub fn has_value(&mut self, operand: NodeId) -> NodeId {
        self.unary(UnOp::HasValue, operand)
    }

    /// `x.Value`: unwrap a nullable value; null raises a null-reference
    /// fault (or escapes, under guarded compilation).
    pub fn value_of(&mut self, operand: NodeId) -> NodeId {
        self.unary(UnOp::GetValue, operand)
    }

    pub fn convert(&mut self, operand: NodeId, to: Ty) -> NodeId {
        self.alloc(
            NodeKind::Unary {
                op: UnOp::Convert,
                operand,
            },
            to,
        )
    }

    pub fn convert_checked(&mut self, operand: NodeId, to: Ty) -> NodeId {
        self.alloc(
            NodeKind::Unary {
                op: UnOp::ConvertChecked,
                operand,
            },
            to,
        )
    }

    // --- access ---

    pub fn member(&mut self, target: NodeId, field: FieldId) -> NodeId {
        let ty = self.symbols.field_def(field).ty.clone();
        self.alloc(NodeKind::Member { target, field }, ty)
    }

    pub fn static_member(&mut self, field: StaticId) -> NodeId {
        let ty = self.symbols.static_def(field).ty.clone();
        self.alloc(NodeKind::StaticMember { field }, ty)
    }

    pub fn index(&mut self, target: NodeId, key: NodeId) -> NodeId {
        let ty = match self.tree.ty(target).unlifted() {
            Ty::Dict(value) => (**value).clone(),
            other => panic!("index target must be a dict, got {other}"),
        };
        self.alloc(NodeKind::Index { target, key }, ty)
    }

    pub fn array_index(&mut self, target: NodeId, indexes: &[NodeId]) -> NodeId {
        let ty = match self.tree.ty(target).unlifted() {
            Ty::Array { elem, .. } => (**elem).clone(),
            other => panic!("array index target must be an array, got {other}"),
        };
        self.alloc(
            NodeKind::ArrayIndex {
                target,
                indexes: SmallVec::from_slice(indexes),
            },
            ty,
        )
    }

    // --- calls and construction ---

    pub fn call(&mut self, func: FuncId, target: Option<NodeId>, args: &[NodeId]) -> NodeId {
        let ty = self.symbols.func_def(func).sig.ret.clone();
        self.alloc(
            NodeKind::Call {
                func,
                target,
                args: SmallVec::from_slice(args),
            },
            ty,
        )
    }

    pub fn invoke(&mut self, target: NodeId, args: &[NodeId]) -> NodeId {
        let ty = match self.tree.ty(target).unlifted() {
            Ty::Func(sig) => self.symbols.sig(*sig).ret.clone(),
            other => panic!("invoke target must be lambda-typed, got {other}"),
        };
        self.alloc(
            NodeKind::Invoke {
                target,
                args: SmallVec::from_slice(args),
            },
            ty,
        )
    }

    pub fn new_obj(&mut self, ty: TypeId, args: &[NodeId]) -> NodeId {
        self.alloc(
            NodeKind::New {
                ty,
                args: SmallVec::from_slice(args),
            },
            Ty::Object(ty),
        )
    }

    pub fn new_array(&mut self, elem: Ty, items: &[NodeId]) -> NodeId {
        self.alloc(
            NodeKind::NewArray {
                kind: NewArrayKind::Init,
                items: SmallVec::from_slice(items),
            },
            Ty::array(elem),
        )
    }

    pub fn new_array_bounds(&mut self, elem: Ty, dims: &[NodeId]) -> NodeId {
        self.alloc(
            NodeKind::NewArray {
                kind: NewArrayKind::Bounds,
                items: SmallVec::from_slice(dims),
            },
            Ty::array_of_rank(elem, dims.len() as u8),
        )
    }

    pub fn member_init(&mut self, new: NodeId, bindings: Vec<(FieldId, NodeId)>) -> NodeId {
        let ty = self.tree.ty(new).clone();
        self.alloc(NodeKind::MemberInit { new, bindings }, ty)
    }

    pub fn list_init(&mut self, new: NodeId, items: &[NodeId]) -> NodeId {
        let ty = self.tree.ty(new).clone();
        self.alloc(
            NodeKind::ListInit {
                new,
                items: SmallVec::from_slice(items),
            },
            ty,
        )
    }

    // --- control flow ---

    pub fn conditional(&mut self, test: NodeId, then: NodeId, otherwise: NodeId) -> NodeId {
        let then_ty = self.tree.ty(then);
        let else_ty = self.tree.ty(otherwise);
        let ty = if then_ty.is_nullable() {
            then_ty.clone()
        } else {
            else_ty.clone()
        };
        self.alloc(
            NodeKind::Conditional {
                test,
                then,
                otherwise,
            },
            ty,
        )
    }

    pub fn block(&mut self, vars: &[NodeId], body: &[NodeId]) -> NodeId {
        let ty = body
            .last()
            .map(|id| self.tree.ty(*id).clone())
            .unwrap_or(Ty::Unit);
        self.alloc(
            NodeKind::Block {
                vars: SmallVec::from_slice(vars),
                body: SmallVec::from_slice(body),
            },
            ty,
        )
    }

    pub fn assign(&mut self, target: NodeId, value: NodeId) -> NodeId {
        let ty = self.tree.ty(target).clone();
        self.alloc(
            NodeKind::Assign {
                target,
                value,
                op: None,
            },
            ty,
        )
    }

    pub fn op_assign(&mut self, op: BinOp, target: NodeId, value: NodeId) -> NodeId {
        let ty = self.tree.ty(target).clone();
        self.alloc(
            NodeKind::Assign {
                target,
                value,
                op: Some(op),
            },
            ty,
        )
    }

    pub fn loop_(
        &mut self,
        body: NodeId,
        break_label: Option<LabelId>,
        continue_label: Option<LabelId>,
    ) -> NodeId {
        self.alloc(
            NodeKind::Loop {
                body,
                break_label,
                continue_label,
            },
            Ty::Unit,
        )
    }

    pub fn label(&mut self, label: LabelId, ty: Ty, default: Option<NodeId>) -> NodeId {
        self.alloc(NodeKind::Label { label, default }, ty)
    }

    pub fn goto(&mut self, target: LabelId, value: Option<NodeId>) -> NodeId {
        self.alloc(
            NodeKind::Goto {
                kind: GotoKind::Goto,
                target,
                value,
            },
            Ty::Unit,
        )
    }

    pub fn return_(&mut self, target: LabelId, value: Option<NodeId>) -> NodeId {
        self.alloc(
            NodeKind::Goto {
                kind: GotoKind::Return,
                target,
                value,
            },
            Ty::Unit,
        )
    }

    pub fn break_(&mut self, target: LabelId) -> NodeId {
        self.alloc(
            NodeKind::Goto {
                kind: GotoKind::Break,
                target,
                value: None,
            },
            Ty::Unit,
        )
    }

    pub fn continue_(&mut self, target: LabelId) -> NodeId {
        self.alloc(
            NodeKind::Goto {
                kind: GotoKind::Continue,
                target,
                value: None,
            },
            Ty::Unit,
        )
    }

    pub fn switch(
        &mut self,
        value: NodeId,
        cases: Vec<SwitchCase>,
        default: Option<NodeId>,
    ) -> NodeId {
        let ty = default
            .or_else(|| cases.first().map(|c| c.body))
            .map(|id| self.tree.ty(id).clone())
            .unwrap_or(Ty::Unit);
        self.alloc(
            NodeKind::Switch {
                value,
                cases,
                default,
            },
            ty,
        )
    }

    pub fn try_(
        &mut self,
        body: NodeId,
        handlers: Vec<CatchHandler>,
        finally: Option<NodeId>,
    ) -> NodeId {
        let ty = self.tree.ty(body).clone();
        self.alloc(
            NodeKind::Try {
                body,
                handlers,
                finally,
                fault: None,
            },
            ty,
        )
    }

    pub fn try_fault(&mut self, body: NodeId, fault: NodeId) -> NodeId {
        let ty = self.tree.ty(body).clone();
        self.alloc(
            NodeKind::Try {
                body,
                handlers: Vec::new(),
                finally: None,
                fault: Some(fault),
            },
            ty,
        )
    }

    pub fn throw(&mut self, value: NodeId) -> NodeId {
        self.alloc(NodeKind::Throw { value: Some(value) }, Ty::Unit)
    }

    pub fn rethrow(&mut self) -> NodeId {
        self.alloc(NodeKind::Throw { value: None }, Ty::Unit)
    }

    // --- lambdas ---

    pub fn lambda(&mut self, params: &[NodeId], body: NodeId) -> NodeId {
        let ret = self.tree.ty(body).clone();
        self.lambda_with_ret(params, body, ret)
    }

    pub fn lambda_with_ret(&mut self, params: &[NodeId], body: NodeId, ret: Ty) -> NodeId {
        let param_tys = params
            .iter()
            .map(|id| self.tree.ty(*id).clone())
            .collect::<Vec<_>>();
        let sig = self.symbols.register_sig(param_tys, ret);
        self.alloc(
            NodeKind::Lambda {
                params: SmallVec::from_slice(params),
                body,
                name: None,
            },
            Ty::Func(sig),
        )
    }

    // --- markers ---

    pub fn debug_info(&mut self, line: u32, column: u32) -> NodeId {
        self.alloc(NodeKind::DebugInfo { line, column }, Ty::Unit)
    }

    pub fn runtime_variables(&mut self, vars: &[NodeId]) -> NodeId {
        self.alloc(
            NodeKind::RuntimeVariables {
                vars: SmallVec::from_slice(vars),
            },
            Ty::Unit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_binary_type_lifting() {
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::nullable(Ty::I32));
        let one = b.i32(1);
        let sum = b.binary(BinOp::Add, x, one);
        assert_eq!(b.tree().ty(sum), &Ty::nullable(Ty::I32));
        let cmp = b.binary(BinOp::Lt, x, one);
        assert_eq!(b.tree().ty(cmp), &Ty::nullable(Ty::Bool));
    }

    #[rstest]
    #[case(Ty::nullable(Ty::I32), Ty::I32, Ty::I32)]
    #[case(Ty::nullable(Ty::I32), Ty::nullable(Ty::I32), Ty::nullable(Ty::I32))]
    #[case(Ty::Str, Ty::Str, Ty::Str)]
    fn test_coalesce_type(#[case] left: Ty, #[case] right: Ty, #[case] expected: Ty) {
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let l = b.param("l", left);
        let r = b.param("r", right);
        let c = b.binary(BinOp::Coalesce, l, r);
        assert_eq!(b.tree().ty(c), &expected);
    }

    #[test]
    fn test_lambda_signature_interning() {
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let body = b.binary(BinOp::Add, x, x);
        let f = b.lambda(&[x], body);
        let tree = b.finish();
        match tree.ty(f) {
            Ty::Func(sig) => {
                assert_eq!(symbols.sig(*sig).params, vec![Ty::I32]);
                assert_eq!(symbols.sig(*sig).ret, Ty::I32);
            }
            other => panic!("expected function type, got {other}"),
        }
    }

    #[test]
    fn test_block_type_is_last_expression() {
        let symbols = Symbols::new();
        let mut b = TreeBuilder::new(&symbols);
        let v = b.var("v", Ty::I32);
        let one = b.i32(1);
        let assign = b.assign(v, one);
        let block = b.block(&[v], &[assign, v]);
        assert_eq!(b.tree().ty(block), &Ty::I32);
        let empty = b.block(&[], &[]);
        assert_eq!(b.tree().ty(empty), &Ty::Unit);
    }
}
