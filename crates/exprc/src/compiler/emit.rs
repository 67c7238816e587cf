use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::compiler::code::{
    Checked, CmpOp, CodeLabel, Guard, HandlerSpec, Instr, IntTy, NumTy, Pc, Region, RegionKind,
    SwitchTable,
};
use crate::compiler::context::{ClosureStorage, EmitResult, EmittingContext, ResultShape};
use crate::compiler::CompilerOptions;
use crate::error::CompileError;
use crate::hash;
use crate::tree::{BinOp, CatchHandler, GotoKind, NewArrayKind, NodeId, NodeKind, SwitchCase, UnOp};
use crate::types::Ty;
use crate::value::Value;

/// Lower one node, leaving on the operand stack whatever `shape` asks for.
pub fn emit(
    ctx: &mut EmittingContext<'_>,
    node: NodeId,
    shape: ResultShape,
) -> Result<EmitResult, CompileError> {
    let ty = ctx.tree.ty(node).clone();
    match ctx.tree.kind(node).clone() {
        NodeKind::Constant(value) => {
            if shape.is_void() {
                return Ok(EmitResult::value());
            }
            emit_constant(ctx, &value)?;
            Ok(EmitResult::value())
        }
        NodeKind::Default => {
            if shape.is_void() {
                return Ok(EmitResult::value());
            }
            if ty == Ty::Unit {
                ctx.code.emit(Instr::PushNull);
            } else {
                ctx.code.emit(Instr::PushDefault(ty));
            }
            Ok(EmitResult::value())
        }
        NodeKind::Parameter { name } => emit_parameter(ctx, node, &ty, shape, &name),
        NodeKind::Binary { op, left, right } => {
            let result = emit_binary(ctx, op, left, right)?;
            pop_if_void(ctx, shape);
            Ok(result)
        }
        NodeKind::Unary { op, operand } => {
            let result = emit_unary(ctx, op, operand, &ty)?;
            pop_if_void(ctx, shape);
            Ok(result)
        }
        NodeKind::Member { target, field } => {
            let def = ctx.symbols.field_def(field);
            let mut result = emit(ctx, target, ResultShape::Value)?;
            result.escapes |= guard_null_receiver(ctx, target);
            if shape.wants_ref(&ty) {
                ctx.code.emit(Instr::LoadFieldRef(def.index));
                result.by_ref = true;
            } else {
                ctx.code.emit(Instr::LoadField(def.index));
                pop_if_void(ctx, shape);
            }
            Ok(result)
        }
        NodeKind::StaticMember { field } => {
            if shape.is_void() {
                return Ok(EmitResult::value());
            }
            let mut result = EmitResult::value();
            if shape.wants_ref(&ty) {
                ctx.code.emit(Instr::LoadStaticRef(field));
                result.by_ref = true;
            } else {
                ctx.code.emit(Instr::LoadStatic(field));
            }
            Ok(result)
        }
        NodeKind::Index { target, key } => {
            let mut result = emit(ctx, target, ResultShape::Value)?;
            result.escapes |= guard_null_receiver(ctx, target);
            result = result.join(emit(ctx, key, ResultShape::Value)?);
            if shape.wants_ref(&ty) {
                ctx.code.emit(Instr::LoadEntryRef);
                result.by_ref = true;
            } else {
                ctx.code.emit(Instr::LoadEntry);
                pop_if_void(ctx, shape);
            }
            Ok(result)
        }
        NodeKind::ArrayIndex { target, indexes } => {
            let mut result = emit(ctx, target, ResultShape::Value)?;
            result.escapes |= guard_null_receiver(ctx, target);
            for index in &indexes {
                result = result.join(emit(ctx, *index, ResultShape::Value)?);
            }
            let rank = indexes.len() as u8;
            let guard = bounds_guard(ctx);
            result.escapes |= guard == Guard::Escape;
            if shape.wants_ref(&ty) {
                ctx.code.emit(Instr::LoadElemRef { rank, guard });
                result.by_ref = true;
            } else {
                ctx.code.emit(Instr::LoadElem { rank, guard });
                pop_if_void(ctx, shape);
            }
            Ok(result)
        }
        NodeKind::Call { func, target, args } => {
            let mut result = EmitResult::value();
            let mut argc = 0u8;
            if let Some(target) = target {
                result = result.join(emit(ctx, target, ResultShape::Value)?);
                result.escapes |= guard_null_receiver(ctx, target);
                argc += 1;
            }
            for arg in &args {
                result = result.join(emit(ctx, *arg, ResultShape::Value)?);
                argc += 1;
            }
            ctx.code.emit(Instr::CallHost { func, argc });
            pop_if_void(ctx, shape);
            Ok(result)
        }
        NodeKind::Invoke { target, args } => {
            let mut result = emit(ctx, target, ResultShape::Value)?;
            result.escapes |= guard_null_receiver(ctx, target);
            for arg in &args {
                result = result.join(emit(ctx, *arg, ResultShape::Value)?);
            }
            ctx.code.emit(Instr::Invoke {
                argc: args.len() as u8,
            });
            pop_if_void(ctx, shape);
            Ok(result)
        }
        NodeKind::New { ty: type_id, args } => {
            let mut result = EmitResult::value();
            for arg in &args {
                result = result.join(emit(ctx, *arg, ResultShape::Value)?);
            }
            ctx.code.emit(Instr::NewObj {
                ty: type_id,
                argc: args.len() as u8,
            });
            pop_if_void(ctx, shape);
            Ok(result)
        }
        NodeKind::NewArray { kind, items } => {
            let Ty::Array { elem, rank } = &ty else {
                return Err(CompileError::Internal("array literal without array type"));
            };
            let mut result = EmitResult::value();
            for item in &items {
                result = result.join(emit(ctx, *item, ResultShape::Value)?);
            }
            match kind {
                NewArrayKind::Bounds => {
                    ctx.code.emit(Instr::NewArray {
                        elem: (**elem).clone(),
                        rank: *rank,
                    });
                }
                NewArrayKind::Init => {
                    ctx.code.emit(Instr::NewArrayInit {
                        elem: (**elem).clone(),
                        len: items.len() as u16,
                    });
                }
            }
            pop_if_void(ctx, shape);
            Ok(result)
        }
        NodeKind::Conditional {
            test,
            then,
            otherwise,
        } => {
            let branch_shape = branch_shape(shape);
            let l_then = ctx.code.new_label();
            let l_end = ctx.code.new_label();
            let mut result = emit(ctx, test, ResultShape::Value)?;
            ctx.code.emit(Instr::JumpIfTrue(l_then.0));
            result = result.join(emit(ctx, otherwise, branch_shape)?);
            ctx.code.emit(Instr::Jump(l_end.0));
            ctx.code.mark(l_then);
            result = result.join(emit(ctx, then, branch_shape)?);
            ctx.code.mark(l_end);
            Ok(result)
        }
        NodeKind::Block { vars, body } => emit_block(ctx, &vars, &body, shape),
        NodeKind::Assign { target, value, op } => emit_assign(ctx, target, value, op, shape),
        NodeKind::Loop {
            body,
            break_label,
            continue_label,
        } => {
            let cont = match continue_label {
                Some(label) => ctx.label_binding(label, &Ty::Unit).label,
                None => ctx.code.new_label(),
            };
            let brk = break_label.map(|label| ctx.label_binding(label, &Ty::Unit).label);
            ctx.code.mark(cont);
            let result = emit(ctx, body, ResultShape::Void)?;
            ctx.code.emit(Instr::Jump(cont.0));
            if let Some(brk) = brk {
                ctx.code.mark(brk);
            }
            push_unit(ctx, shape);
            Ok(result)
        }
        NodeKind::Goto {
            kind,
            target,
            value,
        } => {
            // Loops bind their labels before the body is emitted, so a break
            // or continue whose label is unbound has no enclosing loop.
            if matches!(kind, GotoKind::Break | GotoKind::Continue) && !ctx.has_label(target) {
                return Err(CompileError::OrphanLoopJump);
            }
            let value_ty = value
                .map(|v| ctx.tree.ty(v).clone())
                .unwrap_or(Ty::Unit);
            let binding = ctx.label_binding(target, &value_ty);
            let mut result = EmitResult::value();
            if let Some(value) = value {
                result = emit(ctx, value, ResultShape::Value)?;
                match binding.slot {
                    Some(slot) => {
                        ctx.code.emit(Instr::StoreLocal(slot));
                    }
                    None => {
                        ctx.code.emit(Instr::Pop);
                    }
                }
            }
            // Leave, not a plain jump: every finally between here and the
            // target still runs.
            ctx.code.emit(Instr::Leave(binding.label.0));
            push_unit(ctx, shape);
            Ok(result)
        }
        NodeKind::Label { label, default } => {
            let binding = ctx.label_binding(label, &ty);
            let mut result = EmitResult::value();
            if let Some(slot) = binding.slot {
                match default {
                    Some(default) => {
                        result = emit(ctx, default, ResultShape::Value)?;
                    }
                    None => {
                        ctx.code.emit(Instr::PushDefault(ty.clone()));
                    }
                }
                ctx.code.emit(Instr::StoreLocal(slot));
            } else if let Some(default) = default {
                result = emit(ctx, default, ResultShape::Void)?;
            }
            ctx.code.mark(binding.label);
            if !shape.is_void() {
                match binding.slot {
                    Some(slot) => {
                        ctx.code.emit(Instr::LoadLocal(slot));
                    }
                    None => {
                        ctx.code.emit(Instr::PushNull);
                    }
                }
            }
            Ok(result)
        }
        NodeKind::Switch {
            value,
            cases,
            default,
        } => emit_switch(ctx, value, &cases, default, &ty, shape),
        NodeKind::Try {
            body,
            handlers,
            finally,
            fault,
        } => emit_try(ctx, body, &handlers, finally, fault, &ty, shape),
        NodeKind::Throw { value } => {
            let result = match value {
                Some(value) => {
                    let result = emit(ctx, value, ResultShape::Value)?;
                    ctx.code.emit(Instr::Throw);
                    result
                }
                None => {
                    if ctx.catch_depth == 0 {
                        return Err(CompileError::RethrowOutsideCatch);
                    }
                    ctx.code.emit(Instr::Rethrow);
                    EmitResult::value()
                }
            };
            push_unit(ctx, shape);
            Ok(result)
        }
        NodeKind::Lambda { .. } => {
            if shape.is_void() {
                return Ok(EmitResult::value());
            }
            ctx.pending.push(node);
            let sub = (ctx.pending.len() - 1) as u32;
            match ctx.closure {
                Some(binding) => {
                    emit_closure_load(ctx, binding.storage);
                    ctx.code.emit(Instr::MakeClosure { sub, binds: true });
                }
                None => {
                    ctx.code.emit(Instr::MakeClosure { sub, binds: false });
                }
            }
            Ok(EmitResult::value())
        }
        NodeKind::MemberInit { new, bindings } => {
            let mut result = emit(ctx, new, ResultShape::Value)?;
            for (field, value) in &bindings {
                let def = ctx.symbols.field_def(*field);
                ctx.code.emit(Instr::Dup);
                result = result.join(emit(ctx, *value, ResultShape::Value)?);
                ctx.code.emit(Instr::StoreField(def.index));
            }
            pop_if_void(ctx, shape);
            Ok(result)
        }
        NodeKind::ListInit { new, items } => {
            let mut result = emit(ctx, new, ResultShape::Value)?;
            for item in &items {
                result = result.join(emit(ctx, *item, ResultShape::Value)?);
                ctx.code.emit(Instr::AppendElem);
            }
            pop_if_void(ctx, shape);
            Ok(result)
        }
        NodeKind::DebugInfo { line, column } => {
            if ctx.options.contains(CompilerOptions::EMIT_DEBUG_INFO) {
                ctx.code.emit(Instr::DebugMark { line, column });
            }
            push_unit(ctx, shape);
            Ok(EmitResult::value())
        }
        NodeKind::RuntimeVariables { .. } => {
            Err(CompileError::NotSupportedNodeKind("RuntimeVariables"))
        }
    }
}

fn branch_shape(shape: ResultShape) -> ResultShape {
    if shape.is_void() {
        ResultShape::Void
    } else {
        ResultShape::Value
    }
}

fn push_unit(ctx: &mut EmittingContext<'_>, shape: ResultShape) {
    if !shape.is_void() {
        ctx.code.emit(Instr::PushNull);
    }
}

fn pop_if_void(ctx: &mut EmittingContext<'_>, shape: ResultShape) {
    if shape.is_void() {
        ctx.code.emit(Instr::Pop);
    }
}

fn emit_constant(ctx: &mut EmittingContext<'_>, value: &Value) -> Result<(), CompileError> {
    let instr = match value {
        Value::Null => Instr::PushNull,
        Value::Bool(v) => Instr::PushBool(*v),
        Value::I32(v) => Instr::PushI32(*v),
        Value::I64(v) => Instr::PushI64(*v),
        Value::F64(v) => Instr::PushF64(*v),
        Value::Str(v) => Instr::PushStr(v.clone()),
        _ => return Err(CompileError::Internal("opaque constant was not hoisted")),
    };
    ctx.code.emit(instr);
    Ok(())
}

fn emit_parameter(
    ctx: &mut EmittingContext<'_>,
    node: NodeId,
    ty: &Ty,
    shape: ResultShape,
    name: &str,
) -> Result<EmitResult, CompileError> {
    if shape.is_void() {
        // Reads of parameters have no side effects, not even the lookup.
        if ctx.args.contains_key(&node)
            || ctx.var_locals.contains_key(&node)
            || ctx.closure.map(|b| b.param) == Some(node)
            || ctx.constants_param == Some(node)
        {
            return Ok(EmitResult::value());
        }
        return Err(CompileError::UnknownParameter(name.into()));
    }
    let mut result = EmitResult::value();
    if let Some(&slot) = ctx.args.get(&node) {
        if shape.wants_ref(ty) {
            ctx.code.emit(Instr::LoadArgRef(slot));
            result.by_ref = true;
        } else {
            ctx.code.emit(Instr::LoadArg(slot));
        }
    } else if let Some(&slot) = ctx.var_locals.get(&node) {
        if shape.wants_ref(ty) {
            ctx.code.emit(Instr::LoadLocalRef(slot));
            result.by_ref = true;
        } else {
            ctx.code.emit(Instr::LoadLocal(slot));
        }
    } else if let Some(binding) = ctx.closure.filter(|b| b.param == node) {
        emit_closure_load(ctx, binding.storage);
    } else if ctx.constants_param == Some(node) {
        ctx.code.emit(Instr::PushConstants);
    } else {
        return Err(CompileError::UnknownParameter(name.into()));
    }
    Ok(result)
}

fn emit_closure_load(ctx: &mut EmittingContext<'_>, storage: ClosureStorage) {
    match storage {
        ClosureStorage::Local(slot) => {
            ctx.code.emit(Instr::LoadLocal(slot));
        }
        ClosureStorage::Arg(slot) => {
            ctx.code.emit(Instr::LoadArg(slot));
        }
    }
}

/// Null-check a just-pushed receiver. Under guarded compilation a null
/// receiver escapes; otherwise the dereferencing instruction faults.
fn guard_null_receiver(ctx: &mut EmittingContext<'_>, receiver: NodeId) -> bool {
    if !ctx.tree.ty(receiver).is_nullable() {
        return false;
    }
    if ctx.options.contains(CompilerOptions::CHECK_NULL_REFERENCES) {
        let escape = ctx.escape_target();
        ctx.code.emit(Instr::Dup);
        ctx.code.emit(Instr::JumpIfNull(escape.0));
        true
    } else {
        false
    }
}

fn bounds_guard(ctx: &mut EmittingContext<'_>) -> Guard {
    if ctx.options.contains(CompilerOptions::CHECK_ARRAY_INDEXES) {
        ctx.escape_used = true;
        Guard::Escape
    } else {
        Guard::Fault
    }
}

fn checked_mode(ctx: &mut EmittingContext<'_>, is_checked: bool) -> Checked {
    if !is_checked {
        Checked::Wrap
    } else if ctx.options.contains(CompilerOptions::CHECK_OVERFLOW) {
        ctx.escape_used = true;
        Checked::Escape
    } else {
        Checked::Fault
    }
}

fn num_ty(ty: &Ty) -> Result<NumTy, CompileError> {
    match ty {
        Ty::I32 => Ok(NumTy::I32),
        Ty::I64 => Ok(NumTy::I64),
        Ty::F64 => Ok(NumTy::F64),
        _ => Err(CompileError::Internal("numeric operand expected")),
    }
}

fn int_ty(ty: &Ty) -> Result<IntTy, CompileError> {
    match ty {
        Ty::I32 => Ok(IntTy::I32),
        Ty::I64 => Ok(IntTy::I64),
        _ => Err(CompileError::Internal("integral operand expected")),
    }
}

fn cmp_op(op: BinOp) -> CmpOp {
    match op {
        BinOp::Lt => CmpOp::Lt,
        BinOp::Le => CmpOp::Le,
        BinOp::Gt => CmpOp::Gt,
        BinOp::Ge => CmpOp::Ge,
        BinOp::Eq => CmpOp::Eq,
        _ => CmpOp::Ne,
    }
}

/// The strict (both-operands-present) instruction for a binary operator.
fn emit_raw_binary(
    ctx: &mut EmittingContext<'_>,
    op: BinOp,
    base: &Ty,
) -> Result<(), CompileError> {
    let instr = match op {
        BinOp::Add | BinOp::AddChecked => {
            Instr::Add(num_ty(base)?, checked_mode(ctx, op.is_checked()))
        }
        BinOp::Sub | BinOp::SubChecked => {
            Instr::Sub(num_ty(base)?, checked_mode(ctx, op.is_checked()))
        }
        BinOp::Mul | BinOp::MulChecked => {
            Instr::Mul(num_ty(base)?, checked_mode(ctx, op.is_checked()))
        }
        BinOp::Div => Instr::Div(num_ty(base)?),
        BinOp::Rem => Instr::Rem(num_ty(base)?),
        BinOp::And => {
            if *base == Ty::Bool {
                Instr::And3
            } else {
                Instr::BitAnd(int_ty(base)?)
            }
        }
        BinOp::Or => {
            if *base == Ty::Bool {
                Instr::Or3
            } else {
                Instr::BitOr(int_ty(base)?)
            }
        }
        BinOp::Xor => {
            if *base == Ty::Bool {
                Instr::Cmp(CmpOp::Ne)
            } else {
                Instr::BitXor(int_ty(base)?)
            }
        }
        BinOp::Shl => Instr::Shl(int_ty(base)?),
        BinOp::Shr => Instr::Shr(int_ty(base)?),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
            Instr::Cmp(cmp_op(op))
        }
        BinOp::AndAlso | BinOp::OrElse | BinOp::Coalesce => {
            return Err(CompileError::Internal(
                "short-circuit operator reached the strict emitter",
            ));
        }
    };
    ctx.code.emit(instr);
    Ok(())
}

/// Null-lifting wrapper: both operands are fully evaluated into temporaries,
/// and the strict instruction runs only when both are present; otherwise the
/// result is null. The branches disappear entirely when neither operand is
/// nullable.
fn emit_lifted<'c, L, R>(
    ctx: &mut EmittingContext<'c>,
    left_ty: Ty,
    right_ty: Ty,
    left: L,
    right: R,
    op: BinOp,
) -> Result<EmitResult, CompileError>
where
    L: FnOnce(&mut EmittingContext<'c>) -> Result<EmitResult, CompileError>,
    R: FnOnce(&mut EmittingContext<'c>) -> Result<EmitResult, CompileError>,
{
    let base = left_ty.unlifted().clone();
    if !left_ty.is_nullable() && !right_ty.is_nullable() {
        let result = left(ctx)?.join(right(ctx)?);
        emit_raw_binary(ctx, op, &base)?;
        return Ok(result);
    }

    let l_tmp = ctx.acquire_local(left_ty.clone());
    let r_tmp = ctx.acquire_local(right_ty.clone());
    let result = {
        let l = left(ctx)?;
        ctx.code.emit(Instr::StoreLocal(l_tmp.slot()));
        let r = right(ctx)?;
        ctx.code.emit(Instr::StoreLocal(r_tmp.slot()));
        l.join(r)
    };
    let l_null = ctx.code.new_label();
    let l_end = ctx.code.new_label();
    if left_ty.is_nullable() {
        ctx.code.emit(Instr::LoadLocal(l_tmp.slot()));
        ctx.code.emit(Instr::JumpIfNull(l_null.0));
    }
    if right_ty.is_nullable() {
        ctx.code.emit(Instr::LoadLocal(r_tmp.slot()));
        ctx.code.emit(Instr::JumpIfNull(l_null.0));
    }
    ctx.code.emit(Instr::LoadLocal(l_tmp.slot()));
    ctx.code.emit(Instr::LoadLocal(r_tmp.slot()));
    emit_raw_binary(ctx, op, &base)?;
    ctx.code.emit(Instr::Jump(l_end.0));
    ctx.code.mark(l_null);
    ctx.code.emit(Instr::PushNull);
    ctx.code.mark(l_end);
    Ok(result)
}

fn emit_binary(
    ctx: &mut EmittingContext<'_>,
    op: BinOp,
    left: NodeId,
    right: NodeId,
) -> Result<EmitResult, CompileError> {
    let left_ty = ctx.tree.ty(left).clone();
    let right_ty = ctx.tree.ty(right).clone();
    match op {
        BinOp::AndAlso => {
            // false short-circuits; null does not (null && false is false).
            let l_end = ctx.code.new_label();
            let mut result = emit(ctx, left, ResultShape::Value)?;
            ctx.code.emit(Instr::Dup);
            ctx.code.emit(Instr::JumpIfFalse(l_end.0));
            result = result.join(emit(ctx, right, ResultShape::Value)?);
            ctx.code.emit(Instr::And3);
            ctx.code.mark(l_end);
            Ok(result)
        }
        BinOp::OrElse => {
            let l_end = ctx.code.new_label();
            let mut result = emit(ctx, left, ResultShape::Value)?;
            ctx.code.emit(Instr::Dup);
            ctx.code.emit(Instr::JumpIfTrue(l_end.0));
            result = result.join(emit(ctx, right, ResultShape::Value)?);
            ctx.code.emit(Instr::Or3);
            ctx.code.mark(l_end);
            Ok(result)
        }
        BinOp::Coalesce => {
            let l_end = ctx.code.new_label();
            let mut result = emit(ctx, left, ResultShape::Value)?;
            ctx.code.emit(Instr::Dup);
            ctx.code.emit(Instr::JumpIfNotNull(l_end.0));
            ctx.code.emit(Instr::Pop);
            result = result.join(emit(ctx, right, ResultShape::Value)?);
            ctx.code.mark(l_end);
            Ok(result)
        }
        BinOp::And | BinOp::Or if *left_ty.unlifted() == Ty::Bool => {
            // Non-short-circuiting boolean connectives follow the Kleene
            // tables, which the dedicated instructions implement directly.
            let result = emit(ctx, left, ResultShape::Value)?
                .join(emit(ctx, right, ResultShape::Value)?);
            ctx.code.emit(if op == BinOp::And {
                Instr::And3
            } else {
                Instr::Or3
            });
            Ok(result)
        }
        _ => emit_lifted(
            ctx,
            left_ty,
            right_ty,
            |c| emit(c, left, ResultShape::Value),
            |c| emit(c, right, ResultShape::Value),
            op,
        ),
    }
}

fn lifted_unary<F>(
    ctx: &mut EmittingContext<'_>,
    operand: NodeId,
    raw: F,
) -> Result<EmitResult, CompileError>
where
    F: FnOnce(&mut EmittingContext<'_>) -> Result<(), CompileError>,
{
    let operand_ty = ctx.tree.ty(operand).clone();
    let result = emit(ctx, operand, ResultShape::Value)?;
    if operand_ty.is_nullable() {
        let l_end = ctx.code.new_label();
        ctx.code.emit(Instr::Dup);
        ctx.code.emit(Instr::JumpIfNull(l_end.0));
        raw(ctx)?;
        ctx.code.mark(l_end);
    } else {
        raw(ctx)?;
    }
    Ok(result)
}

/// Unwrap check for `x.Value` and narrowing nullable conversions.
fn unwrap_check(ctx: &mut EmittingContext<'_>) -> bool {
    if ctx.options.contains(CompilerOptions::CHECK_NULL_REFERENCES) {
        let escape = ctx.escape_target();
        ctx.code.emit(Instr::Dup);
        ctx.code.emit(Instr::JumpIfNull(escape.0));
        true
    } else {
        ctx.code.emit(Instr::NullCheck);
        false
    }
}

fn emit_unary(
    ctx: &mut EmittingContext<'_>,
    op: UnOp,
    operand: NodeId,
    node_ty: &Ty,
) -> Result<EmitResult, CompileError> {
    let operand_ty = ctx.tree.ty(operand).clone();
    match op {
        UnOp::UnaryPlus => emit(ctx, operand, ResultShape::Value),
        UnOp::Not => {
            let result = emit(ctx, operand, ResultShape::Value)?;
            ctx.code.emit(Instr::Not);
            Ok(result)
        }
        UnOp::Negate | UnOp::NegateChecked => {
            let base = operand_ty.unlifted().clone();
            let ty = num_ty(&base)?;
            let checked = checked_mode(ctx, op == UnOp::NegateChecked);
            lifted_unary(ctx, operand, |c| {
                c.code.emit(Instr::Neg(ty, checked));
                Ok(())
            })
        }
        UnOp::BitNot => {
            let ty = int_ty(operand_ty.unlifted())?;
            lifted_unary(ctx, operand, |c| {
                c.code.emit(Instr::BitNot(ty));
                Ok(())
            })
        }
        UnOp::ArrayLength => {
            let mut result = emit(ctx, operand, ResultShape::Value)?;
            result.escapes |= guard_null_receiver(ctx, operand);
            ctx.code.emit(Instr::ArrayLen);
            Ok(result)
        }
        UnOp::HasValue => {
            let result = emit(ctx, operand, ResultShape::Value)?;
            ctx.code.emit(Instr::IsNull);
            ctx.code.emit(Instr::Not);
            Ok(result)
        }
        UnOp::GetValue => {
            let mut result = emit(ctx, operand, ResultShape::Value)?;
            result.escapes |= unwrap_check(ctx);
            Ok(result)
        }
        UnOp::Convert | UnOp::ConvertChecked => {
            emit_convert(ctx, operand, &operand_ty, node_ty, op == UnOp::ConvertChecked)
        }
    }
}

fn emit_convert(
    ctx: &mut EmittingContext<'_>,
    operand: NodeId,
    from: &Ty,
    to: &Ty,
    is_checked: bool,
) -> Result<EmitResult, CompileError> {
    let mut result = emit(ctx, operand, ResultShape::Value)?;
    if from == to {
        return Ok(result);
    }
    let from_base = from.unlifted();
    let to_base = to.unlifted();
    if from_base == to_base {
        // Same underlying type: widening T -> T? is free, narrowing T? -> T
        // is an unwrap.
        if from.is_nullable() && !to.is_nullable() {
            result.escapes |= unwrap_check(ctx);
        }
        return Ok(result);
    }
    let target = num_ty(to_base).map_err(|_| CompileError::NotSupportedNodeKind("Convert"))?;
    num_ty(from_base).map_err(|_| CompileError::NotSupportedNodeKind("Convert"))?;
    let checked = checked_mode(ctx, is_checked);
    if from.is_nullable() {
        if to.is_nullable() {
            let l_end = ctx.code.new_label();
            ctx.code.emit(Instr::Dup);
            ctx.code.emit(Instr::JumpIfNull(l_end.0));
            ctx.code.emit(Instr::Convert {
                to: target,
                checked,
            });
            ctx.code.mark(l_end);
        } else {
            result.escapes |= unwrap_check(ctx);
            ctx.code.emit(Instr::Convert {
                to: target,
                checked,
            });
        }
    } else {
        ctx.code.emit(Instr::Convert {
            to: target,
            checked,
        });
    }
    Ok(result)
}

fn emit_block(
    ctx: &mut EmittingContext<'_>,
    vars: &[NodeId],
    body: &[NodeId],
    shape: ResultShape,
) -> Result<EmitResult, CompileError> {
    let mut holders = Vec::with_capacity(vars.len());
    for var in vars {
        let var_ty = ctx.tree.ty(*var).clone();
        let holder = ctx.acquire_local(var_ty.clone());
        // Slots are reused across scopes, so each variable starts from its
        // type's default.
        ctx.code.emit(Instr::PushDefault(var_ty));
        ctx.code.emit(Instr::StoreLocal(holder.slot()));
        ctx.var_locals.insert(*var, holder.slot());
        holders.push((*var, holder));
    }
    let mut result = EmitResult::value();
    if body.is_empty() {
        push_unit(ctx, shape);
    } else {
        let last = body.len() - 1;
        for (i, expr) in body.iter().enumerate() {
            let expr_shape = if i == last { shape } else { ResultShape::Void };
            result = result.join(emit(ctx, *expr, expr_shape)?);
        }
    }
    for (var, _holder) in holders {
        ctx.var_locals.remove(&var);
    }
    Ok(result)
}

/// Store instruction plus the stack shuffle that leaves the stored value
/// behind when the assignment is used as an expression.
fn store_with_result(
    ctx: &mut EmittingContext<'_>,
    shape: ResultShape,
    result_ty: Ty,
    store: Instr,
) {
    if shape.is_void() {
        ctx.code.emit(store);
    } else {
        let tmp = ctx.acquire_local(result_ty);
        ctx.code.emit(Instr::StoreLocal(tmp.slot()));
        ctx.code.emit(Instr::LoadLocal(tmp.slot()));
        ctx.code.emit(store);
        ctx.code.emit(Instr::LoadLocal(tmp.slot()));
    }
}

/// A reference to an assignable node, for targets that must be evaluated
/// exactly once.
fn emit_address(
    ctx: &mut EmittingContext<'_>,
    target: NodeId,
) -> Result<EmitResult, CompileError> {
    let mut result = EmitResult {
        escapes: false,
        by_ref: true,
    };
    match ctx.tree.kind(target).clone() {
        NodeKind::Parameter { name } => {
            if let Some(&slot) = ctx.args.get(&target) {
                ctx.code.emit(Instr::LoadArgRef(slot));
            } else if let Some(&slot) = ctx.var_locals.get(&target) {
                ctx.code.emit(Instr::LoadLocalRef(slot));
            } else {
                return Err(CompileError::UnknownParameter(name));
            }
        }
        NodeKind::Member { target: recv, field } => {
            let def = ctx.symbols.field_def(field);
            result = result.join(emit(ctx, recv, ResultShape::Value)?);
            result.escapes |= guard_null_receiver(ctx, recv);
            ctx.code.emit(Instr::LoadFieldRef(def.index));
        }
        NodeKind::StaticMember { field } => {
            ctx.code.emit(Instr::LoadStaticRef(field));
        }
        NodeKind::Index { target: recv, key } => {
            result = result.join(emit(ctx, recv, ResultShape::Value)?);
            result.escapes |= guard_null_receiver(ctx, recv);
            result = result.join(emit(ctx, key, ResultShape::Value)?);
            ctx.code.emit(Instr::LoadEntryRef);
        }
        NodeKind::ArrayIndex {
            target: recv,
            indexes,
        } => {
            result = result.join(emit(ctx, recv, ResultShape::Value)?);
            result.escapes |= guard_null_receiver(ctx, recv);
            for index in &indexes {
                result = result.join(emit(ctx, *index, ResultShape::Value)?);
            }
            let guard = bounds_guard(ctx);
            result.escapes |= guard == Guard::Escape;
            ctx.code.emit(Instr::LoadElemRef {
                rank: indexes.len() as u8,
                guard,
            });
        }
        other => return Err(CompileError::NotSupportedNodeKind(other.name())),
    }
    Ok(result)
}

fn emit_assign(
    ctx: &mut EmittingContext<'_>,
    target: NodeId,
    value: NodeId,
    op: Option<BinOp>,
    shape: ResultShape,
) -> Result<EmitResult, CompileError> {
    let target_ty = ctx.tree.ty(target).clone();
    let value_ty = ctx.tree.ty(value).clone();

    // Direct slot stores for parameters and locals.
    if let NodeKind::Parameter { name } = ctx.tree.kind(target).clone() {
        #[derive(Clone, Copy)]
        enum Slot {
            Arg(u16),
            Local(u16),
        }
        let slot = if let Some(&s) = ctx.args.get(&target) {
            Slot::Arg(s)
        } else if let Some(&s) = ctx.var_locals.get(&target) {
            Slot::Local(s)
        } else {
            return Err(CompileError::UnknownParameter(name));
        };
        let result = match op {
            None => emit(ctx, value, ResultShape::Value)?,
            Some(op) => {
                let load = match slot {
                    Slot::Arg(s) => Instr::LoadArg(s),
                    Slot::Local(s) => Instr::LoadLocal(s),
                };
                emit_lifted(
                    ctx,
                    target_ty.clone(),
                    value_ty,
                    move |c| {
                        c.code.emit(load);
                        Ok(EmitResult::value())
                    },
                    |c| emit(c, value, ResultShape::Value),
                    op,
                )?
            }
        };
        if !shape.is_void() {
            ctx.code.emit(Instr::Dup);
        }
        ctx.code.emit(match slot {
            Slot::Arg(s) => Instr::StoreArg(s),
            Slot::Local(s) => Instr::StoreLocal(s),
        });
        return Ok(result);
    }

    match op {
        None => emit_plain_store(ctx, target, value, target_ty, shape),
        Some(op) => {
            // Compound assignment evaluates the target once: take its
            // address, read through it, combine, store back.
            let mut result = emit_address(ctx, target)?;
            ctx.code.emit(Instr::Dup);
            result = result.join(emit_lifted(
                ctx,
                target_ty.clone(),
                value_ty,
                |c| {
                    c.code.emit(Instr::LoadRef);
                    Ok(EmitResult::value())
                },
                |c| emit(c, value, ResultShape::Value),
                op,
            )?);
            store_with_result(ctx, shape, target_ty, Instr::StoreRef);
            Ok(result)
        }
    }
}

/// Plain assignment to a structured target, using the direct store forms.
fn emit_plain_store(
    ctx: &mut EmittingContext<'_>,
    target: NodeId,
    value: NodeId,
    target_ty: Ty,
    shape: ResultShape,
) -> Result<EmitResult, CompileError> {
    match ctx.tree.kind(target).clone() {
        NodeKind::Member { target: recv, field } => {
            let def = ctx.symbols.field_def(field);
            let mut result = emit(ctx, recv, ResultShape::Value)?;
            result.escapes |= guard_null_receiver(ctx, recv);
            result = result.join(emit(ctx, value, ResultShape::Value)?);
            store_with_result(ctx, shape, target_ty, Instr::StoreField(def.index));
            Ok(result)
        }
        NodeKind::StaticMember { field } => {
            let result = emit(ctx, value, ResultShape::Value)?;
            if !shape.is_void() {
                ctx.code.emit(Instr::Dup);
            }
            ctx.code.emit(Instr::StoreStatic(field));
            Ok(result)
        }
        NodeKind::Index { target: recv, key } => {
            let mut result = emit(ctx, recv, ResultShape::Value)?;
            result.escapes |= guard_null_receiver(ctx, recv);
            result = result.join(emit(ctx, key, ResultShape::Value)?);
            result = result.join(emit(ctx, value, ResultShape::Value)?);
            store_with_result(ctx, shape, target_ty, Instr::StoreEntry);
            Ok(result)
        }
        NodeKind::ArrayIndex {
            target: recv,
            indexes,
        } => {
            let mut result = emit(ctx, recv, ResultShape::Value)?;
            result.escapes |= guard_null_receiver(ctx, recv);
            for index in &indexes {
                result = result.join(emit(ctx, *index, ResultShape::Value)?);
            }
            let guard = bounds_guard(ctx);
            result.escapes |= guard == Guard::Escape;
            result = result.join(emit(ctx, value, ResultShape::Value)?);
            store_with_result(
                ctx,
                shape,
                target_ty,
                Instr::StoreElem {
                    rank: indexes.len() as u8,
                    guard,
                },
            );
            Ok(result)
        }
        other => Err(CompileError::NotSupportedNodeKind(other.name())),
    }
}

fn emit_switch(
    ctx: &mut EmittingContext<'_>,
    value: NodeId,
    cases: &[SwitchCase],
    default: Option<NodeId>,
    node_ty: &Ty,
    shape: ResultShape,
) -> Result<EmitResult, CompileError> {
    let body_shape = branch_shape(shape);
    let scrutinee_ty = ctx.tree.ty(value).clone();
    let l_end = ctx.code.new_label();
    let l_default = ctx.code.new_label();
    let body_labels: Vec<CodeLabel> = cases.iter().map(|_| ctx.code.new_label()).collect();

    let mut result = emit(ctx, value, ResultShape::Value)?;

    if scrutinee_ty.is_nullable() {
        // A null scrutinee routes to the case testing for null, or to the
        // default branch; never through the dispatch below.
        let null_target = cases
            .iter()
            .position(|case| {
                case.tests.iter().any(|t| {
                    matches!(ctx.tree.kind(*t), NodeKind::Constant(Value::Null))
                })
            })
            .map(|i| body_labels[i])
            .unwrap_or(l_default);
        let l_non_null = ctx.code.new_label();
        ctx.code.emit(Instr::Dup);
        ctx.code.emit(Instr::JumpIfNotNull(l_non_null.0));
        ctx.code.emit(Instr::Pop);
        ctx.code.emit(Instr::Jump(null_target.0));
        ctx.code.mark(l_non_null);
    }

    match switch_table(ctx, cases, &body_labels, l_default) {
        Some(table) => {
            ctx.code.emit(Instr::Switch(Box::new(table)));
        }
        None => {
            // Sequential dispatch; the scrutinee stays on the stack while
            // tests run, so every entry point pops it first.
            let pre_labels: Vec<CodeLabel> =
                cases.iter().map(|_| ctx.code.new_label()).collect();
            for (i, case) in cases.iter().enumerate() {
                for test in &case.tests {
                    ctx.code.emit(Instr::Dup);
                    result = result.join(emit(ctx, *test, ResultShape::Value)?);
                    ctx.code.emit(Instr::Cmp(CmpOp::Eq));
                    ctx.code.emit(Instr::JumpIfTrue(pre_labels[i].0));
                }
            }
            ctx.code.emit(Instr::Pop);
            ctx.code.emit(Instr::Jump(l_default.0));
            for (i, _) in cases.iter().enumerate() {
                ctx.code.mark(pre_labels[i]);
                ctx.code.emit(Instr::Pop);
                ctx.code.emit(Instr::Jump(body_labels[i].0));
            }
        }
    }

    for (i, case) in cases.iter().enumerate() {
        ctx.code.mark(body_labels[i]);
        result = result.join(emit(ctx, case.body, body_shape)?);
        ctx.code.emit(Instr::Jump(l_end.0));
    }
    ctx.code.mark(l_default);
    match default {
        Some(default) => {
            result = result.join(emit(ctx, default, body_shape)?);
        }
        None => {
            if !shape.is_void() {
                if *node_ty == Ty::Unit {
                    ctx.code.emit(Instr::PushNull);
                } else {
                    ctx.code.emit(Instr::PushDefault(node_ty.clone()));
                }
            }
        }
    }
    ctx.code.mark(l_end);
    Ok(result)
}

/// Hash-table dispatch is used when every test is a constant of a type with
/// exact equality; floats and computed tests fall back to the sequential
/// chain.
fn switch_table(
    ctx: &EmittingContext<'_>,
    cases: &[SwitchCase],
    body_labels: &[CodeLabel],
    default: CodeLabel,
) -> Option<SwitchTable> {
    let mut buckets: FxHashMap<i32, SmallVec<[(Value, Pc); 1]>> = FxHashMap::default();
    for (i, case) in cases.iter().enumerate() {
        for test in &case.tests {
            let NodeKind::Constant(value) = ctx.tree.kind(*test) else {
                return None;
            };
            match value {
                // Null scrutinees are routed before the table runs.
                Value::Null => continue,
                Value::Bool(_) | Value::I32(_) | Value::I64(_) | Value::Str(_) => {
                    buckets
                        .entry(hash::value_code(value))
                        .or_default()
                        .push((value.clone(), body_labels[i].0));
                }
                _ => return None,
            }
        }
    }
    if buckets.is_empty() {
        return None;
    }
    Some(SwitchTable {
        buckets,
        default: default.0,
    })
}

fn emit_try(
    ctx: &mut EmittingContext<'_>,
    body: NodeId,
    handlers: &[CatchHandler],
    finally: Option<NodeId>,
    fault: Option<NodeId>,
    node_ty: &Ty,
    shape: ResultShape,
) -> Result<EmitResult, CompileError> {
    let result_slot = if !shape.is_void() && *node_ty != Ty::Unit {
        Some(ctx.acquire_local(node_ty.clone()))
    } else {
        None
    };
    let body_shape = if result_slot.is_some() {
        ResultShape::Value
    } else {
        ResultShape::Void
    };
    let l_after = ctx.code.new_label();
    let outer_start = ctx.code.new_label();
    let outer_end = ctx.code.new_label();
    let inner_start = ctx.code.new_label();
    let inner_end = ctx.code.new_label();

    ctx.code.mark(outer_start);
    ctx.code.mark(inner_start);
    let mut result = emit(ctx, body, body_shape)?;
    if let Some(slot) = &result_slot {
        ctx.code.emit(Instr::StoreLocal(slot.slot()));
    }
    ctx.code.emit(Instr::Leave(l_after.0));
    ctx.code.mark(inner_end);

    if !handlers.is_empty() {
        let mut specs = Vec::with_capacity(handlers.len());
        let mut var_holders = Vec::new();
        for handler in handlers {
            let target = ctx.code.new_label();
            ctx.code.mark(target);
            let var_slot = match handler.var {
                Some(var) => {
                    let holder = ctx.acquire_local(ctx.tree.ty(var).clone());
                    let slot = holder.slot();
                    ctx.var_locals.insert(var, slot);
                    var_holders.push((var, holder));
                    Some(slot)
                }
                None => None,
            };
            ctx.catch_depth += 1;
            let handled = emit(ctx, handler.body, body_shape)?;
            ctx.catch_depth -= 1;
            if let Some(slot) = &result_slot {
                ctx.code.emit(Instr::StoreLocal(slot.slot()));
            }
            ctx.code.emit(Instr::Leave(l_after.0));
            let target_end = ctx.code.new_label();
            ctx.code.mark(target_end);
            specs.push(HandlerSpec {
                filter: handler.filter,
                var: var_slot,
                target: target.0,
                target_end: target_end.0,
            });
            result = result.join(handled);
        }
        for (var, _holder) in var_holders {
            ctx.var_locals.remove(&var);
        }
        ctx.code.add_region(Region {
            start: inner_start.0,
            end: inner_end.0,
            kind: RegionKind::Catch(specs),
        });
    }
    ctx.code.mark(outer_end);

    if let Some(finally) = finally {
        let handler = ctx.code.new_label();
        let handler_end = ctx.code.new_label();
        ctx.code.mark(handler);
        result = result.join(emit(ctx, finally, ResultShape::Void)?);
        ctx.code.emit(Instr::EndFinally);
        ctx.code.mark(handler_end);
        ctx.code.add_region(Region {
            start: outer_start.0,
            end: outer_end.0,
            kind: RegionKind::Finally {
                handler: handler.0,
                handler_end: handler_end.0,
            },
        });
    }
    if let Some(fault) = fault {
        let handler = ctx.code.new_label();
        let handler_end = ctx.code.new_label();
        ctx.code.mark(handler);
        result = result.join(emit(ctx, fault, ResultShape::Void)?);
        ctx.code.emit(Instr::EndFinally);
        ctx.code.mark(handler_end);
        ctx.code.add_region(Region {
            start: outer_start.0,
            end: outer_end.0,
            kind: RegionKind::Fault {
                handler: handler.0,
                handler_end: handler_end.0,
            },
        });
    }

    ctx.code.mark(l_after);
    match &result_slot {
        Some(slot) => {
            ctx.code.emit(Instr::LoadLocal(slot.slot()));
        }
        None => push_unit(ctx, shape),
    }
    Ok(result)
}
