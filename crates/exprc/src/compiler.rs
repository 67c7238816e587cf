//! Lowering of resolved trees into callable routines.
//!
//! Compilation walks the lambda nest breadth-first: the root lambda is
//! lowered first, and every lambda node its body mentions is queued and
//! lowered as a sub-routine of the same nest. All routines of one nest share
//! the closure record, the hoisted-constants record and the symbol table.

use std::sync::OnceLock;

use bitflags::bitflags;
use smol_str::format_smolstr;

use crate::compiler::code::Instr;
use crate::compiler::context::{ClosureBinding, ClosureStorage, EmittingContext, ResultShape};
use crate::error::CompileError;
use crate::resolver::{self, Resolved};
use crate::routine::{registry, CompiledRoutine, RoutineInner};
use crate::shared::Shared;
use crate::symbols::Symbols;
use crate::tree::{ExprTree, NodeId, NodeKind};
use crate::types::Ty;

pub mod code;
pub mod context;
mod emit;

bitflags! {
    /// Which runtime conditions are guarded rather than left to fault.
    ///
    /// A guarded condition transfers to the routine's escape epilogue, which
    /// returns the default value of the return type; an unguarded one raises
    /// a catchable fault at the offending instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompilerOptions: u32 {
        /// Null receivers and null unwraps escape instead of faulting.
        const CHECK_NULL_REFERENCES = 1 << 0;
        /// Out-of-range element accesses escape instead of faulting.
        const CHECK_ARRAY_INDEXES = 1 << 1;
        /// Checked arithmetic escapes on overflow instead of faulting.
        const CHECK_OVERFLOW = 1 << 2;
        /// Keep source position markers in the lowered code.
        const EMIT_DEBUG_INFO = 1 << 3;

        const ALL_CHECKS = Self::CHECK_NULL_REFERENCES.bits()
            | Self::CHECK_ARRAY_INDEXES.bits()
            | Self::CHECK_OVERFLOW.bits();
    }
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self::ALL_CHECKS
    }
}

/// Lower the lambda at `root` into a directly-callable routine.
pub fn compile(
    tree: &ExprTree,
    root: NodeId,
    symbols: &Shared<Symbols>,
    options: CompilerOptions,
) -> Result<CompiledRoutine, CompileError> {
    let resolved = resolver::resolve(tree, root, symbols)?;

    // The worklist doubles as the sub-routine id space: emitting a lambda
    // node appends it here, and the position is the id `MakeClosure` carries.
    let mut worklist = vec![resolved.root];
    let mut inners: Vec<Shared<RoutineInner>> = Vec::new();
    let mut next = 0;
    while next < worklist.len() {
        let lambda = worklist[next];
        let inner = lower_lambda(&resolved, lambda, next == 0, symbols, options, &mut worklist)?;
        inners.push(Shared::new(inner));
        next += 1;
    }

    for inner in &inners {
        let _ = inner.subs.set(inners.clone());
        registry().register(inner);
    }
    Ok(CompiledRoutine::new(Shared::clone(&inners[0])))
}

fn lower_lambda(
    resolved: &Resolved,
    lambda: NodeId,
    is_root: bool,
    symbols: &Shared<Symbols>,
    options: CompilerOptions,
    worklist: &mut Vec<NodeId>,
) -> Result<RoutineInner, CompileError> {
    let syms: &Symbols = symbols;
    let NodeKind::Lambda { params, body, name } = resolved.tree.kind(lambda).clone() else {
        return Err(CompileError::Internal("compilation unit is not a lambda"));
    };
    let ret = match resolved.tree.ty(lambda) {
        Ty::Func(sig) => syms.sig(*sig).ret.clone(),
        _ => return Err(CompileError::Internal("lambda node without a function type")),
    };

    let mut ctx = EmittingContext::new(&resolved.tree, syms, options, worklist);

    // Nested routines receive the shared closure record as a hidden leading
    // argument; declared parameters shift up by one.
    let arg_base: u16 = if !is_root && resolved.closure.is_some() {
        1
    } else {
        0
    };
    for (i, param) in params.iter().enumerate() {
        ctx.args.insert(*param, arg_base + i as u16);
    }
    if let Some(plan) = &resolved.constants {
        ctx.constants_param = Some(plan.param);
    }

    let mut closure_holder = None;
    if let Some(plan) = &resolved.closure {
        let storage = if is_root {
            let holder = ctx.acquire_local(Ty::Object(plan.ty));
            let slot = holder.slot();
            closure_holder = Some(holder);
            ctx.code.emit(Instr::NewObj {
                ty: plan.ty,
                argc: 0,
            });
            ctx.code.emit(Instr::StoreLocal(slot));
            ClosureStorage::Local(slot)
        } else {
            ClosureStorage::Arg(0)
        };
        ctx.closure = Some(ClosureBinding {
            param: plan.param,
            storage,
        });
        // Captured parameters are copied into the closure at entry; their
        // uses were rewritten to closure field accesses.
        if let Some(copies) = plan.prologues.get(&lambda) {
            for (position, field_index) in copies {
                match storage {
                    ClosureStorage::Local(slot) => ctx.code.emit(Instr::LoadLocal(slot)),
                    ClosureStorage::Arg(slot) => ctx.code.emit(Instr::LoadArg(slot)),
                };
                ctx.code.emit(Instr::LoadArg(arg_base + *position));
                ctx.code.emit(Instr::StoreField(*field_index));
            }
        }
    }

    let body_ty = resolved.tree.ty(body).clone();
    let shape = if ret == Ty::Unit {
        ResultShape::Void
    } else {
        ResultShape::Value
    };
    emit::emit(&mut ctx, body, shape)?;
    if ret == Ty::Bool && body_ty == Ty::nullable(Ty::Bool) {
        // A plain-boolean routine built from a lifted body reads an absent
        // result as false.
        let l_present = ctx.code.new_label();
        ctx.code.emit(Instr::Dup);
        ctx.code.emit(Instr::JumpIfNotNull(l_present.0));
        ctx.code.emit(Instr::Pop);
        ctx.code.emit(Instr::PushBool(false));
        ctx.code.mark(l_present);
    }
    if shape.is_void() {
        ctx.code.emit(Instr::PushNull);
    }
    ctx.code.emit(Instr::Ret);

    if ctx.escape_used {
        ctx.code.mark(ctx.escape);
        ctx.code.emit(Instr::ResetStack);
        if ret == Ty::Unit {
            ctx.code.emit(Instr::PushNull);
        } else {
            ctx.code.emit(Instr::PushDefault(ret.clone()));
        }
        ctx.code.emit(Instr::Ret);
    }

    drop(closure_holder);
    let n_locals = ctx.local_count();
    let code = ctx.into_code()?;

    Ok(RoutineInner {
        name: name.unwrap_or_else(|| format_smolstr!("lambda#{}", lambda.index())),
        params: params.iter().map(|p| resolved.tree.ty(*p).clone()).collect(),
        ret,
        code,
        n_args: arg_base + params.len() as u16,
        n_locals,
        constants: resolved.constants.as_ref().map(|plan| plan.instance.clone()),
        symbols: Shared::clone(symbols),
        subs: OnceLock::new(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use rstest::rstest;
    use smallvec::smallvec;

    use super::*;
    use crate::error::{Fault, FaultKind};
    use crate::shared::shared_cell;
    use crate::tree::{BinOp, CatchFilter, CatchHandler, SwitchCase, TreeBuilder};
    use crate::value::{ArrayData, Value};

    fn counter(symbols: &Symbols, name: &str, ret: Value) -> (crate::symbols::FuncId, Shared<AtomicI32>) {
        let calls = Shared::new(AtomicI32::new(0));
        let inner = Shared::clone(&calls);
        let func = symbols.register_func(name, vec![], ret_ty(&ret), move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(ret.clone())
        });
        (func, calls)
    }

    fn ret_ty(value: &Value) -> Ty {
        match value {
            Value::Bool(_) => Ty::Bool,
            Value::I32(_) => Ty::I32,
            _ => Ty::Unit,
        }
    }

    #[test]
    fn test_add_two_parameters() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let y = b.param("y", Ty::I32);
        let sum = b.binary(BinOp::Add, x, y);
        let lambda = b.lambda(&[x, y], sum);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.params(), &[Ty::I32, Ty::I32]);
        assert_eq!(routine.ret(), &Ty::I32);
        assert_eq!(
            routine.invoke(&[Value::I32(2), Value::I32(3)]).unwrap(),
            Value::I32(5)
        );
    }

    #[rstest]
    #[case(Value::I32(4), Value::I32(5))]
    #[case(Value::Null, Value::Null)]
    fn test_lifted_add_propagates_null(#[case] arg: Value, #[case] expected: Value) {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::nullable(Ty::I32));
        let one = b.i32(1);
        let sum = b.binary(BinOp::Add, x, one);
        let lambda = b.lambda(&[x], sum);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[arg]).unwrap(), expected);
    }

    #[rstest]
    #[case(Value::I32(5), Value::I32(5))]
    #[case(Value::Null, Value::I32(0))]
    fn test_has_value_selects_branch(#[case] arg: Value, #[case] expected: Value) {
        // x => x.HasValue ? x.Value : 0
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::nullable(Ty::I32));
        let present = b.has_value(x);
        let unwrapped = b.value_of(x);
        let zero = b.i32(0);
        let cond = b.conditional(present, unwrapped, zero);
        let lambda = b.lambda(&[x], cond);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[arg]).unwrap(), expected);
    }

    #[test]
    fn test_unwrap_escapes_or_faults() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::nullable(Ty::I32));
        let unwrapped = b.value_of(x);
        let lambda = b.lambda(&[x], unwrapped);
        let tree = b.finish();

        let guarded = compile(&tree, lambda, &symbols, CompilerOptions::ALL_CHECKS).unwrap();
        assert_eq!(guarded.invoke(&[Value::Null]).unwrap(), Value::I32(0));
        assert_eq!(guarded.invoke(&[Value::I32(7)]).unwrap(), Value::I32(7));

        let unguarded = compile(&tree, lambda, &symbols, CompilerOptions::empty()).unwrap();
        assert_eq!(
            unguarded.invoke(&[Value::Null]),
            Err(Fault::NullReference)
        );
    }

    #[test]
    fn test_checked_overflow_modes() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let y = b.param("y", Ty::I32);
        let sum = b.binary(BinOp::AddChecked, x, y);
        let lambda = b.lambda(&[x, y], sum);
        let tree = b.finish();
        let args = [Value::I32(i32::MAX), Value::I32(1)];

        let escaping = compile(&tree, lambda, &symbols, CompilerOptions::ALL_CHECKS).unwrap();
        assert_eq!(escaping.invoke(&args).unwrap(), Value::I32(0));

        let faulting = compile(&tree, lambda, &symbols, CompilerOptions::empty()).unwrap();
        assert_eq!(faulting.invoke(&args), Err(Fault::Overflow));
    }

    #[test]
    fn test_unchecked_add_wraps() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let one = b.i32(1);
        let sum = b.binary(BinOp::Add, x, one);
        let lambda = b.lambda(&[x], sum);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(
            routine.invoke(&[Value::I32(i32::MAX)]).unwrap(),
            Value::I32(i32::MIN)
        );
    }

    #[test]
    fn test_and_also_skips_right_on_false() {
        let symbols = Shared::new(Symbols::new());
        let (tick, calls) = counter(&symbols, "tick", Value::Bool(true));
        let mut b = TreeBuilder::new(&symbols);
        let lhs = b.bool(false);
        let rhs = b.call(tick, None, &[]);
        let and = b.binary(BinOp::AndAlso, lhs, rhs);
        let lambda = b.lambda(&[], and);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[]).unwrap(), Value::Bool(false));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_or_else_skips_right_on_true() {
        let symbols = Shared::new(Symbols::new());
        let (tick, calls) = counter(&symbols, "tick", Value::Bool(false));
        let mut b = TreeBuilder::new(&symbols);
        let lhs = b.bool(true);
        let rhs = b.call(tick, None, &[]);
        let or = b.binary(BinOp::OrElse, lhs, rhs);
        let lambda = b.lambda(&[], or);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[]).unwrap(), Value::Bool(true));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    #[case(Value::Bool(false), Value::Bool(false))]
    #[case(Value::Bool(true), Value::Null)]
    #[case(Value::Null, Value::Null)]
    fn test_and_also_kleene_with_null(#[case] right: Value, #[case] expected: Value) {
        // null && false is false; null && true and null && null stay null.
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let lhs = b.null(Ty::nullable(Ty::Bool));
        let rhs = b.constant(right, Ty::nullable(Ty::Bool));
        let and = b.binary(BinOp::AndAlso, lhs, rhs);
        let lambda = b.lambda(&[], and);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[]).unwrap(), expected);
    }

    #[rstest]
    #[case(Value::Null, Value::I32(42))]
    #[case(Value::I32(7), Value::I32(7))]
    fn test_coalesce(#[case] arg: Value, #[case] expected: Value) {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::nullable(Ty::I32));
        let fallback = b.i32(42);
        let coalesced = b.binary(BinOp::Coalesce, x, fallback);
        let lambda = b.lambda(&[x], coalesced);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[arg]).unwrap(), expected);
    }

    #[test]
    fn test_block_variables_and_compound_assign() {
        // x => { var acc; acc = x; acc += acc; acc }
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let acc = b.var("acc", Ty::I32);
        let init = b.assign(acc, x);
        let double = b.op_assign(BinOp::Add, acc, acc);
        let body = b.block(&[acc], &[init, double, acc]);
        let lambda = b.lambda(&[x], body);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::I32(21)]).unwrap(), Value::I32(42));
    }

    #[test]
    fn test_compound_assign_evaluates_target_once() {
        // arr[idx()] += 1 must call idx exactly once.
        let symbols = Shared::new(Symbols::new());
        let (idx, calls) = counter(&symbols, "idx", Value::I32(0));
        let mut b = TreeBuilder::new(&symbols);
        let arr = b.param("arr", Ty::array(Ty::I32));
        let key = b.call(idx, None, &[]);
        let target = b.array_index(arr, &[key]);
        let one = b.i32(1);
        let bump = b.op_assign(BinOp::Add, target, one);
        let zero = b.i32(0);
        let read_back = b.array_index(arr, &[zero]);
        let body = b.block(&[], &[bump, read_back]);
        let lambda = b.lambda(&[arr], body);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();

        let data = shared_cell(ArrayData::from_items(Ty::I32, vec![Value::I32(10)]));
        let result = routine.invoke(&[Value::Array(Shared::clone(&data))]).unwrap();
        assert_eq!(result, Value::I32(11));
        assert_eq!(data.read().items[0], Value::I32(11));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_array_bounds_modes() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let arr = b.param("arr", Ty::array(Ty::I32));
        let i = b.param("i", Ty::I32);
        let elem = b.array_index(arr, &[i]);
        let lambda = b.lambda(&[arr, i], elem);
        let tree = b.finish();
        let data = || {
            Value::Array(shared_cell(ArrayData::from_items(
                Ty::I32,
                vec![Value::I32(4), Value::I32(5)],
            )))
        };

        let guarded = compile(&tree, lambda, &symbols, CompilerOptions::ALL_CHECKS).unwrap();
        assert_eq!(
            guarded.invoke(&[data(), Value::I32(1)]).unwrap(),
            Value::I32(5)
        );
        assert_eq!(guarded.invoke(&[data(), Value::I32(9)]).unwrap(), Value::I32(0));

        let unguarded = compile(&tree, lambda, &symbols, CompilerOptions::empty()).unwrap();
        assert_eq!(
            unguarded.invoke(&[data(), Value::I32(9)]),
            Err(Fault::IndexOutOfBounds(9))
        );
    }

    fn switch_over_i32(symbols: &Shared<Symbols>) -> (ExprTree, NodeId) {
        let mut b = TreeBuilder::new(symbols);
        let x = b.param("x", Ty::I32);
        let mut cases = Vec::new();
        for (n, label) in [(1, "one"), (2, "two"), (3, "three"), (4, "four"), (5, "five")] {
            let test = b.i32(n);
            let body = b.str(label);
            cases.push(SwitchCase {
                tests: smallvec![test],
                body,
            });
        }
        let fallback = b.str("other");
        let switch = b.switch(x, cases, Some(fallback));
        let lambda = b.lambda(&[x], switch);
        (b.finish(), lambda)
    }

    #[rstest]
    #[case(1, "one")]
    #[case(3, "three")]
    #[case(5, "five")]
    #[case(99, "other")]
    fn test_switch_constant_dispatch(#[case] arg: i32, #[case] expected: &str) {
        let symbols = Shared::new(Symbols::new());
        let (tree, lambda) = switch_over_i32(&symbols);
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::I32(arg)]).unwrap(), Value::from(expected));
    }

    #[test]
    fn test_switch_constant_dispatch_is_a_table() {
        let symbols = Shared::new(Symbols::new());
        let (tree, lambda) = switch_over_i32(&symbols);
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert!(routine.listing().contains("switch ["));
    }

    #[rstest]
    #[case(0.5, "half")]
    #[case(0.25, "quarter")]
    #[case(0.75, "other")]
    fn test_switch_float_tests_use_sequential_dispatch(#[case] arg: f64, #[case] expected: &str) {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::F64);
        let half_test = b.f64(0.5);
        let half_body = b.str("half");
        let quarter_test = b.f64(0.25);
        let quarter_body = b.str("quarter");
        let cases = vec![
            SwitchCase {
                tests: smallvec![half_test],
                body: half_body,
            },
            SwitchCase {
                tests: smallvec![quarter_test],
                body: quarter_body,
            },
        ];
        let fallback = b.str("other");
        let switch = b.switch(x, cases, Some(fallback));
        let lambda = b.lambda(&[x], switch);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert!(!routine.listing().contains("switch ["));
        assert_eq!(routine.invoke(&[Value::F64(arg)]).unwrap(), Value::from(expected));
    }

    #[rstest]
    #[case(Value::Null, "none")]
    #[case(Value::I32(1), "one")]
    #[case(Value::I32(2), "other")]
    fn test_switch_null_scrutinee_routed_to_null_case(
        #[case] arg: Value,
        #[case] expected: &str,
    ) {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::nullable(Ty::I32));
        let null_test = b.null(Ty::nullable(Ty::I32));
        let null_body = b.str("none");
        let one_test = b.i32(1);
        let one_body = b.str("one");
        let cases = vec![
            SwitchCase {
                tests: smallvec![null_test],
                body: null_body,
            },
            SwitchCase {
                tests: smallvec![one_test],
                body: one_body,
            },
        ];
        let fallback = b.str("other");
        let switch = b.switch(x, cases, Some(fallback));
        let lambda = b.lambda(&[x], switch);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[arg]).unwrap(), Value::from(expected));
    }

    #[test]
    fn test_finally_runs_on_both_paths() {
        // x => try { if x throw "boom" else 1 } catch { 0 } finally { tick() }
        let symbols = Shared::new(Symbols::new());
        let (tick, calls) = counter(&symbols, "tick", Value::Null);
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::Bool);
        let boom = b.str("boom");
        let thrown = b.throw(boom);
        let dead = b.i32(0);
        let then = b.block(&[], &[thrown, dead]);
        let otherwise = b.i32(1);
        let body = b.conditional(x, then, otherwise);
        let caught = b.i32(0);
        let cleanup = b.call(tick, None, &[]);
        let guarded = b.try_(
            body,
            vec![CatchHandler {
                filter: CatchFilter::Any,
                var: None,
                body: caught,
            }],
            Some(cleanup),
        );
        let lambda = b.lambda(&[x], guarded);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();

        assert_eq!(routine.invoke(&[Value::Bool(false)]).unwrap(), Value::I32(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(routine.invoke(&[Value::Bool(true)]).unwrap(), Value::I32(0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    #[case(BinOp::Eq, Value::I32(4), Value::I32(4), Value::Bool(true))]
    #[case(BinOp::Eq, Value::I32(4), Value::I32(5), Value::Bool(false))]
    #[case(BinOp::Eq, Value::Null, Value::I32(4), Value::Null)]
    #[case(BinOp::Eq, Value::Null, Value::Null, Value::Null)]
    #[case(BinOp::Ne, Value::Null, Value::Null, Value::Null)]
    #[case(BinOp::Lt, Value::I32(3), Value::I32(4), Value::Bool(true))]
    #[case(BinOp::Lt, Value::I32(3), Value::Null, Value::Null)]
    #[case(BinOp::Ge, Value::Null, Value::I32(4), Value::Null)]
    fn test_lifted_comparison_with_absent_operand(
        #[case] op: BinOp,
        #[case] left: Value,
        #[case] right: Value,
        #[case] expected: Value,
    ) {
        // Absent operands make the comparison itself absent, even null == null.
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::nullable(Ty::I32));
        let y = b.param("y", Ty::nullable(Ty::I32));
        let cmp = b.binary(op, x, y);
        let lambda = b.lambda(&[x, y], cmp);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[left, right]).unwrap(), expected);
    }

    #[test]
    fn test_escape_inside_try_runs_finally() {
        // x => try { x.Value } finally { tick() }, guarded: the failed null
        // check leaves for the default-returning epilogue through the finally.
        let symbols = Shared::new(Symbols::new());
        let (tick, calls) = counter(&symbols, "tick", Value::Null);
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::nullable(Ty::I32));
        let unwrapped = b.value_of(x);
        let cleanup = b.call(tick, None, &[]);
        let guarded = b.try_(unwrapped, vec![], Some(cleanup));
        let lambda = b.lambda(&[x], guarded);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::ALL_CHECKS).unwrap();

        assert_eq!(routine.invoke(&[Value::I32(7)]).unwrap(), Value::I32(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(routine.invoke(&[Value::Null]).unwrap(), Value::I32(0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fault_handler_runs_only_on_unwind() {
        let symbols = Shared::new(Symbols::new());
        let (tick, calls) = counter(&symbols, "tick", Value::Null);
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::Bool);
        let boom = b.str("boom");
        let thrown = b.throw(boom);
        let dead = b.i32(0);
        let then = b.block(&[], &[thrown, dead]);
        let otherwise = b.i32(1);
        let body = b.conditional(x, then, otherwise);
        let on_fault = b.call(tick, None, &[]);
        let guarded = b.try_fault(body, on_fault);
        let lambda = b.lambda(&[x], guarded);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();

        assert_eq!(routine.invoke(&[Value::Bool(false)]).unwrap(), Value::I32(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // The handler observes the unwind but does not consume it.
        assert_eq!(
            routine.invoke(&[Value::Bool(true)]),
            Err(Fault::Uncaught(Value::from("boom")))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_catch_matches_thrown_exception_type() {
        let symbols = Shared::new(Symbols::new());
        let err_ty = symbols.register_exception("ParseError", &[("code", Ty::I32)]);
        let code_field = symbols.field(err_ty, "code").unwrap();
        let mut b = TreeBuilder::new(&symbols);
        let code = b.i32(42);
        let exc = b.new_obj(err_ty, &[code]);
        let thrown = b.throw(exc);
        let dead = b.i32(0);
        let body = b.block(&[], &[thrown, dead]);
        let e = b.var("e", Ty::Object(err_ty));
        let handler_body = b.member(e, code_field);
        let fallback = b.i32(-1);
        let guarded = b.try_(
            body,
            vec![
                CatchHandler {
                    filter: CatchFilter::Type(err_ty),
                    var: Some(e),
                    body: handler_body,
                },
                CatchHandler {
                    filter: CatchFilter::Any,
                    var: None,
                    body: fallback,
                },
            ],
            None,
        );
        let lambda = b.lambda(&[], guarded);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[]).unwrap(), Value::I32(42));
    }

    #[rstest]
    #[case(Value::I32(6), Value::I32(3), Value::I32(2))]
    #[case(Value::I32(1), Value::I32(0), Value::I32(-1))]
    fn test_catch_by_fault_kind(#[case] x: Value, #[case] y: Value, #[case] expected: Value) {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x_param = b.param("x", Ty::I32);
        let y_param = b.param("y", Ty::I32);
        let quotient = b.binary(BinOp::Div, x_param, y_param);
        let message = b.var("message", Ty::Str);
        let fallback = b.i32(-1);
        let guarded = b.try_(
            quotient,
            vec![CatchHandler {
                filter: CatchFilter::Fault(FaultKind::DivisionByZero),
                var: Some(message),
                body: fallback,
            }],
            None,
        );
        let lambda = b.lambda(&[x_param, y_param], guarded);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[x, y]).unwrap(), expected);
    }

    #[test]
    fn test_rethrow_propagates_original() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let boom = b.str("boom");
        let thrown = b.throw(boom);
        let dead = b.i32(0);
        let body = b.block(&[], &[thrown, dead]);
        let again = b.rethrow();
        let dead2 = b.i32(1);
        let handler_body = b.block(&[], &[again, dead2]);
        let guarded = b.try_(
            body,
            vec![CatchHandler {
                filter: CatchFilter::Any,
                var: None,
                body: handler_body,
            }],
            None,
        );
        let lambda = b.lambda(&[], guarded);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(
            routine.invoke(&[]),
            Err(Fault::Uncaught(Value::from("boom")))
        );
    }

    #[test]
    fn test_rethrow_after_inner_catch_rethrows_outer() {
        // try { throw "outer" }
        // catch { try { throw "inner" } catch { 0 }; rethrow }
        // The swallowed inner exception must not shadow the outer one.
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let outer_msg = b.str("outer");
        let outer_throw = b.throw(outer_msg);
        let dead = b.i32(0);
        let body = b.block(&[], &[outer_throw, dead]);

        let inner_msg = b.str("inner");
        let inner_throw = b.throw(inner_msg);
        let inner_dead = b.i32(0);
        let inner_body = b.block(&[], &[inner_throw, inner_dead]);
        let swallowed = b.i32(0);
        let inner_try = b.try_(
            inner_body,
            vec![CatchHandler {
                filter: CatchFilter::Any,
                var: None,
                body: swallowed,
            }],
            None,
        );

        let again = b.rethrow();
        let dead2 = b.i32(1);
        let handler_body = b.block(&[], &[inner_try, again, dead2]);
        let guarded = b.try_(
            body,
            vec![CatchHandler {
                filter: CatchFilter::Any,
                var: None,
                body: handler_body,
            }],
            None,
        );
        let lambda = b.lambda(&[], guarded);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(
            routine.invoke(&[]),
            Err(Fault::Uncaught(Value::from("outer")))
        );
    }

    #[test]
    fn test_goto_carries_value_to_label() {
        // x => { if x goto end(5); end: 1 }
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::Bool);
        let end = b.fresh_label();
        let five = b.i32(5);
        let jump = b.goto(end, Some(five));
        let skip = b.empty();
        let maybe_jump = b.conditional(x, jump, skip);
        let one = b.i32(1);
        let landing = b.label(end, Ty::I32, Some(one));
        let body = b.block(&[], &[maybe_jump, landing]);
        let lambda = b.lambda(&[x], body);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::Bool(true)]).unwrap(), Value::I32(5));
        assert_eq!(routine.invoke(&[Value::Bool(false)]).unwrap(), Value::I32(1));
    }

    #[test]
    fn test_goto_out_of_try_runs_finally() {
        let symbols = Shared::new(Symbols::new());
        let (tick, calls) = counter(&symbols, "tick", Value::Null);
        let mut b = TreeBuilder::new(&symbols);
        let end = b.fresh_label();
        let two = b.i32(2);
        let jump = b.goto(end, Some(two));
        let dead = b.i32(0);
        let body = b.block(&[], &[jump, dead]);
        let cleanup = b.call(tick, None, &[]);
        let guarded = b.try_(body, vec![], Some(cleanup));
        let zero = b.i32(0);
        let landing = b.label(end, Ty::I32, Some(zero));
        let outer = b.block(&[], &[guarded, landing]);
        let lambda = b.lambda(&[], outer);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[]).unwrap(), Value::I32(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loop_with_break() {
        // n => { var i; var acc; loop { if i < n { acc += i; i += 1 } else break }; acc }
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let n = b.param("n", Ty::I32);
        let i = b.var("i", Ty::I32);
        let acc = b.var("acc", Ty::I32);
        let brk = b.fresh_label();
        let test = b.binary(BinOp::Lt, i, n);
        let add = b.op_assign(BinOp::Add, acc, i);
        let one = b.i32(1);
        let inc = b.op_assign(BinOp::Add, i, one);
        let step = b.block(&[], &[add, inc]);
        let stop = b.break_(brk);
        let iteration = b.conditional(test, step, stop);
        let looped = b.loop_(iteration, Some(brk), None);
        let body = b.block(&[i, acc], &[looped, acc]);
        let lambda = b.lambda(&[n], body);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::I32(5)]).unwrap(), Value::I32(10));
        assert_eq!(routine.invoke(&[Value::I32(0)]).unwrap(), Value::I32(0));
    }

    #[test]
    fn test_nested_lambda_captures_parameter() {
        // x => ((y => x + y))(10)
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let y = b.param("y", Ty::I32);
        let sum = b.binary(BinOp::Add, x, y);
        let inner = b.lambda(&[y], sum);
        let ten = b.i32(10);
        let applied = b.invoke(inner, &[ten]);
        let outer = b.lambda(&[x], applied);
        let tree = b.finish();
        let routine = compile(&tree, outer, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::I32(5)]).unwrap(), Value::I32(15));
    }

    #[test]
    fn test_nested_lambda_writes_captured_variable() {
        // x => { (y => x = y)(9); x }
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let y = b.param("y", Ty::I32);
        let write = b.assign(x, y);
        let inner = b.lambda(&[y], write);
        let nine = b.i32(9);
        let applied = b.invoke(inner, &[nine]);
        let body = b.block(&[], &[applied, x]);
        let outer = b.lambda(&[x], body);
        let tree = b.finish();
        let routine = compile(&tree, outer, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::I32(1)]).unwrap(), Value::I32(9));
    }

    #[test]
    fn test_invoke_with_wrong_arity_faults() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let y = b.param("y", Ty::I32);
        let inner = b.lambda(&[y], y);
        let applied = b.invoke(inner, &[]);
        let outer = b.lambda(&[], applied);
        let tree = b.finish();
        let routine = compile(&tree, outer, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(
            routine.invoke(&[]),
            Err(Fault::ArityMismatch {
                expected: 1,
                got: 0
            })
        );
    }

    #[test]
    fn test_hoisted_constant_array() {
        let symbols = Shared::new(Symbols::new());
        let table = Value::Array(shared_cell(ArrayData::from_items(
            Ty::I32,
            vec![Value::I32(10), Value::I32(20), Value::I32(30)],
        )));
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let lookup = b.constant(table, Ty::array(Ty::I32));
        let elem = b.array_index(lookup, &[x]);
        let lambda = b.lambda(&[x], elem);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::I32(1)]).unwrap(), Value::I32(20));
        assert!(routine.listing().contains("push.constants"));
    }

    #[test]
    fn test_static_field_round_trip() {
        let symbols = Shared::new(Symbols::new());
        let slot = symbols.register_static("seen", Ty::I32, Value::I32(0));
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let target = b.static_member(slot);
        let store = b.assign(target, x);
        let load = b.static_member(slot);
        let body = b.block(&[], &[store, load]);
        let lambda = b.lambda(&[x], body);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::I32(9)]).unwrap(), Value::I32(9));
        assert_eq!(symbols.load_static(slot), Value::I32(9));
    }

    #[test]
    fn test_numeric_conversions() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::F64);
        let narrowed = b.convert(x, Ty::I32);
        let lambda = b.lambda(&[x], narrowed);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::F64(3.9)]).unwrap(), Value::I32(3));
    }

    #[test]
    fn test_checked_conversion_overflow_modes() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::F64);
        let narrowed = b.convert_checked(x, Ty::I32);
        let lambda = b.lambda(&[x], narrowed);
        let tree = b.finish();
        let huge = [Value::F64(1e18)];

        let escaping = compile(&tree, lambda, &symbols, CompilerOptions::ALL_CHECKS).unwrap();
        assert_eq!(escaping.invoke(&huge).unwrap(), Value::I32(0));

        let faulting = compile(&tree, lambda, &symbols, CompilerOptions::empty()).unwrap();
        assert_eq!(faulting.invoke(&huge), Err(Fault::Overflow));
    }

    #[test]
    fn test_host_call_with_receiver() {
        let symbols = Shared::new(Symbols::new());
        let strlen = symbols.register_func("strlen", vec![Ty::Str], Ty::I32, |args| {
            match &args[0] {
                Value::Str(s) => Ok(Value::I32(s.len() as i32)),
                other => Err(Fault::InvalidConversion(other.kind_name())),
            }
        });
        let mut b = TreeBuilder::new(&symbols);
        let s = b.param("s", Ty::Str);
        let len = b.call(strlen, Some(s), &[]);
        let lambda = b.lambda(&[s], len);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.invoke(&[Value::from("abc")]).unwrap(), Value::I32(3));
    }

    #[test]
    fn test_debug_markers_follow_the_option() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let marker = b.debug_info(3, 7);
        let body = b.block(&[], &[marker, x]);
        let lambda = b.lambda(&[x], body);
        let tree = b.finish();

        let with = compile(
            &tree,
            lambda,
            &symbols,
            CompilerOptions::ALL_CHECKS | CompilerOptions::EMIT_DEBUG_INFO,
        )
        .unwrap();
        assert!(with.listing().contains("debug 3:7"));
        assert_eq!(with.invoke(&[Value::I32(1)]).unwrap(), Value::I32(1));

        let without = compile(&tree, lambda, &symbols, CompilerOptions::ALL_CHECKS).unwrap();
        assert!(!without.listing().contains("debug"));
    }

    #[test]
    fn test_runtime_variables_is_rejected() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let x = b.param("x", Ty::I32);
        let vars = b.runtime_variables(&[x]);
        let body = b.block(&[], &[vars, x]);
        let lambda = b.lambda(&[x], body);
        let tree = b.finish();
        assert_eq!(
            compile(&tree, lambda, &symbols, CompilerOptions::default()).err(),
            Some(CompileError::NotSupportedNodeKind("RuntimeVariables"))
        );
    }

    #[test]
    fn test_break_without_enclosing_loop_is_rejected() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let orphan = b.fresh_label();
        let stop = b.break_(orphan);
        let lambda = b.lambda_with_ret(&[], stop, Ty::Unit);
        let tree = b.finish();
        assert_eq!(
            compile(&tree, lambda, &symbols, CompilerOptions::default()).err(),
            Some(CompileError::OrphanLoopJump)
        );
    }

    #[test]
    fn test_rethrow_outside_catch_is_rejected() {
        let symbols = Shared::new(Symbols::new());
        let mut b = TreeBuilder::new(&symbols);
        let again = b.rethrow();
        let lambda = b.lambda_with_ret(&[], again, Ty::Unit);
        let tree = b.finish();
        assert_eq!(
            compile(&tree, lambda, &symbols, CompilerOptions::default()).err(),
            Some(CompileError::RethrowOutsideCatch)
        );
    }

    #[test]
    fn test_unit_routine_returns_null() {
        let symbols = Shared::new(Symbols::new());
        let (tick, calls) = counter(&symbols, "tick", Value::Null);
        let mut b = TreeBuilder::new(&symbols);
        let effect = b.call(tick, None, &[]);
        let body = b.block(&[], &[effect]);
        let lambda = b.lambda_with_ret(&[], body, Ty::Unit);
        let tree = b.finish();
        let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
        assert_eq!(routine.ret(), &Ty::Unit);
        assert_eq!(routine.invoke(&[]).unwrap(), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
