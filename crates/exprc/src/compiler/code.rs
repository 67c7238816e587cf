use std::fmt;
use std::fmt::Write as _;

use itertools::Itertools;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::error::CompileError;
use crate::symbols::{FuncId, StaticId, TypeId};
use crate::tree::CatchFilter;
use crate::types::Ty;
use crate::value::Value;

/// Instruction offset within one routine.
pub type Pc = u32;

/// Forward-referencable code position. Jump operands hold the label id while
/// code is being laid out; [`CodeBuilder::finish`] rewrites them to pcs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLabel(pub(crate) u32);

/// How a runtime check reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Jump to the routine's escape epilogue: reset the stack, return the
    /// default value of the return type.
    Escape,
    /// Raise a catchable fault.
    Fault,
}

/// Overflow policy of an arithmetic instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checked {
    /// Two's-complement wraparound.
    Wrap,
    /// Overflow escapes to the epilogue.
    Escape,
    /// Overflow raises a fault.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumTy {
    I32,
    I64,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntTy {
    I32,
    I64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Hash-bucketed dispatch table for switches over constant tests.
///
/// Buckets are keyed by the same structural value code the fingerprint
/// calculator uses, so compile-time keys match what the interpreter computes
/// from the scrutinee. Each bucket entry is confirmed by equality before the
/// jump is taken.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchTable {
    pub buckets: FxHashMap<i32, SmallVec<[(Value, Pc); 1]>>,
    pub default: Pc,
}

/// One catch clause of a protected region, matched in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    pub filter: CatchFilter,
    /// Local slot the caught exception is bound to on entry.
    pub var: Option<u16>,
    pub target: Pc,
    /// One past the handler body, so the interpreter can retire the caught
    /// exception when control leaves `target..target_end`.
    pub target_end: Pc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegionKind {
    Catch(Vec<HandlerSpec>),
    Finally { handler: Pc, handler_end: Pc },
    Fault { handler: Pc, handler_end: Pc },
}

/// A protected `[start, end)` span of instructions. The region table is
/// ordered innermost-first, so a scan for the first region containing a pc
/// finds the tightest enclosing one.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub start: Pc,
    pub end: Pc,
    pub kind: RegionKind,
}

impl Region {
    pub fn contains(&self, pc: Pc) -> bool {
        self.start <= pc && pc < self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    PushNull,
    PushBool(bool),
    PushI32(i32),
    PushI64(i64),
    PushF64(f64),
    PushStr(SmolStr),
    PushDefault(Ty),
    /// Push the routine's hoisted-constants record.
    PushConstants,
    Dup,
    Pop,

    LoadArg(u16),
    StoreArg(u16),
    LoadLocal(u16),
    StoreLocal(u16),
    LoadArgRef(u16),
    LoadLocalRef(u16),
    /// Pop a reference, push the value it designates.
    LoadRef,
    /// Pop a value, then a reference, and store through it.
    StoreRef,

    NewObj { ty: TypeId, argc: u8 },
    LoadField(u16),
    StoreField(u16),
    LoadFieldRef(u16),
    LoadStatic(StaticId),
    StoreStatic(StaticId),
    LoadStaticRef(StaticId),

    NewArray { elem: Ty, rank: u8 },
    NewArrayInit { elem: Ty, len: u16 },
    LoadElem { rank: u8, guard: Guard },
    StoreElem { rank: u8, guard: Guard },
    LoadElemRef { rank: u8, guard: Guard },
    /// Pop a value, then an array, and append; pushes the array back.
    AppendElem,
    ArrayLen,

    LoadEntry,
    StoreEntry,
    LoadEntryRef,

    Add(NumTy, Checked),
    Sub(NumTy, Checked),
    Mul(NumTy, Checked),
    Div(NumTy),
    Rem(NumTy),
    Neg(NumTy, Checked),
    BitAnd(IntTy),
    BitOr(IntTy),
    BitXor(IntTy),
    Shl(IntTy),
    Shr(IntTy),
    BitNot(IntTy),
    Cmp(CmpOp),
    /// Three-valued logical not: null stays null.
    Not,
    /// Kleene conjunction of the two topmost (possibly null) booleans.
    And3,
    /// Kleene disjunction.
    Or3,
    IsNull,
    /// Fault with a null-reference if the top of the stack is null; the
    /// value stays put otherwise.
    NullCheck,
    Convert { to: NumTy, checked: Checked },

    Jump(Pc),
    /// Pops; jumps only when the value is boolean true.
    JumpIfTrue(Pc),
    /// Pops; jumps only when the value is boolean false (not on null).
    JumpIfFalse(Pc),
    JumpIfNull(Pc),
    JumpIfNotNull(Pc),
    Switch(Box<SwitchTable>),

    /// Exit one or more protected regions toward a target, running every
    /// finally block in between.
    Leave(Pc),
    /// End of a finally/fault handler: resume the suspended leave or unwind.
    EndFinally,
    Throw,
    Rethrow,

    CallHost { func: FuncId, argc: u8 },
    /// Bind a sub-routine into an invocable value, capturing the closure
    /// record below the top of the stack when `binds` is set.
    MakeClosure { sub: u32, binds: bool },
    Invoke { argc: u8 },

    /// Drop every operand; prefix of the escape epilogue.
    ResetStack,
    Ret,
    DebugMark { line: u32, column: u32 },
}

impl Instr {
    fn patch_targets(&mut self, resolve: &dyn Fn(Pc) -> Result<Pc, CompileError>) -> Result<(), CompileError> {
        match self {
            Instr::Jump(t)
            | Instr::JumpIfTrue(t)
            | Instr::JumpIfFalse(t)
            | Instr::JumpIfNull(t)
            | Instr::JumpIfNotNull(t)
            | Instr::Leave(t) => {
                *t = resolve(*t)?;
            }
            Instr::Switch(table) => {
                table.default = resolve(table.default)?;
                for bucket in table.buckets.values_mut() {
                    for (_, target) in bucket.iter_mut() {
                        *target = resolve(*target)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Finished routine body: instructions plus the protected-region table.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub instrs: Vec<Instr>,
    pub regions: Vec<Region>,
    /// Target of guarded checks compiled in escape mode.
    pub escape_pc: Option<Pc>,
}

/// Accumulates instructions with symbolic jump targets.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    instrs: Vec<Instr>,
    labels: Vec<Option<Pc>>,
    regions: Vec<Region>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, instr: Instr) -> Pc {
        let pc = self.instrs.len() as Pc;
        self.instrs.push(instr);
        pc
    }

    pub fn pc(&self) -> Pc {
        self.instrs.len() as Pc
    }

    pub fn new_label(&mut self) -> CodeLabel {
        self.labels.push(None);
        CodeLabel(self.labels.len() as u32 - 1)
    }

    /// Pin a label to the current pc.
    pub fn mark(&mut self, label: CodeLabel) {
        debug_assert!(self.labels[label.0 as usize].is_none());
        self.labels[label.0 as usize] = Some(self.pc());
    }

    /// Register a protected region; all pcs inside are still label ids.
    /// Regions close innermost-first, which is the scan order the
    /// interpreter relies on.
    pub fn add_region(&mut self, region: Region) {
        self.regions.push(region);
    }

    pub fn finish(mut self, escape: Option<CodeLabel>) -> Result<Code, CompileError> {
        let labels = std::mem::take(&mut self.labels);
        let resolve = |id: Pc| -> Result<Pc, CompileError> {
            labels
                .get(id as usize)
                .copied()
                .flatten()
                .ok_or(CompileError::UnknownLabel(id))
        };
        for instr in &mut self.instrs {
            instr.patch_targets(&resolve)?;
        }
        for region in &mut self.regions {
            region.start = resolve(region.start)?;
            region.end = resolve(region.end)?;
            match &mut region.kind {
                RegionKind::Catch(handlers) => {
                    for handler in handlers {
                        handler.target = resolve(handler.target)?;
                        handler.target_end = resolve(handler.target_end)?;
                    }
                }
                RegionKind::Finally {
                    handler,
                    handler_end,
                }
                | RegionKind::Fault {
                    handler,
                    handler_end,
                } => {
                    *handler = resolve(*handler)?;
                    *handler_end = resolve(*handler_end)?;
                }
            }
        }
        let escape_pc = match escape {
            Some(label) => Some(resolve(label.0)?),
            None => None,
        };
        Ok(Code {
            instrs: self.instrs,
            regions: self.regions,
            escape_pc,
        })
    }
}

impl Code {
    /// Human-readable disassembly, one instruction per line followed by the
    /// region table.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (pc, instr) in self.instrs.iter().enumerate() {
            let _ = writeln!(out, "{pc:04}: {instr}");
        }
        for region in &self.regions {
            match &region.kind {
                RegionKind::Catch(handlers) => {
                    let clauses = handlers
                        .iter()
                        .map(|h| format!("{:?} -> {:04}", h.filter, h.target))
                        .join(", ");
                    let _ = writeln!(
                        out,
                        ".try {:04}..{:04} catch [{clauses}]",
                        region.start, region.end
                    );
                }
                RegionKind::Finally { handler, .. } => {
                    let _ = writeln!(
                        out,
                        ".try {:04}..{:04} finally {:04}",
                        region.start, region.end, handler
                    );
                }
                RegionKind::Fault { handler, .. } => {
                    let _ = writeln!(
                        out,
                        ".try {:04}..{:04} fault {:04}",
                        region.start, region.end, handler
                    );
                }
            }
        }
        if let Some(escape) = self.escape_pc {
            let _ = writeln!(out, ".escape {escape:04}");
        }
        out
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::PushNull => write!(f, "push.null"),
            Instr::PushBool(v) => write!(f, "push.bool {v}"),
            Instr::PushI32(v) => write!(f, "push.i32 {v}"),
            Instr::PushI64(v) => write!(f, "push.i64 {v}"),
            Instr::PushF64(v) => write!(f, "push.f64 {v}"),
            Instr::PushStr(v) => write!(f, "push.str {v:?}"),
            Instr::PushDefault(ty) => write!(f, "push.default {ty}"),
            Instr::PushConstants => write!(f, "push.constants"),
            Instr::Dup => write!(f, "dup"),
            Instr::Pop => write!(f, "pop"),
            Instr::LoadArg(slot) => write!(f, "ldarg {slot}"),
            Instr::StoreArg(slot) => write!(f, "starg {slot}"),
            Instr::LoadLocal(slot) => write!(f, "ldloc {slot}"),
            Instr::StoreLocal(slot) => write!(f, "stloc {slot}"),
            Instr::LoadArgRef(slot) => write!(f, "ldarg.ref {slot}"),
            Instr::LoadLocalRef(slot) => write!(f, "ldloc.ref {slot}"),
            Instr::LoadRef => write!(f, "ld.ref"),
            Instr::StoreRef => write!(f, "st.ref"),
            Instr::NewObj { ty, argc } => write!(f, "newobj type#{ty} argc={argc}"),
            Instr::LoadField(index) => write!(f, "ldfld {index}"),
            Instr::StoreField(index) => write!(f, "stfld {index}"),
            Instr::LoadFieldRef(index) => write!(f, "ldfld.ref {index}"),
            Instr::LoadStatic(id) => write!(f, "ldsfld {id}"),
            Instr::StoreStatic(id) => write!(f, "stsfld {id}"),
            Instr::LoadStaticRef(id) => write!(f, "ldsfld.ref {id}"),
            Instr::NewArray { elem, rank } => write!(f, "newarr {elem} rank={rank}"),
            Instr::NewArrayInit { elem, len } => write!(f, "newarr.init {elem} len={len}"),
            Instr::LoadElem { rank, guard } => write!(f, "ldelem rank={rank} {guard:?}"),
            Instr::StoreElem { rank, guard } => write!(f, "stelem rank={rank} {guard:?}"),
            Instr::LoadElemRef { rank, guard } => write!(f, "ldelem.ref rank={rank} {guard:?}"),
            Instr::AppendElem => write!(f, "append"),
            Instr::ArrayLen => write!(f, "arraylen"),
            Instr::LoadEntry => write!(f, "ldentry"),
            Instr::StoreEntry => write!(f, "stentry"),
            Instr::LoadEntryRef => write!(f, "ldentry.ref"),
            Instr::Add(ty, checked) => write!(f, "add.{ty:?} {checked:?}"),
            Instr::Sub(ty, checked) => write!(f, "sub.{ty:?} {checked:?}"),
            Instr::Mul(ty, checked) => write!(f, "mul.{ty:?} {checked:?}"),
            Instr::Div(ty) => write!(f, "div.{ty:?}"),
            Instr::Rem(ty) => write!(f, "rem.{ty:?}"),
            Instr::Neg(ty, checked) => write!(f, "neg.{ty:?} {checked:?}"),
            Instr::BitAnd(ty) => write!(f, "and.{ty:?}"),
            Instr::BitOr(ty) => write!(f, "or.{ty:?}"),
            Instr::BitXor(ty) => write!(f, "xor.{ty:?}"),
            Instr::Shl(ty) => write!(f, "shl.{ty:?}"),
            Instr::Shr(ty) => write!(f, "shr.{ty:?}"),
            Instr::BitNot(ty) => write!(f, "not.{ty:?}"),
            Instr::Cmp(op) => write!(f, "cmp.{op:?}"),
            Instr::Not => write!(f, "not3"),
            Instr::And3 => write!(f, "and3"),
            Instr::Or3 => write!(f, "or3"),
            Instr::IsNull => write!(f, "isnull"),
            Instr::NullCheck => write!(f, "nullcheck"),
            Instr::Convert { to, checked } => write!(f, "conv.{to:?} {checked:?}"),
            Instr::Jump(t) => write!(f, "jump -> {t:04}"),
            Instr::JumpIfTrue(t) => write!(f, "jump.true -> {t:04}"),
            Instr::JumpIfFalse(t) => write!(f, "jump.false -> {t:04}"),
            Instr::JumpIfNull(t) => write!(f, "jump.null -> {t:04}"),
            Instr::JumpIfNotNull(t) => write!(f, "jump.notnull -> {t:04}"),
            Instr::Switch(table) => {
                let entries = table
                    .buckets
                    .values()
                    .flat_map(|bucket| bucket.iter())
                    .map(|(value, target)| format!("{value} -> {target:04}"))
                    .sorted()
                    .join(", ");
                write!(f, "switch [{entries}] default -> {:04}", table.default)
            }
            Instr::Leave(t) => write!(f, "leave -> {t:04}"),
            Instr::EndFinally => write!(f, "endfinally"),
            Instr::Throw => write!(f, "throw"),
            Instr::Rethrow => write!(f, "rethrow"),
            Instr::CallHost { func, argc } => write!(f, "call fn#{func} argc={argc}"),
            Instr::MakeClosure { sub, binds } => {
                write!(f, "make.closure sub#{sub} binds={binds}")
            }
            Instr::Invoke { argc } => write!(f, "invoke argc={argc}"),
            Instr::ResetStack => write!(f, "resetstack"),
            Instr::Ret => write!(f, "ret"),
            Instr::DebugMark { line, column } => write!(f, "debug {line}:{column}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve_to_pcs() {
        let mut b = CodeBuilder::new();
        let end = b.new_label();
        b.emit(Instr::PushBool(true));
        b.emit(Instr::JumpIfTrue(end.0));
        b.emit(Instr::PushI32(1));
        b.mark(end);
        b.emit(Instr::Ret);
        let code = b.finish(None).unwrap();
        assert_eq!(code.instrs[1], Instr::JumpIfTrue(3));
    }

    #[test]
    fn test_unmarked_label_is_rejected() {
        let mut b = CodeBuilder::new();
        let dangling = b.new_label();
        b.emit(Instr::Jump(dangling.0));
        assert_eq!(
            b.finish(None).err(),
            Some(CompileError::UnknownLabel(dangling.0))
        );
    }

    #[test]
    fn test_escape_label_becomes_escape_pc() {
        let mut b = CodeBuilder::new();
        let escape = b.new_label();
        b.emit(Instr::PushI32(0));
        b.emit(Instr::Ret);
        b.mark(escape);
        b.emit(Instr::ResetStack);
        b.emit(Instr::PushDefault(Ty::I32));
        b.emit(Instr::Ret);
        let code = b.finish(Some(escape)).unwrap();
        assert_eq!(code.escape_pc, Some(2));
    }

    #[test]
    fn test_region_bounds_resolve() {
        let mut b = CodeBuilder::new();
        let start = b.new_label();
        let end = b.new_label();
        let handler = b.new_label();
        let handler_end = b.new_label();
        b.mark(start);
        b.emit(Instr::PushI32(1));
        b.emit(Instr::Leave(handler_end.0));
        b.mark(end);
        b.mark(handler);
        b.emit(Instr::EndFinally);
        b.mark(handler_end);
        b.emit(Instr::Ret);
        b.add_region(Region {
            start: start.0,
            end: end.0,
            kind: RegionKind::Finally {
                handler: handler.0,
                handler_end: handler_end.0,
            },
        });
        let code = b.finish(None).unwrap();
        assert_eq!(code.regions[0].start, 0);
        assert_eq!(code.regions[0].end, 2);
        assert!(code.regions[0].contains(1));
        assert!(!code.regions[0].contains(2));
    }
}
