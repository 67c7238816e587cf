//! Stack interpreter for lowered routines.
//!
//! Each invocation gets a frame of arguments, locals and an operand stack.
//! Protected regions are handled with a pending-action stack: leaving a
//! region or unwinding an exception suspends while finally handlers run,
//! and `EndFinally` resumes whatever was suspended.

use smol_str::format_smolstr;

use crate::compiler::code::{Checked, CmpOp, Code, Instr, IntTy, NumTy, RegionKind};
use crate::error::Fault;
use crate::hash;
use crate::routine::{BoundRoutine, RoutineInner};
use crate::shared::{shared_cell, Shared};
use crate::symbols::Symbols;
use crate::tree::CatchFilter;
use crate::value::{ArrayData, Object, Place, Value};

const MAX_CALL_DEPTH: u32 = 512;

/// An in-flight exception: either a runtime fault or a thrown value.
#[derive(Debug, Clone)]
enum Thrown {
    Fault(Fault),
    Value(Value),
}

impl Thrown {
    fn into_fault(self) -> Fault {
        match self {
            Thrown::Fault(fault) => fault,
            Thrown::Value(value) => Fault::Uncaught(value),
        }
    }

    /// The value a matching catch handler binds.
    fn payload(&self) -> Value {
        match self {
            Thrown::Fault(fault) => Value::Str(format_smolstr!("{fault}")),
            Thrown::Value(value) => value.clone(),
        }
    }
}

/// An exception a catch handler is currently holding, retired when control
/// leaves the handler body `span`.
#[derive(Debug)]
struct CaughtFrame {
    span: (usize, usize),
    thrown: Thrown,
}

impl CaughtFrame {
    fn covers(&self, pc: usize) -> bool {
        self.span.0 <= pc && pc < self.span.1
    }
}

/// A suspended control transfer, parked while a finally or fault handler
/// runs. `active` is the handler span currently executing on its behalf; a
/// throw inside that span abandons the transfer.
#[derive(Debug)]
enum Pending {
    Leave {
        /// Remaining finally handlers, outermost last (popped in order).
        rest: Vec<(usize, (usize, usize))>,
        target: usize,
        active: (usize, usize),
    },
    Unwind {
        thrown: Thrown,
        throw_pc: usize,
        /// Region index to resume scanning from.
        cursor: usize,
        active: (usize, usize),
    },
}

fn matches_filter(filter: &CatchFilter, thrown: &Thrown) -> Option<Value> {
    match filter {
        CatchFilter::Any => Some(thrown.payload()),
        CatchFilter::Type(ty) => match thrown {
            Thrown::Value(Value::Obj(obj)) if obj.read().ty == *ty => {
                Some(Value::Obj(Shared::clone(obj)))
            }
            _ => None,
        },
        CatchFilter::Fault(kind) => match thrown {
            Thrown::Fault(fault) if fault.kind() == *kind => Some(thrown.payload()),
            _ => None,
        },
    }
}

/// Resume (or start) unwinding `thrown` from the region at `cursor`.
/// Returns the next pc, or the fault escaping the routine.
fn unwind(
    code: &Code,
    stack: &mut Vec<Value>,
    locals: &mut [Value],
    pending: &mut Vec<Pending>,
    caught: &mut Vec<CaughtFrame>,
    thrown: Thrown,
    throw_pc: usize,
    cursor: usize,
) -> Result<usize, Fault> {
    // A throw inside a finally or fault handler abandons the transfer that
    // handler was running for.
    while let Some(top) = pending.last() {
        let active = match top {
            Pending::Leave { active, .. } => *active,
            Pending::Unwind { active, .. } => *active,
        };
        if active.0 <= throw_pc && throw_pc < active.1 {
            pending.pop();
        } else {
            break;
        }
    }

    let mut idx = cursor;
    while idx < code.regions.len() {
        let region = &code.regions[idx];
        if !region.contains(throw_pc as u32) {
            idx += 1;
            continue;
        }
        match &region.kind {
            RegionKind::Catch(handlers) => {
                for handler in handlers {
                    if let Some(bound) = matches_filter(&handler.filter, &thrown) {
                        stack.clear();
                        if let Some(slot) = handler.var {
                            locals[slot as usize] = bound;
                        }
                        // The unwind exits every handler between the throw
                        // and its destination; their records retire.
                        while let Some(frame) = caught.last() {
                            if frame.covers(throw_pc) && !frame.covers(handler.target as usize) {
                                caught.pop();
                            } else {
                                break;
                            }
                        }
                        caught.push(CaughtFrame {
                            span: (handler.target as usize, handler.target_end as usize),
                            thrown,
                        });
                        return Ok(handler.target as usize);
                    }
                }
                idx += 1;
            }
            RegionKind::Finally {
                handler,
                handler_end,
            }
            | RegionKind::Fault {
                handler,
                handler_end,
            } => {
                stack.clear();
                pending.push(Pending::Unwind {
                    thrown,
                    throw_pc,
                    cursor: idx + 1,
                    active: (*handler as usize, *handler_end as usize),
                });
                return Ok(*handler as usize);
            }
        }
    }
    Err(thrown.into_fault())
}

/// Normal (non-exceptional) exit toward `target`, running every finally
/// block between `from` and the target. Fault handlers do not run.
fn begin_leave(
    code: &Code,
    pending: &mut Vec<Pending>,
    caught: &mut Vec<CaughtFrame>,
    from: usize,
    target: usize,
) -> usize {
    // Leaving a catch handler retires its exception record.
    while let Some(frame) = caught.last() {
        if frame.covers(from) && !frame.covers(target) {
            caught.pop();
        } else {
            break;
        }
    }
    let mut finallys: Vec<(usize, (usize, usize))> = Vec::new();
    for region in &code.regions {
        if let RegionKind::Finally {
            handler,
            handler_end,
        } = &region.kind
        {
            if region.contains(from as u32) && !region.contains(target as u32) {
                finallys.push((*handler as usize, (*handler as usize, *handler_end as usize)));
            }
        }
    }
    let Some((first, rest)) = finallys.split_first() else {
        return target;
    };
    let mut rest = rest.to_vec();
    rest.reverse();
    pending.push(Pending::Leave {
        rest,
        target,
        active: first.1,
    });
    first.0
}

fn begin_escape(
    code: &Code,
    pending: &mut Vec<Pending>,
    caught: &mut Vec<CaughtFrame>,
    from: usize,
) -> Result<usize, Fault> {
    match code.escape_pc {
        Some(target) => Ok(begin_leave(code, pending, caught, from, target as usize)),
        None => Err(Fault::Host("escape taken without an epilogue".into())),
    }
}

/// Resolve an ordinary jump. A jump into the escape epilogue is leave-like:
/// finally handlers between here and the epilogue still run.
fn transfer(
    code: &Code,
    pending: &mut Vec<Pending>,
    caught: &mut Vec<CaughtFrame>,
    from: usize,
    target: usize,
) -> usize {
    if code.escape_pc == Some(target as u32) {
        begin_leave(code, pending, caught, from, target)
    } else {
        target
    }
}

enum ConvertErr {
    Overflow,
    Type(&'static str),
}

fn convert_num(value: Value, to: NumTy, wrap: bool) -> Result<Value, ConvertErr> {
    match (to, value) {
        (NumTy::I32, Value::I32(v)) => Ok(Value::I32(v)),
        (NumTy::I32, Value::I64(v)) => {
            if wrap {
                Ok(Value::I32(v as i32))
            } else {
                i32::try_from(v)
                    .map(Value::I32)
                    .map_err(|_| ConvertErr::Overflow)
            }
        }
        (NumTy::I32, Value::F64(v)) => {
            let t = v.trunc();
            if wrap {
                Ok(Value::I32(t as i32))
            } else if t.is_finite() && t >= i32::MIN as f64 && t <= i32::MAX as f64 {
                Ok(Value::I32(t as i32))
            } else {
                Err(ConvertErr::Overflow)
            }
        }
        (NumTy::I64, Value::I32(v)) => Ok(Value::I64(v as i64)),
        (NumTy::I64, Value::I64(v)) => Ok(Value::I64(v)),
        (NumTy::I64, Value::F64(v)) => {
            let t = v.trunc();
            if wrap {
                Ok(Value::I64(t as i64))
            } else if t.is_finite() && t >= i64::MIN as f64 && t <= i64::MAX as f64 {
                Ok(Value::I64(t as i64))
            } else {
                Err(ConvertErr::Overflow)
            }
        }
        (NumTy::F64, Value::I32(v)) => Ok(Value::F64(v as f64)),
        (NumTy::F64, Value::I64(v)) => Ok(Value::F64(v as f64)),
        (NumTy::F64, Value::F64(v)) => Ok(Value::F64(v)),
        (_, other) => Err(ConvertErr::Type(other.kind_name())),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, Fault> {
    use std::cmp::Ordering;
    match op {
        CmpOp::Eq => return Ok(a == b),
        CmpOp::Ne => return Ok(a != b),
        _ => {}
    }
    let ord = match (a, b) {
        (Value::I32(a), Value::I32(b)) => a.partial_cmp(b),
        (Value::I64(a), Value::I64(b)) => a.partial_cmp(b),
        (Value::F64(a), Value::F64(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => return Err(Fault::InvalidConversion(a.kind_name())),
    };
    // Unordered (NaN) compares false, like IEEE relational operators.
    Ok(match ord {
        None => false,
        Some(ord) => match op {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
            CmpOp::Eq | CmpOp::Ne => unreachable!(),
        },
    })
}

fn kleene_and(a: Value, b: Value) -> Result<Value, Fault> {
    match (&a, &b) {
        (Value::Bool(false), _) | (_, Value::Bool(false)) => Ok(Value::Bool(false)),
        (Value::Bool(true), Value::Bool(true)) => Ok(Value::Bool(true)),
        (Value::Null, Value::Bool(true))
        | (Value::Bool(true), Value::Null)
        | (Value::Null, Value::Null) => Ok(Value::Null),
        _ => Err(Fault::InvalidConversion(a.kind_name())),
    }
}

fn kleene_or(a: Value, b: Value) -> Result<Value, Fault> {
    match (&a, &b) {
        (Value::Bool(true), _) | (_, Value::Bool(true)) => Ok(Value::Bool(true)),
        (Value::Bool(false), Value::Bool(false)) => Ok(Value::Bool(false)),
        (Value::Null, Value::Bool(false))
        | (Value::Bool(false), Value::Null)
        | (Value::Null, Value::Null) => Ok(Value::Null),
        _ => Err(Fault::InvalidConversion(a.kind_name())),
    }
}

fn load_place(
    place: &Place,
    args: &[Value],
    locals: &[Value],
    symbols: &Symbols,
) -> Result<Value, Fault> {
    match place {
        Place::Arg(slot) => Ok(args[*slot as usize].clone()),
        Place::Local(slot) => Ok(locals[*slot as usize].clone()),
        Place::Field(obj, index) => Ok(obj.read().fields[*index as usize].clone()),
        Place::Static(id) => Ok(symbols.load_static(*id)),
        Place::Elem(array, flat) => array
            .read()
            .items
            .get(*flat as usize)
            .cloned()
            .ok_or(Fault::IndexOutOfBounds(*flat as i64)),
        Place::Entry(dict, key) => dict
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Fault::KeyNotFound(key.clone())),
    }
}

fn store_place(
    place: &Place,
    value: Value,
    args: &mut [Value],
    locals: &mut [Value],
    symbols: &Symbols,
) -> Result<(), Fault> {
    match place {
        Place::Arg(slot) => args[*slot as usize] = value,
        Place::Local(slot) => locals[*slot as usize] = value,
        Place::Field(obj, index) => obj.write().fields[*index as usize] = value,
        Place::Static(id) => symbols.store_static(*id, value),
        Place::Elem(array, flat) => {
            let mut array = array.write();
            let flat = *flat as usize;
            if flat >= array.items.len() {
                return Err(Fault::IndexOutOfBounds(flat as i64));
            }
            array.items[flat] = value;
        }
        Place::Entry(dict, key) => {
            dict.write().insert(key.clone(), value);
        }
    }
    Ok(())
}

/// Which index of a failed element access was out of range.
fn bounds_fault(array: &ArrayData, indexes: &[i32]) -> Fault {
    for (index, dim) in indexes.iter().zip(array.dims.iter()) {
        if *index < 0 || *index as u32 >= *dim {
            return Fault::IndexOutOfBounds(*index as i64);
        }
    }
    Fault::IndexOutOfBounds(indexes.first().copied().unwrap_or(-1) as i64)
}

pub(crate) fn run(
    inner: &Shared<RoutineInner>,
    closure: Option<Value>,
    call_args: &[Value],
    depth: u32,
) -> Result<Value, Fault> {
    if depth >= MAX_CALL_DEPTH {
        return Err(Fault::CallDepthExceeded(depth));
    }
    let code = &inner.code;
    let symbols: &Symbols = &inner.symbols;
    let mut args: Vec<Value> = Vec::with_capacity(inner.n_args as usize);
    if let Some(closure) = closure {
        args.push(closure);
    }
    args.extend(call_args.iter().cloned());
    let mut locals = vec![Value::Null; inner.n_locals as usize];
    let mut stack: Vec<Value> = Vec::new();
    let mut pending: Vec<Pending> = Vec::new();
    let mut caught: Vec<CaughtFrame> = Vec::new();
    let mut pc: usize = 0;

    'dispatch: loop {
        let at = pc;
        let Some(instr) = code.instrs.get(at) else {
            return Err(Fault::Host("execution ran past the end of the routine".into()));
        };
        pc += 1;

        macro_rules! raise {
            ($thrown:expr) => {{
                match unwind(
                    code,
                    &mut stack,
                    &mut locals,
                    &mut pending,
                    &mut caught,
                    $thrown,
                    at,
                    0,
                ) {
                    Ok(next) => {
                        pc = next;
                        continue 'dispatch;
                    }
                    Err(fault) => return Err(fault),
                }
            }};
        }
        macro_rules! fault {
            ($fault:expr) => {
                raise!(Thrown::Fault($fault))
            };
        }
        macro_rules! escape {
            () => {{
                match begin_escape(code, &mut pending, &mut caught, at) {
                    Ok(next) => {
                        pc = next;
                        continue 'dispatch;
                    }
                    Err(fault) => return Err(fault),
                }
            }};
        }
        macro_rules! pop {
            () => {
                match stack.pop() {
                    Some(value) => value,
                    None => return Err(Fault::Host("operand stack underflow".into())),
                }
            };
        }
        macro_rules! expect {
            ($value:expr, $variant:ident) => {
                match $value {
                    Value::$variant(inner_value) => inner_value,
                    other => fault!(Fault::InvalidConversion(other.kind_name())),
                }
            };
        }
        macro_rules! arith {
            ($nt:expr, $checked:expr, $checked_fn:ident, $wrapping_fn:ident, $op:tt) => {{
                match $nt {
                    NumTy::I32 => {
                        let b = expect!(pop!(), I32);
                        let a = expect!(pop!(), I32);
                        match $checked {
                            Checked::Wrap => stack.push(Value::I32(a.$wrapping_fn(b))),
                            Checked::Escape => match a.$checked_fn(b) {
                                Some(v) => stack.push(Value::I32(v)),
                                None => escape!(),
                            },
                            Checked::Fault => match a.$checked_fn(b) {
                                Some(v) => stack.push(Value::I32(v)),
                                None => fault!(Fault::Overflow),
                            },
                        }
                    }
                    NumTy::I64 => {
                        let b = expect!(pop!(), I64);
                        let a = expect!(pop!(), I64);
                        match $checked {
                            Checked::Wrap => stack.push(Value::I64(a.$wrapping_fn(b))),
                            Checked::Escape => match a.$checked_fn(b) {
                                Some(v) => stack.push(Value::I64(v)),
                                None => escape!(),
                            },
                            Checked::Fault => match a.$checked_fn(b) {
                                Some(v) => stack.push(Value::I64(v)),
                                None => fault!(Fault::Overflow),
                            },
                        }
                    }
                    NumTy::F64 => {
                        let b = expect!(pop!(), F64);
                        let a = expect!(pop!(), F64);
                        stack.push(Value::F64(a $op b));
                    }
                }
            }};
        }
        macro_rules! bitop {
            ($it:expr, $op:tt) => {{
                match $it {
                    IntTy::I32 => {
                        let b = expect!(pop!(), I32);
                        let a = expect!(pop!(), I32);
                        stack.push(Value::I32(a $op b));
                    }
                    IntTy::I64 => {
                        let b = expect!(pop!(), I64);
                        let a = expect!(pop!(), I64);
                        stack.push(Value::I64(a $op b));
                    }
                }
            }};
        }

        match instr {
            Instr::PushNull => stack.push(Value::Null),
            Instr::PushBool(v) => stack.push(Value::Bool(*v)),
            Instr::PushI32(v) => stack.push(Value::I32(*v)),
            Instr::PushI64(v) => stack.push(Value::I64(*v)),
            Instr::PushF64(v) => stack.push(Value::F64(*v)),
            Instr::PushStr(v) => stack.push(Value::Str(v.clone())),
            Instr::PushDefault(ty) => stack.push(ty.default_value()),
            Instr::PushConstants => match &inner.constants {
                Some(constants) => stack.push(constants.clone()),
                None => fault!(Fault::Host("routine has no constants record".into())),
            },
            Instr::Dup => match stack.last() {
                Some(top) => {
                    let top = top.clone();
                    stack.push(top);
                }
                None => return Err(Fault::Host("operand stack underflow".into())),
            },
            Instr::Pop => {
                pop!();
            }

            Instr::LoadArg(slot) => stack.push(args[*slot as usize].clone()),
            Instr::StoreArg(slot) => {
                let value = pop!();
                args[*slot as usize] = value;
            }
            Instr::LoadLocal(slot) => stack.push(locals[*slot as usize].clone()),
            Instr::StoreLocal(slot) => {
                let value = pop!();
                locals[*slot as usize] = value;
            }
            Instr::LoadArgRef(slot) => stack.push(Value::Ref(Place::Arg(*slot))),
            Instr::LoadLocalRef(slot) => stack.push(Value::Ref(Place::Local(*slot))),
            Instr::LoadRef => {
                let place = expect!(pop!(), Ref);
                match load_place(&place, &args, &locals, symbols) {
                    Ok(value) => stack.push(value),
                    Err(fault) => fault!(fault),
                }
            }
            Instr::StoreRef => {
                let value = pop!();
                let place = expect!(pop!(), Ref);
                if let Err(fault) = store_place(&place, value, &mut args, &mut locals, symbols) {
                    fault!(fault);
                }
            }

            Instr::NewObj { ty, argc } => {
                let mut fields = symbols.default_fields(*ty);
                let argc = *argc as usize;
                if argc > fields.len() {
                    return Err(Fault::Host("constructor has too many arguments".into()));
                }
                for i in (0..argc).rev() {
                    fields[i] = pop!();
                }
                stack.push(Value::Obj(shared_cell(Object { ty: *ty, fields })));
            }
            Instr::LoadField(index) => match pop!() {
                Value::Obj(obj) => stack.push(obj.read().fields[*index as usize].clone()),
                Value::Null => fault!(Fault::NullReference),
                other => fault!(Fault::InvalidConversion(other.kind_name())),
            },
            Instr::StoreField(index) => {
                let value = pop!();
                match pop!() {
                    Value::Obj(obj) => obj.write().fields[*index as usize] = value,
                    Value::Null => fault!(Fault::NullReference),
                    other => fault!(Fault::InvalidConversion(other.kind_name())),
                }
            }
            Instr::LoadFieldRef(index) => match pop!() {
                Value::Obj(obj) => stack.push(Value::Ref(Place::Field(obj, *index))),
                Value::Null => fault!(Fault::NullReference),
                other => fault!(Fault::InvalidConversion(other.kind_name())),
            },
            Instr::LoadStatic(id) => stack.push(symbols.load_static(*id)),
            Instr::StoreStatic(id) => {
                let value = pop!();
                symbols.store_static(*id, value);
            }
            Instr::LoadStaticRef(id) => stack.push(Value::Ref(Place::Static(*id))),

            Instr::NewArray { elem, rank } => {
                let mut dims = smallvec::SmallVec::<[u32; 2]>::new();
                for _ in 0..*rank {
                    dims.push(0);
                }
                for i in (0..*rank as usize).rev() {
                    let dim = expect!(pop!(), I32);
                    if dim < 0 {
                        fault!(Fault::IndexOutOfBounds(dim as i64));
                    }
                    dims[i] = dim as u32;
                }
                stack.push(Value::Array(shared_cell(ArrayData::with_dims(
                    elem.clone(),
                    dims,
                ))));
            }
            Instr::NewArrayInit { elem, len } => {
                let len = *len as usize;
                let mut items = vec![Value::Null; len];
                for i in (0..len).rev() {
                    items[i] = pop!();
                }
                stack.push(Value::Array(shared_cell(ArrayData::from_items(
                    elem.clone(),
                    items,
                ))));
            }
            Instr::LoadElem { rank, guard } | Instr::LoadElemRef { rank, guard } => {
                let by_ref = matches!(instr, Instr::LoadElemRef { .. });
                let mut indexes = vec![0i32; *rank as usize];
                for i in (0..*rank as usize).rev() {
                    indexes[i] = expect!(pop!(), I32);
                }
                let array = match pop!() {
                    Value::Array(array) => array,
                    Value::Null => fault!(Fault::NullReference),
                    other => fault!(Fault::InvalidConversion(other.kind_name())),
                };
                let flat = array.read().flatten(&indexes);
                match flat {
                    Some(flat) => {
                        if by_ref {
                            stack.push(Value::Ref(Place::Elem(array, flat as u32)));
                        } else {
                            stack.push(array.read().items[flat].clone());
                        }
                    }
                    None => {
                        let fault = bounds_fault(&array.read(), &indexes);
                        match guard {
                            crate::compiler::code::Guard::Escape => escape!(),
                            crate::compiler::code::Guard::Fault => fault!(fault),
                        }
                    }
                }
            }
            Instr::StoreElem { rank, guard } => {
                let value = pop!();
                let mut indexes = vec![0i32; *rank as usize];
                for i in (0..*rank as usize).rev() {
                    indexes[i] = expect!(pop!(), I32);
                }
                let array = match pop!() {
                    Value::Array(array) => array,
                    Value::Null => fault!(Fault::NullReference),
                    other => fault!(Fault::InvalidConversion(other.kind_name())),
                };
                let flat = array.read().flatten(&indexes);
                match flat {
                    Some(flat) => array.write().items[flat] = value,
                    None => {
                        let fault = bounds_fault(&array.read(), &indexes);
                        match guard {
                            crate::compiler::code::Guard::Escape => escape!(),
                            crate::compiler::code::Guard::Fault => fault!(fault),
                        }
                    }
                }
            }
            Instr::AppendElem => {
                let value = pop!();
                let array = match pop!() {
                    Value::Array(array) => array,
                    Value::Null => fault!(Fault::NullReference),
                    other => fault!(Fault::InvalidConversion(other.kind_name())),
                };
                {
                    let mut data = array.write();
                    if data.dims.len() != 1 {
                        return Err(Fault::Host(
                            "append is only defined for one-dimensional arrays".into(),
                        ));
                    }
                    data.items.push(value);
                    data.dims[0] += 1;
                }
                stack.push(Value::Array(array));
            }
            Instr::ArrayLen => match pop!() {
                Value::Array(array) => stack.push(Value::I32(array.read().len() as i32)),
                Value::Null => fault!(Fault::NullReference),
                other => fault!(Fault::InvalidConversion(other.kind_name())),
            },

            Instr::LoadEntry | Instr::LoadEntryRef => {
                let by_ref = matches!(instr, Instr::LoadEntryRef);
                let key = expect!(pop!(), Str);
                let dict = match pop!() {
                    Value::Dict(dict) => dict,
                    Value::Null => fault!(Fault::NullReference),
                    other => fault!(Fault::InvalidConversion(other.kind_name())),
                };
                if by_ref {
                    stack.push(Value::Ref(Place::Entry(dict, key)));
                } else {
                    let found = dict.read().get(&key).cloned();
                    match found {
                        Some(value) => stack.push(value),
                        None => fault!(Fault::KeyNotFound(key)),
                    }
                }
            }
            Instr::StoreEntry => {
                let value = pop!();
                let key = expect!(pop!(), Str);
                match pop!() {
                    Value::Dict(dict) => {
                        dict.write().insert(key, value);
                    }
                    Value::Null => fault!(Fault::NullReference),
                    other => fault!(Fault::InvalidConversion(other.kind_name())),
                }
            }

            Instr::Add(nt, checked) => arith!(*nt, *checked, checked_add, wrapping_add, +),
            Instr::Sub(nt, checked) => arith!(*nt, *checked, checked_sub, wrapping_sub, -),
            Instr::Mul(nt, checked) => arith!(*nt, *checked, checked_mul, wrapping_mul, *),
            Instr::Div(nt) => match nt {
                NumTy::I32 => {
                    let b = expect!(pop!(), I32);
                    let a = expect!(pop!(), I32);
                    if b == 0 {
                        fault!(Fault::DivisionByZero);
                    }
                    match a.checked_div(b) {
                        Some(v) => stack.push(Value::I32(v)),
                        None => fault!(Fault::Overflow),
                    }
                }
                NumTy::I64 => {
                    let b = expect!(pop!(), I64);
                    let a = expect!(pop!(), I64);
                    if b == 0 {
                        fault!(Fault::DivisionByZero);
                    }
                    match a.checked_div(b) {
                        Some(v) => stack.push(Value::I64(v)),
                        None => fault!(Fault::Overflow),
                    }
                }
                NumTy::F64 => {
                    let b = expect!(pop!(), F64);
                    let a = expect!(pop!(), F64);
                    stack.push(Value::F64(a / b));
                }
            },
            Instr::Rem(nt) => match nt {
                NumTy::I32 => {
                    let b = expect!(pop!(), I32);
                    let a = expect!(pop!(), I32);
                    if b == 0 {
                        fault!(Fault::DivisionByZero);
                    }
                    stack.push(Value::I32(a.wrapping_rem(b)));
                }
                NumTy::I64 => {
                    let b = expect!(pop!(), I64);
                    let a = expect!(pop!(), I64);
                    if b == 0 {
                        fault!(Fault::DivisionByZero);
                    }
                    stack.push(Value::I64(a.wrapping_rem(b)));
                }
                NumTy::F64 => {
                    let b = expect!(pop!(), F64);
                    let a = expect!(pop!(), F64);
                    stack.push(Value::F64(a % b));
                }
            },
            Instr::Neg(nt, checked) => match nt {
                NumTy::I32 => {
                    let a = expect!(pop!(), I32);
                    match checked {
                        Checked::Wrap => stack.push(Value::I32(a.wrapping_neg())),
                        Checked::Escape => match a.checked_neg() {
                            Some(v) => stack.push(Value::I32(v)),
                            None => escape!(),
                        },
                        Checked::Fault => match a.checked_neg() {
                            Some(v) => stack.push(Value::I32(v)),
                            None => fault!(Fault::Overflow),
                        },
                    }
                }
                NumTy::I64 => {
                    let a = expect!(pop!(), I64);
                    match checked {
                        Checked::Wrap => stack.push(Value::I64(a.wrapping_neg())),
                        Checked::Escape => match a.checked_neg() {
                            Some(v) => stack.push(Value::I64(v)),
                            None => escape!(),
                        },
                        Checked::Fault => match a.checked_neg() {
                            Some(v) => stack.push(Value::I64(v)),
                            None => fault!(Fault::Overflow),
                        },
                    }
                }
                NumTy::F64 => {
                    let a = expect!(pop!(), F64);
                    stack.push(Value::F64(-a));
                }
            },
            Instr::BitAnd(it) => bitop!(*it, &),
            Instr::BitOr(it) => bitop!(*it, |),
            Instr::BitXor(it) => bitop!(*it, ^),
            Instr::Shl(it) => {
                let b = expect!(pop!(), I32);
                match it {
                    IntTy::I32 => {
                        let a = expect!(pop!(), I32);
                        stack.push(Value::I32(a.wrapping_shl(b as u32)));
                    }
                    IntTy::I64 => {
                        let a = expect!(pop!(), I64);
                        stack.push(Value::I64(a.wrapping_shl(b as u32)));
                    }
                }
            }
            Instr::Shr(it) => {
                let b = expect!(pop!(), I32);
                match it {
                    IntTy::I32 => {
                        let a = expect!(pop!(), I32);
                        stack.push(Value::I32(a.wrapping_shr(b as u32)));
                    }
                    IntTy::I64 => {
                        let a = expect!(pop!(), I64);
                        stack.push(Value::I64(a.wrapping_shr(b as u32)));
                    }
                }
            }
            Instr::BitNot(it) => match it {
                IntTy::I32 => {
                    let a = expect!(pop!(), I32);
                    stack.push(Value::I32(!a));
                }
                IntTy::I64 => {
                    let a = expect!(pop!(), I64);
                    stack.push(Value::I64(!a));
                }
            },
            Instr::Cmp(op) => {
                let b = pop!();
                let a = pop!();
                match compare(*op, &a, &b) {
                    Ok(result) => stack.push(Value::Bool(result)),
                    Err(fault) => fault!(fault),
                }
            }
            Instr::Not => match pop!() {
                Value::Bool(v) => stack.push(Value::Bool(!v)),
                Value::Null => stack.push(Value::Null),
                other => fault!(Fault::InvalidConversion(other.kind_name())),
            },
            Instr::And3 => {
                let b = pop!();
                let a = pop!();
                match kleene_and(a, b) {
                    Ok(value) => stack.push(value),
                    Err(fault) => fault!(fault),
                }
            }
            Instr::Or3 => {
                let b = pop!();
                let a = pop!();
                match kleene_or(a, b) {
                    Ok(value) => stack.push(value),
                    Err(fault) => fault!(fault),
                }
            }
            Instr::IsNull => {
                let value = pop!();
                stack.push(Value::Bool(value.is_null()));
            }
            Instr::NullCheck => match stack.last() {
                Some(Value::Null) => fault!(Fault::NullReference),
                Some(_) => {}
                None => return Err(Fault::Host("operand stack underflow".into())),
            },
            Instr::Convert { to, checked } => {
                let value = pop!();
                match convert_num(value, *to, matches!(checked, Checked::Wrap)) {
                    Ok(value) => stack.push(value),
                    Err(ConvertErr::Type(name)) => fault!(Fault::InvalidConversion(name)),
                    Err(ConvertErr::Overflow) => match checked {
                        Checked::Escape => escape!(),
                        _ => fault!(Fault::Overflow),
                    },
                }
            }

            Instr::Jump(target) => pc = transfer(code, &mut pending, &mut caught, at, *target as usize),
            Instr::JumpIfTrue(target) => {
                if pop!() == Value::Bool(true) {
                    pc = transfer(code, &mut pending, &mut caught, at, *target as usize);
                }
            }
            Instr::JumpIfFalse(target) => {
                if pop!() == Value::Bool(false) {
                    pc = transfer(code, &mut pending, &mut caught, at, *target as usize);
                }
            }
            Instr::JumpIfNull(target) => {
                if pop!().is_null() {
                    pc = transfer(code, &mut pending, &mut caught, at, *target as usize);
                }
            }
            Instr::JumpIfNotNull(target) => {
                if !pop!().is_null() {
                    pc = transfer(code, &mut pending, &mut caught, at, *target as usize);
                }
            }
            Instr::Switch(table) => {
                let value = pop!();
                let mut target = table.default;
                if let Some(bucket) = table.buckets.get(&hash::value_code(&value)) {
                    for (candidate, candidate_target) in bucket {
                        if *candidate == value {
                            target = *candidate_target;
                            break;
                        }
                    }
                }
                pc = target as usize;
            }

            Instr::Leave(target) => {
                pc = begin_leave(code, &mut pending, &mut caught, at, *target as usize);
            }
            Instr::EndFinally => match pending.pop() {
                Some(Pending::Leave {
                    mut rest, target, ..
                }) => {
                    if let Some((handler, active)) = rest.pop() {
                        pending.push(Pending::Leave {
                            rest,
                            target,
                            active,
                        });
                        pc = handler;
                    } else {
                        pc = target;
                    }
                }
                Some(Pending::Unwind {
                    thrown,
                    throw_pc,
                    cursor,
                    ..
                }) => {
                    match unwind(
                        code,
                        &mut stack,
                        &mut locals,
                        &mut pending,
                        &mut caught,
                        thrown,
                        throw_pc,
                        cursor,
                    ) {
                        Ok(next) => pc = next,
                        Err(fault) => return Err(fault),
                    }
                }
                None => {
                    return Err(Fault::Host("endfinally without a pending transfer".into()));
                }
            },
            Instr::Throw => {
                let value = pop!();
                raise!(Thrown::Value(value));
            }
            Instr::Rethrow => match caught.last().map(|frame| frame.thrown.clone()) {
                Some(thrown) => raise!(thrown),
                None => {
                    return Err(Fault::Host("rethrow without a caught exception".into()));
                }
            },

            Instr::CallHost { func, argc } => {
                let argc = *argc as usize;
                let mut host_args = vec![Value::Null; argc];
                for i in (0..argc).rev() {
                    host_args[i] = pop!();
                }
                let def = symbols.func_def(*func);
                match (def.body)(&host_args) {
                    Ok(value) => stack.push(value),
                    Err(fault) => fault!(fault),
                }
            }
            Instr::MakeClosure { sub, binds } => {
                let closure = if *binds { Some(pop!()) } else { None };
                match inner.sub(*sub) {
                    Some(sub_inner) => stack.push(Value::Routine(Shared::new(BoundRoutine {
                        inner: sub_inner,
                        closure,
                    }))),
                    None => {
                        return Err(Fault::Host("sub-routine is not linked".into()));
                    }
                }
            }
            Instr::Invoke { argc } => {
                let argc = *argc as usize;
                let mut invoke_args = vec![Value::Null; argc];
                for i in (0..argc).rev() {
                    invoke_args[i] = pop!();
                }
                let callee = match pop!() {
                    Value::Routine(routine) => routine,
                    Value::Null => fault!(Fault::NullReference),
                    other => fault!(Fault::InvalidConversion(other.kind_name())),
                };
                if invoke_args.len() != callee.inner.params.len() {
                    fault!(Fault::ArityMismatch {
                        expected: callee.inner.params.len() as u16,
                        got: invoke_args.len() as u16,
                    });
                }
                match run(&callee.inner, callee.closure.clone(), &invoke_args, depth + 1) {
                    Ok(value) => stack.push(value),
                    Err(fault) => fault!(fault),
                }
            }

            Instr::ResetStack => stack.clear(),
            Instr::Ret => {
                let value = pop!();
                return Ok(value);
            }
            Instr::DebugMark { .. } => {}
        }
    }
}
