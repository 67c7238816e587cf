use std::fmt;
use std::sync::OnceLock;

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::compiler::code::Code;
use crate::compiler::CompilerOptions;
use crate::error::{CompileError, Fault};
use crate::hash;
use crate::shared::{Shared, SharedCell};
use crate::symbols::Symbols;
use crate::tree::{ExprTree, NodeId};
use crate::types::Ty;
use crate::value::Value;
use crate::vm;

/// One lowered lambda: code, frame layout, and everything the interpreter
/// needs at runtime.
pub struct RoutineInner {
    pub name: SmolStr,
    /// Declared parameter types, closure slot excluded.
    pub params: Vec<Ty>,
    pub ret: Ty,
    pub code: Code,
    /// Argument slots including the leading closure slot of nested routines.
    pub n_args: u16,
    pub n_locals: u16,
    /// Hoisted-constants record instance, shared by every invocation.
    pub constants: Option<Value>,
    pub symbols: Shared<Symbols>,
    /// Every routine of the owning compilation, indexed by sub-routine id.
    /// Set once, after the whole nest is lowered.
    pub subs: OnceLock<Vec<Shared<RoutineInner>>>,
}

impl fmt::Debug for RoutineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // subs form a cycle through the nest; don't chase them.
        f.debug_struct("RoutineInner")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("ret", &self.ret)
            .field("n_args", &self.n_args)
            .field("n_locals", &self.n_locals)
            .finish_non_exhaustive()
    }
}

impl RoutineInner {
    pub(crate) fn sub(&self, id: u32) -> Option<Shared<RoutineInner>> {
        self.subs.get().and_then(|subs| subs.get(id as usize)).cloned()
    }
}

/// A routine bound to a closure record: what a lambda node evaluates to.
#[derive(Debug)]
pub struct BoundRoutine {
    pub inner: Shared<RoutineInner>,
    pub closure: Option<Value>,
}

impl BoundRoutine {
    pub fn invoke(&self, args: &[Value]) -> Result<Value, Fault> {
        if args.len() != self.inner.params.len() {
            return Err(Fault::ArityMismatch {
                expected: self.inner.params.len() as u16,
                got: args.len() as u16,
            });
        }
        vm::run(&self.inner, self.closure.clone(), args, 0)
    }
}

/// The directly-callable product of compilation.
#[derive(Debug, Clone)]
pub struct CompiledRoutine {
    inner: Shared<RoutineInner>,
}

impl CompiledRoutine {
    pub(crate) fn new(inner: Shared<RoutineInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &[Ty] {
        &self.inner.params
    }

    pub fn ret(&self) -> &Ty {
        &self.inner.ret
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value, Fault> {
        if args.len() != self.inner.params.len() {
            return Err(Fault::ArityMismatch {
                expected: self.inner.params.len() as u16,
                got: args.len() as u16,
            });
        }
        vm::run(&self.inner, None, args, 0)
    }

    /// Disassembly of the root routine.
    pub fn listing(&self) -> String {
        self.inner.code.listing()
    }
}

/// Process-wide, append-only list of every compiled routine, for inspection
/// and debugging. Registration never invalidates earlier entries.
#[derive(Debug, Default)]
pub struct RoutineRegistry {
    routines: SharedCell<Vec<Shared<RoutineInner>>>,
}

impl RoutineRegistry {
    pub(crate) fn register(&self, inner: &Shared<RoutineInner>) -> u32 {
        let mut routines = self.routines.write();
        routines.push(Shared::clone(inner));
        routines.len() as u32 - 1
    }

    pub fn len(&self) -> usize {
        self.routines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.read().is_empty()
    }

    pub fn get(&self, id: u32) -> Option<CompiledRoutine> {
        self.routines
            .read()
            .get(id as usize)
            .cloned()
            .map(CompiledRoutine::new)
    }
}

/// The process-local registry.
pub fn registry() -> &'static RoutineRegistry {
    static REGISTRY: OnceLock<RoutineRegistry> = OnceLock::new();
    REGISTRY.get_or_init(RoutineRegistry::default)
}

/// Compilation cache keyed by the strong structural fingerprint plus the
/// option set. Alpha-equivalent trees compiled with the same options share
/// one routine.
#[derive(Debug, Default)]
pub struct RoutineCache {
    entries: SharedCell<FxHashMap<(u128, u32), CompiledRoutine>>,
}

impl RoutineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(
        &self,
        tree: &ExprTree,
        root: NodeId,
        symbols: &Shared<Symbols>,
        options: CompilerOptions,
    ) -> Result<CompiledRoutine, CompileError> {
        let key = (hash::fingerprint_strong(tree, root)?, options.bits());
        if let Some(found) = self.entries.read().get(&key) {
            return Ok(found.clone());
        }
        // Compile outside the write lock; a racing compilation of the same
        // tree loses and the first inserted routine wins.
        let compiled = crate::compiler::compile(tree, root, symbols, options)?;
        let mut entries = self.entries.write();
        Ok(entries.entry(key).or_insert(compiled).clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
