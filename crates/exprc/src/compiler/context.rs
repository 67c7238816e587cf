use rustc_hash::FxHashMap;

use crate::compiler::code::{Code, CodeBuilder, CodeLabel};
use crate::error::CompileError;
use crate::compiler::CompilerOptions;
use crate::shared::{shared_cell, Shared, SharedCell};
use crate::symbols::Symbols;
use crate::tree::{ExprTree, LabelId, NodeId};
use crate::types::Ty;

/// What the caller of an emitter wants left on the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Exactly one value.
    Value,
    /// Nothing; the node runs for its side effects.
    Void,
    /// A reference for every assignable node.
    ByRefAll,
    /// A reference only when the node's type has value semantics; aggregate
    /// values are already handles, loading them by value is enough.
    ByRefValueTypesOnly,
}

impl ResultShape {
    pub fn is_void(self) -> bool {
        self == ResultShape::Void
    }

    pub fn wants_ref(self, ty: &Ty) -> bool {
        match self {
            ResultShape::ByRefAll => true,
            ResultShape::ByRefValueTypesOnly => ty.is_value_kind(),
            ResultShape::Value | ResultShape::Void => false,
        }
    }
}

/// What an emitter actually produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitResult {
    /// Some guarded check inside may transfer to the escape epilogue.
    pub escapes: bool,
    /// A reference was left instead of a value.
    pub by_ref: bool,
}

impl EmitResult {
    pub fn value() -> Self {
        Self::default()
    }

    pub fn join(self, other: Self) -> Self {
        Self {
            escapes: self.escapes || other.escapes,
            by_ref: self.by_ref || other.by_ref,
        }
    }
}

/// Hands out local slots, reusing released ones of the same type so sibling
/// scopes share storage.
#[derive(Debug, Default)]
pub struct LocalAllocator {
    next: u16,
    free: FxHashMap<Ty, Vec<u16>>,
}

impl LocalAllocator {
    pub fn acquire(&mut self, ty: &Ty) -> u16 {
        if let Some(slot) = self.free.get_mut(ty).and_then(Vec::pop) {
            return slot;
        }
        let slot = self.next;
        self.next += 1;
        slot
    }

    pub fn release(&mut self, ty: Ty, slot: u16) {
        self.free.entry(ty).or_default().push(slot);
    }

    /// Total slots ever handed out; the frame size of the routine.
    pub fn count(&self) -> u16 {
        self.next
    }
}

/// A leased local slot, released back to the allocator on drop.
#[derive(Debug)]
pub struct LocalHolder {
    slot: u16,
    ty: Ty,
    alloc: Shared<SharedCell<LocalAllocator>>,
}

impl LocalHolder {
    pub fn new(alloc: &Shared<SharedCell<LocalAllocator>>, ty: Ty) -> Self {
        let slot = alloc.write().acquire(&ty);
        Self {
            slot,
            ty,
            alloc: Shared::clone(alloc),
        }
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }
}

impl Drop for LocalHolder {
    fn drop(&mut self) {
        let ty = std::mem::replace(&mut self.ty, Ty::Unit);
        self.alloc.write().release(ty, self.slot);
    }
}

/// Where the shared closure record lives within the current routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureStorage {
    /// Root routine: built in the prologue, kept in a local.
    Local(u16),
    /// Nested routine: passed as a leading argument.
    Arg(u16),
}

#[derive(Debug, Clone, Copy)]
pub struct ClosureBinding {
    /// The synthesized parameter node closure member accesses target.
    pub param: NodeId,
    pub storage: ClosureStorage,
}

/// Code-level binding of a tree label: the jump target plus, for labels
/// carrying a value, the slot that transports it.
#[derive(Debug, Clone, Copy)]
pub struct LabelBinding {
    pub label: CodeLabel,
    pub slot: Option<u16>,
}

/// Everything the per-kind emitters share while one routine is lowered.
pub struct EmittingContext<'c> {
    pub tree: &'c ExprTree,
    pub symbols: &'c Symbols,
    pub options: CompilerOptions,
    pub code: CodeBuilder,
    /// Parameter node -> argument slot of this routine.
    pub args: FxHashMap<NodeId, u16>,
    /// Block variable node -> live local slot.
    pub var_locals: FxHashMap<NodeId, u16>,
    pub closure: Option<ClosureBinding>,
    pub constants_param: Option<NodeId>,
    /// Nested lambdas discovered during emission, compiled after this
    /// routine finishes. The index in this list is the sub-routine id.
    pub pending: &'c mut Vec<NodeId>,
    pub escape: CodeLabel,
    pub escape_used: bool,
    labels: FxHashMap<LabelId, LabelBinding>,
    label_holders: Vec<LocalHolder>,
    pub locals: Shared<SharedCell<LocalAllocator>>,
    /// Depth of catch handler bodies currently being emitted; rethrow is
    /// only meaningful above zero.
    pub catch_depth: u32,
}

impl<'c> EmittingContext<'c> {
    pub fn new(
        tree: &'c ExprTree,
        symbols: &'c Symbols,
        options: CompilerOptions,
        pending: &'c mut Vec<NodeId>,
    ) -> Self {
        let mut code = CodeBuilder::new();
        let escape = code.new_label();
        Self {
            tree,
            symbols,
            options,
            code,
            args: FxHashMap::default(),
            var_locals: FxHashMap::default(),
            closure: None,
            constants_param: None,
            pending,
            escape,
            escape_used: false,
            labels: FxHashMap::default(),
            label_holders: Vec::new(),
            locals: shared_cell(LocalAllocator::default()),
            catch_depth: 0,
        }
    }

    pub fn acquire_local(&self, ty: Ty) -> LocalHolder {
        LocalHolder::new(&self.locals, ty)
    }

    /// The code binding of a tree label, created on first mention so forward
    /// jumps and label definitions meet at the same target.
    pub fn label_binding(&mut self, id: LabelId, ty: &Ty) -> LabelBinding {
        if let Some(binding) = self.labels.get(&id).copied() {
            // A value-carrying label may first be mentioned by a plain goto;
            // the slot is attached when the typed mention arrives.
            if binding.slot.is_none() && *ty != Ty::Unit {
                let holder = self.acquire_local(ty.clone());
                let upgraded = LabelBinding {
                    label: binding.label,
                    slot: Some(holder.slot()),
                };
                self.label_holders.push(holder);
                self.labels.insert(id, upgraded);
                return upgraded;
            }
            return binding;
        }
        let label = self.code.new_label();
        let slot = if *ty == Ty::Unit {
            None
        } else {
            let holder = self.acquire_local(ty.clone());
            let slot = holder.slot();
            self.label_holders.push(holder);
            Some(slot)
        };
        let binding = LabelBinding { label, slot };
        self.labels.insert(id, binding);
        binding
    }

    pub fn has_label(&self, id: LabelId) -> bool {
        self.labels.contains_key(&id)
    }

    /// Escape target for guarded checks; flips the flag that makes the
    /// driver emit the epilogue.
    pub fn escape_target(&mut self) -> CodeLabel {
        self.escape_used = true;
        self.escape
    }

    pub fn local_count(&self) -> u16 {
        self.locals.read().count()
    }

    /// Resolve every label and hand back the finished code.
    pub fn into_code(self) -> Result<Code, CompileError> {
        let escape = self.escape_used.then_some(self.escape);
        self.code.finish(escape)
    }
}
