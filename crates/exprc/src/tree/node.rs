use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::arena::ArenaId;
use crate::error::FaultKind;
use crate::symbols::{FieldId, FuncId, StaticId, TypeId};
use crate::types::Ty;
use crate::value::Value;

pub type NodeId = ArenaId<Node>;
/// Jump target identifier, scoped to one tree.
pub type LabelId = u32;

/// One node of a typed expression tree.
///
/// The type on every node is resolved by whoever built the tree; the
/// compiler trusts it and never re-infers.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub ty: Ty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    AddChecked,
    Sub,
    SubChecked,
    Mul,
    MulChecked,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    AndAlso,
    OrElse,
    Coalesce,
}

impl BinOp {
    pub fn is_checked(&self) -> bool {
        matches!(self, BinOp::AddChecked | BinOp::SubChecked | BinOp::MulChecked)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }

    pub fn is_short_circuit(&self) -> bool {
        matches!(self, BinOp::AndAlso | BinOp::OrElse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Negate,
    NegateChecked,
    Not,
    BitNot,
    UnaryPlus,
    Convert,
    ConvertChecked,
    ArrayLength,
    /// Whether a nullable value is present; never lifted.
    HasValue,
    /// The payload of a nullable value; faults or escapes on null.
    GetValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GotoKind {
    Goto,
    Return,
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewArrayKind {
    /// Sizes per dimension, elements default-initialized.
    Bounds,
    /// One-dimensional array from an element list.
    Init,
}

/// What a catch handler accepts, matched in source order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchFilter {
    /// Matches everything catchable.
    Any,
    /// Matches thrown instances of one registered exception type.
    Type(TypeId),
    /// Matches one class of built-in runtime fault.
    Fault(FaultKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchHandler {
    pub filter: CatchFilter,
    /// Parameter node the caught exception is bound to.
    pub var: Option<NodeId>,
    pub body: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    /// Several test constants may share one body.
    pub tests: SmallVec<[NodeId; 2]>,
    pub body: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Constant(Value),
    /// The default value of the node's type.
    Default,
    /// Identity is the arena id; the same parameter node is shared by its
    /// declaration site and every use site.
    Parameter { name: SmolStr },
    Binary {
        op: BinOp,
        left: NodeId,
        right: NodeId,
    },
    Unary {
        op: UnOp,
        operand: NodeId,
    },
    Member {
        target: NodeId,
        field: FieldId,
    },
    StaticMember {
        field: StaticId,
    },
    /// Indexer-property access on a dict value.
    Index {
        target: NodeId,
        key: NodeId,
    },
    /// Array element access, one index per dimension.
    ArrayIndex {
        target: NodeId,
        indexes: SmallVec<[NodeId; 2]>,
    },
    Call {
        func: FuncId,
        /// Receiver for instance-style calls, passed as the first argument.
        target: Option<NodeId>,
        args: SmallVec<[NodeId; 4]>,
    },
    /// Call through a lambda-typed value.
    Invoke {
        target: NodeId,
        args: SmallVec<[NodeId; 4]>,
    },
    New {
        ty: TypeId,
        /// Positional initializers for the leading fields.
        args: SmallVec<[NodeId; 4]>,
    },
    NewArray {
        kind: NewArrayKind,
        items: SmallVec<[NodeId; 4]>,
    },
    Conditional {
        test: NodeId,
        then: NodeId,
        otherwise: NodeId,
    },
    Block {
        vars: SmallVec<[NodeId; 4]>,
        body: SmallVec<[NodeId; 8]>,
    },
    Assign {
        target: NodeId,
        value: NodeId,
        /// Compound assignment when present.
        op: Option<BinOp>,
    },
    Loop {
        body: NodeId,
        break_label: Option<LabelId>,
        continue_label: Option<LabelId>,
    },
    Goto {
        kind: GotoKind,
        target: LabelId,
        value: Option<NodeId>,
    },
    Label {
        label: LabelId,
        /// Value of the label position when reached by fallthrough.
        default: Option<NodeId>,
    },
    Switch {
        value: NodeId,
        cases: Vec<SwitchCase>,
        default: Option<NodeId>,
    },
    Try {
        body: NodeId,
        handlers: Vec<CatchHandler>,
        finally: Option<NodeId>,
        /// Runs only when the body unwinds exceptionally.
        fault: Option<NodeId>,
    },
    /// `value: None` rethrows the exception of the enclosing catch handler.
    Throw {
        value: Option<NodeId>,
    },
    Lambda {
        params: SmallVec<[NodeId; 4]>,
        body: NodeId,
        name: Option<SmolStr>,
    },
    MemberInit {
        new: NodeId,
        bindings: Vec<(FieldId, NodeId)>,
    },
    ListInit {
        new: NodeId,
        items: SmallVec<[NodeId; 4]>,
    },
    /// Source position marker, emitted only under the debug-info option.
    DebugInfo {
        line: u32,
        column: u32,
    },
    RuntimeVariables {
        vars: SmallVec<[NodeId; 4]>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Constant(_) => "Constant",
            NodeKind::Default => "Default",
            NodeKind::Parameter { .. } => "Parameter",
            NodeKind::Binary { .. } => "Binary",
            NodeKind::Unary { .. } => "Unary",
            NodeKind::Member { .. } => "Member",
            NodeKind::StaticMember { .. } => "StaticMember",
            NodeKind::Index { .. } => "Index",
            NodeKind::ArrayIndex { .. } => "ArrayIndex",
            NodeKind::Call { .. } => "Call",
            NodeKind::Invoke { .. } => "Invoke",
            NodeKind::New { .. } => "New",
            NodeKind::NewArray { .. } => "NewArray",
            NodeKind::Conditional { .. } => "Conditional",
            NodeKind::Block { .. } => "Block",
            NodeKind::Assign { .. } => "Assign",
            NodeKind::Loop { .. } => "Loop",
            NodeKind::Goto { .. } => "Goto",
            NodeKind::Label { .. } => "Label",
            NodeKind::Switch { .. } => "Switch",
            NodeKind::Try { .. } => "Try",
            NodeKind::Throw { .. } => "Throw",
            NodeKind::Lambda { .. } => "Lambda",
            NodeKind::MemberInit { .. } => "MemberInit",
            NodeKind::ListInit { .. } => "ListInit",
            NodeKind::DebugInfo { .. } => "DebugInfo",
            NodeKind::RuntimeVariables { .. } => "RuntimeVariables",
        }
    }
}
