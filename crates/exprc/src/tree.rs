pub mod builder;
pub mod node;

pub use builder::TreeBuilder;
pub use node::{
    BinOp, CatchFilter, CatchHandler, GotoKind, LabelId, NewArrayKind, Node, NodeId, NodeKind,
    SwitchCase, UnOp,
};

use crate::arena::Arena;
use crate::types::Ty;

/// A typed expression tree: an arena of nodes plus nothing else.
///
/// Parameter nodes are shared between declaration and use sites, so node
/// identity (the arena id) is meaningful and trees must not be spliced
/// across arenas.
#[derive(Debug, Clone, Default)]
pub struct ExprTree {
    nodes: Arena<Node>,
}

impl ExprTree {
    pub fn new() -> Self {
        Self {
            nodes: Arena::new(64),
        }
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.alloc(node)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn ty(&self, id: NodeId) -> &Ty {
        &self.nodes[id].ty
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
