//! `exprc` lowers typed expression trees into directly-callable routines.
//!
//! A tree is built with [`TreeBuilder`] against a shared [`Symbols`] table,
//! compiled with [`compile`], and invoked with plain [`Value`] arguments.
//! Captured variables are hoisted into a synthesized closure record, opaque
//! constants into a pre-built constants record, and structural fingerprints
//! let [`RoutineCache`] share one routine between alpha-equivalent trees.
//!
//! ## Examples
//!
//! ```
//! use exprc::{compile, BinOp, CompilerOptions, Shared, Symbols, TreeBuilder, Ty, Value};
//!
//! let symbols = Shared::new(Symbols::new());
//! let mut builder = TreeBuilder::new(&symbols);
//! let x = builder.param("x", Ty::I32);
//! let y = builder.param("y", Ty::I32);
//! let sum = builder.binary(BinOp::Add, x, y);
//! let lambda = builder.lambda(&[x, y], sum);
//! let tree = builder.finish();
//!
//! let routine = compile(&tree, lambda, &symbols, CompilerOptions::default()).unwrap();
//! assert_eq!(
//!     routine.invoke(&[Value::I32(2), Value::I32(3)]).unwrap(),
//!     Value::I32(5),
//! );
//! ```
mod arena;
mod compiler;
mod error;
mod hash;
mod resolver;
mod routine;
mod shared;
mod symbols;
mod tree;
mod types;
mod value;
mod vm;

pub use compiler::{compile, CompilerOptions};
pub use error::{CompileError, Fault, FaultKind};
pub use hash::{fingerprint, fingerprint_strong};
pub use resolver::{resolve, ClosurePlan, ConstantsPlan, Resolved};
pub use routine::{
    registry, BoundRoutine, CompiledRoutine, RoutineCache, RoutineRegistry,
};
pub use shared::{shared_cell, Shared, SharedCell};
pub use symbols::{
    FieldDef, FieldId, FnSig, FuncDef, FuncId, SigId, StaticDef, StaticId, Symbols, TypeId,
    TypeLayout,
};
pub use tree::{
    BinOp, CatchFilter, CatchHandler, ExprTree, GotoKind, LabelId, NewArrayKind, Node, NodeId,
    NodeKind, SwitchCase, TreeBuilder, UnOp,
};
pub use types::Ty;
pub use value::{ArrayData, DictData, Object, Place, Value};
