use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

use crate::value::Value;

/// Errors raised while lowering a tree. A failed compilation leaves no
/// partial state behind; the whole call fails with one of these.
#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("node kind \"{0}\" is not supported")]
    NotSupportedNodeKind(&'static str),
    #[error("variable \"{0}\" is not declared in any enclosing scope")]
    ScopeResolution(SmolStr),
    #[error("parameter \"{0}\" does not belong to this lambda")]
    UnknownParameter(SmolStr),
    #[error("label #{0} is referenced but never marked")]
    UnknownLabel(u32),
    #[error("constant of kind \"{0}\" cannot be fingerprinted in strong mode")]
    UnhashableConstant(&'static str),
    #[error("break or continue outside of a loop")]
    OrphanLoopJump,
    #[error("rethrow outside of a catch handler")]
    RethrowOutsideCatch,
    #[error("emitter invariant violated: {0}")]
    Internal(&'static str),
}

impl Diagnostic for CompileError {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let code = match self {
            CompileError::NotSupportedNodeKind(_) => "CompileError::NotSupportedNodeKind",
            CompileError::ScopeResolution(_) => "CompileError::ScopeResolution",
            CompileError::UnknownParameter(_) => "CompileError::UnknownParameter",
            CompileError::UnknownLabel(_) => "CompileError::UnknownLabel",
            CompileError::UnhashableConstant(_) => "CompileError::UnhashableConstant",
            CompileError::OrphanLoopJump => "CompileError::OrphanLoopJump",
            CompileError::RethrowOutsideCatch => "CompileError::RethrowOutsideCatch",
            CompileError::Internal(_) => "CompileError::Internal",
        };
        Some(Box::new(code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let msg = match self {
            CompileError::NotSupportedNodeKind(_) => {
                Some("This node kind has no lowering rule. Rewrite the tree without it.")
            }
            CompileError::ScopeResolution(_) => Some(
                "Every variable must be a parameter of an enclosing lambda or declared by an enclosing block.",
            ),
            CompileError::UnknownParameter(_) => {
                Some("Check that the parameter node is listed in the lambda's parameter list.")
            }
            CompileError::UnknownLabel(_) => {
                Some("Every goto target must be marked by a label node somewhere in the lambda.")
            }
            CompileError::UnhashableConstant(_) => Some(
                "Strong fingerprints decompose constants by value; only bool, integer and string constants are supported.",
            ),
            CompileError::OrphanLoopJump => {
                Some("Break and continue are only valid inside the loop that owns their label.")
            }
            CompileError::RethrowOutsideCatch => None,
            CompileError::Internal(_) => {
                Some("This is a bug in the compiler. Please report it with the offending tree.")
            }
        };
        msg.map(|m| Box::new(m) as Box<dyn std::fmt::Display>)
    }
}

/// Classification of a runtime fault, used for catch-handler matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    NullReference,
    IndexOutOfBounds,
    KeyNotFound,
    Overflow,
    DivisionByZero,
    InvalidConversion,
    CallDepthExceeded,
    Arity,
    Host,
    Uncaught,
}

/// A runtime failure escaping `invoke`. Guarded conditions only turn into
/// faults when the corresponding compiler option left them unguarded, or when
/// a thrown exception finds no handler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Fault {
    #[error("null reference")]
    NullReference,
    #[error("index out of bounds: {0}")]
    IndexOutOfBounds(i64),
    #[error("key not found: \"{0}\"")]
    KeyNotFound(SmolStr),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid conversion to {0}")]
    InvalidConversion(&'static str),
    #[error("maximum call depth exceeded ({0})")]
    CallDepthExceeded(u32),
    #[error("routine expects {expected} arguments, got {got}")]
    ArityMismatch { expected: u16, got: u16 },
    #[error("host function error: {0}")]
    Host(String),
    #[error("uncaught exception of kind {}", .0.kind_name())]
    Uncaught(Value),
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::NullReference => FaultKind::NullReference,
            Fault::IndexOutOfBounds(_) => FaultKind::IndexOutOfBounds,
            Fault::KeyNotFound(_) => FaultKind::KeyNotFound,
            Fault::Overflow => FaultKind::Overflow,
            Fault::DivisionByZero => FaultKind::DivisionByZero,
            Fault::InvalidConversion(_) => FaultKind::InvalidConversion,
            Fault::CallDepthExceeded(_) => FaultKind::CallDepthExceeded,
            Fault::ArityMismatch { .. } => FaultKind::Arity,
            Fault::Host(_) => FaultKind::Host,
            Fault::Uncaught(_) => FaultKind::Uncaught,
        }
    }
}
