use crate::codegen::CodegenError;
use crate::parser::ParserError;

/// Failure reported by an IR backend while building instructions.
#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("no insertion point set for the builder")]
    NoInsertionPoint,
    #[error("function no longer exists in the module")]
    MissingFunction,
    #[error("builder error: {0}")]
    Builder(String),
}

/// Failure while executing a lowered function.
#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("unresolved external function {0} with {1} arguments")]
    UnresolvedExtern(String, usize),
    #[error("only functions without parameters can be evaluated, {0} takes {1}")]
    NotNullary(String, usize),
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("function no longer exists in the module")]
    MissingFunction,
    #[error("malformed function {0}")]
    Malformed(String),
    #[error("execution engine error: {0}")]
    Engine(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParserError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
