//! Front end for a tiny expression language of doubles: a streaming lexer, a
//! precedence-climbing parser, and a code generator that lowers the AST into
//! any IR library implementing [`codegen::Backend`].

pub mod ast;
pub mod codegen;
pub mod driver;
pub mod error;
pub mod ir;
pub mod lexer;
#[cfg(feature = "llvm")]
pub mod llvm;
pub mod parser;

pub use error::Error;
