//! Compile-time errors.
//!
//! Compile errors abort `Compiler::compile` immediately — once one is
//! returned, the compiler that produced it is left in an undefined state
//! and must not be reused.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    UndefinedIdentifier(String),
    AssignToUndefined(String),
    BreakOutsideLoop,
    ContinueOutsideLoop,
    ImportPathNotString,
    ModuleLoaderFailure { path: String, message: String },
    TooManyConstants,
    TooManyGlobals,
    FunctionTooLarge,
    TooManyLocals,
    TooManyFreeVariables,
    TooManyArguments,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UndefinedIdentifier(name) => {
                write!(f, "undefined identifier '{name}'")
            }
            CompileError::AssignToUndefined(name) => {
                write!(f, "cannot assign to undefined identifier '{name}'")
            }
            CompileError::BreakOutsideLoop => write!(f, "'break' outside any loop"),
            CompileError::ContinueOutsideLoop => write!(f, "'continue' outside any loop"),
            CompileError::ImportPathNotString => {
                write!(f, "import path must be a string literal")
            }
            CompileError::ModuleLoaderFailure { path, message } => {
                write!(f, "failed to load module '{path}': {message}")
            }
            CompileError::TooManyConstants => {
                write!(f, "more than 65536 constants in one compilation")
            }
            CompileError::TooManyGlobals => write!(f, "more than 65536 global slots"),
            CompileError::FunctionTooLarge => {
                write!(f, "function body exceeds 65536 bytes of instructions")
            }
            CompileError::TooManyLocals => write!(f, "more than 256 locals in one function"),
            CompileError::TooManyFreeVariables => {
                write!(f, "more than 256 free variables captured by one closure")
            }
            CompileError::TooManyArguments => write!(f, "more than 256 arguments in one call"),
        }
    }
}

impl std::error::Error for CompileError {}
