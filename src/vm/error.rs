//! Errors raised while executing a bytecode program.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    StackOverflow,
    StackUnderflow,
    DivisionByZero,
    IndexOutOfBounds { index: i64, length: usize },
    UnhashableKey(&'static str),
    NotCallable(&'static str),
    WrongArgumentCount { expected: usize, got: usize },
    UnsupportedOperation { op: &'static str, operand: &'static str },
    UnknownOpcode(u8),
    /// A builtin's own native implementation rejected its arguments.
    Builtin(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::StackUnderflow => write!(f, "stack underflow"),
            RuntimeError::DivisionByZero => write!(f, "division by zero"),
            RuntimeError::IndexOutOfBounds { index, length } => {
                write!(f, "index {index} out of bounds for a collection of length {length}")
            }
            RuntimeError::UnhashableKey(type_name) => {
                write!(f, "value of type '{type_name}' cannot be used as a hash key")
            }
            RuntimeError::NotCallable(type_name) => {
                write!(f, "value of type '{type_name}' is not callable")
            }
            RuntimeError::WrongArgumentCount { expected, got } => {
                write!(f, "expected {expected} argument(s), got {got}")
            }
            RuntimeError::UnsupportedOperation { op, operand } => {
                write!(f, "operator '{op}' is not supported for type '{operand}'")
            }
            RuntimeError::UnknownOpcode(byte) => write!(f, "unknown opcode byte {byte}"),
            RuntimeError::Builtin(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for RuntimeError {}
