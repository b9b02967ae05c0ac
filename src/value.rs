//! Runtime values produced and consumed by the virtual machine.
//!
//! Arrays and hashes are wrapped in `Rc` without `RefCell`: the opcode table
//! has no instruction that mutates an existing array or hash in place
//! (`OpArray`/`OpHash` only ever build a fresh one from stack values), so
//! plain shared ownership is enough — no interior mutability needed.

use std::fmt;
use std::rc::Rc;

use ecow::EcoString;
use hashbrown::HashMap;

use crate::constant::CompiledFunction;

/// A hashable runtime value, usable as a hash-literal key. Floats have no
/// well-defined equality for hashing and are therefore not representable
/// here; building a hash with a float key is a runtime error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Int(i64),
    Str(EcoString),
    Bool(bool),
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashKey::Int(v) => write!(f, "{v}"),
            HashKey::Str(v) => write!(f, "{v}"),
            HashKey::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A compiled function paired with the values of its captured free
/// variables, in capture order.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub function: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

#[derive(Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(EcoString),
    Bool(bool),
    Null,
    Array(Rc<Vec<Value>>),
    Hash(Rc<HashMap<HashKey, Value>>),
    Closure(Rc<Closure>),
    Builtin(Builtin),
}

/// A builtin function: a name (for display/debugging) and the native
/// implementation. Builtin errors are plain messages — the VM wraps them
/// into `RuntimeError::Builtin` at the call site, keeping this module free
/// of a dependency on the VM's error type.
#[derive(Clone)]
pub struct Builtin {
    pub name: &'static str,
    pub func: fn(&[Value]) -> Result<Value, String>,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Builtin({})", self.name)
    }
}

impl PartialEq for Builtin {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Value {
    /// Every value is truthy except `Null` and boolean `false`. Integer
    /// zero is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
            Value::Null => "null",
            Value::Array(_) => "array",
            Value::Hash(_) => "hash",
            Value::Closure(_) => "function",
            Value::Builtin(_) => "builtin",
        }
    }

    /// Converts to a hash key, if this value is of a hashable kind.
    pub fn as_hash_key(&self) -> Option<HashKey> {
        match self {
            Value::Int(v) => Some(HashKey::Int(*v)),
            Value::Str(v) => Some(HashKey::Str(v.clone())),
            Value::Bool(v) => Some(HashKey::Bool(*v)),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Null => write!(f, "null"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Hash(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Closure(closure) => write!(f, "<function, {} free>", closure.free.len()),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name),
        }
    }
}
