//! The execution contract the compiler targets: a value stack, a call-frame
//! stack, a globals array, and a fetch-decode-dispatch loop.
//!
//! Grounded on `core/src/vm/runtime.rs`'s loop shape (wide-arg accumulation
//! per opcode, a frame stack pushed/popped on `Call`/`Return`), generalized
//! from that file's unsafe arena/union dispatch to a safe enum-`Value`
//! dispatch — see `DESIGN.md` for why the unsafe pattern isn't reused here.

pub mod builtins;
pub mod error;

pub use error::RuntimeError;

use std::rc::Rc;

use smallvec::SmallVec;

use crate::constant::{CompiledFunction, Constant};
use crate::opcode::{read_operands, Op};
use crate::value::{Closure, Value};
use crate::Bytecode;

mod stack;
pub use stack::Stack;

const STACK_SIZE: usize = 2048;
const MAX_FRAMES: usize = 1024;

/// Per-call record: the executing closure, an instruction pointer into that
/// closure's function's bytes, and a base pointer marking where this
/// frame's locals begin on the value stack.
struct Frame {
    closure: Rc<Closure>,
    ip: usize,
    base_pointer: usize,
}

impl Frame {
    fn instructions(&self) -> &[u8] {
        &self.closure.function.instructions
    }
}

pub struct Vm {
    constants: Vec<Constant>,
    globals: Vec<Value>,
    stack: Stack<Value>,
    frames: Vec<Frame>,
    builtins: &'static [Value],
    /// The last value an `OpPop` removed. Exposed so a host (e.g. an
    /// interactive shell) can observe a program's final expression value
    /// without the compiler retaining it on the stack — see spec design
    /// notes on the "last statement is an expression statement" pattern.
    last_popped: Option<Value>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        Self::new_with_globals(bytecode, Vec::new())
    }

    /// Seeds a VM with an existing globals array, for incremental use (an
    /// interactive shell re-running the VM against one accumulated globals
    /// array across each compiled increment), mirroring
    /// `Compiler::new_with_state` on the compile side.
    pub fn new_with_globals(bytecode: Bytecode, globals: Vec<Value>) -> Self {
        let main_fn = Rc::new(CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_parameters: 0,
        });
        let main_closure = Rc::new(Closure { function: main_fn, free: Vec::new() });
        let main_frame = Frame { closure: main_closure, ip: 0, base_pointer: 0 };
        Self {
            constants: bytecode.constants,
            globals,
            stack: Stack::new(STACK_SIZE),
            frames: vec![main_frame],
            builtins: builtins::BUILTINS,
            last_popped: None,
        }
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    pub fn into_globals(self) -> Vec<Value> {
        self.globals
    }

    pub fn last_popped(&self) -> Option<&Value> {
        self.last_popped.as_ref()
    }

    fn current_frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("VM always has at least the main frame")
    }

    /// Runs until the main frame returns. Returns the last value `OpPop`
    /// removed (or `Null` if the program never popped anything), matching
    /// the convenience a REPL wants without changing the compiler's
    /// stack-neutral statement contract.
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let (ip, ins_len) = {
                let frame = self.current_frame();
                (frame.ip, frame.instructions().len())
            };
            if self.frames.len() == 1 && ip >= ins_len {
                break;
            }

            let op_byte = self.current_frame().instructions()[ip];
            let Some(op) = Op::from_byte(op_byte) else {
                return Err(RuntimeError::UnknownOpcode(op_byte));
            };
            let def = op.definition();
            let (operands, width) = {
                let frame = self.current_frame();
                read_operands(def, &frame.instructions()[ip + 1..])
            };
            self.current_frame().ip = ip + 1 + width;

            self.execute(op, &operands)?;
        }
        Ok(self.last_popped.clone().unwrap_or(Value::Null))
    }

    fn execute(&mut self, op: Op, operands: &[u32]) -> Result<(), RuntimeError> {
        match op {
            Op::Constant => {
                let constant = &self.constants[operands[0] as usize];
                let value = constant_to_value(constant);
                self.push(value)?;
            }
            Op::Pop => {
                let value = self.pop()?;
                self.last_popped = Some(value);
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => self.execute_arithmetic(op)?,
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Null => self.push(Value::Null)?,
            Op::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a == b))?;
            }
            Op::NotEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a != b))?;
            }
            Op::GreaterThan => self.execute_comparison(|a, b| a > b, |a, b| a > b)?,
            Op::GreaterEqual => self.execute_comparison(|a, b| a >= b, |a, b| a >= b)?,
            Op::Minus => {
                let a = self.pop()?;
                let result = match a {
                    Value::Int(v) => Value::Int(-v),
                    Value::Float(v) => Value::Float(-v),
                    other => {
                        return Err(RuntimeError::UnsupportedOperation {
                            op: "-",
                            operand: other.type_name(),
                        })
                    }
                };
                self.push(result)?;
            }
            Op::Bang => {
                let a = self.pop()?;
                self.push(Value::Bool(!a.is_truthy()))?;
            }
            Op::And => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a.is_truthy() && b.is_truthy()))?;
            }
            Op::Or => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a.is_truthy() || b.is_truthy()))?;
            }
            Op::JumpNotTruthy => {
                let condition = self.pop()?;
                if !condition.is_truthy() {
                    self.current_frame().ip = operands[0] as usize;
                }
            }
            Op::Jump => {
                self.current_frame().ip = operands[0] as usize;
            }
            Op::GetGlobal => {
                let index = operands[0] as usize;
                let value = self.globals.get(index).cloned().unwrap_or(Value::Null);
                self.push(value)?;
            }
            Op::SetGlobal => {
                let index = operands[0] as usize;
                let value = self.pop()?;
                if index >= self.globals.len() {
                    self.globals.resize(index + 1, Value::Null);
                }
                self.globals[index] = value;
            }
            Op::GetLocal => {
                let base = self.current_frame().base_pointer;
                let index = base + operands[0] as usize;
                let value = self.stack.get_abs(index).cloned().ok_or(RuntimeError::StackUnderflow)?;
                self.push(value)?;
            }
            Op::SetLocal => {
                let base = self.current_frame().base_pointer;
                let index = base + operands[0] as usize;
                let value = self.pop()?;
                self.stack.set_abs(index, value);
            }
            Op::GetBuiltin => {
                let value = self
                    .builtins
                    .get(operands[0] as usize)
                    .cloned()
                    .expect("compiler only emits builtin indices that exist");
                self.push(value)?;
            }
            Op::Array => self.execute_array(operands[0] as usize)?,
            Op::Hash => self.execute_hash(operands[0] as usize)?,
            Op::Index => self.execute_index()?,
            Op::Call => self.execute_call(operands[0] as usize)?,
            Op::ReturnValue => {
                let value = self.pop()?;
                self.pop_frame(value)?;
            }
            Op::ReturnVoid => {
                self.pop_frame(Value::Null)?;
            }
            Op::Closure => self.execute_closure(operands[0] as usize, operands[1] as usize)?,
            Op::GetFree => {
                let index = operands[0] as usize;
                let value = self.current_frame().closure.free[index].clone();
                self.push(value)?;
            }
            Op::CurrentClosure => {
                let closure = self.current_frame().closure.clone();
                self.push(Value::Closure(closure))?;
            }
        }
        Ok(())
    }

    #[inline]
    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.stack.capacity() {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn execute_arithmetic(&mut self, op: Op) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => {
                let v = match op {
                    Op::Add => x.checked_add(*y),
                    Op::Sub => x.checked_sub(*y),
                    Op::Mul => x.checked_mul(*y),
                    Op::Div => {
                        if *y == 0 {
                            return Err(RuntimeError::DivisionByZero);
                        }
                        x.checked_div(*y)
                    }
                    Op::Mod => {
                        if *y == 0 {
                            return Err(RuntimeError::DivisionByZero);
                        }
                        x.checked_rem(*y)
                    }
                    _ => unreachable!("execute_arithmetic called with a non-arithmetic opcode"),
                };
                Value::Int(v.unwrap_or_else(|| wrapping_int_op(op, *x, *y)))
            }
            (Value::Float(x), Value::Float(y)) => Value::Float(match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div => x / y,
                Op::Mod => x % y,
                _ => unreachable!("execute_arithmetic called with a non-arithmetic opcode"),
            }),
            (Value::Str(x), Value::Str(y)) if op == Op::Add => {
                Value::Str(format!("{x}{y}").into())
            }
            _ => {
                return Err(RuntimeError::UnsupportedOperation {
                    op: op.name(),
                    operand: a.type_name(),
                })
            }
        };
        self.push(result)
    }

    fn execute_comparison(
        &mut self,
        int_cmp: fn(i64, i64) -> bool,
        float_cmp: fn(f64, f64) -> bool,
    ) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => int_cmp(*x, *y),
            (Value::Float(x), Value::Float(y)) => float_cmp(*x, *y),
            _ => {
                return Err(RuntimeError::UnsupportedOperation {
                    op: "comparison",
                    operand: a.type_name(),
                })
            }
        };
        self.push(Value::Bool(result))
    }

    fn execute_array(&mut self, count: usize) -> Result<(), RuntimeError> {
        let items = self
            .stack
            .top_n(count)
            .ok_or(RuntimeError::StackUnderflow)?
            .to_vec();
        self.stack.pop_n(count);
        self.push(Value::Array(Rc::new(items)))
    }

    fn execute_hash(&mut self, flat_count: usize) -> Result<(), RuntimeError> {
        let items = self
            .stack
            .top_n(flat_count)
            .ok_or(RuntimeError::StackUnderflow)?
            .to_vec();
        self.stack.pop_n(flat_count);

        let mut map = hashbrown::HashMap::with_capacity(flat_count / 2);
        for pair in items.chunks_exact(2) {
            let key = pair[0]
                .as_hash_key()
                .ok_or_else(|| RuntimeError::UnhashableKey(pair[0].type_name()))?;
            map.insert(key, pair[1].clone());
        }
        self.push(Value::Hash(Rc::new(map)))
    }

    fn execute_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop()?;
        let container = self.pop()?;
        let result = match &container {
            Value::Array(items) => {
                let Value::Int(i) = index else {
                    return Err(RuntimeError::UnsupportedOperation {
                        op: "index",
                        operand: index.type_name(),
                    });
                };
                if i < 0 || i as usize >= items.len() {
                    return Err(RuntimeError::IndexOutOfBounds { index: i, length: items.len() });
                }
                items[i as usize].clone()
            }
            Value::Hash(map) => {
                let key = index
                    .as_hash_key()
                    .ok_or_else(|| RuntimeError::UnhashableKey(index.type_name()))?;
                map.get(&key).cloned().unwrap_or(Value::Null)
            }
            other => {
                return Err(RuntimeError::UnsupportedOperation {
                    op: "index",
                    operand: other.type_name(),
                })
            }
        };
        self.push(result)
    }

    fn execute_call(&mut self, arg_count: usize) -> Result<(), RuntimeError> {
        let stack_len = self.stack.len();
        let callee_index = stack_len
            .checked_sub(arg_count + 1)
            .ok_or(RuntimeError::StackUnderflow)?;
        let callee = self
            .stack
            .get_abs(callee_index)
            .cloned()
            .ok_or(RuntimeError::StackUnderflow)?;

        match callee {
            Value::Closure(closure) => {
                let expected = closure.function.num_parameters as usize;
                if expected != arg_count {
                    return Err(RuntimeError::WrongArgumentCount { expected, got: arg_count });
                }
                let base_pointer = stack_len - arg_count;
                let num_locals = closure.function.num_locals as usize;
                if num_locals > arg_count {
                    self.stack.extend_with(num_locals - arg_count, Value::Null);
                }
                if self.frames.len() >= MAX_FRAMES {
                    return Err(RuntimeError::StackOverflow);
                }
                tracing::trace!(base_pointer, arg_count, "calling closure, pushing frame");
                self.frames.push(Frame { closure, ip: 0, base_pointer });
            }
            Value::Builtin(b) => {
                let args: SmallVec<[Value; 4]> =
                    self.stack.top_n(arg_count).ok_or(RuntimeError::StackUnderflow)?.into();
                let result = (b.func)(&args).map_err(|message| {
                    tracing::warn!(builtin = b.name, %message, "builtin call failed");
                    RuntimeError::Builtin(message)
                })?;
                self.stack.truncate(callee_index);
                self.push(result)?;
            }
            other => {
                return Err(RuntimeError::NotCallable(other.type_name()));
            }
        }
        Ok(())
    }

    fn pop_frame(&mut self, return_value: Value) -> Result<(), RuntimeError> {
        let frame = self.frames.pop().expect("ReturnValue/ReturnVoid always has a frame to pop");
        tracing::trace!(base_pointer = frame.base_pointer, "returning, popping frame");
        self.stack.truncate(frame.base_pointer.saturating_sub(1));
        self.push(return_value)
    }

    fn execute_closure(&mut self, fn_index: usize, free_count: usize) -> Result<(), RuntimeError> {
        let Constant::CompiledFunction(function) = &self.constants[fn_index] else {
            panic!("OpClosure's constant-pool index must name a compiled function");
        };
        let free = self
            .stack
            .top_n(free_count)
            .ok_or(RuntimeError::StackUnderflow)?
            .to_vec();
        self.stack.pop_n(free_count);
        let closure = Closure { function: Rc::new(function.clone()), free };
        self.push(Value::Closure(Rc::new(closure)))
    }
}

fn wrapping_int_op(op: Op, x: i64, y: i64) -> i64 {
    match op {
        Op::Add => x.wrapping_add(y),
        Op::Sub => x.wrapping_sub(y),
        Op::Mul => x.wrapping_mul(y),
        Op::Div => x.wrapping_div(y),
        Op::Mod => x.wrapping_rem(y),
        _ => unreachable!(),
    }
}

/// Converts a compile-time constant to a runtime value. Compiled-function
/// constants are never loaded this way in bytecode the compiler itself
/// emits (`OpClosure` consumes them directly) — this path exists so a
/// deserialized program with an unusual `OpConstant` target still has
/// defined behavior rather than panicking.
fn constant_to_value(constant: &Constant) -> Value {
    match constant {
        Constant::Int(v) => Value::Int(*v),
        Constant::Float(v) => Value::Float(*v),
        Constant::Str(s) => Value::Str(s.as_str().into()),
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Null => Value::Null,
        Constant::CompiledFunction(f) => {
            Value::Closure(Rc::new(Closure { function: Rc::new(f.clone()), free: Vec::new() }))
        }
        Constant::Array(items) => {
            Value::Array(Rc::new(items.iter().map(constant_to_value).collect()))
        }
        Constant::Hash(pairs) => {
            let mut map = hashbrown::HashMap::with_capacity(pairs.len());
            for (key, value) in pairs {
                if let Some(key) = constant_to_value(key).as_hash_key() {
                    map.insert(key, constant_to_value(value));
                }
            }
            Value::Hash(Rc::new(map))
        }
    }
}
