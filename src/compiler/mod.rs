//! Lowers an [`ast::Block`] into bytecode.
//!
//! The compiler walks the tree once; each expression node has a net stack
//! effect of +1, each statement node a net effect of 0 (an expression
//! statement wraps its expression with a trailing `OpPop`). Compilation
//! scopes and symbol-table scopes are independently-owned records kept in
//! parallel stacks indexed by nesting depth, rather than mutually pointing
//! objects, which sidesteps the cyclic-reference problem a compiler/scope
//! object graph would otherwise have.

pub mod error;
#[cfg(test)]
mod compiler_test;

pub use error::CompileError;

use hashbrown::HashSet;

use crate::ast::{Block, CompareOp, Expr, Literal, LogicalOp, Stmt};
use crate::constant::{CompiledFunction, Constant, ConstantPool};
use crate::opcode::{make, Op};
use crate::symbol_table::{Symbol, SymbolScope, SymbolTable};
use crate::Bytecode;

/// The fixed builtin table this crate supplies, in `OpGetBuiltin` index
/// order. See `vm::builtins` for the native implementations.
pub const BUILTINS: &[&str] = &["len", "first", "last", "rest", "push"];

/// Resolves an import path to the module body that should be compiled in
/// its place. A from-scratch module loader would hand back source text for
/// an external parser to handle; since this crate has no parser, the loader
/// here returns the already-parsed block directly — the narrowest change
/// that keeps the hook's position in the pipeline (invoked mid-compilation,
/// compiled into the same compiler state) faithful to the original contract.
pub type ModuleLoader = Box<dyn FnMut(&str) -> Result<Block, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EmittedInstruction {
    op: Op,
    position: usize,
}

/// Per in-progress function: the instruction buffer being built plus the
/// last two emitted instructions, used for the peephole decisions
/// (trailing-pop removal, pop-to-return conversion) node compilation needs.
#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Vec<u8>,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

/// Pushed on loop entry, popped on exit; collects the positions of
/// break/continue jump placeholders emitted before their targets are known.
struct LoopContext {
    loop_start: usize,
    break_sites: Vec<usize>,
    continue_sites: Vec<usize>,
}

pub struct Compiler {
    constants: ConstantPool,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
    loops: Vec<LoopContext>,
    module_loader: Option<ModuleLoader>,
    /// Paths already imported. A path is inserted here before its module
    /// body is compiled, not after: if compilation of that body fails, the
    /// entry is not removed, so re-importing it is a no-op rather than a
    /// retry (see design notes on import cycle handling).
    loaded_modules: HashSet<String>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    /// A fresh compiler with a global scope that has every builtin
    /// pre-defined.
    pub fn new() -> Self {
        let mut symbol_table = SymbolTable::new();
        for (index, name) in BUILTINS.iter().enumerate() {
            symbol_table.define_builtin(index as u16, name);
        }
        Self {
            constants: ConstantPool::new(),
            symbol_table,
            scopes: vec![CompilationScope::default()],
            loops: Vec::new(),
            module_loader: None,
            loaded_modules: HashSet::new(),
        }
    }

    /// Seeds a compiler from prior state, for incremental use (e.g. an
    /// interactive shell compiling one statement at a time against an
    /// accumulated symbol table and constant pool).
    pub fn new_with_state(symbol_table: SymbolTable, constants: ConstantPool) -> Self {
        Self {
            constants,
            symbol_table,
            scopes: vec![CompilationScope::default()],
            loops: Vec::new(),
            module_loader: None,
            loaded_modules: HashSet::new(),
        }
    }

    pub fn set_module_loader(&mut self, loader: ModuleLoader) {
        self.module_loader = Some(loader);
    }

    /// Compiles a full program (or, with `new_with_state`, the next
    /// increment of one). On error the compiler must not be reused.
    pub fn compile(&mut self, program: &Block) -> Result<(), CompileError> {
        self.compile_block(program)
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: self.current_instructions().to_vec(),
            constants: self.constants.as_slice().to_vec(),
        }
    }

    pub fn symbol_table(&self) -> &SymbolTable {
        &self.symbol_table
    }

    pub fn into_parts(self) -> (SymbolTable, ConstantPool) {
        (self.symbol_table, self.constants)
    }

    // === Stack management helpers ===

    fn current_scope(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("compiler always has at least one scope")
    }

    fn current_instructions(&self) -> &[u8] {
        &self.scopes.last().expect("compiler always has at least one scope").instructions
    }

    // === Emission primitives ===

    fn emit(&mut self, op: Op, operands: &[u32]) -> usize {
        let encoded = make(op, operands);
        let position = self.current_instructions().len();
        let scope = self.current_scope();
        scope.instructions.extend_from_slice(&encoded);
        scope.previous_instruction = scope.last_instruction;
        scope.last_instruction = Some(EmittedInstruction { op, position });
        position
    }

    fn last_instruction_is(&self, op: Op) -> bool {
        matches!(self.scopes.last().unwrap().last_instruction, Some(e) if e.op == op)
    }

    /// Truncates the buffer to drop a trailing pop, used when an
    /// if-branch's value must remain on the stack.
    fn remove_last_pop(&mut self) {
        let scope = self.current_scope();
        if let Some(last) = scope.last_instruction {
            scope.instructions.truncate(last.position);
            scope.last_instruction = scope.previous_instruction;
        }
    }

    fn replace_instruction(&mut self, position: usize, new_instruction: Vec<u8>) {
        let scope = self.current_scope();
        scope.instructions[position..position + new_instruction.len()]
            .copy_from_slice(&new_instruction);
    }

    /// Re-encodes the instruction at `position` with its original opcode
    /// and `operand`, used for jump back-patching.
    fn change_operand(&mut self, position: usize, operand: u32) {
        let op = Op::from_byte(self.current_instructions()[position])
            .expect("patch site holds a previously-emitted valid opcode");
        let new_instruction = make(op, &[operand]);
        self.replace_instruction(position, new_instruction);
        tracing::trace!(?op, position, operand, "patched jump target");
    }

    /// Converts the trailing pop into a value-return, used to implement
    /// implicit last-expression returns in function bodies.
    fn replace_last_pop_with_return_value(&mut self) {
        let last_position = self
            .scopes
            .last()
            .unwrap()
            .last_instruction
            .expect("replace_last_pop_with_return_value called with no emitted instruction")
            .position;
        self.replace_instruction(last_position, make(Op::ReturnValue, &[]));
        self.current_scope().last_instruction = Some(EmittedInstruction {
            op: Op::ReturnValue,
            position: last_position,
        });
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        let outer = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::new_enclosed(outer);
        tracing::debug!("entered function compilation scope");
    }

    fn leave_scope(&mut self) -> Vec<u8> {
        let scope = self
            .scopes
            .pop()
            .expect("leave_scope called without a matching enter_scope");
        let inner = std::mem::take(&mut self.symbol_table);
        self.symbol_table = inner.pop();
        tracing::debug!("left function compilation scope");
        scope.instructions
    }

    fn add_constant(&mut self, value: Constant) -> Result<u32, CompileError> {
        if self.constants.len() >= u16::MAX as usize + 1 {
            return Err(CompileError::TooManyConstants);
        }
        Ok(self.constants.add(value) as u32)
    }

    fn define(&mut self, name: &str) -> Result<Symbol, CompileError> {
        if self.symbol_table.is_global() {
            if self.symbol_table.num_definitions() as usize >= u16::MAX as usize + 1 {
                return Err(CompileError::TooManyGlobals);
            }
        } else if self.symbol_table.num_definitions() >= 256 {
            return Err(CompileError::TooManyLocals);
        }
        Ok(self.symbol_table.define(name))
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => {
                self.emit(Op::GetGlobal, &[symbol.index as u32]);
            }
            SymbolScope::Local => {
                self.emit(Op::GetLocal, &[symbol.index as u32]);
            }
            SymbolScope::Builtin => {
                self.emit(Op::GetBuiltin, &[symbol.index as u32]);
            }
            SymbolScope::Free => {
                self.emit(Op::GetFree, &[symbol.index as u32]);
            }
            SymbolScope::FunctionSelf => {
                self.emit(Op::CurrentClosure, &[]);
            }
        }
    }

    fn store_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => {
                self.emit(Op::SetGlobal, &[symbol.index as u32]);
            }
            SymbolScope::Local => {
                self.emit(Op::SetLocal, &[symbol.index as u32]);
            }
            other => unreachable!("cannot assign to a {other:?} symbol"),
        }
    }

    // === Statements ===

    fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        for stmt in block {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop, &[]);
            }
            Stmt::Let { name, value } => {
                // Symbol must exist before the initializer compiles, so an
                // unnamed self-referential function literal (no function-self
                // symbol injected) still resolves its own name to the
                // just-allocated slot instead of failing as undefined.
                let symbol = self.define(name)?;
                self.compile_expr(value)?;
                self.store_symbol(&symbol);
            }
            Stmt::Assign { name, value } => {
                let symbol = self
                    .symbol_table
                    .resolve(name)
                    .ok_or_else(|| CompileError::AssignToUndefined(name.clone()))?;
                self.compile_expr(value)?;
                self.store_symbol(&symbol);
            }
            Stmt::Return(value) => match value {
                Some(expr) => {
                    self.compile_expr(expr)?;
                    self.emit(Op::ReturnValue, &[]);
                }
                None => {
                    self.emit(Op::ReturnVoid, &[]);
                }
            },
            Stmt::While { cond, body } => self.compile_while(cond, body)?,
            Stmt::For { init, cond, step, body } => {
                self.compile_for(init.as_deref(), cond.as_ref(), step.as_deref(), body)?
            }
            Stmt::Break => {
                let position = self.emit(Op::Jump, &[u16::MAX as u32]);
                self.loops
                    .last_mut()
                    .ok_or(CompileError::BreakOutsideLoop)?
                    .break_sites
                    .push(position);
            }
            Stmt::Continue => {
                let position = self.emit(Op::Jump, &[u16::MAX as u32]);
                self.loops
                    .last_mut()
                    .ok_or(CompileError::ContinueOutsideLoop)?
                    .continue_sites
                    .push(position);
            }
            Stmt::Block(block) => self.compile_block(block)?,
            Stmt::Import(path) => self.compile_import(path)?,
        }
        Ok(())
    }

    /// `while` is a statement, not an expression: its body's statements each
    /// already balance the stack on their own, so unlike `compile_if` this
    /// must not touch a trailing pop or push a synthetic result value.
    fn compile_while(&mut self, cond: &Expr, body: &Block) -> Result<(), CompileError> {
        let loop_start = self.current_instructions().len();
        self.loops.push(LoopContext {
            loop_start,
            break_sites: Vec::new(),
            continue_sites: Vec::new(),
        });

        self.compile_expr(cond)?;
        let jump_not_truthy = self.emit(Op::JumpNotTruthy, &[u16::MAX as u32]);

        self.compile_block(body)?;
        self.emit(Op::Jump, &[loop_start as u32]);

        let loop_end = self.current_instructions().len();
        self.change_operand(jump_not_truthy, loop_end as u32);

        let ctx = self.loops.pop().expect("loop context pushed above");
        for site in ctx.break_sites {
            self.change_operand(site, loop_end as u32);
        }
        for site in ctx.continue_sites {
            self.change_operand(site, loop_start as u32);
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &Block,
    ) -> Result<(), CompileError> {
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }

        let loop_start = self.current_instructions().len();
        self.loops.push(LoopContext {
            loop_start,
            break_sites: Vec::new(),
            continue_sites: Vec::new(),
        });

        let cond_jump = match cond {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit(Op::JumpNotTruthy, &[u16::MAX as u32]))
            }
            None => None,
        };

        self.compile_block(body)?;

        // Continue jumps here, to the increment step, not to the loop head.
        let continue_target = self.current_instructions().len();
        if let Some(step) = step {
            self.compile_stmt(step)?;
        }
        self.emit(Op::Jump, &[loop_start as u32]);

        let loop_end = self.current_instructions().len();
        if let Some(pos) = cond_jump {
            self.change_operand(pos, loop_end as u32);
        }

        let ctx = self.loops.pop().expect("loop context pushed above");
        for site in ctx.break_sites {
            self.change_operand(site, loop_end as u32);
        }
        for site in ctx.continue_sites {
            self.change_operand(site, continue_target as u32);
        }
        Ok(())
    }

    fn compile_import(&mut self, path_expr: &Expr) -> Result<(), CompileError> {
        let Expr::Literal(Literal::Str(path)) = path_expr else {
            return Err(CompileError::ImportPathNotString);
        };
        if self.loaded_modules.contains(path) {
            return Ok(());
        }
        self.loaded_modules.insert(path.clone());

        let loader = self.module_loader.as_mut().ok_or_else(|| {
            CompileError::ModuleLoaderFailure {
                path: path.clone(),
                message: "no module loader configured".to_string(),
            }
        })?;
        let module_body = loader(path).map_err(|message| CompileError::ModuleLoaderFailure {
            path: path.clone(),
            message,
        })?;
        self.compile_block(&module_body)
    }

    // === Expressions ===

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Literal(lit) => self.compile_literal(lit)?,
            Expr::Ident(name) => {
                let symbol = self
                    .symbol_table
                    .resolve(name)
                    .ok_or_else(|| CompileError::UndefinedIdentifier(name.clone()))?;
                self.load_symbol(&symbol);
            }
            Expr::Binary { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(binary_opcode(*op), &[]);
            }
            Expr::Compare { op, left, right } => self.compile_compare(*op, left, right)?,
            Expr::Logical { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let opcode = match op {
                    LogicalOp::And => Op::And,
                    LogicalOp::Or => Op::Or,
                };
                self.emit(opcode, &[]);
            }
            Expr::Unary { op, expr } => {
                self.compile_expr(expr)?;
                let opcode = match op {
                    crate::ast::UnaryOp::Neg => Op::Minus,
                    crate::ast::UnaryOp::Not => Op::Bang,
                };
                self.emit(opcode, &[]);
            }
            Expr::If { cond, consequence, alternative } => {
                self.compile_if(cond, consequence, alternative.as_ref())?
            }
            Expr::Array(elements) => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Op::Array, &[elements.len() as u32]);
            }
            Expr::Hash(pairs) => self.compile_hash(pairs)?,
            Expr::Index { container, index } => {
                self.compile_expr(container)?;
                self.compile_expr(index)?;
                self.emit(Op::Index, &[]);
            }
            Expr::Function { name, params, body } => {
                self.compile_function(name.as_deref(), params, body)?
            }
            Expr::Call { callee, args } => {
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                if args.len() > 255 {
                    return Err(CompileError::TooManyArguments);
                }
                self.emit(Op::Call, &[args.len() as u32]);
            }
        }
        Ok(())
    }

    fn compile_literal(&mut self, lit: &Literal) -> Result<(), CompileError> {
        match lit {
            Literal::Bool(true) => {
                self.emit(Op::True, &[]);
            }
            Literal::Bool(false) => {
                self.emit(Op::False, &[]);
            }
            Literal::Null => {
                self.emit(Op::Null, &[]);
            }
            Literal::Int(v) => {
                let index = self.add_constant(Constant::Int(*v))?;
                self.emit(Op::Constant, &[index]);
            }
            Literal::Float(v) => {
                let index = self.add_constant(Constant::Float(*v))?;
                self.emit(Op::Constant, &[index]);
            }
            Literal::Str(s) => {
                let index = self.add_constant(Constant::Str(s.clone()))?;
                self.emit(Op::Constant, &[index]);
            }
        }
        Ok(())
    }

    fn compile_compare(&mut self, op: CompareOp, left: &Expr, right: &Expr) -> Result<(), CompileError> {
        match op {
            CompareOp::Lt => {
                self.compile_expr(right)?;
                self.compile_expr(left)?;
                self.emit(Op::GreaterThan, &[]);
            }
            CompareOp::LtEq => {
                self.compile_expr(right)?;
                self.compile_expr(left)?;
                self.emit(Op::GreaterEqual, &[]);
            }
            CompareOp::Gt => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Op::GreaterThan, &[]);
            }
            CompareOp::GtEq => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Op::GreaterEqual, &[]);
            }
            CompareOp::Eq => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Op::Equal, &[]);
            }
            CompareOp::NotEq => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Op::NotEqual, &[]);
            }
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        consequence: &Block,
        alternative: Option<&Block>,
    ) -> Result<(), CompileError> {
        self.compile_expr(cond)?;
        let jump_not_truthy = self.emit(Op::JumpNotTruthy, &[u16::MAX as u32]);

        self.compile_block(consequence)?;
        if self.last_instruction_is(Op::Pop) {
            self.remove_last_pop();
        }
        let jump_over_alternative = self.emit(Op::Jump, &[u16::MAX as u32]);

        let after_consequence = self.current_instructions().len();
        self.change_operand(jump_not_truthy, after_consequence as u32);

        match alternative {
            None => {
                self.emit(Op::Null, &[]);
            }
            Some(alternative) => {
                self.compile_block(alternative)?;
                if self.last_instruction_is(Op::Pop) {
                    self.remove_last_pop();
                }
            }
        }

        let after_alternative = self.current_instructions().len();
        self.change_operand(jump_over_alternative, after_alternative as u32);
        Ok(())
    }

    /// Keys are sorted by their textual (debug) representation before
    /// emission, imposing a deterministic bytecode order regardless of the
    /// AST's own key ordering. The runtime hash remains unordered.
    fn compile_hash(&mut self, pairs: &[(Expr, Expr)]) -> Result<(), CompileError> {
        let mut ordered: Vec<&(Expr, Expr)> = pairs.iter().collect();
        ordered.sort_by_key(|(key, _)| format!("{key:?}"));
        for (key, value) in &ordered {
            self.compile_expr(key)?;
            self.compile_expr(value)?;
        }
        self.emit(Op::Hash, &[(pairs.len() as u32) * 2]);
        Ok(())
    }

    fn compile_function(
        &mut self,
        name: Option<&str>,
        params: &[String],
        body: &Block,
    ) -> Result<(), CompileError> {
        self.enter_scope();

        if let Some(name) = name {
            self.symbol_table.define_function_name(name);
        }
        for param in params {
            self.define(param)?;
        }

        self.compile_block(body)?;
        if self.last_instruction_is(Op::Pop) {
            self.replace_last_pop_with_return_value();
        }
        if !self.last_instruction_is(Op::ReturnValue) {
            self.emit(Op::ReturnVoid, &[]);
        }

        let free_symbols = self.symbol_table.free_symbols.clone();
        let num_locals = self.symbol_table.num_definitions();
        let instructions = self.leave_scope();

        if free_symbols.len() > 255 {
            return Err(CompileError::TooManyFreeVariables);
        }
        if num_locals as usize > 255 {
            return Err(CompileError::TooManyLocals);
        }
        if instructions.len() > u16::MAX as usize {
            return Err(CompileError::FunctionTooLarge);
        }

        // Captured values are loaded in the now-current enclosing scope, in
        // capture order, so they sit on the stack exactly where OpClosure
        // expects them.
        for symbol in &free_symbols {
            self.load_symbol(symbol);
        }

        let compiled = CompiledFunction {
            instructions,
            num_locals: num_locals as u8,
            num_parameters: params.len() as u8,
        };
        let fn_index = self.add_constant(Constant::CompiledFunction(compiled))?;
        self.emit(Op::Closure, &[fn_index, free_symbols.len() as u32]);
        Ok(())
    }
}

fn binary_opcode(op: crate::ast::BinaryOp) -> Op {
    use crate::ast::BinaryOp::*;
    match op {
        Add => Op::Add,
        Sub => Op::Sub,
        Mul => Op::Mul,
        Div => Op::Div,
        Mod => Op::Mod,
    }
}
