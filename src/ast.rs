//! The abstract syntax tree the compiler consumes.
//!
//! This is the compiler's input contract, not a parser: the surface-syntax
//! parser that turns Bengali-script source text into these node shapes is an
//! external collaborator. A flat tagged-variant tree with a single `match`
//! in the compiler is used instead of a visitor hierarchy, matching how
//! dynamic dispatch over nodes is done elsewhere in this crate.

/// A literal value that can appear directly in source.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// A value-producing node. Compiling one leaves exactly one value on the
/// VM's stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        consequence: Block,
        alternative: Option<Block>,
    },
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    Index {
        container: Box<Expr>,
        index: Box<Expr>,
    },
    Function {
        name: Option<String>,
        params: Vec<String>,
        body: Block,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// A statement node. Compiling one leaves the stack exactly as it found it.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Let { name: String, value: Expr },
    Assign { name: String, value: Expr },
    Return(Option<Expr>),
    While { cond: Expr, body: Block },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Block,
    },
    Break,
    Continue,
    Block(Block),
    /// `import <path>`. Only a string-literal path is a valid import
    /// target; anything else is a compile error (see `set_module_loader`).
    Import(Expr),
}

/// An ordered sequence of statements, e.g. a function body or a branch of
/// an `if`.
pub type Block = Vec<Stmt>;
