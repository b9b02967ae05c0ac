//! End-to-end compilation scenarios: disassembly output is asserted
//! verbatim, pinning down the exact byte-level instruction encoding each
//! program must compile to.

use pretty_assertions::assert_eq;

use super::*;
use crate::ast::*;
use crate::opcode::disassemble;

fn compile(program: &Block) -> Bytecode {
    let mut compiler = Compiler::new();
    compiler.compile(program).expect("program compiles");
    compiler.bytecode()
}

fn int(v: i64) -> Expr {
    Expr::Literal(Literal::Int(v))
}

#[test]
fn addition_expression_statement() {
    // `5 + 10;`
    let program = vec![Stmt::Expr(Expr::Binary {
        op: BinaryOp::Add,
        left: Box::new(int(5)),
        right: Box::new(int(10)),
    })];
    let bytecode = compile(&program);
    assert_eq!(
        disassemble(&bytecode.instructions),
        "0000 OpConstant 0\n0003 OpConstant 1\n0006 OpAdd\n0007 OpPop\n"
    );
    assert_eq!(bytecode.constants, vec![Constant::Int(5), Constant::Int(10)]);
}

#[test]
fn less_than_swaps_operands_to_reuse_greater_than() {
    // `1 < 2;`
    let program = vec![Stmt::Expr(Expr::Compare {
        op: CompareOp::Lt,
        left: Box::new(int(1)),
        right: Box::new(int(2)),
    })];
    let bytecode = compile(&program);
    assert_eq!(
        disassemble(&bytecode.instructions),
        "0000 OpConstant 0\n0003 OpConstant 1\n0006 OpGreaterThan\n0007 OpPop\n"
    );
    // operands were swapped: constant 0 is the literal `2`, constant 1 is `1`
    assert_eq!(bytecode.constants, vec![Constant::Int(2), Constant::Int(1)]);
}

#[test]
fn let_binding_and_global_load() {
    // `let x = 5; x;`
    let program = vec![
        Stmt::Let { name: "x".to_string(), value: int(5) },
        Stmt::Expr(Expr::Ident("x".to_string())),
    ];
    let bytecode = compile(&program);
    assert_eq!(
        disassemble(&bytecode.instructions),
        "0000 OpConstant 0\n0003 OpSetGlobal 0\n0006 OpGetGlobal 0\n0009 OpPop\n"
    );
}

#[test]
fn if_else_patches_both_jump_targets() {
    // `if (true) { 10 } else { 20 }; 3333;`
    let program = vec![
        Stmt::Expr(Expr::If {
            cond: Box::new(Expr::Literal(Literal::Bool(true))),
            consequence: vec![Stmt::Expr(int(10))],
            alternative: Some(vec![Stmt::Expr(int(20))]),
        }),
        Stmt::Expr(int(3333)),
    ];
    let bytecode = compile(&program);
    assert_eq!(
        disassemble(&bytecode.instructions),
        "0000 OpTrue\n\
         0001 OpJumpNotTruthy 10\n\
         0004 OpConstant 0\n\
         0007 OpJump 13\n\
         0010 OpConstant 1\n\
         0013 OpPop\n\
         0014 OpConstant 2\n\
         0017 OpPop\n"
    );
}

#[test]
fn if_without_else_compiles_a_null_branch() {
    let program = vec![Stmt::Expr(Expr::If {
        cond: Box::new(Expr::Literal(Literal::Bool(true))),
        consequence: vec![Stmt::Expr(int(10))],
        alternative: None,
    })];
    let bytecode = compile(&program);
    assert_eq!(
        disassemble(&bytecode.instructions),
        "0000 OpTrue\n\
         0001 OpJumpNotTruthy 10\n\
         0004 OpConstant 0\n\
         0007 OpJump 11\n\
         0010 OpNull\n\
         0011 OpPop\n"
    );
}

#[test]
fn function_literal_and_call() {
    // `fn() { return 5 + 10; }();`
    let func = Expr::Function {
        name: None,
        params: vec![],
        body: vec![Stmt::Return(Some(Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(int(5)),
            right: Box::new(int(10)),
        }))],
    };
    let program = vec![Stmt::Expr(Expr::Call { callee: Box::new(func), args: vec![] })];
    let bytecode = compile(&program);

    let Constant::CompiledFunction(compiled) = &bytecode.constants[2] else {
        panic!("expected a compiled function constant");
    };
    assert_eq!(
        disassemble(&compiled.instructions),
        "0000 OpConstant 0\n0003 OpConstant 1\n0006 OpAdd\n0007 OpReturnValue\n"
    );
    assert_eq!(compiled.num_parameters, 0);
    assert_eq!(compiled.num_locals, 0);

    assert_eq!(
        disassemble(&bytecode.instructions),
        "0000 OpClosure 2 0\n0004 OpCall 0\n0006 OpPop\n"
    );
}

#[test]
fn closure_captures_free_variables_across_two_scopes() {
    // `fn(a) { fn(b) { a + b } }`
    let inner = Expr::Function {
        name: None,
        params: vec!["b".to_string()],
        body: vec![Stmt::Expr(Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(Expr::Ident("a".to_string())),
            right: Box::new(Expr::Ident("b".to_string())),
        })],
    };
    let outer = Expr::Function {
        name: None,
        params: vec!["a".to_string()],
        body: vec![Stmt::Expr(inner)],
    };
    let program = vec![Stmt::Expr(outer)];
    let bytecode = compile(&program);

    let Constant::CompiledFunction(outer_fn) = bytecode.constants.last().unwrap() else {
        panic!("expected the outer function as the last constant");
    };
    // Body of the outer function: load free "a", build the inner closure, pop.
    assert_eq!(
        disassemble(&outer_fn.instructions),
        "0000 OpGetLocal 0\n0002 OpClosure 0 1\n0006 OpReturnValue\n"
    );

    let Constant::CompiledFunction(inner_fn) = &bytecode.constants[0] else {
        panic!("expected the inner function as constant 0");
    };
    assert_eq!(
        disassemble(&inner_fn.instructions),
        "0000 OpGetFree 0\n0002 OpGetLocal 0\n0004 OpAdd\n0005 OpReturnValue\n"
    );
}

#[test]
fn recursive_named_function_uses_current_closure() {
    // `let fib = fn(x) { fib(x) }; fib;` — only checking the inner body.
    let body = vec![Stmt::Expr(Expr::Call {
        callee: Box::new(Expr::Ident("fib".to_string())),
        args: vec![Expr::Ident("x".to_string())],
    })];
    let program = vec![Stmt::Let {
        name: "fib".to_string(),
        value: Expr::Function {
            name: Some("fib".to_string()),
            params: vec!["x".to_string()],
            body,
        },
    }];
    let bytecode = compile(&program);
    let Constant::CompiledFunction(compiled) = &bytecode.constants[0] else {
        panic!("expected a compiled function constant");
    };
    assert_eq!(
        disassemble(&compiled.instructions),
        "0000 OpCurrentClosure\n0001 OpGetLocal 0\n0003 OpCall 1\n0005 OpReturnValue\n"
    );
}

#[test]
fn while_loop_patches_condition_and_back_edge() {
    let program = vec![Stmt::While {
        cond: Expr::Literal(Literal::Bool(true)),
        body: vec![Stmt::Break],
    }];
    let bytecode = compile(&program);
    // `while` is a statement: no value is left on the stack after it.
    assert_eq!(
        disassemble(&bytecode.instructions),
        "0000 OpTrue\n\
         0001 OpJumpNotTruthy 10\n\
         0004 OpJump 10\n\
         0007 OpJump 0\n"
    );
}

#[test]
fn hash_literal_keys_are_sorted_by_debug_representation() {
    let program = vec![Stmt::Expr(Expr::Hash(vec![
        (Expr::Literal(Literal::Str("b".to_string())), int(2)),
        (Expr::Literal(Literal::Str("a".to_string())), int(1)),
    ]))];
    let bytecode = compile(&program);
    // "a" sorts before "b" textually, so its key/value constants come first
    // even though the literal AST listed "b" first.
    assert_eq!(
        bytecode.constants,
        vec![
            Constant::Str("a".to_string()),
            Constant::Int(1),
            Constant::Str("b".to_string()),
            Constant::Int(2),
        ]
    );
}

#[test]
fn undefined_identifier_is_a_compile_error() {
    let program = vec![Stmt::Expr(Expr::Ident("missing".to_string()))];
    let mut compiler = Compiler::new();
    let err = compiler.compile(&program).unwrap_err();
    assert_eq!(err, CompileError::UndefinedIdentifier("missing".to_string()));
}

#[test]
fn break_outside_loop_is_a_compile_error() {
    let program = vec![Stmt::Break];
    let mut compiler = Compiler::new();
    assert_eq!(compiler.compile(&program), Err(CompileError::BreakOutsideLoop));
}

#[test]
fn import_with_non_string_path_is_rejected() {
    let program = vec![Stmt::Import(int(5))];
    let mut compiler = Compiler::new();
    assert_eq!(compiler.compile(&program), Err(CompileError::ImportPathNotString));
}

#[test]
fn module_loader_is_invoked_once_per_distinct_path() {
    use std::cell::Cell;
    use std::rc::Rc;

    let program = vec![
        Stmt::Import(Expr::Literal(Literal::Str("a".to_string()))),
        Stmt::Import(Expr::Literal(Literal::Str("a".to_string()))),
    ];
    let mut compiler = Compiler::new();
    let calls = Rc::new(Cell::new(0));
    let calls_handle = calls.clone();
    let loader: ModuleLoader = Box::new(move |_path| {
        calls_handle.set(calls_handle.get() + 1);
        Ok(vec![])
    });
    compiler.set_module_loader(loader);
    compiler.compile(&program).expect("both imports resolve");
    assert_eq!(calls.get(), 1, "re-importing an already-loaded path must not re-invoke the loader");
}

#[test]
fn new_with_state_reuses_global_symbols_and_constants() {
    let mut first = Compiler::new();
    first
        .compile(&[Stmt::Let { name: "x".to_string(), value: int(5) }])
        .unwrap();
    let (symbols, constants) = first.into_parts();

    let mut second = Compiler::new_with_state(symbols, constants);
    second
        .compile(&[Stmt::Expr(Expr::Ident("x".to_string()))])
        .expect("x is visible from the carried-over symbol table");
    assert_eq!(
        disassemble(&second.bytecode().instructions),
        "0000 OpGetGlobal 0\n0003 OpPop\n"
    );
}
