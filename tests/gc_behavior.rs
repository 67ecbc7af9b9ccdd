use umka::compiler::ast::{BinaryOp, Expr, Program as Ast, Stmt};
use umka::compiler::lower;
use umka::memory::Entity;
use umka::vm::{Machine, RuntimeOptions};
use umka::ErrorKind;

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        name: name.to_string(),
        args,
    }
}

fn ident(name: &str) -> Expr {
    Expr::Ident(name.to_string())
}

/// let i = 0; while (i < count) { [1]; i = i + 1; }
fn discard_arrays_program(count: i64) -> Ast {
    Ast::new(vec![
        Stmt::Let {
            name: "i".into(),
            value: Expr::Int(0),
        },
        Stmt::While {
            condition: binary(BinaryOp::Lt, ident("i"), Expr::Int(count)),
            body: Box::new(Stmt::Block(vec![
                Stmt::Expr(Expr::Array(vec![Expr::Int(1)])),
                Stmt::Assign {
                    name: "i".into(),
                    value: binary(BinaryOp::Add, ident("i"), Expr::Int(1)),
                },
            ])),
        },
    ])
}

#[test]
fn discarded_arrays_are_fully_reclaimed() {
    let program = lower(&discard_arrays_program(1000)).expect("lowering");
    let mut machine = Machine::new(program);
    machine.run().expect("execution");

    machine.force_collect();
    assert_eq!(machine.heap_population(), 0);
    assert_eq!(machine.stack_depth(), 0);
}

#[test]
fn live_data_survives_induced_collections() {
    // A tiny budget forces collections throughout the run; the rooted array
    // and its contents must survive every cycle.
    let ast = Ast::new(vec![
        Stmt::Let {
            name: "xs".into(),
            value: Expr::Array(vec![]),
        },
        Stmt::Let {
            name: "i".into(),
            value: Expr::Int(0),
        },
        Stmt::While {
            condition: binary(BinaryOp::Lt, ident("i"), Expr::Int(200)),
            body: Box::new(Stmt::Block(vec![
                Stmt::Expr(call("add_elem", vec![ident("xs"), ident("i")])),
                Stmt::Assign {
                    name: "i".into(),
                    value: binary(BinaryOp::Add, ident("i"), Expr::Int(1)),
                },
            ])),
        },
        Stmt::Return(Some(call("len", vec![ident("xs")]))),
    ]);
    let program = lower(&ast).expect("lowering");
    // Small enough that cycles run during the loop, large enough that the
    // live set stays under budget.
    let options = RuntimeOptions::default().with_gc_threshold(16 * 1024);
    let mut machine = Machine::with_options(program, options);
    let value = machine.run().expect("execution");
    assert_eq!(value, Entity::Int(200));
}

#[test]
fn unreclaimable_growth_fails_with_out_of_memory() {
    let ast = Ast::new(vec![
        Stmt::Let {
            name: "xs".into(),
            value: Expr::Array(vec![]),
        },
        Stmt::Let {
            name: "i".into(),
            value: Expr::Int(0),
        },
        Stmt::While {
            condition: binary(BinaryOp::Lt, ident("i"), Expr::Int(100000)),
            body: Box::new(Stmt::Block(vec![
                Stmt::Expr(call(
                    "add_elem",
                    vec![ident("xs"), Expr::Str("living payload".into())],
                )),
                Stmt::Assign {
                    name: "i".into(),
                    value: binary(BinaryOp::Add, ident("i"), Expr::Int(1)),
                },
            ])),
        },
    ]);
    let program = lower(&ast).expect("lowering");
    let options = RuntimeOptions::default().with_gc_threshold(2048);
    let err = Machine::with_options(program, options)
        .run()
        .expect_err("out of memory");
    assert_eq!(err.kind, ErrorKind::OutOfMemory);
}

#[test]
fn collection_runs_during_allocation_once_the_budget_is_crossed() {
    let program = lower(&discard_arrays_program(200)).expect("lowering");
    let options = RuntimeOptions::default().with_gc_threshold(256);
    let mut machine = Machine::with_options(program, options);
    machine.run().expect("execution");
    // Garbage was produced faster than the budget: the live residue after a
    // final sweep is empty, and accounting went back down with it.
    machine.force_collect();
    assert_eq!(machine.heap_population(), 0);
    assert_eq!(machine.gc().bytes_allocated(), 0);
}
