use umka::compiler::ast::{Expr, Program as Ast, Stmt};
use umka::compiler::lower;
use umka::memory::Entity;
use umka::vm::Machine;
use umka::ErrorKind;

fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        name: name.to_string(),
        args,
    }
}

fn ident(name: &str) -> Expr {
    Expr::Ident(name.to_string())
}

#[test]
fn write_then_read_round_trips_through_the_filesystem() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.txt").display().to_string();

    let ast = Ast::new(vec![
        Stmt::Expr(call(
            "write",
            vec![Expr::Str(path.clone()), Expr::Str("hello".into())],
        )),
        Stmt::Let {
            name: "lines".into(),
            value: call("read", vec![Expr::Str(path)]),
        },
        Stmt::Return(Some(call("get", vec![ident("lines"), Expr::Int(0)]))),
    ]);
    let program = lower(&ast).expect("lowering");
    let value = Machine::new(program).run().expect("run");
    assert_eq!(value, Entity::Str("hello".into()));
}

#[test]
fn read_loads_a_file_as_an_array_of_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("lines.txt");
    std::fs::write(&path, "first\nsecond\nthird\n").expect("seed file");

    let ast = Ast::new(vec![
        Stmt::Let {
            name: "lines".into(),
            value: call("read", vec![Expr::Str(path.display().to_string())]),
        },
        Stmt::Return(Some(call("len", vec![ident("lines")]))),
    ]);
    let program = lower(&ast).expect("lowering");
    let value = Machine::new(program).run().expect("run");
    assert_eq!(value, Entity::Int(3));
}

#[test]
fn reading_a_missing_file_fails_with_io() {
    let ast = Ast::new(vec![Stmt::Expr(call(
        "read",
        vec![Expr::Str("/definitely/not/here.txt".into())],
    ))]);
    let program = lower(&ast).expect("lowering");
    let err = Machine::new(program).run().expect_err("missing file");
    assert_eq!(err.kind, ErrorKind::Io);
}
