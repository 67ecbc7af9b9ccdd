use umka::bytecode::format::{encode_program, read_program};
use umka::compiler::ast::{
    BinaryOp, ClassDef, Expr, FieldDef, FunctionDef, MethodDef, Program as Ast, Stmt,
};
use umka::compiler::lower;
use umka::memory::Entity;
use umka::vm::Machine;
use umka::ErrorKind;

fn sample_program_ast() -> Ast {
    Ast::new(vec![
        Stmt::ClassDef(ClassDef {
            name: "Counter".into(),
            fields: vec![FieldDef {
                name: "value".into(),
                default: Expr::Int(0),
            }],
        }),
        Stmt::MethodDef(MethodDef {
            class_name: "Counter".into(),
            name: "bump".into(),
            params: vec!["self".into()],
            body: vec![
                Stmt::MemberAssign {
                    object: "self".into(),
                    field: "value".into(),
                    value: Expr::Binary {
                        op: BinaryOp::Add,
                        left: Box::new(Expr::FieldAccess {
                            object: "self".into(),
                            field: "value".into(),
                        }),
                        right: Box::new(Expr::Int(1)),
                    },
                },
                Stmt::Return(Some(Expr::FieldAccess {
                    object: "self".into(),
                    field: "value".into(),
                })),
            ],
        }),
        Stmt::FunctionDef(FunctionDef {
            name: "twice".into(),
            params: vec!["x".into()],
            body: vec![Stmt::Return(Some(Expr::Binary {
                op: BinaryOp::Mul,
                left: Box::new(Expr::Ident("x".into())),
                right: Box::new(Expr::Double(2.0)),
            }))],
        }),
        Stmt::Let {
            name: "c".into(),
            value: Expr::Ident("Counter".into()),
        },
        Stmt::Expr(Expr::MethodCall {
            object: "c".into(),
            method: "bump".into(),
            args: vec![],
        }),
        Stmt::Return(Some(Expr::MethodCall {
            object: "c".into(),
            method: "bump".into(),
            args: vec![],
        })),
    ])
}

#[test]
fn write_then_read_is_byte_exact() {
    let program = lower(&sample_program_ast()).expect("lowering");
    let bytes = encode_program(&program).expect("encode");
    let decoded = read_program(&bytes[..]).expect("decode");
    let re_encoded = encode_program(&decoded).expect("re-encode");
    assert_eq!(bytes, re_encoded);
}

#[test]
fn decoded_program_preserves_structure() {
    let program = lower(&sample_program_ast()).expect("lowering");
    let bytes = encode_program(&program).expect("encode");
    let decoded = read_program(&bytes[..]).expect("decode");

    assert_eq!(program.pool.snapshot(), decoded.pool.snapshot());
    assert_eq!(*program.code, *decoded.code);
    assert_eq!(*program.functions, *decoded.functions);
    assert_eq!(*program.vmethod_table, *decoded.vmethod_table);
    assert_eq!(*program.vfield_table, *decoded.vfield_table);
}

#[test]
fn decoded_program_still_executes() {
    let program = lower(&sample_program_ast()).expect("lowering");
    let bytes = encode_program(&program).expect("encode");
    let decoded = read_program(&bytes[..]).expect("decode");
    let value = Machine::new(decoded).run().expect("run");
    assert_eq!(value, Entity::Int(2));
}

#[test]
fn truncated_files_fail_with_parse_errors() {
    let program = lower(&sample_program_ast()).expect("lowering");
    let bytes = encode_program(&program).expect("encode");
    for cut in [0, 1, 3, 8, bytes.len() / 2, bytes.len() - 1] {
        let err = read_program(&bytes[..cut]).expect_err("truncated");
        assert_eq!(err.kind, ErrorKind::Parse, "cut at {cut}");
    }
}

#[test]
fn unsupported_version_is_rejected() {
    let program = lower(&sample_program_ast()).expect("lowering");
    let mut bytes = encode_program(&program).expect("encode");
    bytes[0] = 9;
    let err = read_program(&bytes[..]).expect_err("bad version");
    assert_eq!(err.kind, ErrorKind::Parse);
}
