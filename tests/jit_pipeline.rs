use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use umka::bytecode::{ConstPool, Constant, FunctionInfo, Instruction, Opcode, Program};
use umka::compiler::ast::{BinaryOp, Expr, FunctionDef, Program as Ast, Stmt};
use umka::compiler::lower;
use umka::jit::{JitManager, JitRunner, JitState};
use umka::vm::{Machine, RuntimeOptions};

#[derive(Clone, Default)]
struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("utf-8 output")
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

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

/// fn work(n) { return 2 + 3 * 4 + n; } called `calls` times from main,
/// printing each result.
fn foldable_workload(calls: i64) -> Ast {
    Ast::new(vec![
        Stmt::FunctionDef(FunctionDef {
            name: "work".into(),
            params: vec!["n".into()],
            body: vec![Stmt::Return(Some(binary(
                BinaryOp::Add,
                binary(
                    BinaryOp::Add,
                    Expr::Int(2),
                    binary(BinaryOp::Mul, Expr::Int(3), Expr::Int(4)),
                ),
                ident("n"),
            )))],
        }),
        Stmt::Let {
            name: "i".into(),
            value: Expr::Int(0),
        },
        Stmt::While {
            condition: binary(BinaryOp::Lt, ident("i"), Expr::Int(calls)),
            body: Box::new(Stmt::Block(vec![
                Stmt::Expr(call("print", vec![call("work", vec![ident("i")])])),
                Stmt::Assign {
                    name: "i".into(),
                    value: binary(BinaryOp::Add, ident("i"), Expr::Int(1)),
                },
            ])),
        },
    ])
}

fn wait_until_ready(manager: &JitManager, function_id: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !manager.has_jitted(function_id) {
        assert!(
            Instant::now() < deadline,
            "optimized body never became ready"
        );
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn pipeline_shrinks_a_foldable_function() {
    let program = lower(&foldable_workload(1)).expect("lowering");
    let work_id = 1u64;
    let original_len = {
        let info = program.function(work_id).expect("work exists");
        info.code_end - info.code_begin
    };

    let manager = JitManager::new(&program);
    manager.request_jit(work_id);
    wait_until_ready(&manager, work_id);

    let body = manager.try_get_jitted(work_id).expect("published body");
    assert!(
        body.code.len() < original_len,
        "expected {} < {original_len}",
        body.code.len()
    );
}

#[test]
fn pipeline_is_idempotent() {
    let program = lower(&foldable_workload(1)).expect("lowering");
    let work_id = 1u64;

    let runner = JitRunner::new(
        program.code.clone(),
        program.pool.clone(),
        program.functions.clone(),
    );
    let once = runner.optimize_function(work_id).expect("first run");

    // Re-run the full pipeline over the optimized output.
    let mut functions = std::collections::BTreeMap::new();
    functions.insert(
        work_id,
        FunctionInfo {
            id: work_id,
            code_begin: 0,
            code_end: once.code.len(),
            arg_count: once.arg_count,
            local_count: once.local_count,
        },
    );
    let runner_again = JitRunner::new(
        Arc::new(once.code.clone()),
        program.pool.clone(),
        Arc::new(functions),
    );
    let twice = runner_again.optimize_function(work_id).expect("second run");
    assert_eq!(once.code, twice.code);
}

#[test]
fn optimized_and_original_runs_agree() {
    let ast = foldable_workload(50);

    let plain_output = SharedOutput::default();
    let plain_program = lower(&ast).expect("lowering");
    let plain_value = Machine::new(plain_program)
        .with_output(Box::new(plain_output.clone()))
        .run()
        .expect("plain run");

    let jit_output = SharedOutput::default();
    let jit_program = lower(&ast).expect("lowering");
    let manager = Arc::new(JitManager::new(&jit_program));
    let options = RuntimeOptions::default().with_jit_threshold(3);
    let jit_value = Machine::with_options(jit_program, options)
        .with_jit(manager)
        .with_output(Box::new(jit_output.clone()))
        .run()
        .expect("jit run");

    assert_eq!(plain_output.text(), jit_output.text());
    assert_eq!(plain_value, jit_value);
}

#[test]
fn hot_function_is_requested_and_published_during_the_run() {
    let program = lower(&foldable_workload(10)).expect("lowering");
    let work_id = 1u64;
    let manager = Arc::new(JitManager::new(&program));
    let options = RuntimeOptions::default().with_jit_threshold(3);
    let mut machine = Machine::with_options(program.clone(), options)
        .with_jit(manager.clone())
        .with_output(Box::new(SharedOutput::default()));
    machine.run().expect("run");

    // The 4th call crossed the threshold and queued the request; the state
    // machine must reach Ready even after the run finished.
    assert_ne!(manager.state(work_id), JitState::None);
    wait_until_ready(&manager, work_id);

    let original_len = {
        let info = program.function(work_id).expect("work exists");
        info.code_end - info.code_begin
    };
    let body = manager.try_get_jitted(work_id).expect("published body");
    assert!(body.code.len() < original_len);
}

#[test]
fn published_body_executes_fewer_instructions_per_call() {
    let program = lower(&foldable_workload(10)).expect("lowering");
    let work_id = 1u64;

    let count_work_instructions = |machine_program: Program,
                                   manager: Option<Arc<JitManager>>|
     -> usize {
        let counter = Arc::new(Mutex::new(0usize));
        let hook_counter = counter.clone();
        let options = RuntimeOptions::default()
            .with_jit_threshold(3)
            .with_step_hook(Arc::new(move |function_id, _, _| {
                if function_id == work_id {
                    *hook_counter.lock().unwrap() += 1;
                }
            }));
        let mut machine = Machine::with_options(machine_program, options)
            .with_output(Box::new(SharedOutput::default()));
        if let Some(manager) = manager {
            machine = machine.with_jit(manager);
        }
        machine.run().expect("run");
        let count = *counter.lock().unwrap();
        count
    };

    let baseline = count_work_instructions(program.clone(), None);

    // Warm the manager up front so every call in the measured run uses the
    // published body.
    let manager = Arc::new(JitManager::new(&program));
    manager.request_jit(work_id);
    wait_until_ready(&manager, work_id);
    let optimized = count_work_instructions(program, Some(manager));

    assert!(
        optimized < baseline,
        "expected fewer instructions with the published body: {optimized} vs {baseline}"
    );
}

#[test]
fn in_flight_frames_complete_on_their_captured_code() {
    // A frame created before publication keeps running its original range;
    // indirectly validated by the equivalence run above, directly validated
    // here: a recursive function that requests its own optimization mid
    // flight still completes correctly.
    let ast = Ast::new(vec![
        Stmt::FunctionDef(FunctionDef {
            name: "count".into(),
            params: vec!["n".into()],
            body: vec![
                Stmt::If {
                    condition: binary(BinaryOp::Lt, ident("n"), Expr::Int(1)),
                    then_branch: Box::new(Stmt::Return(Some(Expr::Int(0)))),
                    else_branch: None,
                },
                Stmt::Return(Some(binary(
                    BinaryOp::Add,
                    Expr::Int(1),
                    call("count", vec![binary(BinaryOp::Sub, ident("n"), Expr::Int(1))]),
                ))),
            ],
        }),
        Stmt::Return(Some(call("count", vec![Expr::Int(40)]))),
    ]);
    let program = lower(&ast).expect("lowering");
    let manager = Arc::new(JitManager::new(&program));
    let options = RuntimeOptions::default().with_jit_threshold(5);
    let value = Machine::with_options(program, options)
        .with_jit(manager)
        .run()
        .expect("run");
    assert_eq!(value, umka::memory::Entity::Int(40));
}

#[test]
fn method_call_bodies_pass_through_unchanged() {
    // Method call sites have unknown arity at optimization time; the
    // pipeline treats them conservatively and the published body equals the
    // original.
    let pool = ConstPool::new();
    let code = vec![
        Instruction::new(Opcode::Load, 0),
        Instruction::new(Opcode::CallMethod, 0),
        Instruction::bare(Opcode::Return),
    ];
    let mut functions = std::collections::BTreeMap::new();
    functions.insert(
        0,
        FunctionInfo {
            id: 0,
            code_begin: 0,
            code_end: 3,
            arg_count: 1,
            local_count: 1,
        },
    );
    let program = Program::new(
        code.clone(),
        pool,
        functions,
        vec![(0, 0, 0)],
        Vec::new(),
    );
    let manager = JitManager::new(&program);
    manager.request_jit(0);
    wait_until_ready(&manager, 0);
    let body = manager.try_get_jitted(0).expect("published");
    assert_eq!(body.code, code);
}

#[test]
fn folding_appends_the_new_constant_to_the_pool() {
    let ast = foldable_workload(1);
    let program = lower(&ast).expect("lowering");
    assert!(program
        .pool
        .snapshot()
        .iter()
        .all(|constant| !constant.same(&Constant::Int(14))));

    let runner = JitRunner::new(
        program.code.clone(),
        program.pool.clone(),
        program.functions.clone(),
    );
    runner.optimize_function(1).expect("optimize");
    assert!(program
        .pool
        .snapshot()
        .iter()
        .any(|constant| constant.same(&Constant::Int(14))));
}
