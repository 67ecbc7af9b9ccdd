use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::bytecode::Program;

use super::runner::JitRunner;
use super::{JitState, JittedFunction};

/// Background optimizer: one worker thread, a FIFO request queue and the
/// per-function state machine `None → Queued → Running → Ready`.
///
/// Publication happens via the state transition: the interpreter may only
/// use a body once the state is `Ready`, and it reads both maps under their
/// own locks with non-blocking lookups. The worker never touches the heap.
pub struct JitManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    running: AtomicBool,
    queue: Mutex<VecDeque<u64>>,
    queue_cv: Condvar,
    states: Mutex<HashMap<u64, JitState>>,
    bodies: Mutex<HashMap<u64, Arc<JittedFunction>>>,
    runner: JitRunner,
}

impl JitManager {
    pub fn new(program: &Program) -> Self {
        Self::with_runner(JitRunner::new(
            program.code.clone(),
            program.pool.clone(),
            program.functions.clone(),
        ))
    }

    pub fn with_runner(runner: JitRunner) -> Self {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            states: Mutex::new(HashMap::new()),
            bodies: Mutex::new(HashMap::new()),
            runner,
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("umka-jit".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("spawn jit worker");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queues `function_id` for optimization. Idempotent: only the
    /// `None → Queued` transition enqueues; repeated and concurrent requests
    /// for a queued, running or published function are no-ops.
    pub fn request_jit(&self, function_id: u64) {
        {
            let mut states = self.shared.states.lock();
            let state = states.entry(function_id).or_insert(JitState::None);
            if *state != JitState::None {
                return;
            }
            *state = JitState::Queued;
        }
        self.shared.queue.lock().push_back(function_id);
        self.shared.queue_cv.notify_one();
        debug!(function_id, "jit requested");
    }

    pub fn state(&self, function_id: u64) -> JitState {
        self.shared
            .states
            .lock()
            .get(&function_id)
            .copied()
            .unwrap_or(JitState::None)
    }

    /// True once an optimized body has been published.
    pub fn has_jitted(&self, function_id: u64) -> bool {
        self.state(function_id) == JitState::Ready
    }

    /// Non-blocking lookup used by `CALL`: the optimized body, or `None`
    /// while the original must be used.
    pub fn try_get_jitted(&self, function_id: u64) -> Option<Arc<JittedFunction>> {
        if !self.has_jitted(function_id) {
            return None;
        }
        self.shared.bodies.lock().get(&function_id).cloned()
    }
}

impl Drop for JitManager {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let function_id = {
            let mut queue = shared.queue.lock();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(function_id) = queue.pop_front() {
                    break function_id;
                }
                shared.queue_cv.wait(&mut queue);
            }
        };

        shared
            .states
            .lock()
            .insert(function_id, JitState::Running);

        // The pipeline works on a worker-local copy; a failed pass publishes
        // the original body so the interpreter never observes an error.
        let body = match shared.runner.optimize_function(function_id) {
            Ok(body) => body,
            Err(err) => {
                warn!(function_id, %err, "optimization failed, publishing original body");
                match shared.runner.original_body(function_id) {
                    Some(body) => body,
                    None => {
                        shared.states.lock().insert(function_id, JitState::None);
                        continue;
                    }
                }
            }
        };

        // Move the body in under the body lock, then flip the state under
        // the state lock; the two locks are never held together.
        shared
            .bodies
            .lock()
            .insert(function_id, Arc::new(body));
        shared
            .states
            .lock()
            .insert(function_id, JitState::Ready);
        debug!(function_id, "jit body published");
    }
}
