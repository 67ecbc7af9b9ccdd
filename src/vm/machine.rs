use std::io::Write;
use std::sync::Arc;

use tracing::debug;

use crate::bytecode::{Constant, Instruction, Opcode, Program};
use crate::jit::{JitManager, JittedFunction};
use crate::memory::{Entity, EntityRef, GarbageCollector, Heap};
use crate::{ErrorKind, UmkaError, UmkaResult};

use super::builtins;
use super::ops;
use super::profiler::Profiler;

/// Hook invoked once per executed instruction:
/// `(function id, instruction offset, instruction)`.
pub type StepHook = Arc<dyn Fn(u64, usize, &Instruction) + Send + Sync>;

/// Runtime flags for one machine instance.
#[derive(Clone, Default)]
pub struct RuntimeOptions {
    /// Entry count a function must exceed to be queued for optimization.
    pub jit_threshold: Option<u64>,
    /// Byte budget override; the default is a fraction of physical RAM.
    pub gc_threshold: Option<usize>,
    /// Single-step instruction hook.
    pub step_hook: Option<StepHook>,
}

impl RuntimeOptions {
    pub fn with_jit_threshold(mut self, threshold: u64) -> Self {
        self.jit_threshold = Some(threshold);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    pub fn with_step_hook(mut self, hook: StepHook) -> Self {
        self.step_hook = Some(hook);
        self
    }
}

/// An active call: function id, relative instruction pointer, the code
/// bound at `CALL` time and the local-variable table.
struct Frame {
    function_id: u64,
    ip: usize,
    code: FrameCode,
    locals: Vec<Option<EntityRef>>,
}

/// The code range is captured when the frame is created; a frame running
/// the unoptimized body completes on it even if an optimized body is
/// published mid-flight.
enum FrameCode {
    Shared { begin: usize, end: usize },
    Jitted(Arc<JittedFunction>),
}

/// The stack machine: one shared operand stack, a frame stack, the
/// garbage-collected heap and the profiler feeding the JIT trigger.
pub struct Machine {
    program: Program,
    heap: Heap,
    gc: GarbageCollector,
    stack: Vec<EntityRef>,
    frames: Vec<Frame>,
    profiler: Profiler,
    jit: Option<Arc<JitManager>>,
    options: RuntimeOptions,
    output: Box<dyn Write>,
}

impl Machine {
    pub fn new(program: Program) -> Self {
        Self::with_options(program, RuntimeOptions::default())
    }

    pub fn with_options(program: Program, options: RuntimeOptions) -> Self {
        let gc = match options.gc_threshold {
            Some(bytes) => GarbageCollector::with_threshold(bytes),
            None => GarbageCollector::new(),
        };
        let profiler = match options.jit_threshold {
            Some(threshold) => Profiler::with_threshold(threshold),
            None => Profiler::new(),
        };
        Self {
            program,
            heap: Heap::new(),
            gc,
            stack: Vec::new(),
            frames: Vec::new(),
            profiler,
            jit: None,
            options,
            output: Box::new(std::io::stdout()),
        }
    }

    /// Attaches the background optimizer; hot calls will poll it for
    /// published bodies.
    pub fn with_jit(mut self, manager: Arc<JitManager>) -> Self {
        self.jit = Some(manager);
        self
    }

    /// Redirects `print`/`write` rendering, mainly for tests.
    pub fn with_output(mut self, sink: Box<dyn Write>) -> Self {
        self.output = sink;
        self
    }

    /// Executes the program from `main` (function id 0) and returns the
    /// final stack-top value.
    pub fn run(&mut self) -> UmkaResult<Entity> {
        if self.program.function(0).is_none() {
            return Err(UmkaError::new(
                ErrorKind::Resolution,
                "program has no main function (id 0)",
            ));
        }
        debug!(
            functions = self.program.functions.len(),
            constants = self.program.pool.len(),
            "starting execution"
        );
        self.call_user(0)?;
        self.execute()?;
        let value = match self.stack.pop() {
            Some(reference) => self.heap.get(reference).cloned().unwrap_or(Entity::Unit),
            None => Entity::Unit,
        };
        Ok(value)
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn heap_population(&self) -> usize {
        self.heap.population()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Runs one full mark-and-sweep cycle immediately.
    pub fn force_collect(&mut self) {
        self.collect_now();
    }

    // ── dispatch loop ──────────────────────────────────────────────

    fn execute(&mut self) -> UmkaResult<()> {
        loop {
            let Some(frame) = self.frames.last() else {
                break;
            };
            let fetched = match &frame.code {
                FrameCode::Shared { begin, end } => {
                    let index = begin + frame.ip;
                    if index >= *end || index >= self.program.code.len() {
                        None
                    } else {
                        Some((self.program.code[index], index))
                    }
                }
                FrameCode::Jitted(body) => {
                    body.code.get(frame.ip).map(|instruction| (*instruction, frame.ip))
                }
            };
            let Some((instruction, offset)) = fetched else {
                break;
            };
            let function_id = frame.function_id;
            self.frames.last_mut().expect("frame checked").ip += 1;

            if let Some(hook) = self.options.step_hook.clone() {
                hook(function_id, offset, &instruction);
            }

            self.step(instruction)
                .map_err(|err| err.at(offset, instruction.opcode))?;
        }
        Ok(())
    }

    fn step(&mut self, instruction: Instruction) -> UmkaResult<()> {
        match instruction.opcode {
            Opcode::PushConst => {
                let constant = self.program.pool.get(instruction.operand).ok_or_else(|| {
                    UmkaError::new(
                        ErrorKind::Type,
                        format!("constant index {} out of range", instruction.operand),
                    )
                })?;
                self.push_new(materialize(constant))
            }
            Opcode::Pop => self.pop_ref().map(|_| ()),
            Opcode::Load => {
                let slot = local_slot(instruction.operand)?;
                let frame = self.current_frame()?;
                let reference = frame.locals.get(slot).copied().flatten().ok_or_else(|| {
                    UmkaError::new(ErrorKind::Resolution, format!("unbound local {slot}"))
                })?;
                self.push(reference);
                Ok(())
            }
            Opcode::Store => {
                let slot = local_slot(instruction.operand)?;
                let reference = self.pop_ref()?;
                let frame = self.current_frame_mut()?;
                if frame.locals.len() <= slot {
                    frame.locals.resize(slot + 1, None);
                }
                frame.locals[slot] = Some(reference);
                Ok(())
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let left = self.pop_ref()?;
                let right = self.pop_ref()?;
                let result =
                    ops::arithmetic(instruction.opcode, self.entity(left)?, self.entity(right)?)?;
                self.push_new(result)
            }
            Opcode::Rem => {
                let left = self.pop_ref()?;
                let right = self.pop_ref()?;
                let result = ops::remainder(self.entity(left)?, self.entity(right)?)?;
                self.push_new(result)
            }
            Opcode::Not => {
                let value = self.pop_ref()?;
                let result = Entity::Bool(!ops::truthy(self.entity(value)?));
                self.push_new(result)
            }
            Opcode::And | Opcode::Or => {
                let left = self.pop_ref()?;
                let right = self.pop_ref()?;
                let result =
                    ops::logical(instruction.opcode, self.entity(left)?, self.entity(right)?);
                self.push_new(result)
            }
            Opcode::Eq
            | Opcode::Neq
            | Opcode::Gt
            | Opcode::Lt
            | Opcode::Gte
            | Opcode::Lte => {
                let left = self.pop_ref()?;
                let right = self.pop_ref()?;
                let result =
                    ops::compare(instruction.opcode, self.entity(left)?, self.entity(right)?)?;
                self.push_new(result)
            }
            Opcode::Jmp => self.branch(instruction.operand),
            Opcode::JmpIfFalse => {
                let value = self.pop_ref()?;
                if !ops::truthy(self.entity(value)?) {
                    self.branch(instruction.operand)?;
                }
                Ok(())
            }
            Opcode::JmpIfTrue => {
                let value = self.pop_ref()?;
                if ops::truthy(self.entity(value)?) {
                    self.branch(instruction.operand)?;
                }
                Ok(())
            }
            Opcode::Call => {
                if builtins::is_builtin(instruction.operand) {
                    builtins::invoke(self, instruction.operand)
                } else {
                    let function_id = u64::try_from(instruction.operand).map_err(|_| {
                        UmkaError::new(
                            ErrorKind::Resolution,
                            format!("call to unknown function {}", instruction.operand),
                        )
                    })?;
                    self.call_user(function_id)
                }
            }
            Opcode::Return => {
                let value = match self.stack.pop() {
                    Some(reference) => reference,
                    None => self.allocate(Entity::Unit)?,
                };
                self.frames.pop();
                self.push(value);
                Ok(())
            }
            Opcode::BuildArr => {
                let count = usize::try_from(instruction.operand).map_err(|_| {
                    UmkaError::new(
                        ErrorKind::Type,
                        format!("invalid array arity {}", instruction.operand),
                    )
                })?;
                if count > self.stack.len() {
                    return Err(UmkaError::new(
                        ErrorKind::Type,
                        "operand stack underflow while building array",
                    ));
                }
                self.build_array(count)
            }
            Opcode::CallMethod => {
                let object = *self.stack.last().ok_or_else(stack_underflow)?;
                let class_id = self.class_id_of(object)?;
                let function_id = self
                    .program
                    .vmethods
                    .get(&(class_id, instruction.operand))
                    .copied()
                    .ok_or_else(|| {
                        UmkaError::new(
                            ErrorKind::Resolution,
                            format!(
                                "unknown method {} for class {class_id}",
                                instruction.operand
                            ),
                        )
                    })?;
                self.call_user(function_id)
            }
            Opcode::GetField => {
                let object = self.pop_ref()?;
                let class_id = self.class_id_of(object)?;
                let index = self.field_index(class_id, instruction.operand)?;
                let items = self.array_items(object)?;
                let element = items.get(index).copied().ok_or_else(|| {
                    UmkaError::new(
                        ErrorKind::Bounds,
                        format!("field index {index} out of bounds"),
                    )
                })?;
                self.push(element);
                Ok(())
            }
            Opcode::SetField => {
                let value = self.pop_ref()?;
                let object = self.pop_ref()?;
                let class_id = self.class_id_of(object)?;
                let index = self.field_index(class_id, instruction.operand)?;
                let items = self.array_items_mut(object)?;
                if index >= items.len() {
                    return Err(UmkaError::new(
                        ErrorKind::Bounds,
                        format!("field index {index} out of bounds"),
                    ));
                }
                items[index] = value;
                Ok(())
            }
            Opcode::ToInt => {
                let value = self.pop_ref()?;
                let result = ops::to_int(self.entity(value)?)?;
                self.push_new(result)
            }
            Opcode::ToDouble => {
                let value = self.pop_ref()?;
                let result = ops::to_double(self.entity(value)?)?;
                self.push_new(result)
            }
            Opcode::ToString => {
                let value = self.pop_ref()?;
                let text = self.render_ref(value)?;
                self.push_new(Entity::Str(text))
            }
            Opcode::Opcot => Err(UmkaError::new(
                ErrorKind::Type,
                "OPCOT is reserved and has no defined semantics",
            )),
        }
    }

    fn branch(&mut self, offset: i64) -> UmkaResult<()> {
        let frame = self.current_frame_mut()?;
        let target = frame.ip as i64 + offset;
        if target < 0 {
            return Err(UmkaError::new(
                ErrorKind::Type,
                format!("branch target {target} before function start"),
            ));
        }
        frame.ip = target as usize;
        let function_id = frame.function_id;
        if offset < 0 {
            self.profiler.record_backward_branch(function_id);
        }
        Ok(())
    }

    /// Pops `arg_count` values into locals 0..n-1 in pop order and pushes a
    /// new frame. The code is bound now: a `Ready` optimized body if one is
    /// published, the original range otherwise.
    fn call_user(&mut self, function_id: u64) -> UmkaResult<()> {
        let info = *self.program.function(function_id).ok_or_else(|| {
            UmkaError::new(
                ErrorKind::Resolution,
                format!("call to unknown function {function_id}"),
            )
        })?;

        self.profiler.record_entry(function_id);
        if let Some(manager) = &self.jit {
            if self.profiler.is_hot(function_id) {
                manager.request_jit(function_id);
            }
        }
        let code = match self.jit.as_ref().and_then(|m| m.try_get_jitted(function_id)) {
            Some(body) => FrameCode::Jitted(body),
            None => FrameCode::Shared {
                begin: info.code_begin,
                end: info.code_end,
            },
        };

        let mut locals = vec![None; info.local_count.max(info.arg_count)];
        for slot in locals.iter_mut().take(info.arg_count) {
            *slot = Some(self.stack.pop().ok_or_else(stack_underflow)?);
        }
        self.frames.push(Frame {
            function_id,
            ip: 0,
            code,
            locals,
        });
        Ok(())
    }

    // ── heap and stack plumbing ────────────────────────────────────

    pub(crate) fn push(&mut self, reference: EntityRef) {
        self.stack.push(reference);
    }

    pub(crate) fn pop_ref(&mut self) -> UmkaResult<EntityRef> {
        self.stack.pop().ok_or_else(stack_underflow)
    }

    pub(crate) fn entity(&self, reference: EntityRef) -> UmkaResult<&Entity> {
        self.heap.get(reference).ok_or_else(|| {
            UmkaError::new(ErrorKind::Resolution, "dangling heap reference")
        })
    }

    pub(crate) fn render_ref(&self, reference: EntityRef) -> UmkaResult<String> {
        Ok(ops::render(self.entity(reference)?, &self.heap))
    }

    pub(crate) fn pop_index(&mut self) -> UmkaResult<i64> {
        let reference = self.pop_ref()?;
        match self.entity(reference)? {
            Entity::Int(value) => Ok(*value),
            other => Err(UmkaError::new(
                ErrorKind::Type,
                format!("expected an integer index, got {}", other.type_name()),
            )),
        }
    }

    pub(crate) fn pop_string(&mut self) -> UmkaResult<String> {
        let reference = self.pop_ref()?;
        match self.entity(reference)? {
            Entity::Str(text) => Ok(text.clone()),
            other => Err(UmkaError::new(
                ErrorKind::Type,
                format!("expected a string, got {}", other.type_name()),
            )),
        }
    }

    pub(crate) fn array_items(&self, reference: EntityRef) -> UmkaResult<&Vec<EntityRef>> {
        match self.entity(reference)? {
            Entity::Array(items) => Ok(items),
            other => Err(UmkaError::new(
                ErrorKind::Type,
                format!("expected an array, got {}", other.type_name()),
            )),
        }
    }

    pub(crate) fn array_items_mut(
        &mut self,
        reference: EntityRef,
    ) -> UmkaResult<&mut Vec<EntityRef>> {
        match self.heap.get_mut(reference) {
            Some(Entity::Array(items)) => Ok(items),
            Some(other) => Err(UmkaError::new(
                ErrorKind::Type,
                format!("expected an array, got {}", other.type_name()),
            )),
            None => Err(UmkaError::new(
                ErrorKind::Resolution,
                "dangling heap reference",
            )),
        }
    }

    fn class_id_of(&self, object: EntityRef) -> UmkaResult<i64> {
        let items = self.array_items(object)?;
        let head = items.first().copied().ok_or_else(|| {
            UmkaError::new(ErrorKind::Type, "object array is empty")
        })?;
        match self.entity(head)? {
            Entity::Int(class_id) => Ok(*class_id),
            other => Err(UmkaError::new(
                ErrorKind::Type,
                format!("object class id is {}, not int", other.type_name()),
            )),
        }
    }

    fn field_index(&self, class_id: i64, field_id: i64) -> UmkaResult<usize> {
        let index = self
            .program
            .vfields
            .get(&(class_id, field_id))
            .copied()
            .ok_or_else(|| {
                UmkaError::new(
                    ErrorKind::Resolution,
                    format!("unknown field {field_id} for class {class_id}"),
                )
            })?;
        usize::try_from(index).map_err(|_| {
            UmkaError::new(
                ErrorKind::Resolution,
                format!("invalid field index {index} for class {class_id}"),
            )
        })
    }

    /// Single allocation entry point: runs the collector first when the
    /// byte budget says so.
    pub(crate) fn allocate(&mut self, entity: Entity) -> UmkaResult<EntityRef> {
        self.gc_guard()?;
        Ok(self.insert_counted(entity))
    }

    pub(crate) fn push_new(&mut self, entity: Entity) -> UmkaResult<()> {
        let reference = self.allocate(entity)?;
        self.push(reference);
        Ok(())
    }

    /// Pops `count` references and allocates an array preserving source
    /// order. The budget check runs while the elements are still on the
    /// operand stack, so an induced collection cannot reclaim them.
    pub(crate) fn build_array(&mut self, count: usize) -> UmkaResult<()> {
        self.gc_guard()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.pop_ref()?);
        }
        items.reverse();
        let reference = self.insert_counted(Entity::Array(items));
        self.push(reference);
        Ok(())
    }

    fn insert_counted(&mut self, entity: Entity) -> EntityRef {
        self.gc.add_allocated_bytes(entity.heap_size());
        self.heap.insert(entity)
    }

    fn gc_guard(&mut self) -> UmkaResult<()> {
        if self.gc.should_collect() {
            self.collect_now();
            if self.gc.over_budget() {
                return Err(UmkaError::new(
                    ErrorKind::OutOfMemory,
                    "collection could not bring the heap under budget",
                ));
            }
        }
        Ok(())
    }

    fn collect_now(&mut self) {
        let roots: Vec<EntityRef> = self
            .stack
            .iter()
            .copied()
            .chain(
                self.frames
                    .iter()
                    .flat_map(|frame| frame.locals.iter().flatten().copied()),
            )
            .collect();
        self.gc.collect(&mut self.heap, roots);
    }

    pub(crate) fn write_output_line(&mut self, text: &str) -> UmkaResult<()> {
        writeln!(self.output, "{text}")
            .map_err(|err| UmkaError::new(ErrorKind::Io, err.to_string()))
    }

    fn current_frame(&self) -> UmkaResult<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| UmkaError::new(ErrorKind::Type, "no active frame"))
    }

    fn current_frame_mut(&mut self) -> UmkaResult<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| UmkaError::new(ErrorKind::Type, "no active frame"))
    }
}

fn stack_underflow() -> UmkaError {
    UmkaError::new(ErrorKind::Type, "operand stack underflow")
}

fn local_slot(operand: i64) -> UmkaResult<usize> {
    usize::try_from(operand).map_err(|_| {
        UmkaError::new(
            ErrorKind::Type,
            format!("invalid local slot {operand}"),
        )
    })
}

fn materialize(constant: Constant) -> Entity {
    match constant {
        Constant::Int(value) => Entity::Int(value),
        Constant::Double(value) => Entity::Double(value),
        Constant::Str(value) => Entity::Str(value),
        Constant::Unit => Entity::Unit,
    }
}
