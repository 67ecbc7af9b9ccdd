use std::collections::{BTreeMap, HashMap};

use crate::bytecode::{
    Constant, ConstPool, FunctionBuilder, FunctionInfo, Instruction, Opcode, Program,
};
use crate::vm::builtins;
use crate::{ErrorKind, UmkaError, UmkaResult};

use super::ast::{self, BinaryOp, Expr, Stmt, UnaryOp};

/// Lowers a parsed program to a loaded [`Program`].
///
/// Id assignment: `main` is function id 0 and absorbs the top-level
/// statements; user functions and methods get dense consecutive ids. Method
/// and field names are assigned program-wide ids on first encounter, which
/// is what makes a polymorphic call site a single `(class_id, method_id)`
/// lookup.
pub fn lower(program: &ast::Program) -> UmkaResult<Program> {
    let mut lowering = Lowering::default();
    lowering.collect(program)?;
    lowering.build(program)
}

#[derive(Default)]
struct Lowering {
    pool: ConstPool,
    function_ids: HashMap<String, u64>,
    class_ids: HashMap<String, i64>,
    method_ids: HashMap<String, i64>,
    field_ids: HashMap<String, i64>,
    /// Per class: field defaults in field-index order (index 0 holds the
    /// class id, fields start at 1).
    class_defaults: HashMap<String, Vec<Expr>>,
    vmethod_table: Vec<(i64, i64, i64)>,
    vfield_table: Vec<(i64, i64, i64)>,
}

impl Lowering {
    fn collect(&mut self, program: &ast::Program) -> UmkaResult<()> {
        // Method and field names get dense program-wide ids on first
        // encounter, independent of the class they appear in.
        for stmt in &program.statements {
            match stmt {
                Stmt::ClassDef(class) => {
                    for field in &class.fields {
                        let next = self.field_ids.len() as i64;
                        self.field_ids.entry(field.name.clone()).or_insert(next);
                    }
                }
                Stmt::MethodDef(method) => {
                    let next = self.method_ids.len() as i64;
                    self.method_ids.entry(method.name.clone()).or_insert(next);
                }
                _ => {}
            }
        }

        // Class ids and the vfield table.
        for stmt in &program.statements {
            let Stmt::ClassDef(class) = stmt else {
                continue;
            };
            if self.class_ids.contains_key(&class.name) {
                return Err(UmkaError::new(
                    ErrorKind::Resolution,
                    format!("duplicate class '{}'", class.name),
                ));
            }
            let class_id = self.class_ids.len() as i64;
            self.class_ids.insert(class.name.clone(), class_id);
            let mut defaults = Vec::with_capacity(class.fields.len());
            for (position, field) in class.fields.iter().enumerate() {
                let field_index = position as i64 + 1;
                let field_id = self.field_ids[&field.name];
                self.vfield_table.push((class_id, field_id, field_index));
                defaults.push(field.default.clone());
            }
            self.class_defaults.insert(class.name.clone(), defaults);
        }

        // Function ids: main first, then functions and methods in source
        // order. The vmethod table is filled as method ids are assigned.
        self.function_ids.insert("main".to_string(), 0);
        let mut next_id = 1u64;
        for stmt in &program.statements {
            match stmt {
                Stmt::FunctionDef(function) if function.name != "main" => {
                    if self.function_ids.contains_key(&function.name) {
                        return Err(UmkaError::new(
                            ErrorKind::Resolution,
                            format!("duplicate function '{}'", function.name),
                        ));
                    }
                    self.function_ids.insert(function.name.clone(), next_id);
                    next_id += 1;
                }
                Stmt::MethodDef(method) => {
                    let qualified = method_key(&method.class_name, &method.name);
                    if self.function_ids.contains_key(&qualified) {
                        return Err(UmkaError::new(
                            ErrorKind::Resolution,
                            format!(
                                "duplicate method '{}' for class '{}'",
                                method.name, method.class_name
                            ),
                        ));
                    }
                    let class_id = *self.class_ids.get(&method.class_name).ok_or_else(|| {
                        UmkaError::new(
                            ErrorKind::Resolution,
                            format!("method for unknown class '{}'", method.class_name),
                        )
                    })?;
                    let method_id = self.method_ids[&method.name];
                    self.function_ids.insert(qualified, next_id);
                    self.vmethod_table
                        .push((class_id, method_id, next_id as i64));
                    next_id += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn build(&mut self, program: &ast::Program) -> UmkaResult<Program> {
        let mut sources: BTreeMap<u64, FnSource> = BTreeMap::new();
        let mut top_level: Vec<&Stmt> = Vec::new();
        let mut main_def: Option<&ast::FunctionDef> = None;

        for stmt in &program.statements {
            match stmt {
                Stmt::FunctionDef(function) => {
                    if function.name == "main" {
                        main_def = Some(function);
                    } else {
                        let id = self.function_ids[&function.name];
                        sources.insert(id, FnSource::Function(function));
                    }
                }
                Stmt::MethodDef(method) => {
                    let id = self.function_ids[&method_key(&method.class_name, &method.name)];
                    sources.insert(id, FnSource::Method(method));
                }
                Stmt::ClassDef(_) => {}
                other => top_level.push(other),
            }
        }

        let mut code: Vec<Instruction> = Vec::new();
        let mut functions: BTreeMap<u64, FunctionInfo> = BTreeMap::new();

        // main: top-level statements prepended to the explicit body, or a
        // synthesized body when no `main` was defined.
        let main_body: Vec<&Stmt> = {
            let mut body = top_level;
            if let Some(main) = main_def {
                body.extend(main.body.iter());
            }
            body
        };
        self.append_function(0, &[], &main_body, &mut code, &mut functions)?;

        let sources: Vec<(u64, FnSource)> = sources.into_iter().collect();
        for (id, source) in sources {
            let (params, body): (&[String], Vec<&Stmt>) = match source {
                FnSource::Function(function) => {
                    (function.params.as_slice(), function.body.iter().collect())
                }
                FnSource::Method(method) => {
                    (method.params.as_slice(), method.body.iter().collect())
                }
            };
            self.append_function(id, params, &body, &mut code, &mut functions)?;
        }

        Ok(Program::new(
            code,
            self.pool.clone(),
            functions,
            std::mem::take(&mut self.vmethod_table),
            std::mem::take(&mut self.vfield_table),
        ))
    }

    fn append_function(
        &self,
        id: u64,
        params: &[String],
        body: &[&Stmt],
        code: &mut Vec<Instruction>,
        functions: &mut BTreeMap<u64, FunctionInfo>,
    ) -> UmkaResult<()> {
        let mut builder = FunctionBuilder::new(self.pool.clone());
        for param in params {
            builder.local_slot(param);
        }

        {
            let mut function = FunctionLowering {
                tables: self,
                builder: &mut builder,
            };
            for stmt in body {
                function.stmt(stmt)?;
            }
        }

        if builder.last_opcode() != Some(Opcode::Return) {
            builder.emit_push_const(Constant::Unit);
            builder.emit(Opcode::Return);
        }

        let local_count = builder.local_count();
        let function_code = builder.resolve()?;
        let code_begin = code.len();
        code.extend(function_code);
        functions.insert(
            id,
            FunctionInfo {
                id,
                code_begin,
                code_end: code.len(),
                arg_count: params.len(),
                local_count,
            },
        );
        Ok(())
    }
}

enum FnSource<'a> {
    Function(&'a ast::FunctionDef),
    Method(&'a ast::MethodDef),
}

fn method_key(class_name: &str, method_name: &str) -> String {
    format!("{class_name}${method_name}")
}

struct FunctionLowering<'a> {
    tables: &'a Lowering,
    builder: &'a mut FunctionBuilder,
}

impl FunctionLowering<'_> {
    fn stmt(&mut self, stmt: &Stmt) -> UmkaResult<()> {
        match stmt {
            Stmt::Let { name, value } => {
                let slot = self.builder.local_slot(name);
                self.expr(value)?;
                self.builder.emit_with(Opcode::Store, slot);
                Ok(())
            }
            Stmt::Assign { name, value } => {
                let slot = self.builder.lookup_local(name).ok_or_else(|| {
                    UmkaError::new(
                        ErrorKind::Resolution,
                        format!("assignment to unknown variable '{name}'"),
                    )
                })?;
                self.expr(value)?;
                self.builder.emit_with(Opcode::Store, slot);
                Ok(())
            }
            Stmt::MemberAssign {
                object,
                field,
                value,
            } => {
                let slot = self.variable_slot(object)?;
                self.builder.emit_with(Opcode::Load, slot);
                self.expr(value)?;
                let field_id = self.field_id(field)?;
                self.builder.emit_with(Opcode::SetField, field_id);
                Ok(())
            }
            Stmt::Expr(expr) => {
                self.expr(expr)?;
                self.builder.emit(Opcode::Pop);
                Ok(())
            }
            Stmt::Block(statements) => {
                for stmt in statements {
                    self.stmt(stmt)?;
                }
                Ok(())
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let else_label = self.builder.fresh_label();
                let end_label = self.builder.fresh_label();
                self.expr(condition)?;
                self.builder.emit_jump(Opcode::JmpIfFalse, &else_label);
                self.stmt(then_branch)?;
                self.builder.emit_jump(Opcode::Jmp, &end_label);
                self.builder.place_label(&else_label);
                if let Some(else_branch) = else_branch {
                    self.stmt(else_branch)?;
                }
                self.builder.place_label(&end_label);
                Ok(())
            }
            Stmt::While { condition, body } => {
                let start_label = self.builder.fresh_label();
                let end_label = self.builder.fresh_label();
                self.builder.place_label(&start_label);
                self.expr(condition)?;
                self.builder.emit_jump(Opcode::JmpIfFalse, &end_label);
                self.stmt(body)?;
                self.builder.emit_jump(Opcode::Jmp, &start_label);
                self.builder.place_label(&end_label);
                Ok(())
            }
            Stmt::For {
                init,
                condition,
                post,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let start_label = self.builder.fresh_label();
                let end_label = self.builder.fresh_label();
                self.builder.place_label(&start_label);
                match condition {
                    Some(condition) => self.expr(condition)?,
                    // An absent condition is the integer 1.
                    None => self.builder.emit_push_const(Constant::Int(1)),
                }
                self.builder.emit_jump(Opcode::JmpIfFalse, &end_label);
                self.stmt(body)?;
                if let Some(post) = post {
                    self.stmt(post)?;
                }
                self.builder.emit_jump(Opcode::Jmp, &start_label);
                self.builder.place_label(&end_label);
                Ok(())
            }
            Stmt::Return(value) => {
                match value {
                    Some(expr) => self.expr(expr)?,
                    None => self.builder.emit_push_const(Constant::Unit),
                }
                self.builder.emit(Opcode::Return);
                Ok(())
            }
            // Definitions are handled at the top level.
            Stmt::FunctionDef(_) | Stmt::ClassDef(_) | Stmt::MethodDef(_) => Ok(()),
        }
    }

    fn expr(&mut self, expr: &Expr) -> UmkaResult<()> {
        match expr {
            Expr::Int(value) => {
                self.builder.emit_push_const(Constant::Int(*value));
                Ok(())
            }
            Expr::Double(value) => {
                self.builder.emit_push_const(Constant::Double(*value));
                Ok(())
            }
            Expr::Str(value) => {
                self.builder.emit_push_const(Constant::Str(value.clone()));
                Ok(())
            }
            // Booleans lower as integer constants; the pool has no bool tag.
            Expr::Bool(value) => {
                self.builder
                    .emit_push_const(Constant::Int(i64::from(*value)));
                Ok(())
            }
            Expr::Unit => {
                self.builder.emit_push_const(Constant::Unit);
                Ok(())
            }
            Expr::Ident(name) => {
                if self.tables.class_ids.contains_key(name) {
                    return self.instantiate_class(name);
                }
                let slot = self.variable_slot(name)?;
                self.builder.emit_with(Opcode::Load, slot);
                Ok(())
            }
            Expr::Array(elements) => {
                for element in elements {
                    self.expr(element)?;
                }
                self.builder
                    .emit_with(Opcode::BuildArr, elements.len() as i64);
                Ok(())
            }
            Expr::Binary { op, left, right } => {
                // Right first: the left operand ends on top and is the
                // interpreter's first pop.
                self.expr(right)?;
                self.expr(left)?;
                self.builder.emit(binary_opcode(*op));
                Ok(())
            }
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => {
                    self.expr(operand)?;
                    self.builder.emit(Opcode::Not);
                    Ok(())
                }
                UnaryOp::Plus => self.expr(operand),
                UnaryOp::Neg => {
                    // `-x` is `0 - x`: the zero lands on top as the left
                    // operand.
                    self.expr(operand)?;
                    self.builder.emit_push_const(Constant::Int(0));
                    self.builder.emit(Opcode::Sub);
                    Ok(())
                }
            },
            Expr::Call { name, args } => self.call(name, args),
            Expr::MethodCall {
                object,
                method,
                args,
            } => {
                for arg in args.iter().rev() {
                    self.expr(arg)?;
                }
                let slot = self.variable_slot(object)?;
                self.builder.emit_with(Opcode::Load, slot);
                let method_id =
                    *self.tables.method_ids.get(method).ok_or_else(|| {
                        UmkaError::new(
                            ErrorKind::Resolution,
                            format!("call to unknown method '{method}'"),
                        )
                    })?;
                self.builder.emit_with(Opcode::CallMethod, method_id);
                Ok(())
            }
            Expr::FieldAccess { object, field } => {
                let slot = self.variable_slot(object)?;
                self.builder.emit_with(Opcode::Load, slot);
                let field_id = self.field_id(field)?;
                self.builder.emit_with(Opcode::GetField, field_id);
                Ok(())
            }
        }
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> UmkaResult<()> {
        if let Some(cast) = cast_opcode(name) {
            if args.len() != 1 {
                return Err(UmkaError::new(
                    ErrorKind::Type,
                    format!("cast '{name}' requires exactly 1 argument"),
                ));
            }
            self.expr(&args[0])?;
            self.builder.emit(cast);
            return Ok(());
        }

        // Arguments in reverse source order: the first argument is the
        // callee's first pop.
        for arg in args.iter().rev() {
            self.expr(arg)?;
        }

        if let Some(builtin_id) = builtins::id_for_name(name) {
            self.builder.emit_with(Opcode::Call, builtin_id);
            return Ok(());
        }
        let function_id = *self.tables.function_ids.get(name).ok_or_else(|| {
            UmkaError::new(
                ErrorKind::Resolution,
                format!("call to unknown function '{name}'"),
            )
        })?;
        self.builder.emit_with(Opcode::Call, function_id as i64);
        Ok(())
    }

    /// Class instantiation: push the class id, the field defaults in
    /// field-index order, then build the object array. Element 0 ends up
    /// holding the class id.
    fn instantiate_class(&mut self, class_name: &str) -> UmkaResult<()> {
        let class_id = self.tables.class_ids[class_name];
        let defaults = &self.tables.class_defaults[class_name];
        self.builder.emit_push_const(Constant::Int(class_id));
        for default in defaults {
            self.expr(default)?;
        }
        self.builder
            .emit_with(Opcode::BuildArr, defaults.len() as i64 + 1);
        Ok(())
    }

    fn variable_slot(&mut self, name: &str) -> UmkaResult<i64> {
        self.builder.lookup_local(name).ok_or_else(|| {
            UmkaError::new(
                ErrorKind::Resolution,
                format!("unknown variable '{name}'"),
            )
        })
    }

    fn field_id(&self, name: &str) -> UmkaResult<i64> {
        self.tables.field_ids.get(name).copied().ok_or_else(|| {
            UmkaError::new(
                ErrorKind::Resolution,
                format!("unknown field '{name}'"),
            )
        })
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Rem => Opcode::Rem,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Neq => Opcode::Neq,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Lte => Opcode::Lte,
        BinaryOp::Gte => Opcode::Gte,
    }
}

fn cast_opcode(name: &str) -> Option<Opcode> {
    match name {
        "to_int" => Some(Opcode::ToInt),
        "to_double" => Some(Opcode::ToDouble),
        "to_string" => Some(Opcode::ToString),
        _ => None,
    }
}
