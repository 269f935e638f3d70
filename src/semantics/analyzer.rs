//! Semantic analysis: name resolution, type checking, channel-endpoint
//! typing and privacy enforcement.
//!
//! Two passes. Pass 1 collects every top-level name (shared variables,
//! programs, functions) into the symbol table, which makes import cycles
//! harmless. Pass 2 walks `main` first — channel declarations only live
//! there and fix the port signatures — then every program and function body.
//! Type errors do not abort the walk: the analyzer collects all of them and
//! reports the batch.

use std::collections::HashMap;

use log::debug;

use crate::error::{AlthreadError, CompileResult, ErrorKind, Pos};
use crate::frontend::ast::{
    AssertionKind, AssignOp, BinaryOp, Block, Endpoint, Expr, Node, Statement, TypeExpr, UnaryOp,
};
use crate::frontend::linker::{LinkedUnit, Module};
use crate::semantics::symbols::{FunctionSym, PortSig, ProgramSig, SharedVar, SymbolTable};
use crate::types::Type;

/// The analyzer's output: the linked unit plus its symbol table.
#[derive(Debug)]
pub struct CheckedUnit {
    /// The linked translation unit, unchanged.
    pub unit: LinkedUnit,
    /// Symbols and port signatures.
    pub symbols: SymbolTable,
}

/// Analyze a linked unit.
pub fn analyze(unit: LinkedUnit) -> CompileResult<CheckedUnit> {
    let mut analyzer = Analyzer::new(&unit);
    analyzer.collect_declarations();
    analyzer.scan_port_uses();
    analyzer.check_main();
    analyzer.check_programs();
    analyzer.check_functions();
    analyzer.check_assertions();
    if analyzer.errors.is_empty() {
        debug!(
            "analyzed {} program(s), {} function(s), {} shared variable(s)",
            analyzer.symbols.programs.len(),
            analyzer.symbols.functions.len(),
            analyzer.symbols.shared.len()
        );
        Ok(CheckedUnit {
            symbols: analyzer.symbols,
            unit,
        })
    } else {
        Err(analyzer.errors)
    }
}

/// Which body is being checked; constrains the statements allowed in it.
#[derive(Debug, Clone, PartialEq)]
enum BodyKind {
    Main,
    Program(String),
    Function(usize),
    Assertion,
}

/// Syntactic port use found by the pre-scan: arity and first position.
#[derive(Debug, Clone)]
struct PortUse {
    arity: usize,
    pos: Pos,
}

struct Analyzer<'a> {
    unit: &'a LinkedUnit,
    symbols: SymbolTable,
    errors: Vec<AlthreadError>,
    /// (program, port) -> send arity, from a syntactic walk of every body.
    sent_ports: HashMap<(String, String), PortUse>,
    /// (program, port) -> receive arity.
    received_ports: HashMap<(String, String), PortUse>,
    /// Per module: alias -> imported module path.
    aliases: HashMap<String, HashMap<String, String>>,
    /// Per module: unaliased imported module paths.
    open_imports: HashMap<String, Vec<String>>,
}

/// Lexical scope for one body: locals live in a single vector with scope
/// marks, mirroring how the lowerer assigns stack slots.
#[derive(Default)]
struct Scope {
    locals: Vec<(String, Type)>,
    marks: Vec<usize>,
}

impl Scope {
    fn enter(&mut self) {
        self.marks.push(self.locals.len());
    }

    fn exit(&mut self) {
        let mark = self.marks.pop().unwrap_or(0);
        self.locals.truncate(mark);
    }

    fn declare(&mut self, name: &str, ty: Type) {
        self.locals.push((name.to_string(), ty));
    }

    fn lookup(&self, name: &str) -> Option<&Type> {
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }
}

impl<'a> Analyzer<'a> {
    fn new(unit: &'a LinkedUnit) -> Self {
        let mut aliases = HashMap::new();
        let mut open_imports = HashMap::new();
        for module in unit.modules.values() {
            let mut alias_map = HashMap::new();
            let mut open = Vec::new();
            for import in &module.imports {
                match &import.alias {
                    Some(alias) => {
                        alias_map.insert(alias.clone(), import.path.clone());
                    }
                    None => open.push(import.path.clone()),
                }
            }
            aliases.insert(module.path.clone(), alias_map);
            open_imports.insert(module.path.clone(), open);
        }
        Analyzer {
            unit,
            symbols: SymbolTable::default(),
            errors: Vec::new(),
            sent_ports: HashMap::new(),
            received_ports: HashMap::new(),
            aliases,
            open_imports,
        }
    }

    fn error(&mut self, kind: ErrorKind, pos: Pos, message: impl Into<String>) {
        self.errors.push(AlthreadError::new(kind, pos, message));
    }

    fn modules_in_order(&self) -> impl Iterator<Item = &'a Module> + '_ {
        self.unit.order.iter().map(|path| &self.unit.modules[path])
    }

    // ------------------------------------------------------------------
    // Pass 1: declaration collection

    fn collect_declarations(&mut self) {
        let modules: Vec<&Module> = self.modules_in_order().collect();
        for module in &modules {
            for decl in &module.ast.shared {
                let name = decl.value.name.value.clone();
                if let Some(existing) = self.symbols.shared.get(&name) {
                    let prev = existing.pos.clone();
                    self.errors.push(
                        AlthreadError::new(
                            ErrorKind::Name,
                            decl.value.name.pos.clone(),
                            format!("shared variable '{}' is declared twice", name),
                        )
                        .with_note("previous declaration", prev),
                    );
                    continue;
                }
                let ty = self.shared_decl_type(module, decl);
                self.symbols.shared.insert(
                    name,
                    SharedVar {
                        ty,
                        module: module.path.clone(),
                        pos: decl.value.name.pos.clone(),
                    },
                );
            }

            for program in &module.ast.programs {
                let name = program.value.name.value.clone();
                if let Some(existing) = self.symbols.programs.get(&name) {
                    let prev = existing.pos.clone();
                    self.errors.push(
                        AlthreadError::new(
                            ErrorKind::Name,
                            program.value.name.pos.clone(),
                            format!("program '{}' is declared twice", name),
                        )
                        .with_note("previous declaration", prev),
                    );
                    continue;
                }
                let params = program
                    .value
                    .params
                    .iter()
                    .map(|p| (p.name.value.clone(), self.resolve_type(&p.ty)))
                    .collect();
                self.symbols.programs.insert(
                    name,
                    ProgramSig {
                        params,
                        module: module.path.clone(),
                        pos: program.value.name.pos.clone(),
                    },
                );
            }

            for function in &module.ast.functions {
                let name = function.value.name.value.clone();
                let key = (module.path.clone(), name.clone());
                if self.symbols.function_ids.contains_key(&key) {
                    self.error(
                        ErrorKind::Name,
                        function.value.name.pos.clone(),
                        format!("function '{}' is declared twice in this module", name),
                    );
                    continue;
                }
                let params = function
                    .value
                    .params
                    .iter()
                    .map(|p| (p.name.value.clone(), self.resolve_type(&p.ty)))
                    .collect();
                let ret = function
                    .value
                    .ret
                    .as_ref()
                    .map(|t| self.resolve_type(t))
                    .unwrap_or(Type::Void);
                let id = self.symbols.functions.len();
                self.symbols.functions.push(FunctionSym {
                    name,
                    module: module.path.clone(),
                    params,
                    ret,
                    private: function.value.private,
                    pos: function.value.name.pos.clone(),
                });
                self.symbols.function_ids.insert(key, id);
            }
        }

        if self.unit.entry_module().ast.main.is_none() {
            self.errors.push(AlthreadError::global(
                ErrorKind::Name,
                format!("entry file '{}' has no 'main' block", self.unit.entry),
            ));
        }
    }

    /// Type of a shared declaration: the annotation when present, otherwise
    /// the initializer's type. Shared initializers may only read shared
    /// variables declared before them.
    fn shared_decl_type(
        &mut self,
        module: &Module,
        decl: &Node<crate::frontend::ast::SharedDecl>,
    ) -> Type {
        let declared = decl.value.ty.as_ref().map(|t| self.resolve_type(t));
        let inferred = decl.value.init.as_ref().map(|init| {
            let mut scope = Scope::default();
            self.expr_type(module, &BodyKind::Assertion, &mut scope, init)
        });
        match (declared, inferred) {
            (Some(ty), Some(init_ty)) => {
                if !ty.accepts(&init_ty) {
                    let pos = decl.value.init.as_ref().unwrap().pos.clone();
                    self.error(
                        ErrorKind::Type,
                        pos,
                        format!("initializer has type {}, expected {}", init_ty, ty),
                    );
                }
                ty
            }
            (Some(ty), None) => ty,
            (None, Some(init_ty)) => init_ty,
            (None, None) => Type::Void,
        }
    }

    fn resolve_type(&mut self, ty: &Node<TypeExpr>) -> Type {
        match &ty.value {
            TypeExpr::Void => Type::Void,
            TypeExpr::Int => Type::Int,
            TypeExpr::Bool => Type::Bool,
            TypeExpr::String => Type::String,
            TypeExpr::Tuple(items) => {
                Type::Tuple(items.iter().map(|t| self.resolve_type(t)).collect())
            }
            TypeExpr::List(elem) => Type::List(Box::new(self.resolve_type(elem))),
            TypeExpr::Proc(name) => Type::Proc(name.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Port pre-scan: collect which ports each program syntactically uses

    fn scan_port_uses(&mut self) {
        let modules: Vec<&Module> = self.modules_in_order().collect();
        for module in &modules {
            for program in &module.ast.programs {
                let name = program.value.name.value.clone();
                Self::scan_block_ports(
                    &name,
                    &program.value.body.value,
                    &mut self.sent_ports,
                    &mut self.received_ports,
                );
            }
            if let Some(main) = &module.ast.main {
                Self::scan_block_ports(
                    "main",
                    &main.value,
                    &mut self.sent_ports,
                    &mut self.received_ports,
                );
            }
        }
    }

    fn scan_block_ports(
        program: &str,
        block: &Block,
        sent: &mut HashMap<(String, String), PortUse>,
        received: &mut HashMap<(String, String), PortUse>,
    ) {
        for stmt in &block.statements {
            match &stmt.value {
                Statement::Send { port, args } => {
                    sent.entry((program.to_string(), port.value.clone()))
                        .or_insert_with(|| PortUse {
                            arity: args.len(),
                            pos: port.pos.clone(),
                        });
                }
                Statement::Receive { port, binds, body } => {
                    received
                        .entry((program.to_string(), port.value.clone()))
                        .or_insert_with(|| PortUse {
                            arity: binds.len(),
                            pos: port.pos.clone(),
                        });
                    Self::scan_block_ports(program, &body.value, sent, received);
                }
                Statement::If {
                    then_block,
                    else_block,
                    ..
                } => {
                    Self::scan_block_ports(program, &then_block.value, sent, received);
                    if let Some(else_block) = else_block {
                        Self::scan_block_ports(program, &else_block.value, sent, received);
                    }
                }
                Statement::Loop { body }
                | Statement::While { body, .. }
                | Statement::For { body, .. }
                | Statement::Atomic(body) => {
                    Self::scan_block_ports(program, &body.value, sent, received);
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Pass 2: body checking

    fn check_main(&mut self) {
        let entry = self.unit.entry_module();
        let Some(main) = entry.ast.main.clone() else {
            return;
        };
        let mut scope = Scope::default();
        self.check_block(entry, &BodyKind::Main, &mut scope, &main.value, false);
    }

    fn check_programs(&mut self) {
        let modules: Vec<&Module> = self.modules_in_order().collect();
        for module in &modules {
            for program in &module.ast.programs {
                let kind = BodyKind::Program(program.value.name.value.clone());
                let mut scope = Scope::default();
                for param in &program.value.params {
                    let ty = self.resolve_type(&param.ty);
                    scope.declare(&param.name.value, ty);
                }
                self.check_block(module, &kind, &mut scope, &program.value.body.value, false);
            }
        }
    }

    fn check_functions(&mut self) {
        let modules: Vec<&Module> = self.modules_in_order().collect();
        for module in &modules {
            for function in &module.ast.functions {
                let Some(id) = self.symbols.function_id(&module.path, &function.value.name.value)
                else {
                    continue;
                };
                let kind = BodyKind::Function(id);
                let mut scope = Scope::default();
                for param in &function.value.params {
                    let ty = self.resolve_type(&param.ty);
                    scope.declare(&param.name.value, ty);
                }
                self.check_block(module, &kind, &mut scope, &function.value.body.value, false);
            }
        }
    }

    fn check_assertions(&mut self) {
        let modules: Vec<&Module> = self.modules_in_order().collect();
        for module in &modules {
            for assertion in &module.ast.assertions {
                for condition in &assertion.value.conditions {
                    let mut scope = Scope::default();
                    let ty = self.expr_type(module, &BodyKind::Assertion, &mut scope, condition);
                    if ty != Type::Bool && ty != Type::Void {
                        self.error(
                            ErrorKind::Type,
                            condition.pos.clone(),
                            format!(
                                "{} condition must be a boolean, got {}",
                                match assertion.value.kind {
                                    AssertionKind::Always => "always",
                                    AssertionKind::Eventually => "eventually",
                                },
                                ty
                            ),
                        );
                    }
                }
            }
        }
    }

    fn check_block(
        &mut self,
        module: &Module,
        kind: &BodyKind,
        scope: &mut Scope,
        block: &Block,
        in_loop: bool,
    ) {
        scope.enter();
        for stmt in &block.statements {
            self.check_stmt(module, kind, scope, stmt, in_loop);
        }
        scope.exit();
    }

    fn check_stmt(
        &mut self,
        module: &Module,
        kind: &BodyKind,
        scope: &mut Scope,
        stmt: &Node<Statement>,
        in_loop: bool,
    ) {
        match &stmt.value {
            Statement::Let { name, ty, init } => {
                let declared = ty.as_ref().map(|t| self.resolve_type(t));
                let inferred = init
                    .as_ref()
                    .map(|init| self.expr_type(module, kind, scope, init));
                let ty = match (declared, inferred) {
                    (Some(declared), Some(inferred)) => {
                        if !declared.accepts(&inferred) {
                            self.error(
                                ErrorKind::Type,
                                init.as_ref().unwrap().pos.clone(),
                                format!(
                                    "initializer has type {}, expected {}",
                                    inferred, declared
                                ),
                            );
                        }
                        declared
                    }
                    (Some(declared), None) => declared,
                    (None, Some(inferred)) => inferred,
                    (None, None) => Type::Void,
                };
                scope.declare(&name.value, ty);
            }
            Statement::Assign { target, op, value } => {
                let value_ty = self.expr_type(module, kind, scope, value);
                let first = target.value.chars().next().unwrap_or('_');
                let target_ty = if first.is_uppercase() {
                    match self.symbols.shared.get(&target.value) {
                        Some(var) => Some(var.ty.clone()),
                        None => {
                            self.error(
                                ErrorKind::Name,
                                target.pos.clone(),
                                format!("unresolved shared variable '{}'", target.value),
                            );
                            None
                        }
                    }
                } else {
                    match scope.lookup(&target.value) {
                        Some(ty) => Some(ty.clone()),
                        None => {
                            self.error(
                                ErrorKind::Name,
                                target.pos.clone(),
                                format!("unresolved variable '{}'", target.value),
                            );
                            None
                        }
                    }
                };
                if let Some(target_ty) = target_ty {
                    self.check_assign_op(*op, &target_ty, &value_ty, &value.pos);
                }
            }
            Statement::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expect_bool(module, kind, scope, cond, "if condition");
                self.check_block(module, kind, scope, &then_block.value, in_loop);
                if let Some(else_block) = else_block {
                    self.check_block(module, kind, scope, &else_block.value, in_loop);
                }
            }
            Statement::Loop { body } => {
                self.check_block(module, kind, scope, &body.value, true);
            }
            Statement::While { cond, body } => {
                self.expect_bool(module, kind, scope, cond, "while condition");
                self.check_block(module, kind, scope, &body.value, true);
            }
            Statement::For {
                var,
                from,
                to,
                body,
            } => {
                self.expect_int(module, kind, scope, from, "range bound");
                self.expect_int(module, kind, scope, to, "range bound");
                scope.enter();
                scope.declare(&var.value, Type::Int);
                self.check_block(module, kind, scope, &body.value, true);
                scope.exit();
            }
            Statement::Break | Statement::Continue => {
                if !in_loop {
                    self.error(
                        ErrorKind::Type,
                        stmt.pos.clone(),
                        "break/continue outside of a loop",
                    );
                }
            }
            Statement::Return(value) => {
                let BodyKind::Function(id) = kind else {
                    self.error(
                        ErrorKind::Type,
                        stmt.pos.clone(),
                        "'return' is only allowed inside functions",
                    );
                    return;
                };
                let ret = self.symbols.function(*id).ret.clone();
                let actual = value
                    .as_ref()
                    .map(|v| self.expr_type(module, kind, scope, v))
                    .unwrap_or(Type::Void);
                if !ret.accepts(&actual) {
                    self.error(
                        ErrorKind::Type,
                        stmt.pos.clone(),
                        format!("return type {} does not match declared {}", actual, ret),
                    );
                }
            }
            Statement::Print(args) => {
                for arg in args {
                    self.expr_type(module, kind, scope, arg);
                }
            }
            Statement::Expr(expr) => {
                self.expr_type(module, kind, scope, expr);
            }
            Statement::Send { port, args } => {
                let program = match self.concurrency_context(kind, &stmt.pos, "send") {
                    Some(p) => p,
                    None => return,
                };
                let arg_types: Vec<Type> = args
                    .iter()
                    .map(|a| self.expr_type(module, kind, scope, a))
                    .collect();
                // A port without a channel declaration is a runtime fault,
                // not a compile error; only declared ports are checked here.
                if let Some(sig) = self
                    .symbols
                    .out_ports
                    .get(&(program.clone(), port.value.clone()))
                    .cloned()
                {
                    if sig.types.len() != arg_types.len() {
                        self.error(
                            ErrorKind::PortMismatch,
                            port.pos.clone(),
                            format!(
                                "port '{}' carries {} component(s), send has {}",
                                port.value,
                                sig.types.len(),
                                arg_types.len()
                            ),
                        );
                    } else {
                        for (i, (expected, actual)) in
                            sig.types.iter().zip(&arg_types).enumerate()
                        {
                            if !expected.accepts(actual) {
                                self.error(
                                    ErrorKind::PortMismatch,
                                    args[i].pos.clone(),
                                    format!(
                                        "component {} of port '{}' is {}, got {}",
                                        i, port.value, expected, actual
                                    ),
                                );
                            }
                        }
                    }
                }
            }
            Statement::Receive { port, binds, body } => {
                let program = match self.concurrency_context(kind, &stmt.pos, "await receive") {
                    Some(p) => p,
                    None => return,
                };
                let sig = self
                    .symbols
                    .in_ports
                    .get(&(program.clone(), port.value.clone()))
                    .cloned();
                scope.enter();
                match sig {
                    Some(sig) => {
                        if sig.types.len() != binds.len() {
                            self.error(
                                ErrorKind::PortMismatch,
                                port.pos.clone(),
                                format!(
                                    "port '{}' carries {} component(s), receive binds {}",
                                    port.value,
                                    sig.types.len(),
                                    binds.len()
                                ),
                            );
                        }
                        for (bind, ty) in binds.iter().zip(sig.types.iter()) {
                            scope.declare(&bind.value, ty.clone());
                        }
                    }
                    None => {
                        self.error(
                            ErrorKind::PortMismatch,
                            port.pos.clone(),
                            format!(
                                "no channel declaration delivers to port '{}' of '{}'",
                                port.value, program
                            ),
                        );
                        for bind in binds {
                            scope.declare(&bind.value, Type::Void);
                        }
                    }
                }
                self.check_block(module, kind, scope, &body.value, in_loop);
                scope.exit();
            }
            Statement::Wait(cond) => {
                if self.concurrency_context(kind, &stmt.pos, "wait").is_none() {
                    return;
                }
                self.expect_bool(module, kind, scope, cond, "wait condition");
            }
            Statement::Atomic(body) => {
                if self.concurrency_context(kind, &stmt.pos, "atomic").is_none() {
                    return;
                }
                self.check_block(module, kind, scope, &body.value, in_loop);
            }
            Statement::ChannelDecl {
                sender,
                sender_port,
                types,
                receiver,
                receiver_port,
            } => {
                if *kind != BodyKind::Main {
                    self.error(
                        ErrorKind::Type,
                        stmt.pos.clone(),
                        "channel declarations are only allowed in 'main'",
                    );
                    return;
                }
                let types: Vec<Type> = types.iter().map(|t| self.resolve_type(t)).collect();
                let sender_program = self.endpoint_program(scope, sender);
                let receiver_program = self.endpoint_program(scope, receiver);

                if let Some(program) = sender_program {
                    self.bind_port(
                        program,
                        sender_port,
                        &types,
                        &stmt.pos,
                        PortDirection::Out,
                    );
                }
                if let Some(program) = receiver_program {
                    self.bind_port(
                        program,
                        receiver_port,
                        &types,
                        &stmt.pos,
                        PortDirection::In,
                    );
                }
            }
        }
    }

    fn check_assign_op(&mut self, op: AssignOp, target: &Type, value: &Type, pos: &Pos) {
        match op {
            AssignOp::Set => {
                if !target.accepts(value) {
                    self.error(
                        ErrorKind::Type,
                        pos.clone(),
                        format!("cannot assign {} to {}", value, target),
                    );
                }
            }
            AssignOp::Add => {
                let ok = matches!(target, Type::Int | Type::String | Type::List(_))
                    && target.accepts(value);
                if !ok {
                    self.error(
                        ErrorKind::Type,
                        pos.clone(),
                        format!("'+=' expects matching int, string or list, got {}", value),
                    );
                }
            }
            AssignOp::Sub | AssignOp::Mul | AssignOp::Div | AssignOp::Mod => {
                if *target != Type::Int || *value != Type::Int {
                    self.error(
                        ErrorKind::Type,
                        pos.clone(),
                        "arithmetic compound assignment expects int operands",
                    );
                }
            }
        }
    }

    /// The program name a concurrency statement executes in, or `None` with
    /// an error recorded when the statement is not allowed here.
    fn concurrency_context(
        &mut self,
        kind: &BodyKind,
        pos: &Pos,
        what: &str,
    ) -> Option<String> {
        match kind {
            BodyKind::Main => Some("main".to_string()),
            BodyKind::Program(name) => Some(name.clone()),
            BodyKind::Function(_) | BodyKind::Assertion => {
                self.error(
                    ErrorKind::Type,
                    pos.clone(),
                    format!("'{}' is not allowed inside functions", what),
                );
                None
            }
        }
    }

    fn endpoint_program(&mut self, scope: &Scope, endpoint: &Node<Endpoint>) -> Option<String> {
        match &endpoint.value {
            Endpoint::Current => Some("main".to_string()),
            Endpoint::Var(name) => match scope.lookup(name) {
                Some(Type::Proc(program)) => Some(program.clone()),
                Some(other) => {
                    let other = other.clone();
                    self.error(
                        ErrorKind::Type,
                        endpoint.pos.clone(),
                        format!("channel endpoint must be a process handle, got {}", other),
                    );
                    None
                }
                None => {
                    self.error(
                        ErrorKind::Name,
                        endpoint.pos.clone(),
                        format!("unresolved variable '{}'", name),
                    );
                    None
                }
            },
        }
    }

    fn bind_port(
        &mut self,
        program: String,
        port: &Node<String>,
        types: &[Type],
        decl_pos: &Pos,
        direction: PortDirection,
    ) {
        let uses = match direction {
            PortDirection::Out => &self.sent_ports,
            PortDirection::In => &self.received_ports,
        };
        let key = (program.clone(), port.value.clone());
        match uses.get(&key) {
            Some(use_site) => {
                if use_site.arity != types.len() {
                    let use_pos = use_site.pos.clone();
                    self.errors.push(
                        AlthreadError::new(
                            ErrorKind::PortMismatch,
                            decl_pos.clone(),
                            format!(
                                "channel declares {} component(s) but port '{}' of '{}' uses {}",
                                types.len(),
                                port.value,
                                program,
                                use_site.arity
                            ),
                        )
                        .with_note("port used here", use_pos),
                    );
                }
            }
            None => {
                let verb = match direction {
                    PortDirection::Out => "send on",
                    PortDirection::In => "receive on",
                };
                self.error(
                    ErrorKind::PortMismatch,
                    port.pos.clone(),
                    format!("program '{}' has no {} port '{}'", program, verb, port.value),
                );
            }
        }

        let table = match direction {
            PortDirection::Out => &mut self.symbols.out_ports,
            PortDirection::In => &mut self.symbols.in_ports,
        };
        match table.get(&key) {
            Some(existing) if existing.types != types => {
                let prev = existing.decl_pos.clone();
                self.errors.push(
                    AlthreadError::new(
                        ErrorKind::PortMismatch,
                        decl_pos.clone(),
                        format!(
                            "conflicting channel types for port '{}' of '{}'",
                            port.value, program
                        ),
                    )
                    .with_note("first declared here", prev),
                );
            }
            Some(_) => {}
            None => {
                table.insert(
                    key,
                    PortSig {
                        types: types.to_vec(),
                        decl_pos: decl_pos.clone(),
                    },
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    fn expect_bool(
        &mut self,
        module: &Module,
        kind: &BodyKind,
        scope: &mut Scope,
        expr: &Node<Expr>,
        what: &str,
    ) {
        let ty = self.expr_type(module, kind, scope, expr);
        if ty != Type::Bool && ty != Type::Void {
            self.error(
                ErrorKind::Type,
                expr.pos.clone(),
                format!("{} must be a boolean, got {}", what, ty),
            );
        }
    }

    fn expect_int(
        &mut self,
        module: &Module,
        kind: &BodyKind,
        scope: &mut Scope,
        expr: &Node<Expr>,
        what: &str,
    ) {
        let ty = self.expr_type(module, kind, scope, expr);
        if ty != Type::Int && ty != Type::Void {
            self.error(
                ErrorKind::Type,
                expr.pos.clone(),
                format!("{} must be an int, got {}", what, ty),
            );
        }
    }

    /// Type of an expression; records errors and returns `Type::Void` as a
    /// poison value so one mistake does not cascade.
    fn expr_type(
        &mut self,
        module: &Module,
        kind: &BodyKind,
        scope: &mut Scope,
        expr: &Node<Expr>,
    ) -> Type {
        match &expr.value {
            Expr::Literal(lit) => lit.type_of(),
            Expr::Local(name) => match scope.lookup(name) {
                Some(ty) => ty.clone(),
                None => {
                    self.error(
                        ErrorKind::Name,
                        expr.pos.clone(),
                        format!("unresolved variable '{}'", name),
                    );
                    Type::Void
                }
            },
            Expr::Shared(name) => match self.symbols.shared.get(name) {
                Some(var) => var.ty.clone(),
                None => {
                    self.error(
                        ErrorKind::Name,
                        expr.pos.clone(),
                        format!("unresolved shared variable '{}'", name),
                    );
                    Type::Void
                }
            },
            Expr::Binary { op, left, right } => {
                let lt = self.expr_type(module, kind, scope, left);
                let rt = self.expr_type(module, kind, scope, right);
                self.binary_type(*op, &lt, &rt, &expr.pos)
            }
            Expr::Unary { op, operand } => {
                let ty = self.expr_type(module, kind, scope, operand);
                match op {
                    UnaryOp::Neg => {
                        if ty != Type::Int && ty != Type::Void {
                            self.error(
                                ErrorKind::Type,
                                operand.pos.clone(),
                                format!("'-' expects an int, got {}", ty),
                            );
                        }
                        Type::Int
                    }
                    UnaryOp::Not => {
                        if ty != Type::Bool && ty != Type::Void {
                            self.error(
                                ErrorKind::Type,
                                operand.pos.clone(),
                                format!("'!' expects a bool, got {}", ty),
                            );
                        }
                        Type::Bool
                    }
                }
            }
            Expr::Call { alias, name, args } => {
                self.call_type(module, kind, scope, expr, alias.as_deref(), name, args)
            }
            Expr::Run {
                alias,
                program,
                args,
            } => {
                if matches!(kind, BodyKind::Function(_) | BodyKind::Assertion) {
                    self.error(
                        ErrorKind::Type,
                        expr.pos.clone(),
                        "'run' is not allowed inside functions or assertions",
                    );
                    return Type::Void;
                }
                // Aliases only scope the lookup; program names are unique
                // across the unit, so the alias is validated and dropped.
                if let Some(alias) = alias {
                    if !self.aliases[&module.path].contains_key(alias) {
                        self.error(
                            ErrorKind::Name,
                            expr.pos.clone(),
                            format!("unknown import alias '{}'", alias),
                        );
                    }
                }
                let Some(sig) = self.symbols.programs.get(program).cloned() else {
                    self.error(
                        ErrorKind::Name,
                        expr.pos.clone(),
                        format!("unresolved program '{}'", program),
                    );
                    return Type::Void;
                };
                if sig.params.len() != args.len() {
                    self.error(
                        ErrorKind::Type,
                        expr.pos.clone(),
                        format!(
                            "program '{}' takes {} argument(s), got {}",
                            program,
                            sig.params.len(),
                            args.len()
                        ),
                    );
                }
                for (arg, (_, param_ty)) in args.iter().zip(sig.params.iter()) {
                    let arg_ty = self.expr_type(module, kind, scope, arg);
                    if !param_ty.accepts(&arg_ty) && arg_ty != Type::Void {
                        self.error(
                            ErrorKind::Type,
                            arg.pos.clone(),
                            format!("argument has type {}, expected {}", arg_ty, param_ty),
                        );
                    }
                }
                Type::Proc(program.clone())
            }
            Expr::Tuple(items) => Type::Tuple(
                items
                    .iter()
                    .map(|item| self.expr_type(module, kind, scope, item))
                    .collect(),
            ),
            Expr::ListLit(items) => {
                let mut elem = Type::Void;
                for (i, item) in items.iter().enumerate() {
                    let ty = self.expr_type(module, kind, scope, item);
                    if i == 0 {
                        elem = ty;
                    } else if !elem.accepts(&ty) && ty != Type::Void {
                        self.error(
                            ErrorKind::Type,
                            item.pos.clone(),
                            format!("list element has type {}, expected {}", ty, elem),
                        );
                    }
                }
                Type::List(Box::new(elem))
            }
            Expr::Index { base, index } => {
                let base_ty = self.expr_type(module, kind, scope, base);
                self.expect_int(module, kind, scope, index, "index");
                match base_ty {
                    Type::List(elem) => *elem,
                    Type::Void => Type::Void,
                    other => {
                        self.error(
                            ErrorKind::Type,
                            base.pos.clone(),
                            format!("only lists can be indexed, got {}", other),
                        );
                        Type::Void
                    }
                }
            }
        }
    }

    fn binary_type(&mut self, op: BinaryOp, left: &Type, right: &Type, pos: &Pos) -> Type {
        use BinaryOp::*;
        // Poisoned operands were already reported.
        if *left == Type::Void || *right == Type::Void {
            return match op {
                Eq | Ne | Lt | Le | Gt | Ge | And | Or => Type::Bool,
                _ => Type::Void,
            };
        }
        match op {
            Add => match (left, right) {
                (Type::Int, Type::Int) => Type::Int,
                (Type::String, Type::String) => Type::String,
                (Type::List(_), Type::List(_)) if left.accepts(right) || right.accepts(left) => {
                    if left.accepts(right) {
                        left.clone()
                    } else {
                        right.clone()
                    }
                }
                _ => {
                    self.error(
                        ErrorKind::Type,
                        pos.clone(),
                        format!("'+' cannot combine {} and {}", left, right),
                    );
                    Type::Void
                }
            },
            Sub | Mul | Div | Mod => {
                if *left != Type::Int || *right != Type::Int {
                    self.error(
                        ErrorKind::Type,
                        pos.clone(),
                        format!("arithmetic expects int operands, got {} and {}", left, right),
                    );
                }
                Type::Int
            }
            Eq | Ne => {
                if !left.accepts(right) && !right.accepts(left) {
                    self.error(
                        ErrorKind::Type,
                        pos.clone(),
                        format!("cannot compare {} and {}", left, right),
                    );
                }
                Type::Bool
            }
            Lt | Le | Gt | Ge => {
                if *left != Type::Int || *right != Type::Int {
                    self.error(
                        ErrorKind::Type,
                        pos.clone(),
                        format!("ordering expects int operands, got {} and {}", left, right),
                    );
                }
                Type::Bool
            }
            And | Or => {
                if *left != Type::Bool || *right != Type::Bool {
                    self.error(
                        ErrorKind::Type,
                        pos.clone(),
                        format!("logic expects bool operands, got {} and {}", left, right),
                    );
                }
                Type::Bool
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn call_type(
        &mut self,
        module: &Module,
        kind: &BodyKind,
        scope: &mut Scope,
        expr: &Node<Expr>,
        alias: Option<&str>,
        name: &str,
        args: &[Node<Expr>],
    ) -> Type {
        // Builtin: len(list | string)
        if alias.is_none() && name == "len" {
            if args.len() != 1 {
                self.error(
                    ErrorKind::Type,
                    expr.pos.clone(),
                    "len() takes exactly one argument",
                );
                return Type::Int;
            }
            let ty = self.expr_type(module, kind, scope, &args[0]);
            if !matches!(ty, Type::List(_) | Type::String | Type::Tuple(_) | Type::Void) {
                self.error(
                    ErrorKind::Type,
                    args[0].pos.clone(),
                    format!("len() expects a list, string or tuple, got {}", ty),
                );
            }
            return Type::Int;
        }

        if *kind == BodyKind::Assertion {
            self.error(
                ErrorKind::Type,
                expr.pos.clone(),
                "function calls are not allowed in assertions",
            );
            return Type::Void;
        }

        let Some(id) = self.resolve_function(module, alias, name, &expr.pos) else {
            return Type::Void;
        };
        let sig = self.symbols.function(id).clone();
        if sig.params.len() != args.len() {
            self.error(
                ErrorKind::Type,
                expr.pos.clone(),
                format!(
                    "function '{}' takes {} argument(s), got {}",
                    name,
                    sig.params.len(),
                    args.len()
                ),
            );
        }
        for (arg, (_, param_ty)) in args.iter().zip(sig.params.iter()) {
            let arg_ty = self.expr_type(module, kind, scope, arg);
            if !param_ty.accepts(&arg_ty) && arg_ty != Type::Void {
                self.error(
                    ErrorKind::Type,
                    arg.pos.clone(),
                    format!("argument has type {}, expected {}", arg_ty, param_ty),
                );
            }
        }
        sig.ret
    }

    /// Resolve a function reference from `module`, enforcing `@private`.
    fn resolve_function(
        &mut self,
        module: &Module,
        alias: Option<&str>,
        name: &str,
        pos: &Pos,
    ) -> Option<usize> {
        match alias {
            Some(alias) => {
                let Some(target) = self.aliases[&module.path].get(alias).cloned() else {
                    self.error(
                        ErrorKind::Name,
                        pos.clone(),
                        format!("unknown import alias '{}'", alias),
                    );
                    return None;
                };
                let Some(id) = self.symbols.function_id(&target, name) else {
                    self.error(
                        ErrorKind::Name,
                        pos.clone(),
                        format!("module '{}' has no function '{}'", target, name),
                    );
                    return None;
                };
                if self.symbols.function(id).private {
                    self.error(
                        ErrorKind::Privacy,
                        pos.clone(),
                        format!("function '{}' is private to '{}'", name, target),
                    );
                    return None;
                }
                Some(id)
            }
            None => {
                // Own module first, then public functions of open imports.
                if let Some(id) = self.symbols.function_id(&module.path, name) {
                    return Some(id);
                }
                for imported in &self.open_imports[&module.path] {
                    if let Some(id) = self.symbols.function_id(imported, name) {
                        if self.symbols.function(id).private {
                            continue;
                        }
                        return Some(id);
                    }
                }
                self.error(
                    ErrorKind::Name,
                    pos.clone(),
                    format!("unresolved function '{}'", name),
                );
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortDirection {
    Out,
    In,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::linker::{link, VirtualFs};

    fn analyze_src(src: &str) -> CompileResult<CheckedUnit> {
        let unit = link("main.alt", src, &VirtualFs::new()).map_err(|e| vec![e])?;
        analyze(unit)
    }

    fn analyze_fs(src: &str, files: &[(&str, &str)]) -> CompileResult<CheckedUnit> {
        let vfs: VirtualFs = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        let unit = link("main.alt", src, &vfs).map_err(|e| vec![e])?;
        analyze(unit)
    }

    #[test]
    fn test_shared_counter_checks() {
        let checked = analyze_src(
            "shared { let C: int = 0; }\n\
             program Inc() { C = C + 1; }\n\
             main { run Inc(); run Inc(); wait until C == 2; }\n\
             always { C <= 2; }",
        )
        .unwrap();
        assert_eq!(checked.symbols.shared["C"].ty, Type::Int);
        assert!(checked.symbols.programs.contains_key("Inc"));
    }

    #[test]
    fn test_unresolved_shared() {
        let errs = analyze_src("main { wait until Missing == 1; }").unwrap_err();
        assert!(errs.iter().any(|e| e.kind == ErrorKind::Name));
    }

    #[test]
    fn test_type_errors_are_collected() {
        let errs = analyze_src(
            "shared { let C: int = 0; }\n\
             main { C = true; let x: bool = 3; }",
        )
        .unwrap_err();
        let type_errors = errs.iter().filter(|e| e.kind == ErrorKind::Type).count();
        assert_eq!(type_errors, 2);
    }

    #[test]
    fn test_channel_port_typing() {
        let checked = analyze_src(
            "program Producer() { send out(1, true); }\n\
             program Consumer() { await receive inp(x, ok) => { print(x, ok); } }\n\
             main {\n\
                 let p = run Producer();\n\
                 let c = run Consumer();\n\
                 channel p.out (int, bool) > c.inp;\n\
             }",
        )
        .unwrap();
        let sig = &checked.symbols.out_ports[&("Producer".to_string(), "out".to_string())];
        assert_eq!(sig.types, vec![Type::Int, Type::Bool]);
    }

    #[test]
    fn test_channel_arity_mismatch() {
        let errs = analyze_src(
            "program Producer() { send out(1); }\n\
             program Consumer() { await receive inp(x, y) => { } }\n\
             main {\n\
                 let p = run Producer();\n\
                 let c = run Consumer();\n\
                 channel p.out (int, int) > c.inp;\n\
             }",
        )
        .unwrap_err();
        assert!(errs.iter().any(|e| e.kind == ErrorKind::PortMismatch));
    }

    #[test]
    fn test_channel_on_unused_port() {
        let errs = analyze_src(
            "program Quiet() { wait until true; }\n\
             program Consumer() { await receive inp(x) => { } }\n\
             main {\n\
                 let q = run Quiet();\n\
                 let c = run Consumer();\n\
                 channel q.out (int) > c.inp;\n\
             }",
        )
        .unwrap_err();
        assert!(errs
            .iter()
            .any(|e| e.kind == ErrorKind::PortMismatch && e.message.contains("no send on")));
    }

    #[test]
    fn test_channel_outside_main() {
        let errs = analyze_src(
            "program P() { channel self.a (int) > self.b; }\n\
             main { run P(); }",
        )
        .unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("only allowed in 'main'")));
    }

    #[test]
    fn test_privacy_enforced() {
        let errs = analyze_fs(
            "import \"lib.alt\" as Lib;\nmain { let x = Lib.secret(); }",
            &[("lib.alt", "@private fn secret() -> int { return 1; }")],
        )
        .unwrap_err();
        assert!(errs.iter().any(|e| e.kind == ErrorKind::Privacy));
    }

    #[test]
    fn test_open_import_skips_private() {
        let errs = analyze_fs(
            "import \"lib.alt\";\nmain { let x = secret(); }",
            &[("lib.alt", "@private fn secret() -> int { return 1; }")],
        )
        .unwrap_err();
        assert!(errs.iter().any(|e| e.kind == ErrorKind::Name));
    }

    #[test]
    fn test_break_outside_loop() {
        let errs = analyze_src("main { break; }").unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("outside of a loop")));
    }

    #[test]
    fn test_return_type_checked() {
        let errs = analyze_src("fn f() -> int { return true; }\nmain { }").unwrap_err();
        assert!(errs.iter().any(|e| e.kind == ErrorKind::Type));
    }

    #[test]
    fn test_function_cannot_wait() {
        let errs = analyze_src("fn f() { wait until true; }\nmain { }").unwrap_err();
        assert!(errs
            .iter()
            .any(|e| e.message.contains("not allowed inside functions")));
    }

    #[test]
    fn test_run_yields_proc_type() {
        let checked = analyze_src(
            "program P() { wait until true; }\n\
             main { let p = run P(); print(p == p); }",
        )
        .unwrap();
        assert!(checked.symbols.programs.contains_key("P"));
    }
}
