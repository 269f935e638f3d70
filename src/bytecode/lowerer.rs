//! AST to bytecode lowering.
//!
//! Stack-machine discipline: each expression leaves exactly one value, each
//! statement leaves the stack balanced. Locals occupy the bottom of the
//! frame, so declaring a local is just leaving its initializer on the stack
//! and recording the slot; scope exit pops the slots again. Forward jumps
//! are emitted with a placeholder target and patched once the target is
//! known.

use log::debug;

use crate::bytecode::instruction::{BinOp, Instruction, Op, UnOp};
use crate::bytecode::program::{
    eval_pure, Assertion, AssertionKind, CompiledProgram, FunctionCode, ProgramCode,
};
use crate::error::{AlthreadError, AlthreadResult, ErrorKind, Pos};
use crate::frontend::ast::{
    self, AssignOp, Block, Endpoint, Expr, Node, Statement,
};
use crate::frontend::linker::Module;
use crate::semantics::{CheckedUnit, SymbolTable};
use crate::types::{Literal, Type};

/// Lower a checked unit to a compiled program.
pub fn lower(checked: &CheckedUnit) -> AlthreadResult<CompiledProgram> {
    let mut compiled = CompiledProgram::default();

    lower_shared_init(checked, &mut compiled)?;

    for path in &checked.unit.order {
        let module = &checked.unit.modules[path];
        for program in &module.ast.programs {
            let code = lower_program(
                checked,
                module,
                &program.value.name.value,
                &program.value.params,
                &program.value.body,
            )?;
            compiled.programs.insert(code.name.clone(), code);
        }
        for assertion in &module.ast.assertions {
            lower_assertions(checked, module, assertion, &mut compiled)?;
        }
    }

    // Functions are lowered in symbol order so ids line up with `Call`.
    for sym in &checked.symbols.functions {
        let module = &checked.unit.modules[&sym.module];
        let decl = module
            .ast
            .functions
            .iter()
            .find(|f| f.value.name.value == sym.name)
            .expect("symbol table entries come from the AST");
        compiled
            .functions
            .push(lower_function(checked, module, sym.name.clone(), decl)?);
    }

    let entry = checked.unit.entry_module();
    let main = entry
        .ast
        .main
        .as_ref()
        .expect("the analyzer rejects units without 'main'");
    let main_code = lower_program(checked, entry, "main", &[], main)?;
    compiled.programs.insert("main".to_string(), main_code);

    debug!(
        "lowered {} program(s), {} function(s), {} assertion(s)",
        compiled.programs.len(),
        compiled.functions.len(),
        compiled.assertions.len()
    );
    Ok(compiled)
}

/// Shared initializers are evaluated at compile time, in declaration order;
/// an initializer may read the shared variables declared before it.
fn lower_shared_init(
    checked: &CheckedUnit,
    compiled: &mut CompiledProgram,
) -> AlthreadResult<()> {
    for path in &checked.unit.order {
        let module = &checked.unit.modules[path];
        for decl in &module.ast.shared {
            let name = decl.value.name.value.clone();
            let value = match &decl.value.init {
                Some(init) => {
                    let mut body = BodyLowerer::new(checked, module);
                    body.expr(init)?;
                    let done: Vec<(String, Literal)> = compiled.shared_init.clone();
                    eval_pure(&body.code, &|n| {
                        done.iter()
                            .find(|(name, _)| name == n)
                            .map(|(_, v)| v.clone())
                    })
                    .map_err(|e| {
                        AlthreadError::new(
                            ErrorKind::Type,
                            init.pos.clone(),
                            format!("shared initializer cannot be evaluated: {}", e),
                        )
                    })?
                }
                None => {
                    let ty = checked.symbols.shared[&name].ty.clone();
                    Literal::default_of(&ty)
                }
            };
            compiled.shared_init.push((name, value));
        }
    }
    Ok(())
}

fn lower_program(
    checked: &CheckedUnit,
    module: &Module,
    name: &str,
    params: &[ast::Param],
    body: &Node<Block>,
) -> AlthreadResult<ProgramCode> {
    let mut lowerer = BodyLowerer::new(checked, module);
    let mut param_types = Vec::new();
    for param in params {
        let ty = resolve_type(&param.ty.value);
        lowerer.locals.push(param.name.value.clone());
        param_types.push((param.name.value.clone(), ty));
    }
    lowerer.block(body)?;
    lowerer.emit(Op::Halt, Some(body.pos.clone()));
    Ok(ProgramCode {
        name: name.to_string(),
        params: param_types,
        instructions: lowerer.code,
    })
}

fn lower_function(
    checked: &CheckedUnit,
    module: &Module,
    name: String,
    decl: &Node<ast::FunctionDecl>,
) -> AlthreadResult<FunctionCode> {
    let mut lowerer = BodyLowerer::new(checked, module);
    let mut param_types = Vec::new();
    for param in &decl.value.params {
        let ty = resolve_type(&param.ty.value);
        lowerer.locals.push(param.name.value.clone());
        param_types.push((param.name.value.clone(), ty));
    }
    lowerer.block(&decl.value.body)?;
    // Implicit `return null` for bodies that fall off the end.
    lowerer.emit(Op::PushLit(Literal::Null), None);
    lowerer.emit(Op::Return, None);
    let ret = decl
        .value
        .ret
        .as_ref()
        .map(|t| resolve_type(&t.value))
        .unwrap_or(Type::Void);
    Ok(FunctionCode {
        name,
        params: param_types,
        ret,
        instructions: lowerer.code,
    })
}

fn lower_assertions(
    checked: &CheckedUnit,
    module: &Module,
    block: &Node<ast::AssertionBlock>,
    compiled: &mut CompiledProgram,
) -> AlthreadResult<()> {
    for condition in &block.value.conditions {
        let mut lowerer = BodyLowerer::new(checked, module);
        lowerer.expr(condition)?;
        let kind = match block.value.kind {
            ast::AssertionKind::Always => AssertionKind::Always,
            ast::AssertionKind::Eventually => AssertionKind::Eventually,
        };
        compiled.assertions.push(Assertion {
            kind,
            code: lowerer.code,
            text: render_condition(condition),
            pos: condition.pos.clone(),
        });
    }
    Ok(())
}

/// Compact rendering of an assertion condition for reports.
fn render_condition(expr: &Node<Expr>) -> String {
    fn render(expr: &Expr) -> String {
        match expr {
            Expr::Literal(lit) => lit.to_string(),
            Expr::Local(name) | Expr::Shared(name) => name.clone(),
            Expr::Binary { op, left, right } => {
                let op = match op {
                    ast::BinaryOp::Add => "+",
                    ast::BinaryOp::Sub => "-",
                    ast::BinaryOp::Mul => "*",
                    ast::BinaryOp::Div => "/",
                    ast::BinaryOp::Mod => "%",
                    ast::BinaryOp::Eq => "==",
                    ast::BinaryOp::Ne => "!=",
                    ast::BinaryOp::Lt => "<",
                    ast::BinaryOp::Le => "<=",
                    ast::BinaryOp::Gt => ">",
                    ast::BinaryOp::Ge => ">=",
                    ast::BinaryOp::And => "&&",
                    ast::BinaryOp::Or => "||",
                };
                format!("{} {} {}", render(&left.value), op, render(&right.value))
            }
            Expr::Unary { op, operand } => match op {
                ast::UnaryOp::Neg => format!("-{}", render(&operand.value)),
                ast::UnaryOp::Not => format!("!{}", render(&operand.value)),
            },
            Expr::Call { name, .. } => format!("{}(...)", name),
            Expr::Run { program, .. } => format!("run {}(...)", program),
            Expr::Tuple(_) => "(...)".to_string(),
            Expr::ListLit(_) => "[...]".to_string(),
            Expr::Index { base, .. } => format!("{}[...]", render(&base.value)),
        }
    }
    render(&expr.value)
}

fn resolve_type(ty: &ast::TypeExpr) -> Type {
    match ty {
        ast::TypeExpr::Void => Type::Void,
        ast::TypeExpr::Int => Type::Int,
        ast::TypeExpr::Bool => Type::Bool,
        ast::TypeExpr::String => Type::String,
        ast::TypeExpr::Tuple(items) => {
            Type::Tuple(items.iter().map(|t| resolve_type(&t.value)).collect())
        }
        ast::TypeExpr::List(elem) => Type::List(Box::new(resolve_type(&elem.value))),
        ast::TypeExpr::Proc(name) => Type::Proc(name.clone()),
    }
}

/// Per-loop bookkeeping for break/continue patching.
struct LoopFrame {
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
    /// Continue target when known upfront (`loop`, `while`).
    continue_target: Option<usize>,
    /// Locals depth restored by `break`.
    break_locals: usize,
    /// Locals depth restored by `continue`.
    continue_locals: usize,
}

struct BodyLowerer<'a> {
    symbols: &'a SymbolTable,
    module: &'a Module,
    code: Vec<Instruction>,
    /// Compile-time local slots; index == frame slot.
    locals: Vec<String>,
    loops: Vec<LoopFrame>,
}

impl<'a> BodyLowerer<'a> {
    fn new(checked: &'a CheckedUnit, module: &'a Module) -> Self {
        BodyLowerer {
            symbols: &checked.symbols,
            module,
            code: Vec::new(),
            locals: Vec::new(),
            loops: Vec::new(),
        }
    }

    fn emit(&mut self, op: Op, pos: Option<Pos>) -> usize {
        self.code.push(Instruction { op, pos });
        self.code.len() - 1
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn patch_jump(&mut self, at: usize, target: usize) {
        match &mut self.code[at].op {
            Op::Jump(t)
            | Op::JumpIfFalse(t)
            | Op::BreakLoop { target: t, .. }
            | Op::ContinueLoop { target: t, .. } => *t = target,
            other => panic!("patching a non-jump instruction '{}'", other),
        }
    }

    fn slot_of(&self, name: &str) -> usize {
        self.locals
            .iter()
            .rposition(|n| n == name)
            .expect("the analyzer resolved every local")
    }

    // ------------------------------------------------------------------
    // Statements

    fn block(&mut self, block: &Node<Block>) -> AlthreadResult<()> {
        let mark = self.locals.len();
        for stmt in &block.value.statements {
            self.statement(stmt)?;
        }
        self.exit_scope(mark, Some(block.pos.clone()));
        Ok(())
    }

    fn exit_scope(&mut self, mark: usize, pos: Option<Pos>) {
        let n = self.locals.len() - mark;
        if n > 0 {
            self.emit(Op::Pop(n), pos);
            self.locals.truncate(mark);
        }
    }

    fn statement(&mut self, stmt: &Node<Statement>) -> AlthreadResult<()> {
        let pos = Some(stmt.pos.clone());
        match &stmt.value {
            Statement::Let { name, ty, init } => {
                match init {
                    Some(init) => self.expr(init)?,
                    None => {
                        let ty = resolve_type(&ty.as_ref().expect("checked by the parser").value);
                        self.emit(Op::PushLit(Literal::default_of(&ty)), pos);
                    }
                }
                self.locals.push(name.value.clone());
            }
            Statement::Assign { target, op, value } => {
                let first = target.value.chars().next().unwrap_or('_');
                let shared = first.is_uppercase();
                if *op != AssignOp::Set {
                    if shared {
                        self.emit(Op::LoadShared(target.value.clone()), pos.clone());
                    } else {
                        let slot = self.slot_of(&target.value);
                        self.emit(Op::LoadLocal(slot), pos.clone());
                    }
                }
                self.expr(value)?;
                if let Some(binop) = compound_op(*op) {
                    self.emit(Op::BinOp(binop), pos.clone());
                }
                if shared {
                    self.emit(Op::StoreShared(target.value.clone()), pos);
                } else {
                    let slot = self.slot_of(&target.value);
                    self.emit(Op::StoreLocal(slot), pos);
                }
            }
            Statement::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond)?;
                let to_else = self.emit(Op::JumpIfFalse(0), pos.clone());
                self.block(then_block)?;
                match else_block {
                    Some(else_block) => {
                        let to_end = self.emit(Op::Jump(0), pos);
                        let else_start = self.here();
                        self.patch_jump(to_else, else_start);
                        self.block(else_block)?;
                        let end = self.here();
                        self.patch_jump(to_end, end);
                    }
                    None => {
                        let end = self.here();
                        self.patch_jump(to_else, end);
                    }
                }
            }
            Statement::Loop { body } => {
                let start = self.here();
                self.loops.push(LoopFrame {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                    continue_target: Some(start),
                    break_locals: self.locals.len(),
                    continue_locals: self.locals.len(),
                });
                self.block(body)?;
                self.emit(Op::Jump(start), pos);
                self.finish_loop(self.here());
            }
            Statement::While { cond, body } => {
                let start = self.here();
                self.expr(cond)?;
                let to_end = self.emit(Op::JumpIfFalse(0), pos.clone());
                self.loops.push(LoopFrame {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                    continue_target: Some(start),
                    break_locals: self.locals.len(),
                    continue_locals: self.locals.len(),
                });
                self.block(body)?;
                self.emit(Op::Jump(start), pos);
                let end = self.here();
                self.patch_jump(to_end, end);
                self.finish_loop(end);
            }
            Statement::For {
                var,
                from,
                to,
                body,
            } => {
                let outer_locals = self.locals.len();
                self.expr(from)?;
                self.locals.push(var.value.clone());
                self.expr(to)?;
                // Slot name the surface syntax cannot produce.
                self.locals.push(format!("{}$bound", var.value));
                let var_slot = self.slot_of(&var.value);
                let bound_slot = var_slot + 1;

                let start = self.here();
                self.emit(Op::LoadLocal(var_slot), pos.clone());
                self.emit(Op::LoadLocal(bound_slot), pos.clone());
                self.emit(Op::BinOp(BinOp::Lt), pos.clone());
                let to_exit = self.emit(Op::JumpIfFalse(0), pos.clone());

                self.loops.push(LoopFrame {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                    continue_target: None,
                    break_locals: outer_locals,
                    continue_locals: self.locals.len(),
                });
                self.block(body)?;

                // Continue lands on the increment.
                let increment = self.here();
                self.emit(Op::LoadLocal(var_slot), pos.clone());
                self.emit(Op::PushLit(Literal::Int(1)), pos.clone());
                self.emit(Op::BinOp(BinOp::Add), pos.clone());
                self.emit(Op::StoreLocal(var_slot), pos.clone());
                self.emit(Op::Jump(start), pos.clone());

                let exit = self.here();
                self.patch_jump(to_exit, exit);
                self.emit(Op::Pop(2), pos);
                self.locals.truncate(outer_locals);

                let frame = self.loops.pop().expect("pushed above");
                let done = self.here();
                for at in frame.break_patches {
                    self.patch_jump(at, done);
                }
                for at in frame.continue_patches {
                    self.patch_jump(at, increment);
                }
            }
            Statement::Break => {
                let break_locals = self
                    .loops
                    .last()
                    .expect("the analyzer checked loop nesting")
                    .break_locals;
                let pops = self.locals.len() - break_locals;
                let at = self.emit(Op::BreakLoop { target: 0, pops }, pos);
                self.loops
                    .last_mut()
                    .expect("still inside the loop")
                    .break_patches
                    .push(at);
            }
            Statement::Continue => {
                let frame = self.loops.last().expect("the analyzer checked loop nesting");
                let continue_target = frame.continue_target;
                let pops = self.locals.len() - frame.continue_locals;
                match continue_target {
                    Some(target) => {
                        self.emit(Op::ContinueLoop { target, pops }, pos);
                    }
                    None => {
                        let at = self.emit(Op::ContinueLoop { target: 0, pops }, pos);
                        self.loops
                            .last_mut()
                            .expect("still inside the loop")
                            .continue_patches
                            .push(at);
                    }
                }
            }
            Statement::Return(value) => {
                match value {
                    Some(value) => self.expr(value)?,
                    None => {
                        self.emit(Op::PushLit(Literal::Null), pos.clone());
                    }
                }
                self.emit(Op::Return, pos);
            }
            Statement::Print(args) => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.emit(Op::Print { args: args.len() }, pos);
            }
            Statement::Expr(expr) => {
                self.expr(expr)?;
                self.emit(Op::Pop(1), pos);
            }
            Statement::Send { port, args } => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.emit(
                    Op::Send {
                        port: port.value.clone(),
                        args: args.len(),
                    },
                    pos,
                );
            }
            Statement::Receive { port, binds, body } => {
                // The guard probes, binds and commits in one atomic region;
                // a blocked probe aborts the whole attempt.
                let guard = self.here();
                self.emit(Op::AtomicBegin, pos.clone());
                self.emit(
                    Op::TryReceive {
                        port: port.value.clone(),
                        binds: binds.len(),
                    },
                    pos.clone(),
                );
                self.emit(Op::WaitCond { restart: guard }, pos.clone());
                self.emit(Op::AtomicEnd, pos.clone());
                let mark = self.locals.len();
                for bind in binds {
                    self.locals.push(bind.value.clone());
                }
                self.block(body)?;
                self.exit_scope(mark, pos);
            }
            Statement::Wait(cond) => {
                let guard = self.here();
                self.emit(Op::AtomicBegin, pos.clone());
                self.expr(cond)?;
                self.emit(Op::WaitCond { restart: guard }, pos.clone());
                self.emit(Op::AtomicEnd, pos);
            }
            Statement::Atomic(body) => {
                self.emit(Op::AtomicBegin, pos.clone());
                self.block(body)?;
                self.emit(Op::AtomicEnd, pos);
            }
            Statement::ChannelDecl {
                sender,
                sender_port,
                types,
                receiver,
                receiver_port,
            } => {
                self.endpoint(sender, &pos)?;
                self.endpoint(receiver, &pos)?;
                self.emit(
                    Op::DeclareChannel {
                        sender_port: sender_port.value.clone(),
                        types: types.iter().map(|t| resolve_type(&t.value)).collect(),
                        receiver_port: receiver_port.value.clone(),
                    },
                    pos,
                );
            }
        }
        Ok(())
    }

    fn finish_loop(&mut self, end: usize) {
        let frame = self.loops.pop().expect("finish_loop without a frame");
        for at in frame.break_patches {
            self.patch_jump(at, end);
        }
        for at in frame.continue_patches {
            let target = frame.continue_target.expect("patched loops know their start");
            self.patch_jump(at, target);
        }
    }

    fn endpoint(&mut self, endpoint: &Node<Endpoint>, pos: &Option<Pos>) -> AlthreadResult<()> {
        match &endpoint.value {
            Endpoint::Current => {
                self.emit(Op::PushSelf, pos.clone());
            }
            Endpoint::Var(name) => {
                let slot = self.slot_of(name);
                self.emit(Op::LoadLocal(slot), pos.clone());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions

    fn expr(&mut self, expr: &Node<Expr>) -> AlthreadResult<()> {
        let pos = Some(expr.pos.clone());
        match &expr.value {
            Expr::Literal(lit) => {
                self.emit(Op::PushLit(lit.clone()), pos);
            }
            Expr::Local(name) => {
                let slot = self.slot_of(name);
                self.emit(Op::LoadLocal(slot), pos);
            }
            Expr::Shared(name) => {
                self.emit(Op::LoadShared(name.clone()), pos);
            }
            Expr::Binary { op, left, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.emit(Op::BinOp(binary_op(*op)), pos);
            }
            Expr::Unary { op, operand } => {
                self.expr(operand)?;
                let op = match op {
                    ast::UnaryOp::Neg => UnOp::Neg,
                    ast::UnaryOp::Not => UnOp::Not,
                };
                self.emit(Op::UnOp(op), pos);
            }
            Expr::Call { alias, name, args } => {
                for arg in args {
                    self.expr(arg)?;
                }
                if alias.is_none() && name == "len" {
                    self.emit(Op::UnOp(UnOp::Len), pos);
                } else {
                    let function = self.resolve_function(alias.as_deref(), name);
                    self.emit(
                        Op::Call {
                            function,
                            args: args.len(),
                        },
                        pos,
                    );
                }
            }
            Expr::Run { program, args, .. } => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.emit(Op::RunProgram(program.clone()), pos);
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.emit(Op::MakeTuple(items.len()), pos);
            }
            Expr::ListLit(items) => {
                for item in items {
                    self.expr(item)?;
                }
                self.emit(Op::MakeList(items.len()), pos);
            }
            Expr::Index { base, index } => {
                self.expr(base)?;
                self.expr(index)?;
                self.emit(Op::Index, pos);
            }
        }
        Ok(())
    }

    /// Function resolution mirrors the analyzer's scoping; failures here are
    /// lowering bugs since the analyzer already validated every call.
    fn resolve_function(&self, alias: Option<&str>, name: &str) -> usize {
        match alias {
            Some(alias) => {
                let target = self
                    .module
                    .imports
                    .iter()
                    .find(|i| i.alias.as_deref() == Some(alias))
                    .map(|i| i.path.clone())
                    .expect("the analyzer validated every alias");
                self.symbols
                    .function_id(&target, name)
                    .expect("the analyzer validated every aliased call")
            }
            None => {
                if let Some(id) = self.symbols.function_id(&self.module.path, name) {
                    return id;
                }
                self.module
                    .imports
                    .iter()
                    .filter(|i| i.alias.is_none())
                    .find_map(|i| {
                        self.symbols
                            .function_id(&i.path, name)
                            .filter(|&id| !self.symbols.function(id).private)
                    })
                    .expect("the analyzer validated every call")
            }
        }
    }
}

fn binary_op(op: ast::BinaryOp) -> BinOp {
    match op {
        ast::BinaryOp::Add => BinOp::Add,
        ast::BinaryOp::Sub => BinOp::Sub,
        ast::BinaryOp::Mul => BinOp::Mul,
        ast::BinaryOp::Div => BinOp::Div,
        ast::BinaryOp::Mod => BinOp::Mod,
        ast::BinaryOp::Eq => BinOp::Eq,
        ast::BinaryOp::Ne => BinOp::Ne,
        ast::BinaryOp::Lt => BinOp::Lt,
        ast::BinaryOp::Le => BinOp::Le,
        ast::BinaryOp::Gt => BinOp::Gt,
        ast::BinaryOp::Ge => BinOp::Ge,
        ast::BinaryOp::And => BinOp::And,
        ast::BinaryOp::Or => BinOp::Or,
    }
}

fn compound_op(op: AssignOp) -> Option<BinOp> {
    match op {
        AssignOp::Set => None,
        AssignOp::Add => Some(BinOp::Add),
        AssignOp::Sub => Some(BinOp::Sub),
        AssignOp::Mul => Some(BinOp::Mul),
        AssignOp::Div => Some(BinOp::Div),
        AssignOp::Mod => Some(BinOp::Mod),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::linker::{link, VirtualFs};
    use crate::semantics::analyze;

    fn compile_src(src: &str) -> CompiledProgram {
        let unit = link("main.alt", src, &VirtualFs::new()).unwrap();
        let checked = analyze(unit).unwrap();
        lower(&checked).unwrap()
    }

    #[test]
    fn test_hello_world_lowering() {
        let compiled = compile_src(r#"main { print("hi"); }"#);
        let main = compiled.main();
        assert!(matches!(main.instructions[0].op, Op::PushLit(_)));
        assert!(matches!(main.instructions[1].op, Op::Print { args: 1 }));
        assert!(matches!(
            main.instructions.last().unwrap().op,
            Op::Halt
        ));
    }

    #[test]
    fn test_shared_init_evaluated() {
        let compiled = compile_src(
            "shared { let A: int = 2; let B: int = A * 3; }\nmain { }",
        );
        assert_eq!(
            compiled.shared_init,
            vec![
                ("A".to_string(), Literal::Int(2)),
                ("B".to_string(), Literal::Int(6)),
            ]
        );
    }

    #[test]
    fn test_wait_guard_shape() {
        let compiled = compile_src(
            "shared { let C: int = 0; }\nmain { wait until C == 2; }",
        );
        let ops: Vec<&Op> = compiled.main().instructions.iter().map(|i| &i.op).collect();
        assert!(matches!(ops[0], Op::AtomicBegin));
        assert!(matches!(ops[1], Op::LoadShared(_)));
        let wait_at = ops
            .iter()
            .position(|op| matches!(op, Op::WaitCond { .. }))
            .unwrap();
        assert!(matches!(ops[wait_at + 1], Op::AtomicEnd));
        if let Op::WaitCond { restart } = ops[wait_at] {
            assert_eq!(*restart, 0);
        }
    }

    #[test]
    fn test_receive_guard_shape() {
        let compiled = compile_src(
            "program Consumer() { await receive inp(x) => { print(x); } }\n\
             program Producer() { send out(1); }\n\
             main {\n\
                 let p = run Producer();\n\
                 let c = run Consumer();\n\
                 channel p.out (int) > c.inp;\n\
             }",
        );
        let consumer = compiled.program("Consumer").unwrap();
        let ops: Vec<&Op> = consumer.instructions.iter().map(|i| &i.op).collect();
        assert!(matches!(ops[0], Op::AtomicBegin));
        assert!(matches!(ops[1], Op::TryReceive { binds: 1, .. }));
        assert!(matches!(ops[2], Op::WaitCond { restart: 0 }));
        assert!(matches!(ops[3], Op::AtomicEnd));
        // The bind is popped at the end of the statement.
        assert!(ops.iter().any(|op| matches!(op, Op::Pop(1))));
    }

    #[test]
    fn test_loop_break_pops_locals() {
        let compiled = compile_src(
            "main { loop { let x = 1; break; } }",
        );
        let main = compiled.main();
        let break_instr = main
            .instructions
            .iter()
            .find(|i| matches!(i.op, Op::BreakLoop { .. }))
            .unwrap();
        if let Op::BreakLoop { pops, target } = break_instr.op {
            assert_eq!(pops, 1);
            assert!(target <= main.instructions.len());
        }
    }

    #[test]
    fn test_for_loop_shape() {
        let compiled = compile_src("main { for i in 0..3 { print(i); } }");
        let ops: Vec<&Op> = compiled.main().instructions.iter().map(|i| &i.op).collect();
        // Bounds pushed, then the comparison header.
        assert!(matches!(ops[0], Op::PushLit(Literal::Int(0))));
        assert!(matches!(ops[1], Op::PushLit(Literal::Int(3))));
        assert!(ops.iter().any(|op| matches!(op, Op::BinOp(BinOp::Lt))));
        // The two loop slots are dropped on exit.
        assert!(ops.iter().any(|op| matches!(op, Op::Pop(2))));
    }

    #[test]
    fn test_atomic_brackets() {
        let compiled = compile_src(
            "shared { let X: int = 0; }\nmain { atomic { X = X + 1; } }",
        );
        let ops: Vec<&Op> = compiled.main().instructions.iter().map(|i| &i.op).collect();
        assert!(matches!(ops[0], Op::AtomicBegin));
        assert!(matches!(ops[ops.len() - 2], Op::AtomicEnd));
    }

    #[test]
    fn test_function_call_ids() {
        let compiled = compile_src(
            "fn double(x: int) -> int { return x * 2; }\n\
             main { let y = double(4); print(y); }",
        );
        assert_eq!(compiled.functions.len(), 1);
        let main = compiled.main();
        assert!(main
            .instructions
            .iter()
            .any(|i| matches!(i.op, Op::Call { function: 0, args: 1 })));
    }

    #[test]
    fn test_assertion_lowered_pure() {
        let compiled = compile_src(
            "shared { let C: int = 0; }\nmain { }\nalways { C <= 2; }",
        );
        assert_eq!(compiled.assertions.len(), 1);
        let assertion = &compiled.assertions[0];
        assert_eq!(assertion.text, "C <= 2");
        let holds = assertion
            .evaluate(&|name| (name == "C").then(|| Literal::Int(3)))
            .unwrap();
        assert!(!holds);
    }
}
