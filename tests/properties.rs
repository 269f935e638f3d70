//! Required properties of the pipeline, beyond the end-to-end scenarios.

use althread::bytecode::verifier;
use althread::checker::{canonical_hash, ModelChecker};
use althread::frontend::ast::{Block, Expr, Node, Statement};
use althread::frontend::parse;
use althread::vm::{Channel, ChannelId, GlobalState, Process};
use althread::{check, compile, CheckConfig, ErrorKind, Literal, Pid, Type, VirtualFs};
use proptest::prelude::*;

fn compile_ok(src: &str) -> althread::CompiledProgram {
    compile(src, "main.alt", &VirtualFs::new()).expect("compile failed")
}

// ---------------------------------------------------------------------
// Property 1: every AST node's span lies within its parent's span.

fn assert_block_spans(block: &Node<Block>) {
    for stmt in &block.value.statements {
        assert!(
            stmt.pos.within(&block.pos),
            "statement span escapes its block"
        );
        assert_stmt_spans(stmt);
    }
}

fn assert_stmt_spans(stmt: &Node<Statement>) {
    match &stmt.value {
        Statement::Let { init: Some(e), .. }
        | Statement::Assign { value: e, .. }
        | Statement::Wait(e) => assert_expr_spans(e, &stmt.pos),
        Statement::If {
            cond,
            then_block,
            else_block,
        } => {
            assert_expr_spans(cond, &stmt.pos);
            assert!(then_block.pos.within(&stmt.pos));
            assert_block_spans(then_block);
            if let Some(else_block) = else_block {
                assert!(else_block.pos.within(&stmt.pos));
                assert_block_spans(else_block);
            }
        }
        Statement::Loop { body } | Statement::Atomic(body) => {
            assert!(body.pos.within(&stmt.pos));
            assert_block_spans(body);
        }
        Statement::While { cond, body } => {
            assert_expr_spans(cond, &stmt.pos);
            assert_block_spans(body);
        }
        Statement::For { from, to, body, .. } => {
            assert_expr_spans(from, &stmt.pos);
            assert_expr_spans(to, &stmt.pos);
            assert_block_spans(body);
        }
        Statement::Receive { body, .. } => assert_block_spans(body),
        Statement::Print(args) | Statement::Send { args, .. } => {
            for arg in args {
                assert_expr_spans(arg, &stmt.pos);
            }
        }
        Statement::Expr(e) | Statement::Return(Some(e)) => assert_expr_spans(e, &stmt.pos),
        _ => {}
    }
}

fn assert_expr_spans(expr: &Node<Expr>, parent: &althread::Pos) {
    assert!(expr.pos.within(parent), "expression span escapes its parent");
    match &expr.value {
        Expr::Binary { left, right, .. } => {
            assert_expr_spans(left, &expr.pos);
            assert_expr_spans(right, &expr.pos);
        }
        Expr::Unary { operand, .. } => assert_expr_spans(operand, &expr.pos),
        Expr::Call { args, .. } | Expr::Run { args, .. } => {
            for arg in args {
                assert_expr_spans(arg, &expr.pos);
            }
        }
        Expr::Tuple(items) | Expr::ListLit(items) => {
            for item in items {
                assert_expr_spans(item, &expr.pos);
            }
        }
        Expr::Index { base, index } => {
            assert_expr_spans(base, &expr.pos);
            assert_expr_spans(index, &expr.pos);
        }
        _ => {}
    }
}

#[test]
fn spans_nest_within_parents() {
    let ast = parse(
        "main.alt",
        "shared { let C: int = 0; }\n\
         program P(n: int) {\n\
             for i in 0..n {\n\
                 if i % 2 == 0 { C = C + i * (1 + 2); } else { continue; }\n\
             }\n\
             wait until C > 3 && !(C == 5);\n\
         }\n\
         main { let p = run P(4); print(len([1, 2]), (1, true)); }",
    )
    .expect("parse failed");
    for program in &ast.programs {
        assert!(program.value.body.pos.within(&program.pos));
        assert_block_spans(&program.value.body);
    }
    if let Some(main) = &ast.main {
        assert_block_spans(main);
    }
}

// ---------------------------------------------------------------------
// Property 2: uppercase/lowercase name rule.

#[test]
fn shared_scope_requires_uppercase() {
    let err = parse("main.alt", "shared { let counter: int = 0; }").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Name);
}

#[test]
fn local_scope_requires_lowercase() {
    let err = parse("main.alt", "main { let Counter = 0; }").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Name);
}

// ---------------------------------------------------------------------
// Property 3: lowering leaves the stack balanced on every path.

#[test]
fn lowering_is_stack_balanced() {
    let compiled = compile_ok(
        "shared { let Total: int = 0; let Go: bool = false; }\n\
         fn square(x: int) -> int { return x * x; }\n\
         program Worker(n: int) {\n\
             wait until Go;\n\
             for i in 0..n {\n\
                 if i == 2 { continue; }\n\
                 atomic { Total = Total + square(i); }\n\
             }\n\
             send out(n, true);\n\
         }\n\
         program Sink() {\n\
             await receive inp(v, done) => { print(v, done); }\n\
         }\n\
         main {\n\
             let w = run Worker(4);\n\
             let s = run Sink();\n\
             channel w.out (int, bool) > s.inp;\n\
             Go = true;\n\
         }\n\
         always { Total >= 0; }",
    );
    verifier::verify(&compiled).expect("stack discipline broken");
}

// ---------------------------------------------------------------------
// Property 4: determinism of check.

#[test]
fn check_is_deterministic() {
    let src = "shared { let X: int = 0; }\n\
               program P() { let t = X; X = t + 1; }\n\
               main { run P(); run P(); wait until true; }\n\
               always { X == 2; }";
    let a = check(src, "main.alt", &VirtualFs::new(), None).unwrap();
    let b = check(src, "main.alt", &VirtualFs::new(), None).unwrap();

    assert_eq!(a.graph.len(), b.graph.len());
    for ((sa, ma), (sb, mb)) in a.graph.nodes.iter().zip(&b.graph.nodes) {
        assert_eq!(sa, sb);
        assert_eq!(ma, mb);
    }
    assert_eq!(a.violations.first(), b.violations.first());
}

// ---------------------------------------------------------------------
// Property 5: canonical-state stability.

fn fresh_state() -> GlobalState {
    let program = compile_ok("shared { let A: int = 0; }\nmain { A = 1; }");
    GlobalState::initial(&program)
}

#[test]
fn canonical_hash_ignores_channel_interleaving_across_channels() {
    let mut a = fresh_state();
    let mut b = fresh_state();
    let ch1 = ChannelId {
        pid: Pid(1),
        port: "out".into(),
    };
    let ch2 = ChannelId {
        pid: Pid(2),
        port: "out".into(),
    };
    for state in [&mut a, &mut b] {
        state
            .channels
            .insert(ch1.clone(), Channel::new(vec![Type::Int], (Pid(0), "x".into())));
        state
            .channels
            .insert(ch2.clone(), Channel::new(vec![Type::Int], (Pid(0), "y".into())));
    }
    // Enqueue on the two channels in opposite interleavings.
    a.channels.get_mut(&ch1).unwrap().queue.push_back(Literal::Int(1));
    a.channels.get_mut(&ch2).unwrap().queue.push_back(Literal::Int(2));
    b.channels.get_mut(&ch2).unwrap().queue.push_back(Literal::Int(2));
    b.channels.get_mut(&ch1).unwrap().queue.push_back(Literal::Int(1));
    assert_eq!(canonical_hash(&a), canonical_hash(&b));
}

#[test]
fn canonical_hash_ignores_process_clock_and_status() {
    let mut a = fresh_state();
    let b = a.clone();
    a.process_mut(Pid(0)).clock = 99;
    a.epoch = 7;
    assert_eq!(canonical_hash(&a), canonical_hash(&b));
}

proptest! {
    // Shared maps hash identically whatever the insertion order was.
    #[test]
    fn canonical_hash_is_insertion_order_insensitive(
        values in proptest::collection::vec((0usize..8, -100i64..100), 1..16),
        permutation_seed in 0usize..1000,
    ) {
        let names = ["A", "B", "C", "D", "E", "F", "G", "H"];
        let mut a = fresh_state();
        let mut b = fresh_state();
        for (index, value) in &values {
            a.shared.insert(names[*index].to_string(), Literal::Int(*value));
        }
        // Apply the same writes rotated by an arbitrary offset; the last
        // write per name must win in both, so only use distinct names.
        let mut rotated = values.clone();
        let mid = permutation_seed % rotated.len();
        rotated.rotate_left(mid);
        let mut last_wins = std::collections::HashMap::new();
        for (index, value) in &values {
            last_wins.insert(*index, *value);
        }
        for (index, _) in &rotated {
            b.shared.insert(names[*index].to_string(), Literal::Int(last_wins[index]));
        }
        prop_assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    // Two encodings of the same state always agree.
    #[test]
    fn canonical_hash_is_stable(extra in -1000i64..1000) {
        let mut state = fresh_state();
        state.shared.insert("A".into(), Literal::Int(extra));
        state.processes.push_back(Process::new(Pid(1), "P", vec![Literal::Int(extra)]));
        state.next_pid = 2;
        let twin = state.clone();
        prop_assert_eq!(canonical_hash(&state), canonical_hash(&twin));
    }
}

// ---------------------------------------------------------------------
// Property 6: atomicity - no graph node exposes the inside of an atomic.

#[test]
fn atomic_blocks_have_no_intermediate_nodes() {
    let src = "shared { let X: int = 0; }\n\
               program P() { atomic { X = X + 1; X = X + 1; } }\n\
               main { run P(); run P(); }";
    let result = check(src, "main.alt", &VirtualFs::new(), None).unwrap();
    assert!(result.violations.is_empty());
    for (snapshot, _) in &result.graph.nodes {
        let x = snapshot.globals.get("X").and_then(Literal::as_int).unwrap();
        assert!(x % 2 == 0, "odd X means a state inside an atomic leaked");
    }
}

// ---------------------------------------------------------------------
// Property 8: deadlock detection (run side covered in scenarios).

#[test]
fn all_waiting_processes_mean_one_terminal_node() {
    let src = "shared { let F: bool = false; }\n\
               program P() { wait until F; }\n\
               main { run P(); wait until F; }";
    let program = compile_ok(src);
    let result = ModelChecker::new(&program, CheckConfig::default()).check();
    let terminals = result.graph.terminal_nodes();
    assert_eq!(terminals.len(), 1);
}
