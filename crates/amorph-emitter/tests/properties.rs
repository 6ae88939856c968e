//! Property tests over generated programs: determinism, stack and
//! environment balance, pop placement, location contiguity, global
//! density, smallest-fits encodings, and the branch-offset law.

use amorph_emitter::{disasm, EmitterOptions, KernelEmitter, OpTable, StackDelta};
use amorph_ir::{AmId, Dfg, FieldId, OpId, Operator, ProtoType, Signature};
use proptest::prelude::*;
use rstest::rstest;

// ----------------------------------------------------------------------
// Generators
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Lit(f32),
    Bin(&'static str, Box<Expr>, Box<Expr>),
    Sqrt(Box<Expr>),
    /// `(* e e)` through one shared field, forcing a let binding.
    Square(Box<Expr>),
    /// `(if c t f)` with self-contained arms.
    Branch(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `(if c (sqrt x) 7)` where `x` is computed outside the arms and
    /// read by reference from inside the true arm.
    BranchRef(Box<Expr>, Box<Expr>),
}

fn expr_strategy() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (0u32..400u32).prop_map(|v| Expr::Lit(v as f32)),
        (-100.0f32..100.0f32).prop_map(Expr::Lit),
    ];
    leaf.prop_recursive(3, 32, 3, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Expr::Bin("+", Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Expr::Bin("-", Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Expr::Bin("*", Box::new(a), Box::new(b))),
            inner.clone().prop_map(|a| Expr::Sqrt(Box::new(a))),
            inner.clone().prop_map(|a| Expr::Square(Box::new(a))),
            (inner.clone(), inner.clone(), inner.clone())
                .prop_map(|(c, t, f)| Expr::Branch(Box::new(c), Box::new(t), Box::new(f))),
            (inner.clone(), inner)
                .prop_map(|(x, c)| Expr::BranchRef(Box::new(x), Box::new(c))),
        ]
    })
}

fn body_of(g: &Dfg, op: OpId) -> AmId {
    match g.op(op) {
        Operator::Compound(c) => c.body,
        _ => unreachable!("arm operators are compounds"),
    }
}

fn build_expr(g: &mut Dfg, am: AmId, e: &Expr) -> FieldId {
    match e {
        Expr::Lit(v) => g.scalar(am, *v),
        Expr::Bin(name, a, b) => {
            let fa = build_expr(g, am, a);
            let fb = build_expr(g, am, b);
            let op = g.primitive(name, Signature::variadic(2, ProtoType::scalar()));
            g.apply(am, op, vec![fa, fb], ProtoType::scalar())
        }
        Expr::Sqrt(a) => {
            let fa = build_expr(g, am, a);
            let op = g.primitive("sqrt", Signature::fixed(1, ProtoType::scalar()));
            g.apply(am, op, vec![fa], ProtoType::scalar())
        }
        Expr::Square(a) => {
            let fa = build_expr(g, am, a);
            let op = g.primitive("*", Signature::variadic(2, ProtoType::scalar()));
            g.apply(am, op, vec![fa, fa], ProtoType::scalar())
        }
        Expr::Branch(c, t, f) => {
            let cond = build_expr(g, am, c);
            let t_op = g.add_compound("t-arm", Signature::fixed(0, ProtoType::scalar()));
            let t_body = body_of(g, t_op);
            build_expr(g, t_body, t);
            let f_op = g.add_compound("f-arm", Signature::fixed(0, ProtoType::scalar()));
            let f_body = body_of(g, f_op);
            build_expr(g, f_body, f);
            g.branch(am, cond, t_op, f_op, ProtoType::scalar())
        }
        Expr::BranchRef(x, c) => {
            let shared = build_expr(g, am, x);
            let cond = build_expr(g, am, c);
            let t_op = g.add_compound("t-arm", Signature::fixed(0, ProtoType::scalar()));
            let t_body = body_of(g, t_op);
            let rx = g.reference(t_body, shared, ProtoType::scalar());
            let sqrt = g.primitive("sqrt", Signature::fixed(1, ProtoType::scalar()));
            g.apply(t_body, sqrt, vec![rx], ProtoType::scalar());
            let f_op = g.add_compound("f-arm", Signature::fixed(0, ProtoType::scalar()));
            let f_body = body_of(g, f_op);
            g.scalar(f_body, 7.0);
            g.branch(am, cond, t_op, f_op, ProtoType::scalar())
        }
    }
}

fn emit_expr(e: &Expr, paranoid: bool) -> Vec<u8> {
    let mut g = Dfg::new();
    let main = g.main();
    let out = build_expr(&mut g, main, e);
    g.output = Some(out);
    let options = EmitterOptions {
        paranoid,
        ..EmitterOptions::default()
    };
    let mut emitter = KernelEmitter::new(options).unwrap();
    emitter.emit_from(&mut g).unwrap()
}

/// Decoded instruction boundaries: (offset, name, operand bytes).
fn decode(buf: &[u8]) -> Vec<(usize, String, Vec<u8>)> {
    let emitter = KernelEmitter::new(EmitterOptions::default()).unwrap();
    let text = disasm::disassemble(buf, emitter.table(), emitter.core_ops());
    let mut out = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let offset: usize = parts.next().unwrap().parse().unwrap();
        let name = parts.next().unwrap().to_string();
        let operands: Vec<u8> = parts.filter_map(|p| p.parse().ok()).collect();
        out.push((offset, name, operands));
    }
    out
}

// ----------------------------------------------------------------------
// Stream replay
// ----------------------------------------------------------------------

/// `k` from a short-immediate family member name like `REF_2_OP`;
/// `None` for the wide form (`REF_OP`).
fn suffix_k(name: &str, stem: &str) -> Option<usize> {
    name.strip_prefix(stem)?
        .strip_prefix('_')?
        .strip_suffix("_OP")?
        .parse()
        .ok()
}

/// Binding count of a `LET`/`POP_LET` family instruction, short or wide.
fn arity_of(name: &str, operands: &[u8], stem: &str) -> Option<usize> {
    if let Some(k) = suffix_k(name, stem) {
        return Some(k);
    }
    if name == format!("{}_OP", stem) {
        return Some(operands[0] as usize);
    }
    None
}

/// Environment depth read by a `REF` family instruction.
fn depth_of(name: &str, operands: &[u8]) -> Option<usize> {
    if let Some(k) = suffix_k(name, "REF") {
        return Some(k);
    }
    if name == "REF_OP" {
        return Some(operands[0] as usize);
    }
    None
}

/// Stack effect of one decoded instruction; variable-delta ops derive it
/// from their operands.
fn stack_delta_at(
    buf: &[u8],
    table: &OpTable,
    offset: usize,
    name: &str,
    operands: &[u8],
) -> i32 {
    match table.stack_delta(buf[offset]) {
        StackDelta::Fixed(d) => d,
        StackDelta::Variable => match name {
            "DEF_TUP_OP" => -(operands[0] as i32),
            "TUP_OP" => 1 - operands[1] as i32,
            "ALL_OP" => 1 - operands[0] as i32,
            "LET_OP" => -(operands[0] as i32),
            _ => match suffix_k(name, "FUNCALL") {
                Some(k) => -(k as i32),
                None => 0,
            },
        },
    }
}

#[derive(Default)]
struct Binding {
    reads: Vec<usize>,
    pop: Option<usize>,
}

/// Replay the environment effects of a decoded stream: push on `LET`,
/// record reads on environment references, pop on `POP_LET`. Returns the
/// bindings and the peak environment depth. Valid for programs without
/// function calls, where every environment reference names a let binding.
fn simulate_env(decoded: &[(usize, String, Vec<u8>)]) -> (Vec<Binding>, usize) {
    let mut bindings: Vec<Binding> = Vec::new();
    let mut env: Vec<usize> = Vec::new();
    let mut max_depth = 0;
    for (offset, name, operands) in decoded {
        if let Some(k) = arity_of(name, operands, "LET") {
            for _ in 0..k {
                env.push(bindings.len());
                bindings.push(Binding::default());
            }
            max_depth = max_depth.max(env.len());
        } else if let Some(k) = arity_of(name, operands, "POP_LET") {
            for _ in 0..k {
                let binding = env.pop().expect("pop below an empty environment");
                bindings[binding].pop = Some(*offset);
            }
        } else if let Some(depth) = depth_of(name, operands) {
            let index = env
                .len()
                .checked_sub(1 + depth)
                .expect("reference reaches below the environment");
            bindings[env[index]].reads.push(*offset);
        }
        if name == "RET_OP" || name == "EXIT_OP" {
            assert!(env.is_empty(), "unpopped bindings at {}", name);
        }
    }
    assert!(env.is_empty(), "unpopped bindings at end of stream");
    (bindings, max_depth)
}

// ----------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------

proptest! {
    /// Two independent emit runs over the same program are byte-identical.
    #[test]
    fn emission_is_deterministic(e in expr_strategy()) {
        let first = emit_expr(&e, false);
        let second = emit_expr(&e, false);
        prop_assert_eq!(first, second);
    }

    /// Every instruction starts exactly where its predecessor ends (the
    /// paranoid pass inside the emitter enforces this), the stream is
    /// framed correctly, and it decodes without unknown opcodes.
    #[test]
    fn locations_are_contiguous_and_framed(e in expr_strategy()) {
        let buf = emit_expr(&e, true);
        let decoded = decode(&buf);
        prop_assert_eq!(decoded[0].1.as_str(), "DEF_VM_OP");
        prop_assert_eq!(decoded[decoded.len() - 1].1.as_str(), "EXIT_OP");
        prop_assert!(decoded.iter().all(|(_, name, _)| !name.starts_with("<invalid")));
    }

    /// Folding stack deltas across the decoded stream never goes
    /// negative, lands at exactly zero on the trailing EXIT, and peaks at
    /// the height the header reserves.
    #[test]
    fn stack_balances_through_the_stream(e in expr_strategy()) {
        let buf = emit_expr(&e, false);
        let emitter = KernelEmitter::new(EmitterOptions::default()).unwrap();
        let decoded = decode(&buf);
        let mut height = 0i32;
        let mut peak = 0i32;
        for (offset, name, operands) in &decoded {
            height += stack_delta_at(&buf, emitter.table(), *offset, name, operands);
            prop_assert!(height >= 0, "stack underflow after {} at {}", name, offset);
            peak = peak.max(height);
        }
        prop_assert_eq!(decoded.last().unwrap().1.as_str(), "EXIT_OP");
        prop_assert_eq!(height, 0, "stack must drain exactly at EXIT");
        let reserved = u16::from_le_bytes([buf[6], buf[7]]) as i32;
        prop_assert_eq!(reserved, peak + 1);
    }

    /// Every let binding is popped exactly once, no reference reaches
    /// below the live environment, the environment drains at every
    /// function return, and each binding's pop sits after its last read
    /// in the stream (branch-end pops included).
    #[test]
    fn lets_balance_and_pop_after_last_use(e in expr_strategy()) {
        let buf = emit_expr(&e, false);
        let decoded = decode(&buf);
        let (bindings, max_depth) = simulate_env(&decoded);
        for binding in &bindings {
            let pop = binding.pop.expect("binding never popped");
            for &read in &binding.reads {
                prop_assert!(pop > read, "pop at {} precedes a read at {}", pop, read);
            }
        }
        // The header's environment maximum matches the replay.
        prop_assert_eq!(buf[8] as usize, max_depth);
    }

    /// Smallest-fits literal encoding: the family chosen for an integer
    /// value is the narrowest one whose range contains it.
    #[test]
    fn literal_encodings_are_smallest_fits(v in 0u32..70000u32) {
        let mut g = Dfg::new();
        let main = g.main();
        let f = g.scalar(main, v as f32);
        g.output = Some(f);
        let mut emitter = KernelEmitter::new(EmitterOptions::default()).unwrap();
        let buf = emitter.emit_from(&mut g).unwrap();
        let names = disasm::opcode_names(&buf, emitter.table(), emitter.core_ops());
        let lit = &names[2];
        let expected = if v < 5 {
            format!("LIT_{}_OP", v)
        } else if v < 0x80 {
            "LIT8_OP".to_string()
        } else if v <= 0x8000 {
            "LIT16_OP".to_string()
        } else {
            // Beyond the 16-bit literal range the value is emitted as a
            // float (the value may round; 70000 is within f32 integer
            // precision).
            "LIT_FLO_OP".to_string()
        };
        prop_assert_eq!(lit, &expected);
    }
}

/// Global indices are dense and in chain order: the header count equals
/// the number of global-defining instructions, and the first global
/// reference in the body is index 0.
proptest! {
    #[test]
    fn globals_are_dense(k in 1usize..6) {
        let mut g = Dfg::new();
        let main = g.main();
        let elems: Vec<ProtoType> = (0..k).map(|i| ProtoType::literal(i as f32)).collect();
        let t = g.literal(main, ProtoType::tuple(elems));
        g.output = Some(t);
        let mut emitter = KernelEmitter::new(EmitterOptions::default()).unwrap();
        let buf = emitter.emit_from(&mut g).unwrap();
        let names = disasm::opcode_names(&buf, emitter.table(), emitter.core_ops());
        let defined = names
            .iter()
            .filter(|n| {
                n.starts_with("DEF_FUN") || n.starts_with("DEF_TUP") || n.starts_with("DEF_NUM_VEC")
            })
            .count();
        let n_globals = u16::from_le_bytes([buf[3], buf[4]]) as usize;
        prop_assert_eq!(defined, n_globals);
        prop_assert!(names.contains(&"GLO_REF_0_OP".to_string()));
    }
}

// ----------------------------------------------------------------------
// Branch-offset law
// ----------------------------------------------------------------------

/// Build `(if 0 <t> <f>)` where each arm is a chain of `n` square roots
/// over a literal, then check every branch's encoded distance lands on an
/// instruction boundary just past its target.
#[rstest]
#[case(1, 1)]
#[case(1, 5)]
#[case(5, 1)]
#[case(40, 40)]
#[case(300, 20)]
#[case(20, 300)]
fn branch_offsets_land_on_boundaries(#[case] t_n: usize, #[case] f_n: usize) {
    fn sqrt_chain(g: &mut Dfg, am: AmId, n: usize) -> FieldId {
        let mut f = g.scalar(am, 9.0);
        for _ in 0..n {
            let op = g.primitive("sqrt", Signature::fixed(1, ProtoType::scalar()));
            f = g.apply(am, op, vec![f], ProtoType::scalar());
        }
        f
    }

    let mut g = Dfg::new();
    let main = g.main();
    let cond = g.scalar(main, 0.0);
    let t_op = g.add_compound("t-arm", Signature::fixed(0, ProtoType::scalar()));
    let t_body = body_of(&g, t_op);
    let _t = sqrt_chain(&mut g, t_body, t_n);
    let f_op = g.add_compound("f-arm", Signature::fixed(0, ProtoType::scalar()));
    let f_body = body_of(&g, f_op);
    let _f = sqrt_chain(&mut g, f_body, f_n);
    let out = g.branch(main, cond, t_op, f_op, ProtoType::scalar());
    g.output = Some(out);

    let mut emitter = KernelEmitter::new(EmitterOptions::default()).unwrap();
    let buf = emitter.emit_from(&mut g).unwrap();
    let decoded = decode(&buf);
    let boundaries: Vec<usize> = decoded.iter().map(|(o, _, _)| *o).collect();

    let mut checked = 0;
    for (offset, name, operands) in &decoded {
        let target = match name.as_str() {
            "IF_OP" | "JMP_OP" => offset + 2 + operands[0] as usize,
            "IF_16_OP" | "JMP_16_OP" => {
                offset + 3 + u16::from_le_bytes([operands[0], operands[1]]) as usize
            }
            _ => continue,
        };
        checked += 1;
        assert!(
            boundaries.contains(&target),
            "{} at {} jumps into the middle of an instruction ({})",
            name,
            offset,
            target
        );
        assert!(target > *offset, "branches jump forward");
    }
    assert_eq!(checked, 2, "one conditional and one exit jump");
    if t_n.max(f_n) >= 300 {
        let names: Vec<&String> = decoded.iter().map(|(_, n, _)| n).collect();
        assert!(
            names.iter().any(|n| n.as_str() == "IF_16_OP" || n.as_str() == "JMP_16_OP"),
            "long arms require wide branch offsets"
        );
    }
}
