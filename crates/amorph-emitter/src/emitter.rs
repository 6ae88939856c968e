//! The kernel bytecode emitter.
//!
//! Lowers a checked dataflow graph into a linear instruction chain
//! (producer before consumers, one function per relevant medium), then
//! runs the propagator rules to a fixed point and serializes the result.
//! One [`KernelEmitter`] owns the opcode tables for its lifetime; the
//! instruction chain and the per-run maps are rebuilt on every
//! [`KernelEmitter::emit_from`] call.

use std::collections::BTreeMap;

use amorph_ir::{AmId, Dfg, FieldId, OiId, OpId, Operator, ProtoType};
use tracing::{debug, info, warn};

use crate::diag::{EmitError, OpTableError};
use crate::insn::{InsnArena, InsnId, InsnKind};
use crate::ops::{CoreOps, OpTable, Opcode, StackDelta};
use crate::options::{EmitterOptions, PrintCompactness};
use crate::print;
use crate::propagate::{self, CheckResolution};
use crate::rewrite;

pub struct KernelEmitter {
    options: EmitterOptions,
    table: OpTable,
    core: CoreOps,
    arena: InsnArena,
    /// Head and tail of the program chain under construction.
    start: Option<InsnId>,
    end: Option<InsnId>,
    /// Compound operator -> its function-definition instruction.
    global_fns: BTreeMap<OpId, InsnId>,
    /// Field -> the let binding holding its value, so later reads emit a
    /// reference instead of recomputing.
    memory: BTreeMap<FieldId, InsnId>,
    /// Chains parked for `reference` operators, waiting to be spliced in
    /// front of the branch that owns them. Must be empty when
    /// linearization finishes.
    fragments: BTreeMap<OiId, InsnId>,
}

impl KernelEmitter {
    /// Build an emitter: loads the core opcode table plus any extension
    /// files named in the options.
    pub fn new(options: EmitterOptions) -> Result<Self, EmitError> {
        let mut table = OpTable::core()?;
        let files = options.extension_op_files.clone();
        for path in &files {
            table.load_extension_file(path)?;
        }
        Self::with_table(options, table)
    }

    /// Build an emitter over an already-loaded opcode table.
    pub fn with_table(options: EmitterOptions, table: OpTable) -> Result<Self, EmitError> {
        for diag in table.diagnostics() {
            warn!(%diag, "op table diagnostic");
        }
        let core = CoreOps::resolve(&table)?;
        Ok(KernelEmitter {
            options,
            table,
            core,
            arena: InsnArena::new(),
            start: None,
            end: None,
            global_fns: BTreeMap::new(),
            memory: BTreeMap::new(),
            fragments: BTreeMap::new(),
        })
    }

    pub fn options(&self) -> &EmitterOptions {
        &self.options
    }

    pub fn table(&self) -> &OpTable {
        &self.table
    }

    pub fn core_ops(&self) -> &CoreOps {
        &self.core
    }

    /// Process `defop` forms from in-memory source.
    pub fn set_defops(&mut self, src: &str) -> Result<(), OpTableError> {
        self.table.set_defops(src)
    }

    /// The last emitted program as a C-array dump, if a run completed.
    pub fn print_program(&self) -> Option<String> {
        self.start.map(|root| {
            print::print_chain(
                &self.arena,
                &self.table,
                root,
                self.options.print_compact,
                self.options.op_debug,
            )
        })
    }

    // ==================================================================
    // Entry point
    // ==================================================================

    /// Lower `g` to bytecode. The graph is mutated by the
    /// pre-linearization rewrites.
    pub fn emit_from(&mut self, g: &mut Dfg) -> Result<Vec<u8>, EmitError> {
        rewrite::check_emittable(g)?;

        debug!("pre-linearization rewrites");
        g.determine_relevant();
        rewrite::reference_to_parameter(g)?;
        rewrite::primitive_to_compound(g)?;

        debug!("linearizing dataflow graph to instructions");
        self.arena = InsnArena::new();
        self.global_fns.clear();
        self.memory.clear();
        self.fragments.clear();

        let def_vm = self.arena.def_vm(&self.core);
        self.start = Some(def_vm);
        self.end = Some(def_vm);

        let main = g
            .output
            .map(|f| g.field(f).domain)
            .unwrap_or_else(|| g.main());
        let relevant: Vec<AmId> = g.relevant.iter().copied().collect();
        for am in relevant {
            if am == main || g.medium(am).branch_arm {
                continue;
            }
            let chain = self.dfg_to_instructions(g, am)?;
            self.arena.append(&mut self.end, chain);
        }
        let main_chain = self.dfg_to_instructions(g, main)?;
        self.arena.append(&mut self.end, main_chain);
        let exit = self.insn(self.core.exit);
        self.arena.append(&mut self.end, exit);

        if self.options.verbosity >= 2 {
            debug!(
                chain = %print::print_chain(
                    &self.arena,
                    &self.table,
                    def_vm,
                    PrintCompactness::Compact,
                    self.options.op_debug,
                ),
                "linearized program"
            );
        }

        // Everything parked for a reference must have found its branch.
        if let Some((&oi, &frag)) = self.fragments.iter().next() {
            let head = self.arena.chain_start(frag);
            let dump = print::print_chain(
                &self.arena,
                &self.table,
                head,
                PrintCompactness::Compact,
                true,
            );
            return Err(EmitError::Resolution {
                message: format!(
                    "unplaced fragment for {}",
                    g.field_str(g.oi(oi).output)
                ),
                chain: dump,
            });
        }

        debug!("resolving unknowns in instruction sequence");
        let mut rules = propagate::standard_rules();
        for round in 0..self.options.max_loops {
            let mut changed = false;
            for rule in rules.iter_mut() {
                let cx = propagate::ctx(
                    &mut self.arena,
                    &self.core,
                    &self.table,
                    &self.global_fns,
                    def_vm,
                    self.options.verbosity,
                );
                changed |= propagate::propagate(rule.as_mut(), cx)?;
            }
            if !changed {
                break;
            }
            if round + 1 == self.options.max_loops {
                warn!(
                    loops = self.options.max_loops,
                    "emitter analyzer giving up without convergence"
                );
            }
        }

        let cx = propagate::ctx(
            &mut self.arena,
            &self.core,
            &self.table,
            &self.global_fns,
            def_vm,
            self.options.verbosity,
        );
        propagate::propagate(&mut CheckResolution, cx)?;
        if self.options.paranoid {
            self.check_location_monotonicity(def_vm)?;
        }

        debug!("outputting final instruction sequence");
        let buf = self.arena.serialize(def_vm)?;
        if self.options.dump_hex {
            info!(dump = %print::hexdump(&buf), "emitted bytecode");
        }
        Ok(buf)
    }

    // ==================================================================
    // Linearizer
    // ==================================================================

    /// Lower one medium to a `DEF_FUN .. RET` chain, emitting each
    /// minimum (field with no relevant consumer) depth-first.
    fn dfg_to_instructions(&mut self, g: &Dfg, am: AmId) -> Result<InsnId, EmitError> {
        let minima: Vec<FieldId> = g
            .all_fields(am)
            .into_iter()
            .filter(|&f| !has_relevant_consumer(g, f))
            .collect();
        debug!(
            medium = %g.medium(am).name,
            minima = minima.len(),
            "linearizing medium"
        );

        let fnstart = self.arena.def_fun(&self.core);
        let mut chain = Some(fnstart);
        for &f in &minima {
            let tree = self.tree_to_instructions(g, f)?;
            self.arena.append(&mut chain, tree);
        }
        if minima.len() > 1 {
            if minima.len() >= 256 {
                return Err(EmitError::internal(format!(
                    "too many minima: {}",
                    minima.len()
                )));
            }
            let all = self
                .arena
                .plain(self.core.all, -(minima.len() as i32 - 1), 0);
            self.arena[all].push_param(minima.len() as u8);
            self.arena.append(&mut chain, all);
        }
        let ret = self.insn(self.core.ret);
        self.arena.append(&mut chain, ret);
        if let InsnKind::DefFun { ret: slot, .. } = &mut self.arena[fnstart].kind {
            *slot = Some(ret);
        }
        if let Some(cop) = g.medium(am).body_of {
            self.global_fns.insert(cop, fnstart);
        }
        Ok(fnstart)
    }

    /// Emit the expression tree rooted at `f`: producer before consumers,
    /// with sharing through let bindings.
    fn tree_to_instructions(&mut self, g: &Dfg, f: FieldId) -> Result<InsnId, EmitError> {
        if let Some(&binding) = self.memory.get(&f) {
            let producer = g.field(f).producer;
            return self.arena.reference(binding, Some(producer), &self.core);
        }

        let oi = g.field(f).producer;
        let inputs = g.oi(oi).inputs.clone();
        let mut chain: Option<InsnId> = None;
        for &input in &inputs {
            let tree = self.tree_to_instructions(g, input)?;
            self.arena.append(&mut chain, tree);
        }

        if g.is_core_op(oi, "reference") {
            // The tail of the input chain stays here as the use site; the
            // computation before it is parked until the owning branch is
            // linearized.
            if inputs.len() != 1 {
                return Err(EmitError::internal("bad number of reference inputs"));
            }
            if let Some(tail) = chain {
                if let Some(prefix_tail) = self.arena.split_before(tail) {
                    let head = self.arena.chain_start(prefix_tail);
                    self.fragments.insert(g.field(inputs[0]).producer, head);
                }
            }
        } else {
            let seg = match g.op(g.oi(oi).op) {
                Operator::Primitive { .. } => self.primitive_to_instruction(g, oi)?,
                Operator::Literal { value } => {
                    let value = value.clone();
                    self.literal_to_instruction(g, &value, oi)?
                }
                Operator::Parameter { index, .. } => {
                    let index = *index;
                    self.parameter_instruction(index)?
                }
                Operator::Compound(c) => {
                    let arity = c.signature.n_fixed() + usize::from(c.signature.rest_input.is_some());
                    let cop = g.oi(oi).op;
                    let def = *self.global_fns.get(&cop).ok_or_else(|| {
                        EmitError::internal(format!("call to an undefined function: {}", c.name))
                    })?;
                    let reference = self.arena.reference(def, Some(oi), &self.core)?;
                    let mut seg = Some(reference);
                    let call = self.arena.fun_call(cop, arity, &self.core)?;
                    self.arena.append(&mut seg, call);
                    reference
                }
            };
            self.arena.append(&mut chain, seg);
        }

        if needs_let(g, f) {
            let binding = self.arena.let_insn(&self.core);
            self.memory.insert(f, binding);
            self.arena.append(&mut chain, binding);
            let reference = self.arena.reference(binding, Some(oi), &self.core)?;
            self.arena.append(&mut chain, reference);
        }

        let tail = chain.ok_or_else(|| EmitError::internal("empty instruction chain for field"))?;
        Ok(self.arena.chain_start(tail))
    }

    // ==================================================================
    // Primitive emission
    // ==================================================================

    fn primitive_to_instruction(&mut self, g: &Dfg, oi: OiId) -> Result<InsnId, EmitError> {
        let (name, signature) = match g.op(g.oi(oi).op) {
            Operator::Primitive { name, signature } => (name.clone(), signature.clone()),
            _ => return Err(EmitError::internal("primitive emission of a non-primitive")),
        };
        let otype = g.field(g.oi(oi).output).range.clone();
        let tuple = otype.is_tuple();
        let inputs = g.oi(oi).inputs.clone();

        if let Some(op) = self.table.primitive_op(&name) {
            // Plain ops; tuple results go through a global destination.
            if tuple {
                let store = self.vec_op_store(&otype)?;
                let delta = self.fixed_delta(op);
                return self.arena.vec_reference(op, store, Some(oi), delta);
            }
            return Ok(self.insn(op));
        }

        if let Some((scalar_op, vector_op)) = self.table.sv_pair(&name) {
            // The vector form applies if any input (or the output) is a
            // tuple.
            let any_tuple =
                tuple || inputs.iter().any(|&i| g.field(i).range.is_tuple());
            let op = if any_tuple { vector_op } else { scalar_op };
            let n_copies = if signature.rest_input.is_some() {
                inputs.len().saturating_sub(1)
            } else {
                1
            };
            let mut chain = None;
            for _ in 0..n_copies {
                let insn = if tuple && name != "max" && name != "min" {
                    let store = self.vec_op_store(&otype)?;
                    let delta = self.fixed_delta(op);
                    self.arena.vec_reference(op, store, Some(oi), delta)?
                } else {
                    self.insn(op)
                };
                self.arena.append(&mut chain, insn);
            }
            return Ok(match chain {
                Some(tail) => self.arena.chain_start(tail),
                // Single-operand fold: the value passes through untouched.
                None => self.arena.no_op(),
            });
        }

        if name == "/" {
            return self.division_instruction(oi, &otype, inputs.len());
        }

        if name == "tup" {
            let store = self.vec_op_store(&otype)?;
            let r = self
                .arena
                .vec_reference(self.core.tup, store, Some(oi), 1 - inputs.len() as i32)?;
            self.arena[r].push_param(inputs.len() as u8);
            return Ok(r);
        }

        if name == "branch" {
            return self.branch_instruction(g, oi);
        }

        if name == "reference" {
            // The use site was already produced by the input.
            return Ok(self.arena.no_op());
        }

        Err(EmitError::internal(format!(
            "don't know how to convert operator to instruction: {}",
            name
        )))
    }

    /// Division folds its divisors with multiplies; tuple division
    /// multiplies by the reciprocal through the environment.
    fn division_instruction(
        &mut self,
        oi: OiId,
        otype: &ProtoType,
        n_inputs: usize,
    ) -> Result<InsnId, EmitError> {
        if n_inputs < 2 {
            return Err(EmitError::internal("division needs a divisor"));
        }
        let mut chain = None;
        for _ in 0..(n_inputs - 2) {
            let mul = self.insn(self.core.mul);
            self.arena.append(&mut chain, mul);
        }
        if !otype.is_tuple() {
            let div = self.insn(self.core.div);
            self.arena.append(&mut chain, div);
        } else {
            let let2 = self.arena.plain(self.core.let_k.op(2), -2, 2);
            self.arena.append(&mut chain, let2);
            for op in [
                self.core.lit_k.op(1),
                self.core.ref_k.op(0),
                self.core.div,
                self.core.ref_k.op(1),
            ] {
                let insn = self.insn(op);
                self.arena.append(&mut chain, insn);
            }
            let store = self.vec_op_store(otype)?;
            let delta = self.fixed_delta(self.core.vmul);
            let vmul = self
                .arena
                .vec_reference(self.core.vmul, store, Some(oi), delta)?;
            self.arena.append(&mut chain, vmul);
            let pop = self.arena.plain(self.core.pop_let_k.op(2), 0, -2);
            self.arena.append(&mut chain, pop);
        }
        let tail = chain.expect("division emits at least one instruction");
        Ok(self.arena.chain_start(tail))
    }

    /// Lower a branch: inline both lambda bodies as blocks, splice any
    /// fragments owned by this branch's medium in front, and wire the
    /// conditional and exit jumps.
    fn branch_instruction(&mut self, g: &Dfg, oi: OiId) -> Result<InsnId, EmitError> {
        let inputs = g.oi(oi).inputs.clone();
        if inputs.len() != 3 {
            return Err(EmitError::internal("bad number of branch inputs"));
        }
        let t_body = self.lambda_body(g, inputs[1])?;
        let f_body = self.lambda_body(g, inputs[2])?;
        let t_chain = self.dfg_to_instructions(g, t_body)?;
        let f_chain = self.dfg_to_instructions(g, f_body)?;
        let t_inner = self.strip_function_frame(t_chain)?;
        let f_inner = self.strip_function_frame(f_chain)?;
        let t_block = self.arena.block(t_inner);
        let f_block = self.arena.block(f_inner);

        // Values referenced by name inside the arms were parked as
        // fragments; they execute just before the branch.
        let mut chain = None;
        let domain = g.oi_domain(oi);
        let owned: Vec<OiId> = self
            .fragments
            .keys()
            .copied()
            .filter(|&frag_oi| g.oi_domain(frag_oi) == domain)
            .collect();
        for frag_oi in owned {
            let head = self.fragments.remove(&frag_oi).expect("key just listed");
            self.arena.append(&mut chain, head);
        }

        let jmp = self.arena.branch(t_block, true, &self.core);
        let conditional = self.arena.branch(jmp, false, &self.core);
        self.mark_branch_references(g, t_block, domain, t_block)?;
        self.mark_branch_references(g, f_block, domain, t_block)?;
        self.arena.append(&mut chain, conditional);
        self.arena.append(&mut chain, f_block);
        self.arena.append(&mut chain, jmp);
        self.arena.append(&mut chain, t_block);
        let tail = chain.expect("branch emits instructions");
        Ok(self.arena.chain_start(tail))
    }

    /// The body medium of a lambda-typed field.
    fn lambda_body(&self, g: &Dfg, f: FieldId) -> Result<AmId, EmitError> {
        match &g.field(f).range {
            ProtoType::Lambda { op } => match g.op(*op) {
                Operator::Compound(c) => Ok(c.body),
                _ => Err(EmitError::internal("branch arm is not a compound operator")),
            },
            other => Err(EmitError::internal(format!(
                "branch arm is not a lambda: {}",
                other
            ))),
        }
    }

    /// Drop the `DEF_FUN` prologue and `RET` epilogue from a freshly
    /// linearized function chain, leaving the bare body.
    fn strip_function_frame(&mut self, head: InsnId) -> Result<InsnId, EmitError> {
        let body_head = self.arena[head]
            .next
            .ok_or_else(|| EmitError::internal("function chain has no body"))?;
        let ret = self.arena.chain_end(body_head);
        if body_head == ret {
            return Err(EmitError::internal("branch arm has an empty body"));
        }
        self.arena.delete_range(head, head);
        self.arena.delete_range(ret, ret);
        Ok(body_head)
    }

    /// Mark references inside a branch arm whose value belongs to the
    /// branch's own medium, so their let pops land at the branch exit.
    fn mark_branch_references(
        &mut self,
        g: &Dfg,
        block: InsnId,
        domain: AmId,
        branch_end: InsnId,
    ) -> Result<(), EmitError> {
        let contents = match self.arena[block].kind {
            InsnKind::Block { contents } => contents,
            _ => return Err(EmitError::internal("marking a non-block")),
        };
        let ids: Vec<InsnId> = self.arena.iter_chain(contents).collect();
        for id in ids {
            match self.arena[id].kind {
                InsnKind::Ref {
                    target: Some(target),
                    ..
                } => {
                    if g.oi_domain(target) == domain {
                        if self.arena[id].branch_end.is_some() {
                            return Err(EmitError::internal(
                                "tried to duplicate-mark a reference",
                            ));
                        }
                        self.arena[id].branch_end = Some(branch_end);
                    }
                }
                InsnKind::Block { .. } => {
                    self.mark_branch_references(g, id, domain, branch_end)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ==================================================================
    // Literal emission
    // ==================================================================

    fn literal_to_instruction(
        &mut self,
        g: &Dfg,
        value: &ProtoType,
        context: OiId,
    ) -> Result<InsnId, EmitError> {
        match value {
            ProtoType::Scalar(Some(v)) => Ok(self.scalar_instruction(*v)),
            ProtoType::Tuple { elems, bounded } => {
                self.tuple_instruction(g, elems, *bounded, context)
            }
            ProtoType::Lambda { op } => self.lambda_instruction(g, *op, context),
            other => Err(EmitError::internal(format!(
                "don't know how to emit literal: {}",
                other
            ))),
        }
    }

    fn scalar_instruction(&mut self, value: f32) -> InsnId {
        let integral = (0.0..=32768.0).contains(&value) && value == (value as i64) as f32;
        if integral {
            self.integer_literal(value as u16)
        } else {
            self.float_literal(value)
        }
    }

    fn integer_literal(&mut self, value: u16) -> InsnId {
        if self.core.lit_k.contains(value as usize) {
            self.insn(self.core.lit_k.op(value as usize))
        } else if value < 0x80 {
            let i = self.insn(self.core.lit8);
            self.arena[i].push_param(value as u8);
            i
        } else {
            let i = self.insn(self.core.lit16);
            self.arena[i].push_param16(value);
            i
        }
    }

    fn float_literal(&mut self, value: f32) -> InsnId {
        let i = self.insn(self.core.lit_flo);
        for byte in value.to_le_bytes() {
            self.arena[i].push_param(byte);
        }
        i
    }

    /// A non-empty tuple literal becomes a global definition initialized
    /// element by element, referenced from the use site.
    fn tuple_instruction(
        &mut self,
        g: &Dfg,
        elems: &[ProtoType],
        bounded: bool,
        context: OiId,
    ) -> Result<InsnId, EmitError> {
        if !bounded {
            return Err(EmitError::internal("cannot emit unbounded literal tuple"));
        }
        if elems.is_empty() {
            return Ok(self.insn(self.core.nul_tup));
        }
        let mut definition = None;
        for elem in elems {
            let e = self.literal_to_instruction(g, elem, context)?;
            self.arena.append(&mut definition, e);
        }
        let def_tup = self.arena.def_tup(elems.len(), true, &self.core)?;
        self.arena.append(&mut definition, def_tup);
        let head = self.arena.chain_start(def_tup);
        self.arena.append(&mut self.end, head);
        self.arena.reference(def_tup, Some(context), &self.core)
    }

    fn lambda_instruction(
        &mut self,
        g: &Dfg,
        op: OpId,
        context: OiId,
    ) -> Result<InsnId, EmitError> {
        // Lambdas consumed only by branches become the branch's inline
        // blocks and emit nothing here.
        let output = g.oi(context).output;
        let is_branch = g
            .field(output)
            .consumers
            .iter()
            .all(|&(consumer, _)| g.is_core_op(consumer, "branch"));
        if is_branch {
            return Ok(self.arena.no_op());
        }
        match g.op(op) {
            Operator::Compound(_) => {}
            _ => return Err(EmitError::internal("non-compound operator in lambda")),
        }
        let def = *self
            .global_fns
            .get(&op)
            .ok_or_else(|| EmitError::internal("lambda has undefined operator"))?;
        self.arena.reference(def, Some(context), &self.core)
    }

    fn parameter_instruction(&mut self, index: usize) -> Result<InsnId, EmitError> {
        if self.core.ref_k.contains(index) {
            Ok(self.insn(self.core.ref_k.op(index)))
        } else if index < 256 {
            let i = self.insn(self.core.ref_op);
            self.arena[i].push_param(index as u8);
            Ok(i)
        } else {
            Err(EmitError::internal(format!(
                "parameter index too large: {}",
                index
            )))
        }
    }

    // ==================================================================
    // Helpers
    // ==================================================================

    /// Declare a sized tuple global for a vector op's destination slot.
    fn vec_op_store(&mut self, t: &ProtoType) -> Result<InsnId, EmitError> {
        let elems = t
            .tuple_elems()
            .ok_or_else(|| EmitError::internal("vector destination for a non-tuple"))?;
        let def = self.arena.def_tup(elems.len(), false, &self.core)?;
        self.arena.append(&mut self.end, def);
        Ok(def)
    }

    /// A plain instruction with its table stack delta.
    fn insn(&mut self, op: Opcode) -> InsnId {
        self.arena.plain(op, self.fixed_delta(op), 0)
    }

    fn fixed_delta(&self, op: Opcode) -> i32 {
        match self.table.stack_delta(op) {
            StackDelta::Fixed(d) => d,
            StackDelta::Variable => 0,
        }
    }

    /// Paranoid pass: every instruction must start exactly where its
    /// predecessor ends.
    fn check_location_monotonicity(&self, root: InsnId) -> Result<(), EmitError> {
        let mut stack = vec![root];
        while let Some(head) = stack.pop() {
            let mut prev: Option<InsnId> = None;
            for id in self.arena.iter_chain(head) {
                if let InsnKind::Block { contents } = self.arena[id].kind {
                    stack.push(contents);
                }
                if let Some(p) = prev {
                    if self.arena.next_location(p) != self.arena.start_location(id) {
                        return Err(EmitError::internal(format!(
                            "location discontinuity at byte {:?}",
                            self.arena.start_location(id)
                        )));
                    }
                }
                prev = Some(id);
            }
        }
        Ok(())
    }
}

/// A field needs a let binding when it is consumed more than once in its
/// own medium, or at all from another relevant medium.
fn needs_let(g: &Dfg, f: FieldId) -> bool {
    let field = g.field(f);
    let mut same_medium = 0;
    for &(consumer, _) in &field.consumers {
        let consumer_domain = g.oi_domain(consumer);
        if consumer_domain == field.domain {
            same_medium += 1;
            if same_medium > 1 {
                return true;
            }
        } else if g.relevant.contains(&consumer_domain) {
            return true;
        }
    }
    false
}

/// Minima are fields nothing relevant consumes.
fn has_relevant_consumer(g: &Dfg, f: FieldId) -> bool {
    let field = g.field(f);
    for &(consumer, _) in &field.consumers {
        let consumer_domain = g.oi_domain(consumer);
        if consumer_domain == field.domain || g.relevant.contains(&consumer_domain) {
            return true;
        }
    }
    false
}
