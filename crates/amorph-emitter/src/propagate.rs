//! Worklist propagators: the fixed-point resolution engine.
//!
//! Each propagator visits every instruction in the chain, mutating what it
//! can and calling [`PropCtx::note_change`] so that neighbors (sequence
//! links, the containing block, and registered dependents) get revisited.
//! A step budget bounds each pass; exhausting it means the pass is cycling
//! and is a fatal internal error. The emitter runs the whole rule list
//! repeatedly until one full round reports no change.

use std::collections::{BTreeMap, BTreeSet};

use amorph_ir::OpId;
use tracing::{debug, trace};

use crate::diag::EmitError;
use crate::insn::{InsnArena, InsnId, InsnKind};
use crate::ops::{CoreOps, OpTable};
use crate::options::PrintCompactness;
use crate::print;

/// Shared state for one propagation pass.
pub struct PropCtx<'a> {
    pub arena: &'a mut InsnArena,
    pub core: &'a CoreOps,
    pub table: &'a OpTable,
    /// Compound operator -> its function-definition instruction.
    pub global_fns: &'a BTreeMap<OpId, InsnId>,
    pub root: InsnId,
    pub verbosity: u8,
    worklist: BTreeSet<InsnId>,
    any_changes: bool,
}

impl PropCtx<'_> {
    /// Record a mutation of `i` and wake its neighbors.
    pub fn note_change(&mut self, i: InsnId) {
        self.any_changes = true;
        let insn = &self.arena[i];
        let prev = insn.prev;
        let next = insn.next;
        let container = insn.container;
        let deps: Vec<InsnId> = insn.dependents.iter().copied().collect();
        self.worklist.extend(prev);
        self.worklist.extend(next);
        self.worklist.extend(container);
        self.worklist.extend(deps);
    }

    pub fn mark_changed(&mut self) {
        self.any_changes = true;
    }

    fn queue_chain(&mut self, head: InsnId) {
        let mut stack = vec![head];
        while let Some(mut cursor) = stack.pop() {
            loop {
                self.worklist.insert(cursor);
                if let InsnKind::Block { contents } = self.arena[cursor].kind {
                    stack.push(contents);
                }
                match self.arena[cursor].next {
                    Some(n) => cursor = n,
                    None => break,
                }
            }
        }
    }

    /// Compact dump of the whole program chain, for diagnostics.
    pub fn chain_dump(&self) -> String {
        let start = self.arena.chain_start(self.root);
        print::print_chain(self.arena, self.table, start, PrintCompactness::Compact, true)
    }
}

/// One resolution rule.
pub trait Propagator {
    fn name(&self) -> &'static str;
    fn preprop(&mut self, _cx: &mut PropCtx) -> Result<(), EmitError> {
        Ok(())
    }
    fn act(&mut self, cx: &mut PropCtx, i: InsnId) -> Result<(), EmitError>;
    fn postprop(&mut self, _cx: &mut PropCtx) -> Result<(), EmitError> {
        Ok(())
    }
}

/// Equivalent full passes through the worklist before a pass is presumed
/// to be looping.
const LOOP_ABORT: usize = 10;

/// Drive one propagator over the chain rooted at `cx.root` until its
/// worklist drains. Returns whether anything changed.
pub fn propagate(rule: &mut dyn Propagator, mut cx: PropCtx) -> Result<bool, EmitError> {
    trace!(rule = rule.name(), "executing analyzer");
    cx.queue_chain(cx.root);
    rule.preprop(&mut cx)?;
    let mut steps_remaining = LOOP_ABORT * cx.worklist.len();
    while !cx.worklist.is_empty() {
        if steps_remaining == 0 {
            return Err(EmitError::Resolution {
                message: format!("{}: aborting due to apparent infinite loop", rule.name()),
                chain: cx.chain_dump(),
            });
        }
        steps_remaining -= 1;
        let i = *cx.worklist.iter().next().expect("worklist is non-empty");
        cx.worklist.remove(&i);
        rule.act(&mut cx, i)?;
    }
    rule.postprop(&mut cx)?;
    if cx.verbosity >= 5 {
        trace!(chain = %cx.chain_dump(), "post-pass chain");
    }
    debug!(rule = rule.name(), changes = cx.any_changes, "finished analyzer");
    Ok(cx.any_changes)
}

// ======================================================================
// DeleteNulls
// ======================================================================

/// Unlinks placeholder instructions from their chains.
pub struct DeleteNulls;

impl Propagator for DeleteNulls {
    fn name(&self) -> &'static str {
        "DeleteNulls"
    }

    fn act(&mut self, cx: &mut PropCtx, i: InsnId) -> Result<(), EmitError> {
        if !matches!(cx.arena[i].kind, InsnKind::NoOp) {
            return Ok(());
        }
        // If the placeholder heads a block's contents, move the head
        // forward before unlinking.
        if let Some(container) = cx.arena[i].container {
            let heads_block = matches!(cx.arena[container].kind,
                                       InsnKind::Block { contents } if contents == i);
            if heads_block {
                match cx.arena[i].next {
                    Some(n) => {
                        if let InsnKind::Block { contents } = &mut cx.arena[container].kind {
                            *contents = n;
                        }
                    }
                    None => return Ok(()), // sole content; nothing to do
                }
            }
        }
        trace!("deleting placeholder instruction");
        cx.arena.delete_range(i, i);
        Ok(())
    }
}

// ======================================================================
// InsertLetPops
// ======================================================================

/// Finds the last use of every let binding and places grouped pop
/// instructions, honoring branch-end markers so pops stay with their
/// branch.
pub struct InsertLetPops;

impl InsertLetPops {
    fn insert_pop_set(
        &self,
        cx: &mut PropCtx,
        sources: Vec<InsnId>,
        default_dest: InsnId,
    ) -> Result<(), EmitError> {
        // Cluster the pops into branch-specific sets.
        let mut dest_sets: BTreeMap<InsnId, Vec<InsnId>> = BTreeMap::new();
        for source in sources {
            let usages = match &cx.arena[source].kind {
                InsnKind::Let { usages, .. } => usages.clone(),
                _ => return Err(EmitError::internal("pop source is not a let")),
            };
            let last = usages
                .iter()
                .copied()
                .find(|u| cx.arena[*u].last_reference)
                .ok_or_else(|| {
                    EmitError::internal("trying to pop a let without its last usage marked")
                })?;
            let dest = cx.arena[last].branch_end.unwrap_or(default_dest);
            dest_sets.entry(dest).or_default().push(source);
        }

        // Place each set.
        for (dest, lets) in dest_sets {
            let k = lets.len();
            let pop = if cx.core.pop_let_k.contains(k) {
                cx.arena.plain(cx.core.pop_let_k.op(k), 0, -(k as i32))
            } else if k < 256 {
                let pop = cx.arena.plain(cx.core.pop_let, 0, -(k as i32));
                cx.arena[pop].push_param(k as u8);
                pop
            } else {
                return Err(EmitError::internal(format!("too many lets to pop: {}", k)));
            };
            for &l in &lets {
                if let InsnKind::Let { pop: slot, .. } = &mut cx.arena[l].kind {
                    *slot = Some(pop);
                }
            }
            trace!(bindings = k, "inserting let pop");
            cx.arena.insert_after(dest, pop);
            cx.note_change(pop);
        }
        Ok(())
    }
}

impl Propagator for InsertLetPops {
    fn name(&self) -> &'static str {
        "InsertLetPops"
    }

    fn act(&mut self, cx: &mut PropCtx, i: InsnId) -> Result<(), EmitError> {
        let root_usages = match &cx.arena[i].kind {
            InsnKind::Let { pop: None, usages } => usages.clone(),
            _ => return Ok(()),
        };

        let mut usage_stack = vec![root_usages];
        let mut sources = vec![i];
        let mut pointer = cx.arena[i].next;
        let mut nesting: Vec<InsnId> = Vec::new();
        let mut cursor = i;
        while !usage_stack.is_empty() {
            while sources.len() > usage_stack.len() {
                sources.pop();
            }
            let p = match pointer {
                Some(p) => p,
                None => match nesting.pop() {
                    Some(block) => {
                        pointer = cx.arena[block].next;
                        continue;
                    }
                    None => {
                        return Err(EmitError::Resolution {
                            message: "couldn't find all usages of let".to_string(),
                            chain: cx.chain_dump(),
                        })
                    }
                },
            };
            enum Step {
                Descend(InsnId),
                Nest(BTreeSet<InsnId>),
                Read,
                Other,
            }
            let step = match &cx.arena[p].kind {
                InsnKind::Block { contents } => Step::Descend(*contents),
                InsnKind::Let { usages, .. } => Step::Nest(usages.clone()),
                InsnKind::Ref { .. } => Step::Read,
                _ => Step::Other,
            };
            match step {
                Step::Descend(contents) => {
                    nesting.push(p);
                    pointer = Some(contents);
                    continue;
                }
                Step::Nest(sub) => {
                    sources.push(p);
                    usage_stack.push(sub);
                }
                Step::Read => {
                    for set in usage_stack.iter_mut() {
                        if set.remove(&p) {
                            if set.is_empty() {
                                cx.arena[p].last_reference = true;
                            }
                            break;
                        }
                    }
                    while usage_stack.last().is_some_and(|s| s.is_empty()) {
                        usage_stack.pop();
                    }
                }
                Step::Other => {}
            }
            cursor = p;
            if !usage_stack.is_empty() {
                pointer = cx.arena[p].next;
            }
        }
        self.insert_pop_set(cx, sources, cursor)
    }
}

// ======================================================================
// ResolveISizes
// ======================================================================

/// Resolves function body sizes, global-reference offsets, and branch
/// jump distances, repicking opcode encodings as values become known.
pub struct ResolveISizes;

impl Propagator for ResolveISizes {
    fn name(&self) -> &'static str {
        "ResolveISizes"
    }

    fn act(&mut self, cx: &mut PropCtx, i: InsnId) -> Result<(), EmitError> {
        match cx.arena[i].kind {
            InsnKind::DefFun { ret, fun_size, .. } => {
                let ret =
                    ret.ok_or_else(|| EmitError::internal("function definition lost its RET"))?;
                let mut size = 1usize; // the return's size
                let mut all_known = true;
                let mut j = cx.arena[i].next;
                loop {
                    let jj = match j {
                        Some(jj) => jj,
                        None => {
                            return Err(EmitError::internal(
                                "function definition can't find its matching RET",
                            ))
                        }
                    };
                    if jj == ret {
                        break;
                    }
                    match cx.arena.size(jj) {
                        Some(s) => size += s,
                        None => all_known = false,
                    }
                    j = cx.arena[jj].next;
                }
                if all_known && fun_size != Some(size) {
                    trace!(size, "resolved function size");
                    cx.arena.set_fun_size(i, size, cx.core)?;
                    cx.note_change(i);
                }
            }
            InsnKind::Ref {
                store,
                offset: None,
                ..
            } => {
                if let Some(Some(index)) = cx.arena[store].global_index() {
                    trace!(index, "resolved global reference");
                    cx.arena.set_ref_offset(i, index as usize, cx.core)?;
                    cx.note_change(i);
                }
            }
            InsnKind::Branch {
                after_this, offset, ..
            } => {
                if let (Some(target_end), Some(own_end)) = (
                    cx.arena.next_location(after_this),
                    cx.arena.next_location(i),
                ) {
                    let diff = target_end as i64 - own_end as i64;
                    if offset.map(|o| o as i64) != Some(diff) {
                        trace!(diff, "resolved branch offset");
                        cx.arena.set_branch_offset(i, diff, cx.core)?;
                        cx.note_change(i);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// ======================================================================
// ResolveLocations
// ======================================================================

/// Assigns byte locations from predecessors, numbers globals densely in
/// chain order, and keeps function-call references current.
pub struct ResolveLocations {
    g_max: u32,
}

impl ResolveLocations {
    pub fn new() -> Self {
        ResolveLocations { g_max: 0 }
    }

    fn maybe_set_location(&mut self, cx: &mut PropCtx, i: InsnId, location: usize) {
        if cx.arena[i].location != Some(location) {
            cx.arena[i].location = Some(location);
            cx.note_change(i);
        }
    }

    fn maybe_set_index(&mut self, cx: &mut PropCtx, i: InsnId, index: u32) {
        self.g_max = self.g_max.max(index + 1);
        if cx.arena[i].global_index() != Some(Some(index)) {
            match &mut cx.arena[i].kind {
                InsnKind::DefFun { index: slot, .. } | InsnKind::DefTup { index: slot, .. } => {
                    *slot = Some(index)
                }
                _ => unreachable!("only globals are indexed"),
            }
            cx.note_change(i);
        }
    }
}

impl Default for ResolveLocations {
    fn default() -> Self {
        Self::new()
    }
}

impl Propagator for ResolveLocations {
    fn name(&self) -> &'static str {
        "ResolveLocations"
    }

    fn preprop(&mut self, _cx: &mut PropCtx) -> Result<(), EmitError> {
        self.g_max = 0;
        Ok(())
    }

    fn act(&mut self, cx: &mut PropCtx, i: InsnId) -> Result<(), EmitError> {
        let prev = cx.arena[i].prev;
        let container = cx.arena[i].container;

        // Base case: chain head adopts its block's location, or zero.
        if prev.is_none() {
            let base = match container {
                None => Some(0),
                Some(c) => cx.arena[c].location,
            };
            if let Some(base) = base {
                self.maybe_set_location(cx, i, base);
            }
        }
        if let Some(p) = prev {
            if let Some(next_loc) = cx.arena.next_location(p) {
                self.maybe_set_location(cx, i, next_loc);
            }
        }

        // Globals are numbered densely in chain order.
        if cx.arena[i].is_global() {
            let mut ptr = cx.arena[i].prev;
            while let Some(p) = ptr {
                if cx.arena[p].is_global() {
                    break;
                }
                ptr = cx.arena[p].prev;
            }
            match ptr {
                Some(g_prev) => {
                    cx.arena[g_prev].dependents.insert(i);
                    if let Some(Some(index)) = cx.arena[g_prev].global_index() {
                        self.maybe_set_index(cx, i, index + 1);
                    }
                }
                None => self.maybe_set_index(cx, i, 0),
            }
        }

        // Keep the reference feeding a function call pointed at the right
        // global index, whatever order things resolved in.
        if let InsnKind::FunCall { op, .. } = cx.arena[i].kind {
            if let Some(&def) = cx.global_fns.get(&op) {
                if let Some(Some(index)) = cx.arena[def].global_index() {
                    if let Some(p) = prev {
                        if let InsnKind::Ref { store, offset, .. } = cx.arena[p].kind {
                            if store == def && offset != Some(index as usize) {
                                cx.arena.set_ref_offset(p, index as usize, cx.core)?;
                                cx.note_change(p);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn postprop(&mut self, cx: &mut PropCtx) -> Result<(), EmitError> {
        let root = cx.root;
        if let InsnKind::DefVm { n_globals, .. } = &mut cx.arena[root].kind {
            if *n_globals != Some(self.g_max) {
                trace!(n_globals = self.g_max, "updated global count");
                *n_globals = Some(self.g_max);
                cx.mark_changed();
            }
        }
        Ok(())
    }
}

// ======================================================================
// StackEnvSizer
// ======================================================================

/// Computes stack and environment heights after every instruction, sets
/// environment-reference offsets from height differences, and maintains
/// the VM header's maxima.
#[derive(Default)]
pub struct StackEnvSizer {
    stack_after: BTreeMap<InsnId, i32>,
    stack_max: BTreeMap<InsnId, i32>,
    env_after: BTreeMap<InsnId, i32>,
    env_max: BTreeMap<InsnId, i32>,
}

impl StackEnvSizer {
    /// Height just before `i`, if the predecessor (or enclosing block's
    /// predecessor) is already resolved.
    fn base_height(
        map: &BTreeMap<InsnId, i32>,
        arena: &InsnArena,
        i: InsnId,
    ) -> Option<i32> {
        let insn = &arena[i];
        match (insn.prev, insn.container) {
            (None, None) => Some(0),
            (None, Some(c)) => match arena[c].prev {
                None => Some(0),
                Some(before_block) => map.get(&before_block).copied(),
            },
            (Some(p), _) => map.get(&p).copied(),
        }
    }
}

impl Propagator for StackEnvSizer {
    fn name(&self) -> &'static str {
        "StackEnvSizer"
    }

    fn preprop(&mut self, _cx: &mut PropCtx) -> Result<(), EmitError> {
        self.stack_after.clear();
        self.stack_max.clear();
        self.env_after.clear();
        self.env_max.clear();
        Ok(())
    }

    fn act(&mut self, cx: &mut PropCtx, i: InsnId) -> Result<(), EmitError> {
        if let Some(base) = Self::base_height(&self.stack_after, cx.arena, i) {
            let after = base + cx.arena.net_stack_delta(i);
            let peak = base + cx.arena.max_stack_delta(i);
            if self.stack_after.get(&i) != Some(&after) || self.stack_max.get(&i) != Some(&peak) {
                self.stack_after.insert(i, after);
                self.stack_max.insert(i, peak);
                cx.note_change(i);
            }
        }
        if let Some(base) = Self::base_height(&self.env_after, cx.arena, i) {
            let after = base + cx.arena.net_env_delta(i);
            let peak = base + cx.arena.max_env_delta(i);
            if self.env_after.get(&i) != Some(&after) || self.env_max.get(&i) != Some(&peak) {
                self.env_after.insert(i, after);
                self.env_max.insert(i, peak);
                cx.note_change(i);
            }
        }
        Ok(())
    }

    fn postprop(&mut self, cx: &mut PropCtx) -> Result<(), EmitError> {
        let mut max_stack = 0i32;
        let mut max_env = 0i32;
        let mut nesting: Vec<InsnId> = Vec::new();
        let mut cursor = Some(cx.root);
        loop {
            let c = match cursor {
                None => match nesting.pop() {
                    Some(block) => {
                        cursor = cx.arena[block].next;
                        continue;
                    }
                    None => break,
                },
                Some(c) => c,
            };
            if let InsnKind::Block { contents } = cx.arena[c].kind {
                nesting.push(c);
                cursor = Some(contents);
                continue;
            }
            // Environment-reference offsets are the depth difference
            // between the use site and the binding site.
            if let InsnKind::Ref { store, offset, vec_op: false, .. } = cx.arena[c].kind {
                if matches!(cx.arena[store].kind, InsnKind::Let { .. }) {
                    if let (Some(&use_h), Some(&bind_h)) =
                        (self.env_after.get(&c), self.env_after.get(&store))
                    {
                        let depth = use_h - bind_h;
                        if depth < 0 {
                            return Err(EmitError::Resolution {
                                message: format!("reference above its binding: {}", depth),
                                chain: cx.chain_dump(),
                            });
                        }
                        if offset.map(|o| o as i32) != Some(depth) {
                            trace!(depth, "set let reference offset");
                            cx.arena.set_ref_offset(c, depth as usize, cx.core)?;
                            cx.note_change(c);
                        }
                    }
                }
            }
            let (Some(&s_max), Some(&e_max)) = (self.stack_max.get(&c), self.env_max.get(&c))
            else {
                return Ok(()); // not entirely resolved yet
            };
            max_stack = max_stack.max(s_max);
            max_env = max_env.max(e_max);
            cursor = cx.arena[c].next;
        }

        let end = cx.arena.chain_end(cx.root);
        let final_height = self.stack_after.get(&end).copied().unwrap_or(0);
        if final_height != 0 {
            return Err(EmitError::Resolution {
                message: format!("stack resolves to non-zero height: {}", final_height),
                chain: cx.chain_dump(),
            });
        }

        let root = cx.root;
        if let InsnKind::DefVm {
            max_stack: stack_slot,
            max_env: env_slot,
            ..
        } = &mut cx.arena[root].kind
        {
            if *stack_slot != Some(max_stack as u32) || *env_slot != Some(max_env as u32) {
                debug!(max_stack, max_env, "updated VM maxima");
                *stack_slot = Some(max_stack as u32);
                *env_slot = Some(max_env as u32);
                cx.mark_changed();
            }
        }
        Ok(())
    }
}

// ======================================================================
// ResolveState
// ======================================================================

/// Counts persistent-state cells and exported values and writes the
/// counts into the VM header, only once everything it saw was resolved.
#[derive(Default)]
pub struct ResolveState {
    n_states: u32,
    n_exports: u32,
    export_len: u32,
    unresolved: bool,
}

impl Propagator for ResolveState {
    fn name(&self) -> &'static str {
        "ResolveState"
    }

    fn preprop(&mut self, _cx: &mut PropCtx) -> Result<(), EmitError> {
        self.n_states = 0;
        self.n_exports = 0;
        self.export_len = 0;
        self.unresolved = false;
        Ok(())
    }

    fn act(&mut self, _cx: &mut PropCtx, _i: InsnId) -> Result<(), EmitError> {
        // State cells and exports are not yet marked in the instruction
        // stream, so there is nothing to count.
        Ok(())
    }

    fn postprop(&mut self, cx: &mut PropCtx) -> Result<(), EmitError> {
        if self.unresolved {
            return Ok(());
        }
        let root = cx.root;
        if let InsnKind::DefVm {
            n_states,
            n_exports,
            export_len,
            ..
        } = &mut cx.arena[root].kind
        {
            let next = (
                Some(self.n_states),
                Some(self.n_exports),
                Some(self.export_len),
            );
            if (*n_states, *n_exports, *export_len) != next {
                (*n_states, *n_exports, *export_len) = next;
                cx.mark_changed();
            }
        }
        Ok(())
    }
}

// ======================================================================
// CheckResolution
// ======================================================================

/// Final gate: every instruction must report itself resolved.
pub struct CheckResolution;

impl Propagator for CheckResolution {
    fn name(&self) -> &'static str {
        "CheckResolution"
    }

    fn act(&mut self, cx: &mut PropCtx, i: InsnId) -> Result<(), EmitError> {
        if !cx.arena.resolved(i) {
            let printed = print::insn_to_string(cx.arena, cx.table, i, true);
            return Err(EmitError::Resolution {
                message: format!("instruction resolution failed for {}", printed),
                chain: cx.chain_dump(),
            });
        }
        Ok(())
    }
}

/// Build the standard rule list in its fixed execution order.
pub fn standard_rules() -> Vec<Box<dyn Propagator>> {
    vec![
        Box::new(DeleteNulls),
        Box::new(InsertLetPops),
        Box::new(ResolveISizes),
        Box::new(ResolveLocations::new()),
        Box::new(StackEnvSizer::default()),
        Box::new(ResolveState::default()),
    ]
}

/// Convenience for building a [`PropCtx`].
#[allow(clippy::too_many_arguments)]
pub fn ctx<'a>(
    arena: &'a mut InsnArena,
    core: &'a CoreOps,
    table: &'a OpTable,
    global_fns: &'a BTreeMap<OpId, InsnId>,
    root: InsnId,
    verbosity: u8,
) -> PropCtx<'a> {
    PropCtx {
        arena,
        core,
        table,
        global_fns,
        root,
        verbosity,
        worklist: BTreeSet::new(),
        any_changes: false,
    }
}
