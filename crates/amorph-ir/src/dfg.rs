//! Arena-backed dataflow graph.
//!
//! The graph owns four arenas (fields, operator instances, media,
//! operators) addressed by integer handles. Handles are allocated in
//! creation order and never reused, so iterating any handle-keyed set is
//! deterministic across runs. Fields and operator instances can be
//! tombstoned by the pre-emission rewrites; media and operators are
//! permanent once created.

use std::collections::BTreeSet;
use std::fmt;

use crate::types::{ProtoType, Signature};

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }

            fn new(index: usize) -> Self {
                $name(index as u32)
            }
        }
    };
}

arena_id!(
    /// Handle to a [`Field`].
    FieldId
);
arena_id!(
    /// Handle to an [`OperatorInstance`].
    OiId
);
arena_id!(
    /// Handle to an [`AmorphousMedium`].
    AmId
);
arena_id!(
    /// Handle to an [`Operator`].
    OpId
);

/// A value-producing edge in the graph: one producer, any number of
/// consumers, each consumer identified as (instance, input position).
#[derive(Debug, Clone)]
pub struct Field {
    pub range: ProtoType,
    pub producer: OiId,
    pub consumers: BTreeSet<(OiId, usize)>,
    pub domain: AmId,
}

/// One use of an operator, with its input fields and single output field.
#[derive(Debug, Clone)]
pub struct OperatorInstance {
    pub op: OpId,
    pub inputs: Vec<FieldId>,
    pub output: FieldId,
}

/// A region of the graph corresponding to one function body or branch arm.
#[derive(Debug, Clone)]
pub struct AmorphousMedium {
    pub name: String,
    /// The compound operator this medium is the body of; `None` for the
    /// program's main medium.
    pub body_of: Option<OpId>,
    /// True for branch arms, which are linearized inline by the branch
    /// primitive rather than as standalone functions.
    pub branch_arm: bool,
}

/// A user-defined operator with a signature and a body medium.
#[derive(Debug, Clone)]
pub struct CompoundOp {
    pub name: String,
    pub signature: Signature,
    pub body: AmId,
}

#[derive(Debug, Clone)]
pub enum Operator {
    /// A constant; the value lives inside the type.
    Literal { value: ProtoType },
    /// A built-in with a known opcode or opcode family.
    Primitive { name: String, signature: Signature },
    /// A formal parameter of a compound operator.
    Parameter { name: String, index: usize },
    Compound(CompoundOp),
}

impl Operator {
    pub fn name(&self) -> &str {
        match self {
            Operator::Literal { .. } => "<literal>",
            Operator::Primitive { name, .. } => name,
            Operator::Parameter { name, .. } => name,
            Operator::Compound(c) => &c.name,
        }
    }
}

/// The whole program graph.
#[derive(Debug, Clone)]
pub struct Dfg {
    fields: Vec<Option<Field>>,
    ois: Vec<Option<OperatorInstance>>,
    ams: Vec<AmorphousMedium>,
    ops: Vec<Operator>,
    /// The program's result field; its domain is the main medium.
    pub output: Option<FieldId>,
    /// Media that contribute bytecode, recomputed by
    /// [`Dfg::determine_relevant`].
    pub relevant: BTreeSet<AmId>,
}

impl Dfg {
    /// Create an empty graph with a main medium.
    pub fn new() -> Self {
        let mut g = Dfg {
            fields: Vec::new(),
            ois: Vec::new(),
            ams: Vec::new(),
            ops: Vec::new(),
            output: None,
            relevant: BTreeSet::new(),
        };
        g.add_medium("main", None, false);
        g
    }

    /// The main medium (always the first one created).
    pub fn main(&self) -> AmId {
        AmId::new(0)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn field(&self, id: FieldId) -> &Field {
        self.fields[id.index()]
            .as_ref()
            .expect("field was deleted")
    }

    pub fn field_mut(&mut self, id: FieldId) -> &mut Field {
        self.fields[id.index()]
            .as_mut()
            .expect("field was deleted")
    }

    pub fn oi(&self, id: OiId) -> &OperatorInstance {
        self.ois[id.index()]
            .as_ref()
            .expect("operator instance was deleted")
    }

    pub fn oi_mut(&mut self, id: OiId) -> &mut OperatorInstance {
        self.ois[id.index()]
            .as_mut()
            .expect("operator instance was deleted")
    }

    pub fn medium(&self, id: AmId) -> &AmorphousMedium {
        &self.ams[id.index()]
    }

    pub fn medium_mut(&mut self, id: AmId) -> &mut AmorphousMedium {
        &mut self.ams[id.index()]
    }

    pub fn op(&self, id: OpId) -> &Operator {
        &self.ops[id.index()]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Operator {
        &mut self.ops[id.index()]
    }

    /// The medium an instance computes in (its output field's domain).
    pub fn oi_domain(&self, id: OiId) -> AmId {
        self.field(self.oi(id).output).domain
    }

    /// Live fields in creation order.
    pub fn live_fields(&self) -> impl Iterator<Item = (FieldId, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (FieldId::new(i), f)))
    }

    /// Live operator instances in creation order.
    pub fn live_ois(&self) -> impl Iterator<Item = (OiId, &OperatorInstance)> {
        self.ois
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().map(|o| (OiId::new(i), o)))
    }

    /// All media in creation order.
    pub fn media(&self) -> impl Iterator<Item = (AmId, &AmorphousMedium)> {
        self.ams
            .iter()
            .enumerate()
            .map(|(i, m)| (AmId::new(i), m))
    }

    /// Live fields whose domain is `am`, in creation order.
    pub fn all_fields(&self, am: AmId) -> Vec<FieldId> {
        self.live_fields()
            .filter(|(_, f)| f.domain == am)
            .map(|(id, _)| id)
            .collect()
    }

    /// Call sites of a compound operator, in creation order.
    pub fn funcalls(&self, op: OpId) -> Vec<OiId> {
        self.live_ois()
            .filter(|(_, oi)| oi.op == op)
            .map(|(id, _)| id)
            .collect()
    }

    /// True when the instance's operator is the named core primitive.
    pub fn is_core_op(&self, oi: OiId, name: &str) -> bool {
        matches!(self.op(self.oi(oi).op),
                 Operator::Primitive { name: n, .. } if n == name)
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    pub fn add_medium(&mut self, name: &str, body_of: Option<OpId>, branch_arm: bool) -> AmId {
        let id = AmId::new(self.ams.len());
        self.ams.push(AmorphousMedium {
            name: name.to_string(),
            body_of,
            branch_arm,
        });
        id
    }

    pub fn add_operator(&mut self, op: Operator) -> OpId {
        let id = OpId::new(self.ops.len());
        self.ops.push(op);
        id
    }

    /// Define a compound operator together with its (empty) body medium.
    pub fn add_compound(&mut self, name: &str, signature: Signature) -> OpId {
        let body = self.add_medium(name, None, false);
        let id = self.add_operator(Operator::Compound(CompoundOp {
            name: name.to_string(),
            signature,
            body,
        }));
        self.ams[body.index()].body_of = Some(id);
        id
    }

    /// Instantiate `op` in `domain` over `inputs`, producing a field of
    /// type `output`. Consumer sets of the inputs are updated.
    pub fn apply(
        &mut self,
        domain: AmId,
        op: OpId,
        inputs: Vec<FieldId>,
        output: ProtoType,
    ) -> FieldId {
        let oi_id = OiId::new(self.ois.len());
        let field_id = FieldId::new(self.fields.len());
        for (pos, &input) in inputs.iter().enumerate() {
            self.field_mut(input).consumers.insert((oi_id, pos));
        }
        self.fields.push(Some(Field {
            range: output,
            producer: oi_id,
            consumers: BTreeSet::new(),
            domain,
        }));
        self.ois.push(Some(OperatorInstance {
            op,
            inputs,
            output: field_id,
        }));
        field_id
    }

    /// A literal instance; the output type is the literal's own type.
    pub fn literal(&mut self, domain: AmId, value: ProtoType) -> FieldId {
        let op = self.add_operator(Operator::Literal {
            value: value.clone(),
        });
        self.apply(domain, op, Vec::new(), value)
    }

    /// Scalar-literal convenience.
    pub fn scalar(&mut self, domain: AmId, value: f32) -> FieldId {
        self.literal(domain, ProtoType::literal(value))
    }

    /// A parameter-read instance inside a compound body.
    pub fn parameter(
        &mut self,
        domain: AmId,
        name: &str,
        index: usize,
        range: ProtoType,
    ) -> FieldId {
        let op = self.add_operator(Operator::Parameter {
            name: name.to_string(),
            index,
        });
        self.apply(domain, op, Vec::new(), range)
    }

    /// A fresh primitive operator.
    pub fn primitive(&mut self, name: &str, signature: Signature) -> OpId {
        self.add_operator(Operator::Primitive {
            name: name.to_string(),
            signature,
        })
    }

    /// A lambda literal closing over `op`.
    pub fn lambda(&mut self, domain: AmId, op: OpId) -> FieldId {
        self.literal(domain, ProtoType::Lambda { op })
    }

    /// A `reference` instance: reads `value` (computed in another medium)
    /// from inside `domain`.
    pub fn reference(&mut self, domain: AmId, value: FieldId, output: ProtoType) -> FieldId {
        let op = self.primitive("reference", Signature::fixed(1, output.clone()));
        self.apply(domain, op, vec![value], output)
    }

    /// A `branch` instance selecting between the bodies of `t_op` and
    /// `f_op` (compound operators, whose bodies become the branch arms).
    pub fn branch(
        &mut self,
        domain: AmId,
        cond: FieldId,
        t_op: OpId,
        f_op: OpId,
        output: ProtoType,
    ) -> FieldId {
        for arm in [t_op, f_op] {
            if let Operator::Compound(c) = self.op(arm) {
                let body = c.body;
                self.medium_mut(body).branch_arm = true;
            }
        }
        let t_lam = self.lambda(domain, t_op);
        let f_lam = self.lambda(domain, f_op);
        let op = self.primitive("branch", Signature::fixed(3, output.clone()));
        self.apply(domain, op, vec![cond, t_lam, f_lam], output)
    }

    // ------------------------------------------------------------------
    // Graph surgery (used by the pre-emission rewrites)
    // ------------------------------------------------------------------

    /// Insert `input` at position `pos` of `oi`'s input list, shifting the
    /// consumer records of the inputs behind it.
    pub fn insert_input(&mut self, oi: OiId, pos: usize, input: FieldId) {
        let existing = self.oi(oi).inputs.clone();
        for (idx, &f) in existing.iter().enumerate().skip(pos) {
            let consumers = &mut self.field_mut(f).consumers;
            consumers.remove(&(oi, idx));
            consumers.insert((oi, idx + 1));
        }
        self.oi_mut(oi).inputs.insert(pos, input);
        self.field_mut(input).consumers.insert((oi, pos));
    }

    /// Move every consumer of `from` over to `to`.
    pub fn relocate_consumers(&mut self, from: FieldId, to: FieldId) {
        let moved = std::mem::take(&mut self.field_mut(from).consumers);
        for &(oi, pos) in &moved {
            self.oi_mut(oi).inputs[pos] = to;
        }
        self.field_mut(to).consumers.extend(moved);
    }

    /// Add a formal parameter named `name` at `index` to compound `cop`,
    /// instantiated in `am` with the type of `model`. Returns the new
    /// parameter's output field.
    pub fn add_parameter(
        &mut self,
        cop: OpId,
        name: &str,
        index: usize,
        am: AmId,
        model: FieldId,
    ) -> FieldId {
        let range = self.field(model).range.clone();
        let field = self.parameter(am, name, index, range);
        // The signature change itself (required-input prepend) is the
        // caller's decision; only sanity-check the operator kind here.
        debug_assert!(matches!(self.op(cop), Operator::Compound(_)));
        field
    }

    /// Delete an instance and its output field. Consumers of the output
    /// must have been relocated first.
    pub fn delete_oi(&mut self, id: OiId) {
        let (inputs, output) = {
            let oi = self.oi(id);
            (oi.inputs.clone(), oi.output)
        };
        for (pos, &f) in inputs.iter().enumerate() {
            if let Some(field) = &mut self.fields[f.index()] {
                field.consumers.remove(&(id, pos));
            }
        }
        debug_assert!(self.field(output).consumers.is_empty());
        self.fields[output.index()] = None;
        self.ois[id.index()] = None;
    }

    /// Recompute the set of media that contribute bytecode: the main
    /// medium plus the body of every compound operator reachable from a
    /// relevant medium, either called directly or closed over by a lambda
    /// literal.
    pub fn determine_relevant(&mut self) {
        let mut relevant = BTreeSet::new();
        let mut worklist = vec![self.main()];
        while let Some(am) = worklist.pop() {
            if !relevant.insert(am) {
                continue;
            }
            let mut found: Vec<AmId> = Vec::new();
            for (_, oi) in self.live_ois() {
                if self.field(oi.output).domain != am {
                    continue;
                }
                match self.op(oi.op) {
                    Operator::Compound(c) => found.push(c.body),
                    Operator::Literal {
                        value: ProtoType::Lambda { op },
                    } => {
                        if let Operator::Compound(c) = self.op(*op) {
                            found.push(c.body);
                        }
                    }
                    _ => {}
                }
            }
            worklist.extend(found);
        }
        self.relevant = relevant;
    }

    /// Printable form of a field, used in diagnostics.
    pub fn field_str(&self, id: FieldId) -> String {
        let f = self.field(id);
        format!(
            "f{}:{} in {} <- {}",
            id.index(),
            f.range,
            self.medium(f.domain).name,
            self.op(self.oi(f.producer).op).name(),
        )
    }
}

impl Default for Dfg {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Dfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, _) in self.live_fields() {
            writeln!(f, "{}", self.field_str(id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn apply_registers_consumers() {
        let mut g = Dfg::new();
        let main = g.main();
        let a = g.scalar(main, 1.0);
        let b = g.scalar(main, 2.0);
        let add = g.primitive("+", Signature::variadic(2, ProtoType::scalar()));
        let out = g.apply(main, add, vec![a, b], ProtoType::scalar());
        assert_eq!(g.field(a).consumers.len(), 1);
        assert_eq!(g.field(b).consumers.len(), 1);
        assert_eq!(g.oi(g.field(out).producer).inputs, vec![a, b]);
    }

    #[test]
    fn insert_input_shifts_consumer_positions() {
        let mut g = Dfg::new();
        let main = g.main();
        let a = g.scalar(main, 1.0);
        let b = g.scalar(main, 2.0);
        let c = g.scalar(main, 3.0);
        let op = g.primitive("mux", Signature::fixed(3, ProtoType::scalar()));
        let out = g.apply(main, op, vec![a, b], ProtoType::scalar());
        let oi = g.field(out).producer;
        g.insert_input(oi, 0, c);
        assert_eq!(g.oi(oi).inputs, vec![c, a, b]);
        assert!(g.field(a).consumers.contains(&(oi, 1)));
        assert!(g.field(b).consumers.contains(&(oi, 2)));
        assert!(g.field(c).consumers.contains(&(oi, 0)));
    }

    #[test]
    fn relocate_then_delete() {
        let mut g = Dfg::new();
        let main = g.main();
        let a = g.scalar(main, 1.0);
        let b = g.scalar(main, 2.0);
        let sqrt = g.primitive("sqrt", Signature::fixed(1, ProtoType::scalar()));
        let out = g.apply(main, sqrt, vec![a], ProtoType::scalar());
        let oi = g.field(out).producer;
        g.relocate_consumers(a, b);
        assert_eq!(g.oi(oi).inputs, vec![b]);
        assert!(g.field(a).consumers.is_empty());
        let a_oi = g.field(a).producer;
        g.relocate_consumers(a, a); // no-op on empty set
        g.delete_oi(a_oi);
        assert_eq!(g.live_fields().count(), 2); // b and out remain
    }

    #[test]
    fn relevant_follows_compounds_and_lambdas() {
        let mut g = Dfg::new();
        let main = g.main();
        let double = g.add_compound("double", Signature::fixed(1, ProtoType::scalar()));
        let body = match g.op(double) {
            Operator::Compound(c) => c.body,
            _ => unreachable!(),
        };
        let p = g.parameter(body, "x", 0, ProtoType::scalar());
        let add = g.primitive("+", Signature::variadic(2, ProtoType::scalar()));
        let _sum = g.apply(body, add, vec![p, p], ProtoType::scalar());
        let five = g.scalar(main, 5.0);
        let out = g.apply(main, double, vec![five], ProtoType::scalar());
        g.output = Some(out);
        g.determine_relevant();
        assert!(g.relevant.contains(&main));
        assert!(g.relevant.contains(&body));
    }
}
