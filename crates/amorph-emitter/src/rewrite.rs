//! Emittability checking and the pre-linearization graph rewrites.
//!
//! Both rewrites reshape the graph the linearizer will consume: value
//! references inside non-branch function bodies become formal parameters
//! threaded through every call site, and lambda literals holding a bare
//! primitive get wrapped in a compound operator so they can be invoked
//! uniformly.

use amorph_ir::{Dfg, OiId, Operator, ProtoType};
use tracing::debug;

use crate::diag::EmitError;

/// Every field must be local and concrete before linearization.
pub fn check_emittable(g: &Dfg) -> Result<(), EmitError> {
    for (id, field) in g.live_fields() {
        if !acceptable(&field.range) {
            return Err(EmitError::NotEmittable {
                field: g.field_str(id),
            });
        }
    }
    Ok(())
}

fn acceptable(t: &ProtoType) -> bool {
    match t {
        ProtoType::Scalar(_) | ProtoType::Boolean | ProtoType::Symbol(_) => true,
        ProtoType::Tuple { elems, bounded } => *bounded && elems.iter().all(acceptable),
        // Operators reaching this point are literals, parameters,
        // primitives, or compounds, all of which emit.
        ProtoType::Lambda { .. } => true,
        ProtoType::Field(_) => false,
    }
}

/// Turn every `reference` operator inside a non-branch function body into
/// an added formal parameter of the enclosing compound operator, threading
/// the referenced value through every call site.
pub fn reference_to_parameter(g: &mut Dfg) -> Result<(), EmitError> {
    let candidates: Vec<OiId> = g
        .live_ois()
        .map(|(id, _)| id)
        .filter(|&id| g.is_core_op(id, "reference") && !g.medium(g.oi_domain(id)).branch_arm)
        .collect();

    for oi in candidates {
        let am = g.oi_domain(oi);
        let cop = g
            .medium(am)
            .body_of
            .ok_or_else(|| EmitError::internal("reference outside a function body"))?;
        if g.oi(oi).inputs.len() != 1 {
            return Err(EmitError::internal("bad number of reference inputs"));
        }
        let input = g.oi(oi).inputs[0];

        let (fn_name, num_params) = match g.op(cop) {
            Operator::Compound(c) => (c.name.clone(), c.signature.n_fixed()),
            _ => return Err(EmitError::internal("function body of a non-compound")),
        };

        // Grow the signature and every call site by the referenced value.
        let input_ty = g.field(input).range.clone();
        if let Operator::Compound(c) = g.op_mut(cop) {
            c.signature.required_inputs.insert(0, input_ty);
        }
        for call in g.funcalls(cop) {
            g.insert_input(call, 0, input);
        }

        // Replace the reference by a fresh parameter.
        let param_name = format!("__{}_{}__", fn_name, num_params);
        debug!(
            function = %fn_name,
            parameter = %param_name,
            "lifting reference to parameter"
        );
        let output = g.oi(oi).output;
        let param = g.add_parameter(cop, &param_name, num_params, am, input);
        g.relocate_consumers(output, param);
        g.delete_oi(oi);
    }
    Ok(())
}

/// Wrap lambda literals over bare primitives in synthesized compound
/// operators, then recompute the relevant media so the new bodies emit.
pub fn primitive_to_compound(g: &mut Dfg) -> Result<(), EmitError> {
    let candidates: Vec<OiId> = g
        .live_ois()
        .filter(|(_, oi)| {
            matches!(
                g.op(oi.op),
                Operator::Literal {
                    value: ProtoType::Lambda { op }
                } if matches!(g.op(*op), Operator::Primitive { .. })
            )
        })
        .map(|(id, _)| id)
        .collect();

    for oi in candidates {
        let literal_op = g.oi(oi).op;
        let primitive = match g.op(literal_op) {
            Operator::Literal {
                value: ProtoType::Lambda { op },
            } => *op,
            _ => continue,
        };
        let (name, mut signature) = match g.op(primitive) {
            Operator::Primitive { name, signature } => (name.clone(), signature.clone()),
            _ => continue,
        };

        // An n-ary primitive with no fixed inputs becomes a two-parameter
        // wrapper, the shape fold-style consumers invoke it with.
        let mut n = signature.required_inputs.len();
        if n == 0 {
            if let Some(rest) = signature.rest_input.clone() {
                signature.required_inputs = vec![rest.clone(), rest];
                n = 2;
            }
        }

        debug!(primitive = %name, params = n, "wrapping primitive in a compound");
        let cop = g.add_compound(&format!("{}~lambda", name), signature.clone());
        let body = match g.op(cop) {
            Operator::Compound(c) => c.body,
            _ => unreachable!("add_compound returns a compound"),
        };
        let mut params = Vec::with_capacity(n);
        for i in 0..n {
            let ty = signature.required_inputs[i].clone();
            params.push(g.parameter(body, &format!("{}~{}", name, i), i, ty));
        }
        let output = signature.output.clone();
        g.apply(body, primitive, params, output);

        // Point the lambda (operator and field type both) at the wrapper.
        if let Operator::Literal {
            value: ProtoType::Lambda { op },
        } = g.op_mut(literal_op)
        {
            *op = cop;
        }
        let out_field = g.oi(oi).output;
        g.field_mut(out_field).range = ProtoType::Lambda { op: cop };
    }

    // New compound operators mean new relevant media.
    g.determine_relevant();
    Ok(())
}
