//! The Amorph type language, restricted to the forms that survive analysis.
//!
//! By the time a program reaches the emitter every field carries one of
//! these types, and literal fields carry their value inside the type
//! (`Scalar(Some(5.0))`). `Field` types describe neighborhood-valued data
//! and are never emittable.

use std::fmt;

use crate::dfg::OpId;

/// A concrete (or partially-known) type attached to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtoType {
    /// A number; `Some(v)` when the field is a literal with value `v`.
    Scalar(Option<f32>),
    /// A boolean-refined scalar, used by extension-op signatures.
    Boolean,
    /// A fixed-arity tuple. `bounded` is false for tuples whose length is
    /// still open; those never pass the emittability check.
    Tuple { elems: Vec<ProtoType>, bounded: bool },
    /// A first-class function value; `op` is the operator it closes over.
    Lambda { op: OpId },
    /// A symbol, used for option-style arguments to primitives.
    Symbol(Option<String>),
    /// A neighborhood field over the element type. Not emittable.
    Field(Box<ProtoType>),
}

impl ProtoType {
    /// An unvalued scalar.
    pub fn scalar() -> Self {
        ProtoType::Scalar(None)
    }

    /// A scalar literal.
    pub fn literal(value: f32) -> Self {
        ProtoType::Scalar(Some(value))
    }

    /// A bounded tuple of the given element types.
    pub fn tuple(elems: Vec<ProtoType>) -> Self {
        ProtoType::Tuple {
            elems,
            bounded: true,
        }
    }

    /// A bounded 3-vector of scalars, the shape `(vector 3)` denotes in
    /// extension-op files.
    pub fn vector3() -> Self {
        ProtoType::tuple(vec![
            ProtoType::scalar(),
            ProtoType::scalar(),
            ProtoType::scalar(),
        ])
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, ProtoType::Tuple { .. })
    }

    /// Element types of a tuple, or `None` for any other shape.
    pub fn tuple_elems(&self) -> Option<&[ProtoType]> {
        match self {
            ProtoType::Tuple { elems, .. } => Some(elems),
            _ => None,
        }
    }
}

impl fmt::Display for ProtoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoType::Scalar(Some(v)) => write!(f, "<scalar {}>", v),
            ProtoType::Scalar(None) => write!(f, "<scalar>"),
            ProtoType::Boolean => write!(f, "<boolean>"),
            ProtoType::Tuple { elems, bounded } => {
                write!(f, "<tuple")?;
                for e in elems {
                    write!(f, " {}", e)?;
                }
                if !bounded {
                    write!(f, " ...")?;
                }
                write!(f, ">")
            }
            ProtoType::Lambda { op } => write!(f, "<lambda op{}>", op.index()),
            ProtoType::Symbol(Some(s)) => write!(f, "<symbol {}>", s),
            ProtoType::Symbol(None) => write!(f, "<symbol>"),
            ProtoType::Field(t) => write!(f, "<field {}>", t),
        }
    }
}

/// An operator's calling convention: fixed inputs, optional inputs, and an
/// optional rest input that absorbs any remaining arguments as a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub required_inputs: Vec<ProtoType>,
    pub optional_inputs: Vec<ProtoType>,
    pub rest_input: Option<ProtoType>,
    pub output: ProtoType,
}

impl Signature {
    /// A signature with `n` required scalar inputs and the given output.
    pub fn fixed(n: usize, output: ProtoType) -> Self {
        Signature {
            required_inputs: vec![ProtoType::scalar(); n],
            optional_inputs: Vec::new(),
            rest_input: None,
            output,
        }
    }

    /// A signature taking any number of scalar arguments.
    pub fn variadic(required: usize, output: ProtoType) -> Self {
        Signature {
            required_inputs: vec![ProtoType::scalar(); required],
            optional_inputs: Vec::new(),
            rest_input: Some(ProtoType::scalar()),
            output,
        }
    }

    /// Number of fixed (required + optional) inputs.
    pub fn n_fixed(&self) -> usize {
        self.required_inputs.len() + self.optional_inputs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfg::Dfg;

    #[test]
    fn tuple_accessors() {
        let t = ProtoType::tuple(vec![ProtoType::literal(1.0), ProtoType::literal(2.0)]);
        assert!(t.is_tuple());
        assert_eq!(t.tuple_elems().unwrap().len(), 2);
        assert!(!ProtoType::scalar().is_tuple());
    }

    #[test]
    fn display_forms() {
        assert_eq!(ProtoType::literal(5.0).to_string(), "<scalar 5>");
        let t = ProtoType::Tuple {
            elems: vec![ProtoType::scalar()],
            bounded: false,
        };
        assert_eq!(t.to_string(), "<tuple <scalar> ...>");
    }

    #[test]
    fn n_fixed_counts_optionals() {
        let mut s = Signature::fixed(2, ProtoType::scalar());
        s.optional_inputs.push(ProtoType::scalar());
        assert_eq!(s.n_fixed(), 3);
    }
}
