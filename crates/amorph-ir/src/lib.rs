//! Amorph IR - typed dataflow graph
//!
//! The intermediate representation handed to the bytecode emitter after
//! parsing, type propagation, and analysis: a graph of operator instances
//! connected by fields, partitioned into amorphous media (one per function
//! body or branch arm).

pub mod dfg;
pub mod types;

pub use dfg::{
    AmId, AmorphousMedium, CompoundOp, Dfg, Field, FieldId, OiId, OpId, Operator,
    OperatorInstance,
};
pub use types::{ProtoType, Signature};
