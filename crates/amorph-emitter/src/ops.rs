//! Opcode tables.
//!
//! The VM's instruction set is not baked into this crate: it is loaded
//! from an S-expression table (`core.ops`, embedded) where an opcode's
//! number is its position in the list. Platform and layer plugins can
//! extend the table with `defop` forms. The emitter itself only needs a
//! fixed set of well-known ops, resolved once by name into [`CoreOps`].

use std::collections::BTreeMap;
use std::path::Path;

use amorph_ir::{ProtoType, Signature};
use tracing::debug;

use crate::diag::{Diagnostic, OpTableError};
use crate::sexpr::{self, SExpr};

/// The built-in core opcode table.
pub const CORE_OPS: &str = include_str!("core.ops");

/// A VM opcode. The table is capped at 256 entries by the bytecode format.
pub type Opcode = u8;

/// Stack effect of an opcode as declared in the table. `Variable` ops get
/// their effect from the emitter at each use site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackDelta {
    Fixed(i32),
    Variable,
}

/// A contiguous run of opcodes encoding a small immediate `k` in the
/// opcode itself: `base` encodes `k = first`, `base + 1` encodes
/// `k = first + 1`, and so on.
#[derive(Debug, Clone, Copy)]
pub struct OpFamily {
    pub base: Opcode,
    pub first: u8,
    pub count: u8,
}

impl OpFamily {
    /// Whether `k` has a short-immediate form in this family.
    pub fn contains(&self, k: usize) -> bool {
        k >= self.first as usize && k < self.first as usize + self.count as usize
    }

    /// The opcode encoding `k`. Caller must have checked `contains`.
    pub fn op(&self, k: usize) -> Opcode {
        debug_assert!(self.contains(k));
        self.base + (k - self.first as usize) as Opcode
    }

    /// One past the largest encodable `k`.
    pub fn limit(&self) -> usize {
        self.first as usize + self.count as usize
    }
}

/// The well-known ops the emitter generates directly, resolved by name.
#[derive(Debug, Clone, Copy)]
pub struct CoreOps {
    pub def_vm: Opcode,
    pub exit: Opcode,
    pub ret: Opcode,
    pub all: Opcode,
    pub def_fun: Opcode,
    pub def_fun16: Opcode,
    pub def_fun_k: OpFamily,
    pub if_op: Opcode,
    pub if16: Opcode,
    pub jmp: Opcode,
    pub jmp16: Opcode,
    pub lit_flo: Opcode,
    pub lit8: Opcode,
    pub lit16: Opcode,
    pub lit_k: OpFamily,
    pub nul_tup: Opcode,
    pub def_tup: Opcode,
    pub tup: Opcode,
    pub def_num_vec: Opcode,
    pub def_num_vec_k: OpFamily,
    pub let_k: OpFamily,
    pub pop_let: Opcode,
    pub pop_let_k: OpFamily,
    pub ref_op: Opcode,
    pub ref_k: OpFamily,
    pub glo_ref: Opcode,
    pub glo_ref16: Opcode,
    pub glo_ref_k: OpFamily,
    pub funcall_k: OpFamily,
    pub mul: Opcode,
    pub div: Opcode,
    pub vmul: Opcode,
}

impl CoreOps {
    pub fn resolve(table: &OpTable) -> Result<Self, OpTableError> {
        Ok(CoreOps {
            def_vm: table.opcode("DEF_VM_OP")?,
            exit: table.opcode("EXIT_OP")?,
            ret: table.opcode("RET_OP")?,
            all: table.opcode("ALL_OP")?,
            def_fun: table.opcode("DEF_FUN_OP")?,
            def_fun16: table.opcode("DEF_FUN16_OP")?,
            def_fun_k: table.family("DEF_FUN", 2)?,
            if_op: table.opcode("IF_OP")?,
            if16: table.opcode("IF_16_OP")?,
            jmp: table.opcode("JMP_OP")?,
            jmp16: table.opcode("JMP_16_OP")?,
            lit_flo: table.opcode("LIT_FLO_OP")?,
            lit8: table.opcode("LIT8_OP")?,
            lit16: table.opcode("LIT16_OP")?,
            lit_k: table.family("LIT", 0)?,
            nul_tup: table.opcode("NUL_TUP_OP")?,
            def_tup: table.opcode("DEF_TUP_OP")?,
            tup: table.opcode("TUP_OP")?,
            def_num_vec: table.opcode("DEF_NUM_VEC_OP")?,
            def_num_vec_k: table.family("DEF_NUM_VEC", 1)?,
            let_k: table.family("LET", 1)?,
            pop_let: table.opcode("POP_LET_OP")?,
            pop_let_k: table.family("POP_LET", 1)?,
            ref_op: table.opcode("REF_OP")?,
            ref_k: table.family("REF", 0)?,
            glo_ref: table.opcode("GLO_REF_OP")?,
            glo_ref16: table.opcode("GLO_REF16_OP")?,
            glo_ref_k: table.family("GLO_REF", 0)?,
            funcall_k: table.family("FUNCALL", 0)?,
            mul: table.opcode("MUL_OP")?,
            div: table.opcode("DIV_OP")?,
            vmul: table.opcode("VMUL_OP")?,
        })
    }
}

/// The loaded opcode table plus the primitive and scalar/vector mappings
/// derived from it.
#[derive(Debug, Clone, Default)]
pub struct OpTable {
    names: Vec<String>,
    deltas: Vec<StackDelta>,
    primitive2op: BTreeMap<String, Opcode>,
    sv_ops: BTreeMap<String, (Opcode, Opcode)>,
    ext_signatures: BTreeMap<String, Signature>,
    diagnostics: Vec<Diagnostic>,
}

impl OpTable {
    /// Load the built-in core table.
    pub fn core() -> Result<Self, OpTableError> {
        Self::from_source(CORE_OPS)
    }

    /// Load a table from `.ops` source text.
    pub fn from_source(src: &str) -> Result<Self, OpTableError> {
        let datum = sexpr::parse(src)?;
        let entries = datum.as_list().ok_or(OpTableError::NotAList)?;
        let mut table = OpTable::default();
        for entry in entries {
            table.load_entry(entry);
        }
        table.wire_sv_ops()?;
        debug!(ops = table.names.len(), "loaded opcode table");
        Ok(table)
    }

    fn load_entry(&mut self, entry: &SExpr) {
        // Every entry occupies a slot (the opcode number is positional),
        // valid or not.
        let slot_name;
        let slot_delta;
        match Self::parse_entry(entry) {
            Ok((name, delta, primitive)) => {
                if let Some(p) = primitive {
                    self.primitive2op.insert(p, self.names.len() as Opcode);
                }
                slot_name = name;
                slot_delta = delta;
            }
            Err(diag) => {
                self.diagnostics.push(diag.with_context(entry.to_string()));
                slot_name = String::new();
                slot_delta = StackDelta::Fixed(0);
            }
        }
        self.names.push(slot_name);
        self.deltas.push(slot_delta);
    }

    fn parse_entry(entry: &SExpr) -> Result<(String, StackDelta, Option<String>), Diagnostic> {
        let items = entry
            .as_list()
            .ok_or_else(|| Diagnostic::warning("op not a list"))?;
        let name = items
            .first()
            .and_then(SExpr::as_symbol)
            .ok_or_else(|| Diagnostic::warning("op not formatted (name stack-delta [primitive])"))?;
        if items.len() != 2 && items.len() != 3 {
            return Err(Diagnostic::warning(
                "op not formatted (name stack-delta [primitive])",
            ));
        }
        let delta = match &items[1] {
            SExpr::Scalar(v) => StackDelta::Fixed(*v as i32),
            s if s.is("variable") => StackDelta::Variable,
            _ => return Err(Diagnostic::warning("invalid stack delta")),
        };
        let primitive = match items.get(2) {
            None => None,
            Some(SExpr::Symbol(p)) => Some(p.clone()),
            Some(_) => {
                return Err(Diagnostic::warning(
                    "op not formatted (name stack-delta [primitive])",
                ))
            }
        };
        Ok((name.to_string(), delta, primitive))
    }

    /// Wire the scalar/vector paired ops. These are structural knowledge
    /// of the emitter, not table data, but the opcodes come from the table.
    fn wire_sv_ops(&mut self) -> Result<(), OpTableError> {
        let pairs: &[(&str, &str, &str)] = &[
            ("+", "ADD_OP", "VADD_OP"),
            ("-", "SUB_OP", "VSUB_OP"),
            ("*", "MUL_OP", "VMUL_OP"),
            ("<", "LT_OP", "VLT_OP"),
            ("<=", "LTE_OP", "VLTE_OP"),
            (">", "GT_OP", "VGT_OP"),
            (">=", "GTE_OP", "VGTE_OP"),
            ("=", "EQ_OP", "VEQ_OP"),
            ("max", "MAX_OP", "VMAX_OP"),
            ("min", "MIN_OP", "VMIN_OP"),
            ("mux", "MUX_OP", "VMUX_OP"),
        ];
        for (name, scalar, vector) in pairs {
            let pair = (self.opcode(scalar)?, self.opcode(vector)?);
            self.sv_ops.insert(name.to_string(), pair);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// The table name of an opcode, or `<UNKNOWN OP>`.
    pub fn name(&self, op: Opcode) -> &str {
        match self.names.get(op as usize) {
            Some(n) if !n.is_empty() => n,
            _ => "<UNKNOWN OP>",
        }
    }

    /// Resolve a name to its opcode.
    pub fn opcode(&self, name: &str) -> Result<Opcode, OpTableError> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| i as Opcode)
            .ok_or_else(|| OpTableError::MissingOp(name.to_string()))
    }

    pub fn stack_delta(&self, op: Opcode) -> StackDelta {
        self.deltas
            .get(op as usize)
            .copied()
            .unwrap_or(StackDelta::Fixed(0))
    }

    /// Opcode for a plain primitive, if the table maps one.
    pub fn primitive_op(&self, primitive: &str) -> Option<Opcode> {
        self.primitive2op.get(primitive).copied()
    }

    /// Scalar/vector opcode pair for an arithmetic primitive.
    pub fn sv_pair(&self, primitive: &str) -> Option<(Opcode, Opcode)> {
        self.sv_ops.get(primitive).copied()
    }

    /// Whether `op` is the vector form of a paired op (these carry a
    /// destination-global operand byte).
    pub fn is_vector_op(&self, op: Opcode) -> bool {
        self.sv_ops.values().any(|&(_, vector)| vector == op)
    }

    /// Signature registered by a `defop`, for front-end binding.
    pub fn extension_signature(&self, primitive: &str) -> Option<&Signature> {
        self.ext_signatures.get(primitive)
    }

    /// Diagnostics collected while loading; loading continues past bad
    /// entries, so these are advisory.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Locate the contiguous short-immediate family `<stem>_<k>_OP`
    /// starting at `k = first`.
    pub fn family(&self, stem: &str, first: u8) -> Result<OpFamily, OpTableError> {
        let base = self.opcode(&format!("{}_{}_OP", stem, first))?;
        let mut count: u8 = 1;
        loop {
            let k = first as usize + count as usize;
            let name = format!("{}_{}_OP", stem, k);
            match self.names.get(base as usize + count as usize) {
                Some(n) if *n == name => count += 1,
                _ => {
                    // The next k must not exist elsewhere in the table; a
                    // gap would break opcode arithmetic.
                    if self.opcode(&name).is_ok() {
                        return Err(OpTableError::BrokenFamily(stem.to_string()));
                    }
                    break;
                }
            }
        }
        Ok(OpFamily { base, first, count })
    }

    // ------------------------------------------------------------------
    // Extension ops
    // ------------------------------------------------------------------

    /// Load a platform/layer extension file containing `defop` forms.
    pub fn load_extension_file(&mut self, path: &Path) -> Result<(), OpTableError> {
        let src = std::fs::read_to_string(path).map_err(|source| OpTableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.set_defops(&src)
    }

    /// Process `defop` forms from in-memory source: either a single
    /// `(defop ...)` or `(all (defop ...) ...)`.
    pub fn set_defops(&mut self, src: &str) -> Result<(), OpTableError> {
        let datum = sexpr::parse(src)?;
        self.process_extension_ops(&datum);
        Ok(())
    }

    fn process_extension_ops(&mut self, datum: &SExpr) {
        let Some(items) = datum.as_list() else {
            self.diagnostics.push(
                Diagnostic::warning("op extension file not a list").with_context(datum.to_string()),
            );
            return;
        };
        match items.first() {
            Some(head) if head.is("all") => {
                for item in &items[1..] {
                    self.process_extension_op(item);
                }
            }
            Some(_) => self.process_extension_op(datum),
            None => self
                .diagnostics
                .push(Diagnostic::warning("invalid op extension file")),
        }
    }

    fn process_extension_op(&mut self, form: &SExpr) {
        if let Err(diag) = self.try_extension_op(form) {
            self.diagnostics.push(diag.with_context(form.to_string()));
        }
    }

    fn try_extension_op(&mut self, form: &SExpr) -> Result<(), Diagnostic> {
        let items = form
            .as_list()
            .filter(|items| items.first().is_some_and(|h| h.is("defop")))
            .ok_or_else(|| Diagnostic::warning("invalid extension op"))?;
        if items.len() < 4 {
            return Err(Diagnostic::warning("defop has too few arguments"));
        }

        let opcode = match &items[1] {
            SExpr::Scalar(v) => *v as usize,
            s if s.is("?") => self.names.len(),
            SExpr::Symbol(name) => match self.primitive2op.get(name) {
                Some(op) => *op as usize,
                None => return Err(Diagnostic::warning(format!("unknown opcode: {}", name))),
            },
            _ => return Err(Diagnostic::warning("defop op not symbol or number")),
        };
        if opcode > Opcode::MAX as usize {
            return Err(Diagnostic::warning(format!(
                "opcode {} out of range",
                opcode
            )));
        }

        let name = items[2]
            .as_symbol()
            .ok_or_else(|| Diagnostic::warning("defop name not symbol"))?
            .to_string();

        let output = parse_paleotype(&items[3])?;
        let mut required_inputs = Vec::new();
        for arg in &items[4..] {
            required_inputs.push(parse_paleotype(arg)?);
        }
        let nargs = required_inputs.len();

        while self.names.len() <= opcode {
            self.names.push(String::new());
            self.deltas.push(StackDelta::Fixed(0));
        }
        self.names[opcode] = name.clone();
        self.deltas[opcode] = StackDelta::Fixed(1 - nargs as i32);
        self.primitive2op.insert(name.clone(), opcode as Opcode);
        self.ext_signatures.insert(
            name,
            Signature {
                required_inputs,
                optional_inputs: Vec::new(),
                rest_input: None,
                output,
            },
        );
        Ok(())
    }
}

/// Parse a `defop` argument type: `scalar`, `boolean`, or `(vector 3)`.
fn parse_paleotype(sexpr: &SExpr) -> Result<ProtoType, Diagnostic> {
    match sexpr {
        SExpr::List(items) => {
            let ok = items.len() == 2
                && items[0].is("vector")
                && items[1].as_scalar() == Some(3.0);
            if !ok {
                return Err(Diagnostic::warning("invalid compound paleotype"));
            }
            Ok(ProtoType::vector3())
        }
        SExpr::Symbol(s) if s == "scalar" => Ok(ProtoType::scalar()),
        SExpr::Symbol(s) if s == "boolean" => Ok(ProtoType::Boolean),
        SExpr::Symbol(s) => Err(Diagnostic::warning(format!(
            "unknown primitive type: {}",
            s
        ))),
        _ => Err(Diagnostic::warning("invalid paleotype")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn core_table_loads_cleanly() {
        let table = OpTable::core().unwrap();
        assert!(table.diagnostics().is_empty());
        assert!(table.len() > 60);
        assert_eq!(table.name(0), "DEF_VM_OP");
        assert_eq!(table.opcode("EXIT_OP").unwrap(), 1);
        assert_eq!(table.primitive_op("sqrt"), Some(table.opcode("SQRT_OP").unwrap()));
        assert_eq!(table.stack_delta(table.opcode("ADD_OP").unwrap()), StackDelta::Fixed(-1));
        assert_eq!(table.stack_delta(table.opcode("ALL_OP").unwrap()), StackDelta::Variable);
    }

    #[test]
    fn core_ops_resolve() {
        let table = OpTable::core().unwrap();
        let core = CoreOps::resolve(&table).unwrap();
        assert_eq!(core.lit_k.first, 0);
        assert_eq!(core.lit_k.count, 5);
        assert!(core.lit_k.contains(4));
        assert!(!core.lit_k.contains(5));
        assert_eq!(core.def_fun_k.first, 2);
        assert_eq!(
            table.name(core.def_fun_k.op(3)),
            "DEF_FUN_3_OP"
        );
        assert_eq!(core.funcall_k.limit(), 8);
        // "+" is wired as a scalar/vector pair, not a plain primitive.
        assert!(table.primitive_op("+").is_none());
        assert_eq!(
            table.sv_pair("+").unwrap(),
            (table.opcode("ADD_OP").unwrap(), table.opcode("VADD_OP").unwrap())
        );
    }

    #[test]
    fn malformed_entries_are_skipped_with_diagnostics() {
        let table = OpTable::from_source(
            "((GOOD_OP 0) bad (ALSO_BAD) (NEXT_OP 1)\
             (ADD_OP -1) (VADD_OP -1) (SUB_OP -1) (VSUB_OP -1) (MUL_OP -1) (VMUL_OP -1)\
             (LT_OP -1) (VLT_OP -1) (LTE_OP -1) (VLTE_OP -1) (GT_OP -1) (VGT_OP -1)\
             (GTE_OP -1) (VGTE_OP -1) (EQ_OP -1) (VEQ_OP -1) (MAX_OP -1) (VMAX_OP -1)\
             (MIN_OP -1) (VMIN_OP -1) (MUX_OP -2) (VMUX_OP -2))",
        )
        .unwrap();
        assert_eq!(table.diagnostics().len(), 2);
        // Bad entries still occupy their opcode slots.
        assert_eq!(table.opcode("NEXT_OP").unwrap(), 3);
        assert_eq!(table.name(1), "<UNKNOWN OP>");
    }

    #[test]
    fn missing_sv_op_fails_load() {
        let err = OpTable::from_source("((ADD_OP -1))").unwrap_err();
        assert!(matches!(err, OpTableError::MissingOp(_)));
    }

    #[test]
    fn defop_extends_the_table() {
        let mut table = OpTable::core().unwrap();
        let before = table.len();
        table
            .set_defops("(all (defop ? brightness scalar scalar) (defop ? flip (vector 3) (vector 3)))")
            .unwrap();
        assert_eq!(table.len(), before + 2);
        let op = table.primitive_op("brightness").unwrap();
        assert_eq!(op as usize, before);
        assert_eq!(table.stack_delta(op), StackDelta::Fixed(0));
        let sig = table.extension_signature("flip").unwrap();
        assert!(sig.output.is_tuple());
        assert_eq!(sig.required_inputs.len(), 1);
    }

    #[test]
    fn bad_defops_warn_and_are_skipped() {
        let mut table = OpTable::core().unwrap();
        let before = table.len();
        table.set_defops("(defop ? broken wibble)").unwrap();
        assert_eq!(table.len(), before);
        assert_eq!(table.diagnostics().len(), 1);
        table.set_defops("(defop twelve thing scalar)").unwrap();
        assert_eq!(table.diagnostics().len(), 2);
    }

    #[test]
    fn defop_can_overlay_an_existing_primitive() {
        let mut table = OpTable::core().unwrap();
        let sqrt = table.primitive_op("sqrt").unwrap();
        table.set_defops("(defop sqrt sqrt scalar scalar)").unwrap();
        assert_eq!(table.primitive_op("sqrt"), Some(sqrt));
        assert_eq!(table.stack_delta(sqrt), StackDelta::Fixed(0));
    }
}
