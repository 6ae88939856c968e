//! Bytecode disassembler.
//!
//! Converts an emitted byte buffer back to readable form against a loaded
//! opcode table. Used for debugging and for tests that assert on opcode
//! families rather than raw numbers.

use std::fmt::Write;

use crate::ops::{CoreOps, OpTable, Opcode};

/// Operand bytes following `op`.
fn operand_width(op: Opcode, table: &OpTable, core: &CoreOps) -> usize {
    if op == core.def_vm {
        8
    } else if op == core.lit_flo {
        4
    } else if op == core.lit16
        || op == core.def_fun16
        || op == core.glo_ref16
        || op == core.if16
        || op == core.jmp16
    {
        2
    } else if op == core.tup {
        // Destination global plus element count.
        2
    } else if op == core.lit8
        || op == core.def_fun
        || op == core.def_tup
        || op == core.def_num_vec
        || op == core.pop_let
        || op == core.ref_op
        || op == core.glo_ref
        || op == core.if_op
        || op == core.jmp
        || op == core.all
        || table.is_vector_op(op)
        || table.opcode("LET_OP").ok() == Some(op)
    {
        1
    } else {
        0
    }
}

/// Disassemble to `offset  NAME operands...` lines.
///
/// # Format
/// ```text
/// 0000  DEF_VM_OP 0 0 0 0 0 2 0 0
/// 0009  DEF_FUN_2_OP
/// 0010  LIT_1_OP
/// 0011  RET_OP
/// 0012  EXIT_OP
/// ```
pub fn disassemble(buf: &[u8], table: &OpTable, core: &CoreOps) -> String {
    let mut out = String::new();
    let mut offset = 0;
    while offset < buf.len() {
        let start = offset;
        let op = buf[offset];
        offset += 1;
        let name = table.name(op);
        if name == "<UNKNOWN OP>" {
            writeln!(out, "{:04}  <invalid opcode: {:#04x}>", start, op).unwrap();
            continue;
        }
        write!(out, "{:04}  {}", start, name).unwrap();
        let width = operand_width(op, table, core);
        for _ in 0..width {
            if offset < buf.len() {
                write!(out, " {}", buf[offset]).unwrap();
                offset += 1;
            }
        }
        out.push('\n');
    }
    out
}

/// Just the opcode names, in stream order. Operand bytes are skipped;
/// unknown opcodes become `<invalid>` entries.
pub fn opcode_names(buf: &[u8], table: &OpTable, core: &CoreOps) -> Vec<String> {
    let mut names = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let op = buf[offset];
        offset += 1;
        let name = table.name(op);
        if name == "<UNKNOWN OP>" {
            names.push("<invalid>".to_string());
            continue;
        }
        names.push(name.to_string());
        offset += operand_width(op, table, core);
    }
    names
}
