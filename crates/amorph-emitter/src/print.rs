//! Chain pretty-printing and hexdump.
//!
//! The dump format is a C byte-array source fragment, the historical way
//! emitted programs are embedded into device firmware images. Three
//! compactness levels are supported; the op-debug mode annotates every
//! instruction with its resolved byte location.

use std::fmt::Write;

use crate::insn::{InsnArena, InsnId, InsnKind};
use crate::ops::OpTable;
use crate::options::PrintCompactness;

/// Render one instruction. Blocks render their contents in braces.
pub fn insn_to_string(arena: &InsnArena, table: &OpTable, id: InsnId, op_debug: bool) -> String {
    let insn = &arena[id];
    match &insn.kind {
        InsnKind::NoOp => "<No Instruction>".to_string(),
        InsnKind::Block { contents } => {
            let items: Vec<String> = arena
                .iter_chain(*contents)
                .map(|c| insn_to_string(arena, table, c, op_debug))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        InsnKind::DefVm {
            export_len,
            n_exports,
            n_globals,
            n_states,
            max_stack,
            max_env,
        } if op_debug => {
            let field = |v: &Option<u32>| v.map(|v| v as i64).unwrap_or(-1);
            format!(
                "VM Definition [ export_len:{}, n_exports:{}, n_globals:{}, n_states:{}, max_stack:{}, max_env:{} ]",
                field(export_len),
                field(n_exports),
                field(n_globals),
                field(n_states),
                field(max_stack),
                field(max_env),
            )
        }
        _ => {
            let mut out = match insn.op {
                Some(op) => table.name(op).to_string(),
                None => "<UNKNOWN OP>".to_string(),
            };
            if op_debug {
                let loc = insn.location.map(|l| l as i64).unwrap_or(-1);
                write!(out, "[{}]", loc).unwrap();
            }
            for p in &insn.params {
                write!(out, ", {}", p).unwrap();
            }
            out
        }
    }
}

/// Flatten a chain (descending into blocks) into printable items.
fn flatten(arena: &InsnArena, table: &OpTable, head: InsnId, op_debug: bool, out: &mut Vec<String>) {
    for id in arena.iter_chain(head) {
        match &arena[id].kind {
            InsnKind::Block { contents } => flatten(arena, table, *contents, op_debug, out),
            _ => out.push(insn_to_string(arena, table, id, op_debug)),
        }
    }
}

/// Render a whole program chain as a C array definition.
pub fn print_chain(
    arena: &InsnArena,
    table: &OpTable,
    root: InsnId,
    compactness: PrintCompactness,
    op_debug: bool,
) -> String {
    let mut items = Vec::new();
    flatten(arena, table, arena.chain_start(root), op_debug, &mut items);
    let body = items.join(", ");

    let mut out = String::new();
    match compactness {
        PrintCompactness::Compact => {
            write!(out, "uint8_t script[] = {{ {} }};", body).unwrap();
        }
        PrintCompactness::SemiCompact => {
            out.push_str("uint8_t script[] = { ");
            let mut line_len = out.len();
            for (i, item) in items.iter().enumerate() {
                let piece = if i + 1 < items.len() {
                    format!("{}, ", item)
                } else {
                    item.clone()
                };
                if line_len + piece.len() > 70 {
                    out.push('\n');
                    out.push_str("  ");
                    line_len = 2;
                }
                out.push_str(&piece);
                line_len += piece.len();
            }
            out.push_str(" };");
        }
        PrintCompactness::Lines => {
            out.push_str("uint8_t script[] = {\n");
            for (i, item) in items.iter().enumerate() {
                let sep = if i + 1 < items.len() { "," } else { "" };
                writeln!(out, "  {}{}", item, sep).unwrap();
            }
            out.push_str("};");
        }
    }
    let end = arena.chain_end(root);
    let len = arena.next_location(end).map(|l| l as i64).unwrap_or(-1);
    write!(out, "\nuint16_t script_len = {};", len).unwrap();
    out
}

/// Dump a byte buffer as hex, 25 bytes per line.
pub fn hexdump(buf: &[u8]) -> String {
    let mut out = String::new();
    for (i, byte) in buf.iter().enumerate() {
        write!(out, "{:02X} ", byte).unwrap();
        if i % 25 == 24 {
            out.push('\n');
        }
    }
    if !buf.is_empty() && buf.len() % 25 != 0 {
        out.push('\n');
    }
    out
}
