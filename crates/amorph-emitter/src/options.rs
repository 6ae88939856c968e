//! Emitter configuration.
//!
//! Options arrive as a free-form key-value bag from the driver; the
//! recognized keys are extracted here and everything else is ignored, so
//! drivers can share one bag across all compiler stages.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// A free-form switch bag. Keys are stored without any leading dashes.
#[derive(Debug, Clone, Default)]
pub struct ArgBag {
    entries: BTreeMap<String, String>,
}

impl ArgBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a valueless switch.
    pub fn flag(mut self, key: &str) -> Self {
        self.entries.insert(key.to_string(), String::new());
        self
    }

    /// Set a valued switch.
    pub fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.entries.insert(key.to_string(), value.to_string());
        self
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key)?.parse().ok()
    }
}

/// How verbose the pretty-printer is: one instruction per line, 70-char
/// wrapped lines, or everything on a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintCompactness {
    #[default]
    Lines,
    SemiCompact,
    Compact,
}

/// Resolved emitter options.
#[derive(Debug, Clone)]
pub struct EmitterOptions {
    /// Diagnostic verbosity, 0-5.
    pub verbosity: u8,
    /// Outer fixed-point iteration cap.
    pub max_loops: u32,
    /// Enable extra resolution checks.
    pub paranoid: bool,
    /// Annotate printed instructions with their byte locations.
    pub op_debug: bool,
    /// Pretty-print compactness for code dumps.
    pub print_compact: PrintCompactness,
    /// Dump the output buffer as hex lines of 25 bytes.
    pub dump_hex: bool,
    /// Extension opcode files to load after the core table.
    pub extension_op_files: Vec<PathBuf>,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        EmitterOptions {
            verbosity: 0,
            max_loops: 10,
            paranoid: false,
            op_debug: false,
            print_compact: PrintCompactness::Lines,
            dump_hex: false,
            extension_op_files: Vec::new(),
        }
    }
}

impl EmitterOptions {
    /// Extract the recognized switches from an argument bag.
    pub fn from_args(args: &ArgBag) -> Self {
        let mut options = EmitterOptions::default();
        if let Some(v) = args.get_int("emitter-verbosity") {
            options.verbosity = v.clamp(0, 5) as u8;
        }
        if let Some(v) = args.get_int("emitter-max-loops") {
            options.max_loops = v.max(1) as u32;
        }
        options.paranoid = args.has("emitter-paranoid");
        options.op_debug = args.has("emitter-op-debug");
        options.dump_hex = args.has("hexdump");
        options.print_compact = if args.has("emit-compact") {
            PrintCompactness::Compact
        } else if args.has("emit-semicompact") {
            PrintCompactness::SemiCompact
        } else {
            PrintCompactness::Lines
        };
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let o = EmitterOptions::default();
        assert_eq!(o.max_loops, 10);
        assert_eq!(o.verbosity, 0);
        assert_eq!(o.print_compact, PrintCompactness::Lines);
    }

    #[test]
    fn from_args_extracts_known_switches() {
        let bag = ArgBag::new()
            .flag("emit-compact")
            .flag("hexdump")
            .set("emitter-verbosity", 3)
            .set("emitter-max-loops", 25);
        let o = EmitterOptions::from_args(&bag);
        assert_eq!(o.print_compact, PrintCompactness::Compact);
        assert!(o.dump_hex);
        assert_eq!(o.verbosity, 3);
        assert_eq!(o.max_loops, 25);
        assert!(!o.paranoid);
    }
}
