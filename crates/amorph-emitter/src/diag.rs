//! Diagnostics and error types.
//!
//! Two channels, mirroring the two failure classes of the emitter:
//! recoverable input problems (bad opcode-table entries) flow through
//! [`Diagnostic`] values that are collected and reported without stopping
//! the surrounding work, while everything else is an [`EmitError`] that
//! aborts the emission run.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sexpr::SexprError;

/// Severity of a collected diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "error"),
            DiagnosticLevel::Warning => write!(f, "warning"),
        }
    }
}

/// A collected input diagnostic, reported against the offending form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    /// Printed form of the S-expression (or other input) at fault.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            level: DiagnosticLevel::Error,
            message: message.into(),
            context: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic {
            level: DiagnosticLevel::Warning,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.message)?;
        if let Some(context) = &self.context {
            write!(f, " (in {})", context)?;
        }
        Ok(())
    }
}

/// Failure to load or interpret an opcode table.
#[derive(Debug, Error)]
pub enum OpTableError {
    #[error("can't open op file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("can't read op file: {0}")]
    Parse(#[from] SexprError),
    #[error("op file not a list")]
    NotAList,
    #[error("op table defines no opcode named {0}")]
    MissingOp(String),
    #[error("opcode family {0} is not contiguous in the op table")]
    BrokenFamily(String),
}

/// Fatal emission failure.
#[derive(Debug, Error)]
pub enum EmitError {
    /// A field's type is not local and concrete.
    #[error("type is not resolved to emittable form: {field}")]
    NotEmittable { field: String },
    #[error(transparent)]
    OpTable(#[from] OpTableError),
    /// A structural impossibility; these indicate a bug upstream of the
    /// emitter or inside it, never a user error.
    #[error("internal emitter error: {message}")]
    Internal { message: String },
    /// Resolution failure, carrying a dump of the instruction chain for
    /// post-mortem reading.
    #[error("internal emitter error: {message}\n{chain}")]
    Resolution { message: String, chain: String },
}

impl EmitError {
    pub fn internal(message: impl Into<String>) -> Self {
        EmitError::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_display_and_json() {
        let d = Diagnostic::warning("op not a list").with_context("(LIT_0_OP)");
        assert_eq!(d.to_string(), "warning: op not a list (in (LIT_0_OP))");
        let json = d.to_json().unwrap();
        assert!(json.contains("\"warning\""));
    }

    #[test]
    fn emit_error_messages() {
        let e = EmitError::internal("tuple too large: 300 > 255");
        assert!(e.to_string().contains("tuple too large"));
    }
}
