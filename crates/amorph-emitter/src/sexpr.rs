//! Minimal S-expression reader for opcode-definition files.
//!
//! The grammar is deliberately small: lists, symbols, and numbers, with
//! `;` line comments. That covers both the `.ops` table format and the
//! `defop` extension format.

use std::fmt;

use thiserror::Error;

/// A parsed datum.
#[derive(Debug, Clone, PartialEq)]
pub enum SExpr {
    Symbol(String),
    Scalar(f64),
    List(Vec<SExpr>),
}

impl SExpr {
    pub fn is_list(&self) -> bool {
        matches!(self, SExpr::List(_))
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            SExpr::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SExpr::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[SExpr]> {
        match self {
            SExpr::List(items) => Some(items),
            _ => None,
        }
    }

    /// True for a symbol with exactly this name.
    pub fn is(&self, name: &str) -> bool {
        self.as_symbol() == Some(name)
    }
}

impl fmt::Display for SExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExpr::Symbol(s) => write!(f, "{}", s),
            SExpr::Scalar(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{:.0}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            SExpr::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SexprError {
    #[error("line {line}: unexpected end of input")]
    UnexpectedEof { line: usize },
    #[error("line {line}: unbalanced ')'")]
    UnbalancedClose { line: usize },
    #[error("line {line}: trailing data after top-level form")]
    TrailingData { line: usize },
}

struct Reader<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        Reader {
            chars: src.chars().peekable(),
            line: 1,
        }
    }

    fn skip_blank(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == ';' {
                while let Some(&c) = self.chars.peek() {
                    self.chars.next();
                    if c == '\n' {
                        self.line += 1;
                        break;
                    }
                }
            } else if c.is_whitespace() {
                if c == '\n' {
                    self.line += 1;
                }
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn read(&mut self) -> Result<SExpr, SexprError> {
        self.skip_blank();
        match self.chars.peek() {
            None => Err(SexprError::UnexpectedEof { line: self.line }),
            Some('(') => {
                self.chars.next();
                let mut items = Vec::new();
                loop {
                    self.skip_blank();
                    match self.chars.peek() {
                        None => return Err(SexprError::UnexpectedEof { line: self.line }),
                        Some(')') => {
                            self.chars.next();
                            return Ok(SExpr::List(items));
                        }
                        Some(_) => items.push(self.read()?),
                    }
                }
            }
            Some(')') => Err(SexprError::UnbalancedClose { line: self.line }),
            Some(_) => {
                let mut token = String::new();
                while let Some(&c) = self.chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == ';' {
                        break;
                    }
                    token.push(c);
                    self.chars.next();
                }
                // A token is a number if it parses as one wholesale;
                // everything else is a symbol ("-" stays a symbol).
                match token.parse::<f64>() {
                    Ok(v) => Ok(SExpr::Scalar(v)),
                    Err(_) => Ok(SExpr::Symbol(token)),
                }
            }
        }
    }
}

/// Parse exactly one top-level datum.
pub fn parse(src: &str) -> Result<SExpr, SexprError> {
    let mut reader = Reader::new(src);
    let datum = reader.read()?;
    reader.skip_blank();
    if reader.chars.peek().is_some() {
        return Err(SexprError::TrailingData { line: reader.line });
    }
    Ok(datum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_nested_lists() {
        let e = parse("((ADD_OP -1) (LIT_0_OP 1))").unwrap();
        let items = e.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_list().unwrap()[0].as_symbol(), Some("ADD_OP"));
        assert_eq!(items[0].as_list().unwrap()[1].as_scalar(), Some(-1.0));
    }

    #[test]
    fn comments_and_whitespace() {
        let e = parse("; header\n( a ; trailing\n  2.5 )").unwrap();
        assert_eq!(
            e,
            SExpr::List(vec![SExpr::Symbol("a".into()), SExpr::Scalar(2.5)])
        );
    }

    #[test]
    fn minus_is_a_symbol_but_negatives_are_numbers() {
        assert_eq!(parse("-").unwrap(), SExpr::Symbol("-".into()));
        assert_eq!(parse("-3").unwrap(), SExpr::Scalar(-3.0));
    }

    #[test]
    fn errors() {
        assert!(matches!(
            parse("(a"),
            Err(SexprError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            parse(")"),
            Err(SexprError::UnbalancedClose { .. })
        ));
        assert!(matches!(
            parse("(a) b"),
            Err(SexprError::TrailingData { .. })
        ));
    }

    #[test]
    fn display_round_trips_shape() {
        let e = parse("(defop ? fancy scalar (vector 3))").unwrap();
        assert_eq!(e.to_string(), "(defop ? fancy scalar (vector 3))");
    }
}
