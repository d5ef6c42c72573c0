//! The class store: boolean facts gating promise evaluation.
//!
//! Hard classes come from inventory (platform, host name, time windows) and
//! cannot be undefined by policy; soft classes are defined during the run.
//! Guard expressions combine class names with `!`, `&` (or `.`), `|` and
//! parentheses. The class `any` is always defined.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::HashSet;

/// Process-wide set of boolean facts
#[derive(Debug, Default)]
pub struct ClassStore {
    hard: RwLock<HashSet<String>>,
    soft: RwLock<HashSet<String>>,
}

impl ClassStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a hard (inventory) class
    pub fn define_hard<S: Into<String>>(&self, name: S) {
        self.hard.write().insert(name.into());
    }

    /// Defines a soft (policy) class. Hard classes shadow soft ones.
    pub fn define_soft<S: Into<String>>(&self, name: S) {
        self.soft.write().insert(name.into());
    }

    /// Undefines a soft class; hard classes are immutable
    pub fn undefine_soft(&self, name: &str) {
        self.soft.write().remove(name);
    }

    /// Whether a class is currently defined
    pub fn is_defined(&self, name: &str) -> bool {
        if name == "any" {
            return true;
        }
        self.hard.read().contains(name) || self.soft.read().contains(name)
    }

    /// Number of defined classes, hard and soft
    pub fn len(&self) -> usize {
        self.hard.read().len() + self.soft.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.hard.read().is_empty() && self.soft.read().is_empty()
    }

    /// Evaluates a guard expression against the current facts
    pub fn evaluate(&self, expression: &str) -> CoreResult<bool> {
        let mut parser = GuardParser {
            store: self,
            input: expression.as_bytes(),
            pos: 0,
        };
        let value = parser.or_expression()?;
        parser.skip_space();
        if parser.pos != parser.input.len() {
            return Err(CoreError::InvalidClassExpression {
                expression: expression.to_string(),
                reason: format!("trailing input at byte {}", parser.pos),
            });
        }
        Ok(value)
    }
}

/// Recursive-descent evaluator for guard expressions.
/// Grammar: or := and ('|' and)* ; and := not (('&'|'.') not)* ;
/// not := '!' not | '(' or ')' | name
struct GuardParser<'a> {
    store: &'a ClassStore,
    input: &'a [u8],
    pos: usize,
}

impl<'a> GuardParser<'a> {
    fn skip_space(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_space();
        self.input.get(self.pos).copied()
    }

    fn or_expression(&mut self) -> CoreResult<bool> {
        let mut value = self.and_expression()?;
        while self.peek() == Some(b'|') {
            self.pos += 1;
            // || is accepted as a synonym
            if self.peek() == Some(b'|') {
                self.pos += 1;
            }
            let rhs = self.and_expression()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expression(&mut self) -> CoreResult<bool> {
        let mut value = self.not_expression()?;
        while matches!(self.peek(), Some(b'&') | Some(b'.')) {
            let op = self.input[self.pos];
            self.pos += 1;
            // && is accepted as a synonym
            if op == b'&' && self.input.get(self.pos) == Some(&b'&') {
                self.pos += 1;
            }
            let rhs = self.not_expression()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn not_expression(&mut self) -> CoreResult<bool> {
        match self.peek() {
            Some(b'!') => {
                self.pos += 1;
                Ok(!self.not_expression()?)
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.or_expression()?;
                if self.peek() != Some(b')') {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if is_class_char(c) => {
                let start = self.pos;
                while self
                    .input
                    .get(self.pos)
                    .map(|&c| is_class_char(c))
                    .unwrap_or(false)
                {
                    self.pos += 1;
                }
                let name = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| self.error("class name is not UTF-8"))?;
                Ok(self.store.is_defined(name))
            }
            _ => Err(self.error("expected a class name")),
        }
    }

    fn error(&self, reason: &str) -> CoreError {
        CoreError::InvalidClassExpression {
            expression: String::from_utf8_lossy(self.input).to_string(),
            reason: format!("{} at byte {}", reason, self.pos),
        }
    }
}

fn is_class_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
