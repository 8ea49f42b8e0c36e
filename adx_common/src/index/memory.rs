//! # In-Memory Reference Engine
//!
//! A small [`IndexEngine`] that evaluates targeting expressions by scanning
//! every document. It understands the subset of the expression language the
//! channels actually send:
//!
//! ```text
//! expr   := term ( "or" term )*
//! term   := factor ( "and" factor )*
//! factor := "(" expr ")" | field [ "not" ] "in" "{" value ( "," value )* "}"
//! ```
//!
//! Keywords, fields and values are case-insensitive.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::engine::{Conditions, DocId, IndexEngine, IndexError, SearchIndex};
use crate::inventory::CanonicalOffer;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryEngine;

impl IndexEngine for MemoryEngine {
    type Index = MemoryIndex;

    fn new_index(&self) -> MemoryIndex {
        MemoryIndex::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Atom {
        field: String,
        negated: bool,
        values: BTreeSet<String>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn matches(&self, conditions: &Conditions) -> bool {
        match self {
            Expr::Atom {
                field,
                negated,
                values,
            } => {
                let hit = conditions
                    .get(field)
                    .is_some_and(|value| values.contains(&value.to_ascii_lowercase()));
                hit != *negated
            }
            Expr::And(parts) => parts.iter().all(|p| p.matches(conditions)),
            Expr::Or(parts) => parts.iter().any(|p| p.matches(conditions)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    BraceOpen,
    BraceClose,
    Comma,
    Word(String),
}

fn tokenize(expression: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in expression.chars() {
        let punct = match c {
            '(' => Some(Token::Open),
            ')' => Some(Token::Close),
            '{' => Some(Token::BraceOpen),
            '}' => Some(Token::BraceClose),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if punct.is_some() || c.is_whitespace() {
            if !word.is_empty() {
                tokens.push(Token::Word(std::mem::take(&mut word)));
            }
            tokens.extend(punct);
        } else {
            word.push(c.to_ascii_lowercase());
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

/// Deepest parenthesis nesting an expression may use.
pub const MAX_NESTING_DEPTH: usize = 64;

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            tokens: tokenize(source),
            pos: 0,
            depth: 0,
            source,
        }
    }

    fn fail(&self, reason: impl Into<String>) -> IndexError {
        IndexError::InvalidExpression {
            expression: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == keyword)
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), IndexError> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            _ => Err(self.fail(format!("expected {what}"))),
        }
    }

    fn parse(mut self) -> Result<Expr, IndexError> {
        if self.tokens.is_empty() {
            return Err(self.fail("empty expression"));
        }
        let expr = self.expr()?;
        if self.pos < self.tokens.len() {
            return Err(self.fail("trailing input"));
        }
        Ok(expr)
    }

    fn expr(&mut self) -> Result<Expr, IndexError> {
        let mut parts = vec![self.term()?];
        while self.peek_keyword("or") {
            self.pos += 1;
            parts.push(self.term()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::Or(parts)
        })
    }

    fn term(&mut self) -> Result<Expr, IndexError> {
        let mut parts = vec![self.factor()?];
        while self.peek_keyword("and") {
            self.pos += 1;
            parts.push(self.factor()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::And(parts)
        })
    }

    fn factor(&mut self) -> Result<Expr, IndexError> {
        match self.next() {
            Some(Token::Open) => {
                if self.depth >= MAX_NESTING_DEPTH {
                    return Err(self.fail(format!(
                        "parentheses nested deeper than {MAX_NESTING_DEPTH}"
                    )));
                }
                self.depth += 1;
                let inner = self.expr()?;
                self.expect(&Token::Close, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::Word(field)) if !matches!(field.as_str(), "and" | "or" | "not" | "in") => {
                let negated = self.peek_keyword("not");
                if negated {
                    self.pos += 1;
                }
                if !self.peek_keyword("in") {
                    return Err(self.fail(format!("expected 'in' after {field:?}")));
                }
                self.pos += 1;
                let values = self.value_set()?;
                Ok(Expr::Atom {
                    field,
                    negated,
                    values,
                })
            }
            _ => Err(self.fail("expected a field or '('")),
        }
    }

    fn value_set(&mut self) -> Result<BTreeSet<String>, IndexError> {
        self.expect(&Token::BraceOpen, "'{'")?;
        let mut values = BTreeSet::new();
        loop {
            match self.next() {
                Some(Token::Word(value)) => {
                    values.insert(value);
                }
                _ => return Err(self.fail("expected a value")),
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::BraceClose) => return Ok(values),
                _ => return Err(self.fail("expected ',' or '}'")),
            }
        }
    }
}

#[derive(Debug)]
struct Document {
    id: DocId,
    expr: Expr,
    attribute: Arc<CanonicalOffer>,
}

#[derive(Debug, Default)]
pub struct MemoryIndex {
    documents: Vec<Document>,
    positions: HashMap<DocId, usize>,
}

impl SearchIndex for MemoryIndex {
    fn insert(
        &mut self,
        doc_id: &str,
        expression: &str,
        attribute: CanonicalOffer,
    ) -> Result<(), IndexError> {
        if self.positions.contains_key(doc_id) {
            return Err(IndexError::DuplicateDocument(doc_id.to_string()));
        }
        let expr = Parser::new(expression).parse()?;
        self.positions.insert(doc_id.to_string(), self.documents.len());
        self.documents.push(Document {
            id: doc_id.to_string(),
            expr,
            attribute: Arc::new(attribute),
        });
        Ok(())
    }

    fn search(
        &self,
        conditions: &Conditions,
        predicate: &dyn Fn(&CanonicalOffer) -> bool,
    ) -> Result<Vec<DocId>, IndexError> {
        if let Some(field) = conditions.keys().find(|k| k.trim().is_empty()) {
            return Err(IndexError::InvalidCondition {
                field: field.clone(),
                reason: "empty field name",
            });
        }
        let conditions: Conditions = conditions
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();

        Ok(self
            .documents
            .iter()
            .filter(|doc| doc.expr.matches(&conditions) && predicate(&doc.attribute))
            .map(|doc| doc.id.clone())
            .collect())
    }

    fn get_attribute(&self, doc_id: &str) -> Result<Arc<CanonicalOffer>, IndexError> {
        self.positions
            .get(doc_id)
            .map(|&pos| Arc::clone(&self.documents[pos].attribute))
            .ok_or_else(|| IndexError::NotFound(doc_id.to_string()))
    }

    fn dump_by_page(&self, page: usize, page_size: usize) -> Vec<Arc<CanonicalOffer>> {
        if page_size == 0 {
            return Vec::new();
        }
        self.documents
            .iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .map(|doc| Arc::clone(&doc.attribute))
            .collect()
    }

    fn dump_by_filter(&self, filter: &dyn Fn(&CanonicalOffer) -> bool) -> Vec<Arc<CanonicalOffer>> {
        self.documents
            .iter()
            .filter(|doc| filter(&doc.attribute))
            .map(|doc| Arc::clone(&doc.attribute))
            .collect()
    }

    fn len(&self) -> usize {
        self.documents.len()
    }
}
