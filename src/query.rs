//! C9 — attribute-query predicates and live queries (§4.9).
//!
//! A query string is a small boolean expression grammar over
//! `attribute op value` equations, e.g. `(size > "1024") && (name == "*.txt")`.
//! Execution picks the most selective equation (the one whose index is
//! expected to return the fewest candidates), iterates that index, and
//! filters the rest in memory. A live query additionally registers with the
//! volume so every [`crate::index::IndexSet::update_name`]-family call can
//! re-evaluate membership and fire create/remove notifications.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Clone, Debug)]
pub enum Value {
    Str(String),
    Int(i64),
}

/// One leaf `attribute op value` equation.
#[derive(Clone, Debug)]
pub struct Equation {
    pub attribute: String,
    pub op: Op,
    pub value: Value,
}

/// A parsed predicate tree (§4.9 "Predicate grammar").
#[derive(Clone, Debug)]
pub enum Predicate {
    Leaf(Equation),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Op(Op),
    Ident(&'a str),
    StrLit(String),
    IntLit(i64),
}

fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != b'"' {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(Error::BadValue);
                }
                tokens.push(Token::StrLit(input[start..j].to_string()));
                i = j + 1;
            }
            '&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(Op::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(Op::Eq));
                i += 2;
            }
            '>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(Op::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(Op::Gt));
                i += 1;
            }
            '<' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(Op::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(Op::Lt));
                i += 1;
            }
            _ if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {
                let start = i;
                let mut j = i;
                while j < bytes.len() && ((bytes[j] as char).is_ascii_alphanumeric() || bytes[j] == b'_' || bytes[j] == b'-') {
                    j += 1;
                }
                let word = &input[start..j];
                if let Ok(n) = word.parse::<i64>() {
                    tokens.push(Token::IntLit(n));
                } else {
                    tokens.push(Token::Ident(word));
                }
                i = j;
            }
            _ => return Err(Error::BadValue),
        }
    }
    Ok(tokens)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token<'a>> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token<'a>> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Predicate> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !matches!(self.next(), Some(Token::RParen)) {
                    return Err(Error::BadValue);
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    Some(Token::Ident(word)) if word == "contains" => Op::Contains,
                    _ => return Err(Error::BadValue),
                };
                let value = match self.next() {
                    Some(Token::StrLit(s)) => Value::Str(s),
                    Some(Token::IntLit(n)) => Value::Int(n),
                    _ => return Err(Error::BadValue),
                };
                Ok(Predicate::Leaf(Equation { attribute: name.to_string(), op, value }))
            }
            _ => Err(Error::BadValue),
        }
    }
}

/// Parses a POSIX-attribute-query string into an expression tree
/// (§4.9 "Predicate grammar").
pub fn parse(input: &str) -> Result<Predicate> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let predicate = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::BadValue);
    }
    Ok(predicate)
}

/// One inode's view of its own attributes, as far as the query engine is
/// concerned — enough to evaluate any leaf equation without touching the
/// small-data area or the attribute directory on every comparison.
pub trait AttributeSource {
    fn attribute(&self, name: &str) -> Option<Value>;
}

fn matches_value(actual: &Value, op: Op, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Int(a), Value::Int(b)) => match op {
            Op::Eq => a == b,
            Op::Ne => a != b,
            Op::Gt => a > b,
            Op::Ge => a >= b,
            Op::Lt => a < b,
            Op::Le => a <= b,
            Op::Contains => false,
        },
        (Value::Str(a), Value::Str(b)) => match op {
            Op::Eq => wildcard_match(b, a),
            Op::Ne => !wildcard_match(b, a),
            Op::Contains => a.contains(b.as_str()),
            Op::Gt => a > b,
            Op::Ge => a >= b,
            Op::Lt => a < b,
            Op::Le => a <= b,
        },
        _ => false,
    }
}

/// `*`/`?` glob matching for string equality, the form BFS queries use for
/// `name == "*.txt"`-style patterns (§4.9).
fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn rec(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => rec(&p[1..], t) || (!t.is_empty() && rec(p, &t[1..])),
            (Some(b'?'), Some(_)) => rec(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => rec(&p[1..], &t[1..]),
            _ => false,
        }
    }
    rec(pattern.as_bytes(), text.as_bytes())
}

/// Evaluates `predicate` against a single inode's attributes (the
/// in-memory filtering step after the selectivity-chosen index has
/// narrowed the candidate set, §4.9 "Execution").
pub fn evaluate(predicate: &Predicate, source: &dyn AttributeSource) -> bool {
    match predicate {
        Predicate::Leaf(eq) => match source.attribute(&eq.attribute) {
            Some(actual) => matches_value(&actual, eq.op, &eq.value),
            None => false,
        },
        Predicate::And(a, b) => evaluate(a, source) && evaluate(b, source),
        Predicate::Or(a, b) => evaluate(a, source) || evaluate(b, source),
        Predicate::Not(a) => !evaluate(a, source),
    }
}

/// Picks the leaf equation expected to be most selective: an equality on a
/// well-known indexed attribute beats a range, which beats an unindexed
/// attribute that forces a full index scan (§4.9 "Selectivity").
pub fn most_selective<'p>(predicate: &'p Predicate, indexed: &[&str]) -> Option<&'p Equation> {
    fn collect<'p>(predicate: &'p Predicate, out: &mut Vec<&'p Equation>) {
        match predicate {
            Predicate::Leaf(eq) => out.push(eq),
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                collect(a, out);
                collect(b, out);
            }
            Predicate::Not(a) => collect(a, out),
        }
    }
    let mut leaves = Vec::new();
    collect(predicate, &mut leaves);
    leaves
        .into_iter()
        .filter(|eq| indexed.contains(&eq.attribute.as_str()))
        .min_by_key(|eq| if eq.op == Op::Eq { 0 } else { 1 })
}

/// Collects every attribute name referenced by a leaf equation, so a caller
/// can check which ones currently have a backing index before calling
/// [`most_selective`] (§4.9 "Selectivity").
pub fn referenced_attributes(predicate: &Predicate) -> Vec<String> {
    fn collect(predicate: &Predicate, out: &mut Vec<String>) {
        match predicate {
            Predicate::Leaf(eq) => out.push(eq.attribute.clone()),
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                collect(a, out);
                collect(b, out);
            }
            Predicate::Not(a) => collect(a, out),
        }
    }
    let mut out = Vec::new();
    collect(predicate, &mut out);
    out
}

/// A notification a live query fires when an inode's predicate membership
/// changes (§4.9 "Live query notifications").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    EntryCreated { inode: u64, parent: u64, name: String },
    EntryRemoved { inode: u64, parent: u64, name: String },
}

pub trait QueryListener: Send {
    fn notify(&self, event: QueryEvent);
}

struct LiveQuery {
    predicate: Predicate,
    listener: Arc<dyn QueryListener>,
    /// Inodes currently matching, so a re-evaluation after a mutation can
    /// tell membership gained vs lost vs unchanged.
    matching: std::collections::HashSet<u64>,
}

/// Registry of live queries a volume keeps, walked on every name/attribute
/// change so matching queries fire create/remove notifications (§4.9).
#[derive(Default)]
pub struct QueryRegistry {
    queries: Mutex<Vec<LiveQuery>>,
}

impl QueryRegistry {
    pub fn register(&self, predicate: Predicate, listener: Arc<dyn QueryListener>) {
        self.queries.lock().unwrap().push(LiveQuery { predicate, listener, matching: std::collections::HashSet::new() });
    }

    /// Re-evaluates every live query against `source` for `inode`, firing
    /// `EntryCreated`/`EntryRemoved` for queries whose membership changed.
    pub fn update(&self, inode: u64, parent: u64, name: &str, source: &dyn AttributeSource, exists: bool) {
        let mut queries = self.queries.lock().unwrap();
        for query in queries.iter_mut() {
            let now_matches = exists && evaluate(&query.predicate, source);
            let was_matching = query.matching.contains(&inode);
            if now_matches && !was_matching {
                query.matching.insert(inode);
                query.listener.notify(QueryEvent::EntryCreated { inode, parent, name: name.to_string() });
            } else if !now_matches && was_matching {
                query.matching.remove(&inode);
                query.listener.notify(QueryEvent::EntryRemoved { inode, parent, name: name.to_string() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAttrs {
        size: i64,
        name: String,
    }

    impl AttributeSource for FakeAttrs {
        fn attribute(&self, name: &str) -> Option<Value> {
            match name {
                "size" => Some(Value::Int(self.size)),
                "name" => Some(Value::Str(self.name.clone())),
                _ => None,
            }
        }
    }

    #[test]
    fn parses_and_evaluates_compound_predicate() {
        let predicate = parse(r#"(size > 1024) && (name == "*.txt")"#).unwrap();
        let small_txt = FakeAttrs { size: 10, name: "a.txt".into() };
        let big_txt = FakeAttrs { size: 4096, name: "a.txt".into() };
        let big_bin = FakeAttrs { size: 4096, name: "a.bin".into() };
        assert!(!evaluate(&predicate, &small_txt));
        assert!(evaluate(&predicate, &big_txt));
        assert!(!evaluate(&predicate, &big_bin));
    }

    #[test]
    fn not_and_or_precedence() {
        let predicate = parse(r#"!(size == 0) || (name == "keep")"#).unwrap();
        let zero = FakeAttrs { size: 0, name: "drop".into() };
        let keep = FakeAttrs { size: 0, name: "keep".into() };
        assert!(!evaluate(&predicate, &zero));
        assert!(evaluate(&predicate, &keep));
    }

    #[test]
    fn referenced_attributes_collects_every_leaf() {
        let predicate = parse(r#"(tag == "same") && (size > 1024)"#).unwrap();
        let mut attrs = referenced_attributes(&predicate);
        attrs.sort();
        assert_eq!(attrs, vec!["size".to_string(), "tag".to_string()]);
    }

    #[test]
    fn most_selective_prefers_equality_over_range() {
        let predicate = parse(r#"(size > 1024) && (name == "x")"#).unwrap();
        let eq = most_selective(&predicate, &["size", "name"]).unwrap();
        assert_eq!(eq.attribute, "name");
    }

    struct RecordingListener {
        events: Mutex<Vec<QueryEvent>>,
    }

    impl QueryListener for RecordingListener {
        fn notify(&self, event: QueryEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn live_query_fires_on_membership_change() {
        let registry = QueryRegistry::default();
        let listener = Arc::new(RecordingListener { events: Mutex::new(Vec::new()) });
        let predicate = parse(r#"size > 100"#).unwrap();
        registry.register(predicate, listener.clone());

        let small = FakeAttrs { size: 10, name: "f".into() };
        let big = FakeAttrs { size: 200, name: "f".into() };

        registry.update(42, 1, "f", &small, true);
        assert!(listener.events.lock().unwrap().is_empty());

        registry.update(42, 1, "f", &big, true);
        assert_eq!(listener.events.lock().unwrap().len(), 1);

        registry.update(42, 1, "f", &small, true);
        assert_eq!(listener.events.lock().unwrap().len(), 2);
    }
}
