//! Expression parser and evaluator for policy conditions.
//!
//! Supported syntax:
//! - Variables: `principal`, `action`, `resource`, `context`
//! - Attribute access: `resource.owner`, `context.role`, chained through
//!   entity references (`resource.owner.manager`)
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=` (ordering on integers only)
//! - Boolean operators: `&&`, `||` (short-circuit), `!`
//! - Hierarchy membership: `principal in resource.readers`,
//!   `principal in [Team::"a", Team::"b"]`
//! - Sets: `[1, 2]`, `resource.tags.contains("urgent")`
//! - Tests: `principal has joblevel`, `resource is List`
//! - Literals: integers, `"strings"`, `true`, `false`, `Type::"id"`
//! - Parentheses for grouping

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::authz::errors::{ConditionError, EvalError};
use crate::authz::hierarchy::HierarchyResolver;
use crate::authz::types::{AttrValue, EntityUid};

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Var(Var),
    Attr {
        expr: Box<Expr>,
        attr: String,
    },
    Has {
        expr: Box<Expr>,
        attr: String,
    },
    Is {
        expr: Box<Expr>,
        entity_type: String,
    },
    Set(Vec<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    In {
        element: Box<Expr>,
        collection: Box<Expr>,
    },
    Contains {
        collection: Box<Expr>,
        element: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Var {
    Principal,
    Action,
    Resource,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Long(i64),
    Str(String),
    Bool(bool),
    Entity(EntityUid),
}

// ─── Parser ─────────────────────────────────────────────────────────────

/// Deepest expression nesting a condition may use.
pub const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(String),
    Str(String),
    True,
    False,
    Dot,
    Comma,
    PathSep, // ::
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,    // ==
    Ne,    // !=
    Gt,    // >
    Lt,    // <
    Ge,    // >=
    Le,    // <=
    And,   // &&
    Or,    // ||
    Not,   // !
    Minus, // -
    In,    // in
    Has,   // has
    Is,    // is
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let next = chars.get(i + 1).copied();
        match chars[i] {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            ':' if next == Some(':') => {
                tokens.push(Token::PathSep);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString),
                        Some('"') => break,
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(c) => s.push(*c),
                                None => return Err(ConditionError::UnterminatedString),
                            }
                            i += 2;
                        }
                        Some(c) => {
                            s.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
                i += 1; // closing quote
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                tokens.push(Token::Int(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "in" => tokens.push(Token::In),
                    "has" => tokens.push(Token::Has),
                    "is" => tokens.push(Token::Is),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            c => return Err(ConditionError::UnexpectedChar(c)),
        }
    }
    Ok(tokens)
}

fn parse_long(digits: &str, negative: bool) -> Result<i64, ConditionError> {
    let text = if negative {
        format!("-{digits}")
    } else {
        digits.to_string()
    };
    text.parse()
        .map_err(|_| ConditionError::InvalidInteger(text.clone()))
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Counts one nesting level. Recursive rules and left-folded `&&`/`||`
    /// and `.attr` chains all pass through here.
    fn descend(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ConditionError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ConditionError> {
        if self.advance() != Some(expected) {
            return Err(ConditionError::Syntax(format!("expected {what}")));
        }
        Ok(())
    }

    fn expect_ident(&mut self, after: &str) -> Result<String, ConditionError> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            // keywords are fine as attribute names
            Some(Token::In) => Ok("in".into()),
            Some(Token::Has) => Ok("has".into()),
            Some(Token::Is) => Ok("is".into()),
            _ => Err(ConditionError::Syntax(format!(
                "expected identifier after {after}"
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ConditionError> {
        self.parse_or()
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let depth = self.depth;
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            self.descend()?;
            let right = self.parse_and()?;
            left = Expr::BinOp {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = depth;
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let depth = self.depth;
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            self.descend()?;
            let right = self.parse_comparison()?;
            left = Expr::BinOp {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = depth;
        Ok(left)
    }

    /// comparison = unary (cmp_op unary | "in" unary | "has" ident | "is" type)?
    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Le) => BinOp::Le,
            Some(Token::In) => {
                self.advance();
                let right = self.parse_unary()?;
                return Ok(Expr::In {
                    element: Box::new(left),
                    collection: Box::new(right),
                });
            }
            Some(Token::Has) => {
                self.advance();
                let attr = match self.peek() {
                    Some(Token::Str(s)) => {
                        let s = s.clone();
                        self.advance();
                        s
                    }
                    _ => self.expect_ident("`has`")?,
                };
                return Ok(Expr::Has {
                    expr: Box::new(left),
                    attr,
                });
            }
            Some(Token::Is) => {
                self.advance();
                let mut entity_type = self.expect_ident("`is`")?;
                while self.peek() == Some(&Token::PathSep) {
                    self.advance();
                    entity_type.push_str("::");
                    entity_type.push_str(&self.expect_ident("`::`")?);
                }
                return Ok(Expr::Is {
                    expr: Box::new(left),
                    entity_type,
                });
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// unary = "!" unary | "-" unary | postfix
    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                self.descend()?;
                let expr = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::Not(Box::new(expr)))
            }
            Some(Token::Minus) => {
                self.advance();
                if let Some(Token::Int(digits)) = self.peek().cloned() {
                    self.advance();
                    return Ok(Expr::Literal(Literal::Long(parse_long(&digits, true)?)));
                }
                self.descend()?;
                let expr = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::Neg(Box::new(expr)))
            }
            _ => self.parse_postfix(),
        }
    }

    /// postfix = primary ("." ident | "." "contains" "(" expr ")")*
    fn parse_postfix(&mut self) -> Result<Expr, ConditionError> {
        let depth = self.depth;
        let mut expr = self.parse_primary()?;
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            self.descend()?;
            let name = self.expect_ident("`.`")?;
            if name == "contains" && self.peek() == Some(&Token::LParen) {
                self.advance();
                let element = self.parse_expr()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                expr = Expr::Contains {
                    collection: Box::new(expr),
                    element: Box::new(element),
                };
            } else {
                expr = Expr::Attr {
                    expr: Box::new(expr),
                    attr: name,
                };
            }
        }
        self.depth = depth;
        Ok(expr)
    }

    /// primary = literal | entity | variable | "[" list "]" | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.advance() {
            Some(Token::Int(digits)) => Ok(Expr::Literal(Literal::Long(parse_long(&digits, false)?))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Literal::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Literal::Bool(false))),
            Some(Token::Ident(name)) if self.peek() == Some(&Token::PathSep) => {
                self.parse_entity_literal(name)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "principal" => Ok(Expr::Var(Var::Principal)),
                "action" => Ok(Expr::Var(Var::Action)),
                "resource" => Ok(Expr::Var(Var::Resource)),
                "context" => Ok(Expr::Var(Var::Context)),
                _ => Err(ConditionError::UnknownVariable(name)),
            },
            Some(Token::LBracket) => {
                self.descend()?;
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.advance();
                            continue;
                        }
                        break;
                    }
                }
                self.expect(Token::RBracket, "closing bracket `]`")?;
                self.depth -= 1;
                Ok(Expr::Set(items))
            }
            Some(Token::LParen) => {
                self.descend()?;
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                self.depth -= 1;
                Ok(expr)
            }
            other => Err(ConditionError::Syntax(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }

    /// `Type::"id"` or `Namespace::Type::"id"`; the first identifier has
    /// already been consumed.
    fn parse_entity_literal(&mut self, first: String) -> Result<Expr, ConditionError> {
        let mut entity_type = first;
        loop {
            self.expect(Token::PathSep, "`::`")?;
            match self.advance() {
                Some(Token::Str(id)) => {
                    return Ok(Expr::Literal(Literal::Entity(EntityUid::new(entity_type, id))));
                }
                Some(Token::Ident(seg)) if self.peek() == Some(&Token::PathSep) => {
                    entity_type.push_str("::");
                    entity_type.push_str(&seg);
                }
                _ => {
                    return Err(ConditionError::Syntax(format!(
                        "expected quoted id after `{entity_type}::`"
                    )))
                }
            }
        }
    }
}

/// Parse a condition expression string into an AST.
pub fn parse_condition(input: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ConditionError::Empty);
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if let Some(tok) = parser.peek_at(0) {
        return Err(ConditionError::Syntax(format!(
            "unexpected trailing token: {tok:?}"
        )));
    }
    Ok(expr)
}

// ─── Evaluator ──────────────────────────────────────────────────────────

/// Everything a condition can see: the request and the entity hierarchy.
pub struct EvalContext<'a> {
    pub principal: &'a EntityUid,
    pub action: &'a EntityUid,
    pub resource: &'a EntityUid,
    /// Always a record.
    pub context: &'a AttrValue,
    pub hierarchy: &'a HierarchyResolver,
}

/// Evaluate a parsed expression. Returns `true` if the condition holds.
pub fn evaluate(expr: &Expr, cx: &EvalContext<'_>) -> Result<bool, EvalError> {
    as_bool(eval(expr, cx)?.as_ref())
}

fn as_bool(v: &AttrValue) -> Result<bool, EvalError> {
    match v {
        AttrValue::Bool(b) => Ok(*b),
        other => Err(EvalError::TypeMismatch {
            expected: "bool",
            got: other.type_name(),
        }),
    }
}

fn as_long(v: &AttrValue) -> Result<i64, EvalError> {
    match v {
        AttrValue::Long(n) => Ok(*n),
        other => Err(EvalError::TypeMismatch {
            expected: "long",
            got: other.type_name(),
        }),
    }
}

/// Structural equality where sets compare without regard to order.
fn values_equal(a: &AttrValue, b: &AttrValue) -> bool {
    match (a, b) {
        (AttrValue::Set(xs), AttrValue::Set(ys)) => {
            xs.iter().all(|x| ys.iter().any(|y| values_equal(x, y)))
                && ys.iter().all(|y| xs.iter().any(|x| values_equal(x, y)))
        }
        (AttrValue::Record(xs), AttrValue::Record(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn literal_value(lit: &Literal) -> AttrValue {
    match lit {
        Literal::Long(n) => AttrValue::Long(*n),
        Literal::Str(s) => AttrValue::String(s.clone()),
        Literal::Bool(b) => AttrValue::Bool(*b),
        Literal::Entity(uid) => AttrValue::Entity(uid.clone()),
    }
}

fn get_attr<'a>(
    base: Cow<'a, AttrValue>,
    attr: &str,
    cx: &EvalContext<'a>,
) -> Result<Cow<'a, AttrValue>, EvalError> {
    let missing = |owner: String| EvalError::MissingAttribute {
        entity: owner,
        attr: attr.to_string(),
    };
    match base {
        Cow::Borrowed(AttrValue::Record(fields)) => fields
            .get(attr)
            .map(Cow::Borrowed)
            .ok_or_else(|| missing("record".into())),
        Cow::Owned(AttrValue::Record(mut fields)) => fields
            .remove(attr)
            .map(Cow::Owned)
            .ok_or_else(|| missing("record".into())),
        base => match base.as_ref() {
            AttrValue::Entity(uid) => {
                let entity = cx
                    .hierarchy
                    .entities()
                    .get(uid)
                    .ok_or_else(|| EvalError::MissingEntity(uid.clone()))?;
                entity
                    .attrs
                    .get(attr)
                    .map(Cow::Borrowed)
                    .ok_or_else(|| missing(uid.to_string()))
            }
            other => Err(EvalError::TypeMismatch {
                expected: "entity or record",
                got: other.type_name(),
            }),
        },
    }
}

fn has_attr(base: &AttrValue, attr: &str, cx: &EvalContext<'_>) -> Result<bool, EvalError> {
    match base {
        AttrValue::Record(fields) => Ok(fields.contains_key(attr)),
        // an entity that is not loaded has no attributes
        AttrValue::Entity(uid) => Ok(cx
            .hierarchy
            .entities()
            .get(uid)
            .is_some_and(|e| e.attrs.contains_key(attr))),
        other => Err(EvalError::TypeMismatch {
            expected: "entity or record",
            got: other.type_name(),
        }),
    }
}

fn member_of(element: &AttrValue, collection: &AttrValue, cx: &EvalContext<'_>) -> Result<bool, EvalError> {
    match (element, collection) {
        (AttrValue::Entity(e), AttrValue::Entity(target)) => Ok(cx.hierarchy.is_ancestor(target, e)),
        (AttrValue::Entity(e), AttrValue::Set(items)) => Ok(items.iter().any(|item| match item {
            AttrValue::Entity(target) => cx.hierarchy.is_ancestor(target, e),
            _ => false,
        })),
        (element, AttrValue::Set(items)) => Ok(items.iter().any(|item| values_equal(item, element))),
        (_, AttrValue::Entity(_)) => Err(EvalError::TypeMismatch {
            expected: "entity",
            got: element.type_name(),
        }),
        (_, other) => Err(EvalError::TypeMismatch {
            expected: "entity or set",
            got: other.type_name(),
        }),
    }
}

fn eval<'a>(expr: &Expr, cx: &EvalContext<'a>) -> Result<Cow<'a, AttrValue>, EvalError> {
    match expr {
        Expr::Literal(lit) => Ok(Cow::Owned(literal_value(lit))),
        Expr::Var(var) => Ok(match var {
            Var::Principal => Cow::Owned(AttrValue::Entity(cx.principal.clone())),
            Var::Action => Cow::Owned(AttrValue::Entity(cx.action.clone())),
            Var::Resource => Cow::Owned(AttrValue::Entity(cx.resource.clone())),
            Var::Context => Cow::Borrowed(cx.context),
        }),
        Expr::Attr { expr, attr } => {
            let base = eval(expr, cx)?;
            get_attr(base, attr, cx)
        }
        Expr::Has { expr, attr } => {
            let base = eval(expr, cx)?;
            Ok(Cow::Owned(AttrValue::Bool(has_attr(&base, attr, cx)?)))
        }
        Expr::Is { expr, entity_type } => match eval(expr, cx)?.as_ref() {
            AttrValue::Entity(uid) => Ok(Cow::Owned(AttrValue::Bool(
                &uid.entity_type == entity_type,
            ))),
            other => Err(EvalError::TypeMismatch {
                expected: "entity",
                got: other.type_name(),
            }),
        },
        Expr::Set(items) => {
            let values = items
                .iter()
                .map(|item| eval(item, cx).map(Cow::into_owned))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Cow::Owned(AttrValue::Set(values)))
        }
        Expr::Not(inner) => {
            let b = as_bool(eval(inner, cx)?.as_ref())?;
            Ok(Cow::Owned(AttrValue::Bool(!b)))
        }
        Expr::Neg(inner) => {
            let n = as_long(eval(inner, cx)?.as_ref())?;
            let negated = n.checked_neg().ok_or(EvalError::Overflow)?;
            Ok(Cow::Owned(AttrValue::Long(negated)))
        }
        Expr::In {
            element,
            collection,
        } => {
            let elem = eval(element, cx)?;
            let coll = eval(collection, cx)?;
            Ok(Cow::Owned(AttrValue::Bool(member_of(&elem, &coll, cx)?)))
        }
        Expr::Contains {
            collection,
            element,
        } => {
            let coll = eval(collection, cx)?;
            let elem = eval(element, cx)?;
            match coll.as_ref() {
                AttrValue::Set(items) => Ok(Cow::Owned(AttrValue::Bool(
                    items.iter().any(|item| values_equal(item, &elem)),
                ))),
                other => Err(EvalError::TypeMismatch {
                    expected: "set",
                    got: other.type_name(),
                }),
            }
        }
        Expr::BinOp { op, left, right } => {
            let result = match op {
                BinOp::And => as_bool(eval(left, cx)?.as_ref())? && as_bool(eval(right, cx)?.as_ref())?,
                BinOp::Or => as_bool(eval(left, cx)?.as_ref())? || as_bool(eval(right, cx)?.as_ref())?,
                BinOp::Eq => values_equal(eval(left, cx)?.as_ref(), eval(right, cx)?.as_ref()),
                BinOp::Ne => !values_equal(eval(left, cx)?.as_ref(), eval(right, cx)?.as_ref()),
                BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
                    let l = as_long(eval(left, cx)?.as_ref())?;
                    let r = as_long(eval(right, cx)?.as_ref())?;
                    match op {
                        BinOp::Gt => l > r,
                        BinOp::Lt => l < r,
                        BinOp::Ge => l >= r,
                        _ => l <= r,
                    }
                }
            };
            Ok(Cow::Owned(AttrValue::Bool(result)))
        }
    }
}

/// An empty record, for requests without context.
pub fn empty_context() -> AttrValue {
    AttrValue::Record(BTreeMap::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::entities::{Entity, EntityStore};
    use std::sync::Arc;

    fn uid(t: &str, id: &str) -> EntityUid {
        EntityUid::new(t, id)
    }

    fn resolver() -> HierarchyResolver {
        let store = EntityStore::load(vec![
            Entity::new(uid("Team", "readers")),
            Entity::new(uid("Team", "editors")),
            Entity::new(uid("User", "andrew"))
                .with_parent(uid("Team", "readers"))
                .with_attr("joblevel", AttrValue::Long(7)),
            Entity::new(uid("User", "kesha")).with_attr("manager", AttrValue::Entity(uid("User", "andrew"))),
            Entity::new(uid("List", "0"))
                .with_attr("owner", AttrValue::Entity(uid("User", "kesha")))
                .with_attr("readers", AttrValue::Entity(uid("Team", "readers")))
                .with_attr("editors", AttrValue::Entity(uid("Team", "editors")))
                .with_attr(
                    "tags",
                    AttrValue::Set(vec![
                        AttrValue::String("work".into()),
                        AttrValue::String("urgent".into()),
                    ]),
                ),
        ])
        .unwrap();
        HierarchyResolver::new(Arc::new(store))
    }

    fn check(src: &str, principal: &str, context: serde_json::Value) -> Result<bool, EvalError> {
        let hierarchy = resolver();
        let principal = uid("User", principal);
        let action = EntityUid::action("GetList");
        let resource = uid("List", "0");
        let context = AttrValue::from_json(&context).unwrap();
        let cx = EvalContext {
            principal: &principal,
            action: &action,
            resource: &resource,
            context: &context,
            hierarchy: &hierarchy,
        };
        evaluate(&parse_condition(src).unwrap(), &cx)
    }

    #[test]
    fn test_parse_simple_comparison() {
        let expr = parse_condition("context.x == 5").unwrap();
        assert_eq!(
            expr,
            Expr::BinOp {
                op: BinOp::Eq,
                left: Box::new(Expr::Attr {
                    expr: Box::new(Expr::Var(Var::Context)),
                    attr: "x".into(),
                }),
                right: Box::new(Expr::Literal(Literal::Long(5))),
            }
        );
    }

    #[test]
    fn test_parse_entity_literal() {
        let expr = parse_condition(r#"principal == User::"alice""#).unwrap();
        match expr {
            Expr::BinOp { right, .. } => {
                assert_eq!(*right, Expr::Literal(Literal::Entity(uid("User", "alice"))));
            }
            other => panic!("expected BinOp, got {other:?}"),
        }
        let ns = parse_condition(r#"resource in Github::Org::"o1""#).unwrap();
        match ns {
            Expr::In { collection, .. } => assert_eq!(
                *collection,
                Expr::Literal(Literal::Entity(uid("Github::Org", "o1")))
            ),
            other => panic!("expected In, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_parentheses() {
        let expr = parse_condition("(context.a || context.b) && context.c").unwrap();
        match expr {
            Expr::BinOp {
                op: BinOp::And,
                left,
                ..
            } => assert!(matches!(*left, Expr::BinOp { op: BinOp::Or, .. })),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_negative_literal() {
        assert_eq!(
            parse_condition("-3").unwrap(),
            Expr::Literal(Literal::Long(-3))
        );
        assert_eq!(
            parse_condition("-9223372036854775808").unwrap(),
            Expr::Literal(Literal::Long(i64::MIN))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_condition(""), Err(ConditionError::Empty));
        assert_eq!(
            parse_condition(r#""hello"#),
            Err(ConditionError::UnterminatedString)
        );
        assert_eq!(
            parse_condition("request.ip == 1"),
            Err(ConditionError::UnknownVariable("request".into()))
        );
        assert_eq!(
            parse_condition("context.a = 1"),
            Err(ConditionError::UnexpectedChar('='))
        );
        assert_eq!(
            parse_condition("context.a ~ 1"),
            Err(ConditionError::UnexpectedChar('~'))
        );
        assert!(matches!(
            parse_condition("context.a == 1 context"),
            Err(ConditionError::Syntax(_))
        ));
        assert!(matches!(
            parse_condition("[1, 2"),
            Err(ConditionError::Syntax(_))
        ));
        assert!(matches!(
            parse_condition("99999999999999999999"),
            Err(ConditionError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_parse_depth_limit() {
        let nots = format!("{}true", "!".repeat(500_000));
        assert_eq!(parse_condition(&nots), Err(ConditionError::TooDeep(MAX_DEPTH)));

        let parens = format!("{}true{}", "(".repeat(10_000), ")".repeat(10_000));
        assert_eq!(parse_condition(&parens), Err(ConditionError::TooDeep(MAX_DEPTH)));

        let sets = format!("{}1{}", "[".repeat(10_000), "]".repeat(10_000));
        assert_eq!(parse_condition(&sets), Err(ConditionError::TooDeep(MAX_DEPTH)));

        let chain = vec!["true"; 100_000].join(" && ");
        assert_eq!(parse_condition(&chain), Err(ConditionError::TooDeep(MAX_DEPTH)));

        let attrs = format!("context{}", ".a".repeat(100_000));
        assert_eq!(parse_condition(&attrs), Err(ConditionError::TooDeep(MAX_DEPTH)));

        // moderate nesting still parses, and sibling groups do not add up
        let nested = format!("{}true{}", "(".repeat(40), ")".repeat(40));
        assert!(parse_condition(&nested).is_ok());
        let siblings = vec!["(context.a == 1)"; 100].join(" || ");
        assert!(parse_condition(&siblings).is_ok());
        let grouped = vec!["(context.a == 1 || context.b == 2)"; 60].join(" && ");
        assert!(parse_condition(&grouped).is_ok());
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            parse_condition(r#""a\"b""#).unwrap(),
            Expr::Literal(Literal::Str("a\"b".into()))
        );
    }

    #[test]
    fn test_evaluate_context_comparison() {
        let src = "context.hour >= 9 && context.hour < 17";
        assert!(check(src, "andrew", serde_json::json!({"hour": 14})).unwrap());
        assert!(!check(src, "andrew", serde_json::json!({"hour": 20})).unwrap());
    }

    #[test]
    fn test_evaluate_entity_attribute_chain() {
        assert!(check("resource.owner == principal", "kesha", serde_json::json!({})).unwrap());
        assert!(!check("resource.owner == principal", "andrew", serde_json::json!({})).unwrap());
        assert!(check(
            "resource.owner.manager == principal",
            "andrew",
            serde_json::json!({})
        )
        .unwrap());
    }

    #[test]
    fn test_evaluate_hierarchy_membership() {
        let src = "principal in resource.readers || principal in resource.editors";
        assert!(check(src, "andrew", serde_json::json!({})).unwrap());
        assert!(!check(src, "kesha", serde_json::json!({})).unwrap());
        assert!(check(
            r#"principal in [Team::"editors", Team::"readers"]"#,
            "andrew",
            serde_json::json!({})
        )
        .unwrap());
        assert!(check(r#"principal in User::"andrew""#, "andrew", serde_json::json!({})).unwrap());
    }

    #[test]
    fn test_evaluate_set_operations() {
        assert!(check(r#"resource.tags.contains("urgent")"#, "andrew", serde_json::json!({})).unwrap());
        assert!(!check(r#"resource.tags.contains("home")"#, "andrew", serde_json::json!({})).unwrap());
        assert!(check(r#"context.role in ["Reader", "Editor"]"#, "andrew", serde_json::json!({"role": "Reader"})).unwrap());
        assert!(check(
            r#"resource.tags == ["urgent", "work"]"#,
            "andrew",
            serde_json::json!({})
        )
        .unwrap());
    }

    #[test]
    fn test_evaluate_has_and_is() {
        assert!(check("principal has joblevel && principal.joblevel > 5", "andrew", serde_json::json!({})).unwrap());
        // short-circuit: kesha has no joblevel, so the right side is never read
        assert!(!check("principal has joblevel && principal.joblevel > 5", "kesha", serde_json::json!({})).unwrap());
        assert!(check("resource is List", "andrew", serde_json::json!({})).unwrap());
        assert!(!check("principal is Team", "andrew", serde_json::json!({})).unwrap());
        assert!(check(r#"context has "role""#, "andrew", serde_json::json!({"role": "x"})).unwrap());
        // a missing entity has no attributes, so `has` is false rather than an error
        assert!(!check(r#"User::"ghost" has joblevel"#, "andrew", serde_json::json!({})).unwrap());
    }

    #[test]
    fn test_evaluate_not_and_or() {
        assert!(check("!context.disabled", "andrew", serde_json::json!({"disabled": false})).unwrap());
        assert!(check("context.a == 1 || context.b == 2", "andrew", serde_json::json!({"a": 0, "b": 2})).unwrap());
        // short-circuit: missing `b` never evaluated
        assert!(check("context.a == 1 || context.b == 2", "andrew", serde_json::json!({"a": 1})).unwrap());
    }

    #[test]
    fn test_evaluate_errors() {
        assert!(matches!(
            check("principal.joblevel > 5", "kesha", serde_json::json!({})),
            Err(EvalError::MissingAttribute { .. })
        ));
        assert!(matches!(
            check("context.hour < 5", "kesha", serde_json::json!({})),
            Err(EvalError::MissingAttribute { .. })
        ));
        assert!(matches!(
            check(r#"context.name > "a""#, "andrew", serde_json::json!({"name": "b"})),
            Err(EvalError::TypeMismatch { .. })
        ));
        assert!(matches!(
            check("context.n", "andrew", serde_json::json!({"n": 1})),
            Err(EvalError::TypeMismatch { expected: "bool", .. })
        ));
        assert!(matches!(
            check(r#"User::"ghost".joblevel > 1"#, "andrew", serde_json::json!({})),
            Err(EvalError::MissingEntity(_))
        ));
    }

    #[test]
    fn test_mixed_type_equality_is_false() {
        assert!(!check(r#"context.n == "1""#, "andrew", serde_json::json!({"n": 1})).unwrap());
        assert!(check(r#"context.n != "1""#, "andrew", serde_json::json!({"n": 1})).unwrap());
    }
}
