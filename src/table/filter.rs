use serde_json::Value;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use std::cmp::Ordering;

use super::{compare_values, values_equal, Item, TableError};

// ============================================================================
// Filter Expressions (in-process evaluation)
// ============================================================================
//
// Expressions are parsed with sqlparser (MySQL dialect, so `?` is a
// positional placeholder) and converted into a small predicate tree:
//
//   - comparisons: = <> != < <= > >=
//   - AND, OR, NOT and parentheses
//   - attribute_exists(a), attribute_not_exists(a), begins_with(a, v),
//     contains(a, v)
//   - operands: attributes, ?, numbers, 'strings', "strings", TRUE, FALSE
//
// AND/OR chains are flattened while converting, so the tree depth is bounded
// by the parser's recursion limit regardless of how many terms a chain has.
//
// ============================================================================

/// Nesting allowed for parentheses and NOT.
const RECURSION_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Attribute(String),
    Arg(usize),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    All(Vec<Node>),
    Any(Vec<Node>),
    Not(Box<Node>),
    Compare(Operand, CmpOp, Operand),
    Exists(String),
    NotExists(String),
    BeginsWith(Operand, Operand),
    Contains(Operand, Operand),
}

/// A parsed filter expression bound to its arguments.
#[derive(Debug, Clone)]
pub(crate) struct FilterExpr {
    root: Node,
    args: Vec<Value>,
}

impl FilterExpr {
    pub fn parse(expr: &str, args: &[Value]) -> Result<Self, TableError> {
        let dialect = MySqlDialect {};
        let mut parser = Parser::new(&dialect)
            .with_recursion_limit(RECURSION_LIMIT)
            .try_with_sql(expr)
            .map_err(parse_error)?;
        let parsed = parser.parse_expr().map_err(parse_error)?;
        parser.expect_token(&Token::EOF).map_err(parse_error)?;

        let mut converter = Converter { next_arg: 0 };
        let root = converter.predicate(parsed)?;
        if converter.next_arg != args.len() {
            return Err(TableError::Filter(format!(
                "{} placeholders but {} arguments",
                converter.next_arg,
                args.len()
            )));
        }
        Ok(Self {
            root,
            args: args.to_vec(),
        })
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.eval(&self.root, item)
    }

    fn eval(&self, node: &Node, item: &Item) -> bool {
        match node {
            Node::All(nodes) => nodes.iter().all(|node| self.eval(node, item)),
            Node::Any(nodes) => nodes.iter().any(|node| self.eval(node, item)),
            Node::Not(inner) => !self.eval(inner, item),
            Node::Exists(name) => item.contains_key(name),
            Node::NotExists(name) => !item.contains_key(name),
            Node::Compare(left, op, right) => {
                let (Some(left), Some(right)) = (self.resolve(left, item), self.resolve(right, item))
                else {
                    return false;
                };
                match op {
                    CmpOp::Eq => values_equal(left, right),
                    CmpOp::Ne => !values_equal(left, right),
                    CmpOp::Lt => compare_values(left, right) == Some(Ordering::Less),
                    CmpOp::Le => matches!(
                        compare_values(left, right),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    CmpOp::Gt => compare_values(left, right) == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(
                        compare_values(left, right),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                }
            }
            Node::BeginsWith(target, prefix) => {
                match (self.resolve(target, item), self.resolve(prefix, item)) {
                    (Some(Value::String(s)), Some(Value::String(p))) => s.starts_with(p.as_str()),
                    _ => false,
                }
            }
            Node::Contains(target, needle) => {
                match (self.resolve(target, item), self.resolve(needle, item)) {
                    (Some(Value::String(s)), Some(Value::String(n))) => s.contains(n.as_str()),
                    (Some(Value::Array(values)), Some(n)) => {
                        values.iter().any(|v| values_equal(v, n))
                    }
                    _ => false,
                }
            }
        }
    }

    fn resolve<'a>(&'a self, operand: &'a Operand, item: &'a Item) -> Option<&'a Value> {
        match operand {
            Operand::Attribute(name) => item.get(name),
            Operand::Arg(index) => self.args.get(*index),
            Operand::Literal(value) => Some(value),
        }
    }
}

fn parse_error(err: sqlparser::parser::ParserError) -> TableError {
    TableError::Filter(err.to_string())
}

fn unsupported(what: impl std::fmt::Debug) -> TableError {
    TableError::Filter(format!("unsupported filter expression: {what:?}"))
}

// ============================================================================
// sqlparser AST -> predicate tree
// ============================================================================

/// Converts in source order so `?` placeholders bind left to right.
struct Converter {
    next_arg: usize,
}

impl Converter {
    fn predicate(&mut self, expr: sql_ast::Expr) -> Result<Node, TableError> {
        match expr {
            sql_ast::Expr::Nested(inner) => self.predicate(*inner),
            sql_ast::Expr::UnaryOp {
                op: sql_ast::UnaryOperator::Not,
                expr,
            } => Ok(Node::Not(Box::new(self.predicate(*expr)?))),
            sql_ast::Expr::BinaryOp {
                left,
                op: op @ (sql_ast::BinaryOperator::And | sql_ast::BinaryOperator::Or),
                right,
            } => {
                let terms = flatten(*left, *right, &op);
                let nodes = terms
                    .into_iter()
                    .map(|term| self.predicate(term))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(match op {
                    sql_ast::BinaryOperator::And => Node::All(nodes),
                    _ => Node::Any(nodes),
                })
            }
            sql_ast::Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    sql_ast::BinaryOperator::Eq => CmpOp::Eq,
                    sql_ast::BinaryOperator::NotEq => CmpOp::Ne,
                    sql_ast::BinaryOperator::Lt => CmpOp::Lt,
                    sql_ast::BinaryOperator::LtEq => CmpOp::Le,
                    sql_ast::BinaryOperator::Gt => CmpOp::Gt,
                    sql_ast::BinaryOperator::GtEq => CmpOp::Ge,
                    other => return Err(unsupported(other)),
                };
                let left = self.operand(*left)?;
                let right = self.operand(*right)?;
                Ok(Node::Compare(left, op, right))
            }
            sql_ast::Expr::Function(func) => self.function(func),
            other => Err(unsupported(other)),
        }
    }

    fn function(&mut self, func: sql_ast::Function) -> Result<Node, TableError> {
        let name = func.name.to_string().to_ascii_lowercase();
        let sql_ast::FunctionArguments::List(list) = func.args else {
            return Err(TableError::Filter(format!("{name} expects arguments")));
        };
        let mut args = list
            .args
            .into_iter()
            .map(|arg| match arg {
                sql_ast::FunctionArg::Unnamed(sql_ast::FunctionArgExpr::Expr(expr)) => Ok(expr),
                other => Err(unsupported(other)),
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();

        let node = match (name.as_str(), args.len()) {
            ("attribute_exists" | "attribute_not_exists", 1) => {
                let attribute = match args.next().map(|arg| self.operand(arg)).transpose()? {
                    Some(Operand::Attribute(attribute)) => attribute,
                    other => {
                        return Err(TableError::Filter(format!(
                            "{name} expects an attribute, found {other:?}"
                        )))
                    }
                };
                if name == "attribute_exists" {
                    Node::Exists(attribute)
                } else {
                    Node::NotExists(attribute)
                }
            }
            ("begins_with" | "contains", 2) => {
                let (Some(target), Some(arg)) = (args.next(), args.next()) else {
                    return Err(TableError::Filter(format!("{name} expects two arguments")));
                };
                let target = self.operand(target)?;
                let arg = self.operand(arg)?;
                if name == "begins_with" {
                    Node::BeginsWith(target, arg)
                } else {
                    Node::Contains(target, arg)
                }
            }
            (_, count) => {
                return Err(TableError::Filter(format!(
                    "unknown function {name} with {count} arguments"
                )))
            }
        };
        Ok(node)
    }

    fn operand(&mut self, expr: sql_ast::Expr) -> Result<Operand, TableError> {
        match expr {
            sql_ast::Expr::Nested(inner) => self.operand(*inner),
            sql_ast::Expr::Identifier(ident) => Ok(Operand::Attribute(ident.value)),
            sql_ast::Expr::CompoundIdentifier(idents) => Ok(Operand::Attribute(
                idents
                    .into_iter()
                    .map(|ident| ident.value)
                    .collect::<Vec<_>>()
                    .join("."),
            )),
            sql_ast::Expr::Value(value) => self.value(value.value, false),
            sql_ast::Expr::UnaryOp {
                op: sql_ast::UnaryOperator::Minus,
                expr,
            } => match *expr {
                sql_ast::Expr::Value(value) => self.value(value.value, true),
                other => Err(unsupported(other)),
            },
            other => Err(unsupported(other)),
        }
    }

    fn value(&mut self, value: sql_ast::Value, negate: bool) -> Result<Operand, TableError> {
        let literal = match value {
            sql_ast::Value::Placeholder(p) if p == "?" && !negate => {
                let index = self.next_arg;
                self.next_arg += 1;
                return Ok(Operand::Arg(index));
            }
            sql_ast::Value::Number(text, _) => number(&text, negate)?,
            sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s)
                if !negate =>
            {
                Value::String(s)
            }
            sql_ast::Value::Boolean(b) if !negate => Value::Bool(b),
            sql_ast::Value::Null if !negate => Value::Null,
            other => return Err(unsupported(other)),
        };
        Ok(Operand::Literal(literal))
    }
}

/// Operands of a left- or right-leaning chain of the same boolean operator,
/// in source order, collected without recursion.
fn flatten(left: sql_ast::Expr, right: sql_ast::Expr, op: &sql_ast::BinaryOperator) -> Vec<sql_ast::Expr> {
    let mut terms = Vec::new();
    let mut stack = vec![right, left];
    while let Some(expr) = stack.pop() {
        match expr {
            sql_ast::Expr::BinaryOp {
                left,
                op: inner,
                right,
            } if inner == *op => {
                stack.push(*right);
                stack.push(*left);
            }
            other => terms.push(other),
        }
    }
    terms
}

fn number(text: &str, negate: bool) -> Result<Value, TableError> {
    let text = if negate { format!("-{text}") } else { text.to_string() };
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| TableError::Filter(format!("bad number {text:?}")))
}
