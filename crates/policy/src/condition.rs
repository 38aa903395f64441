//! Compiled conditions and their evaluator.
//!
//! Evaluation walks the AST against a JSON context. Values are borrowed
//! from the context and from the AST's literals; only `lower`/`upper`
//! allocate.

use crate::functions::Builtin;
use actionguard_core::EvaluationError;
use std::borrow::Cow;

/// A value produced while evaluating a condition.
#[derive(Debug, Clone)]
pub(crate) enum Val<'a> {
    /// A path that does not resolve.
    Absent,
    Null,
    Bool(bool),
    Num(f64),
    Str(Cow<'a, str>),
    /// Arrays and objects.
    Json(&'a serde_json::Value),
}

impl<'a> From<&'a serde_json::Value> for Val<'a> {
    fn from(value: &'a serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Val::Null,
            serde_json::Value::Bool(b) => Val::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map_or(Val::Null, Val::Num),
            serde_json::Value::String(s) => Val::Str(Cow::Borrowed(s.as_str())),
            other => Val::Json(other),
        }
    }
}

impl Val<'_> {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Val::Absent => "absent",
            Val::Null => "null",
            Val::Bool(_) => "bool",
            Val::Num(_) => "number",
            Val::Str(_) => "string",
            Val::Json(serde_json::Value::Array(_)) => "array",
            Val::Json(_) => "object",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Val::Absent | Val::Null => false,
            Val::Bool(b) => *b,
            Val::Num(n) => *n != 0.0,
            Val::Str(s) => !s.is_empty(),
            Val::Json(serde_json::Value::Array(items)) => !items.is_empty(),
            Val::Json(serde_json::Value::Object(map)) => !map.is_empty(),
            Val::Json(_) => true,
        }
    }

    /// Equality across present values. Mismatched types are unequal.
    pub(crate) fn loose_eq(&self, other: &Val<'_>) -> bool {
        match (self, other) {
            (Val::Null, Val::Null) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Num(a), Val::Num(b)) => (a - b).abs() < f64::EPSILON,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Json(a), Val::Json(b)) => a == b,
            _ => false,
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Gte => ">=",
            CmpOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    /// Root key followed by nested keys.
    Path(Vec<String>),
    Literal(Literal),
    Call { func: Builtin, args: Vec<Operand> },
}

/// A parsed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Always,
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        op: CmpOp,
        left: Operand,
        right: Operand,
    },
    /// A bare operand, e.g. `contains_pii(parameters)`.
    Truthy(Operand),
}

/// A condition compiled once at policy load and evaluated per action.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    source: String,
    expr: Expr,
}

impl CompiledCondition {
    pub(crate) fn new(source: impl Into<String>, expr: Expr) -> Self {
        Self {
            source: source.into(),
            expr,
        }
    }

    /// A condition that always holds (empty source).
    pub fn always() -> Self {
        Self::new("", Expr::Always)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_always(&self) -> bool {
        self.expr == Expr::Always
    }

    /// Evaluate against a JSON object context.
    pub fn evaluate(&self, ctx: &serde_json::Value) -> Result<bool, EvaluationError> {
        eval_expr(&self.expr, ctx)
    }
}

fn eval_expr(expr: &Expr, ctx: &serde_json::Value) -> Result<bool, EvaluationError> {
    match expr {
        Expr::Always => Ok(true),
        Expr::Or(terms) => {
            for term in terms {
                if eval_expr(term, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::And(terms) => {
            for term in terms {
                if !eval_expr(term, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Not(inner) => Ok(!eval_expr(inner, ctx)?),
        Expr::Truthy(operand) => Ok(eval_operand(operand, ctx)?.truthy()),
        Expr::Compare { op, left, right } => {
            let l = eval_operand(left, ctx)?;
            let r = eval_operand(right, ctx)?;
            compare(*op, &l, &r)
        }
    }
}

fn eval_operand<'a>(operand: &'a Operand, ctx: &'a serde_json::Value) -> Result<Val<'a>, EvaluationError> {
    match operand {
        Operand::Literal(Literal::Str(s)) => Ok(Val::Str(Cow::Borrowed(s.as_str()))),
        Operand::Literal(Literal::Num(n)) => Ok(Val::Num(*n)),
        Operand::Literal(Literal::Bool(b)) => Ok(Val::Bool(*b)),
        Operand::Literal(Literal::Null) => Ok(Val::Null),
        Operand::Path(segments) => resolve_path(segments, ctx),
        Operand::Call { func, args } => {
            let values = args
                .iter()
                .map(|arg| eval_operand(arg, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            func.call(values)
        }
    }
}

/// Safe traversal: an unknown root is an error, a missing leaf is absent.
fn resolve_path<'a>(segments: &[String], ctx: &'a serde_json::Value) -> Result<Val<'a>, EvaluationError> {
    let Some((root, rest)) = segments.split_first() else {
        return Ok(Val::Absent);
    };
    let mut current = ctx
        .get(root)
        .ok_or_else(|| EvaluationError::UnknownRoot(root.clone()))?;
    for segment in rest {
        let next = match current {
            serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            other => other.get(segment),
        };
        match next {
            Some(next) => current = next,
            None => return Ok(Val::Absent),
        }
    }
    Ok(Val::from(current))
}

fn compare(op: CmpOp, left: &Val<'_>, right: &Val<'_>) -> Result<bool, EvaluationError> {
    let nullish = |v: &Val<'_>| matches!(v, Val::Absent | Val::Null);

    // Presence checks: `x == null` / `x != null`.
    if matches!(op, CmpOp::Eq | CmpOp::NotEq)
        && (matches!(left, Val::Null) || matches!(right, Val::Null))
    {
        let both_nullish = nullish(left) && nullish(right);
        return Ok((op == CmpOp::Eq) == both_nullish);
    }
    if nullish(left) || nullish(right) {
        return Ok(false);
    }

    match op {
        CmpOp::Eq => Ok(left.loose_eq(right)),
        CmpOp::NotEq => Ok(!left.loose_eq(right)),
        CmpOp::Gt | CmpOp::Lt | CmpOp::Gte | CmpOp::Lte => {
            let ordering = match (left, right) {
                (Val::Num(a), Val::Num(b)) => a.partial_cmp(b),
                (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(EvaluationError::TypeMismatch {
                        op: op.symbol().into(),
                        left: left.type_name().into(),
                        right: right.type_name().into(),
                    });
                }
            };
            let Some(ordering) = ordering else {
                return Ok(false);
            };
            Ok(match op {
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Gte => ordering.is_ge(),
                _ => ordering.is_le(),
            })
        }
    }
}
