//! # Expression Runtime
//!
//! Compiled runtime expressions (`Expr`) evaluated against an
//! [`EvalContext`] holding the current inner and outer tuples. Planner
//! code compiles [`crate::ast::ColumnRef`]/[`crate::ast::OpExpr`] trees
//! into `Expr` once, at install time; operators evaluate the compiled
//! tree on every tuple that flows through them.

use std::cmp::Ordering;

use crate::ast::{self, OpKind};
use crate::error::{Error, Result, UsageError};
use crate::value::{datum_cmp, datum_equal, DataType, Datum};

/// A compiled expression node. `Var` carries the resolved column position
/// (`attno`) and whether it's read from the outer or inner tuple of the
/// operator evaluating it — resolution happens once, at compile time, via
/// [`Scope`].
#[derive(Debug, Clone)]
pub enum Expr {
    Const(Datum),
    Var { attno: usize, is_outer: bool },
    Op { kind: OpKind, args: Vec<Expr> },
}

/// Maps a rule-body variable name to its resolved slot. The planner
/// rebuilds a `Scope` at each chain position: before the first Scan,
/// variables resolve against the delta table's own columns (`is_outer =
/// false`); after a Scan is appended, the newly-joined relation's columns
/// become the "outer" tuple and the accumulated projection becomes
/// "inner".
pub trait Scope {
    fn resolve(&self, var: &str) -> Option<(usize, bool)>;
}

/// Evaluation context: the current inner and outer tuple. `outer` is
/// `None` before any Scan has executed (there is nothing to be outer to
/// yet).
pub struct EvalContext<'a> {
    pub inner: &'a crate::value::Tuple,
    pub outer: Option<&'a crate::value::Tuple>,
}

impl<'a> EvalContext<'a> {
    pub fn new(inner: &'a crate::value::Tuple) -> Self {
        EvalContext { inner, outer: None }
    }

    pub fn with_outer(inner: &'a crate::value::Tuple, outer: &'a crate::value::Tuple) -> Self {
        EvalContext { inner, outer: Some(outer) }
    }
}

/// Compiles an AST column reference (never `Agg`, never `DontCare` — the
/// planner resolves those earlier) into a runtime `Expr`.
pub fn compile(col: &ast::ColumnRef, scope: &dyn Scope, rule_name: &str) -> Result<Expr> {
    match col {
        ast::ColumnRef::Const(c) => Ok(Expr::Const(const_to_datum(c))),
        ast::ColumnRef::Var(v) => {
            let (attno, is_outer) = scope
                .resolve(&v.name)
                .ok_or_else(|| Error::Usage(UsageError::Parse(format!("unresolved variable {}", v.name))))?;
            Ok(Expr::Var { attno, is_outer })
        }
        ast::ColumnRef::Op(op) => compile_op(op, scope, rule_name),
        ast::ColumnRef::DontCare => {
            Err(Error::Usage(UsageError::DontCareMisuse(rule_name.to_string())))
        }
        ast::ColumnRef::Agg(_) => {
            Err(Error::Usage(UsageError::AggregateNotAtTopLevel(rule_name.to_string())))
        }
    }
}

fn compile_op(op: &ast::OpExpr, scope: &dyn Scope, rule_name: &str) -> Result<Expr> {
    let lhs = compile(&op.lhs, scope, rule_name)?;
    let mut args = vec![lhs];
    if let Some(rhs) = &op.rhs {
        args.push(compile(rhs, scope, rule_name)?);
    }
    Ok(Expr::Op { kind: op.kind, args })
}

/// Converts a literal AST constant into its runtime datum. Exposed beyond
/// this module because the installer needs it to build fact tuples
/// straight from a rule's (entirely constant) head columns.
pub fn const_to_datum(c: &ast::ConstExpr) -> Datum {
    match c {
        ast::ConstExpr::Bool(b) => Datum::Bool(*b),
        ast::ConstExpr::Char(c) => Datum::Char(*c),
        ast::ConstExpr::Double(d) => Datum::F64(*d),
        ast::ConstExpr::Int(i) => Datum::I8(*i),
        ast::ConstExpr::String(s) => Datum::String(s.as_str().into()),
    }
}

/// Evaluates a compiled expression against a context. Panics on an
/// unresolvable slot or a type mismatch the compile step should have
/// already ruled out — both are `InvariantViolation`s, not usage errors.
pub fn eval(expr: &Expr, ctx: &EvalContext) -> Datum {
    match expr {
        Expr::Const(d) => d.clone(),
        Expr::Var { attno, is_outer } => {
            let tuple = if *is_outer {
                ctx.outer.expect("outer reference with no outer tuple bound")
            } else {
                ctx.inner
            };
            tuple.get(*attno).clone()
        }
        Expr::Op { kind, args } => eval_op(*kind, args, ctx),
    }
}

fn eval_op(kind: OpKind, args: &[Expr], ctx: &EvalContext) -> Datum {
    if kind == OpKind::Neg {
        let v = eval(&args[0], ctx);
        return match v {
            Datum::I8(n) => Datum::I8(-n),
            Datum::F64(f) => Datum::F64(-f),
            other => panic!("unary minus on non-numeric datum {other:?}"),
        };
    }

    let lhs = eval(&args[0], ctx);
    let rhs = eval(&args[1], ctx);
    match kind {
        OpKind::Add => match (&lhs, &rhs) {
            (Datum::String(a), Datum::String(b)) => Datum::String(format!("{a}{b}").into()),
            (Datum::F64(_), _) | (_, Datum::F64(_)) => Datum::F64(as_f64(&lhs) + as_f64(&rhs)),
            _ => Datum::I8(as_i8(&lhs) + as_i8(&rhs)),
        },
        OpKind::Sub => numeric_binop(&lhs, &rhs, |a, b| a - b, |a, b| a - b),
        OpKind::Mul => numeric_binop(&lhs, &rhs, |a, b| a * b, |a, b| a * b),
        OpKind::Div => numeric_binop(&lhs, &rhs, |a, b| a / b, |a, b| a / b),
        OpKind::Mod => Datum::I8(as_i8(&lhs) % as_i8(&rhs)),
        OpKind::Eq => Datum::Bool(datum_equal(&lhs, &rhs)),
        OpKind::Ne => Datum::Bool(!datum_equal(&lhs, &rhs)),
        OpKind::Lt => Datum::Bool(datum_cmp(&lhs, &rhs) == Ordering::Less),
        OpKind::Le => Datum::Bool(datum_cmp(&lhs, &rhs) != Ordering::Greater),
        OpKind::Gt => Datum::Bool(datum_cmp(&lhs, &rhs) == Ordering::Greater),
        OpKind::Ge => Datum::Bool(datum_cmp(&lhs, &rhs) != Ordering::Less),
        OpKind::Neg => unreachable!("handled above"),
    }
}

fn numeric_binop(lhs: &Datum, rhs: &Datum, f64_op: fn(f64, f64) -> f64, i8_op: fn(i64, i64) -> i64) -> Datum {
    if matches!(lhs, Datum::F64(_)) || matches!(rhs, Datum::F64(_)) {
        Datum::F64(f64_op(as_f64(lhs), as_f64(rhs)))
    } else {
        Datum::I8(i8_op(as_i8(lhs), as_i8(rhs)))
    }
}

fn as_i8(d: &Datum) -> i64 {
    d.as_i8().unwrap_or_else(|| panic!("expected numeric datum, got {:?}", d.data_type()))
}

fn as_f64(d: &Datum) -> f64 {
    d.as_f64().unwrap_or_else(|| panic!("expected numeric datum, got {:?}", d.data_type()))
}

fn eval_bool(expr: &Expr, ctx: &EvalContext) -> bool {
    match eval(expr, ctx) {
        Datum::Bool(b) => b,
        other => panic!("expected bool, got {:?}", other.data_type()),
    }
}

/// Short-circuits on the first `false` qualifier.
pub fn eval_qual_set(quals: &[Expr], ctx: &EvalContext) -> bool {
    quals.iter().all(|q| eval_bool(q, ctx))
}

/// Static typecheck used by the analyzer's qualifier-typing pass: returns
/// the datum type an `OpExpr` tree would produce, given a variable-type
/// resolver, without evaluating anything.
pub fn static_type(col: &ast::ColumnRef, var_type: &dyn Fn(&str) -> Option<DataType>) -> Option<DataType> {
    match col {
        ast::ColumnRef::Const(c) => Some(c.data_type()),
        ast::ColumnRef::Var(v) => var_type(&v.name),
        ast::ColumnRef::DontCare | ast::ColumnRef::Agg(_) => None,
        ast::ColumnRef::Op(op) => {
            let lhs_ty = static_type(&op.lhs, var_type)?;
            if op.kind == OpKind::Neg {
                return Some(lhs_ty);
            }
            let rhs_ty = static_type(op.rhs.as_ref()?, var_type)?;
            if lhs_ty != rhs_ty {
                return None;
            }
            Some(match op.kind {
                OpKind::Eq | OpKind::Ne | OpKind::Lt | OpKind::Le | OpKind::Gt | OpKind::Ge => DataType::Bool,
                _ => lhs_ty,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Schema, Tuple};
    use std::sync::Arc;

    struct MapScope(Vec<(&'static str, usize, bool)>);
    impl Scope for MapScope {
        fn resolve(&self, var: &str) -> Option<(usize, bool)> {
            self.0.iter().find(|(n, _, _)| *n == var).map(|(_, a, o)| (*a, *o))
        }
    }

    #[test]
    fn evaluates_addition_on_integers() {
        let schema = Arc::new(Schema::new(vec![crate::value::DataType::I8], None));
        let tuple = Tuple::make(schema, vec![Datum::I8(5)]);
        let scope = MapScope(vec![("X", 0, false)]);
        let expr = compile(
            &ast::ColumnRef::Op(ast::OpExpr {
                kind: OpKind::Add,
                lhs: Box::new(ast::ColumnRef::Var(ast::VarExpr { name: "X".into() })),
                rhs: Some(Box::new(ast::ColumnRef::Const(ast::ConstExpr::Int(1)))),
            }),
            &scope,
            "r",
        )
        .unwrap();
        let ctx = EvalContext::new(&tuple);
        assert!(matches!(eval(&expr, &ctx), Datum::I8(6)));
    }

    #[test]
    fn qual_set_short_circuits() {
        let schema = Arc::new(Schema::new(vec![crate::value::DataType::I8], None));
        let tuple = Tuple::make(schema, vec![Datum::I8(5)]);
        let ctx = EvalContext::new(&tuple);
        let quals = vec![Expr::Const(Datum::Bool(false)), Expr::Const(Datum::Bool(true))];
        assert!(!eval_qual_set(&quals, &ctx));
    }
}
