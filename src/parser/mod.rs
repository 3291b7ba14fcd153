//! # Rule-Source Parser
//!
//! Parses C4 program source text into the AST defined in [`crate::ast`].
//! Grammar lives in `c4.pest`; productions map close to 1:1 onto AST node
//! kinds, so this module is mostly tree-shape translation rather than
//! logic of its own.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::ast::*;
use crate::error::{Error, UsageError};

#[derive(Parser)]
#[grammar = "parser/c4.pest"]
struct C4Parser;

/// Parses a full program. This is the sole entry point into the parser;
/// grammar internals beyond this boundary are not part of the contract
/// the rest of the crate depends on.
pub fn parse_program(src: &str) -> Result<Program, Error> {
    let mut pairs = C4Parser::parse(Rule::program, src)
        .map_err(|e| Error::Usage(UsageError::Parse(e.to_string())))?;
    let program_pair = pairs.next().expect("program rule always produces one pair");

    let mut program = Program::new();
    for stmt in program_pair.into_inner() {
        match stmt.as_rule() {
            Rule::define_stmt => program.defines.push(parse_define(stmt)?),
            Rule::timer_stmt => program.timers.push(parse_timer(stmt)?),
            Rule::rule_stmt => match parse_rule_stmt(stmt)? {
                RuleOrFact::Rule(r) => program.rules.push(r),
                RuleOrFact::Fact(f) => program.facts.push(f),
            },
            Rule::EOI => {}
            other => unreachable!("unexpected top-level rule {other:?}"),
        }
    }
    Ok(program)
}

fn parse_define(pair: Pair<Rule>) -> Result<Define, Error> {
    let mut inner = pair.into_inner().peekable();
    let storage = if inner.peek().is_some_and(|p| p.as_rule() == Rule::storage_kw) {
        inner.next();
        crate::storage::StorageKind::Sqlite
    } else {
        crate::storage::StorageKind::Memory
    };
    let name = inner.next().unwrap().as_str().to_string();
    let mut columns = Vec::new();
    let mut keys = Vec::new();
    for p in inner {
        match p.as_rule() {
            Rule::schema_elt => columns.push(parse_schema_elt(p)),
            Rule::keys_clause => {
                for k in p.into_inner() {
                    let n: usize = k
                        .as_str()
                        .parse()
                        .map_err(|_| Error::Usage(UsageError::Parse(format!("bad key index {}", k.as_str()))))?;
                    keys.push(n);
                }
            }
            other => unreachable!("unexpected define child {other:?}"),
        }
    }
    Ok(Define { name, columns, keys, storage })
}

fn parse_schema_elt(pair: Pair<Rule>) -> SchemaElt {
    let text = pair.as_str();
    let is_loc_spec = text.trim_end().ends_with('@');
    let type_name = text.trim_end().trim_end_matches('@').trim().to_string();
    SchemaElt { type_name, is_loc_spec }
}

fn parse_timer(pair: Pair<Rule>) -> Result<Timer, Error> {
    let mut inner = pair.into_inner();
    let name = inner.next().unwrap().as_str().to_string();
    let period_ms: i64 = inner
        .next()
        .unwrap()
        .as_str()
        .parse()
        .map_err(|_| Error::Usage(UsageError::Parse("bad timer period".into())))?;
    Ok(Timer { name, period_ms })
}

enum RuleOrFact {
    Rule(Rule2),
    Fact(Fact),
}

// Local alias to avoid clashing with pest's generated `Rule` enum.
type Rule2 = crate::ast::Rule;

fn parse_rule_stmt(pair: Pair<Rule>) -> Result<RuleOrFact, Error> {
    let mut inner = pair.into_inner();
    let head = parse_table_ref(inner.next().unwrap())?;
    let body_pair = inner.next();

    let body = match body_pair {
        Some(b) if b.as_rule() == Rule::body => parse_body(b)?,
        _ => RuleBody::default(),
    };

    if body.joins.is_empty() && body.quals.is_empty() {
        return Ok(RuleOrFact::Fact(Fact { table: head }));
    }
    Ok(RuleOrFact::Rule(Rule2 { name: None, head, body }))
}

fn parse_body(pair: Pair<Rule>) -> Result<RuleBody, Error> {
    let mut body = RuleBody::default();
    for term in pair.into_inner() {
        match term.as_rule() {
            Rule::join => body.joins.push(JoinClause {
                table: parse_table_ref(term.into_inner().next().unwrap())?,
                negated: false,
            }),
            Rule::negated_join => body.joins.push(JoinClause {
                table: parse_table_ref(term.into_inner().next().unwrap())?,
                negated: true,
            }),
            Rule::qualifier => body.quals.push(Qualifier {
                expr: expect_op(parse_expr(term.into_inner().next().unwrap())?),
            }),
            other => unreachable!("unexpected body term {other:?}"),
        }
    }
    Ok(body)
}

fn expect_op(col: ColumnRef) -> OpExpr {
    match col {
        ColumnRef::Op(op) => op,
        // A bare variable/constant as a qualifier is not a boolean
        // expression; surfaced here as a degenerate equality so the
        // analyzer's qualifier-typing pass rejects it with a type error
        // instead of this module needing its own type table.
        other => OpExpr { kind: OpKind::Eq, lhs: Box::new(other), rhs: None },
    }
}

fn parse_table_ref(pair: Pair<Rule>) -> Result<TableRef, Error> {
    let mut inner = pair.into_inner();
    let name = inner.next().unwrap().as_str().to_string();
    let mut columns = Vec::new();
    for c in inner {
        columns.push(parse_column_ref(c)?);
    }
    Ok(TableRef { name, columns })
}

fn parse_column_ref(pair: Pair<Rule>) -> Result<ColumnRef, Error> {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::agg_expr => parse_agg_expr(inner),
        Rule::expr => parse_expr(inner),
        other => unreachable!("unexpected column_ref child {other:?}"),
    }
}

fn parse_agg_expr(pair: Pair<Rule>) -> Result<ColumnRef, Error> {
    let mut inner = pair.into_inner();
    let kind_str = inner.next().unwrap().as_str();
    let kind = match kind_str {
        "count" => AggKind::Count,
        "sum" => AggKind::Sum,
        "avg" => AggKind::Avg,
        "min" => AggKind::Min,
        "max" => AggKind::Max,
        other => unreachable!("unexpected agg kind {other:?}"),
    };
    let arg = parse_expr(inner.next().unwrap())?;
    Ok(ColumnRef::Agg(AggExpr { kind, arg: Box::new(arg) }))
}

/// `expr = comparison`; unwraps straight through to `comparison`.
fn parse_expr(pair: Pair<Rule>) -> Result<ColumnRef, Error> {
    parse_comparison(pair.into_inner().next().unwrap())
}

fn parse_comparison(pair: Pair<Rule>) -> Result<ColumnRef, Error> {
    let mut inner = pair.into_inner();
    let lhs = parse_additive(inner.next().unwrap())?;
    if let Some(op_pair) = inner.next() {
        let kind = match op_pair.as_str() {
            "=" => OpKind::Eq,
            "!=" => OpKind::Ne,
            "<=" => OpKind::Le,
            ">=" => OpKind::Ge,
            "<" => OpKind::Lt,
            ">" => OpKind::Gt,
            other => unreachable!("unexpected comp_op {other:?}"),
        };
        let rhs = parse_additive(inner.next().unwrap())?;
        return Ok(ColumnRef::Op(OpExpr { kind, lhs: Box::new(lhs), rhs: Some(Box::new(rhs)) }));
    }
    Ok(lhs)
}

fn parse_additive(pair: Pair<Rule>) -> Result<ColumnRef, Error> {
    let mut inner = pair.into_inner();
    let mut acc = parse_multiplicative(inner.next().unwrap())?;
    while let Some(op_pair) = inner.next() {
        let kind = match op_pair.as_str() {
            "+" => OpKind::Add,
            "-" => OpKind::Sub,
            other => unreachable!("unexpected add_op {other:?}"),
        };
        let rhs = parse_multiplicative(inner.next().unwrap())?;
        acc = ColumnRef::Op(OpExpr { kind, lhs: Box::new(acc), rhs: Some(Box::new(rhs)) });
    }
    Ok(acc)
}

fn parse_multiplicative(pair: Pair<Rule>) -> Result<ColumnRef, Error> {
    let mut inner = pair.into_inner();
    let mut acc = parse_unary(inner.next().unwrap())?;
    while let Some(op_pair) = inner.next() {
        let kind = match op_pair.as_str() {
            "*" => OpKind::Mul,
            "/" => OpKind::Div,
            "%" => OpKind::Mod,
            other => unreachable!("unexpected mul_op {other:?}"),
        };
        let rhs = parse_unary(inner.next().unwrap())?;
        acc = ColumnRef::Op(OpExpr { kind, lhs: Box::new(acc), rhs: Some(Box::new(rhs)) });
    }
    Ok(acc)
}

fn parse_unary(pair: Pair<Rule>) -> Result<ColumnRef, Error> {
    let mut negate = false;
    let mut atom_pair = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::neg_op => negate = true,
            Rule::atom => atom_pair = Some(p),
            other => unreachable!("unexpected unary child {other:?}"),
        }
    }
    let atom = parse_atom(atom_pair.expect("unary always has an atom"))?;
    if negate {
        return Ok(ColumnRef::Op(OpExpr { kind: OpKind::Neg, lhs: Box::new(atom), rhs: None }));
    }
    Ok(atom)
}

fn parse_atom(pair: Pair<Rule>) -> Result<ColumnRef, Error> {
    let inner = pair.into_inner().next().unwrap();
    Ok(match inner.as_rule() {
        Rule::bool_lit => ColumnRef::Const(ConstExpr::Bool(inner.as_str() == "true")),
        Rule::string_lit => {
            let s = inner.as_str();
            ColumnRef::Const(ConstExpr::String(s[1..s.len() - 1].to_string()))
        }
        Rule::char_lit => {
            let s = inner.as_str().as_bytes();
            ColumnRef::Const(ConstExpr::Char(s[1]))
        }
        Rule::float_lit => {
            let v: f64 = inner
                .as_str()
                .parse()
                .map_err(|_| Error::Usage(UsageError::Parse(format!("bad float {}", inner.as_str()))))?;
            ColumnRef::Const(ConstExpr::Double(v))
        }
        Rule::int_lit => {
            let v: i64 = inner
                .as_str()
                .parse()
                .map_err(|_| Error::Usage(UsageError::Parse(format!("bad int {}", inner.as_str()))))?;
            ColumnRef::Const(ConstExpr::Int(v))
        }
        Rule::don_care => ColumnRef::DontCare,
        Rule::ident => ColumnRef::Var(VarExpr { name: inner.as_str().to_string() }),
        Rule::expr => return parse_expr(inner),
        other => unreachable!("unexpected atom child {other:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_define_with_keys_and_loc_spec() {
        let prog = parse_program("ping(string@, string, int8) keys(0,1);").unwrap();
        assert_eq!(prog.defines.len(), 1);
        let d = &prog.defines[0];
        assert_eq!(d.name, "ping");
        assert!(d.columns[0].is_loc_spec);
        assert_eq!(d.keys, vec![0, 1]);
    }

    #[test]
    fn parses_sql_storage_keyword() {
        let prog = parse_program("sql t(int8) keys(0); u(int8) keys(0);").unwrap();
        assert_eq!(prog.defines[0].storage, crate::storage::StorageKind::Sqlite);
        assert_eq!(prog.defines[1].storage, crate::storage::StorageKind::Memory);
    }

    #[test]
    fn parses_timer() {
        let prog = parse_program("timer(tick, 1000);").unwrap();
        assert_eq!(prog.timers.len(), 1);
        assert_eq!(prog.timers[0].period_ms, 1000);
    }

    #[test]
    fn parses_fact_vs_rule() {
        let prog = parse_program("edge(1,2); path(X,Y) :- edge(X,Y);").unwrap();
        assert_eq!(prog.facts.len(), 1);
        assert_eq!(prog.rules.len(), 1);
        assert_eq!(prog.rules[0].body.joins.len(), 1);
    }

    #[test]
    fn parses_negation_and_qualifier() {
        let prog = parse_program("q(A) :- notin p(A);").unwrap();
        assert_eq!(prog.rules.len(), 1);
        assert!(prog.rules[0].body.joins[0].negated);
    }

    #[test]
    fn parses_aggregate_head_column() {
        let prog = parse_program("r(X, count<Y>) :- b(X,Y);").unwrap();
        let head = &prog.rules[0].head;
        assert!(matches!(head.columns[1], ColumnRef::Agg(_)));
    }

    #[test]
    fn respects_arithmetic_precedence() {
        let prog = parse_program("b(X,Y+1) :- b(X,Y), Y<150000;").unwrap();
        let rule = &prog.rules[0];
        assert!(matches!(rule.head.columns[1], ColumnRef::Op(_)));
        assert_eq!(rule.body.quals.len(), 1);
    }
}
