//! # Planner
//!
//! Turns each analyzed rule into one [`OpChainPlan`] per body join clause
//! (the join's relation is that chain's *delta table*). Construction is
//! head-last: seed on the delta join, extract satisfiable qualifiers into
//! an initial Filter, walk the remaining joins appending Scan nodes (each
//! extracting any newly-satisfiable qualifiers), then append a terminal
//! Insert (or, for aggregate rule heads, an Agg node that writes the head
//! table itself).
//!
//! **Simplification versus a fully size-optimized rewrite:** this
//! planner carries every variable bound so far forward at each Scan's
//! projection rather than computing the minimal downstream-referenced
//! subset. Projection-minimization is a space optimization, not a
//! correctness requirement; `skip_proj` is still tracked on
//! `PlanNode::Scan` for structural fidelity, but in this model a Scan
//! already produces exactly the tuple it hands onward, so the flag
//! carries no extra behavior.

use std::collections::{HashMap, HashSet};

use std::sync::Arc;

use crate::analyzer::{AnalyzedProgram, AnalyzedRule, TableShape};
use crate::ast::{AggKind, ColumnRef, JoinClause, Qualifier};
use crate::error::{Error, Result, UsageError};
use crate::expr::{self, Expr, Scope};
use crate::value::{DataType, Schema};

#[derive(Debug, Clone)]
pub enum PlanNode {
    Filter {
        quals: Vec<Expr>,
    },
    Scan {
        relation: String,
        negated: bool,
        quals: Vec<Expr>,
        proj: Vec<Expr>,
        /// Schema of the tuple `proj` builds — computed at plan time so
        /// the operator runtime never needs to infer types from values.
        proj_schema: Arc<Schema>,
        skip_proj: bool,
    },
    Insert {
        head_table: String,
        proj: Vec<Expr>,
        do_delete: bool,
    },
    Agg {
        head_table: String,
        /// Compiled non-aggregate head columns, in head column order minus
        /// the aggregate column itself.
        group_proj: Vec<Expr>,
        /// Schema of the tuple `group_proj` builds — the group-by key
        /// used to index `AggOperator`'s running state.
        group_schema: Arc<Schema>,
        /// Where among the head's columns the aggregate result goes back
        /// in, so the output tuple can be reassembled in head order.
        agg_col_index: usize,
        kind: AggKind,
        agg_arg: Expr,
        do_delete: bool,
    },
}

#[derive(Debug, Clone)]
pub struct OpChainPlan {
    pub delta_table: String,
    pub head_table: String,
    pub nodes: Vec<PlanNode>,
}

#[derive(Debug, Clone)]
pub struct RulePlan {
    pub name: String,
    pub chains: Vec<OpChainPlan>,
}

pub struct ProgramPlan {
    pub rules: Vec<RulePlan>,
}

struct BoundScope {
    /// name -> (attno in current flat tuple, type)
    vars: HashMap<String, (usize, DataType)>,
}

impl Scope for BoundScope {
    fn resolve(&self, var: &str) -> Option<(usize, bool)> {
        self.vars.get(var).map(|(attno, _)| (*attno, false))
    }
}

/// Combines an already-bound (inner) scope with a newly-joined (outer)
/// relation's own columns, for compiling a Scan's quals/projection.
struct CombinedScope<'a> {
    inner: &'a BoundScope,
    outer: &'a HashMap<String, (usize, DataType)>,
}

impl<'a> Scope for CombinedScope<'a> {
    fn resolve(&self, var: &str) -> Option<(usize, bool)> {
        if let Some((attno, _)) = self.inner.vars.get(var) {
            return Some((*attno, false));
        }
        self.outer.get(var).map(|(attno, _)| (*attno, true))
    }
}

pub fn plan_program(
    analyzed: &AnalyzedProgram,
    shapes: &HashMap<String, TableShape>,
) -> Result<ProgramPlan> {
    let mut rules = Vec::with_capacity(analyzed.rules.len());
    for rule in &analyzed.rules {
        rules.push(plan_rule(rule, shapes)?);
    }
    Ok(ProgramPlan { rules })
}

fn join_vars(join: &JoinClause) -> Vec<(String, usize)> {
    join.table
        .columns
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match c {
            ColumnRef::Var(v) => Some((v.name.clone(), i)),
            _ => None,
        })
        .collect()
}

fn free_vars_of_qual(q: &Qualifier) -> HashSet<String> {
    fn walk(col: &ColumnRef, out: &mut HashSet<String>) {
        match col {
            ColumnRef::Var(v) => {
                out.insert(v.name.clone());
            }
            ColumnRef::Op(op) => {
                walk(&op.lhs, out);
                if let Some(rhs) = &op.rhs {
                    walk(rhs, out);
                }
            }
            ColumnRef::Agg(a) => walk(&a.arg, out),
            ColumnRef::Const(_) | ColumnRef::DontCare => {}
        }
    }
    let mut out = HashSet::new();
    walk(&ColumnRef::Op(q.expr.clone()), &mut out);
    out
}

fn plan_rule(rule: &AnalyzedRule, shapes: &HashMap<String, TableShape>) -> Result<RulePlan> {
    let mut chains = Vec::with_capacity(rule.body.joins.len());
    for (anchor_idx, anchor) in rule.body.joins.iter().enumerate() {
        chains.push(plan_chain(rule, anchor_idx, anchor, shapes)?);
    }
    Ok(RulePlan { name: rule.name.clone(), chains })
}

fn plan_chain(
    rule: &AnalyzedRule,
    anchor_idx: usize,
    anchor: &JoinClause,
    shapes: &HashMap<String, TableShape>,
) -> Result<OpChainPlan> {
    let anchor_shape = shapes
        .get(&anchor.table.name)
        .ok_or_else(|| Error::Usage(UsageError::UnknownTable(anchor.table.name.clone())))?;

    let mut bound = BoundScope { vars: HashMap::new() };
    for (name, colno) in join_vars(anchor) {
        let ty = anchor_shape.schema.column_type(colno);
        bound.vars.insert(name, (colno, ty));
    }

    let mut remaining_quals: Vec<&Qualifier> = rule.body.quals.iter().collect();
    let mut nodes = Vec::new();

    let (initial_quals, satisfied) = extract_satisfiable(&remaining_quals, &bound.vars);
    if !initial_quals.is_empty() {
        let compiled: Vec<Expr> =
            initial_quals.iter().map(|q| expr::compile(&ColumnRef::Op(q.expr.clone()), &bound, &rule.name)).collect::<Result<_>>()?;
        nodes.push(PlanNode::Filter { quals: compiled });
    }
    remove_at(&mut remaining_quals, &satisfied);

    let mut todo: Vec<(usize, &JoinClause)> =
        rule.body.joins.iter().enumerate().filter(|(i, _)| *i != anchor_idx).collect();

    while !todo.is_empty() {
        let (_, join) = todo.remove(0);
        let shape = shapes
            .get(&join.table.name)
            .ok_or_else(|| Error::Usage(UsageError::UnknownTable(join.table.name.clone())))?;

        let mut outer: HashMap<String, (usize, DataType)> = HashMap::new();
        for (name, colno) in join_vars(join) {
            let ty = shape.schema.column_type(colno);
            outer.insert(name, (colno, ty));
        }

        let mut candidate_bound: HashMap<String, (usize, DataType)> = bound.vars.clone();
        for (name, v) in &outer {
            candidate_bound.entry(name.clone()).or_insert(*v);
        }
        let (quals_here, sat) = extract_satisfiable(&remaining_quals, &candidate_bound);
        remove_at(&mut remaining_quals, &sat);

        let combined = CombinedScope { inner: &bound, outer: &outer };
        let compiled_quals: Vec<Expr> =
            quals_here.iter().map(|q| expr::compile(&ColumnRef::Op(q.expr.clone()), &combined, &rule.name)).collect::<Result<_>>()?;

        // A negated join (anti-join) contributes no new bound variables:
        // its own columns are only visible to `compiled_quals` above, to
        // test whether a matching row exists, never to anything
        // downstream. A positive join carries forward every
        // currently-bound variable and appends its own.
        let mut new_order: Vec<String> = bound.vars.keys().cloned().collect();
        new_order.sort();
        if !join.negated {
            for (name, _) in join_vars(join) {
                if !bound.vars.contains_key(&name) {
                    new_order.push(name);
                }
            }
        }
        let proj: Vec<Expr> = new_order
            .iter()
            .map(|name| {
                let (attno, is_outer) = combined.resolve(name).expect("bound var must resolve");
                Ok(Expr::Var { attno, is_outer })
            })
            .collect::<Result<_>>()?;
        let proj_types: Vec<DataType> = new_order
            .iter()
            .map(|name| {
                bound
                    .vars
                    .get(name)
                    .map(|(_, t)| *t)
                    .or_else(|| outer.get(name).map(|(_, t)| *t))
                    .expect("every name in new_order is bound by the prior scope or this join")
            })
            .collect();
        let proj_schema = Arc::new(Schema::new(proj_types, None));

        let skip_proj = todo.is_empty() && nodes_will_end_without_project(rule);

        nodes.push(PlanNode::Scan {
            relation: join.table.name.clone(),
            negated: join.negated,
            quals: compiled_quals,
            proj,
            proj_schema,
            skip_proj,
        });

        let mut new_vars = HashMap::new();
        for (i, name) in new_order.iter().enumerate() {
            let ty = bound
                .vars
                .get(name)
                .map(|(_, t)| *t)
                .or_else(|| outer.get(name).map(|(_, t)| *t))
                .expect("every name in new_order is bound by the prior scope or this join");
            new_vars.insert(name.clone(), (i, ty));
        }
        bound = BoundScope { vars: new_vars };
    }

    if !remaining_quals.is_empty() {
        return Err(Error::Usage(UsageError::UnsatisfiableQualifiers(rule.name.clone())));
    }

    let head_table = rule.head.name.clone();
    let is_agg_rule = rule.head.columns.iter().any(|c| matches!(c, ColumnRef::Agg(_)));

    if is_agg_rule {
        let mut agg_kind = None;
        let mut agg_arg_expr = None;
        let mut agg_col_index = None;
        let mut group_cols = Vec::new();
        let mut group_types = Vec::new();
        for (i, col) in rule.head.columns.iter().enumerate() {
            match col {
                ColumnRef::Agg(a) => {
                    if agg_kind.is_some() {
                        return Err(Error::Usage(UsageError::AggregateNotAtTopLevel(rule.name.clone())));
                    }
                    agg_kind = Some(a.kind);
                    agg_col_index = Some(i);
                    agg_arg_expr = Some(expr::compile(&a.arg, &bound, &rule.name)?);
                }
                other => {
                    group_cols.push(expr::compile(other, &bound, &rule.name)?);
                    let var_type = |name: &str| bound.vars.get(name).map(|(_, t)| *t);
                    group_types.push(
                        expr::static_type(other, &var_type)
                            .expect("analyzer already typechecked every head column"),
                    );
                }
            }
        }
        let kind = agg_kind.ok_or_else(|| Error::Usage(UsageError::AggregateNotAtTopLevel(rule.name.clone())))?;
        if matches!(kind, AggKind::Min | AggKind::Max | AggKind::Avg) {
            return Err(Error::Usage(UsageError::Parse(format!(
                "aggregate {kind:?} has no backward-transition implementation (ambiguous init semantics); rule {}",
                rule.name
            ))));
        }
        nodes.push(PlanNode::Agg {
            head_table: head_table.clone(),
            group_proj: group_cols,
            group_schema: Arc::new(Schema::new(group_types, None)),
            agg_col_index: agg_col_index.expect("checked above"),
            kind,
            agg_arg: agg_arg_expr.expect("checked above"),
            do_delete: anchor.negated,
        });
    } else {
        let proj: Vec<Expr> =
            rule.head.columns.iter().map(|c| expr::compile(c, &bound, &rule.name)).collect::<Result<_>>()?;
        nodes.push(PlanNode::Insert { head_table: head_table.clone(), proj, do_delete: anchor.negated });
    }

    Ok(OpChainPlan { delta_table: anchor.table.name.clone(), head_table, nodes })
}

fn nodes_will_end_without_project(_rule: &AnalyzedRule) -> bool {
    true
}

/// Splits off every qualifier whose free variables are all already bound,
/// returning them alongside their indices into `quals`.
fn extract_satisfiable<'a>(
    quals: &[&'a Qualifier],
    bound: &HashMap<String, (usize, DataType)>,
) -> (Vec<&'a Qualifier>, Vec<usize>) {
    let mut out = Vec::new();
    let mut idxs = Vec::new();
    for (i, q) in quals.iter().enumerate() {
        let free = free_vars_of_qual(q);
        if free.iter().all(|v| bound.contains_key(v)) {
            out.push(*q);
            idxs.push(i);
        }
    }
    (out, idxs)
}

fn remove_at(remaining: &mut Vec<&Qualifier>, idxs: &[usize]) {
    let mut to_remove = idxs.to_vec();
    to_remove.sort_unstable();
    to_remove.reverse();
    for i in to_remove {
        if i < remaining.len() {
            remaining.remove(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::parser::parse_program;

    struct EmptyLookup;
    impl crate::analyzer::TableLookup for EmptyLookup {
        fn lookup(&self, _name: &str) -> Option<TableShape> {
            None
        }
    }

    fn shapes_from(analyzed: &AnalyzedProgram) -> HashMap<String, TableShape> {
        analyzed
            .defines
            .iter()
            .map(|d| (d.name.clone(), TableShape { schema: d.schema.clone(), keys: d.keys.clone() }))
            .collect()
    }

    #[test]
    fn plans_one_chain_per_join_in_transitive_closure_rule() {
        let prog = parse_program(
            "edge(int8,int8) keys(0,1); path(int8,int8) keys(0,1); \
             path(X,Y) :- edge(X,Y); path(X,Z) :- path(X,Y), edge(Y,Z);",
        )
        .unwrap();
        let analyzed = analyze(&prog, &EmptyLookup).unwrap();
        let shapes = shapes_from(&analyzed);
        let plan = plan_program(&analyzed, &shapes).unwrap();
        assert_eq!(plan.rules.len(), 2);
        assert_eq!(plan.rules[0].chains.len(), 1);
        assert_eq!(plan.rules[1].chains.len(), 2);
    }

    #[test]
    fn aggregate_rule_ends_in_agg_node() {
        let prog = parse_program(
            "b(int8,int8) keys(0,1); r(int8,int8) keys(0); r(X, count<Y>) :- b(X,Y);",
        )
        .unwrap();
        let analyzed = analyze(&prog, &EmptyLookup).unwrap();
        let shapes = shapes_from(&analyzed);
        let plan = plan_program(&analyzed, &shapes).unwrap();
        let chain = &plan.rules[0].chains[0];
        assert!(matches!(chain.nodes.last().unwrap(), PlanNode::Agg { .. }));
    }
}
