//! # Operator Chain Runtime
//!
//! The planner (`crate::plan`) emits one [`crate::plan::OpChainPlan`] per
//! body join clause; [`OpChain::from_plan`] turns that plan into the
//! runtime form that actually walks tuples. Each chain is invoked once per
//! tuple landing on its delta table, and fans out recursively as each
//! `Scan` node joins in another relation.
//!
//! Mutation goes through [`crate::router::RouterState`] rather than
//! directly against a `Catalog`, so a chain can push newly-derived tuples
//! back onto the router's work queue without the router itself being on
//! the call stack.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::AggKind;
use crate::error::Result;
use crate::expr::{self, EvalContext, Expr};
use crate::plan::{OpChainPlan, PlanNode};
use crate::router::RouterState;
use crate::value::{DataType, Datum, Schema, Tuple};

/// One running group's aggregate state. `tuple_refs` counts how many
/// *distinct* input tuples currently contributed to this group — input
/// tuples are deduplicated so that re-deriving the same fact twice (a
/// common shape under semi-naive evaluation) doesn't double the running
/// sum or count.
struct AggGroup {
    count: u64,
    sum: Datum,
    tuple_refs: HashMap<Tuple, u32>,
    output: Option<Tuple>,
}

impl AggGroup {
    fn new(kind: AggKind) -> Self {
        let sum = match kind {
            AggKind::Sum => Datum::I8(0),
            _ => Datum::I8(0),
        };
        AggGroup { count: 0, sum, tuple_refs: HashMap::new(), output: None }
    }

    fn is_empty(&self) -> bool {
        self.count == 0 && self.tuple_refs.is_empty()
    }
}

struct AggOperator {
    head_table: String,
    group_proj: Vec<Expr>,
    group_schema: Arc<Schema>,
    agg_col_index: usize,
    kind: AggKind,
    agg_arg: Expr,
    do_delete: bool,
    groups: HashMap<Tuple, AggGroup>,
}

enum Operator {
    Filter { quals: Vec<Expr> },
    Scan { relation: String, negated: bool, quals: Vec<Expr>, proj: Vec<Expr>, proj_schema: Arc<Schema> },
    Insert { head_table: String, proj: Vec<Expr>, do_delete: bool },
    Agg(AggOperator),
}

/// The compiled form of one `OpChainPlan`: a delta table, the head table
/// it ultimately feeds, and the node list that walks from one to the
/// other.
pub struct OpChain {
    pub delta_table: String,
    pub head_table: String,
    nodes: Vec<Operator>,
}

impl OpChain {
    pub fn from_plan(plan: &OpChainPlan) -> Self {
        let nodes = plan
            .nodes
            .iter()
            .map(|n| match n.clone() {
                PlanNode::Filter { quals } => Operator::Filter { quals },
                PlanNode::Scan { relation, negated, quals, proj, proj_schema, .. } => {
                    Operator::Scan { relation, negated, quals, proj, proj_schema }
                }
                PlanNode::Insert { head_table, proj, do_delete } => {
                    Operator::Insert { head_table, proj, do_delete }
                }
                PlanNode::Agg { head_table, group_proj, group_schema, agg_col_index, kind, agg_arg, do_delete } => {
                    Operator::Agg(AggOperator {
                        head_table,
                        group_proj,
                        group_schema,
                        agg_col_index,
                        kind,
                        agg_arg,
                        do_delete,
                        groups: HashMap::new(),
                    })
                }
            })
            .collect();
        OpChain { delta_table: plan.delta_table.clone(), head_table: plan.head_table.clone(), nodes }
    }

    /// Walks `tuple` through the chain from its first node. `state.is_deleting()`
    /// tells every terminal node (Insert, Agg) whether it is running the
    /// forward or backward transition for this tuple.
    pub fn invoke(&mut self, state: &mut RouterState, tuple: &Tuple) -> Result<()> {
        invoke_from(&mut self.nodes, 0, state, tuple, None)
    }
}

/// Recursively walks the node list starting at `idx`. `inner` is the
/// accumulated join tuple so far; `outer` is the row a `Scan` most
/// recently pulled in (or `None` before the first `Scan`). Each branch
/// clones the small amount of plan data it needs out of `nodes[idx]`
/// before recursing, so the recursive call never needs to hold a
/// borrow of `nodes` across the call — the one exception is `Agg`,
/// which is always the chain's terminal node and never recurses.
fn invoke_from(
    nodes: &mut [Operator],
    idx: usize,
    state: &mut RouterState,
    inner: &Tuple,
    outer: Option<&Tuple>,
) -> Result<()> {
    let Some(op) = nodes.get_mut(idx) else { return Ok(()) };
    match op {
        Operator::Filter { quals } => {
            let ctx = match outer {
                Some(o) => EvalContext::with_outer(inner, o),
                None => EvalContext::new(inner),
            };
            if !expr::eval_qual_set(quals, &ctx) {
                return Ok(());
            }
            invoke_from(nodes, idx + 1, state, inner, outer)
        }
        Operator::Scan { relation, negated, quals, proj, proj_schema } => {
            let relation = relation.clone();
            let negated = *negated;
            let quals = quals.clone();
            let proj = proj.clone();
            let proj_schema = proj_schema.clone();
            run_scan(nodes, idx, state, inner, &relation, negated, &quals, &proj, proj_schema)
        }
        Operator::Insert { head_table, proj, do_delete } => {
            let head_table = head_table.clone();
            let proj = proj.clone();
            let delete_now = state.is_deleting() ^ *do_delete;
            let ctx = match outer {
                Some(o) => EvalContext::with_outer(inner, o),
                None => EvalContext::new(inner),
            };
            let schema = state.table_schema(&head_table)?;
            let values: Vec<Datum> = proj.iter().map(|e| expr::eval(e, &ctx)).collect();
            let out = Tuple::make(schema, values);
            if delete_now {
                state.delete_tuple(&head_table, &out)?;
            } else {
                state.insert_tuple(&head_table, out, true)?;
            }
            Ok(())
        }
        Operator::Agg(agg) => {
            let ctx = match outer {
                Some(o) => EvalContext::with_outer(inner, o),
                None => EvalContext::new(inner),
            };
            agg.invoke(state, &ctx)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_scan(
    nodes: &mut [Operator],
    idx: usize,
    state: &mut RouterState,
    inner: &Tuple,
    relation: &str,
    negated: bool,
    quals: &[Expr],
    proj: &[Expr],
    proj_schema: Arc<Schema>,
) -> Result<()> {
    let rows = state.scan_table_snapshot(relation)?;

    if negated {
        // Anti-join: forward iff no row in `relation` satisfies `quals`
        // against `inner`. The join contributes no columns of its own —
        // `proj` here only re-projects `inner`'s already-bound variables.
        let any_match = rows.iter().any(|row| {
            let ctx = EvalContext::with_outer(inner, row);
            expr::eval_qual_set(quals, &ctx)
        });
        if any_match {
            return Ok(());
        }
        let ctx = EvalContext::new(inner);
        let values: Vec<Datum> = proj.iter().map(|e| expr::eval(e, &ctx)).collect();
        let joined = Tuple::make(proj_schema, values);
        return invoke_from(nodes, idx + 1, state, &joined, None);
    }

    for row in &rows {
        let ctx = EvalContext::with_outer(inner, row);
        if !expr::eval_qual_set(quals, &ctx) {
            continue;
        }
        let values: Vec<Datum> = proj.iter().map(|e| expr::eval(e, &ctx)).collect();
        let joined = Tuple::make(proj_schema.clone(), values);
        invoke_from(nodes, idx + 1, state, &joined, None)?;
    }
    Ok(())
}

impl AggOperator {
    /// Forward/backward transitions for `Count`/`Sum`. The group key is
    /// `group_proj` evaluated against `ctx`; `tuple_refs` tracks which
    /// distinct input rows currently contribute to the group so a
    /// duplicate derivation is a no-op and a genuine retraction only
    /// updates the running aggregate once the input's refcount hits zero.
    fn invoke(&mut self, state: &mut RouterState, ctx: &EvalContext) -> Result<()> {
        let key_values: Vec<Datum> = self.group_proj.iter().map(|e| expr::eval(e, ctx)).collect();
        let key = Tuple::make(self.group_schema.clone(), key_values);
        let arg = expr::eval(&self.agg_arg, ctx);
        let retracting = state.is_deleting() ^ self.do_delete;

        let kind = self.kind;
        let group = self.groups.entry(key.clone()).or_insert_with(|| AggGroup::new(kind));
        let refcount = group.tuple_refs.entry(ctx.inner.clone()).or_insert(0);

        if retracting {
            if *refcount == 0 {
                return Ok(());
            }
            *refcount -= 1;
            if *refcount == 0 {
                group.tuple_refs.remove(ctx.inner);
                group.count = group.count.saturating_sub(1);
                if let AggKind::Sum = self.kind {
                    group.sum = subtract(&group.sum, &arg);
                }
            } else {
                return Ok(());
            }
        } else {
            *refcount += 1;
            if *refcount > 1 {
                return Ok(());
            }
            group.count += 1;
            if let AggKind::Sum = self.kind {
                group.sum = add(&group.sum, &arg);
            }
        }

        let new_value = match self.kind {
            AggKind::Count => Datum::I8(group.count as i64),
            AggKind::Sum => group.sum.clone(),
            AggKind::Min | AggKind::Max | AggKind::Avg => {
                unreachable!("rejected at plan time")
            }
        };

        let schema = state.table_schema(&self.head_table)?;
        let mut values = key.values().to_vec();
        values.insert(self.agg_col_index.min(values.len()), new_value);
        let new_output = Tuple::make(schema, values);

        if let Some(old) = group.output.take() {
            if old == new_output {
                group.output = Some(old);
                if group.is_empty() {
                    self.groups.remove(&key);
                }
                return Ok(());
            }
            state.delete_tuple(&self.head_table, &old)?;
        }

        if group.is_empty() {
            self.groups.remove(&key);
            return Ok(());
        }

        state.insert_tuple(&self.head_table, new_output.clone(), true)?;
        self.groups.get_mut(&key).expect("just inserted or retained above").output = Some(new_output);
        Ok(())
    }
}

fn add(a: &Datum, b: &Datum) -> Datum {
    if matches!(a, Datum::F64(_)) || matches!(b, Datum::F64(_)) {
        Datum::F64(as_f64(a) + as_f64(b))
    } else {
        Datum::I8(as_i8(a) + as_i8(b))
    }
}

fn subtract(a: &Datum, b: &Datum) -> Datum {
    if matches!(a, Datum::F64(_)) || matches!(b, Datum::F64(_)) {
        Datum::F64(as_f64(a) - as_f64(b))
    } else {
        Datum::I8(as_i8(a) - as_i8(b))
    }
}

fn as_i8(d: &Datum) -> i64 {
    d.as_i8().unwrap_or_else(|| panic!("expected numeric aggregate argument, got {:?}", d.data_type()))
}

fn as_f64(d: &Datum) -> f64 {
    d.as_f64().unwrap_or_else(|| panic!("expected numeric aggregate argument, got {:?}", d.data_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{analyze, TableLookup};
    use crate::catalog::{Catalog, TableDef};
    use crate::parser::parse_program;
    use crate::plan::{plan_program, RulePlan};
    use crate::router::RouterState;
    use crate::storage::{MemTable, StorageKind};
    use crate::value::Schema;
    use std::collections::HashMap as StdHashMap;

    struct EmptyLookup;
    impl TableLookup for EmptyLookup {
        fn lookup(&self, _name: &str) -> Option<crate::analyzer::TableShape> {
            None
        }
    }

    fn build_chain(src: &str, rule_idx: usize, chain_idx: usize) -> (RulePlan, OpChain) {
        let prog = parse_program(src).unwrap();
        let analyzed = analyze(&prog, &EmptyLookup).unwrap();
        let mut shapes = StdHashMap::new();
        for d in &analyzed.defines {
            shapes.insert(d.name.clone(), crate::analyzer::TableShape { schema: d.schema.clone(), keys: d.keys.clone() });
        }
        let plan = plan_program(&analyzed, &shapes).unwrap();
        let rule = plan.rules[rule_idx].clone();
        let chain = OpChain::from_plan(&rule.chains[chain_idx]);
        (rule, chain)
    }

    fn define_table(catalog: &mut Catalog, name: &str, schema: Arc<Schema>) {
        catalog
            .define_table(TableDef::new(name.to_string(), StorageKind::Memory, schema, vec![], Box::new(MemTable::new())))
            .unwrap();
    }

    #[test]
    fn single_edge_derives_one_path_fact() {
        let (_rule, mut chain) = build_chain(
            "edge(int8,int8) keys(0,1); path(int8,int8) keys(0,1); path(X,Y) :- edge(X,Y);",
            0,
            0,
        );
        let mut catalog = Catalog::new();
        let schema = Arc::new(Schema::new(vec![DataType::I8, DataType::I8], None));
        define_table(&mut catalog, "edge", schema.clone());
        define_table(&mut catalog, "path", schema.clone());
        let mut state = RouterState::for_test(catalog);

        let tuple = Tuple::make(schema, vec![Datum::I8(1), Datum::I8(2)]);
        chain.invoke(&mut state, &tuple).unwrap();

        assert_eq!(state.catalog().get("path").unwrap().table.len(), 1);
    }

    #[test]
    fn count_aggregate_tracks_group_size() {
        let (_rule, mut chain) = build_chain(
            "b(int8,int8) keys(0,1); r(int8,int8) keys(0); r(X, count<Y>) :- b(X,Y);",
            0,
            0,
        );
        let mut catalog = Catalog::new();
        let b_schema = Arc::new(Schema::new(vec![DataType::I8, DataType::I8], None));
        let r_schema = Arc::new(Schema::new(vec![DataType::I8, DataType::I8], None));
        define_table(&mut catalog, "b", b_schema.clone());
        define_table(&mut catalog, "r", r_schema);
        let mut state = RouterState::for_test(catalog);

        chain.invoke(&mut state, &Tuple::make(b_schema.clone(), vec![Datum::I8(1), Datum::I8(10)])).unwrap();
        chain.invoke(&mut state, &Tuple::make(b_schema, vec![Datum::I8(1), Datum::I8(20)])).unwrap();

        let r = state.catalog().get("r").unwrap();
        assert_eq!(r.table.len(), 1);
    }
}
