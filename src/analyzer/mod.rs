//! # Analyzer
//!
//! Validates and rewrites a parsed [`ast::Program`]: resolves table-def
//! schemas, synthesizes timer tables, assigns rule names, desugars
//! constants/repeated variables in join columns into fresh variables plus
//! equality qualifiers, typechecks qualifiers, computes the equality
//! closure, classifies rules as network or local, and runs the safety
//! check. Aborts on the first error, naming the offending construct
//! (§4.1 "Failure mode").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::ast::{self, AggKind, ColumnRef, JoinClause, OpKind, Program, Qualifier, Rule, RuleBody, TableRef};
use crate::error::{Error, Result, UsageError};
use crate::expr;
use crate::storage::StorageKind;
use crate::value::{DataType, Schema};

/// Resolved shape of a table, whether already installed or newly defined
/// in this program.
#[derive(Clone)]
pub struct TableShape {
    pub schema: Arc<Schema>,
    pub keys: Vec<usize>,
}

pub struct AnalyzedDefine {
    pub name: String,
    pub schema: Arc<Schema>,
    pub keys: Vec<usize>,
    pub storage: StorageKind,
}

pub struct AnalyzedTimer {
    pub name: String,
    pub period_ms: i64,
}

/// A rule after desugaring: every join column is a plain variable or
/// don't-care; every implicit equality (repeated variable, constant in a
/// join column) is an explicit qualifier; the equality set is closed
/// under transitivity.
pub struct AnalyzedRule {
    pub name: String,
    pub head: TableRef,
    pub body: RuleBody,
    pub is_network: bool,
    pub warnings: Vec<String>,
}

pub struct AnalyzedProgram {
    pub defines: Vec<AnalyzedDefine>,
    pub timers: Vec<AnalyzedTimer>,
    pub rules: Vec<AnalyzedRule>,
    pub facts: Vec<ast::Fact>,
}

/// Read-only view the analyzer needs of tables that already exist,
/// supplied by the catalog.
pub trait TableLookup {
    fn lookup(&self, name: &str) -> Option<TableShape>;
}

impl TableLookup for crate::catalog::Catalog {
    fn lookup(&self, name: &str) -> Option<TableShape> {
        self.get(name).map(|d| TableShape { schema: d.schema.clone(), keys: d.keys.clone() })
    }
}

pub fn analyze(program: &Program, existing: &dyn TableLookup) -> Result<AnalyzedProgram> {
    let mut shapes: HashMap<String, TableShape> = HashMap::new();
    let mut defines = Vec::new();

    for d in &program.defines {
        if existing.lookup(&d.name).is_some() || shapes.contains_key(&d.name) {
            return Err(Error::Usage(UsageError::DuplicateTable(d.name.clone())));
        }
        let shape = validate_define(d)?;
        shapes.insert(d.name.clone(), shape.clone());
        defines.push(AnalyzedDefine { name: d.name.clone(), schema: shape.schema, keys: shape.keys, storage: d.storage });
    }

    let mut timers = Vec::new();
    for t in &program.timers {
        if t.period_ms <= 0 || t.period_ms > (1i64 << 63) / 1000 {
            return Err(Error::Usage(UsageError::InvalidTimerPeriod(t.period_ms)));
        }
        if existing.lookup(&t.name).is_some() || shapes.contains_key(&t.name) {
            return Err(Error::Usage(UsageError::DuplicateTable(t.name.clone())));
        }
        let schema = Arc::new(Schema::new(vec![DataType::I8], None));
        shapes.insert(t.name.clone(), TableShape { schema: schema.clone(), keys: vec![] });
        defines.push(AnalyzedDefine { name: t.name.clone(), schema, keys: vec![], storage: StorageKind::Memory });
        timers.push(AnalyzedTimer { name: t.name.clone(), period_ms: t.period_ms });
    }

    let lookup = |name: &str| -> Option<TableShape> {
        shapes.get(name).cloned().or_else(|| existing.lookup(name))
    };

    let mut used_names: HashSet<String> = HashSet::new();
    let mut rules = Vec::with_capacity(program.rules.len());
    for (i, rule) in program.rules.iter().enumerate() {
        let name = match &rule.name {
            Some(n) => n.clone(),
            None => format!("r_{i}_sys"),
        };
        if !used_names.insert(name.clone()) {
            return Err(Error::Usage(UsageError::DuplicateRuleName(name)));
        }
        rules.push(analyze_rule(rule, &name, &lookup)?);
    }

    for f in &program.facts {
        if lookup(&f.table.name).is_none() {
            return Err(Error::Usage(UsageError::UnknownTable(f.table.name.clone())));
        }
    }

    Ok(AnalyzedProgram { defines, timers, rules, facts: program.facts.clone() })
}

fn validate_define(d: &ast::Define) -> Result<TableShape> {
    let mut columns = Vec::with_capacity(d.columns.len());
    let mut loc_spec_cols = Vec::new();
    for (i, elt) in d.columns.iter().enumerate() {
        let ty = DataType::parse(&elt.type_name)
            .ok_or_else(|| Error::Usage(UsageError::UnknownType(elt.type_name.clone())))?;
        if elt.is_loc_spec {
            if ty != DataType::String {
                return Err(Error::Usage(UsageError::LocSpecNotString(i)));
            }
            loc_spec_cols.push(i);
        }
        columns.push(ty);
    }
    if loc_spec_cols.len() > 1 {
        return Err(Error::Usage(UsageError::MultipleLocSpecColumns(loc_spec_cols)));
    }
    let mut seen_keys = HashSet::new();
    for &k in &d.keys {
        if k >= columns.len() {
            return Err(Error::Usage(UsageError::KeyOutOfRange(k, columns.len())));
        }
        if !seen_keys.insert(k) {
            return Err(Error::Usage(UsageError::DuplicateKeyColumn(k)));
        }
    }
    let schema = Arc::new(Schema::new(columns, loc_spec_cols.first().copied()));
    Ok(TableShape { schema, keys: d.keys.clone() })
}

/// Union-find over variable names, used to compute the equality closure
/// for one rule.
struct EqClasses {
    parent: HashMap<String, String>,
}

impl EqClasses {
    fn new() -> Self {
        EqClasses { parent: HashMap::new() }
    }

    fn find(&mut self, v: &str) -> String {
        let p = self.parent.get(v).cloned().unwrap_or_else(|| v.to_string());
        if p == v {
            return p;
        }
        let root = self.find(&p);
        self.parent.insert(v.to_string(), root.clone());
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }

    fn equal(&mut self, a: &str, b: &str) -> bool {
        self.find(a) == self.find(b)
    }
}

fn analyze_rule(
    rule: &Rule,
    name: &str,
    lookup: &dyn Fn(&str) -> Option<TableShape>,
) -> Result<AnalyzedRule> {
    let mut warnings = Vec::new();
    let mut eq = EqClasses::new();
    let mut var_types: HashMap<String, DataType> = HashMap::new();
    let mut var_bound_by_non_negated_join: HashSet<String> = HashSet::new();
    let mut extra_quals: Vec<Qualifier> = Vec::new();
    let mut fresh_counter = 0usize;
    let mut has_non_negated_join = false;
    let mut body_loc_spec_vars: Vec<String> = Vec::new();
    // Tracks every variable name seen anywhere in the body so far — not
    // just within the current join clause. Datalog join semantics treat
    // a variable name recurring in a second join clause as an equi-join
    // condition, so every occurrence past the first is renamed to a
    // fresh variable plus an explicit equality qualifier, the same as a
    // repeat within one join clause.
    let mut seen_vars: HashSet<String> = HashSet::new();

    let mut new_joins = Vec::with_capacity(rule.body.joins.len());
    for join in &rule.body.joins {
        let shape = lookup(&join.table.name)
            .ok_or_else(|| Error::Usage(UsageError::UnknownTable(join.table.name.clone())))?;
        if shape.schema.arity() != join.table.columns.len() {
            return Err(Error::Usage(UsageError::ArityMismatch(
                join.table.name.clone(),
                shape.schema.arity(),
                join.table.columns.len(),
            )));
        }
        if !join.negated {
            has_non_negated_join = true;
        }

        let mut new_columns = Vec::with_capacity(join.table.columns.len());
        for (colno, col) in join.table.columns.iter().enumerate() {
            let ty = shape.schema.column_type(colno);
            let var_name = match col {
                ColumnRef::DontCare => {
                    new_columns.push(ColumnRef::DontCare);
                    continue;
                }
                ColumnRef::Var(v) => v.name.clone(),
                ColumnRef::Const(c) => {
                    let fresh = format!("_c4_const_{fresh_counter}");
                    fresh_counter += 1;
                    extra_quals.push(Qualifier {
                        expr: ast::OpExpr {
                            kind: OpKind::Eq,
                            lhs: Box::new(ColumnRef::Var(ast::VarExpr { name: fresh.clone() })),
                            rhs: Some(Box::new(ColumnRef::Const(c.clone()))),
                        },
                    });
                    fresh
                }
                ColumnRef::Agg(_) => return Err(Error::Usage(UsageError::AggregateInBody(name.to_string()))),
                ColumnRef::Op(_) => {
                    return Err(Error::Usage(UsageError::Parse(format!(
                        "computed expression not allowed in join column of rule '{name}'"
                    ))))
                }
            };

            // A conflicting type under a name already seen elsewhere is
            // surfaced later, during qualifier typing, once the equality
            // closure has decided which names actually unify.
            var_types.entry(var_name.clone()).or_insert(ty);

            if !join.negated {
                var_bound_by_non_negated_join.insert(var_name.clone());
            }

            if Some(colno) == shape.schema.loc_spec_col() && !body_loc_spec_vars.contains(&var_name) {
                body_loc_spec_vars.push(var_name.clone());
            }

            if seen_vars.contains(&var_name) {
                // Repeated variable anywhere in the body so far (same
                // join clause or a different one): rename this occurrence
                // and record the implied equality.
                let fresh = format!("_c4_dup_{fresh_counter}");
                fresh_counter += 1;
                extra_quals.push(Qualifier {
                    expr: ast::OpExpr {
                        kind: OpKind::Eq,
                        lhs: Box::new(ColumnRef::Var(ast::VarExpr { name: fresh.clone() })),
                        rhs: Some(Box::new(ColumnRef::Var(ast::VarExpr { name: var_name.clone() }))),
                    },
                });
                var_types.insert(fresh.clone(), ty);
                eq.union(&fresh, &var_name);
                seen_vars.insert(fresh.clone());
                if !join.negated {
                    var_bound_by_non_negated_join.insert(fresh.clone());
                }
                new_columns.push(ColumnRef::Var(ast::VarExpr { name: fresh }));
            } else {
                seen_vars.insert(var_name.clone());
                new_columns.push(ColumnRef::Var(ast::VarExpr { name: var_name }));
            }
        }
        new_joins.push(JoinClause { table: TableRef { name: join.table.name.clone(), columns: new_columns }, negated: join.negated });
    }

    if !has_non_negated_join {
        return Err(Error::Usage(UsageError::NoNonNegatedJoin(name.to_string())));
    }

    let mut quals = rule.body.quals.clone();
    quals.extend(extra_quals);

    for q in &quals {
        record_equalities(&q.expr, &mut eq);
        let var_type = |v: &str| var_types.get(v).copied();
        if expr::static_type(&ColumnRef::Op(q.expr.clone()), &var_type) != Some(DataType::Bool) {
            return Err(Error::Usage(UsageError::QualifierNotBool(name.to_string())));
        }
    }

    // At most one distinct location is allowed in a rule body. Two
    // syntactically different loc-spec variables are still one location
    // if an explicit equality qualifier unifies them.
    let mut distinct_loc_roots: Vec<String> = Vec::new();
    for v in &body_loc_spec_vars {
        let root = eq.find(v);
        if !distinct_loc_roots.contains(&root) {
            distinct_loc_roots.push(root);
        }
    }
    if distinct_loc_roots.len() > 1 {
        return Err(Error::Usage(UsageError::MultipleBodyLocSpecs(name.to_string())));
    }
    let body_loc_spec_var: Option<String> = body_loc_spec_vars.first().cloned();

    // Safety check + don't-care/aggregate placement on the head.
    let mut head_columns = Vec::with_capacity(rule.head.columns.len());
    for col in &rule.head.columns {
        match col {
            ColumnRef::DontCare => return Err(Error::Usage(UsageError::DontCareMisuse(name.to_string()))),
            ColumnRef::Var(v) => {
                let root = eq.find(&v.name);
                let safe = var_bound_by_non_negated_join
                    .iter()
                    .any(|bound| eq.find(bound) == root);
                if !safe {
                    return Err(Error::Usage(UsageError::UnsafeHeadVariable(name.to_string(), v.name.clone())));
                }
                head_columns.push(col.clone());
            }
            ColumnRef::Agg(_) => head_columns.push(col.clone()),
            ColumnRef::Op(op) => {
                if op_contains_agg(op) {
                    return Err(Error::Usage(UsageError::AggregateNotAtTopLevel(name.to_string())));
                }
                head_columns.push(col.clone());
            }
            ColumnRef::Const(_) => head_columns.push(col.clone()),
        }
    }

    // Unused-variable warning: any variable bound by a join but never
    // referenced in the head or a qualifier.
    let referenced: HashSet<String> = collect_vars_in_head(&rule.head)
        .into_iter()
        .chain(quals.iter().flat_map(|q| collect_vars_in_op(&q.expr)))
        .collect();
    for bound in &var_bound_by_non_negated_join {
        if bound.starts_with("_c4_") {
            continue;
        }
        let root = eq.find(bound);
        let used = referenced.iter().any(|r| eq.find(r) == root);
        if !used {
            warnings.push(format!("variable '{bound}' in rule '{name}' is never used"));
        }
    }

    // Network classification.
    let head_shape = lookup(&rule.head.table_name_for_analysis())
        .ok_or_else(|| Error::Usage(UsageError::UnknownTable(rule.head.name.clone())))?;
    let head_loc_var = head_shape.schema.loc_spec_col().and_then(|col| match rule.head.columns.get(col) {
        Some(ColumnRef::Var(v)) => Some(v.name.clone()),
        _ => None,
    });
    let is_network = match (&head_loc_var, &body_loc_spec_var) {
        (Some(h), Some(b)) => !eq.equal(h, b),
        (Some(_), None) => true,
        (None, _) => false,
    };

    Ok(AnalyzedRule {
        name: name.to_string(),
        head: TableRef { name: rule.head.name.clone(), columns: head_columns },
        body: RuleBody { joins: new_joins, quals },
        is_network,
        warnings,
    })
}

/// True if an `AggExpr` appears anywhere inside this operator tree — used
/// to reject aggregates nested under arithmetic/comparison in a head
/// column, since an aggregate may only appear as a column's entire value.
fn op_contains_agg(op: &ast::OpExpr) -> bool {
    fn col_has_agg(col: &ColumnRef) -> bool {
        match col {
            ColumnRef::Agg(_) => true,
            ColumnRef::Op(o) => op_contains_agg(o),
            _ => false,
        }
    }
    col_has_agg(&op.lhs) || op.rhs.as_deref().is_some_and(col_has_agg)
}

fn record_equalities(expr: &ast::OpExpr, eq: &mut EqClasses) {
    if expr.kind == OpKind::Eq {
        if let (ColumnRef::Var(a), Some(rhs)) = (expr.lhs.as_ref(), expr.rhs.as_ref()) {
            if let ColumnRef::Var(b) = rhs.as_ref() {
                eq.union(&a.name, &b.name);
            }
        }
    }
}

fn collect_vars_in_head(head: &TableRef) -> Vec<String> {
    head.columns
        .iter()
        .flat_map(|c| match c {
            ColumnRef::Var(v) => vec![v.name.clone()],
            ColumnRef::Agg(a) => collect_vars_in_col(&a.arg),
            ColumnRef::Op(o) => collect_vars_in_op(o),
            _ => vec![],
        })
        .collect()
}

fn collect_vars_in_col(col: &ColumnRef) -> Vec<String> {
    match col {
        ColumnRef::Var(v) => vec![v.name.clone()],
        ColumnRef::Op(o) => collect_vars_in_op(o),
        ColumnRef::Agg(a) => collect_vars_in_col(&a.arg),
        _ => vec![],
    }
}

fn collect_vars_in_op(op: &ast::OpExpr) -> Vec<String> {
    let mut v = collect_vars_in_col(&op.lhs);
    if let Some(rhs) = &op.rhs {
        v.extend(collect_vars_in_col(rhs));
    }
    v
}

impl TableRef {
    fn table_name_for_analysis(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    struct EmptyLookup;
    impl TableLookup for EmptyLookup {
        fn lookup(&self, _name: &str) -> Option<TableShape> {
            None
        }
    }

    #[test]
    fn rejects_unsafe_negation_only_rule() {
        let prog = parse_program(
            "p(int8) keys(0); q(int8) keys(0); q(A) :- notin p(A);",
        )
        .unwrap();
        let err = analyze(&prog, &EmptyLookup).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::NoNonNegatedJoin(_))));
    }

    #[test]
    fn accepts_transitive_closure_program() {
        let prog = parse_program(
            "edge(int8,int8) keys(0,1); path(int8,int8) keys(0,1); \
             path(X,Y) :- edge(X,Y); path(X,Z) :- path(X,Y), edge(Y,Z);",
        )
        .unwrap();
        let analyzed = analyze(&prog, &EmptyLookup).unwrap();
        assert_eq!(analyzed.rules.len(), 2);
        assert!(!analyzed.rules[0].is_network);
    }

    #[test]
    fn rejects_duplicate_table_definition() {
        let prog = parse_program("t(int8); t(int8);").unwrap();
        let err = analyze(&prog, &EmptyLookup).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::DuplicateTable(_))));
    }

    #[test]
    fn rejects_out_of_range_key() {
        let prog = parse_program("t(int8) keys(5);").unwrap();
        let err = analyze(&prog, &EmptyLookup).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::KeyOutOfRange(5, 1))));
    }

    #[test]
    fn desugars_repeated_variable_into_equality_qualifier() {
        let prog = parse_program("p(int8,int8) keys(0,1); q(int8) keys(0); q(A) :- p(A,A);").unwrap();
        let analyzed = analyze(&prog, &EmptyLookup).unwrap();
        let rule = &analyzed.rules[0];
        assert!(!rule.body.quals.is_empty());
    }
}
