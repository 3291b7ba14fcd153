//! End-to-end fixpoint tests: program source in, derived table out.

use std::collections::HashSet;

use c4::{Datum, Tuple};

fn int_pair(t: &Tuple) -> (i64, i64) {
    (t.get(0).as_i8().unwrap(), t.get(1).as_i8().unwrap())
}

#[test]
fn edge_and_path_rules_derive_the_full_closure() {
    let client = c4::Client::make(0).unwrap();
    client.install_str("edge(int8,int8) keys(0,1); path(int8,int8) keys(0,1);").unwrap();
    client.install_str("edge(1,2); edge(2,3); edge(3,4);").unwrap();
    client
        .install_str("path(X,Y) :- edge(X,Y); path(X,Z) :- path(X,Y), edge(Y,Z);")
        .unwrap();

    let rows = client.dump_table("path").unwrap();
    let pairs: HashSet<(i64, i64)> = rows.iter().map(int_pair).collect();
    let expected: HashSet<(i64, i64)> =
        [(1, 2), (2, 3), (3, 4), (1, 3), (2, 4), (1, 4)].into_iter().collect();
    assert_eq!(pairs, expected);

    client.destroy();
}

#[test]
fn repeated_installation_on_a_fresh_client_is_deterministic() {
    let program_defs = "edge(int8,int8) keys(0,1); path(int8,int8) keys(0,1);";
    let program_facts = "edge(1,2); edge(2,3); edge(3,4); edge(4,1);";
    let program_rules = "path(X,Y) :- edge(X,Y); path(X,Z) :- path(X,Y), edge(Y,Z);";

    let mut runs = Vec::new();
    for _ in 0..3 {
        let client = c4::Client::make(0).unwrap();
        client.install_str(program_defs).unwrap();
        client.install_str(program_facts).unwrap();
        client.install_str(program_rules).unwrap();
        let rows = client.dump_table("path").unwrap();
        let pairs: HashSet<(i64, i64)> = rows.iter().map(int_pair).collect();
        runs.push(pairs);
        client.destroy();
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
}

#[test]
fn reinserting_an_existing_fact_does_not_grow_the_table() {
    let client = c4::Client::make(0).unwrap();
    client.install_str("edge(int8,int8) keys(0,1);").unwrap();
    client.install_str("edge(1,2);").unwrap();
    client.install_str("edge(1,2);").unwrap();
    let rows = client.dump_table("edge").unwrap();
    assert_eq!(rows.len(), 1);
    assert!(matches!(rows[0].get(0), Datum::I8(1)));
    client.destroy();
}
