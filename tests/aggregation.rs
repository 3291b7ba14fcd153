//! Counting/summing aggregate semantics over an iteratively-derived base
//! relation, scaled down from the canonical scenario's `Y<150000` bound
//! to keep the test fast while exercising the same retraction-free
//! growth path.

use c4::Datum;

#[test]
fn count_aggregate_converges_to_the_final_group_size() {
    let client = c4::Client::make(0).unwrap();
    client
        .install_str(
            "t(int8) keys(0); b(int8,int8) keys(0,1); r(int8,int8) keys(0);",
        )
        .unwrap();
    client.install_str("t(0);").unwrap();
    client.install_str("t(X+1) :- t(X), X<30;").unwrap();
    client
        .install_str("b(X,0) :- t(X); b(X,Y+1) :- b(X,Y), Y<150;")
        .unwrap();
    client.install_str("r(X, count<Y>) :- b(X,Y);").unwrap();

    let rows = client.dump_table("r").unwrap();
    assert_eq!(rows.len(), 31, "one group per X in [0,30]");
    for row in &rows {
        let count = match row.get(1) {
            Datum::I8(n) => *n,
            other => panic!("expected int8 count column, got {other:?}"),
        };
        assert_eq!(count, 151, "each X group spans Y in [0,150]");
    }
    client.destroy();
}

#[test]
fn sum_aggregate_tracks_running_total() {
    let client = c4::Client::make(0).unwrap();
    client.install_str("sales(int8,int8) keys(0,1); totals(int8,int8) keys(0);").unwrap();
    client.install_str("sales(1,10); sales(1,20); sales(2,5);").unwrap();
    client.install_str("totals(G, sum<V>) :- sales(G,V);").unwrap();

    let rows = client.dump_table("totals").unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        let group = row.get(0).as_i8().unwrap();
        let total = row.get(1).as_i8().unwrap();
        match group {
            1 => assert_eq!(total, 30),
            2 => assert_eq!(total, 5),
            other => panic!("unexpected group {other}"),
        }
    }
    client.destroy();
}
