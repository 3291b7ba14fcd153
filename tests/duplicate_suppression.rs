//! Property test: installing a multiset of facts, however many times each
//! value repeats, leaves exactly the distinct values in the table.

use std::collections::HashSet;

use proptest::prelude::*;

use c4::Client;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]
    #[test]
    fn final_table_contents_equal_the_distinct_input_values(values in prop::collection::vec(0i64..50, 1..80)) {
        let client = Client::make(0).unwrap();
        client.install_str("t(int8) keys(0);").unwrap();

        for v in &values {
            client.install_str(&format!("t({v});")).unwrap();
        }

        let rows = client.dump_table("t").unwrap();
        let got: HashSet<i64> = rows.iter().map(|t| t.get(0).as_i8().unwrap()).collect();
        let expected: HashSet<i64> = values.into_iter().collect();

        prop_assert_eq!(got, expected);
        client.destroy();
    }
}
